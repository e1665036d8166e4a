//! Attachment sets for dynamic rendering.

use ash::vk;
use keel_rhi_derive::DeviceObject;

use crate::backend::{ClearValues, ColorTarget, LoadOp, RenderTargetDesc};
use crate::pass::PassKind;
use crate::vulkan::device::DeviceObject;
use crate::vulkan::VulkanBackend;
use crate::RhiResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ColorAttachment {
    None,
    /// Resolved to the stream's output image when the pass begins.
    Surface,
    Image(vk::ImageView),
}

/// Views for one pass. Owns its per-layer views, not the images.
#[DeviceObject]
pub struct VulkanRenderTarget {
    kind: PassKind,
    extent: vk::Extent2D,
    pub(crate) color: ColorAttachment,
    depth: Option<vk::ImageView>,
    color_load: LoadOp,
}

impl VulkanRenderTarget {
    pub(crate) fn new(backend: &VulkanBackend, desc: &RenderTargetDesc<'_, VulkanBackend>) -> RhiResult<Self> {
        let raw = backend.device().handle();

        let color = match &desc.color {
            ColorTarget::None => ColorAttachment::None,
            ColorTarget::Surface => ColorAttachment::Surface,
            ColorTarget::Image(image) => ColorAttachment::Image(image.create_layer_view(0)?),
        };
        let depth = match &desc.depth {
            Some(depth) => match depth.image.create_layer_view(depth.layer) {
                Ok(view) => Some(view),
                Err(err) => {
                    if let ColorAttachment::Image(view) = color {
                        unsafe { raw.destroy_image_view(view, None) };
                    }
                    return Err(err);
                }
            },
            None => None,
        };

        Ok(Self {
            kind: desc.kind,
            extent: vk::Extent2D {
                width: desc.extent.width,
                height: desc.extent.height,
            },
            color,
            depth,
            color_load: desc.color_load,
            device: raw.clone(),
        })
    }

    #[inline]
    pub fn kind(&self) -> PassKind {
        self.kind
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Record `begin_rendering`. `surface_view` is the current output image when the target
    /// renders to the surface.
    pub(crate) fn begin(&self, cmd: vk::CommandBuffer, surface_view: Option<vk::ImageView>, clear: &ClearValues) {
        let load_op = match self.color_load {
            LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
            LoadOp::Load => vk::AttachmentLoadOp::LOAD,
        };
        let color_view = match self.color {
            ColorAttachment::None => None,
            ColorAttachment::Surface => {
                surface_view.map(|view| (view, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL))
            }
            ColorAttachment::Image(view) => Some((view, vk::ImageLayout::GENERAL)),
        };
        let color_attachment = color_view.map(|(view, layout)| {
            vk::RenderingAttachmentInfo::default()
                .image_view(view)
                .image_layout(layout)
                .load_op(load_op)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    color: vk::ClearColorValue { float32: clear.color },
                })
        });
        let depth_attachment = self.depth.map(|view| {
            vk::RenderingAttachmentInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::GENERAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: clear.depth,
                        stencil: 0,
                    },
                })
        });

        let mut info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.extent,
            })
            .layer_count(1)
            .color_attachments(color_attachment.as_slice());
        if let Some(depth) = depth_attachment.as_ref() {
            info = info.depth_attachment(depth);
        }

        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.extent,
        };
        unsafe {
            self.device().cmd_begin_rendering(cmd, &info);
            self.device().cmd_set_scissor(cmd, 0, &[scissor]);
        }
    }
}

impl Drop for VulkanRenderTarget {
    fn drop(&mut self) {
        unsafe {
            if let ColorAttachment::Image(view) = self.color {
                self.device().destroy_image_view(view, None);
            }
            if let Some(view) = self.depth {
                self.device().destroy_image_view(view, None);
            }
        }
    }
}
