//! GPU images with their default view and sampler.
//!
//! Every image lives in `GENERAL` layout for its whole life: it is transitioned once after
//! creation and then used as attachment, copy destination and sampled image without further
//! layout changes. Ordering between those uses comes from memory barriers.

use ash::vk;
use enumflags2::BitFlags;
use keel_core::log;
use keel_rhi_derive::DeviceObject;

use crate::resource::{AddressMode, FilterMode, SamplerDesc, TextureDesc, TextureFormat, TextureUsage};
use crate::vulkan::device::{DeviceObject, LogicalDevice};
use crate::RhiResult;

pub(crate) fn format_to_vk(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        TextureFormat::R8Unorm => vk::Format::R8_UNORM,
        TextureFormat::Rg16Float => vk::Format::R16G16_SFLOAT,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::R32Float => vk::Format::R32_SFLOAT,
        TextureFormat::Depth32Float => vk::Format::D32_SFLOAT,
    }
}

fn usage_to_vk(usage: BitFlags<TextureUsage>) -> vk::ImageUsageFlags {
    usage.iter().fold(vk::ImageUsageFlags::empty(), |flags, usage| {
        flags
            | match usage {
                TextureUsage::Sampled => vk::ImageUsageFlags::SAMPLED,
                TextureUsage::ColorAttachment => vk::ImageUsageFlags::COLOR_ATTACHMENT,
                TextureUsage::DepthAttachment => vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                TextureUsage::Storage => vk::ImageUsageFlags::STORAGE,
                TextureUsage::TransferDst => vk::ImageUsageFlags::TRANSFER_DST,
            }
    })
}

fn sampler_info(desc: &SamplerDesc) -> vk::SamplerCreateInfo<'static> {
    let filter = match desc.filter {
        FilterMode::Nearest => vk::Filter::NEAREST,
        FilterMode::Linear => vk::Filter::LINEAR,
    };
    let address_mode = match desc.address_mode {
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
    };

    vk::SamplerCreateInfo::default()
        .mag_filter(filter)
        .min_filter(filter)
        .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
        .address_mode_u(address_mode)
        .address_mode_v(address_mode)
        .address_mode_w(address_mode)
        .compare_enable(desc.compare)
        .compare_op(if desc.compare {
            vk::CompareOp::LESS_OR_EQUAL
        } else {
            vk::CompareOp::ALWAYS
        })
        .min_lod(0.0)
        .max_lod(vk::LOD_CLAMP_NONE)
        .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE)
}

#[DeviceObject(label = "name")]
pub struct VulkanImage {
    name: String,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    sampler: vk::Sampler,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    extent: vk::Extent2D,
    layers: u32,
}

impl VulkanImage {
    pub fn new(device: &LogicalDevice, desc: &TextureDesc) -> RhiResult<Self> {
        let format = format_to_vk(desc.format);
        let aspect = if desc.format.is_depth() {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let extent = vk::Extent2D {
            width: desc.width,
            height: desc.height,
        };
        let raw = device.handle();

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(extent.into())
            .mip_levels(1)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage_to_vk(desc.usage) | vk::ImageUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { raw.create_image(&image_info, None)? };

        let requirements = unsafe { raw.get_image_memory_requirements(image) };
        let memory = match device.allocate(requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { raw.destroy_image(image, None) };
                return Err(err);
            }
        };

        let created = unsafe { raw.bind_image_memory(image, memory, 0) }
            .and_then(|()| {
                let view_type = if desc.array_layers > 1 {
                    vk::ImageViewType::TYPE_2D_ARRAY
                } else {
                    vk::ImageViewType::TYPE_2D
                };
                create_view(raw, image, format, aspect, view_type, 0, desc.array_layers)
            })
            .and_then(|view| match unsafe { raw.create_sampler(&sampler_info(&desc.sampler), None) } {
                Ok(sampler) => Ok((view, sampler)),
                Err(err) => {
                    unsafe { raw.destroy_image_view(view, None) };
                    Err(err)
                }
            });
        let (view, sampler) = match created {
            Ok(created) => created,
            Err(err) => {
                unsafe {
                    raw.destroy_image(image, None);
                    raw.free_memory(memory, None);
                }
                return Err(err.into());
            }
        };

        device.set_debug_name(image, &desc.name);
        log::trace!("image '{}' created ({}x{}x{})", desc.name, desc.width, desc.height, desc.array_layers);

        Ok(Self {
            name: desc.name.clone(),
            image,
            memory,
            view,
            sampler,
            format,
            aspect,
            extent,
            layers: desc.array_layers,
            device: raw.clone(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    #[inline]
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.aspect
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn layers(&self) -> u32 {
        self.layers
    }

    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: self.layers,
        }
    }

    /// Single-layer view for use as an attachment. Owned by the caller.
    pub fn create_layer_view(&self, layer: u32) -> RhiResult<vk::ImageView> {
        Ok(create_view(
            &self.device,
            self.image,
            self.format,
            self.aspect,
            vk::ImageViewType::TYPE_2D,
            layer,
            1,
        )?)
    }

    /// Whole-image copy region from a tightly packed staging range.
    pub fn copy_region(&self, src_offset: u64) -> vk::BufferImageCopy {
        vk::BufferImageCopy::default()
            .buffer_offset(src_offset)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: self.aspect,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: self.layers,
            })
            .image_extent(self.extent.into())
    }

    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo::default()
            .image_view(self.view)
            .sampler(self.sampler)
            .image_layout(vk::ImageLayout::GENERAL)
    }
}

impl Drop for VulkanImage {
    fn drop(&mut self) {
        unsafe {
            self.device().destroy_sampler(self.sampler, None);
            self.device().destroy_image_view(self.view, None);
            self.device().destroy_image(self.image, None);
            self.device().free_memory(self.memory, None);
        }
        log::trace!("image '{}' destroyed", self.label());
    }
}

pub(crate) fn create_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    view_type: vk::ImageViewType,
    base_layer: u32,
    layer_count: u32,
) -> Result<vk::ImageView, vk::Result> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(view_type)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: base_layer,
            layer_count,
        });
    unsafe { device.create_image_view(&view_info, None) }
}
