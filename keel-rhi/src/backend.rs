//! The seam between the frame/resource lifecycle core and a native graphics API.
//!
//! The core never talks to Vulkan directly: everything it needs from the GPU goes through
//! [`RenderBackend`]. [`crate::vulkan::VulkanBackend`] drives real hardware through `ash`,
//! [`crate::headless::HeadlessBackend`] simulates the GPU timeline for tests.
//!
//! All methods take `&self`; backends use interior mutability where they need state so that
//! resource creation can happen from a loader thread while the render thread records.

use std::time::Duration;

use crate::binding::BindingPoint;
use crate::pass::PassKind;
use crate::pipeline::PipelineVariant;
use crate::resource::{BufferDesc, TextureDesc};
use crate::{RhiError, RhiResult};

/// Two-dimensional size in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A zero-area extent (minimized window). Nothing can be rendered into it.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Viewport rectangle in framebuffer coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// Viewport covering the whole extent.
    pub fn full(extent: Extent2D) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// Values used by passes that clear their attachments.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClearValues {
    pub color: [f32; 4],
    pub depth: f32,
}

impl Default for ClearValues {
    fn default() -> Self {
        Self {
            color: [0.0, 0.0, 0.0, 1.0],
            depth: 1.0,
        }
    }
}

/// What happens to the previous content of a color attachment when a pass begins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOp {
    Clear,
    Load,
}

/// Result of a bounded fence wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceWait {
    Signaled,
    TimedOut,
}

/// Result of acquiring the next output image.
#[derive(Debug)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    /// The surface no longer matches the swapchain (resize).
    OutOfDate,
    /// The surface went away (windowing-system transition).
    SurfaceLost,
    /// No image became available within the bounded wait.
    Timeout,
    Failed(RhiError),
}

/// Result of presenting an output image.
#[derive(Debug)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
    SurfaceLost,
    Failed(RhiError),
}

/// Color attachment of a render target.
pub enum ColorTarget<'a, B: RenderBackend + ?Sized> {
    None,
    /// The output image acquired for the current frame.
    Surface,
    Image(&'a B::Image),
}

/// Depth attachment of a render target: one array layer of a depth image.
pub struct DepthTarget<'a, B: RenderBackend + ?Sized> {
    pub image: &'a B::Image,
    pub layer: u32,
}

/// Everything a backend needs to build the attachment set a pass renders into.
pub struct RenderTargetDesc<'a, B: RenderBackend + ?Sized> {
    pub name: &'a str,
    pub kind: PassKind,
    pub extent: Extent2D,
    pub color: ColorTarget<'a, B>,
    pub depth: Option<DepthTarget<'a, B>>,
    pub color_load: LoadOp,
}

/// Resource written into one binding point of a binding table.
pub enum BindingResource<'a, B: RenderBackend + ?Sized> {
    Buffer(&'a B::Buffer),
    Image(&'a B::Image),
}

pub struct BindingWrite<'a, B: RenderBackend + ?Sized> {
    pub point: BindingPoint,
    pub resource: BindingResource<'a, B>,
}

/// Non-indirect draw parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawCommand {
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    Indexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
}

/// Native graphics API used by [`crate::RenderDevice`].
pub trait RenderBackend {
    /// Buffer plus its backing memory.
    type Buffer;
    /// Image plus its backing memory, views and sampler.
    type Image;
    type Fence;
    type Semaphore;
    type CommandStream;
    /// Persistently mapped host-visible staging memory.
    type Staging;
    /// Attachment set one pass renders into (framebuffer equivalent).
    type RenderTarget;
    type BindingTable;

    // Synchronization

    fn create_fence(&self, signaled: bool) -> RhiResult<Self::Fence>;
    fn destroy_fence(&self, fence: Self::Fence);
    fn wait_fence(&self, fence: &Self::Fence, timeout: Duration) -> RhiResult<FenceWait>;
    fn reset_fence(&self, fence: &Self::Fence) -> RhiResult<()>;
    fn create_semaphore(&self) -> RhiResult<Self::Semaphore>;
    fn destroy_semaphore(&self, semaphore: Self::Semaphore);
    fn wait_idle(&self) -> RhiResult<()>;

    // Command streams

    fn create_command_stream(&self) -> RhiResult<Self::CommandStream>;
    fn destroy_command_stream(&self, stream: Self::CommandStream);
    fn begin_commands(&self, stream: &Self::CommandStream) -> RhiResult<()>;
    /// Open a stream that only records transfers. Its copies wait for every read submitted
    /// before it on the queue, and it never touches the output image.
    fn begin_upload_commands(&self, stream: &Self::CommandStream) -> RhiResult<()>;
    fn end_commands(&self, stream: &Self::CommandStream) -> RhiResult<()>;
    /// Submit `streams` as one batch; they execute in slice order.
    fn submit(
        &self,
        streams: &[&Self::CommandStream],
        wait: &Self::Semaphore,
        signal: &Self::Semaphore,
        fence: &Self::Fence,
    ) -> RhiResult<()>;

    // Output surface

    /// Current size of the window the surface presents to.
    fn window_extent(&self) -> Extent2D;
    fn acquire_image(&self, signal: &Self::Semaphore, timeout: Duration) -> AcquireOutcome;
    fn present(&self, image_index: u32, wait: &Self::Semaphore) -> PresentOutcome;
    /// Recreate the swapchain for `extent`; returns the extent actually chosen.
    fn recreate_surface(&self, extent: Extent2D) -> RhiResult<Extent2D>;
    fn create_render_target(&self, desc: &RenderTargetDesc<'_, Self>) -> RhiResult<Self::RenderTarget>;
    fn destroy_render_target(&self, target: Self::RenderTarget);

    // Resources

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<Self::Buffer>;
    fn destroy_buffer(&self, buffer: Self::Buffer);
    /// Direct write into host-visible buffer memory.
    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> RhiResult<()>;
    fn create_image(&self, desc: &TextureDesc) -> RhiResult<Self::Image>;
    fn destroy_image(&self, image: Self::Image);
    fn create_staging(&self, capacity: u64) -> RhiResult<Self::Staging>;
    fn destroy_staging(&self, staging: Self::Staging);
    fn write_staging(&self, staging: &Self::Staging, offset: u64, data: &[u8]);
    /// Copy through a temporary staging buffer and wait for the queue to finish.
    fn upload_buffer_blocking(&self, dst: &Self::Buffer, offset: u64, data: &[u8]) -> RhiResult<()>;
    fn upload_image_blocking(&self, dst: &Self::Image, data: &[u8]) -> RhiResult<()>;

    // Binding tables

    fn create_binding_table(&self) -> RhiResult<Self::BindingTable>;
    fn destroy_binding_table(&self, table: Self::BindingTable);
    fn write_binding_table(&self, table: &Self::BindingTable, writes: &[BindingWrite<'_, Self>]);

    // Recording

    fn cmd_copy_to_buffer(
        &self,
        stream: &Self::CommandStream,
        staging: &Self::Staging,
        src_offset: u64,
        dst: &Self::Buffer,
        dst_offset: u64,
        size: u64,
    );
    fn cmd_copy_to_image(&self, stream: &Self::CommandStream, staging: &Self::Staging, src_offset: u64, dst: &Self::Image);
    /// Make every transfer recorded so far visible to subsequent rendering.
    fn cmd_transfer_barrier(&self, stream: &Self::CommandStream);
    fn cmd_begin_pass(&self, stream: &Self::CommandStream, target: &Self::RenderTarget, clear: &ClearValues);
    fn cmd_end_pass(&self, stream: &Self::CommandStream);
    fn cmd_set_viewport(&self, stream: &Self::CommandStream, viewport: &Viewport);
    /// Bind the pipeline registered for `variant`; `false` when none is registered.
    fn cmd_bind_pipeline(&self, stream: &Self::CommandStream, variant: PipelineVariant) -> bool;
    fn cmd_bind_binding_table(&self, stream: &Self::CommandStream, variant: PipelineVariant, table: &Self::BindingTable);
    fn cmd_push_model(&self, stream: &Self::CommandStream, variant: PipelineVariant, data: &[u8]);
    fn cmd_bind_vertex_buffer(&self, stream: &Self::CommandStream, buffer: &Self::Buffer);
    fn cmd_bind_index_buffer(&self, stream: &Self::CommandStream, buffer: &Self::Buffer);
    fn cmd_draw(&self, stream: &Self::CommandStream, draw: DrawCommand);
    fn cmd_draw_indirect(&self, stream: &Self::CommandStream, buffer: &Self::Buffer, offset: u64, draw_count: u32, stride: u32);
}
