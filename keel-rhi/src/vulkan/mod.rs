//! [`RenderBackend`] on Vulkan 1.3 through `ash`.
//!
//! Dynamic rendering and synchronization2 are required. One queue serves graphics, transfer
//! and presentation. Pipelines are built by the application against
//! [`VulkanBackend::pipeline_layout`] and registered per [`PipelineVariant`].

mod barrier;
mod buffer;
mod command;
mod core;
mod descriptor;
mod device;
mod swapchain;
mod sync;
mod target;
mod texture;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use keel_core::collections::{HashMap, SmallVec};
use keel_core::log;
use parking_lot::Mutex;
use winit::window::Window;

use crate::backend::{
    AcquireOutcome, BindingResource, BindingWrite, ClearValues, ColorTarget, DrawCommand, Extent2D, FenceWait,
    PresentOutcome, RenderBackend, RenderTargetDesc, Viewport,
};
use crate::binding::BindingPoint;
use crate::pipeline::PipelineVariant;
use crate::resource::{BufferDesc, TextureDesc};
use crate::{RhiError, RhiResult};

pub use self::buffer::{VulkanBuffer, VulkanStaging};
pub use self::command::VulkanCommandStream;
pub use self::core::{PhysicalDevice, VulkanCore};
pub use self::descriptor::VulkanBindingTable;
pub use self::device::LogicalDevice;
pub use self::swapchain::SwapchainConfig;
pub use self::sync::{VulkanFence, VulkanSemaphore};
pub use self::target::VulkanRenderTarget;
pub use self::texture::VulkanImage;

use self::command::ImmediateEncoder;
use self::descriptor::{BindingLayout, ResolvedWrite};
use self::swapchain::{SurfaceWindow, Swapchain};
use self::target::ColorAttachment;

fn to_nanos(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

fn device_error(err: vk::Result) -> RhiError {
    match err {
        vk::Result::ERROR_DEVICE_LOST => RhiError::DeviceLost,
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => RhiError::OutOfMemory,
        other => RhiError::Vulkan(other),
    }
}

struct Presentation {
    swapchain: Option<Swapchain>,
    surface: Option<SurfaceWindow>,
}

pub struct VulkanBackend {
    pipelines: Mutex<HashMap<PipelineVariant, vk::Pipeline>>,
    presentation: Mutex<Presentation>,
    /// Image index returned by the last successful acquire, until it is presented.
    acquired: Mutex<Option<u32>>,
    surface_lost: AtomicBool,
    swapchain_config: SwapchainConfig,
    window: Arc<Window>,

    immediate: ImmediateEncoder,
    layout: BindingLayout,
    physical_device: PhysicalDevice,
    device: LogicalDevice,
    core: VulkanCore,
}

impl VulkanBackend {
    #[profiling::function]
    pub fn new(window: Arc<Window>, swapchain_config: SwapchainConfig) -> RhiResult<Self> {
        let core = VulkanCore::new(&window)?;
        let surface = SurfaceWindow::new(&window, &core)?;
        let physical_device = self::core::select_physical_device(core.instance(), &surface)?;
        log::info!(
            "Selected GPU: {} ({:?})",
            physical_device.name(),
            physical_device.properties().device_type
        );
        let device = LogicalDevice::new(core.instance(), &physical_device)?;
        let layout = BindingLayout::new(&device)?;
        let immediate = ImmediateEncoder::new(&device)?;

        Ok(Self {
            pipelines: Mutex::new(HashMap::default()),
            presentation: Mutex::new(Presentation {
                swapchain: None,
                surface: Some(surface),
            }),
            acquired: Mutex::new(None),
            surface_lost: AtomicBool::new(false),
            swapchain_config,
            window,
            immediate,
            layout,
            physical_device,
            device,
            core,
        })
    }

    #[inline]
    pub fn device(&self) -> &LogicalDevice {
        &self.device
    }

    #[inline]
    pub fn physical_device(&self) -> &PhysicalDevice {
        &self.physical_device
    }

    /// Layout every registered pipeline must be created with.
    #[inline]
    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.layout.pipeline_layout()
    }

    /// Color format of the output images, once the first swapchain exists.
    pub fn surface_format(&self) -> Option<vk::Format> {
        self.presentation.lock().swapchain.as_ref().map(Swapchain::format)
    }

    /// Take ownership of `pipeline` for draws using `variant`. A pipeline previously
    /// registered for it is destroyed once the GPU is idle.
    pub fn register_pipeline(&self, variant: PipelineVariant, pipeline: vk::Pipeline) -> RhiResult<()> {
        let previous = self.pipelines.lock().insert(variant, pipeline);
        if let Some(previous) = previous {
            self.device.wait_idle()?;
            unsafe { self.device.handle().destroy_pipeline(previous, None) };
        }
        Ok(())
    }

    pub fn unregister_pipeline(&self, variant: PipelineVariant) -> RhiResult<()> {
        let removed = self.pipelines.lock().remove(&variant);
        if let Some(pipeline) = removed {
            self.device.wait_idle()?;
            unsafe { self.device.handle().destroy_pipeline(pipeline, None) };
        }
        Ok(())
    }

    fn transition_to_general(&self, image: &VulkanImage) -> RhiResult<()> {
        let transition = barrier::image_transition(
            image.handle(),
            image.subresource_range(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
            (vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::NONE),
            (
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
            ),
        );
        self.immediate.submit_and_wait(&self.device, |raw, cmd| unsafe {
            raw.cmd_pipeline_barrier2(cmd, &barrier::image_dependency(std::slice::from_ref(&transition)));
        })
    }

    fn memory_barrier(&self, cmd: vk::CommandBuffer, barrier: vk::MemoryBarrier2<'_>) {
        unsafe {
            self.device
                .handle()
                .cmd_pipeline_barrier2(cmd, &barrier::memory_dependency(std::slice::from_ref(&barrier)));
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(err) = self.device.wait_idle() {
            log::error!("Idle wait before backend teardown failed: {err}");
        }
        for (_, pipeline) in self.pipelines.get_mut().drain() {
            unsafe { self.device.handle().destroy_pipeline(pipeline, None) };
        }
        let presentation = self.presentation.get_mut();
        presentation.swapchain = None;
        presentation.surface = None;
    }
}

impl RenderBackend for VulkanBackend {
    type Buffer = VulkanBuffer;
    type Image = VulkanImage;
    type Fence = VulkanFence;
    type Semaphore = VulkanSemaphore;
    type CommandStream = VulkanCommandStream;
    type Staging = VulkanStaging;
    type RenderTarget = VulkanRenderTarget;
    type BindingTable = VulkanBindingTable;

    fn create_fence(&self, signaled: bool) -> RhiResult<VulkanFence> {
        VulkanFence::new(&self.device, signaled)
    }

    fn destroy_fence(&self, fence: VulkanFence) {
        drop(fence);
    }

    fn wait_fence(&self, fence: &VulkanFence, timeout: Duration) -> RhiResult<FenceWait> {
        let waited = unsafe {
            self.device
                .handle()
                .wait_for_fences(&[fence.handle()], true, to_nanos(timeout))
        };
        match waited {
            Ok(()) => Ok(FenceWait::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceWait::TimedOut),
            Err(err) => Err(device_error(err)),
        }
    }

    fn reset_fence(&self, fence: &VulkanFence) -> RhiResult<()> {
        unsafe { self.device.handle().reset_fences(&[fence.handle()]) }.map_err(device_error)
    }

    fn create_semaphore(&self) -> RhiResult<VulkanSemaphore> {
        VulkanSemaphore::new(&self.device)
    }

    fn destroy_semaphore(&self, semaphore: VulkanSemaphore) {
        drop(semaphore);
    }

    fn wait_idle(&self) -> RhiResult<()> {
        self.device.wait_idle()
    }

    fn create_command_stream(&self) -> RhiResult<VulkanCommandStream> {
        VulkanCommandStream::new(&self.device)
    }

    fn destroy_command_stream(&self, stream: VulkanCommandStream) {
        drop(stream);
    }

    fn begin_commands(&self, stream: &VulkanCommandStream) -> RhiResult<()> {
        stream.begin(*self.acquired.lock())
    }

    fn begin_upload_commands(&self, stream: &VulkanCommandStream) -> RhiResult<()> {
        stream.begin(None)?;
        self.memory_barrier(stream.handle(), barrier::all_commands_to_transfer());
        Ok(())
    }

    fn end_commands(&self, stream: &VulkanCommandStream) -> RhiResult<()> {
        // The output image must be presentable even when no pass rendered to it.
        let transition = {
            let state = stream.state.lock();
            match state.image_index {
                Some(index) => self
                    .presentation
                    .lock()
                    .swapchain
                    .as_ref()
                    .and_then(|swapchain| swapchain.image(index))
                    .map(|(image, _)| barrier::surface_to_present(image, state.surface_layout)),
                None => None,
            }
        };
        if let Some(transition) = transition {
            unsafe {
                self.device.handle().cmd_pipeline_barrier2(
                    stream.handle(),
                    &barrier::image_dependency(std::slice::from_ref(&transition)),
                );
            }
        }
        stream.end()
    }

    #[profiling::function]
    fn submit(
        &self,
        streams: &[&VulkanCommandStream],
        wait: &VulkanSemaphore,
        signal: &VulkanSemaphore,
        fence: &VulkanFence,
    ) -> RhiResult<()> {
        let cmd_infos: SmallVec<[vk::CommandBufferSubmitInfo; 2]> = streams
            .iter()
            .map(|stream| vk::CommandBufferSubmitInfo::default().command_buffer(stream.handle()))
            .collect();
        let wait_info = vk::SemaphoreSubmitInfo::default()
            .semaphore(wait.handle())
            .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
        let signal_info = vk::SemaphoreSubmitInfo::default()
            .semaphore(signal.handle())
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS);
        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(std::slice::from_ref(&wait_info))
            .command_buffer_infos(&cmd_infos)
            .signal_semaphore_infos(std::slice::from_ref(&signal_info));

        let queue = self.device.queue();
        unsafe {
            self.device
                .handle()
                .queue_submit2(*queue, &[submit_info], fence.handle())
        }
        .map_err(device_error)
    }

    fn window_extent(&self) -> Extent2D {
        let size = self.window.inner_size();
        Extent2D::new(size.width, size.height)
    }

    #[profiling::function]
    fn acquire_image(&self, signal: &VulkanSemaphore, timeout: Duration) -> AcquireOutcome {
        let presentation = self.presentation.lock();
        let Some(swapchain) = presentation.swapchain.as_ref() else {
            return AcquireOutcome::OutOfDate;
        };
        let acquired = unsafe {
            swapchain.loader().acquire_next_image(
                swapchain.handle(),
                to_nanos(timeout),
                signal.handle(),
                vk::Fence::null(),
            )
        };
        match acquired {
            Ok((image_index, suboptimal)) => {
                *self.acquired.lock() = Some(image_index);
                AcquireOutcome::Acquired { image_index, suboptimal }
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => AcquireOutcome::OutOfDate,
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => {
                self.surface_lost.store(true, Ordering::Release);
                AcquireOutcome::SurfaceLost
            }
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => AcquireOutcome::Timeout,
            Err(err) => AcquireOutcome::Failed(device_error(err)),
        }
    }

    #[profiling::function]
    fn present(&self, image_index: u32, wait: &VulkanSemaphore) -> PresentOutcome {
        let presentation = self.presentation.lock();
        *self.acquired.lock() = None;
        let Some(swapchain) = presentation.swapchain.as_ref() else {
            return PresentOutcome::OutOfDate;
        };

        let swapchains = [swapchain.handle()];
        let image_indices = [image_index];
        let wait_semaphores = [wait.handle()];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        self.window.pre_present_notify();
        let presented = {
            let queue = self.device.queue();
            unsafe { swapchain.loader().queue_present(*queue, &present_info) }
        };
        match presented {
            Ok(false) => PresentOutcome::Presented,
            Ok(true) => PresentOutcome::Suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => PresentOutcome::OutOfDate,
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => {
                self.surface_lost.store(true, Ordering::Release);
                PresentOutcome::SurfaceLost
            }
            Err(err) => PresentOutcome::Failed(device_error(err)),
        }
    }

    #[profiling::function]
    fn recreate_surface(&self, extent: Extent2D) -> RhiResult<Extent2D> {
        self.device.wait_idle()?;
        *self.acquired.lock() = None;

        let mut guard = self.presentation.lock();
        let presentation = &mut *guard;
        if self.surface_lost.swap(false, Ordering::AcqRel) || presentation.surface.is_none() {
            log::warn!("Recreating lost window surface");
            // A window can only back one surface at a time.
            presentation.swapchain = None;
            presentation.surface = None;
            presentation.surface = Some(SurfaceWindow::new(&self.window, &self.core)?);
        }
        let Some(surface) = presentation.surface.as_ref() else {
            return Err(RhiError::Surface("no window surface".to_owned()));
        };

        let capabilities = surface.capabilities(self.physical_device.handle())?;
        if extent.is_empty() || capabilities.current_extent.width == 0 || capabilities.current_extent.height == 0 {
            return Ok(Extent2D::default());
        }

        let old = presentation.swapchain.take();
        let swapchain = Swapchain::new(
            &self.core,
            &self.device,
            self.physical_device.handle(),
            surface,
            &self.swapchain_config,
            vk::Extent2D {
                width: extent.width,
                height: extent.height,
            },
            old,
        )?;
        let actual = swapchain.extent();
        log::debug!(
            "Swapchain ready: {} images, {:?}",
            swapchain.image_count(),
            swapchain.present_mode()
        );
        presentation.swapchain = Some(swapchain);
        Ok(Extent2D::new(actual.width, actual.height))
    }

    fn create_render_target(&self, desc: &RenderTargetDesc<'_, Self>) -> RhiResult<VulkanRenderTarget> {
        if let ColorTarget::Image(image) = &desc.color {
            log::trace!("render target '{}' -> {}x{}", desc.name, image.extent().width, image.extent().height);
        }
        VulkanRenderTarget::new(self, desc)
    }

    fn destroy_render_target(&self, target: VulkanRenderTarget) {
        drop(target);
    }

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<VulkanBuffer> {
        VulkanBuffer::new(&self.device, desc)
    }

    fn destroy_buffer(&self, buffer: VulkanBuffer) {
        drop(buffer);
    }

    fn write_buffer(&self, buffer: &VulkanBuffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        buffer.write(offset, data)
    }

    fn create_image(&self, desc: &TextureDesc) -> RhiResult<VulkanImage> {
        let image = VulkanImage::new(&self.device, desc)?;
        self.transition_to_general(&image)?;
        Ok(image)
    }

    fn destroy_image(&self, image: VulkanImage) {
        drop(image);
    }

    fn create_staging(&self, capacity: u64) -> RhiResult<VulkanStaging> {
        VulkanStaging::new(&self.device, capacity)
    }

    fn destroy_staging(&self, staging: VulkanStaging) {
        drop(staging);
    }

    fn write_staging(&self, staging: &VulkanStaging, offset: u64, data: &[u8]) {
        staging.write(offset, data);
    }

    fn upload_buffer_blocking(&self, dst: &VulkanBuffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        self.immediate.upload_buffer(&self.device, dst, offset, data)
    }

    fn upload_image_blocking(&self, dst: &VulkanImage, data: &[u8]) -> RhiResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let staging = VulkanBuffer::staging(&self.device, "staging.image", data.len() as u64)?;
        staging.write(0, data)?;
        let region = dst.copy_region(0);
        let before = barrier::flush_all_memory_writes();
        let after = barrier::transfer_to_all_commands();
        self.immediate.submit_and_wait(&self.device, |raw, cmd| unsafe {
            raw.cmd_pipeline_barrier2(cmd, &barrier::memory_dependency(std::slice::from_ref(&before)));
            raw.cmd_copy_buffer_to_image(cmd, staging.handle(), dst.handle(), vk::ImageLayout::GENERAL, &[region]);
            raw.cmd_pipeline_barrier2(cmd, &barrier::memory_dependency(std::slice::from_ref(&after)));
        })
    }

    fn create_binding_table(&self) -> RhiResult<VulkanBindingTable> {
        VulkanBindingTable::new(&self.device, &self.layout)
    }

    fn destroy_binding_table(&self, table: VulkanBindingTable) {
        drop(table);
    }

    fn write_binding_table(&self, table: &VulkanBindingTable, writes: &[BindingWrite<'_, Self>]) {
        let resolved: SmallVec<[ResolvedWrite; BindingPoint::COUNT]> = writes
            .iter()
            .map(|write| match write.resource {
                BindingResource::Buffer(buffer) => ResolvedWrite::Buffer(write.point, buffer.descriptor_info()),
                BindingResource::Image(image) => ResolvedWrite::Image(write.point, image.descriptor_info()),
            })
            .collect();
        descriptor::update_table(self.device.handle(), table, &resolved);
    }

    fn cmd_copy_to_buffer(
        &self,
        stream: &VulkanCommandStream,
        staging: &VulkanStaging,
        src_offset: u64,
        dst: &VulkanBuffer,
        dst_offset: u64,
        size: u64,
    ) {
        let region = vk::BufferCopy::default()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(size);
        unsafe {
            self.device
                .handle()
                .cmd_copy_buffer(stream.handle(), staging.handle(), dst.handle(), &[region]);
        }
    }

    fn cmd_copy_to_image(&self, stream: &VulkanCommandStream, staging: &VulkanStaging, src_offset: u64, dst: &VulkanImage) {
        let region = dst.copy_region(src_offset);
        unsafe {
            self.device.handle().cmd_copy_buffer_to_image(
                stream.handle(),
                staging.handle(),
                dst.handle(),
                vk::ImageLayout::GENERAL,
                &[region],
            );
        }
    }

    fn cmd_transfer_barrier(&self, stream: &VulkanCommandStream) {
        self.memory_barrier(stream.handle(), barrier::transfer_to_all_commands());
    }

    fn cmd_begin_pass(&self, stream: &VulkanCommandStream, target: &VulkanRenderTarget, clear: &ClearValues) {
        let cmd = stream.handle();
        let memory = barrier::flush_all_memory_writes();

        let mut surface_view = None;
        let mut transition = None;
        if target.color == ColorAttachment::Surface {
            let mut state = stream.state.lock();
            let surface_image = state.image_index.and_then(|index| {
                self.presentation
                    .lock()
                    .swapchain
                    .as_ref()
                    .and_then(|swapchain| swapchain.image(index))
            });
            if let Some((image, view)) = surface_image {
                surface_view = Some(view);
                if state.surface_layout != vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL {
                    transition = Some(barrier::surface_to_attachment(image));
                    state.surface_layout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
                }
            } else {
                log::warn!("surface pass recorded without an output image");
            }
        }

        let dependency = vk::DependencyInfo::default()
            .memory_barriers(std::slice::from_ref(&memory))
            .image_memory_barriers(transition.as_slice());
        unsafe { self.device.handle().cmd_pipeline_barrier2(cmd, &dependency) };

        target.begin(cmd, surface_view, clear);
    }

    fn cmd_end_pass(&self, stream: &VulkanCommandStream) {
        unsafe { self.device.handle().cmd_end_rendering(stream.handle()) };
    }

    fn cmd_set_viewport(&self, stream: &VulkanCommandStream, viewport: &Viewport) {
        let viewport = vk::Viewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.width,
            height: viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        };
        unsafe { self.device.handle().cmd_set_viewport(stream.handle(), 0, &[viewport]) };
    }

    fn cmd_bind_pipeline(&self, stream: &VulkanCommandStream, variant: PipelineVariant) -> bool {
        let Some(&pipeline) = self.pipelines.lock().get(&variant) else {
            return false;
        };
        unsafe {
            self.device
                .handle()
                .cmd_bind_pipeline(stream.handle(), vk::PipelineBindPoint::GRAPHICS, pipeline);
        }
        true
    }

    fn cmd_bind_binding_table(&self, stream: &VulkanCommandStream, _variant: PipelineVariant, table: &VulkanBindingTable) {
        unsafe {
            self.device.handle().cmd_bind_descriptor_sets(
                stream.handle(),
                vk::PipelineBindPoint::GRAPHICS,
                self.layout.pipeline_layout(),
                0,
                &[table.handle()],
                &[],
            );
        }
    }

    fn cmd_push_model(&self, stream: &VulkanCommandStream, _variant: PipelineVariant, data: &[u8]) {
        unsafe {
            self.device.handle().cmd_push_constants(
                stream.handle(),
                self.layout.pipeline_layout(),
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                0,
                data,
            );
        }
    }

    fn cmd_bind_vertex_buffer(&self, stream: &VulkanCommandStream, buffer: &VulkanBuffer) {
        unsafe {
            self.device
                .handle()
                .cmd_bind_vertex_buffers(stream.handle(), 0, &[buffer.handle()], &[0]);
        }
    }

    fn cmd_bind_index_buffer(&self, stream: &VulkanCommandStream, buffer: &VulkanBuffer) {
        unsafe {
            self.device
                .handle()
                .cmd_bind_index_buffer(stream.handle(), buffer.handle(), 0, vk::IndexType::UINT32);
        }
    }

    fn cmd_draw(&self, stream: &VulkanCommandStream, draw: DrawCommand) {
        let raw = self.device.handle();
        match draw {
            DrawCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => unsafe {
                raw.cmd_draw(stream.handle(), vertex_count, instance_count, first_vertex, first_instance);
            },
            DrawCommand::Indexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => unsafe {
                raw.cmd_draw_indexed(
                    stream.handle(),
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                );
            },
        }
    }

    fn cmd_draw_indirect(
        &self,
        stream: &VulkanCommandStream,
        buffer: &VulkanBuffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) {
        unsafe {
            self.device
                .handle()
                .cmd_draw_indirect(stream.handle(), buffer.handle(), offset, draw_count, stride);
        }
    }
}
