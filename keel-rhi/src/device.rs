//! The render device: one explicitly owned context tying the frame scheduler, pass
//! orchestration, uploads, resource tables, surface and binding tables together.
//!
//! Recording calls (`begin_frame`, passes, draws, uploads) take `&mut self` and belong to the
//! render thread. Resource creation and destruction take `&self`.

use bytemuck::bytes_of;
use keel_core::collections::SmallVec;
use keel_core::log;
use parking_lot::Mutex;

use crate::backend::{BindingResource, BindingWrite, ClearValues, DrawCommand, Extent2D, RenderBackend, Viewport};
use crate::binding::{BindingPoint, BindingSource, BindingSynchronizer};
use crate::config::RhiConfig;
use crate::defer_release::DeferredObject;
use crate::frame::{AcquireStep, FrameInfo, FrameScheduler, FrameStatus, PresentStep, SkipReason};
use crate::pass::{ActivePass, PassKind, PassState, PassTransition, PassOrchestrator};
use crate::pipeline::{CascadeUniforms, FrameUniforms, GlobalUniforms, ModelUniforms, PipelineVariant, MAX_SHADOW_CASCADES};
use crate::resource::{
    BufferDesc, BufferHandle, BufferRecord, BufferUsage, ResourceTables, TextureDesc, TextureFormat, TextureHandle,
    TextureRecord,
};
use crate::surface::{SurfaceLifecycle, SurfaceStamp, SurfaceValidity};
use crate::upload::{ArenaAllocation, CopyTarget};
use crate::{RhiError, RhiResult};

/// Size of the zeroed buffer bound in place of [`BufferHandle::NONE`].
pub const FALLBACK_BUFFER_SIZE: u64 = 256;

/// Byte stride of one indirect draw record (vertex count, instance count, first vertex,
/// first instance).
pub const DRAW_INDIRECT_STRIDE: u32 = 16;

/// Substitutes for [`BufferHandle::NONE`] and [`TextureHandle::NONE`].
struct FallbackResources<B: RenderBackend> {
    buffer: B::Buffer,
    texture: B::Image,
}

impl<B: RenderBackend> FallbackResources<B> {
    fn new(backend: &B) -> RhiResult<Self> {
        let buffer = backend.create_buffer(
            &BufferDesc::new("fallback_buffer", FALLBACK_BUFFER_SIZE).with_usage(
                BufferUsage::Vertex
                    | BufferUsage::Index
                    | BufferUsage::Storage
                    | BufferUsage::Indirect
                    | BufferUsage::TransferDst,
            ),
        )?;
        let texture = match backend.create_image(
            &TextureDesc::new_2d(1, 1, TextureFormat::Rgba8Unorm).with_name("fallback_white"),
        ) {
            Ok(texture) => texture,
            Err(err) => {
                backend.destroy_buffer(buffer);
                return Err(err);
            }
        };

        let uploaded = backend
            .upload_buffer_blocking(&buffer, 0, &[0u8; FALLBACK_BUFFER_SIZE as usize])
            .and_then(|()| backend.upload_image_blocking(&texture, &[0xff; 4]));
        if let Err(err) = uploaded {
            backend.destroy_image(texture);
            backend.destroy_buffer(buffer);
            return Err(err);
        }

        Ok(Self { buffer, texture })
    }

    fn destroy(self, backend: &B) {
        backend.destroy_image(self.texture);
        backend.destroy_buffer(self.buffer);
    }
}

enum DrawCall {
    Direct(DrawCommand),
    Indirect {
        buffer: BufferHandle,
        offset: u64,
        draw_count: u32,
    },
}

pub struct RenderDevice<B: RenderBackend> {
    config: RhiConfig,
    resources: ResourceTables<B>,
    frames: FrameScheduler<B>,
    passes: PassOrchestrator,
    surface: SurfaceLifecycle<B>,
    bindings: Mutex<BindingSynchronizer>,
    fallback: Option<FallbackResources<B>>,
    uniforms: FrameUniforms,
    clear: ClearValues,
    viewport: Option<Viewport>,
    backend: B,
}

impl<B: RenderBackend> RenderDevice<B> {
    pub fn new(backend: B, config: RhiConfig) -> RhiResult<Self> {
        config.validate()?;

        let fallback = FallbackResources::new(&backend)?;
        let frames = match FrameScheduler::new(&backend, &config) {
            Ok(frames) => frames,
            Err(err) => {
                fallback.destroy(&backend);
                return Err(err);
            }
        };
        let surface = match SurfaceLifecycle::new(&backend, config.shadow_cascades, config.shadow_map_size) {
            Ok(surface) => surface,
            Err(err) => {
                let mut frames = frames;
                frames.destroy(&backend);
                fallback.destroy(&backend);
                return Err(err);
            }
        };

        log::info!(
            "Render device created: {} frames in flight, {} KiB transient arena per slot{}",
            config.frames_in_flight,
            config.transient_arena_size / 1024,
            if config.safe_mode { ", safe mode" } else { "" }
        );

        Ok(Self {
            resources: ResourceTables::new(),
            passes: PassOrchestrator::new(),
            bindings: Mutex::new(BindingSynchronizer::new(frames.slot_count())),
            frames,
            surface,
            fallback: Some(fallback),
            uniforms: FrameUniforms::default(),
            clear: ClearValues::default(),
            viewport: None,
            config,
            backend,
        })
    }

    // Introspection

    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[inline]
    pub fn config(&self) -> &RhiConfig {
        &self.config
    }

    #[inline]
    pub fn frame_index(&self) -> u64 {
        self.frames.frame_index()
    }

    #[inline]
    pub fn current_slot(&self) -> usize {
        self.frames.current_index()
    }

    #[inline]
    pub fn is_frame_in_progress(&self) -> bool {
        self.frames.in_progress()
    }

    /// A fence wait timed out; the device makes no further GPU calls.
    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.frames.is_poisoned()
    }

    #[inline]
    pub fn pass_state(&self) -> PassState {
        self.passes.state()
    }

    #[inline]
    pub fn surface_stamp(&self) -> SurfaceStamp {
        self.surface.stamp()
    }

    #[inline]
    pub fn surface_rebuild_count(&self) -> u64 {
        self.surface.rebuild_count()
    }

    pub fn buffer_count(&self) -> usize {
        self.resources.buffer_count()
    }

    pub fn texture_count(&self) -> usize {
        self.resources.texture_count()
    }

    pub fn buffer_desc(&self, handle: BufferHandle) -> Option<BufferDesc> {
        self.resources.buffer_desc(handle)
    }

    pub fn texture_desc(&self, handle: TextureHandle) -> Option<TextureDesc> {
        self.resources.texture_desc(handle)
    }

    /// Objects waiting in every slot's deferred release queue.
    pub fn pending_release_count(&self) -> usize {
        (0..self.frames.slot_count())
            .map(|slot| self.frames.slot(slot).release_queue().len())
            .sum()
    }

    /// Copies staged into the upload stream of the frame being recorded.
    pub fn pending_copy_count(&self) -> usize {
        if self.frames.in_progress() {
            self.frames.current().staged
        } else {
            0
        }
    }

    /// Binding tables the slot has created for mid-frame instance data switches, plus its
    /// base table.
    pub fn binding_table_count(&self, slot: usize) -> usize {
        self.frames.slot(slot).tables().len()
    }

    /// Bump offset of a slot's transient arena.
    pub fn arena_offset(&self, slot: usize) -> u64 {
        self.frames.slot(slot).arena().cursor().offset()
    }

    pub fn arena_resets(&self, slot: usize) -> u64 {
        self.frames.slot(slot).arena().cursor().resets()
    }

    pub fn binding_source(&self, point: BindingPoint) -> BindingSource {
        self.bindings.lock().selected(point)
    }

    pub fn slot_binding(&self, slot: usize, point: BindingPoint) -> Option<BindingSource> {
        self.bindings.lock().reflected(slot, point)
    }

    /// Run `f` on the native buffer behind `handle`.
    pub fn with_buffer<R>(&self, handle: BufferHandle, f: impl FnOnce(&B::Buffer) -> R) -> Option<R> {
        self.resources.buffers().get(&handle).map(|record| f(&record.native))
    }

    /// Run `f` on the native image behind `handle`.
    pub fn with_texture<R>(&self, handle: TextureHandle, f: impl FnOnce(&B::Image) -> R) -> Option<R> {
        self.resources.textures().get(&handle).map(|record| f(&record.native))
    }

    // Resources

    /// Create a buffer. Returns [`BufferHandle::NONE`] on failure.
    pub fn create_buffer(&self, desc: &BufferDesc) -> BufferHandle {
        if self.frames.is_poisoned() {
            return BufferHandle::NONE;
        }
        if desc.size == 0 {
            log::warn!("Refusing to create zero-sized buffer '{}'", desc.name);
            return BufferHandle::NONE;
        }

        match self.backend.create_buffer(desc) {
            Ok(native) => {
                let handle = self.resources.insert_buffer(BufferRecord {
                    native,
                    desc: desc.clone(),
                });
                log::trace!("buffer '{}' created as {:?}", desc.name, handle);
                handle
            }
            Err(err) => {
                log::error!("Failed to create buffer '{}' ({} bytes): {err}", desc.name, desc.size);
                BufferHandle::NONE
            }
        }
    }

    /// Create a texture. Returns [`TextureHandle::NONE`] on failure.
    pub fn create_texture(&self, desc: &TextureDesc) -> TextureHandle {
        if self.frames.is_poisoned() {
            return TextureHandle::NONE;
        }
        if desc.width == 0 || desc.height == 0 || desc.array_layers == 0 {
            log::warn!("Refusing to create empty texture '{}'", desc.name);
            return TextureHandle::NONE;
        }

        match self.backend.create_image(desc) {
            Ok(native) => {
                let handle = self.resources.insert_texture(TextureRecord {
                    native,
                    desc: desc.clone(),
                });
                log::trace!("texture '{}' created as {:?}", desc.name, handle);
                handle
            }
            Err(err) => {
                log::error!(
                    "Failed to create texture '{}' ({}x{}): {err}",
                    desc.name,
                    desc.width,
                    desc.height
                );
                TextureHandle::NONE
            }
        }
    }

    /// Invalidate `handle` now and free the buffer once no submitted frame can use it.
    pub fn destroy_buffer(&self, handle: BufferHandle) {
        let Some(record) = self.resources.remove_buffer(handle) else {
            log::trace!("destroy of unknown buffer {:?} ignored", handle);
            return;
        };
        self.bindings.lock().revert(BindingSource::Buffer(handle));
        self.frames.release(&self.backend, DeferredObject::Buffer(record.native));
    }

    /// Invalidate `handle` now and free the texture once no submitted frame can use it.
    pub fn destroy_texture(&self, handle: TextureHandle) {
        let Some(record) = self.resources.remove_texture(handle) else {
            log::trace!("destroy of unknown texture {:?} ignored", handle);
            return;
        };
        self.bindings.lock().revert(BindingSource::Texture(handle));
        self.frames.release(&self.backend, DeferredObject::Image(record.native));
    }

    /// Write `data` at the start of the buffer.
    pub fn upload_buffer(&mut self, handle: BufferHandle, data: &[u8]) {
        self.update_buffer(handle, 0, data);
    }

    /// Write `data` at `offset`. Host-visible buffers are written directly; device-local ones
    /// go through the transient arena, or a blocking upload when that is not possible.
    pub fn update_buffer(&mut self, handle: BufferHandle, offset: u64, data: &[u8]) {
        if handle.is_none() || data.is_empty() || self.frames.is_poisoned() {
            return;
        }
        let Some(desc) = self.resources.buffer_desc(handle) else {
            log::trace!("update of unknown buffer {:?} ignored", handle);
            return;
        };
        let in_range = offset
            .checked_add(data.len() as u64)
            .is_some_and(|end| end <= desc.size);
        if !in_range {
            log::warn!(
                "Rejected write of {} bytes at offset {offset} into buffer '{}' of {} bytes",
                data.len(),
                desc.name,
                desc.size
            );
            return;
        }

        if desc.is_host_visible() {
            if let Some(record) = self.resources.buffers().get(&handle) {
                if let Err(err) = self.backend.write_buffer(&record.native, offset, data) {
                    log::error!("Mapped write into buffer '{}' failed: {err}", desc.name);
                }
            }
            return;
        }

        self.stage_or_block(
            CopyTarget::Buffer {
                handle,
                dst_offset: offset,
            },
            data,
        );
    }

    /// Replace the whole content of a texture. `data` must cover every layer.
    pub fn update_texture(&mut self, handle: TextureHandle, data: &[u8]) {
        if handle.is_none() || self.frames.is_poisoned() {
            return;
        }
        let Some(desc) = self.resources.texture_desc(handle) else {
            log::trace!("update of unknown texture {:?} ignored", handle);
            return;
        };
        if data.len() as u64 != desc.byte_size() {
            log::warn!(
                "Rejected upload of {} bytes into texture '{}' expecting {} bytes",
                data.len(),
                desc.name,
                desc.byte_size()
            );
            return;
        }

        self.stage_or_block(CopyTarget::Texture { handle }, data);
    }

    fn stage_or_block(&mut self, target: CopyTarget, data: &[u8]) {
        if self.frames.in_progress() && !self.config.safe_mode {
            let slot = self.frames.current_mut();
            match slot.arena.push(&self.backend, data) {
                Ok(src) => match self.record_staged_copy(src, target) {
                    Ok(()) => return,
                    Err(err) => log::warn!("Opening the upload stream failed: {err}; uploading synchronously"),
                },
                Err(full) => log::debug!("{full}; uploading synchronously"),
            }
        }
        self.upload_blocking(target, data);
    }

    /// Record a copy out of the arena into the slot's upload stream, which runs before any
    /// command of the frame, so draws already recorded in an open pass see the new data.
    fn record_staged_copy(&mut self, src: ArenaAllocation, target: CopyTarget) -> RhiResult<()> {
        let slot = self.frames.current_mut();
        if slot.staged == 0 {
            self.backend.begin_upload_commands(&slot.uploads)?;
        }
        slot.staged += 1;

        let stream = &slot.uploads;
        let staging = slot.arena.staging();
        match target {
            CopyTarget::Buffer { handle, dst_offset } => {
                if let Some(record) = self.resources.buffers().get(&handle) {
                    self.backend
                        .cmd_copy_to_buffer(stream, staging, src.offset, &record.native, dst_offset, src.size);
                }
            }
            CopyTarget::Texture { handle } => {
                if let Some(record) = self.resources.textures().get(&handle) {
                    self.backend.cmd_copy_to_image(stream, staging, src.offset, &record.native);
                }
            }
        }
        Ok(())
    }

    fn upload_blocking(&self, target: CopyTarget, data: &[u8]) {
        profiling::scope!("RenderDevice::upload_blocking");
        let result = match target {
            CopyTarget::Buffer { handle, dst_offset } => match self.resources.buffers().get(&handle) {
                Some(record) => self.backend.upload_buffer_blocking(&record.native, dst_offset, data),
                None => Ok(()),
            },
            CopyTarget::Texture { handle } => match self.resources.textures().get(&handle) {
                Some(record) => self.backend.upload_image_blocking(&record.native, data),
                None => Ok(()),
            },
        };
        if let Err(err) = result {
            log::error!("Blocking upload failed: {err}");
        }
    }

    // Frame lifecycle

    /// Start recording a frame.
    ///
    /// Blocks on the current ring slot's fence for at most the configured timeout. Expiry
    /// is fatal: the fatal handler runs once and every later call fails with
    /// [`RhiError::DeviceLost`] without touching the GPU.
    pub fn begin_frame(&mut self) -> RhiResult<FrameStatus> {
        profiling::scope!("RenderDevice::begin_frame");

        if self.frames.is_poisoned() {
            return Err(RhiError::DeviceLost);
        }
        if self.frames.in_progress() {
            return Ok(FrameStatus::AlreadyInProgress);
        }

        match self.surface.validate(self.backend.window_extent()) {
            SurfaceValidity::Valid => {}
            SurfaceValidity::Minimized => return Ok(FrameStatus::Skipped(SkipReason::SurfaceMinimized)),
            SurfaceValidity::Invalid(extent) => {
                if let Err(err) = self.rebuild_surface(extent) {
                    log::warn!("Surface rebuild at {}x{} failed: {err}", extent.width, extent.height);
                    return Ok(FrameStatus::Skipped(SkipReason::SurfaceRebuildFailed));
                }
                if self.surface.generation().is_none() {
                    return Ok(FrameStatus::Skipped(SkipReason::SurfaceMinimized));
                }
            }
        }

        self.frames.wait_current(&self.backend, &self.config)?;
        self.frames.reclaim_current(&self.backend);
        self.write_frame_uniforms();

        let image_index = match self.frames.acquire(&self.backend, &self.config) {
            AcquireStep::Acquired { image_index, suboptimal } => {
                if suboptimal {
                    self.surface.mark_invalid();
                }
                image_index
            }
            AcquireStep::Skip(reason) => {
                match reason {
                    SkipReason::SurfaceOutOfDate => {
                        let extent = self.backend.window_extent();
                        self.surface.mark_invalid();
                        if !extent.is_empty() {
                            if let Err(err) = self.rebuild_surface(extent) {
                                log::warn!("Surface rebuild after out-of-date acquire failed: {err}");
                            }
                        }
                    }
                    _ => self.surface.mark_invalid(),
                }
                return Ok(FrameStatus::Skipped(reason));
            }
        };

        self.frames.open(&self.backend, image_index)?;
        self.sync_bindings();
        let slot = self.frames.current_index();
        let instance = self.bindings.get_mut().reflected(slot, BindingPoint::InstanceData);
        self.frames.current_mut().tables.set_instance(instance);

        let stamp = self.surface.stamp();
        Ok(FrameStatus::Started(FrameInfo {
            frame_index: self.frames.frame_index(),
            slot: self.frames.current_index(),
            image_index,
            extent: stamp.extent,
            generation: stamp.generation,
        }))
    }

    /// Close the open pass, submit the frame and present it. No-op outside a frame.
    pub fn end_frame(&mut self) -> RhiResult<()> {
        if !self.frames.in_progress() {
            return Ok(());
        }
        profiling::scope!("RenderDevice::end_frame");

        let transition = self.passes.end_any();
        self.apply_transition(transition);

        if let Err(err) = self.frames.submit(&self.backend) {
            self.passes.reset();
            return Err(err);
        }
        if self.frames.present(&self.backend) == PresentStep::Stale {
            self.surface.mark_invalid();
        }
        if self.config.safe_mode {
            if let Err(err) = self.backend.wait_idle() {
                log::warn!("Safe mode idle wait failed: {err}");
            }
        }

        self.frames.advance();
        profiling::finish_frame!();
        Ok(())
    }

    /// Discard the frame being recorded without submitting it.
    pub fn abort_frame(&mut self) {
        if !self.frames.in_progress() {
            return;
        }
        let transition = self.passes.end_any();
        self.apply_transition(transition);
        self.frames.abort(&self.backend);
        log::debug!("frame {} aborted", self.frames.frame_index());
    }

    /// Block until the GPU finished all submitted work. No-op once poisoned.
    pub fn wait_idle(&self) -> RhiResult<()> {
        self.frames.wait_idle(&self.backend)
    }

    /// Request a surface rebuild at the next frame start.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.surface.request_resize(Extent2D::new(width, height));
    }

    fn rebuild_surface(&mut self, extent: Extent2D) -> RhiResult<()> {
        self.surface.rebuild(&self.backend, extent)?;
        if self.surface.generation().is_some() {
            let generation = self.surface.stamp().generation;
            self.bindings
                .get_mut()
                .select(BindingPoint::AmbientOcclusion, BindingSource::AmbientOcclusionTarget { generation });
        }
        Ok(())
    }

    fn write_frame_uniforms(&self) {
        let slot = self.frames.current();
        if let Err(err) = self.backend.write_buffer(&slot.uniforms, 0, bytes_of(&self.uniforms)) {
            log::warn!("Writing frame uniforms of slot {} failed: {err}", slot.index());
        }
    }

    fn sync_bindings(&mut self) {
        let slot = self.frames.current_index();
        let plan = self.bindings.get_mut().plan(slot);
        if plan.is_empty() {
            return;
        }
        self.write_bindings(slot, &plan.points);
        self.bindings.get_mut().mark_written(slot, &plan);
    }

    /// Write the selected source of every point in `points` into the slot's active table.
    fn write_bindings(&self, slot_index: usize, points: &[BindingPoint]) {
        let bindings = self.bindings.lock();
        let sources: SmallVec<[(BindingPoint, BindingSource); BindingPoint::COUNT]> =
            points.iter().map(|&point| (point, bindings.selected(point))).collect();
        drop(bindings);
        self.write_table(slot_index, &sources);
    }

    fn write_table(&self, slot_index: usize, sources: &[(BindingPoint, BindingSource)]) {
        let Some(fallback) = self.fallback.as_ref() else {
            return;
        };
        let slot = self.frames.slot(slot_index);
        let buffers = self.resources.buffers();
        let textures = self.resources.textures();

        let mut writes: SmallVec<[BindingWrite<'_, B>; BindingPoint::COUNT]> = SmallVec::new();
        for &(point, source) in sources {
            let resource = match source {
                BindingSource::SlotUniforms => BindingResource::Buffer(&slot.uniforms),
                BindingSource::Buffer(handle) => BindingResource::Buffer(
                    buffers.get(&handle).map_or(&fallback.buffer, |record| &record.native),
                ),
                BindingSource::Texture(handle) => BindingResource::Image(
                    textures.get(&handle).map_or(&fallback.texture, |record| &record.native),
                ),
                BindingSource::AmbientOcclusionTarget { .. } => BindingResource::Image(
                    self.surface
                        .generation()
                        .map_or(&fallback.texture, |generation| &generation.images.ambient_occlusion),
                ),
                BindingSource::ShadowMap => {
                    BindingResource::Image(self.surface.shadow().map_or(&fallback.texture, |shadow| &shadow.map))
                }
                BindingSource::Fallback if point.is_texture() => BindingResource::Image(&fallback.texture),
                BindingSource::Fallback => BindingResource::Buffer(&fallback.buffer),
            };
            writes.push(BindingWrite { point, resource });
        }

        self.backend.write_binding_table(slot.tables.active(), &writes);
    }

    // Passes

    pub fn begin_main_pass(&mut self) {
        self.begin_pass(ActivePass::Main);
    }

    pub fn end_main_pass(&mut self) {
        self.end_pass(PassKind::Main);
    }

    /// Render into one layer of the shadow cascade array.
    pub fn begin_shadow_pass(&mut self, cascade: u32) {
        let cascades = self.surface.shadow().map_or(0, |shadow| shadow.cascade_count());
        if cascade >= cascades {
            log::warn!("Shadow cascade {cascade} out of range ({cascades} cascades)");
            return;
        }
        self.begin_pass(ActivePass::Shadow { cascade });
    }

    pub fn end_shadow_pass(&mut self) {
        self.end_pass(PassKind::Shadow);
    }

    pub fn begin_geometry_pass(&mut self) {
        self.begin_pass(ActivePass::Geometry);
    }

    pub fn end_geometry_pass(&mut self) {
        self.end_pass(PassKind::Geometry);
    }

    pub fn begin_ambient_occlusion_pass(&mut self) {
        self.begin_pass(ActivePass::AmbientOcclusion);
    }

    pub fn end_ambient_occlusion_pass(&mut self) {
        self.end_pass(PassKind::AmbientOcclusion);
    }

    pub fn begin_ui_pass(&mut self) {
        self.begin_pass(ActivePass::Ui);
    }

    pub fn end_ui_pass(&mut self) {
        self.end_pass(PassKind::Ui);
    }

    fn begin_pass(&mut self, pass: ActivePass) {
        if !self.frames.in_progress() {
            log::trace!("{:?} pass outside a frame ignored", pass);
            return;
        }
        let transition = self.passes.begin(pass);
        self.apply_transition(transition);
    }

    fn end_pass(&mut self, kind: PassKind) {
        if !self.frames.in_progress() {
            return;
        }
        let transition = self.passes.end(kind);
        self.apply_transition(transition);
    }

    /// Replay a pass transition against the command stream.
    fn apply_transition(&mut self, transition: PassTransition) {
        if transition.is_noop() {
            return;
        }
        if transition.closed.is_some() {
            self.backend.cmd_end_pass(&self.frames.current().commands);
        }
        let Some(opened) = transition.opened else {
            return;
        };

        let Some((target, extent)) = self.surface.target(opened) else {
            log::warn!("No render target for {:?}", opened);
            self.passes.reset();
            return;
        };
        let stream = &self.frames.current().commands;
        self.backend.cmd_begin_pass(stream, target, &self.clear);

        let viewport = match (opened, self.viewport) {
            (ActivePass::Main | ActivePass::Ui, Some(viewport)) => viewport,
            _ => Viewport::full(extent),
        };
        self.backend.cmd_set_viewport(stream, &viewport);
    }

    // State

    /// Viewport used by the main and UI passes instead of the full surface.
    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = Some(viewport);
        if self.frames.in_progress()
            && matches!(self.passes.active(), Some(ActivePass::Main | ActivePass::Ui))
        {
            self.backend.cmd_set_viewport(&self.frames.current().commands, &viewport);
        }
    }

    pub fn reset_viewport(&mut self) {
        self.viewport = None;
    }

    /// Clear color of passes that begin from now on.
    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear.color = color;
    }

    pub fn set_global_uniforms(&mut self, uniforms: &GlobalUniforms) {
        self.uniforms.global = *uniforms;
        self.refresh_recording_uniforms();
    }

    pub fn set_cascade_uniforms(&mut self, cascade: u32, uniforms: &CascadeUniforms) {
        if cascade as usize >= MAX_SHADOW_CASCADES || cascade >= self.config.shadow_cascades {
            log::warn!("Cascade uniforms for cascade {cascade} out of range");
            return;
        }
        self.uniforms.cascades[cascade as usize] = *uniforms;
        self.refresh_recording_uniforms();
    }

    /// The slot being recorded is not in use by the GPU, so its uniforms can follow along.
    fn refresh_recording_uniforms(&self) {
        if self.frames.in_progress() {
            self.write_frame_uniforms();
        }
    }

    /// Select a material texture. [`TextureHandle::NONE`] selects the white fallback.
    ///
    /// Takes effect from the next frame of every slot.
    pub fn set_texture(&mut self, point: BindingPoint, handle: TextureHandle) {
        if !matches!(
            point,
            BindingPoint::ColorTexture | BindingPoint::NormalMap | BindingPoint::RoughnessMap
        ) {
            log::warn!("{:?} is not a material texture binding", point);
            return;
        }
        if !handle.is_none() && !self.resources.contains_texture(handle) {
            log::trace!("unknown texture {:?} ignored", handle);
            return;
        }
        self.bindings.get_mut().select(point, BindingSource::from_texture(handle));
    }

    /// Select the per-instance data buffer. Draws recorded from now on in the current frame
    /// read it; draws recorded earlier keep what they were recorded with.
    pub fn set_instance_buffer(&mut self, handle: BufferHandle) {
        if !handle.is_none() && !self.resources.contains_buffer(handle) {
            log::trace!("unknown instance buffer {:?} ignored", handle);
            return;
        }
        self.bindings
            .get_mut()
            .select(BindingPoint::InstanceData, BindingSource::from_buffer(handle));

        if self.frames.in_progress() && !self.frames.is_poisoned() {
            if let Err(err) = self.patch_instance_data() {
                log::error!("Switching instance data failed: {err}");
            }
        }
    }

    /// Point the slot's active binding table at the selected instance data.
    ///
    /// A table already bound in this frame is left alone; the switch moves to a fresh table
    /// carrying every binding.
    fn patch_instance_data(&mut self) -> RhiResult<()> {
        let slot = self.frames.current_index();
        let selected = self.bindings.get_mut().selected(BindingPoint::InstanceData);
        let tables = &mut self.frames.current_mut().tables;
        if tables.instance() == Some(selected) {
            return Ok(());
        }

        if tables.is_bound() {
            tables.advance(&self.backend)?;
            // Other points keep what the frame started with.
            let bindings = self.bindings.get_mut();
            let sources: SmallVec<[(BindingPoint, BindingSource); BindingPoint::COUNT]> = BindingPoint::ALL
                .iter()
                .map(|&point| {
                    let source = match point {
                        BindingPoint::InstanceData => selected,
                        _ => bindings.reflected(slot, point).unwrap_or_else(|| bindings.selected(point)),
                    };
                    (point, source)
                })
                .collect();
            self.write_table(slot, &sources);
        } else {
            self.write_bindings(slot, &[BindingPoint::InstanceData]);
            if self.frames.current().tables.active_index() == 0 {
                self.bindings.get_mut().mark_patched(slot, BindingPoint::InstanceData);
            }
        }
        self.frames.current_mut().tables.set_instance(Some(selected));
        Ok(())
    }

    // Draws

    pub fn draw(&mut self, variant: PipelineVariant, vertex_buffer: BufferHandle, vertex_count: u32, model: &ModelUniforms) {
        self.record_draw(
            variant,
            vertex_buffer,
            None,
            model,
            DrawCall::Direct(DrawCommand::Draw {
                vertex_count,
                instance_count: 1,
                first_vertex: 0,
                first_instance: 0,
            }),
        );
    }

    pub fn draw_indexed(
        &mut self,
        variant: PipelineVariant,
        vertex_buffer: BufferHandle,
        index_buffer: BufferHandle,
        index_count: u32,
        model: &ModelUniforms,
    ) {
        self.record_draw(
            variant,
            vertex_buffer,
            Some(index_buffer),
            model,
            DrawCall::Direct(DrawCommand::Indexed {
                index_count,
                instance_count: 1,
                first_index: 0,
                vertex_offset: 0,
                first_instance: 0,
            }),
        );
    }

    /// Draw `instance_count` instances reading per-instance data from `instance_buffer`.
    pub fn draw_instanced(
        &mut self,
        variant: PipelineVariant,
        vertex_buffer: BufferHandle,
        vertex_count: u32,
        instance_buffer: BufferHandle,
        instance_count: u32,
        model: &ModelUniforms,
    ) {
        if !self.frames.in_progress() {
            return;
        }
        if !instance_buffer.is_none() && !self.resources.contains_buffer(instance_buffer) {
            log::trace!("instanced draw with unknown instance buffer ignored");
            return;
        }
        self.set_instance_buffer(instance_buffer);
        let selected = BindingSource::from_buffer(instance_buffer);
        if self.frames.current().tables.instance() != Some(selected) {
            log::warn!("instanced draw skipped: instance data could not be bound");
            return;
        }
        self.record_draw(
            variant,
            vertex_buffer,
            None,
            model,
            DrawCall::Direct(DrawCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex: 0,
                first_instance: 0,
            }),
        );
    }

    /// Draw with parameters read by the GPU from `indirect_buffer` at `offset`.
    pub fn draw_indirect(
        &mut self,
        variant: PipelineVariant,
        vertex_buffer: BufferHandle,
        indirect_buffer: BufferHandle,
        offset: u64,
        draw_count: u32,
        model: &ModelUniforms,
    ) {
        if draw_count == 0 {
            return;
        }
        let size = if indirect_buffer.is_none() {
            Some(FALLBACK_BUFFER_SIZE)
        } else {
            self.resources.buffer_desc(indirect_buffer).map(|desc| desc.size)
        };
        // Unknown buffers are rejected when the draw is recorded.
        if let Some(size) = size {
            let in_range = offset
                .checked_add(u64::from(draw_count) * u64::from(DRAW_INDIRECT_STRIDE))
                .is_some_and(|end| end <= size);
            if !in_range {
                log::trace!(
                    "indirect draw of {draw_count} records at offset {offset} overruns {:?} of {size} bytes",
                    indirect_buffer
                );
                return;
            }
        }
        self.record_draw(
            variant,
            vertex_buffer,
            None,
            model,
            DrawCall::Indirect {
                buffer: indirect_buffer,
                offset,
                draw_count,
            },
        );
    }

    /// Open the default pass if needed; `false` when `variant` cannot draw into the active pass.
    fn prepare_draw(&mut self, variant: PipelineVariant) -> bool {
        if !self.frames.in_progress() {
            log::trace!("{:?} draw outside a frame ignored", variant);
            return false;
        }
        let transition = self.passes.ensure_open();
        self.apply_transition(transition);

        match self.passes.active() {
            Some(pass) if pass.kind() == variant.pass() => true,
            active => {
                log::trace!("{:?} draw ignored in {:?}", variant, active);
                false
            }
        }
    }

    fn record_draw(
        &mut self,
        variant: PipelineVariant,
        vertex_buffer: BufferHandle,
        index_buffer: Option<BufferHandle>,
        model: &ModelUniforms,
        call: DrawCall,
    ) {
        if !self.prepare_draw(variant) {
            return;
        }
        let Some(fallback) = self.fallback.as_ref() else {
            return;
        };

        let buffers = self.resources.buffers();
        let resolve = |handle: BufferHandle| {
            if handle.is_none() {
                Some(&fallback.buffer)
            } else {
                buffers.get(&handle).map(|record| &record.native)
            }
        };

        let Some(vertex) = resolve(vertex_buffer) else {
            log::trace!("draw with unknown vertex buffer {:?} ignored", vertex_buffer);
            return;
        };
        let index = match index_buffer.map(resolve) {
            None => None,
            Some(Some(index)) => Some(index),
            Some(None) => {
                log::trace!("draw with unknown index buffer ignored");
                return;
            }
        };
        let indirect = match &call {
            DrawCall::Direct(_) => None,
            DrawCall::Indirect { buffer, .. } => match resolve(*buffer) {
                Some(native) => Some(native),
                None => {
                    log::trace!("draw with unknown indirect buffer {:?} ignored", buffer);
                    return;
                }
            },
        };

        let slot = self.frames.current();
        let stream = &slot.commands;
        if !self.backend.cmd_bind_pipeline(stream, variant) {
            log::trace!("no pipeline registered for {:?}", variant);
            return;
        }
        self.backend.cmd_bind_binding_table(stream, variant, slot.tables.active());
        self.backend.cmd_push_model(stream, variant, bytes_of(model));
        self.backend.cmd_bind_vertex_buffer(stream, vertex);
        if let Some(index) = index {
            self.backend.cmd_bind_index_buffer(stream, index);
        }

        match (call, indirect) {
            (DrawCall::Direct(command), _) => self.backend.cmd_draw(stream, command),
            (DrawCall::Indirect { offset, draw_count, .. }, Some(native)) => {
                self.backend
                    .cmd_draw_indirect(stream, native, offset, draw_count, DRAW_INDIRECT_STRIDE)
            }
            (DrawCall::Indirect { .. }, None) => {}
        }
        self.frames.current_mut().tables.mark_bound();
    }
}

impl<B: RenderBackend> Drop for RenderDevice<B> {
    fn drop(&mut self) {
        if self.frames.is_poisoned() {
            log::error!("Render device dropped after a GPU hang; GPU objects are leaked");
            self.frames.abandon();
            self.surface.abandon();
            std::mem::forget(self.fallback.take());
            std::mem::forget(self.resources.drain());
            return;
        }

        self.abort_frame();
        if let Err(err) = self.backend.wait_idle() {
            log::error!("Idle wait at shutdown failed: {err}");
        }

        self.frames.destroy(&self.backend);
        let (buffers, textures) = self.resources.drain();
        for record in buffers {
            self.backend.destroy_buffer(record.native);
        }
        for record in textures {
            self.backend.destroy_image(record.native);
        }
        self.surface.destroy(&self.backend);
        if let Some(fallback) = self.fallback.take() {
            fallback.destroy(&self.backend);
        }

        log::info!("Render device destroyed");
    }
}
