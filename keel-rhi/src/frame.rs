//! Ring-slot frame pacing.
//!
//! The scheduler owns the N ring slots and decides when a slot may be reused: only after its
//! fence has been observed signaled within the bounded wait. A wait that expires means the
//! GPU is hung; the scheduler then invokes the fatal handler once and refuses every further
//! GPU interaction.

use keel_core::log;

use crate::backend::{AcquireOutcome, Extent2D, FenceWait, PresentOutcome, RenderBackend};
use crate::config::RhiConfig;
use crate::defer_release::DeferredObject;
use crate::synchronization::RingSlot;
use crate::{RhiError, RhiResult};

/// Why `begin_frame` produced no frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The window has zero area.
    SurfaceMinimized,
    /// The surface had to be rebuilt.
    SurfaceOutOfDate,
    /// The surface went away; it is rebuilt at the next frame.
    SurfaceLost,
    AcquireTimeout,
    AcquireFailed,
    /// Building the next surface generation failed; retried next frame.
    SurfaceRebuildFailed,
}

/// Identifies a frame being recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    /// Monotonic frame counter.
    pub frame_index: u64,
    pub slot: usize,
    pub image_index: u32,
    pub extent: Extent2D,
    pub generation: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Started(FrameInfo),
    Skipped(SkipReason),
    AlreadyInProgress,
}

impl FrameStatus {
    #[inline]
    pub fn is_started(&self) -> bool {
        matches!(self, FrameStatus::Started(_))
    }
}

/// Output of [`FrameScheduler::acquire`].
pub(crate) enum AcquireStep {
    Acquired { image_index: u32, suboptimal: bool },
    Skip(SkipReason),
}

/// Output of [`FrameScheduler::present`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PresentStep {
    Presented,
    /// Presented, but the surface should be rebuilt.
    Stale,
}

pub struct FrameScheduler<B: RenderBackend> {
    slots: Vec<RingSlot<B>>,
    current: usize,
    frame_index: u64,
    /// Output image of the frame being recorded.
    recording: Option<u32>,
    poisoned: bool,
}

impl<B: RenderBackend> FrameScheduler<B> {
    pub fn new(backend: &B, config: &RhiConfig) -> RhiResult<Self> {
        let mut slots = Vec::with_capacity(config.frames_in_flight);
        for index in 0..config.frames_in_flight {
            match RingSlot::new(backend, config, index) {
                Ok(slot) => slots.push(slot),
                Err(err) => {
                    for slot in slots {
                        slot.destroy(backend);
                    }
                    return Err(err);
                }
            }
        }

        Ok(Self {
            slots,
            current: 0,
            frame_index: 0,
            recording: None,
            poisoned: false,
        })
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn current_index(&self) -> usize {
        self.current
    }

    #[inline]
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    #[inline]
    pub fn in_progress(&self) -> bool {
        self.recording.is_some()
    }

    #[inline]
    pub fn image_index(&self) -> Option<u32> {
        self.recording
    }

    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    #[inline]
    pub fn slot(&self, index: usize) -> &RingSlot<B> {
        &self.slots[index]
    }

    #[inline]
    pub fn current(&self) -> &RingSlot<B> {
        &self.slots[self.current]
    }

    #[inline]
    pub(crate) fn current_mut(&mut self) -> &mut RingSlot<B> {
        &mut self.slots[self.current]
    }

    /// Slot whose next fence wait covers every submission that may still reference an
    /// object released now.
    pub fn release_slot(&self) -> usize {
        if self.in_progress() {
            self.current
        } else {
            (self.current + self.slots.len() - 1) % self.slots.len()
        }
    }

    /// Queue `object` for destruction once the GPU can no longer reference it.
    ///
    /// Falls back to an idle wait and an immediate free when the queue cannot grow.
    pub fn release(&self, backend: &B, object: DeferredObject<B>) {
        let slot = self.release_slot();
        if let Err(object) = self.slots[slot].release_queue.push(object) {
            log::warn!("deferred release queue of slot {slot} cannot grow, freeing after idle wait");
            if self.poisoned {
                std::mem::forget(object);
                return;
            }
            match backend.wait_idle() {
                Ok(()) => object.destroy(backend),
                Err(err) => {
                    log::error!("idle wait failed, leaking released object: {err}");
                    std::mem::forget(object);
                }
            }
        }
    }

    /// Block until the current slot's previous submission completed.
    pub(crate) fn wait_current(&mut self, backend: &B, config: &RhiConfig) -> RhiResult<()> {
        if self.poisoned {
            return Err(RhiError::DeviceLost);
        }
        profiling::scope!("FrameScheduler::wait_current");

        let slot = &self.slots[self.current];
        let fatal = match backend.wait_fence(&slot.fence, config.fence_timeout) {
            Ok(FenceWait::Signaled) => return Ok(()),
            Ok(FenceWait::TimedOut) => RhiError::GpuHang {
                slot: self.current,
                timeout: config.fence_timeout,
            },
            Err(err) => err,
        };

        self.poisoned = true;
        log::error!("ring slot {} fence wait failed: {fatal}", self.current);
        (config.fatal_handler)(&fatal);
        Err(fatal)
    }

    /// Free what the current slot's last frame released.
    pub(crate) fn reclaim_current(&mut self, backend: &B) -> usize {
        let slot = &mut self.slots[self.current];
        let freed = slot.release_queue.release_all(backend);
        if freed > 0 {
            log::trace!("slot {} reclaimed {freed} objects", self.current);
        }
        freed
    }

    pub(crate) fn acquire(&mut self, backend: &B, config: &RhiConfig) -> AcquireStep {
        let index = self.current;
        let slot = &mut self.slots[index];
        match backend.acquire_image(&slot.image_acquired, config.acquire_timeout) {
            AcquireOutcome::Acquired { image_index, suboptimal } => {
                AcquireStep::Acquired { image_index, suboptimal }
            }
            AcquireOutcome::OutOfDate => {
                log::debug!("acquire: surface out of date");
                recreate_or_warn(slot.recreate_image_acquired(backend), index);
                AcquireStep::Skip(SkipReason::SurfaceOutOfDate)
            }
            AcquireOutcome::SurfaceLost => {
                log::warn!("acquire: surface lost");
                recreate_or_warn(slot.recreate_image_acquired(backend), index);
                AcquireStep::Skip(SkipReason::SurfaceLost)
            }
            AcquireOutcome::Timeout => {
                log::warn!("acquire timed out after {:?}", config.acquire_timeout);
                if let Err(err) = backend.wait_idle() {
                    log::warn!("idle wait after acquire timeout failed: {err}");
                }
                recreate_or_warn(slot.recreate_image_acquired(backend), index);
                AcquireStep::Skip(SkipReason::AcquireTimeout)
            }
            AcquireOutcome::Failed(err) => {
                log::warn!("acquire failed: {err}");
                if let Err(err) = backend.wait_idle() {
                    log::warn!("idle wait after failed acquire failed: {err}");
                }
                recreate_or_warn(slot.recreate_image_acquired(backend), index);
                AcquireStep::Skip(SkipReason::AcquireFailed)
            }
        }
    }

    /// Reset the fence, rewind the arena and start recording into the current slot.
    pub(crate) fn open(&mut self, backend: &B, image_index: u32) -> RhiResult<()> {
        let index = self.current;
        let slot = &mut self.slots[index];
        let opened = backend
            .reset_fence(&slot.fence)
            .and_then(|()| backend.begin_commands(&slot.commands));
        if let Err(err) = opened {
            // The fence may be reset with nothing left to signal it, and the acquired
            // semaphore would stay signaled with no waiter.
            recreate_or_warn(slot.recreate_fence(backend, true), index);
            recreate_or_warn(slot.recreate_image_acquired(backend), index);
            return Err(err);
        }
        slot.arena.reset();
        slot.tables.rewind();
        slot.staged = 0;
        self.recording = Some(image_index);
        Ok(())
    }

    /// Close and submit the current slot's commands.
    ///
    /// On failure the frame is abandoned: the GPU is drained and the slot's synchronization
    /// objects are replaced so the next use starts from a known state.
    pub(crate) fn submit(&mut self, backend: &B) -> RhiResult<()> {
        let index = self.current;
        let slot = &mut self.slots[index];
        let result = submit_slot(backend, slot);

        if let Err(err) = result {
            log::error!("frame submission on slot {index} failed: {err}");
            if let Err(idle) = backend.wait_idle() {
                log::warn!("idle wait after failed submission failed: {idle}");
            }
            recreate_or_warn(slot.reset_sync(backend), index);
            self.recording = None;
            return Err(err);
        }
        Ok(())
    }

    pub(crate) fn present(&mut self, backend: &B) -> PresentStep {
        let index = self.current;
        let Some(image_index) = self.recording else {
            return PresentStep::Presented;
        };
        let slot = &mut self.slots[index];

        let failure = match backend.present(image_index, &slot.render_finished) {
            PresentOutcome::Presented => return PresentStep::Presented,
            PresentOutcome::Suboptimal => return PresentStep::Stale,
            PresentOutcome::OutOfDate => "surface out of date".to_owned(),
            PresentOutcome::SurfaceLost => "surface lost".to_owned(),
            PresentOutcome::Failed(err) => err.to_string(),
        };

        log::warn!("present failed: {failure}");
        if let Err(err) = backend.wait_idle() {
            log::warn!("idle wait after failed present failed: {err}");
        }
        recreate_or_warn(slot.recreate_render_finished(backend), index);
        PresentStep::Stale
    }

    /// Close the frame and move on to the next slot.
    pub(crate) fn advance(&mut self) {
        self.recording = None;
        self.frame_index += 1;
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Drop the frame being recorded without submitting it.
    pub(crate) fn abort(&mut self, backend: &B) {
        let index = self.current;
        let slot = &mut self.slots[index];
        slot.discard_uploads(backend);
        if let Err(err) = backend.end_commands(&slot.commands) {
            log::warn!("closing aborted command stream failed: {err}");
        }
        // The replacement fence starts signaled, so the next wait on this slot no longer
        // covers earlier frames still using objects released during this one.
        if let Err(err) = backend.wait_idle() {
            log::warn!("idle wait after aborted frame failed: {err}");
        }
        recreate_or_warn(slot.reset_sync(backend), index);
        self.recording = None;
    }

    pub(crate) fn wait_idle(&self, backend: &B) -> RhiResult<()> {
        if self.poisoned {
            return Ok(());
        }
        backend.wait_idle()
    }

    /// Destroy every slot. The GPU must be idle.
    pub(crate) fn destroy(&mut self, backend: &B) {
        for slot in self.slots.drain(..) {
            slot.destroy(backend);
        }
    }

    /// Drop ownership of every slot without touching the backend.
    pub(crate) fn abandon(&mut self) {
        std::mem::forget(std::mem::take(&mut self.slots));
    }
}

/// Close the slot's streams and submit them, uploads first.
fn submit_slot<B: RenderBackend>(backend: &B, slot: &mut RingSlot<B>) -> RhiResult<()> {
    let staged = std::mem::take(&mut slot.staged);
    if staged == 0 {
        backend.end_commands(&slot.commands)?;
        return backend.submit(&[&slot.commands], &slot.image_acquired, &slot.render_finished, &slot.fence);
    }

    backend.cmd_transfer_barrier(&slot.uploads);
    backend.end_commands(&slot.uploads)?;
    backend.end_commands(&slot.commands)?;
    log::trace!("slot {} submits {staged} staged copies", slot.index);
    backend.submit(
        &[&slot.uploads, &slot.commands],
        &slot.image_acquired,
        &slot.render_finished,
        &slot.fence,
    )
}

fn recreate_or_warn(result: RhiResult<()>, slot: usize) {
    if let Err(err) = result {
        log::warn!("recreating synchronization objects of slot {slot} failed: {err}");
    }
}
