use keel_core::log;

use crate::backend::RenderBackend;
use crate::binding::BindingSource;
use crate::config::RhiConfig;
use crate::defer_release::DeferReleaseQueue;
use crate::pipeline::FrameUniforms;
use crate::resource::BufferDesc;
use crate::upload::TransientArena;
use crate::RhiResult;

/// Binding tables of one ring slot.
///
/// Table 0 mirrors the bindings the synchronizer reflects for the slot. Switching the
/// instance data after the active table was bound moves to the next table instead of
/// rewriting one that earlier draws of the frame still read. Extra tables are kept and
/// reused the next time the slot records.
pub struct SlotTables<B: RenderBackend> {
    tables: Vec<B::BindingTable>,
    active: usize,
    bound: bool,
    /// Instance data held by the active table.
    instance: Option<BindingSource>,
}

impl<B: RenderBackend> SlotTables<B> {
    pub fn new(backend: &B) -> RhiResult<Self> {
        Ok(Self {
            tables: vec![backend.create_binding_table()?],
            active: 0,
            bound: false,
            instance: None,
        })
    }

    #[inline]
    pub fn base(&self) -> &B::BindingTable {
        &self.tables[0]
    }

    #[inline]
    pub fn active(&self) -> &B::BindingTable {
        &self.tables[self.active]
    }

    #[inline]
    pub fn active_index(&self) -> usize {
        self.active
    }

    /// Tables created for this slot so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// The active table was bound in the stream being recorded.
    #[inline]
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    #[inline]
    pub fn instance(&self) -> Option<BindingSource> {
        self.instance
    }

    pub(crate) fn mark_bound(&mut self) {
        self.bound = true;
    }

    pub(crate) fn set_instance(&mut self, source: Option<BindingSource>) {
        self.instance = source;
    }

    /// Start a new frame on the base table.
    pub(crate) fn rewind(&mut self) {
        self.active = 0;
        self.bound = false;
        self.instance = None;
    }

    /// Make an unbound table active, creating one when every table is taken.
    pub(crate) fn advance(&mut self, backend: &B) -> RhiResult<()> {
        let next = self.active + 1;
        if next == self.tables.len() {
            self.tables.push(backend.create_binding_table()?);
            log::debug!("binding table pool grew to {}", self.tables.len());
        }
        self.active = next;
        self.bound = false;
        self.instance = None;
        Ok(())
    }

    pub fn destroy(self, backend: &B) {
        for table in self.tables {
            backend.destroy_binding_table(table);
        }
    }
}

/// One of the N parallel frame contexts. Reused every N frames, only after its fence has
/// been observed signaled.
pub struct RingSlot<B: RenderBackend> {
    pub(crate) index: usize,
    pub(crate) fence: B::Fence,
    pub(crate) image_acquired: B::Semaphore,
    pub(crate) render_finished: B::Semaphore,
    pub(crate) commands: B::CommandStream,
    /// Staged copies of the frame; submitted ahead of `commands`.
    pub(crate) uploads: B::CommandStream,
    /// Copies recorded into `uploads` this frame. The stream is open while non-zero.
    pub(crate) staged: usize,
    pub(crate) arena: TransientArena<B>,
    pub(crate) release_queue: DeferReleaseQueue<B>,
    pub(crate) uniforms: B::Buffer,
    pub(crate) tables: SlotTables<B>,
}

impl<B: RenderBackend> RingSlot<B> {
    pub fn new(backend: &B, config: &RhiConfig, index: usize) -> RhiResult<Self> {
        // Signaled so the very first wait on this slot returns immediately.
        let fence = backend.create_fence(true)?;
        let image_acquired = backend.create_semaphore()?;
        let render_finished = backend.create_semaphore()?;
        let commands = backend.create_command_stream()?;
        let uploads = backend.create_command_stream()?;
        let arena = TransientArena::new(backend, config.transient_arena_size, config.upload_alignment)?;
        let uniforms = backend.create_buffer(&BufferDesc::uniform(
            &format!("frame_uniforms_{index}"),
            FrameUniforms::SIZE,
        ))?;
        let tables = SlotTables::new(backend)?;

        Ok(Self {
            index,
            fence,
            image_acquired,
            render_finished,
            commands,
            uploads,
            staged: 0,
            arena,
            release_queue: DeferReleaseQueue::new(),
            uniforms,
            tables,
        })
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn release_queue(&self) -> &DeferReleaseQueue<B> {
        &self.release_queue
    }

    #[inline]
    pub fn arena(&self) -> &TransientArena<B> {
        &self.arena
    }

    #[inline]
    pub fn tables(&self) -> &SlotTables<B> {
        &self.tables
    }

    /// Close the upload stream without submitting it.
    pub(crate) fn discard_uploads(&mut self, backend: &B) {
        if std::mem::take(&mut self.staged) > 0 {
            if let Err(err) = backend.end_commands(&self.uploads) {
                log::warn!("closing discarded upload stream of slot {} failed: {err}", self.index);
            }
        }
    }

    /// Replace the fence with a fresh one. The old fence is destroyed only once the new one
    /// exists.
    pub fn recreate_fence(&mut self, backend: &B, signaled: bool) -> RhiResult<()> {
        let fence = backend.create_fence(signaled)?;
        backend.destroy_fence(std::mem::replace(&mut self.fence, fence));
        Ok(())
    }

    pub fn recreate_image_acquired(&mut self, backend: &B) -> RhiResult<()> {
        let semaphore = backend.create_semaphore()?;
        backend.destroy_semaphore(std::mem::replace(&mut self.image_acquired, semaphore));
        Ok(())
    }

    pub fn recreate_render_finished(&mut self, backend: &B) -> RhiResult<()> {
        let semaphore = backend.create_semaphore()?;
        backend.destroy_semaphore(std::mem::replace(&mut self.render_finished, semaphore));
        Ok(())
    }

    /// Fresh signaled fence and both semaphores after a frame that never reached the GPU.
    pub fn reset_sync(&mut self, backend: &B) -> RhiResult<()> {
        self.recreate_fence(backend, true)?;
        self.recreate_image_acquired(backend)?;
        self.recreate_render_finished(backend)
    }

    /// Destroy everything the slot owns. The GPU must be idle.
    pub fn destroy(self, backend: &B) {
        self.release_queue.release_all(backend);
        self.tables.destroy(backend);
        backend.destroy_buffer(self.uniforms);
        self.arena.destroy(backend);
        backend.destroy_command_stream(self.uploads);
        backend.destroy_command_stream(self.commands);
        backend.destroy_semaphore(self.render_finished);
        backend.destroy_semaphore(self.image_acquired);
        backend.destroy_fence(self.fence);
    }
}
