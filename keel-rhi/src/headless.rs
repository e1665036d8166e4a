//! Software backend with a simulated GPU timeline.
//!
//! Nothing is rendered. Every call is recorded in order, command streams collect the objects
//! they reference, and a submitted batch only "executes" when its fence is waited on or the
//! device is idled, so the simulated GPU lags as far behind the CPU as the synchronization
//! allows. Misuse that would be undefined behavior on a real GPU is reported as a
//! [`Violation`] instead of crashing, which lets tests assert on whole frame sequences.
//!
//! Staged copies move bytes between simulated memories when their batch executes, so data
//! written through the transient arena can be checked byte for byte.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use keel_core::collections::{HashMap, HashSet, SmallVec};
use keel_core::log;
use parking_lot::Mutex;

use crate::backend::{
    AcquireOutcome, BindingResource, BindingWrite, ClearValues, ColorTarget, DrawCommand, Extent2D, FenceWait,
    PresentOutcome, RenderBackend, RenderTargetDesc, Viewport,
};
use crate::binding::BindingPoint;
use crate::pass::PassKind;
use crate::pipeline::PipelineVariant;
use crate::resource::{BufferDesc, TextureDesc};
use crate::{RhiError, RhiResult};

pub type ObjectId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Buffer,
    Image,
    Fence,
    Semaphore,
    CommandStream,
    Staging,
    RenderTarget,
    BindingTable,
}

macro_rules! headless_object {
    ($name:ident { $($field:ident: $ty:ty),* $(,)? }) => {
        #[derive(Debug)]
        pub struct $name {
            id: ObjectId,
            $($field: $ty,)*
        }

        impl $name {
            #[inline]
            pub fn id(&self) -> ObjectId {
                self.id
            }
        }
    };
}

headless_object!(HeadlessBuffer { size: u64, host_visible: bool });
headless_object!(HeadlessImage { byte_size: u64 });
headless_object!(HeadlessFence {});
headless_object!(HeadlessSemaphore {});
headless_object!(HeadlessCommandStream {});
headless_object!(HeadlessStaging { capacity: u64 });
headless_object!(HeadlessRenderTarget {
    kind: PassKind,
    attachments: SmallVec<[ObjectId; 2]>,
});
headless_object!(HeadlessBindingTable {});

impl HeadlessBuffer {
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl HeadlessRenderTarget {
    pub fn kind(&self) -> PassKind {
        self.kind
    }
}

/// One recorded backend call.
#[derive(Clone, Debug, PartialEq)]
pub enum BackendCall {
    Create { id: ObjectId, kind: ObjectKind },
    Destroy { id: ObjectId, kind: ObjectKind },
    WaitFence { fence: ObjectId, signaled: bool },
    ResetFence { fence: ObjectId },
    WaitIdle,
    BeginCommands { stream: ObjectId },
    BeginUploadCommands { stream: ObjectId },
    EndCommands { stream: ObjectId },
    /// `streams` in execution order.
    Submit { streams: Vec<ObjectId>, batch: u64, fence: ObjectId },
    Acquire { image_index: Option<u32> },
    Present { image_index: u32 },
    RecreateSurface { extent: Extent2D },
    WriteBuffer { buffer: ObjectId, offset: u64, len: u64 },
    WriteStaging { staging: ObjectId, offset: u64, len: u64 },
    UploadBlocking { target: ObjectId, len: u64 },
    WriteBindingTable { table: ObjectId, points: Vec<BindingPoint> },
    CopyToBuffer { stream: ObjectId, staging: ObjectId, src_offset: u64, dst: ObjectId, dst_offset: u64, size: u64 },
    CopyToImage { stream: ObjectId, staging: ObjectId, src_offset: u64, dst: ObjectId },
    TransferBarrier { stream: ObjectId },
    BeginPass { target: ObjectId, kind: PassKind, clear: [f32; 4] },
    EndPass,
    SetViewport { width: f32, height: f32 },
    BindPipeline { variant: PipelineVariant },
    BindBindingTable { table: ObjectId },
    PushModel { len: usize },
    BindVertexBuffer { buffer: ObjectId },
    BindIndexBuffer { buffer: ObjectId },
    Draw(DrawCommand),
    DrawIndirect { buffer: ObjectId, offset: u64, draw_count: u32 },
}

impl BackendCall {
    /// Calls that would be executed by or wait on the GPU queue.
    pub fn touches_gpu(&self) -> bool {
        !matches!(self, BackendCall::Create { .. } | BackendCall::Destroy { .. })
    }
}

/// Misuse a real driver would not report reliably.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Violation {
    /// Destroyed while a submitted, unfinished batch references it.
    FreedWhileInFlight { object: ObjectId, batch: u64 },
    /// Destroyed while referenced by a command stream that is still recording.
    FreedWhileRecording { object: ObjectId, stream: ObjectId },
    UseOfDestroyed { object: ObjectId, call: &'static str },
    NestedPass { stream: ObjectId },
    EndPassWithoutPass { stream: ObjectId },
    DrawOutsidePass { stream: ObjectId },
    TransferInsidePass { stream: ObjectId, call: &'static str },
    RecordingOutsideStream { stream: ObjectId, call: &'static str },
    PassLeftOpen { stream: ObjectId },
    SubmitWhileRecording { stream: ObjectId },
    StreamReusedInFlight { stream: ObjectId },
    FenceResetInFlight { fence: ObjectId },
    FenceNotReset { fence: ObjectId },
    FenceNeverSignaled { fence: ObjectId },
    SemaphoreDoubleSignal { semaphore: ObjectId },
    SemaphoreWaitUnsignaled { semaphore: ObjectId },
    TableWrittenInFlight { table: ObjectId },
    /// Written while a stream that is still recording has it bound; earlier draws in that
    /// stream would see the new content.
    TableWrittenWhileBound { table: ObjectId, stream: ObjectId },
    /// A pass or draw recorded into a stream opened for uploads only.
    RenderingInUploadStream { stream: ObjectId },
    StagingOverwrittenInFlight { staging: ObjectId, offset: u64, len: u64 },
}

/// Outcome forced on the next `acquire_image`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptedAcquire {
    Suboptimal,
    OutOfDate,
    SurfaceLost,
    Timeout,
    Error,
}

/// Outcome forced on the next `present`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptedPresent {
    Suboptimal,
    OutOfDate,
    SurfaceLost,
    Error,
}

#[derive(Clone, Copy, Debug)]
struct StagedCopy {
    staging: ObjectId,
    src_offset: u64,
    dst: ObjectId,
    dst_offset: u64,
    size: u64,
}

#[derive(Default)]
struct StreamState {
    recording: bool,
    upload_only: bool,
    in_pass: bool,
    refs: HashSet<ObjectId>,
    copies: Vec<StagedCopy>,
    in_flight: Option<u64>,
}

#[derive(Default)]
struct FenceState {
    signaled: bool,
    batch: Option<u64>,
}

struct Batch {
    id: u64,
    fence: ObjectId,
    streams: SmallVec<[ObjectId; 2]>,
    refs: HashSet<ObjectId>,
    copies: Vec<StagedCopy>,
}

struct State {
    next_id: ObjectId,
    next_batch: u64,
    calls: Vec<BackendCall>,
    violations: Vec<Violation>,
    live: HashMap<ObjectId, ObjectKind>,
    destroyed: HashSet<ObjectId>,
    /// Freed object and the call index of its destruction.
    freed: Vec<(ObjectId, usize)>,
    fences: HashMap<ObjectId, FenceState>,
    semaphores: HashMap<ObjectId, bool>,
    streams: HashMap<ObjectId, StreamState>,
    /// Submitted batches that have not executed yet, in submission order.
    batches: VecDeque<Batch>,
    completed_batches: u64,
    memory: HashMap<ObjectId, Vec<u8>>,
    tables: HashMap<ObjectId, HashMap<BindingPoint, ObjectId>>,
    window: Extent2D,
    surface: Extent2D,
    image_count: u32,
    next_image: u32,
    acquire_script: VecDeque<ScriptedAcquire>,
    present_script: VecDeque<ScriptedPresent>,
    hung: bool,
    failing_submits: u32,
    failing_fence_resets: u32,
    failing_allocations: bool,
    missing_pipelines: HashSet<PipelineVariant>,
}

impl State {
    fn new(window: Extent2D) -> Self {
        Self {
            next_id: 1,
            next_batch: 1,
            calls: Vec::new(),
            violations: Vec::new(),
            live: HashMap::default(),
            destroyed: HashSet::default(),
            freed: Vec::new(),
            fences: HashMap::default(),
            semaphores: HashMap::default(),
            streams: HashMap::default(),
            batches: VecDeque::new(),
            completed_batches: 0,
            memory: HashMap::default(),
            tables: HashMap::default(),
            window,
            surface: Extent2D::default(),
            image_count: 3,
            next_image: 0,
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            hung: false,
            failing_submits: 0,
            failing_fence_resets: 0,
            failing_allocations: false,
            missing_pipelines: HashSet::default(),
        }
    }

    fn record(&mut self, call: BackendCall) {
        self.calls.push(call);
    }

    fn violate(&mut self, violation: Violation) {
        log::debug!("headless violation: {violation:?}");
        self.violations.push(violation);
    }

    fn create(&mut self, kind: ObjectKind) -> ObjectId {
        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(id, kind);
        self.record(BackendCall::Create { id, kind });
        id
    }

    fn destroy(&mut self, id: ObjectId, kind: ObjectKind) {
        if let Some(batch) = self.batches.iter().find(|batch| batch.refs.contains(&id)) {
            let batch = batch.id;
            self.violate(Violation::FreedWhileInFlight { object: id, batch });
        }
        if let Some(stream) = self.bound_while_recording(id) {
            self.violate(Violation::FreedWhileRecording { object: id, stream });
        }

        self.live.remove(&id);
        self.destroyed.insert(id);
        self.memory.remove(&id);
        self.fences.remove(&id);
        self.semaphores.remove(&id);
        self.streams.remove(&id);
        self.tables.remove(&id);
        self.record(BackendCall::Destroy { id, kind });
        let at = self.calls.len() - 1;
        self.freed.push((id, at));
    }

    fn check_live(&mut self, id: ObjectId, call: &'static str) -> bool {
        if self.destroyed.contains(&id) {
            self.violate(Violation::UseOfDestroyed { object: id, call });
            return false;
        }
        true
    }

    /// The stream if it is recording; reports a violation otherwise.
    fn recording(&mut self, stream: ObjectId, call: &'static str) -> Option<&mut StreamState> {
        let recording = self.streams.get(&stream).is_some_and(|state| state.recording);
        if !recording {
            self.violate(Violation::RecordingOutsideStream { stream, call });
            return None;
        }
        self.streams.get_mut(&stream)
    }

    fn reference(&mut self, stream: ObjectId, object: ObjectId, call: &'static str) {
        self.check_live(object, call);
        if let Some(state) = self.recording(stream, call) {
            state.refs.insert(object);
        }
    }

    fn in_flight(&self, object: ObjectId) -> bool {
        self.batches.iter().any(|batch| batch.refs.contains(&object))
    }

    /// A recording stream that references `object`.
    fn bound_while_recording(&self, object: ObjectId) -> Option<ObjectId> {
        self.streams
            .iter()
            .find(|(_, stream)| stream.recording && stream.refs.contains(&object))
            .map(|(stream, _)| *stream)
    }

    fn open_stream(&mut self, stream: ObjectId, upload_only: bool) {
        if self.streams.get(&stream).is_some_and(|s| s.in_flight.is_some()) {
            self.violate(Violation::StreamReusedInFlight { stream });
        }
        let entry = self.streams.entry(stream).or_default();
        entry.recording = true;
        entry.upload_only = upload_only;
        entry.in_pass = false;
        entry.refs.clear();
        entry.copies.clear();
    }

    /// Execute every batch up to and including `batch`, in submission order.
    fn complete_through(&mut self, batch: u64) {
        while self.batches.front().is_some_and(|front| front.id <= batch) {
            let Some(done) = self.batches.pop_front() else {
                break;
            };
            self.execute(done);
        }
    }

    fn complete_all(&mut self) {
        while let Some(done) = self.batches.pop_front() {
            self.execute(done);
        }
    }

    fn execute(&mut self, batch: Batch) {
        for copy in &batch.copies {
            let Some(src) = self.memory.get(&copy.staging) else {
                continue;
            };
            let start = copy.src_offset as usize;
            let end = start + copy.size as usize;
            let Some(bytes) = src.get(start..end).map(<[u8]>::to_vec) else {
                continue;
            };
            if let Some(dst) = self.memory.get_mut(&copy.dst) {
                let at = copy.dst_offset as usize;
                if let Some(range) = dst.get_mut(at..at + bytes.len()) {
                    range.copy_from_slice(&bytes);
                }
            }
        }
        if let Some(fence) = self.fences.get_mut(&batch.fence) {
            if fence.batch == Some(batch.id) {
                fence.signaled = true;
                fence.batch = None;
            }
        }
        for id in &batch.streams {
            if let Some(stream) = self.streams.get_mut(id) {
                if stream.in_flight == Some(batch.id) {
                    stream.in_flight = None;
                }
            }
        }
        self.completed_batches += 1;
    }

    fn signal(&mut self, semaphore: ObjectId) {
        self.check_live(semaphore, "signal");
        let signaled = self.semaphores.entry(semaphore).or_insert(false);
        if *signaled {
            self.violate(Violation::SemaphoreDoubleSignal { semaphore });
        } else {
            *signaled = true;
        }
    }

    fn consume(&mut self, semaphore: ObjectId) {
        self.check_live(semaphore, "wait");
        let signaled = self.semaphores.entry(semaphore).or_insert(false);
        if *signaled {
            *signaled = false;
        } else {
            self.violate(Violation::SemaphoreWaitUnsignaled { semaphore });
        }
    }
}

/// Simulated GPU. Cloning yields another handle to the same device, so a test can keep
/// inspecting it after the render device that owns it has been dropped.
#[derive(Clone)]
pub struct HeadlessBackend {
    state: Arc<Mutex<State>>,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::with_window(Extent2D::new(1280, 720))
    }

    pub fn with_window(window: Extent2D) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::new(window))),
        }
    }

    // Scripting

    /// Simulate a window resize or minimize.
    pub fn set_window_extent(&self, extent: Extent2D) {
        self.state.lock().window = extent;
    }

    pub fn script_acquire(&self, outcome: ScriptedAcquire) {
        self.state.lock().acquire_script.push_back(outcome);
    }

    pub fn script_present(&self, outcome: ScriptedPresent) {
        self.state.lock().present_script.push_back(outcome);
    }

    /// From now on no submitted batch ever finishes.
    pub fn hang_gpu(&self) {
        self.state.lock().hung = true;
    }

    /// The next `count` submissions fail.
    pub fn fail_submits(&self, count: u32) {
        self.state.lock().failing_submits = count;
    }

    /// The next `count` fence resets fail and leave the fence untouched.
    pub fn fail_fence_resets(&self, count: u32) {
        self.state.lock().failing_fence_resets = count;
    }

    /// Buffer and image creation fail while set.
    pub fn fail_allocations(&self, fail: bool) {
        self.state.lock().failing_allocations = fail;
    }

    pub fn unregister_pipeline(&self, variant: PipelineVariant) {
        self.state.lock().missing_pipelines.insert(variant);
    }

    // Inspection

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn calls_since(&self, mark: usize) -> Vec<BackendCall> {
        self.state.lock().calls.get(mark..).map(<[BackendCall]>::to_vec).unwrap_or_default()
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.state.lock().violations.clone()
    }

    /// Every freed object, in order of destruction.
    pub fn freed_objects(&self) -> Vec<ObjectId> {
        self.state.lock().freed.iter().map(|(id, _)| *id).collect()
    }

    /// Call index at which `object` was destroyed.
    pub fn freed_at(&self, object: ObjectId) -> Option<usize> {
        self.state.lock().freed.iter().find(|(id, _)| *id == object).map(|(_, at)| *at)
    }

    pub fn free_count(&self, object: ObjectId) -> usize {
        self.state.lock().freed.iter().filter(|(id, _)| *id == object).count()
    }

    pub fn is_live(&self, object: ObjectId) -> bool {
        self.state.lock().live.contains_key(&object)
    }

    pub fn live_count(&self, kind: ObjectKind) -> usize {
        self.state.lock().live.values().filter(|live| **live == kind).count()
    }

    pub fn live_objects(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Simulated content of a buffer or image.
    pub fn contents(&self, object: ObjectId) -> Option<Vec<u8>> {
        self.state.lock().memory.get(&object).cloned()
    }

    /// Objects a binding table points at.
    pub fn table_bindings(&self, table: ObjectId) -> Vec<(BindingPoint, ObjectId)> {
        let state = self.state.lock();
        let mut bindings: Vec<_> = state
            .tables
            .get(&table)
            .map(|table| table.iter().map(|(point, id)| (*point, *id)).collect())
            .unwrap_or_default();
        bindings.sort();
        bindings
    }

    pub fn submissions(&self) -> u64 {
        self.state.lock().next_batch - 1
    }

    pub fn completed_batches(&self) -> u64 {
        self.state.lock().completed_batches
    }

    pub fn pending_batches(&self) -> usize {
        self.state.lock().batches.len()
    }

    pub fn surface_extent(&self) -> Extent2D {
        self.state.lock().surface
    }
}

impl RenderBackend for HeadlessBackend {
    type Buffer = HeadlessBuffer;
    type Image = HeadlessImage;
    type Fence = HeadlessFence;
    type Semaphore = HeadlessSemaphore;
    type CommandStream = HeadlessCommandStream;
    type Staging = HeadlessStaging;
    type RenderTarget = HeadlessRenderTarget;
    type BindingTable = HeadlessBindingTable;

    fn create_fence(&self, signaled: bool) -> RhiResult<HeadlessFence> {
        let mut state = self.state.lock();
        let id = state.create(ObjectKind::Fence);
        state.fences.insert(id, FenceState { signaled, batch: None });
        Ok(HeadlessFence { id })
    }

    fn destroy_fence(&self, fence: HeadlessFence) {
        self.state.lock().destroy(fence.id, ObjectKind::Fence);
    }

    fn wait_fence(&self, fence: &HeadlessFence, _timeout: Duration) -> RhiResult<FenceWait> {
        let mut state = self.state.lock();
        state.check_live(fence.id, "wait_fence");
        let (signaled, batch) = state
            .fences
            .get(&fence.id)
            .map_or((false, None), |fence| (fence.signaled, fence.batch));

        let outcome = match (signaled, batch) {
            (true, _) => FenceWait::Signaled,
            (false, Some(_)) if state.hung => FenceWait::TimedOut,
            (false, Some(batch)) => {
                state.complete_through(batch);
                FenceWait::Signaled
            }
            (false, None) => {
                state.violate(Violation::FenceNeverSignaled { fence: fence.id });
                FenceWait::TimedOut
            }
        };
        state.record(BackendCall::WaitFence {
            fence: fence.id,
            signaled: outcome == FenceWait::Signaled,
        });
        Ok(outcome)
    }

    fn reset_fence(&self, fence: &HeadlessFence) -> RhiResult<()> {
        let mut state = self.state.lock();
        if state.failing_fence_resets > 0 {
            state.failing_fence_resets -= 1;
            return Err(RhiError::Backend("scripted fence reset failure".into()));
        }
        state.check_live(fence.id, "reset_fence");
        state.record(BackendCall::ResetFence { fence: fence.id });
        if state.fences.get(&fence.id).is_some_and(|fence| fence.batch.is_some()) {
            state.violate(Violation::FenceResetInFlight { fence: fence.id });
        }
        if let Some(fence) = state.fences.get_mut(&fence.id) {
            fence.signaled = false;
        }
        Ok(())
    }

    fn create_semaphore(&self) -> RhiResult<HeadlessSemaphore> {
        let mut state = self.state.lock();
        let id = state.create(ObjectKind::Semaphore);
        state.semaphores.insert(id, false);
        Ok(HeadlessSemaphore { id })
    }

    fn destroy_semaphore(&self, semaphore: HeadlessSemaphore) {
        self.state.lock().destroy(semaphore.id, ObjectKind::Semaphore);
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let mut state = self.state.lock();
        state.record(BackendCall::WaitIdle);
        if state.hung {
            return Err(RhiError::DeviceLost);
        }
        state.complete_all();
        Ok(())
    }

    fn create_command_stream(&self) -> RhiResult<HeadlessCommandStream> {
        let mut state = self.state.lock();
        let id = state.create(ObjectKind::CommandStream);
        state.streams.insert(id, StreamState::default());
        Ok(HeadlessCommandStream { id })
    }

    fn destroy_command_stream(&self, stream: HeadlessCommandStream) {
        self.state.lock().destroy(stream.id, ObjectKind::CommandStream);
    }

    fn begin_commands(&self, stream: &HeadlessCommandStream) -> RhiResult<()> {
        let mut state = self.state.lock();
        state.check_live(stream.id, "begin_commands");
        state.record(BackendCall::BeginCommands { stream: stream.id });
        state.open_stream(stream.id, false);
        Ok(())
    }

    fn begin_upload_commands(&self, stream: &HeadlessCommandStream) -> RhiResult<()> {
        let mut state = self.state.lock();
        state.check_live(stream.id, "begin_upload_commands");
        state.record(BackendCall::BeginUploadCommands { stream: stream.id });
        state.open_stream(stream.id, true);
        Ok(())
    }

    fn end_commands(&self, stream: &HeadlessCommandStream) -> RhiResult<()> {
        let mut state = self.state.lock();
        state.record(BackendCall::EndCommands { stream: stream.id });
        let Some(entry) = state.recording(stream.id, "end_commands") else {
            return Ok(());
        };
        entry.recording = false;
        let left_open = std::mem::take(&mut entry.in_pass);
        if left_open {
            state.violate(Violation::PassLeftOpen { stream: stream.id });
        }
        Ok(())
    }

    fn submit(
        &self,
        streams: &[&HeadlessCommandStream],
        wait: &HeadlessSemaphore,
        signal: &HeadlessSemaphore,
        fence: &HeadlessFence,
    ) -> RhiResult<()> {
        let mut state = self.state.lock();
        if state.failing_submits > 0 {
            state.failing_submits -= 1;
            return Err(RhiError::Backend("scripted submit failure".into()));
        }
        for stream in streams {
            state.check_live(stream.id, "submit");
            if state.streams.get(&stream.id).is_some_and(|s| s.recording) {
                state.violate(Violation::SubmitWhileRecording { stream: stream.id });
            }
        }
        state.check_live(fence.id, "submit");
        match state.fences.get(&fence.id) {
            Some(FenceState { batch: Some(_), .. }) => {
                state.violate(Violation::FenceResetInFlight { fence: fence.id })
            }
            Some(FenceState { signaled: true, .. }) => state.violate(Violation::FenceNotReset { fence: fence.id }),
            _ => {}
        }
        state.consume(wait.id);
        state.signal(signal.id);

        let id = state.next_batch;
        state.next_batch += 1;
        let mut refs = HashSet::default();
        let mut copies = Vec::new();
        for stream in streams {
            if let Some(entry) = state.streams.get_mut(&stream.id) {
                entry.in_flight = Some(id);
                refs.extend(entry.refs.drain());
                copies.append(&mut entry.copies);
            }
        }
        if let Some(fence_state) = state.fences.get_mut(&fence.id) {
            fence_state.signaled = false;
            fence_state.batch = Some(id);
        }
        let ids: SmallVec<[ObjectId; 2]> = streams.iter().map(|stream| stream.id).collect();
        state.batches.push_back(Batch {
            id,
            fence: fence.id,
            streams: ids.clone(),
            refs,
            copies,
        });
        state.record(BackendCall::Submit {
            streams: ids.to_vec(),
            batch: id,
            fence: fence.id,
        });
        Ok(())
    }

    fn window_extent(&self) -> Extent2D {
        self.state.lock().window
    }

    fn acquire_image(&self, signal: &HeadlessSemaphore, _timeout: Duration) -> AcquireOutcome {
        let mut state = self.state.lock();
        let scripted = state.acquire_script.pop_front();
        let stale = state.window != state.surface;

        let outcome = match scripted {
            Some(ScriptedAcquire::OutOfDate) => AcquireOutcome::OutOfDate,
            Some(ScriptedAcquire::SurfaceLost) => AcquireOutcome::SurfaceLost,
            Some(ScriptedAcquire::Timeout) => AcquireOutcome::Timeout,
            Some(ScriptedAcquire::Error) => AcquireOutcome::Failed(RhiError::Backend("scripted acquire failure".into())),
            None if stale => AcquireOutcome::OutOfDate,
            Some(ScriptedAcquire::Suboptimal) | None => {
                let image_index = state.next_image;
                state.next_image = (state.next_image + 1) % state.image_count;
                state.signal(signal.id);
                AcquireOutcome::Acquired {
                    image_index,
                    suboptimal: scripted == Some(ScriptedAcquire::Suboptimal),
                }
            }
        };

        let image_index = match outcome {
            AcquireOutcome::Acquired { image_index, .. } => Some(image_index),
            _ => None,
        };
        state.record(BackendCall::Acquire { image_index });
        outcome
    }

    fn present(&self, image_index: u32, wait: &HeadlessSemaphore) -> PresentOutcome {
        let mut state = self.state.lock();
        state.record(BackendCall::Present { image_index });
        match state.present_script.pop_front() {
            // The wait semaphore is left in an unknown state.
            Some(ScriptedPresent::OutOfDate) => PresentOutcome::OutOfDate,
            Some(ScriptedPresent::SurfaceLost) => PresentOutcome::SurfaceLost,
            Some(ScriptedPresent::Error) => PresentOutcome::Failed(RhiError::Backend("scripted present failure".into())),
            Some(ScriptedPresent::Suboptimal) => {
                state.consume(wait.id);
                PresentOutcome::Suboptimal
            }
            None => {
                state.consume(wait.id);
                if state.window != state.surface {
                    PresentOutcome::Suboptimal
                } else {
                    PresentOutcome::Presented
                }
            }
        }
    }

    fn recreate_surface(&self, _extent: Extent2D) -> RhiResult<Extent2D> {
        let mut state = self.state.lock();
        // Like a real surface, the current window size wins over the request.
        let extent = state.window;
        state.surface = extent;
        state.next_image = 0;
        state.record(BackendCall::RecreateSurface { extent });
        Ok(extent)
    }

    fn create_render_target(&self, desc: &RenderTargetDesc<'_, Self>) -> RhiResult<HeadlessRenderTarget> {
        let mut state = self.state.lock();
        let mut attachments = SmallVec::new();
        if let ColorTarget::Image(image) = &desc.color {
            attachments.push(image.id);
        }
        if let Some(depth) = &desc.depth {
            attachments.push(depth.image.id);
        }
        for attachment in &attachments {
            state.check_live(*attachment, "create_render_target");
        }
        let id = state.create(ObjectKind::RenderTarget);
        Ok(HeadlessRenderTarget {
            id,
            kind: desc.kind,
            attachments,
        })
    }

    fn destroy_render_target(&self, target: HeadlessRenderTarget) {
        self.state.lock().destroy(target.id, ObjectKind::RenderTarget);
    }

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<HeadlessBuffer> {
        let mut state = self.state.lock();
        if state.failing_allocations {
            return Err(RhiError::OutOfMemory);
        }
        if desc.size == 0 {
            return Err(RhiError::Backend(format!("buffer '{}' has zero size", desc.name)));
        }
        let id = state.create(ObjectKind::Buffer);
        state.memory.insert(id, vec![0; desc.size as usize]);
        Ok(HeadlessBuffer {
            id,
            size: desc.size,
            host_visible: desc.is_host_visible(),
        })
    }

    fn destroy_buffer(&self, buffer: HeadlessBuffer) {
        self.state.lock().destroy(buffer.id, ObjectKind::Buffer);
    }

    fn write_buffer(&self, buffer: &HeadlessBuffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        let mut state = self.state.lock();
        state.check_live(buffer.id, "write_buffer");
        if !buffer.host_visible {
            return Err(RhiError::Backend("mapped write into device-local buffer".into()));
        }
        state.record(BackendCall::WriteBuffer {
            buffer: buffer.id,
            offset,
            len: data.len() as u64,
        });
        write_memory(&mut state, buffer.id, offset, data)
    }

    fn create_image(&self, desc: &TextureDesc) -> RhiResult<HeadlessImage> {
        let mut state = self.state.lock();
        if state.failing_allocations {
            return Err(RhiError::OutOfMemory);
        }
        let id = state.create(ObjectKind::Image);
        let byte_size = desc.byte_size();
        state.memory.insert(id, vec![0; byte_size as usize]);
        Ok(HeadlessImage { id, byte_size })
    }

    fn destroy_image(&self, image: HeadlessImage) {
        self.state.lock().destroy(image.id, ObjectKind::Image);
    }

    fn create_staging(&self, capacity: u64) -> RhiResult<HeadlessStaging> {
        let mut state = self.state.lock();
        let id = state.create(ObjectKind::Staging);
        state.memory.insert(id, vec![0; capacity as usize]);
        Ok(HeadlessStaging { id, capacity })
    }

    fn destroy_staging(&self, staging: HeadlessStaging) {
        self.state.lock().destroy(staging.id, ObjectKind::Staging);
    }

    fn write_staging(&self, staging: &HeadlessStaging, offset: u64, data: &[u8]) {
        let mut state = self.state.lock();
        let len = data.len() as u64;
        let overwritten = state.batches.iter().any(|batch| {
            batch.copies.iter().any(|copy| {
                copy.staging == staging.id && offset < copy.src_offset + copy.size && copy.src_offset < offset + len
            })
        });
        if overwritten {
            state.violate(Violation::StagingOverwrittenInFlight {
                staging: staging.id,
                offset,
                len,
            });
        }
        state.record(BackendCall::WriteStaging {
            staging: staging.id,
            offset,
            len,
        });
        if offset + len > staging.capacity {
            log::error!("staging write past capacity");
            return;
        }
        let _ = write_memory(&mut state, staging.id, offset, data);
    }

    fn upload_buffer_blocking(&self, dst: &HeadlessBuffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        let mut state = self.state.lock();
        state.check_live(dst.id, "upload_buffer_blocking");
        state.record(BackendCall::UploadBlocking {
            target: dst.id,
            len: data.len() as u64,
        });
        write_memory(&mut state, dst.id, offset, data)
    }

    fn upload_image_blocking(&self, dst: &HeadlessImage, data: &[u8]) -> RhiResult<()> {
        let mut state = self.state.lock();
        state.check_live(dst.id, "upload_image_blocking");
        if data.len() as u64 != dst.byte_size {
            return Err(RhiError::Backend("image upload size mismatch".into()));
        }
        state.record(BackendCall::UploadBlocking {
            target: dst.id,
            len: data.len() as u64,
        });
        write_memory(&mut state, dst.id, 0, data)
    }

    fn create_binding_table(&self) -> RhiResult<HeadlessBindingTable> {
        let mut state = self.state.lock();
        let id = state.create(ObjectKind::BindingTable);
        state.tables.insert(id, HashMap::default());
        Ok(HeadlessBindingTable { id })
    }

    fn destroy_binding_table(&self, table: HeadlessBindingTable) {
        self.state.lock().destroy(table.id, ObjectKind::BindingTable);
    }

    fn write_binding_table(&self, table: &HeadlessBindingTable, writes: &[BindingWrite<'_, Self>]) {
        let mut state = self.state.lock();
        state.check_live(table.id, "write_binding_table");
        if state.in_flight(table.id) {
            state.violate(Violation::TableWrittenInFlight { table: table.id });
        }
        if let Some(stream) = state.bound_while_recording(table.id) {
            state.violate(Violation::TableWrittenWhileBound { table: table.id, stream });
        }
        let mut points = Vec::with_capacity(writes.len());
        for write in writes {
            let object = match &write.resource {
                BindingResource::Buffer(buffer) => buffer.id,
                BindingResource::Image(image) => image.id,
            };
            state.check_live(object, "write_binding_table");
            state.tables.entry(table.id).or_default().insert(write.point, object);
            points.push(write.point);
        }
        state.record(BackendCall::WriteBindingTable { table: table.id, points });
    }

    fn cmd_copy_to_buffer(
        &self,
        stream: &HeadlessCommandStream,
        staging: &HeadlessStaging,
        src_offset: u64,
        dst: &HeadlessBuffer,
        dst_offset: u64,
        size: u64,
    ) {
        let mut state = self.state.lock();
        state.record(BackendCall::CopyToBuffer {
            stream: stream.id,
            staging: staging.id,
            src_offset,
            dst: dst.id,
            dst_offset,
            size,
        });
        state.reference(stream.id, staging.id, "cmd_copy_to_buffer");
        state.reference(stream.id, dst.id, "cmd_copy_to_buffer");
        if let Some(entry) = state.recording(stream.id, "cmd_copy_to_buffer") {
            let in_pass = entry.in_pass;
            entry.copies.push(StagedCopy {
                staging: staging.id,
                src_offset,
                dst: dst.id,
                dst_offset,
                size,
            });
            if in_pass {
                state.violate(Violation::TransferInsidePass {
                    stream: stream.id,
                    call: "cmd_copy_to_buffer",
                });
            }
        }
    }

    fn cmd_copy_to_image(&self, stream: &HeadlessCommandStream, staging: &HeadlessStaging, src_offset: u64, dst: &HeadlessImage) {
        let mut state = self.state.lock();
        state.record(BackendCall::CopyToImage {
            stream: stream.id,
            staging: staging.id,
            src_offset,
            dst: dst.id,
        });
        state.reference(stream.id, staging.id, "cmd_copy_to_image");
        state.reference(stream.id, dst.id, "cmd_copy_to_image");
        if let Some(entry) = state.recording(stream.id, "cmd_copy_to_image") {
            let in_pass = entry.in_pass;
            entry.copies.push(StagedCopy {
                staging: staging.id,
                src_offset,
                dst: dst.id,
                dst_offset: 0,
                size: dst.byte_size,
            });
            if in_pass {
                state.violate(Violation::TransferInsidePass {
                    stream: stream.id,
                    call: "cmd_copy_to_image",
                });
            }
        }
    }

    fn cmd_transfer_barrier(&self, stream: &HeadlessCommandStream) {
        let mut state = self.state.lock();
        state.record(BackendCall::TransferBarrier { stream: stream.id });
        if let Some(entry) = state.recording(stream.id, "cmd_transfer_barrier") {
            if entry.in_pass {
                state.violate(Violation::TransferInsidePass {
                    stream: stream.id,
                    call: "cmd_transfer_barrier",
                });
            }
        }
    }

    fn cmd_begin_pass(&self, stream: &HeadlessCommandStream, target: &HeadlessRenderTarget, clear: &ClearValues) {
        let mut state = self.state.lock();
        state.record(BackendCall::BeginPass {
            target: target.id,
            kind: target.kind,
            clear: clear.color,
        });
        state.reference(stream.id, target.id, "cmd_begin_pass");
        for attachment in &target.attachments {
            state.reference(stream.id, *attachment, "cmd_begin_pass");
        }
        if let Some(entry) = state.recording(stream.id, "cmd_begin_pass") {
            let upload_only = entry.upload_only;
            let nested = std::mem::replace(&mut entry.in_pass, true);
            if nested {
                state.violate(Violation::NestedPass { stream: stream.id });
            }
            if upload_only {
                state.violate(Violation::RenderingInUploadStream { stream: stream.id });
            }
        }
    }

    fn cmd_end_pass(&self, stream: &HeadlessCommandStream) {
        let mut state = self.state.lock();
        state.record(BackendCall::EndPass);
        if let Some(entry) = state.recording(stream.id, "cmd_end_pass") {
            let was_open = std::mem::replace(&mut entry.in_pass, false);
            if !was_open {
                state.violate(Violation::EndPassWithoutPass { stream: stream.id });
            }
        }
    }

    fn cmd_set_viewport(&self, stream: &HeadlessCommandStream, viewport: &Viewport) {
        let mut state = self.state.lock();
        state.record(BackendCall::SetViewport {
            width: viewport.width,
            height: viewport.height,
        });
        state.recording(stream.id, "cmd_set_viewport");
    }

    fn cmd_bind_pipeline(&self, stream: &HeadlessCommandStream, variant: PipelineVariant) -> bool {
        let mut state = self.state.lock();
        if state.missing_pipelines.contains(&variant) {
            return false;
        }
        state.record(BackendCall::BindPipeline { variant });
        state.recording(stream.id, "cmd_bind_pipeline").is_some()
    }

    fn cmd_bind_binding_table(&self, stream: &HeadlessCommandStream, _variant: PipelineVariant, table: &HeadlessBindingTable) {
        let mut state = self.state.lock();
        state.record(BackendCall::BindBindingTable { table: table.id });
        state.reference(stream.id, table.id, "cmd_bind_binding_table");
        let bound: Vec<ObjectId> = state
            .tables
            .get(&table.id)
            .map(|bindings| bindings.values().copied().collect())
            .unwrap_or_default();
        for object in bound {
            state.reference(stream.id, object, "cmd_bind_binding_table");
        }
    }

    fn cmd_push_model(&self, stream: &HeadlessCommandStream, _variant: PipelineVariant, data: &[u8]) {
        let mut state = self.state.lock();
        state.record(BackendCall::PushModel { len: data.len() });
        state.recording(stream.id, "cmd_push_model");
    }

    fn cmd_bind_vertex_buffer(&self, stream: &HeadlessCommandStream, buffer: &HeadlessBuffer) {
        let mut state = self.state.lock();
        state.record(BackendCall::BindVertexBuffer { buffer: buffer.id });
        state.reference(stream.id, buffer.id, "cmd_bind_vertex_buffer");
    }

    fn cmd_bind_index_buffer(&self, stream: &HeadlessCommandStream, buffer: &HeadlessBuffer) {
        let mut state = self.state.lock();
        state.record(BackendCall::BindIndexBuffer { buffer: buffer.id });
        state.reference(stream.id, buffer.id, "cmd_bind_index_buffer");
    }

    fn cmd_draw(&self, stream: &HeadlessCommandStream, draw: DrawCommand) {
        let mut state = self.state.lock();
        state.record(BackendCall::Draw(draw));
        if let Some(entry) = state.recording(stream.id, "cmd_draw") {
            if !entry.in_pass {
                state.violate(Violation::DrawOutsidePass { stream: stream.id });
            }
        }
    }

    fn cmd_draw_indirect(&self, stream: &HeadlessCommandStream, buffer: &HeadlessBuffer, offset: u64, draw_count: u32, _stride: u32) {
        let mut state = self.state.lock();
        state.record(BackendCall::DrawIndirect {
            buffer: buffer.id,
            offset,
            draw_count,
        });
        state.reference(stream.id, buffer.id, "cmd_draw_indirect");
        if let Some(entry) = state.recording(stream.id, "cmd_draw_indirect") {
            if !entry.in_pass {
                state.violate(Violation::DrawOutsidePass { stream: stream.id });
            }
        }
    }
}

fn write_memory(state: &mut State, object: ObjectId, offset: u64, data: &[u8]) -> RhiResult<()> {
    let Some(memory) = state.memory.get_mut(&object) else {
        return Err(RhiError::Backend(format!("object {object} has no memory")));
    };
    let start = offset as usize;
    let Some(range) = memory.get_mut(start..start + data.len()) else {
        return Err(RhiError::Backend(format!(
            "write of {} bytes at {offset} outside object {object}",
            data.len()
        )));
    };
    range.copy_from_slice(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_execute_only_when_observed() {
        let backend = HeadlessBackend::new();
        let fence = backend.create_fence(false).unwrap();
        let acquired = backend.create_semaphore().unwrap();
        let finished = backend.create_semaphore().unwrap();
        let stream = backend.create_command_stream().unwrap();
        let staging = backend.create_staging(64).unwrap();
        let buffer = backend.create_buffer(&BufferDesc::vertex("dst", 4)).unwrap();

        backend.recreate_surface(Extent2D::new(1280, 720)).unwrap();
        assert!(matches!(
            backend.acquire_image(&acquired, Duration::from_secs(1)),
            AcquireOutcome::Acquired { image_index: 0, .. }
        ));
        backend.write_staging(&staging, 0, &[1, 2, 3, 4]);
        backend.begin_commands(&stream).unwrap();
        backend.cmd_copy_to_buffer(&stream, &staging, 0, &buffer, 0, 4);
        backend.end_commands(&stream).unwrap();
        backend.submit(&[&stream], &acquired, &finished, &fence).unwrap();

        assert_eq!(backend.contents(buffer.id()).unwrap(), vec![0; 4]);
        assert_eq!(backend.pending_batches(), 1);
        assert_eq!(backend.wait_fence(&fence, Duration::from_secs(2)).unwrap(), FenceWait::Signaled);
        assert_eq!(backend.contents(buffer.id()).unwrap(), vec![1, 2, 3, 4]);
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }

    #[test]
    fn freeing_referenced_object_is_reported() {
        let backend = HeadlessBackend::new();
        let fence = backend.create_fence(false).unwrap();
        let acquired = backend.create_semaphore().unwrap();
        let finished = backend.create_semaphore().unwrap();
        let stream = backend.create_command_stream().unwrap();
        let buffer = backend.create_buffer(&BufferDesc::vertex("vb", 16)).unwrap();
        let id = buffer.id();

        backend.recreate_surface(Extent2D::new(1280, 720)).unwrap();
        let _ = backend.acquire_image(&acquired, Duration::from_secs(1));
        backend.begin_commands(&stream).unwrap();
        backend.cmd_bind_vertex_buffer(&stream, &buffer);
        backend.end_commands(&stream).unwrap();
        backend.submit(&[&stream], &acquired, &finished, &fence).unwrap();
        backend.destroy_buffer(buffer);

        assert_eq!(
            backend.violations(),
            vec![Violation::FreedWhileInFlight { object: id, batch: 1 }]
        );
    }

    #[test]
    fn hung_gpu_times_out() {
        let backend = HeadlessBackend::new();
        let fence = backend.create_fence(false).unwrap();
        let acquired = backend.create_semaphore().unwrap();
        let finished = backend.create_semaphore().unwrap();
        let stream = backend.create_command_stream().unwrap();

        backend.recreate_surface(Extent2D::new(1280, 720)).unwrap();
        let _ = backend.acquire_image(&acquired, Duration::from_secs(1));
        backend.begin_commands(&stream).unwrap();
        backend.end_commands(&stream).unwrap();
        backend.submit(&[&stream], &acquired, &finished, &fence).unwrap();
        backend.hang_gpu();

        assert_eq!(backend.wait_fence(&fence, Duration::from_secs(2)).unwrap(), FenceWait::TimedOut);
        assert!(backend.wait_idle().is_err());
    }

    #[test]
    fn nested_pass_and_recording_outside_stream_are_reported() {
        let backend = HeadlessBackend::new();
        let stream = backend.create_command_stream().unwrap();
        let image = backend
            .create_image(&TextureDesc::new_depth_attachment(4, 4))
            .unwrap();
        let target = backend
            .create_render_target(&RenderTargetDesc {
                name: "t",
                kind: PassKind::Main,
                extent: Extent2D::new(4, 4),
                color: ColorTarget::Surface,
                depth: Some(crate::backend::DepthTarget { image: &image, layer: 0 }),
                color_load: crate::backend::LoadOp::Clear,
            })
            .unwrap();

        backend.cmd_draw(
            &stream,
            DrawCommand::Draw {
                vertex_count: 3,
                instance_count: 1,
                first_vertex: 0,
                first_instance: 0,
            },
        );
        backend.begin_commands(&stream).unwrap();
        backend.cmd_begin_pass(&stream, &target, &ClearValues::default());
        backend.cmd_begin_pass(&stream, &target, &ClearValues::default());

        let violations = backend.violations();
        assert!(violations.contains(&Violation::RecordingOutsideStream {
            stream: stream.id(),
            call: "cmd_draw"
        }));
        assert!(violations.contains(&Violation::NestedPass { stream: stream.id() }));
    }

    #[test]
    fn rewriting_a_table_bound_in_a_recording_stream_is_reported() {
        let backend = HeadlessBackend::new();
        let stream = backend.create_command_stream().unwrap();
        let table = backend.create_binding_table().unwrap();
        let first = backend.create_buffer(&BufferDesc::storage("a", 16)).unwrap();
        let second = backend.create_buffer(&BufferDesc::storage("b", 16)).unwrap();
        fn write(buffer: &HeadlessBuffer) -> [BindingWrite<'_, HeadlessBackend>; 1] {
            [BindingWrite {
                point: BindingPoint::InstanceData,
                resource: BindingResource::Buffer(buffer),
            }]
        }

        backend.write_binding_table(&table, &write(&first));
        backend.begin_commands(&stream).unwrap();
        backend.cmd_bind_binding_table(&stream, PipelineVariant::Opaque, &table);
        backend.write_binding_table(&table, &write(&second));

        assert_eq!(
            backend.violations(),
            vec![Violation::TableWrittenWhileBound {
                table: table.id(),
                stream: stream.id()
            }]
        );
    }

    #[test]
    fn upload_stream_executes_ahead_of_the_graphics_stream() {
        let backend = HeadlessBackend::new();
        let fence = backend.create_fence(false).unwrap();
        let acquired = backend.create_semaphore().unwrap();
        let finished = backend.create_semaphore().unwrap();
        let uploads = backend.create_command_stream().unwrap();
        let commands = backend.create_command_stream().unwrap();
        let staging = backend.create_staging(64).unwrap();
        let buffer = backend.create_buffer(&BufferDesc::vertex("dst", 4)).unwrap();

        backend.recreate_surface(Extent2D::new(1280, 720)).unwrap();
        let _ = backend.acquire_image(&acquired, Duration::from_secs(1));
        backend.write_staging(&staging, 0, &[5, 6, 7, 8]);
        backend.begin_commands(&commands).unwrap();
        backend.begin_upload_commands(&uploads).unwrap();
        backend.cmd_copy_to_buffer(&uploads, &staging, 0, &buffer, 0, 4);
        backend.cmd_transfer_barrier(&uploads);
        backend.cmd_bind_vertex_buffer(&commands, &buffer);
        backend.end_commands(&uploads).unwrap();
        backend.end_commands(&commands).unwrap();
        backend.submit(&[&uploads, &commands], &acquired, &finished, &fence).unwrap();

        let submit = backend.calls().into_iter().find(|call| matches!(call, BackendCall::Submit { .. }));
        assert_eq!(
            submit,
            Some(BackendCall::Submit {
                streams: vec![uploads.id(), commands.id()],
                batch: 1,
                fence: fence.id()
            })
        );
        backend.wait_idle().unwrap();
        assert_eq!(backend.contents(buffer.id()).unwrap(), vec![5, 6, 7, 8]);
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }
}
