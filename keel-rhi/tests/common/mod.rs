#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use keel_rhi::headless::{BackendCall, HeadlessBackend, ObjectId};
use keel_rhi::{BufferHandle, Extent2D, FrameInfo, FrameStatus, RenderDevice, RhiConfig, TextureHandle};

pub const WINDOW: Extent2D = Extent2D::new(320, 240);

/// Small shadow maps and arenas keep the simulated memory tiny. GPU hangs are counted
/// instead of aborting the test process.
pub fn config() -> RhiConfig {
    RhiConfig::default()
        .with_shadow_cascades(2, 64)
        .with_transient_arena_size(16 * 1024)
        .with_fatal_handler(|_| {})
}

pub fn device() -> (HeadlessBackend, RenderDevice<HeadlessBackend>) {
    device_with(config())
}

pub fn device_with(config: RhiConfig) -> (HeadlessBackend, RenderDevice<HeadlessBackend>) {
    let backend = HeadlessBackend::with_window(WINDOW);
    let device = RenderDevice::new(backend.clone(), config).expect("headless device");
    (backend, device)
}

/// Config whose fatal handler bumps the returned counter.
pub fn counting_config() -> (RhiConfig, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let config = config().with_fatal_handler(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    (config, count)
}

pub fn begin(device: &mut RenderDevice<HeadlessBackend>) -> FrameInfo {
    match device.begin_frame().expect("begin_frame") {
        FrameStatus::Started(info) => info,
        other => panic!("frame did not start: {other:?}"),
    }
}

/// Record and submit one empty frame.
pub fn frame(device: &mut RenderDevice<HeadlessBackend>) -> FrameInfo {
    let info = begin(device);
    device.end_frame().expect("end_frame");
    info
}

pub fn buffer_id(device: &RenderDevice<HeadlessBackend>, handle: BufferHandle) -> ObjectId {
    device.with_buffer(handle, |buffer| buffer.id()).expect("live buffer")
}

pub fn texture_id(device: &RenderDevice<HeadlessBackend>, handle: TextureHandle) -> ObjectId {
    device.with_texture(handle, |texture| texture.id()).expect("live texture")
}

pub fn count(calls: &[BackendCall], pred: impl Fn(&BackendCall) -> bool) -> usize {
    calls.iter().filter(|call| pred(call)).count()
}

pub fn assert_clean(backend: &HeadlessBackend) {
    let violations = backend.violations();
    assert!(violations.is_empty(), "backend misuse: {violations:?}");
}
