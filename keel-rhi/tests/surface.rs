mod common;

use common::*;
use keel_rhi::headless::{BackendCall, ScriptedAcquire, ScriptedPresent};
use keel_rhi::{BindingPoint, BindingSource, Extent2D, FrameStatus, SkipReason};

#[test]
fn first_frame_builds_the_surface() {
    let (backend, mut device) = device();
    assert_eq!(device.surface_rebuild_count(), 0);

    let info = frame(&mut device);
    assert_eq!(info.extent, WINDOW);
    assert_eq!(info.generation, 1);
    assert_eq!(backend.surface_extent(), WINDOW);
    assert_eq!(device.surface_rebuild_count(), 1);

    frame(&mut device);
    assert_eq!(device.surface_rebuild_count(), 1);
    assert_clean(&backend);
}

#[test]
fn minimized_window_skips_without_touching_the_gpu() {
    let (backend, mut device) = device();
    frame(&mut device);

    backend.set_window_extent(Extent2D::new(0, 0));
    let mark = backend.call_count();
    for _ in 0..3 {
        assert_eq!(
            device.begin_frame().unwrap(),
            FrameStatus::Skipped(SkipReason::SurfaceMinimized)
        );
    }
    assert_eq!(backend.call_count(), mark);
    assert!(!device.is_frame_in_progress());

    backend.set_window_extent(Extent2D::new(200, 100));
    let info = frame(&mut device);
    assert_eq!(info.extent, Extent2D::new(200, 100));
    assert_eq!(info.generation, 2);
    assert_clean(&backend);
}

#[test]
fn explicit_resize_rebuilds_at_next_frame() {
    let (backend, mut device) = device();
    frame(&mut device);

    backend.set_window_extent(Extent2D::new(640, 480));
    device.resize(640, 480);
    let info = frame(&mut device);
    assert_eq!(info.extent, Extent2D::new(640, 480));
    assert_eq!(info.generation, 2);
    assert_eq!(device.surface_stamp().extent, Extent2D::new(640, 480));
    assert_clean(&backend);
}

#[test]
fn resize_during_a_frame_is_picked_up_next_frame() {
    let (backend, mut device) = device();
    let first = begin(&mut device);
    device.begin_main_pass();

    backend.set_window_extent(Extent2D::new(400, 300));
    // The open frame finishes at the old size.
    device.end_frame().unwrap();
    assert_eq!(device.surface_stamp().generation, first.generation);

    let next = frame(&mut device);
    assert_eq!(next.extent, Extent2D::new(400, 300));
    assert_eq!(next.generation, first.generation + 1);
    assert_clean(&backend);
}

#[test]
fn out_of_date_acquire_rebuilds_and_skips() {
    let (backend, mut device) = device();
    let first = frame(&mut device);
    let rebuilds = device.surface_rebuild_count();

    backend.script_acquire(ScriptedAcquire::OutOfDate);
    assert_eq!(
        device.begin_frame().unwrap(),
        FrameStatus::Skipped(SkipReason::SurfaceOutOfDate)
    );
    assert!(!device.is_frame_in_progress());
    assert_eq!(device.surface_rebuild_count(), rebuilds + 1);

    let next = frame(&mut device);
    assert_eq!(next.generation, first.generation + 1);
    assert_eq!(next.frame_index, first.frame_index + 1);
    assert_clean(&backend);
}

#[test]
fn lost_surface_is_rebuilt_next_frame() {
    let (backend, mut device) = device();
    let first = frame(&mut device);

    backend.script_acquire(ScriptedAcquire::SurfaceLost);
    assert_eq!(
        device.begin_frame().unwrap(),
        FrameStatus::Skipped(SkipReason::SurfaceLost)
    );
    let next = frame(&mut device);
    assert_eq!(next.generation, first.generation + 1);
    assert_clean(&backend);
}

#[test]
fn acquire_timeout_and_failure_skip_the_frame() {
    let (backend, mut device) = device();
    frame(&mut device);

    backend.script_acquire(ScriptedAcquire::Timeout);
    assert_eq!(
        device.begin_frame().unwrap(),
        FrameStatus::Skipped(SkipReason::AcquireTimeout)
    );
    backend.script_acquire(ScriptedAcquire::Error);
    assert_eq!(
        device.begin_frame().unwrap(),
        FrameStatus::Skipped(SkipReason::AcquireFailed)
    );
    for _ in 0..3 {
        frame(&mut device);
    }
    assert_clean(&backend);
}

#[test]
fn suboptimal_acquire_still_renders() {
    let (backend, mut device) = device();
    let first = frame(&mut device);

    backend.script_acquire(ScriptedAcquire::Suboptimal);
    let suboptimal = frame(&mut device);
    assert_eq!(suboptimal.generation, first.generation);

    let next = frame(&mut device);
    assert_eq!(next.generation, first.generation + 1);
    assert_clean(&backend);
}

#[test]
fn failed_present_idles_and_rebuilds() {
    let (backend, mut device) = device();
    let first = frame(&mut device);

    backend.script_present(ScriptedPresent::OutOfDate);
    begin(&mut device);
    let mark = backend.call_count();
    device.end_frame().unwrap();
    let calls = backend.calls_since(mark);
    let present_at = calls
        .iter()
        .position(|call| matches!(call, BackendCall::Present { .. }))
        .unwrap();
    assert!(calls[present_at..].iter().any(|call| matches!(call, BackendCall::WaitIdle)));
    // The frame still counts.
    assert_eq!(device.frame_index(), 2);

    let next = frame(&mut device);
    assert_eq!(next.generation, first.generation + 1);
    for _ in 0..3 {
        frame(&mut device);
    }
    assert_clean(&backend);
}

#[test]
fn ambient_occlusion_binding_follows_the_generation() {
    let (backend, mut device) = device();
    let first = frame(&mut device);
    assert_eq!(
        device.binding_source(BindingPoint::AmbientOcclusion),
        BindingSource::AmbientOcclusionTarget { generation: 1 }
    );
    assert_eq!(
        device.slot_binding(first.slot, BindingPoint::AmbientOcclusion),
        Some(BindingSource::AmbientOcclusionTarget { generation: 1 })
    );

    backend.set_window_extent(Extent2D::new(128, 128));
    let a = frame(&mut device);
    let b = frame(&mut device);
    let current = BindingSource::AmbientOcclusionTarget { generation: 2 };
    assert_eq!(device.slot_binding(a.slot, BindingPoint::AmbientOcclusion), Some(current));
    assert_eq!(device.slot_binding(b.slot, BindingPoint::AmbientOcclusion), Some(current));
    assert_clean(&backend);
}

#[test]
fn previous_generation_is_freed_on_rebuild() {
    let (backend, mut device) = device();
    frame(&mut device);
    frame(&mut device);
    let live = backend.live_objects();

    for size in [100, 200, 300] {
        backend.set_window_extent(Extent2D::new(size, size));
        frame(&mut device);
        assert_eq!(backend.live_objects(), live);
    }
    assert_eq!(device.surface_rebuild_count(), 4);
    assert_clean(&backend);
}
