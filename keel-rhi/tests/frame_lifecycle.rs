mod common;

use common::*;
use keel_rhi::headless::{BackendCall, ScriptedAcquire};
use keel_rhi::{
    ActivePass, BufferDesc, FrameStatus, ModelUniforms, PassKind, PassState, PipelineVariant, RhiConfig, SkipReason,
    Viewport,
};

#[test]
fn slots_rotate_and_wait_before_reuse() {
    let (backend, mut device) = device();

    for expected in 0..6u64 {
        let info = frame(&mut device);
        assert_eq!(info.frame_index, expected);
        assert_eq!(info.slot, (expected % 2) as usize);
    }

    let calls = backend.calls();
    let submits: Vec<(usize, u64)> = calls
        .iter()
        .enumerate()
        .filter_map(|(at, call)| match call {
            BackendCall::Submit { fence, .. } => Some((at, *fence)),
            _ => None,
        })
        .collect();
    assert_eq!(submits.len(), 6);

    for window in submits.windows(3) {
        let (first_at, first_fence) = window[0];
        let (_, second_fence) = window[1];
        let (reuse_at, reuse_fence) = window[2];
        assert_ne!(first_fence, second_fence);
        assert_eq!(first_fence, reuse_fence);

        // The slot's fence was observed signaled between its two submissions.
        let waited = calls[first_at..reuse_at].iter().any(|call| {
            matches!(call, BackendCall::WaitFence { fence, signaled: true } if *fence == first_fence)
        });
        assert!(waited);
    }
    assert_clean(&backend);
}

#[test]
fn three_frames_in_flight() {
    let (backend, mut device) = device_with(config().with_frames_in_flight(3));
    let slots: Vec<usize> = (0..7).map(|_| frame(&mut device).slot).collect();
    assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
    assert_clean(&backend);
}

#[test]
fn end_frame_is_idempotent() {
    let (backend, mut device) = device();

    // Nothing to end yet.
    let mark = backend.call_count();
    device.end_frame().unwrap();
    assert_eq!(backend.call_count(), mark);

    begin(&mut device);
    assert_eq!(device.begin_frame().unwrap(), FrameStatus::AlreadyInProgress);
    device.end_frame().unwrap();
    let mark = backend.call_count();
    device.end_frame().unwrap();
    assert_eq!(backend.call_count(), mark);
    assert_eq!(device.frame_index(), 1);
    assert_eq!(backend.submissions(), 1);
    assert_clean(&backend);
}

#[test]
fn one_pass_open_at_a_time() {
    let (backend, mut device) = device();
    let vertices = device.create_buffer(&BufferDesc::vertex("triangle", 36));
    let model = ModelUniforms::default();

    // Outside a frame nothing is recorded.
    let mark = backend.call_count();
    device.begin_main_pass();
    device.draw(PipelineVariant::Opaque, vertices, 3, &model);
    assert_eq!(backend.call_count(), mark);

    begin(&mut device);
    device.begin_shadow_pass(0);
    device.draw(PipelineVariant::ShadowCaster, vertices, 3, &model);
    device.begin_main_pass();
    assert_eq!(device.pass_state(), PassState::Active(ActivePass::Main));
    device.draw(PipelineVariant::Opaque, vertices, 3, &model);
    device.begin_ui_pass();
    device.draw(PipelineVariant::UiQuad, vertices, 6, &model);
    // Wrong pass for this pipeline.
    device.draw(PipelineVariant::Opaque, vertices, 3, &model);
    // Ending a pass that is not open changes nothing.
    device.end_main_pass();
    assert!(device.pass_state().is_active(PassKind::Ui));
    device.end_frame().unwrap();
    assert_eq!(device.pass_state(), PassState::Idle);

    let calls = backend.calls_since(mark);
    let opened: Vec<PassKind> = calls
        .iter()
        .filter_map(|call| match call {
            BackendCall::BeginPass { kind, .. } => Some(*kind),
            _ => None,
        })
        .collect();
    assert_eq!(opened, vec![PassKind::Shadow, PassKind::Main, PassKind::Ui]);
    assert_eq!(count(&calls, |call| matches!(call, BackendCall::EndPass)), 3);
    assert_eq!(count(&calls, |call| matches!(call, BackendCall::Draw(_))), 3);
    assert_clean(&backend);
}

#[test]
fn draw_opens_the_main_pass() {
    let (backend, mut device) = device();
    let vertices = device.create_buffer(&BufferDesc::vertex("quad", 64));

    begin(&mut device);
    let mark = backend.call_count();
    device.draw(PipelineVariant::Opaque, vertices, 6, &ModelUniforms::default());
    assert_eq!(device.pass_state(), PassState::Active(ActivePass::Main));

    let calls = backend.calls_since(mark);
    let begin_at = calls
        .iter()
        .position(|call| matches!(call, BackendCall::BeginPass { kind: PassKind::Main, .. }))
        .unwrap();
    let draw_at = calls.iter().position(|call| matches!(call, BackendCall::Draw(_))).unwrap();
    assert!(begin_at < draw_at);

    device.end_frame().unwrap();
    assert_clean(&backend);
}

#[test]
fn draw_without_pipeline_is_skipped() {
    let (backend, mut device) = device();
    let vertices = device.create_buffer(&BufferDesc::vertex("quad", 64));
    backend.unregister_pipeline(PipelineVariant::Skybox);

    begin(&mut device);
    let mark = backend.call_count();
    device.draw(PipelineVariant::Skybox, vertices, 36, &ModelUniforms::default());
    device.end_frame().unwrap();

    let calls = backend.calls_since(mark);
    assert_eq!(count(&calls, |call| matches!(call, BackendCall::Draw(_))), 0);
    assert_eq!(count(&calls, |call| matches!(call, BackendCall::BindVertexBuffer { .. })), 0);
    assert_clean(&backend);
}

#[test]
fn shadow_cascade_out_of_range_is_ignored() {
    let (backend, mut device) = device();
    begin(&mut device);
    device.begin_shadow_pass(2);
    assert_eq!(device.pass_state(), PassState::Idle);
    device.begin_shadow_pass(1);
    assert_eq!(device.pass_state(), PassState::Active(ActivePass::Shadow { cascade: 1 }));
    device.end_frame().unwrap();
    assert_clean(&backend);
}

#[test]
fn viewport_applies_to_main_and_ui() {
    let (backend, mut device) = device();
    device.set_viewport(Viewport {
        x: 0.0,
        y: 0.0,
        width: 100.0,
        height: 50.0,
        min_depth: 0.0,
        max_depth: 1.0,
    });

    begin(&mut device);
    let mark = backend.call_count();
    device.begin_geometry_pass();
    device.begin_main_pass();
    device.end_frame().unwrap();

    let viewports: Vec<(f32, f32)> = backend
        .calls_since(mark)
        .iter()
        .filter_map(|call| match call {
            BackendCall::SetViewport { width, height } => Some((*width, *height)),
            _ => None,
        })
        .collect();
    assert_eq!(viewports, vec![(320.0, 240.0), (100.0, 50.0)]);
}

#[test]
fn abort_discards_the_frame() {
    let (backend, mut device) = device();
    let vertices = device.create_buffer(&BufferDesc::vertex("quad", 64));

    let first = begin(&mut device);
    device.draw(PipelineVariant::Opaque, vertices, 6, &ModelUniforms::default());
    device.abort_frame();
    assert!(!device.is_frame_in_progress());
    assert_eq!(device.pass_state(), PassState::Idle);
    assert_eq!(backend.submissions(), 0);

    // The same slot is recorded again.
    let retry = begin(&mut device);
    assert_eq!(retry.slot, first.slot);
    assert_eq!(retry.frame_index, first.frame_index);
    device.end_frame().unwrap();
    frame(&mut device);
    assert_clean(&backend);
}

#[test]
fn skipped_frame_leaves_the_arena_alone() {
    let (backend, mut device) = device();
    let first = frame(&mut device);
    frame(&mut device);
    let resets = device.arena_resets(first.slot);

    backend.script_acquire(ScriptedAcquire::Timeout);
    assert_eq!(
        device.begin_frame().unwrap(),
        FrameStatus::Skipped(SkipReason::AcquireTimeout)
    );
    assert_eq!(device.arena_resets(first.slot), resets);

    // Exactly one rewind per recorded frame.
    let retry = begin(&mut device);
    assert_eq!(retry.slot, first.slot);
    assert_eq!(device.arena_resets(first.slot), resets + 1);
    device.end_frame().unwrap();
    assert_clean(&backend);
}

#[test]
fn safe_mode_uploads_synchronously_and_idles() {
    let (backend, mut device) = device_with(config().with_safe_mode(true));
    let buffer = device.create_buffer(&BufferDesc::storage("particles", 128));

    begin(&mut device);
    let mark = backend.call_count();
    device.upload_buffer(buffer, &[7; 128]);
    assert_eq!(device.pending_copy_count(), 0);
    device.end_frame().unwrap();

    let calls = backend.calls_since(mark);
    assert_eq!(count(&calls, |call| matches!(call, BackendCall::WriteStaging { .. })), 0);
    assert_eq!(count(&calls, |call| matches!(call, BackendCall::UploadBlocking { .. })), 1);
    let present_at = calls
        .iter()
        .position(|call| matches!(call, BackendCall::Present { .. }))
        .unwrap();
    assert!(calls[present_at..].iter().any(|call| matches!(call, BackendCall::WaitIdle)));
    assert_eq!(backend.pending_batches(), 0);
    assert_eq!(backend.contents(buffer_id(&device, buffer)).unwrap(), vec![7; 128]);
    assert_clean(&backend);
}

#[test]
fn invalid_config_is_rejected() {
    let backend = keel_rhi::headless::HeadlessBackend::new();
    let result = keel_rhi::RenderDevice::new(backend.clone(), RhiConfig::default().with_frames_in_flight(0));
    assert!(matches!(result, Err(keel_rhi::RhiError::InvalidConfig(_))));
    assert_eq!(backend.live_objects(), 0);
}
