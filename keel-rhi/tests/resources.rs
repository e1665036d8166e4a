mod common;

use common::*;
use keel_rhi::headless::{BackendCall, ObjectKind};
use keel_rhi::{
    BindingPoint, BindingSource, BufferDesc, BufferHandle, ModelUniforms, PipelineVariant, TextureDesc, TextureFormat,
    TextureHandle,
};

#[test]
fn staged_uploads_land_after_the_frame_executes() {
    let (backend, mut device) = device();
    let buffer = device.create_buffer(&BufferDesc::vertex("mesh", 512));
    let id = buffer_id(&device, buffer);

    let info = begin(&mut device);
    let resets = device.arena_resets(info.slot);
    device.update_buffer(buffer, 0, &[1; 100]);
    assert_eq!(device.arena_offset(info.slot), 100);
    device.update_buffer(buffer, 300, &[2; 100]);
    // Aligned to 256 bytes, never rewinds within a frame.
    assert_eq!(device.arena_offset(info.slot), 356);
    assert_eq!(device.pending_copy_count(), 2);
    // Copies only run with the frame.
    assert_eq!(backend.contents(id).unwrap(), vec![0; 512]);
    device.end_frame().unwrap();
    assert_eq!(device.pending_copy_count(), 0);

    frame(&mut device);
    let reuse = begin(&mut device);
    assert_eq!(reuse.slot, info.slot);
    assert_eq!(device.arena_offset(info.slot), 0);
    assert_eq!(device.arena_resets(info.slot), resets + 1);
    device.end_frame().unwrap();

    let mut expected = vec![0; 512];
    expected[..100].fill(1);
    expected[300..400].fill(2);
    assert_eq!(backend.contents(id).unwrap(), expected);
    assert_clean(&backend);
}

#[test]
fn copies_run_in_an_upload_stream_submitted_ahead_of_rendering() {
    let (backend, mut device) = device();
    let buffer = device.create_buffer(&BufferDesc::vertex("mesh", 64));

    begin(&mut device);
    let mark = backend.call_count();
    device.upload_buffer(buffer, &[3; 64]);
    device.draw(PipelineVariant::Opaque, buffer, 3, &ModelUniforms::default());
    device.end_frame().unwrap();

    let calls = backend.calls_since(mark);
    let uploads = calls
        .iter()
        .find_map(|call| match call {
            BackendCall::BeginUploadCommands { stream } => Some(*stream),
            _ => None,
        })
        .unwrap();
    let copy_at = calls
        .iter()
        .position(|call| matches!(call, BackendCall::CopyToBuffer { stream, .. } if *stream == uploads))
        .unwrap();
    let barrier_at = calls
        .iter()
        .position(|call| matches!(call, BackendCall::TransferBarrier { stream } if *stream == uploads))
        .unwrap();
    let closed_at = calls
        .iter()
        .position(|call| matches!(call, BackendCall::EndCommands { stream } if *stream == uploads))
        .unwrap();
    assert!(copy_at < barrier_at && barrier_at < closed_at);

    let streams = calls
        .iter()
        .find_map(|call| match call {
            BackendCall::Submit { streams, .. } => Some(streams.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(streams.len(), 2);
    assert_eq!(streams[0], uploads);
    assert_clean(&backend);
}

#[test]
fn upload_inside_a_pass_reaches_draws_already_recorded_in_it() {
    let (backend, mut device) = device();
    let mesh = device.create_buffer(&BufferDesc::vertex("mesh", 64));
    let id = buffer_id(&device, mesh);

    begin(&mut device);
    device.begin_main_pass();
    let mark = backend.call_count();
    device.draw(PipelineVariant::Opaque, mesh, 3, &ModelUniforms::default());
    device.update_buffer(mesh, 0, &[6; 64]);
    device.draw(PipelineVariant::Opaque, mesh, 3, &ModelUniforms::default());
    device.end_main_pass();
    device.end_frame().unwrap();

    let calls = backend.calls_since(mark);
    // The pass stays open across the upload.
    let first_draw = calls.iter().position(|call| matches!(call, BackendCall::Draw(_))).unwrap();
    let second_draw = calls.iter().rposition(|call| matches!(call, BackendCall::Draw(_))).unwrap();
    assert!(!calls[first_draw..second_draw]
        .iter()
        .any(|call| matches!(call, BackendCall::EndPass | BackendCall::BeginPass { .. })));

    // Recorded after the first draw, executed before the whole graphics stream.
    let uploads = calls
        .iter()
        .find_map(|call| match call {
            BackendCall::BeginUploadCommands { stream } => Some(*stream),
            _ => None,
        })
        .unwrap();
    let copy_at = calls
        .iter()
        .position(|call| matches!(call, BackendCall::CopyToBuffer { stream, dst, .. } if *stream == uploads && *dst == id))
        .unwrap();
    assert!(first_draw < copy_at && copy_at < second_draw);
    let streams = calls
        .iter()
        .find_map(|call| match call {
            BackendCall::Submit { streams, .. } => Some(streams.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(streams.first(), Some(&uploads));
    assert_eq!(streams.len(), 2);

    device.wait_idle().unwrap();
    assert_eq!(backend.contents(id).unwrap(), vec![6; 64]);
    assert_clean(&backend);
}

#[test]
fn full_arena_falls_back_to_blocking_upload() {
    let (backend, mut device) = device_with(config().with_transient_arena_size(1024));
    let buffer = device.create_buffer(&BufferDesc::storage("big", 4096));
    let id = buffer_id(&device, buffer);
    let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();

    let info = begin(&mut device);
    device.update_buffer(buffer, 0, &data[..512]);
    let mark = backend.call_count();
    device.update_buffer(buffer, 512, &data[512..]);

    let calls = backend.calls_since(mark);
    assert_eq!(
        calls,
        vec![BackendCall::UploadBlocking {
            target: id,
            len: 3584
        }]
    );
    assert_eq!(device.arena_offset(info.slot), 512);
    assert_eq!(device.pending_copy_count(), 1);
    assert_eq!(backend.contents(id).unwrap()[512..], data[512..]);
    device.end_frame().unwrap();

    device.wait_idle().unwrap();
    assert_eq!(backend.contents(id).unwrap(), data);
    assert_clean(&backend);
}

#[test]
fn host_visible_writes_bypass_the_arena() {
    let (backend, mut device) = device();
    let buffer = device.create_buffer(&BufferDesc::uniform("material", 64));
    let id = buffer_id(&device, buffer);

    let info = begin(&mut device);
    device.update_buffer(buffer, 16, &[9; 16]);
    assert_eq!(device.arena_offset(info.slot), 0);
    assert_eq!(&backend.contents(id).unwrap()[16..32], &[9; 16]);
    device.end_frame().unwrap();
    assert_clean(&backend);
}

#[test]
fn out_of_range_writes_are_rejected() {
    let (backend, mut device) = device();
    let buffer = device.create_buffer(&BufferDesc::vertex("mesh", 64));
    let texture = device.create_texture(&TextureDesc::new_2d(4, 4, TextureFormat::Rgba8Unorm));

    let mark = backend.call_count();
    device.update_buffer(buffer, 60, &[1; 8]);
    device.update_buffer(buffer, u64::MAX, &[1; 8]);
    device.update_texture(texture, &[0; 63]);
    device.upload_buffer(buffer, &[]);
    assert_eq!(backend.call_count(), mark);

    device.update_texture(texture, &[5; 64]);
    assert_eq!(backend.contents(texture_id(&device, texture)).unwrap(), vec![5; 64]);
}

#[test]
fn none_handles_and_failures() {
    let (backend, mut device) = device();

    assert!(device.create_buffer(&BufferDesc::vertex("empty", 0)).is_none());
    assert!(device.create_texture(&TextureDesc::new_2d(0, 16, TextureFormat::Rgba8Unorm)).is_none());

    backend.fail_allocations(true);
    assert!(device.create_buffer(&BufferDesc::vertex("oom", 64)).is_none());
    assert!(device.create_texture(&TextureDesc::new_2d(4, 4, TextureFormat::Rgba8Unorm)).is_none());
    backend.fail_allocations(false);
    assert_eq!(device.buffer_count(), 0);
    assert_eq!(device.texture_count(), 0);

    // NONE is accepted everywhere and never touches the backend outside a frame.
    let mark = backend.call_count();
    device.upload_buffer(BufferHandle::NONE, &[1; 4]);
    device.update_texture(TextureHandle::NONE, &[1; 4]);
    device.destroy_buffer(BufferHandle::NONE);
    device.destroy_texture(TextureHandle::NONE);
    assert_eq!(backend.call_count(), mark);

    // Drawing from NONE binds the fallback buffer.
    begin(&mut device);
    let mark = backend.call_count();
    device.draw(PipelineVariant::Opaque, BufferHandle::NONE, 3, &ModelUniforms::default());
    device.end_frame().unwrap();
    let calls = backend.calls_since(mark);
    assert_eq!(count(&calls, |call| matches!(call, BackendCall::BindVertexBuffer { .. })), 1);
    assert_eq!(count(&calls, |call| matches!(call, BackendCall::Draw(_))), 1);
    assert_clean(&backend);
}

#[test]
fn destroyed_handles_are_dead_and_never_reused() {
    let (backend, mut device) = device();
    let first = device.create_buffer(&BufferDesc::vertex("a", 64));
    device.destroy_buffer(first);

    assert!(device.buffer_desc(first).is_none());
    assert!(device.with_buffer(first, |_| ()).is_none());

    let second = device.create_buffer(&BufferDesc::vertex("b", 64));
    assert_ne!(first, second);
    assert!(!second.is_none());

    let mark = backend.call_count();
    device.upload_buffer(first, &[1; 64]);
    device.destroy_buffer(first);
    assert_eq!(backend.call_count(), mark);

    begin(&mut device);
    let mark = backend.call_count();
    device.draw(PipelineVariant::Opaque, first, 3, &ModelUniforms::default());
    let calls = backend.calls_since(mark);
    assert_eq!(count(&calls, |call| matches!(call, BackendCall::Draw(_))), 0);
    device.end_frame().unwrap();
    assert_eq!(device.pending_release_count(), 1);
}

#[test]
fn released_buffer_is_freed_once_after_its_last_use() {
    let (backend, mut device) = device();
    let buffer = device.create_buffer(&BufferDesc::vertex("mesh", 64));
    let id = buffer_id(&device, buffer);

    begin(&mut device);
    device.draw(PipelineVariant::Opaque, buffer, 3, &ModelUniforms::default());
    device.end_frame().unwrap();
    let last_use = backend.submissions();

    device.destroy_buffer(buffer);
    assert!(device.buffer_desc(buffer).is_none());
    assert!(backend.is_live(id));

    frame(&mut device);
    assert!(backend.is_live(id));

    begin(&mut device);
    assert!(!backend.is_live(id));
    assert!(backend.completed_batches() >= last_use);
    device.end_frame().unwrap();

    for _ in 0..4 {
        frame(&mut device);
    }
    drop(device);
    assert_eq!(backend.free_count(id), 1);
    assert_clean(&backend);
}

#[test]
fn release_while_recording_waits_for_that_frame() {
    let (backend, mut device) = device();
    let buffer = device.create_buffer(&BufferDesc::vertex("mesh", 64));
    let id = buffer_id(&device, buffer);

    let info = begin(&mut device);
    device.draw(PipelineVariant::Opaque, buffer, 3, &ModelUniforms::default());
    device.destroy_buffer(buffer);
    // Later draws in the same frame see a dead handle.
    device.draw(PipelineVariant::Opaque, buffer, 3, &ModelUniforms::default());
    device.end_frame().unwrap();
    let submitted_at = backend.call_count();

    frame(&mut device);
    assert!(backend.is_live(id));
    let reuse = begin(&mut device);
    assert_eq!(reuse.slot, info.slot);
    assert!(!backend.is_live(id));
    assert!(backend.freed_at(id).unwrap() > submitted_at);
    device.end_frame().unwrap();
    assert_clean(&backend);
}

#[test]
fn shutdown_frees_everything_exactly_once() {
    let (backend, mut device) = device();
    let kept = device.create_buffer(&BufferDesc::vertex("kept", 64));
    let released = device.create_buffer(&BufferDesc::vertex("released", 64));
    let texture = device.create_texture(&TextureDesc::new_2d(2, 2, TextureFormat::Rgba8Unorm));

    begin(&mut device);
    device.draw(PipelineVariant::Opaque, kept, 3, &ModelUniforms::default());
    device.draw(PipelineVariant::Opaque, released, 3, &ModelUniforms::default());
    device.end_frame().unwrap();
    device.destroy_buffer(released);
    assert!(!texture.is_none());

    drop(device);
    assert_eq!(backend.live_objects(), 0);
    let freed = backend.freed_objects();
    let mut unique = freed.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), freed.len());
    assert_eq!(backend.live_count(ObjectKind::Buffer), 0);
    assert_clean(&backend);
}

#[test]
fn instance_buffer_patches_the_recording_slot() {
    let (backend, mut device) = device();
    let vertices = device.create_buffer(&BufferDesc::vertex("quad", 64));
    let instances = device.create_buffer(&BufferDesc::instance("instances", 1024));
    let instances_id = buffer_id(&device, instances);

    let info = begin(&mut device);
    device.draw_instanced(PipelineVariant::Opaque, vertices, 6, instances, 16, &ModelUniforms::default());
    assert_eq!(device.binding_source(BindingPoint::InstanceData), BindingSource::Buffer(instances));
    assert_eq!(
        device.slot_binding(info.slot, BindingPoint::InstanceData),
        Some(BindingSource::Buffer(instances))
    );
    let table = backend
        .calls()
        .iter()
        .rev()
        .find_map(|call| match call {
            BackendCall::BindBindingTable { table } => Some(*table),
            _ => None,
        })
        .unwrap();
    assert!(backend
        .table_bindings(table)
        .contains(&(BindingPoint::InstanceData, instances_id)));
    device.end_frame().unwrap();

    // The other slot picks the selection up when it is next recorded.
    let other = begin(&mut device);
    assert_ne!(other.slot, info.slot);
    assert_eq!(
        device.slot_binding(other.slot, BindingPoint::InstanceData),
        Some(BindingSource::Buffer(instances))
    );
    device.end_frame().unwrap();
    assert_clean(&backend);
}

#[test]
fn switching_instance_buffers_mid_frame_binds_a_fresh_table() {
    let (backend, mut device) = device();
    let vertices = device.create_buffer(&BufferDesc::vertex("quad", 64));
    let trees = device.create_buffer(&BufferDesc::instance("trees", 1024));
    let rocks = device.create_buffer(&BufferDesc::instance("rocks", 1024));
    let trees_id = buffer_id(&device, trees);
    let rocks_id = buffer_id(&device, rocks);
    let model = ModelUniforms::default();

    let info = begin(&mut device);
    let mark = backend.call_count();
    device.draw_instanced(PipelineVariant::Opaque, vertices, 6, trees, 8, &model);
    device.draw_instanced(PipelineVariant::Opaque, vertices, 6, rocks, 4, &model);
    device.draw_instanced(PipelineVariant::Opaque, vertices, 6, trees, 8, &model);
    device.end_frame().unwrap();

    let calls = backend.calls_since(mark);
    let bound: Vec<_> = calls
        .iter()
        .filter_map(|call| match call {
            BackendCall::BindBindingTable { table } => Some(*table),
            _ => None,
        })
        .collect();
    assert_eq!(bound.len(), 3);
    assert_ne!(bound[0], bound[1]);
    assert_ne!(bound[1], bound[2]);
    assert_ne!(bound[0], bound[2]);
    assert!(backend.table_bindings(bound[0]).contains(&(BindingPoint::InstanceData, trees_id)));
    assert!(backend.table_bindings(bound[1]).contains(&(BindingPoint::InstanceData, rocks_id)));
    assert!(backend.table_bindings(bound[2]).contains(&(BindingPoint::InstanceData, trees_id)));
    // Each table is written before it is bound and never after.
    for (i, table) in bound.iter().enumerate() {
        let bound_at = calls
            .iter()
            .position(|call| matches!(call, BackendCall::BindBindingTable { table: t } if t == table))
            .unwrap();
        let rewritten = calls[bound_at..]
            .iter()
            .any(|call| matches!(call, BackendCall::WriteBindingTable { table: t, .. } if t == table));
        assert!(!rewritten, "table {i} rewritten after being bound");
    }
    // Every table carries the whole binding set.
    assert_eq!(
        backend.table_bindings(bound[1]).len(),
        backend.table_bindings(bound[0]).len()
    );
    assert_eq!(device.binding_table_count(info.slot), 3);

    // The slot reuses its tables once its fence has been waited on.
    frame(&mut device);
    let reuse = begin(&mut device);
    assert_eq!(reuse.slot, info.slot);
    device.draw_instanced(PipelineVariant::Opaque, vertices, 6, rocks, 4, &model);
    device.draw_instanced(PipelineVariant::Opaque, vertices, 6, trees, 8, &model);
    device.end_frame().unwrap();
    assert_eq!(device.binding_table_count(info.slot), 3);
    assert_clean(&backend);
}

#[test]
fn indirect_draws_past_the_buffer_end_are_rejected() {
    let (backend, mut device) = device();
    let vertices = device.create_buffer(&BufferDesc::vertex("mesh", 64));
    // Four 16-byte records.
    let commands = device.create_buffer(&BufferDesc::indirect("commands", 64));
    let model = ModelUniforms::default();

    begin(&mut device);
    let mark = backend.call_count();
    device.draw_indirect(PipelineVariant::Opaque, vertices, commands, 0, 4, &model);
    device.draw_indirect(PipelineVariant::Opaque, vertices, commands, 16, 4, &model);
    device.draw_indirect(PipelineVariant::Opaque, vertices, commands, u64::MAX - 8, 1, &model);
    device.draw_indirect(PipelineVariant::Opaque, vertices, commands, 48, 1, &model);
    // The fallback buffer holds sixteen records.
    device.draw_indirect(PipelineVariant::Opaque, vertices, BufferHandle::NONE, 0, 17, &model);
    device.draw_indirect(PipelineVariant::Opaque, vertices, BufferHandle::NONE, 0, 16, &model);
    device.end_frame().unwrap();

    let calls = backend.calls_since(mark);
    let recorded: Vec<(u64, u32)> = calls
        .iter()
        .filter_map(|call| match call {
            BackendCall::DrawIndirect { offset, draw_count, .. } => Some((*offset, *draw_count)),
            _ => None,
        })
        .collect();
    assert_eq!(recorded, vec![(0, 4), (48, 1), (0, 16)]);
    assert_clean(&backend);
}

#[test]
fn destroying_a_bound_texture_reverts_to_the_fallback() {
    let (backend, mut device) = device();
    let texture = device.create_texture(&TextureDesc::new_2d(2, 2, TextureFormat::Rgba8Unorm));
    let id = texture_id(&device, texture);

    device.set_texture(BindingPoint::ColorTexture, texture);
    // Not a material binding.
    device.set_texture(BindingPoint::ShadowMap, texture);
    assert_eq!(device.binding_source(BindingPoint::ShadowMap), BindingSource::ShadowMap);

    let first = frame(&mut device);
    let second = frame(&mut device);
    assert_eq!(
        device.slot_binding(first.slot, BindingPoint::ColorTexture),
        Some(BindingSource::Texture(texture))
    );
    assert_eq!(
        device.slot_binding(second.slot, BindingPoint::ColorTexture),
        Some(BindingSource::Texture(texture))
    );

    device.destroy_texture(texture);
    assert_eq!(device.binding_source(BindingPoint::ColorTexture), BindingSource::Fallback);

    for _ in 0..3 {
        let info = frame(&mut device);
        assert_eq!(
            device.slot_binding(info.slot, BindingPoint::ColorTexture),
            Some(BindingSource::Fallback)
        );
    }
    assert!(!backend.is_live(id));
    assert_clean(&backend);
}
