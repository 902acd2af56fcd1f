use std::{collections::HashSet, sync::Arc};

use cinder_gpu::{
    config::GpuCoreConfig,
    gpu_core::GpuCore,
    linear_allocator::LinearAllocatorType,
    pipeline::{BindingSlot, ShaderBindings},
};
use cinder_rhi::{
    barrier::{ResourceBarrier, ResourceId, Subresource},
    descriptor::{DescriptorHeapType, ViewDesc},
    headless::{ExecutedBatch, HeadlessDevice, RecordedCommand},
    pipeline::{IndexFormat, PipelineStateDesc},
    queue_type::QueueType,
    resource::{Format, HeapKind, ResourceDesc},
    resource_state::ResourceStates,
    root_signature::{DescriptorRange, DescriptorRangeType, RootParameter, RootSignatureDesc, RootViewKind},
};

fn core_with(config: GpuCoreConfig) -> Arc<GpuCore<HeadlessDevice>> {
    cinder_crate_tools::init_log::init_test_log();
    GpuCore::new(Arc::new(HeadlessDevice::new()), config).unwrap()
}

fn core() -> Arc<GpuCore<HeadlessDevice>> {
    core_with(GpuCoreConfig::default())
}

/// 所有执行过的 transition barrier：(队列, 资源, before, after)
fn transitions(batches: &[ExecutedBatch]) -> Vec<(QueueType, ResourceId, ResourceStates, ResourceStates)> {
    let mut result = Vec::new();
    for batch in batches {
        for list in &batch.command_lists {
            for command in &list.commands {
                let RecordedCommand::Barriers(barriers) = command else {
                    continue;
                };
                for recorded in barriers {
                    if let ResourceBarrier::Transition {
                        resource, before, after, ..
                    } = recorded.barrier
                    {
                        result.push((batch.queue_type, resource, before, after));
                    }
                }
            }
        }
    }
    result
}

/// 一次提交中最后一个 command list 是上下文自己的 command list
fn main_commands(batch: &ExecutedBatch) -> &[RecordedCommand] {
    &batch.command_lists.last().unwrap().commands
}

fn position(commands: &[RecordedCommand], predicate: impl Fn(&RecordedCommand) -> bool) -> usize {
    commands.iter().position(predicate).unwrap()
}

#[test]
fn test_single_transition_emits_exactly_one_barrier() {
    let core = core();
    let texture = core
        .create_texture(
            &ResourceDesc::texture_2d(128, 128, 1, 1, Format::Rgba8Unorm).with_render_target(),
            "color",
        )
        .unwrap();

    let mut ctx = core.begin_context("first", QueueType::Graphics);
    ctx.transition_barrier(texture.handle(), ResourceStates::RENDER_TARGET, Subresource::All, false);
    ctx.transition_barrier(texture.handle(), ResourceStates::RENDER_TARGET, Subresource::All, true);
    ctx.finish(true);

    let batches = core.device().take_executed_batches();
    assert_eq!(batches.len(), 1);
    // pending barrier 的辅助 command list + 上下文的 command list
    assert_eq!(batches[0].command_lists.len(), 2);
    assert_eq!(
        transitions(&batches),
        vec![(
            QueueType::Graphics,
            texture.id(),
            ResourceStates::COMMON,
            ResourceStates::RENDER_TARGET
        )]
    );
    assert_eq!(
        core.resource_states().states_of(texture.handle()).unwrap().uniform_state(),
        Some(ResourceStates::RENDER_TARGET)
    );

    // 全局状态已经是目标状态，不再需要 barrier
    let mut ctx = core.begin_context("second", QueueType::Graphics);
    ctx.transition_barrier(texture.handle(), ResourceStates::RENDER_TARGET, Subresource::All, false);
    ctx.finish(true);

    let batches = core.device().take_executed_batches();
    assert_eq!(batches[0].command_lists.len(), 1);
    assert!(transitions(&batches).is_empty());
}

#[test]
fn test_locally_known_state_is_recorded_inline() {
    let core = core();
    let buffer = core.create_buffer(4096, HeapKind::Default, "buffer").unwrap();

    let mut ctx = core.begin_context("copy-chain", QueueType::Copy);
    ctx.transition_barrier(buffer.handle(), ResourceStates::COPY_DEST, Subresource::All, false);
    ctx.transition_barrier(buffer.handle(), ResourceStates::COPY_SOURCE, Subresource::All, true);
    ctx.finish(true);

    let batches = core.device().take_executed_batches();
    assert_eq!(batches.len(), 1);
    let main = main_commands(&batches[0]);
    assert!(main.iter().any(|command| matches!(
        command,
        RecordedCommand::Barriers(barriers) if barriers.iter().any(|recorded| matches!(
            recorded.barrier,
            ResourceBarrier::Transition { before: ResourceStates::COPY_DEST, after: ResourceStates::COPY_SOURCE, .. }
        ))
    )));
    assert_eq!(transitions(&batches).len(), 2);
    assert_eq!(
        core.resource_states().states_of(buffer.handle()).unwrap().uniform_state(),
        Some(ResourceStates::COPY_SOURCE)
    );
}

#[test]
fn test_compute_context_redirects_graphics_only_barrier() {
    let core = core();
    let texture = core
        .create_texture(
            &ResourceDesc::texture_2d(64, 64, 1, 1, Format::Rgba8Unorm).with_render_target(),
            "target",
        )
        .unwrap();

    let mut ctx = core.begin_context("async-compute", QueueType::Compute);
    ctx.transition_barrier(texture.handle(), ResourceStates::RENDER_TARGET, Subresource::All, false);
    let fence = ctx.finish(true);
    assert_eq!(fence.queue_type(), QueueType::Compute);

    let batches = core.device().take_executed_batches();
    let queues: Vec<QueueType> = batches.iter().map(|batch| batch.queue_type).collect();
    assert_eq!(queues, vec![QueueType::Graphics, QueueType::Compute]);
    assert_eq!(
        transitions(&batches),
        vec![(
            QueueType::Graphics,
            texture.id(),
            ResourceStates::COMMON,
            ResourceStates::RENDER_TARGET
        )]
    );
    assert_eq!(batches[1].command_lists.len(), 1);
    assert_eq!(
        core.resource_states().states_of(texture.handle()).unwrap().uniform_state(),
        Some(ResourceStates::RENDER_TARGET)
    );
}

#[test]
fn test_copy_context_redirects_shader_resource_barrier() {
    let core = core();
    let buffer = core.create_buffer(256, HeapKind::Default, "buffer").unwrap();

    let mut ctx = core.begin_context("upload", QueueType::Copy);
    ctx.transition_barrier(buffer.handle(), ResourceStates::NON_PIXEL_SHADER_RESOURCE, Subresource::All, false);
    ctx.finish(true);

    let batches = core.device().take_executed_batches();
    let queues: Vec<QueueType> = batches.iter().map(|batch| batch.queue_type).collect();
    assert_eq!(queues, vec![QueueType::Graphics, QueueType::Copy]);
}

#[test]
fn test_legal_pending_barriers_stay_on_own_queue() {
    let core = core();
    let buffer = core
        .create_resource(
            &ResourceDesc::buffer(1024, HeapKind::Default).with_unordered_access(),
            ResourceStates::COMMON,
            "uav",
        )
        .unwrap();

    let mut ctx = core.begin_context("simulate", QueueType::Compute);
    ctx.transition_barrier(buffer.handle(), ResourceStates::UNORDERED_ACCESS, Subresource::All, false);
    ctx.finish(true);

    let batches = core.device().take_executed_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].queue_type, QueueType::Compute);
    assert_eq!(batches[0].command_lists.len(), 2);
}

#[test]
fn test_fence_completes_only_after_wait() {
    let core = core();
    let ctx = core.begin_context("empty", QueueType::Graphics);
    let fence = ctx.finish(false);

    assert!(!core.queues().is_fence_completed(fence));
    core.queues().wait_for_fence(fence);
    assert!(core.queues().is_fence_completed(fence));
}

#[test]
fn test_command_lists_and_sessions_are_pooled() {
    let core = core();
    for _ in 0..3 {
        core.begin_context("frame", QueueType::Graphics).finish(true);
    }
    assert_eq!(core.contexts().created_count(), 1);
    assert_eq!(core.queues().graphics().command_list_pool().created_count(), 1);

    // 前一个上下文还未完成时，需要新的会话与 command list
    let pending = core.begin_context("a", QueueType::Compute).finish(false);
    let ctx = core.begin_context("b", QueueType::Compute);
    assert_eq!(core.contexts().created_count(), 3);
    assert_eq!(core.queues().compute().command_list_pool().created_count(), 2);
    ctx.finish(true);
    core.queues().wait_for_fence(pending);
}

#[test]
fn test_abandon_discards_recorded_state() {
    let core = core();
    let buffer = core
        .create_resource(
            &ResourceDesc::buffer(1024, HeapKind::Default).with_unordered_access(),
            ResourceStates::COMMON,
            "scratch",
        )
        .unwrap();

    let mut ctx = core.begin_context("cancelled", QueueType::Compute);
    ctx.transition_barrier(buffer.handle(), ResourceStates::UNORDERED_ACCESS, Subresource::All, true);
    ctx.abandon();

    core.device().advance_all();
    assert!(core.device().take_executed_batches().is_empty());
    assert_eq!(
        core.resource_states().states_of(buffer.handle()).unwrap().uniform_state(),
        Some(ResourceStates::COMMON)
    );

    let ctx = core.begin_context("retry", QueueType::Compute);
    assert_eq!(core.contexts().created_count(), 1);
    assert_eq!(ctx.state_tracker().num_pending_transitions(), 0);
    ctx.finish(true);
}

#[test]
fn test_destroyed_handle_is_ignored() {
    let core = core();
    let handle = core.create_buffer(256, HeapKind::Default, "gone").unwrap().handle();
    core.destroy_resource(handle);

    let mut ctx = core.begin_context("stale", QueueType::Graphics);
    ctx.transition_barrier(handle, ResourceStates::COPY_DEST, Subresource::All, true);
    ctx.copy_resource(handle, handle);
    ctx.finish(true);

    let batches = core.device().take_executed_batches();
    assert!(transitions(&batches).is_empty());
    assert!(!main_commands(&batches[0])
        .iter()
        .any(|command| matches!(command, RecordedCommand::CopyResource { .. })));
}

#[test]
fn test_write_buffer_and_queries_on_copy_queue() {
    let core = core();
    let buffer = core.create_buffer(1024, HeapKind::Default, "vertices").unwrap();
    let readback = core.create_buffer(64, HeapKind::Readback, "timestamps").unwrap();
    let query_heap = core.create_query_heap(4, "timestamps").unwrap();

    let mut ctx = core.begin_context("upload", QueueType::Copy);
    ctx.write_buffer(buffer.handle(), 16, &[1, 2, 3, 4, 5, 6, 7, 8]);
    ctx.fill_buffer(buffer.handle(), 64, 0xdead_beef, 32);
    ctx.end_query(&query_heap, 0);
    ctx.resolve_query_data(&query_heap, 0, 1, readback.handle(), 0);

    let upload = ctx.allocate_upload_memory(4, 4);
    upload.write(&[9, 9, 9, 9]);
    assert_eq!(upload.resource().read_mapped(upload.offset(), 4), Some(vec![9, 9, 9, 9]));
    ctx.finish(true);

    let batches = core.device().take_executed_batches();
    let main = main_commands(&batches[0]);
    let copies: Vec<(ResourceId, u64, u64)> = main
        .iter()
        .filter_map(|command| match command {
            RecordedCommand::CopyBufferRegion {
                dst, dst_offset, num_bytes, ..
            } => Some((*dst, *dst_offset, *num_bytes)),
            _ => None,
        })
        .collect();
    assert_eq!(copies, vec![(buffer.id(), 16, 8), (buffer.id(), 64, 32)]);
    assert!(main.contains(&RecordedCommand::EndQuery(0)));

    // readback buffer 初始就是 COPY_DEST，只有目标 buffer 需要 barrier
    assert_eq!(
        transitions(&batches),
        vec![(QueueType::Copy, buffer.id(), ResourceStates::COMMON, ResourceStates::COPY_DEST)]
    );
}

fn blur_root_signature() -> RootSignatureDesc {
    RootSignatureDesc::new(vec![
        RootParameter::table(vec![DescriptorRange::new(DescriptorRangeType::Srv, 2, 0)]),
        RootParameter::view(RootViewKind::Cbv, 0),
        RootParameter::constants(2, 1),
    ])
}

fn blur_bindings() -> ShaderBindings {
    ShaderBindings::new()
        .with("input", BindingSlot::Table { root_index: 0, offset: 0 })
        .with("history", BindingSlot::Table { root_index: 0, offset: 1 })
        .with(
            "frame",
            BindingSlot::RootView {
                kind: RootViewKind::Cbv,
                root_index: 1,
            },
        )
        .with("params", BindingSlot::Constants { root_index: 2 })
}

#[test]
fn test_dispatch_commits_staged_descriptors() {
    let core = core();
    let pipeline = core
        .create_pipeline_state(PipelineStateDesc::compute("blur"), &blur_root_signature(), blur_bindings())
        .unwrap();
    let input = core.create_buffer(4096, HeapKind::Default, "input").unwrap();
    let srv = core.create_shader_resource_view(input.handle()).unwrap();

    let mut ctx = core.begin_context("blur", QueueType::Compute);
    {
        let mut compute = ctx.compute();
        compute.set_pipeline_state(&pipeline);
        compute.set_shader_resource_view("input", input.handle(), Some(&srv));
        compute.set_shader_resource_view("missing", input.handle(), Some(&srv));
        compute.set_dynamic_constant_buffer_view("frame", &[0u8; 64]);
        compute.set_constants("params", &[1, 2]);
        compute.dispatch_1d(100, 64);
    }
    ctx.finish(true);

    let batches = core.device().take_executed_batches();
    assert_eq!(
        transitions(&batches),
        vec![(
            QueueType::Compute,
            input.id(),
            ResourceStates::COMMON,
            ResourceStates::NON_PIXEL_SHADER_RESOURCE
        )]
    );

    let main = main_commands(&batches[0]);
    let heaps = position(main, |command| matches!(command, RecordedCommand::SetDescriptorHeaps(_)));
    let table = position(main, |command| {
        matches!(command, RecordedCommand::SetRootDescriptorTable { root_index: 0, .. })
    });
    let cbv = position(main, |command| {
        matches!(
            command,
            RecordedCommand::SetRootView {
                kind: RootViewKind::Cbv,
                root_index: 1,
                ..
            }
        )
    });
    let dispatch = position(main, |command| matches!(command, RecordedCommand::Dispatch([2, 1, 1])));
    assert!(heaps < table && table < dispatch && cbv < dispatch);
    assert!(main.iter().any(|command| matches!(
        command,
        RecordedCommand::SetRootConstants { root_index: 2, values, .. } if values == &vec![1, 2]
    )));

    let RecordedCommand::SetRootDescriptorTable { base, .. } = &main[table] else {
        unreachable!();
    };
    assert_eq!(
        core.device().descriptor_at_gpu(*base),
        Some(ViewDesc::ShaderResource { resource: input.id() })
    );
}

#[test]
fn test_shader_visible_heap_switch_rebinds_heaps() {
    let core = core_with(GpuCoreConfig {
        descriptors_per_shader_visible_heap: 4,
        ..Default::default()
    });
    let pipeline = core
        .create_pipeline_state(PipelineStateDesc::compute("blur"), &blur_root_signature(), blur_bindings())
        .unwrap();
    let input = core.create_buffer(4096, HeapKind::Default, "input").unwrap();
    let srv = core.create_shader_resource_view(input.handle()).unwrap();

    let mut ctx = core.begin_context("blur-twice", QueueType::Compute);
    {
        let mut compute = ctx.compute();
        compute.set_pipeline_state(&pipeline);
        for _ in 0..3 {
            compute.set_shader_resource_view("input", input.handle(), Some(&srv));
            compute.dispatch(1, 1, 1);
        }
    }
    ctx.finish(true);

    let batches = core.device().take_executed_batches();
    let main = main_commands(&batches[0]);
    let heap_binds = main
        .iter()
        .filter(|command| matches!(command, RecordedCommand::SetDescriptorHeaps(_)))
        .count();
    // 每个 heap 只能放下两份 table
    assert_eq!(heap_binds, 2);
    assert_eq!(core.contexts().heap_pool(DescriptorHeapType::CbvSrvUav).created_count(), 2);
}

#[test]
fn test_graphics_draw_records_render_state() {
    let core = core();
    let pipeline = core
        .create_pipeline_state(
            PipelineStateDesc::graphics("triangle", vec![Format::Rgba8Unorm], Some(Format::D32Float)),
            &RootSignatureDesc::new(vec![]),
            ShaderBindings::new(),
        )
        .unwrap();
    let color = core
        .create_texture(
            &ResourceDesc::texture_2d(32, 32, 1, 1, Format::Rgba8Unorm).with_render_target(),
            "color",
        )
        .unwrap();
    let depth = core
        .create_texture(&ResourceDesc::texture_2d(32, 32, 1, 1, Format::D32Float), "depth")
        .unwrap();
    let rtv = core.create_render_target_view(color.handle(), 0).unwrap();
    let dsv = core.create_depth_stencil_view(depth.handle(), false).unwrap();

    let mut ctx = core.begin_context("main-pass", QueueType::Graphics);
    {
        let mut graphics = ctx.graphics();
        graphics.set_pipeline_state(&pipeline);
        graphics.set_render_targets(
            &[(color.handle(), rtv.descriptor_handle(0))],
            Some((depth.handle(), dsv.descriptor_handle(0))),
        );
        graphics.clear_color(color.handle(), rtv.descriptor_handle(0), [0.0, 0.0, 0.0, 1.0]);
        graphics.clear_depth(depth.handle(), dsv.descriptor_handle(0), 1.0, 0);
        graphics.set_viewport_and_scissor(0, 0, 32, 32);
        graphics.set_dynamic_vertex_buffer(0, &[0u8; 36], 12);
        graphics.set_dynamic_index_buffer(&[0u8; 6], IndexFormat::U16);
        graphics.draw_indexed(3, 0, 0);
        graphics.draw(3, 0);
    }
    ctx.finish(true);

    let batches = core.device().take_executed_batches();
    let mut barriers = transitions(&batches);
    barriers.sort_by_key(|(_, resource, ..)| resource.0);
    assert_eq!(
        barriers,
        vec![
            (QueueType::Graphics, color.id(), ResourceStates::COMMON, ResourceStates::RENDER_TARGET),
            (QueueType::Graphics, depth.id(), ResourceStates::COMMON, ResourceStates::DEPTH_WRITE),
        ]
    );

    let main = main_commands(&batches[0]);
    let clear = position(main, |command| matches!(command, RecordedCommand::ClearRenderTarget { .. }));
    let draw = position(main, |command| matches!(command, RecordedCommand::Draw { vertex_count: 3, .. }));
    let draw_indexed = position(main, |command| {
        matches!(command, RecordedCommand::DrawIndexed { index_count: 3, .. })
    });
    assert!(clear < draw_indexed && draw_indexed < draw);
    assert!(main.iter().any(|command| matches!(command, RecordedCommand::SetViewports(_))));
    assert!(main.iter().any(|command| matches!(command, RecordedCommand::SetScissorRects(_))));
}

#[test]
#[should_panic]
fn test_copy_context_has_no_compute_layer() {
    let core = core();
    let mut ctx = core.begin_context("copy", QueueType::Copy);
    ctx.compute();
}

#[test]
fn test_linear_allocations_span_pages_and_recycle() {
    const PAGE_SIZE: u64 = 4096;
    let core = core_with(GpuCoreConfig {
        cpu_linear_page_size: PAGE_SIZE,
        ..Default::default()
    });

    let mut ctx = core.begin_context("constants", QueueType::Graphics);
    let mut pages = HashSet::new();
    for _ in 0..3 {
        let allocation = ctx.allocate_upload_memory(2000, 256);
        assert_eq!(allocation.gpu_address() % 256, 0);
        assert!(allocation.offset() + allocation.size() <= allocation.page().size());
        pages.insert(allocation.page().id());
    }
    assert!(pages.len() >= 2);
    ctx.finish(true);

    let manager = core.contexts().page_manager(LinearAllocatorType::CpuWritable);
    let created = manager.created_count();
    let mut ctx = core.begin_context("constants", QueueType::Graphics);
    let allocation = ctx.allocate_upload_memory(2000, 256);
    assert!(pages.contains(&allocation.page().id()));
    assert_eq!(manager.created_count(), created);
    ctx.finish(true);
}

#[test]
fn test_freed_descriptor_not_visible_before_release() {
    let core = core();
    let first = core.allocate_descriptors(DescriptorHeapType::CbvSrvUav, 1);
    let offset = first.offset_in_page();
    drop(first);

    let second = core.allocate_descriptors(DescriptorHeapType::CbvSrvUav, 1);
    assert_ne!(second.offset_in_page(), offset);

    core.release_stale_descriptors();
    let third = core.allocate_descriptors(DescriptorHeapType::CbvSrvUav, 1);
    assert_eq!(third.offset_in_page(), offset);
}

#[test]
fn test_destroy_during_recording_keeps_state_removed() {
    let core = core();
    let buffer = core.create_buffer(256, HeapKind::Default, "transient").unwrap();
    let handle = buffer.handle();
    drop(buffer);

    let mut ctx = core.begin_context("late-destroy", QueueType::Copy);
    ctx.transition_barrier(handle, ResourceStates::COPY_DEST, Subresource::All, false);
    assert!(core.destroy_resource(handle));
    assert!(core.resource_states().states_of(handle).is_none());
    ctx.finish(true);
    core.idle_gpu();

    assert!(core.resource_states().is_empty());
    assert!(core.resource_states().states_of(handle).is_none());
    assert!(core.resources().is_empty());
    assert!(transitions(&core.device().take_executed_batches()).is_empty());
}

#[test]
fn test_dropped_context_returns_pooled_objects() {
    let core = core();
    let buffer = core
        .create_resource(
            &ResourceDesc::buffer(1024, HeapKind::Default).with_unordered_access(),
            ResourceStates::COMMON,
            "scratch",
        )
        .unwrap();

    let mut ctx = core.begin_context("forgotten", QueueType::Compute);
    ctx.transition_barrier(buffer.handle(), ResourceStates::UNORDERED_ACCESS, Subresource::All, true);
    drop(ctx);

    core.device().advance_all();
    assert!(core.device().take_executed_batches().is_empty());
    assert_eq!(
        core.resource_states().states_of(buffer.handle()).unwrap().uniform_state(),
        Some(ResourceStates::COMMON)
    );

    // 会话与 command list 都回到了池子里
    let ctx = core.begin_context("retry", QueueType::Compute);
    assert_eq!(core.contexts().created_count(), 1);
    assert_eq!(core.queues().compute().command_list_pool().created_count(), 1);
    assert_eq!(ctx.state_tracker().num_pending_transitions(), 0);
    ctx.finish(true);
}

#[test]
#[should_panic]
fn test_fill_buffer_rejects_unaligned_length() {
    let core = core();
    let buffer = core.create_buffer(256, HeapKind::Default, "fill").unwrap();
    let mut ctx = core.begin_context("fill", QueueType::Copy);
    ctx.fill_buffer(buffer.handle(), 0, 0xdead_beef, 6);
}
