use crate::{
    barrier::{ResourceBarrier, ResourceId},
    descriptor::{CpuDescriptorHandle, GpuDescriptorHandle},
    device::{NativeCommandList, NativeResource},
    headless::{
        HeadlessDevice,
        objects::{HeadlessDescriptorHeap, HeadlessPipelineState, HeadlessQueryHeap, HeadlessResource, HeadlessRootSignature},
        timeline::RecordedCommandList,
    },
    pipeline::{IndexBufferView, PrimitiveTopology, ScissorRect, VertexBufferView, Viewport},
    queue_type::QueueType,
    root_signature::{BindPoint, RootViewKind},
    vk_mapping::{self, VkResourceState},
};

/// 录制下来的 barrier，附带它在 Vulkan 中的源/目标状态
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedBarrier {
    pub barrier: ResourceBarrier,
    pub vk: Option<(VkResourceState, VkResourceState)>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RecordedCommand {
    Barriers(Vec<RecordedBarrier>),
    SetDescriptorHeaps(Vec<u64>),
    SetRootSignature {
        bind_point: BindPoint,
        root_signature: u64,
    },
    SetPipelineState(String),
    SetRootDescriptorTable {
        bind_point: BindPoint,
        root_index: u32,
        base: GpuDescriptorHandle,
    },
    SetRootView {
        bind_point: BindPoint,
        kind: RootViewKind,
        root_index: u32,
        gpu_address: u64,
    },
    SetRootConstants {
        bind_point: BindPoint,
        root_index: u32,
        values: Vec<u32>,
        dest_offset: u32,
    },
    CopyBufferRegion {
        dst: ResourceId,
        dst_offset: u64,
        src: ResourceId,
        src_offset: u64,
        num_bytes: u64,
    },
    CopyResource {
        dst: ResourceId,
        src: ResourceId,
    },
    EndQuery(u32),
    ResolveQueryData {
        start_index: u32,
        num_queries: u32,
        dst: ResourceId,
        dst_offset: u64,
    },
    Dispatch([u32; 3]),
    SetRenderTargets {
        render_targets: Vec<CpuDescriptorHandle>,
        depth_stencil: Option<CpuDescriptorHandle>,
    },
    ClearRenderTarget {
        render_target: CpuDescriptorHandle,
        color: [f32; 4],
    },
    ClearDepthStencil {
        depth_stencil: CpuDescriptorHandle,
        depth: f32,
        stencil: u8,
    },
    SetViewports(Vec<Viewport>),
    SetScissorRects(Vec<ScissorRect>),
    SetPrimitiveTopology(PrimitiveTopology),
    SetVertexBuffers {
        start_slot: u32,
        views: Vec<VertexBufferView>,
    },
    SetIndexBuffer(IndexBufferView),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    },
    BeginEvent(String),
    EndEvent,
}

/// 只负责录制命令的 command list
pub struct HeadlessCommandList {
    name: String,
    queue_type: QueueType,
    commands: Vec<RecordedCommand>,
    closed: bool,
    reset_count: u32,
}

// new & init
impl HeadlessCommandList {
    pub(crate) fn new(queue_type: QueueType, name: &str) -> Self {
        // 和 D3D12 一致：创建之后即处于录制状态
        Self {
            name: name.to_string(),
            queue_type,
            commands: Vec::new(),
            closed: false,
            reset_count: 0,
        }
    }
}

// getters
impl HeadlessCommandList {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[inline]
    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    #[inline]
    pub fn reset_count(&self) -> u32 {
        self.reset_count
    }

    pub(crate) fn snapshot(&self) -> RecordedCommandList {
        RecordedCommandList {
            name: self.name.clone(),
            commands: self.commands.clone(),
        }
    }
}

// tools
impl HeadlessCommandList {
    fn record(&mut self, command: RecordedCommand) {
        debug_assert!(!self.closed, "向已关闭的 command list 录制命令: {}", self.name);
        self.commands.push(command);
    }

    fn assert_queue(&self, required: QueueType, what: &str) {
        debug_assert!(
            self.queue_type.supports(required),
            "{} command list 不支持 {}: {}",
            self.queue_type,
            what,
            self.name
        );
    }
}

impl NativeCommandList<HeadlessDevice> for HeadlessCommandList {
    fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    fn reset(&mut self) {
        self.commands.clear();
        self.closed = false;
        self.reset_count += 1;
    }

    fn close(&mut self) {
        debug_assert!(!self.closed, "command list 被重复关闭: {}", self.name);
        self.closed = true;
    }

    fn resource_barrier(&mut self, barriers: &[ResourceBarrier]) {
        for barrier in barriers {
            debug_assert!(
                barrier.is_legal_on(self.queue_type),
                "{} command list 无法执行 barrier {:?}",
                self.queue_type,
                barrier
            );
        }
        let barriers = barriers
            .iter()
            .map(|barrier| {
                let vk = vk_mapping::transition_to_vk(barrier);
                if let Some((src, dst)) = vk {
                    log::trace!("barrier layout: {:?} -> {:?}", src.layout, dst.layout);
                }
                RecordedBarrier { barrier: *barrier, vk }
            })
            .collect();
        self.record(RecordedCommand::Barriers(barriers));
    }

    fn set_descriptor_heaps(&mut self, heaps: &[&HeadlessDescriptorHeap]) {
        self.assert_queue(QueueType::Compute, "descriptor heap");
        self.record(RecordedCommand::SetDescriptorHeaps(heaps.iter().map(|heap| heap.id()).collect()));
    }

    fn set_root_signature(&mut self, bind_point: BindPoint, root_signature: &HeadlessRootSignature) {
        self.record(RecordedCommand::SetRootSignature {
            bind_point,
            root_signature: root_signature.id(),
        });
    }

    fn set_pipeline_state(&mut self, pipeline_state: &HeadlessPipelineState) {
        self.record(RecordedCommand::SetPipelineState(pipeline_state.desc().name.clone()));
    }

    fn set_root_descriptor_table(&mut self, bind_point: BindPoint, root_index: u32, base: GpuDescriptorHandle) {
        self.record(RecordedCommand::SetRootDescriptorTable {
            bind_point,
            root_index,
            base,
        });
    }

    fn set_root_view(&mut self, bind_point: BindPoint, kind: RootViewKind, root_index: u32, gpu_address: u64) {
        self.record(RecordedCommand::SetRootView {
            bind_point,
            kind,
            root_index,
            gpu_address,
        });
    }

    fn set_root_constants(&mut self, bind_point: BindPoint, root_index: u32, values: &[u32], dest_offset: u32) {
        self.record(RecordedCommand::SetRootConstants {
            bind_point,
            root_index,
            values: values.to_vec(),
            dest_offset,
        });
    }

    fn copy_buffer_region(
        &mut self,
        dst: &HeadlessResource,
        dst_offset: u64,
        src: &HeadlessResource,
        src_offset: u64,
        num_bytes: u64,
    ) {
        debug_assert!(src_offset + num_bytes <= src.desc().buffer_size(), "copy 超出源 buffer 范围");
        debug_assert!(dst_offset + num_bytes <= dst.desc().buffer_size(), "copy 超出目标 buffer 范围");
        self.record(RecordedCommand::CopyBufferRegion {
            dst: dst.id(),
            dst_offset,
            src: src.id(),
            src_offset,
            num_bytes,
        });
    }

    fn copy_resource(&mut self, dst: &HeadlessResource, src: &HeadlessResource) {
        self.record(RecordedCommand::CopyResource {
            dst: dst.id(),
            src: src.id(),
        });
    }

    fn end_query(&mut self, query_heap: &HeadlessQueryHeap, index: u32) {
        debug_assert!(index < query_heap.count(), "query index 越界");
        self.record(RecordedCommand::EndQuery(index));
    }

    fn resolve_query_data(
        &mut self,
        query_heap: &HeadlessQueryHeap,
        start_index: u32,
        num_queries: u32,
        dst: &HeadlessResource,
        dst_offset: u64,
    ) {
        debug_assert!(start_index + num_queries <= query_heap.count(), "query 范围越界");
        self.record(RecordedCommand::ResolveQueryData {
            start_index,
            num_queries,
            dst: dst.id(),
            dst_offset,
        });
    }

    fn dispatch(&mut self, group_count_x: u32, group_count_y: u32, group_count_z: u32) {
        self.assert_queue(QueueType::Compute, "dispatch");
        self.record(RecordedCommand::Dispatch([group_count_x, group_count_y, group_count_z]));
    }

    fn set_render_targets(&mut self, render_targets: &[CpuDescriptorHandle], depth_stencil: Option<CpuDescriptorHandle>) {
        self.assert_queue(QueueType::Graphics, "render target");
        self.record(RecordedCommand::SetRenderTargets {
            render_targets: render_targets.to_vec(),
            depth_stencil,
        });
    }

    fn clear_render_target_view(&mut self, render_target: CpuDescriptorHandle, color: [f32; 4]) {
        self.assert_queue(QueueType::Graphics, "clear render target");
        self.record(RecordedCommand::ClearRenderTarget { render_target, color });
    }

    fn clear_depth_stencil_view(&mut self, depth_stencil: CpuDescriptorHandle, depth: f32, stencil: u8) {
        self.assert_queue(QueueType::Graphics, "clear depth stencil");
        self.record(RecordedCommand::ClearDepthStencil {
            depth_stencil,
            depth,
            stencil,
        });
    }

    fn set_viewports(&mut self, viewports: &[Viewport]) {
        self.record(RecordedCommand::SetViewports(viewports.to_vec()));
    }

    fn set_scissor_rects(&mut self, rects: &[ScissorRect]) {
        self.record(RecordedCommand::SetScissorRects(rects.to_vec()));
    }

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.record(RecordedCommand::SetPrimitiveTopology(topology));
    }

    fn set_vertex_buffers(&mut self, start_slot: u32, views: &[VertexBufferView]) {
        self.record(RecordedCommand::SetVertexBuffers {
            start_slot,
            views: views.to_vec(),
        });
    }

    fn set_index_buffer(&mut self, view: &IndexBufferView) {
        self.record(RecordedCommand::SetIndexBuffer(*view));
    }

    fn draw_instanced(&mut self, vertex_count: u32, instance_count: u32, start_vertex: u32, start_instance: u32) {
        self.assert_queue(QueueType::Graphics, "draw");
        self.record(RecordedCommand::Draw {
            vertex_count,
            instance_count,
            start_vertex,
            start_instance,
        });
    }

    fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) {
        self.assert_queue(QueueType::Graphics, "draw");
        self.record(RecordedCommand::DrawIndexed {
            index_count,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
        });
    }

    fn begin_event(&mut self, label: &str) {
        self.record(RecordedCommand::BeginEvent(label.to_string()));
    }

    fn end_event(&mut self) {
        self.record(RecordedCommand::EndEvent);
    }
}
