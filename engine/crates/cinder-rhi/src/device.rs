//! 平台层 trait
//!
//! 编排核心对底层图形 API 的全部依赖都在这里。每个 backend 实现一个
//! [`RenderDevice`]，并通过关联类型给出自己的原生对象。

use std::{ptr::NonNull, time::Duration};

use crate::{
    barrier::{ResourceBarrier, ResourceId},
    descriptor::{CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapType, GpuDescriptorHandle, ViewDesc},
    pipeline::{IndexBufferView, PipelineStateDesc, PrimitiveTopology, ScissorRect, VertexBufferView, Viewport},
    queue_type::QueueType,
    resource::ResourceDesc,
    resource_state::ResourceStates,
    root_signature::{BindPoint, RootSignatureDesc, RootViewKind},
};

pub trait RenderDevice: Send + Sync + Sized + 'static {
    type Resource: NativeResource;
    type DescriptorHeap: NativeDescriptorHeap;
    type RootSignature: Send + Sync;
    type PipelineState: Send + Sync;
    type QueryHeap: Send + Sync;
    type CommandList: NativeCommandList<Self>;
    type Queue: NativeQueue<Self>;

    // create
    fn create_queue(&self, queue_type: QueueType) -> anyhow::Result<Self::Queue>;
    fn create_command_list(&self, queue_type: QueueType, debug_name: &str) -> anyhow::Result<Self::CommandList>;
    fn create_resource(
        &self,
        desc: &ResourceDesc,
        initial_state: ResourceStates,
        debug_name: &str,
    ) -> anyhow::Result<Self::Resource>;
    fn create_descriptor_heap(
        &self,
        desc: &DescriptorHeapDesc,
        debug_name: &str,
    ) -> anyhow::Result<Self::DescriptorHeap>;
    fn create_root_signature(&self, desc: &RootSignatureDesc) -> anyhow::Result<Self::RootSignature>;
    fn create_pipeline_state(
        &self,
        desc: &PipelineStateDesc,
        root_signature: &Self::RootSignature,
    ) -> anyhow::Result<Self::PipelineState>;
    fn create_query_heap(&self, count: u32, debug_name: &str) -> anyhow::Result<Self::QueryHeap>;

    // descriptors
    fn descriptor_increment_size(&self, heap_type: DescriptorHeapType) -> u32;
    fn create_view(&self, view: &ViewDesc, dest: CpuDescriptorHandle);
    /// 把 `sources` 中的每个 descriptor 依次复制到以 `dest_start` 开始的连续区域
    fn copy_descriptors(&self, dest_start: CpuDescriptorHandle, sources: &[CpuDescriptorHandle], heap_type: DescriptorHeapType);
}

pub trait NativeResource: Send + Sync {
    fn id(&self) -> ResourceId;
    /// buffer 的 GPU 虚拟地址，texture 为 0
    fn gpu_virtual_address(&self) -> u64;
    /// upload / readback 堆上的资源是持久映射的
    fn mapped_ptr(&self) -> Option<NonNull<u8>>;
}

pub trait NativeDescriptorHeap: Send + Sync {
    fn desc(&self) -> &DescriptorHeapDesc;
    fn cpu_start(&self) -> CpuDescriptorHandle;
    /// 只有 shader visible 的 heap 才有 GPU 句柄
    fn gpu_start(&self) -> Option<GpuDescriptorHandle>;
}

pub trait NativeQueue<D: RenderDevice>: Send + Sync {
    fn queue_type(&self) -> QueueType;
    fn execute_command_lists(&self, command_lists: &[&D::CommandList]);
    fn signal(&self, value: u64);
    fn completed_value(&self) -> u64;
    /// CPU 阻塞等待，`timeout` 为 None 时无限等待；超时返回 false
    fn wait_for_value(&self, value: u64, timeout: Option<Duration>) -> bool;
    /// GPU 侧等待 `other` 的 fence 达到 `value`，不阻塞 CPU
    fn gpu_wait(&self, other: &D::Queue, value: u64);
}

pub trait NativeCommandList<D: RenderDevice>: Send {
    fn queue_type(&self) -> QueueType;
    fn reset(&mut self);
    fn close(&mut self);

    // barrier & binding
    fn resource_barrier(&mut self, barriers: &[ResourceBarrier]);
    fn set_descriptor_heaps(&mut self, heaps: &[&D::DescriptorHeap]);
    fn set_root_signature(&mut self, bind_point: BindPoint, root_signature: &D::RootSignature);
    fn set_pipeline_state(&mut self, pipeline_state: &D::PipelineState);
    fn set_root_descriptor_table(&mut self, bind_point: BindPoint, root_index: u32, base: GpuDescriptorHandle);
    fn set_root_view(&mut self, bind_point: BindPoint, kind: RootViewKind, root_index: u32, gpu_address: u64);
    fn set_root_constants(&mut self, bind_point: BindPoint, root_index: u32, values: &[u32], dest_offset: u32);

    // copy
    fn copy_buffer_region(&mut self, dst: &D::Resource, dst_offset: u64, src: &D::Resource, src_offset: u64, num_bytes: u64);
    fn copy_resource(&mut self, dst: &D::Resource, src: &D::Resource);
    fn end_query(&mut self, query_heap: &D::QueryHeap, index: u32);
    fn resolve_query_data(
        &mut self,
        query_heap: &D::QueryHeap,
        start_index: u32,
        num_queries: u32,
        dst: &D::Resource,
        dst_offset: u64,
    );

    // compute
    fn dispatch(&mut self, group_count_x: u32, group_count_y: u32, group_count_z: u32);

    // graphics
    fn set_render_targets(&mut self, render_targets: &[CpuDescriptorHandle], depth_stencil: Option<CpuDescriptorHandle>);
    fn clear_render_target_view(&mut self, render_target: CpuDescriptorHandle, color: [f32; 4]);
    fn clear_depth_stencil_view(&mut self, depth_stencil: CpuDescriptorHandle, depth: f32, stencil: u8);
    fn set_viewports(&mut self, viewports: &[Viewport]);
    fn set_scissor_rects(&mut self, rects: &[ScissorRect]);
    fn set_primitive_topology(&mut self, topology: PrimitiveTopology);
    fn set_vertex_buffers(&mut self, start_slot: u32, views: &[VertexBufferView]);
    fn set_index_buffer(&mut self, view: &IndexBufferView);
    fn draw_instanced(&mut self, vertex_count: u32, instance_count: u32, start_vertex: u32, start_instance: u32);
    fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    );

    // debug
    fn begin_event(&mut self, label: &str);
    fn end_event(&mut self);
}
