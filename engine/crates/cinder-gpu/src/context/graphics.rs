use std::ops::{Deref, DerefMut};

use cinder_rhi::{
    descriptor::CpuDescriptorHandle,
    device::{NativeCommandList, RenderDevice},
    pipeline::{IndexBufferView, IndexFormat, PrimitiveTopology, ScissorRect, VertexBufferView, Viewport},
    resource_state::ResourceStates,
    root_signature::BindPoint,
};

use crate::{context::ComputeContext, resource::GpuResourceHandle};

/// graphics 层的操作：render target、固定管线状态与 draw
pub struct GraphicsContext<'a, D: RenderDevice> {
    compute: ComputeContext<'a, D>,
}

impl<'a, D: RenderDevice> Deref for GraphicsContext<'a, D> {
    type Target = ComputeContext<'a, D>;

    fn deref(&self) -> &Self::Target {
        &self.compute
    }
}

impl<D: RenderDevice> DerefMut for GraphicsContext<'_, D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.compute
    }
}

// new & init
impl<'a, D: RenderDevice> GraphicsContext<'a, D> {
    pub(super) fn new(compute: ComputeContext<'a, D>) -> Self {
        Self { compute }
    }
}

// render targets
impl<D: RenderDevice> GraphicsContext<'_, D> {
    /// 绑定 render target 与 depth stencil，资源转换到对应的可写状态
    pub fn set_render_targets(
        &mut self,
        render_targets: &[(GpuResourceHandle, CpuDescriptorHandle)],
        depth_stencil: Option<(GpuResourceHandle, CpuDescriptorHandle)>,
    ) {
        let mut rtv_handles = Vec::with_capacity(render_targets.len());
        for &(handle, rtv) in render_targets {
            let Some(resource) = self.resolve(handle) else {
                return;
            };
            self.track(&resource, ResourceStates::RENDER_TARGET);
            rtv_handles.push(rtv);
        }

        let dsv_handle = match depth_stencil {
            Some((handle, dsv)) => {
                let Some(resource) = self.resolve(handle) else {
                    return;
                };
                self.track(&resource, ResourceStates::DEPTH_WRITE);
                Some(dsv)
            }
            None => None,
        };

        self.native_list().set_render_targets(&rtv_handles, dsv_handle);
    }

    pub fn clear_color(&mut self, handle: GpuResourceHandle, rtv: CpuDescriptorHandle, color: [f32; 4]) {
        let Some(resource) = self.resolve(handle) else {
            return;
        };
        self.track(&resource, ResourceStates::RENDER_TARGET);
        self.flush_resource_barriers();
        self.native_list().clear_render_target_view(rtv, color);
    }

    pub fn clear_depth(&mut self, handle: GpuResourceHandle, dsv: CpuDescriptorHandle, depth: f32, stencil: u8) {
        let Some(resource) = self.resolve(handle) else {
            return;
        };
        self.track(&resource, ResourceStates::DEPTH_WRITE);
        self.flush_resource_barriers();
        self.native_list().clear_depth_stencil_view(dsv, depth, stencil);
    }
}

// fixed function state
impl<D: RenderDevice> GraphicsContext<'_, D> {
    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.native_list().set_viewports(&[viewport]);
    }

    pub fn set_scissor(&mut self, rect: ScissorRect) {
        self.native_list().set_scissor_rects(&[rect]);
    }

    /// viewport 与 scissor 覆盖同一块区域，深度范围为 [0, 1]
    pub fn set_viewport_and_scissor(&mut self, x: u32, y: u32, width: u32, height: u32) {
        self.set_viewport(Viewport {
            x: x as f32,
            y: y as f32,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        });
        self.set_scissor(ScissorRect {
            left: x as i32,
            top: y as i32,
            right: (x + width) as i32,
            bottom: (y + height) as i32,
        });
    }

    pub fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.native_list().set_primitive_topology(topology);
    }
}

// vertex & index
impl<D: RenderDevice> GraphicsContext<'_, D> {
    pub fn set_vertex_buffer(&mut self, slot: u32, handle: GpuResourceHandle, offset: u64, size_in_bytes: u32, stride_in_bytes: u32) {
        let Some(resource) = self.resolve(handle) else {
            return;
        };
        self.track(&resource, ResourceStates::VERTEX_AND_CONSTANT_BUFFER);
        let view = VertexBufferView {
            buffer_location: resource.gpu_virtual_address() + offset,
            size_in_bytes,
            stride_in_bytes,
        };
        self.native_list().set_vertex_buffers(slot, &[view]);
    }

    pub fn set_index_buffer(&mut self, handle: GpuResourceHandle, offset: u64, size_in_bytes: u32, format: IndexFormat) {
        let Some(resource) = self.resolve(handle) else {
            return;
        };
        self.track(&resource, ResourceStates::INDEX_BUFFER);
        let view = IndexBufferView {
            buffer_location: resource.gpu_virtual_address() + offset,
            size_in_bytes,
            format,
        };
        self.native_list().set_index_buffer(&view);
    }

    /// 顶点数据写入 upload 内存后直接绑定
    pub fn set_dynamic_vertex_buffer(&mut self, slot: u32, data: &[u8], stride_in_bytes: u32) {
        let allocation = self.allocate_upload_memory(data.len() as u64, 16);
        allocation.write(data);
        let view = VertexBufferView {
            buffer_location: allocation.gpu_address(),
            size_in_bytes: data.len() as u32,
            stride_in_bytes,
        };
        self.native_list().set_vertex_buffers(slot, &[view]);
    }

    pub fn set_dynamic_index_buffer(&mut self, data: &[u8], format: IndexFormat) {
        debug_assert!(data.len() % format.size_in_bytes() as usize == 0);
        let allocation = self.allocate_upload_memory(data.len() as u64, format.size_in_bytes() as u64);
        allocation.write(data);
        let view = IndexBufferView {
            buffer_location: allocation.gpu_address(),
            size_in_bytes: data.len() as u32,
            format,
        };
        self.native_list().set_index_buffer(&view);
    }
}

// draw
impl<D: RenderDevice> GraphicsContext<'_, D> {
    pub fn draw(&mut self, vertex_count: u32, start_vertex: u32) {
        self.draw_instanced(vertex_count, 1, start_vertex, 0);
    }

    pub fn draw_indexed(&mut self, index_count: u32, start_index: u32, base_vertex: i32) {
        self.draw_indexed_instanced(index_count, 1, start_index, base_vertex, 0);
    }

    pub fn draw_instanced(&mut self, vertex_count: u32, instance_count: u32, start_vertex: u32, start_instance: u32) {
        self.commit_before_work(BindPoint::Graphics);
        self.native_list().draw_instanced(vertex_count, instance_count, start_vertex, start_instance);
    }

    pub fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) {
        self.commit_before_work(BindPoint::Graphics);
        self.native_list().draw_indexed_instanced(
            index_count,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
        );
    }
}
