use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

use cinder_rhi::{
    descriptor::CpuDescriptorHandle,
    device::{NativeCommandList, RenderDevice},
    pipeline::PipelineKind,
    queue_type::QueueType,
    resource_state::ResourceStates,
    root_signature::{BindPoint, RootViewKind},
};

use crate::{
    context::{CommandContext, Recording, dynamic_heap_slot},
    descriptor::DescriptorAllocation,
    pipeline::{BindingSlot, PipelineState, RootParameterLayout},
    resource::GpuResourceHandle,
};

/// compute 层的操作：pipeline、shader 参数绑定与 dispatch
///
/// shader 参数按名字绑定，名字不存在时记录警告并忽略
pub struct ComputeContext<'a, D: RenderDevice> {
    ctx: &'a mut CommandContext<D>,
}

impl<D: RenderDevice> Deref for ComputeContext<'_, D> {
    type Target = CommandContext<D>;

    fn deref(&self) -> &Self::Target {
        self.ctx
    }
}

impl<D: RenderDevice> DerefMut for ComputeContext<'_, D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctx
    }
}

// new & init
impl<'a, D: RenderDevice> ComputeContext<'a, D> {
    pub(super) fn new(ctx: &'a mut CommandContext<D>) -> Self {
        Self { ctx }
    }
}

// pipeline
impl<D: RenderDevice> ComputeContext<'_, D> {
    /// 绑定 pipeline；root signature 改变时重新划分 descriptor 暂存区
    ///
    /// # Panics
    /// 在非 graphics 队列上绑定 graphics pipeline
    pub fn set_pipeline_state(&mut self, pipeline: &Arc<PipelineState<D>>) {
        assert!(
            pipeline.kind() == PipelineKind::Compute || self.ctx.queue_type() == QueueType::Graphics,
            "{} 队列不能绑定 graphics pipeline '{}'",
            self.ctx.queue_type(),
            pipeline.name()
        );

        let Recording { command_list, session } = self.ctx.recording_mut();
        if session.pipeline.as_ref().is_some_and(|current| Arc::ptr_eq(current, pipeline)) {
            return;
        }

        let bind_point = pipeline.bind_point();
        let root_signature = pipeline.root_signature();
        let root_signature_changed = !session.root_signature.as_ref().is_some_and(|(current_bind_point, current)| {
            *current_bind_point == bind_point && Arc::ptr_eq(current, root_signature)
        });
        if root_signature_changed {
            command_list.native_mut().set_root_signature(bind_point, root_signature.native());
            for heap in &mut session.dynamic_heaps {
                heap.parse_root_signature(root_signature.layout());
            }
            session.root_signature = Some((bind_point, root_signature.clone()));
        }

        command_list.native_mut().set_pipeline_state(pipeline.native());
        session.pipeline = Some(pipeline.clone());
    }

    /// 当前 pipeline 中名为 `name` 的参数
    fn binding(&self, name: &str) -> Option<(BindingSlot, Arc<PipelineState<D>>)> {
        let Some(pipeline) = self.ctx.recording().session.pipeline.clone() else {
            log::error!("上下文 '{}' 在绑定 pipeline 之前设置了参数 '{}'", self.ctx.label(), name);
            return None;
        };
        match pipeline.binding(name) {
            Some(slot) => Some((slot, pipeline)),
            None => {
                log::warn!("pipeline '{}' 中不存在参数 '{}'", pipeline.name(), name);
                None
            }
        }
    }

    fn stage_table(&mut self, pipeline: &PipelineState<D>, root_index: u32, offset: u32, handles: &[CpuDescriptorHandle]) {
        let heap_type = match pipeline.root_signature().layout().parameter(root_index) {
            Some(RootParameterLayout::DescriptorTable { heap_type, .. }) => *heap_type,
            other => {
                log::error!("pipeline '{}' 的 root 参数 {} 不是 descriptor table: {:?}", pipeline.name(), root_index, other);
                return;
            }
        };
        let Some(slot) = dynamic_heap_slot(heap_type) else {
            return;
        };
        self.ctx.session_mut().dynamic_heaps[slot].stage_descriptor_handles(root_index, offset, handles);
    }

    fn shader_resource_state(pipeline: &PipelineState<D>) -> ResourceStates {
        match pipeline.bind_point() {
            BindPoint::Graphics => ResourceStates::NON_PIXEL_SHADER_RESOURCE | ResourceStates::PIXEL_SHADER_RESOURCE,
            BindPoint::Compute => ResourceStates::NON_PIXEL_SHADER_RESOURCE,
        }
    }

    fn bind_view(
        &mut self,
        name: &str,
        handle: GpuResourceHandle,
        view: Option<&DescriptorAllocation<D>>,
        kind: RootViewKind,
        state: impl FnOnce(&PipelineState<D>) -> ResourceStates,
    ) {
        let Some((slot, pipeline)) = self.binding(name) else {
            return;
        };
        let valid = match slot {
            BindingSlot::Table { .. } => view.is_some_and(|view| !view.is_null()),
            BindingSlot::RootView { kind: slot_kind, .. } => slot_kind == kind,
            BindingSlot::Constants { .. } => false,
        };
        if !valid {
            log::warn!("参数 '{}' 的绑定 {:?} 不能设置为 {:?}", name, slot, kind);
            return;
        }
        let Some(resource) = self.ctx.resolve(handle) else {
            return;
        };
        self.ctx.track(&resource, state(&pipeline));

        match (slot, view) {
            (BindingSlot::Table { root_index, offset }, Some(view)) => {
                self.stage_table(&pipeline, root_index, offset, &[view.descriptor_handle(0)]);
            }
            (BindingSlot::RootView { root_index, .. }, _) => {
                self.ctx.session_mut().dynamic_heaps[0].stage_inline_view(kind, root_index, resource.gpu_virtual_address());
            }
            _ => {}
        }
    }
}

// bindings
impl<D: RenderDevice> ComputeContext<'_, D> {
    /// 绑定 SRV；table 参数使用 `view`，root 参数直接使用资源的 GPU 地址
    pub fn set_shader_resource_view(&mut self, name: &str, handle: GpuResourceHandle, view: Option<&DescriptorAllocation<D>>) {
        self.bind_view(name, handle, view, RootViewKind::Srv, Self::shader_resource_state);
    }

    pub fn set_unordered_access_view(
        &mut self,
        name: &str,
        handle: GpuResourceHandle,
        view: Option<&DescriptorAllocation<D>>,
    ) {
        self.bind_view(name, handle, view, RootViewKind::Uav, |_| ResourceStates::UNORDERED_ACCESS);
    }

    /// 以 buffer 的 GPU 地址绑定 root CBV
    pub fn set_root_constant_buffer_view(&mut self, name: &str, handle: GpuResourceHandle) {
        self.bind_view(name, handle, None, RootViewKind::Cbv, |_| ResourceStates::VERTEX_AND_CONSTANT_BUFFER);
    }

    /// 把 `data` 写入 upload 内存，并作为 root CBV 绑定
    pub fn set_dynamic_constant_buffer_view(&mut self, name: &str, data: &[u8]) {
        let Some((slot, _)) = self.binding(name) else {
            return;
        };
        let BindingSlot::RootView {
            kind: RootViewKind::Cbv,
            root_index,
        } = slot
        else {
            log::warn!("参数 '{}' 的绑定 {:?} 不是 root CBV", name, slot);
            return;
        };

        let alignment = self.ctx.core().config().default_linear_alignment;
        let allocation = self.ctx.allocate_upload_memory(data.len() as u64, alignment);
        allocation.write(data);
        self.ctx.session_mut().dynamic_heaps[0].stage_inline_cbv(root_index, allocation.gpu_address());
    }

    /// 设置 root constants，立即录制
    pub fn set_constants(&mut self, name: &str, values: &[u32]) {
        let Some((slot, pipeline)) = self.binding(name) else {
            return;
        };
        let BindingSlot::Constants { root_index } = slot else {
            log::warn!("参数 '{}' 的绑定 {:?} 不是 root constants", name, slot);
            return;
        };
        self.ctx.native_list().set_root_constants(pipeline.bind_point(), root_index, values, 0);
    }

    /// 直接暂存一组 descriptor，不做状态转换
    pub fn set_dynamic_descriptors(&mut self, name: &str, handles: &[CpuDescriptorHandle]) {
        let Some((slot, pipeline)) = self.binding(name) else {
            return;
        };
        let BindingSlot::Table { root_index, offset } = slot else {
            log::warn!("参数 '{}' 的绑定 {:?} 不是 descriptor table", name, slot);
            return;
        };
        self.stage_table(&pipeline, root_index, offset, handles);
    }

    /// `handle` 为 None 时等待所有 UAV 写入
    pub fn uav_barrier(&mut self, handle: Option<GpuResourceHandle>, flush_immediate: bool) {
        let resource = match handle {
            Some(handle) => match self.ctx.resolve(handle) {
                Some(resource) => Some(resource.id()),
                None => return,
            },
            None => None,
        };
        self.ctx.session_mut().tracker.uav_barrier(resource);
        if flush_immediate {
            self.ctx.flush_resource_barriers();
        }
    }
}

// dispatch
impl<D: RenderDevice> ComputeContext<'_, D> {
    pub fn dispatch(&mut self, group_count_x: u32, group_count_y: u32, group_count_z: u32) {
        let Some(pipeline) = self.ctx.recording().session.pipeline.as_ref() else {
            log::error!("上下文 '{}' 在绑定 pipeline 之前 dispatch", self.ctx.label());
            return;
        };
        let bind_point = pipeline.bind_point();
        self.ctx.commit_before_work(bind_point);
        self.ctx.native_list().dispatch(group_count_x, group_count_y, group_count_z);
    }

    /// 按线程数 dispatch，group 数向上取整
    pub fn dispatch_1d(&mut self, thread_count_x: u32, group_size_x: u32) {
        self.dispatch(thread_count_x.div_ceil(group_size_x), 1, 1);
    }

    pub fn dispatch_2d(&mut self, thread_count_x: u32, thread_count_y: u32, group_size_x: u32, group_size_y: u32) {
        self.dispatch(thread_count_x.div_ceil(group_size_x), thread_count_y.div_ceil(group_size_y), 1);
    }

    pub fn dispatch_3d(&mut self, thread_count: [u32; 3], group_size: [u32; 3]) {
        self.dispatch(
            thread_count[0].div_ceil(group_size[0]),
            thread_count[1].div_ceil(group_size[1]),
            thread_count[2].div_ceil(group_size[2]),
        );
    }
}
