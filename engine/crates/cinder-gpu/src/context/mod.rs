//! 命令录制上下文
//!
//! [`CommandContext`] 由 [`GpuCore::begin_context`] 创建，是录制期间的唯一入口，
//! 通过 [`CommandContext::finish`] 提交。能力按队列分层：
//! - 任意队列：拷贝、查询、barrier、线性内存
//! - compute 与 graphics 队列：[`CommandContext::compute`] 提供 pipeline 绑定与 dispatch
//! - graphics 队列：[`CommandContext::graphics`] 额外提供 render target 与 draw
//!
//! 录制期间用到的状态追踪器、dynamic descriptor heap 和线性分配器组成 [`RecordingSession`]，
//! 由 [`CommandContextManager`] 池化，提交的 fence 完成后才会被复用。
//!
//! [`GpuCore::begin_context`]: crate::gpu_core::GpuCore::begin_context

mod compute;
mod graphics;
mod manager;

use std::{collections::HashMap, sync::Arc};

use cinder_rhi::{
    barrier::Subresource,
    descriptor::DescriptorHeapType,
    device::{NativeCommandList, RenderDevice},
    queue_type::QueueType,
    resource_state::ResourceStates,
    root_signature::BindPoint,
};
pub use compute::ComputeContext;
pub use graphics::GraphicsContext;
pub use manager::CommandContextManager;

use crate::{
    command_list::CommandList,
    descriptor::{DynamicDescriptorHeap, ShaderVisibleHeapPool},
    fence::FenceValue,
    gpu_core::GpuCore,
    linear_allocator::{GpuLinearAllocator, LinearAllocation, LinearAllocatorPageManager, LinearAllocatorType},
    pipeline::{PipelineState, RootSignature},
    resource::{GpuResource, GpuResourceHandle},
    state_tracker::ResourceStateTracker,
};

/// shader visible 的 heap 类型在 dynamic heap 数组中的位置
pub(crate) fn dynamic_heap_slot(heap_type: DescriptorHeapType) -> Option<usize> {
    DescriptorHeapType::SHADER_VISIBLE.iter().position(|ty| *ty == heap_type)
}

/// 一次录制所需的全部 CPU 侧状态
pub(crate) struct RecordingSession<D: RenderDevice> {
    id: usize,
    queue_type: QueueType,
    tracker: ResourceStateTracker,
    dynamic_heaps: [DynamicDescriptorHeap<D>; 2],
    upload_allocator: GpuLinearAllocator<D>,
    gpu_allocator: GpuLinearAllocator<D>,
    root_signature: Option<(BindPoint, Arc<RootSignature<D>>)>,
    pipeline: Option<Arc<PipelineState<D>>>,
    /// 录制中用到的资源，在提交完成前保持存活
    referenced: HashMap<GpuResourceHandle, Arc<GpuResource<D>>>,
}

impl<D: RenderDevice> RecordingSession<D> {
    pub(crate) fn new(
        id: usize,
        queue_type: QueueType,
        device: &Arc<D>,
        heap_pools: &[Arc<ShaderVisibleHeapPool<D>>; 2],
        page_managers: &[Arc<LinearAllocatorPageManager<D>>; LinearAllocatorType::COUNT],
    ) -> Self {
        Self {
            id,
            queue_type,
            tracker: ResourceStateTracker::new(),
            dynamic_heaps: heap_pools.clone().map(|pool| DynamicDescriptorHeap::new(device.clone(), pool)),
            upload_allocator: GpuLinearAllocator::new(page_managers[LinearAllocatorType::CpuWritable.index()].clone()),
            gpu_allocator: GpuLinearAllocator::new(page_managers[LinearAllocatorType::GpuExclusive.index()].clone()),
            root_signature: None,
            pipeline: None,
            referenced: HashMap::new(),
        }
    }

    /// 提交后调用：heap 与 page 交给全局池子，清空录制状态
    fn retire(&mut self, fence: FenceValue) {
        for heap in &mut self.dynamic_heaps {
            heap.retire_used_heaps(fence);
        }
        self.upload_allocator.retire_used_pages(fence);
        self.gpu_allocator.retire_used_pages(fence);
        self.tracker.reset();
        self.root_signature = None;
        self.pipeline = None;
    }

    pub(crate) fn release_references(&mut self) {
        self.referenced.clear();
    }
}

/// 录制期间从池子中取出的对象，提交或放弃时归还
struct Recording<D: RenderDevice> {
    command_list: CommandList<D>,
    session: RecordingSession<D>,
}

/// 录制上下文
///
/// 未调用 [`Self::finish`] 就被 drop 时，等同于 [`Self::abandon`]
pub struct CommandContext<D: RenderDevice> {
    core: Arc<GpuCore<D>>,
    label: String,
    queue_type: QueueType,
    /// 只在 finish / abandon / drop 时被取走
    recording: Option<Recording<D>>,
}

// new & init
impl<D: RenderDevice> CommandContext<D> {
    pub(crate) fn begin(core: Arc<GpuCore<D>>, label: &str, queue_type: QueueType) -> Self {
        let session = core.contexts().request_session(queue_type);
        let mut command_list = core.queues().queue(queue_type).request_command_list();
        command_list.native_mut().begin_event(label);
        log::trace!("begin context '{}' on {} queue, session #{}", label, queue_type, session.id);

        Self {
            core,
            label: label.to_string(),
            queue_type,
            recording: Some(Recording { command_list, session }),
        }
    }

    /// compute 层的操作，graphics 与 compute 队列可用
    ///
    /// # Panics
    /// copy 队列上的上下文
    pub fn compute(&mut self) -> ComputeContext<'_, D> {
        assert!(
            self.queue_type().supports(QueueType::Compute),
            "{} 队列上的上下文 '{}' 不支持 compute 操作",
            self.queue_type(),
            self.label
        );
        ComputeContext::new(self)
    }

    /// graphics 层的操作，只有 graphics 队列可用
    ///
    /// # Panics
    /// 非 graphics 队列上的上下文
    pub fn graphics(&mut self) -> GraphicsContext<'_, D> {
        assert_eq!(
            self.queue_type(),
            QueueType::Graphics,
            "上下文 '{}' 不支持 graphics 操作",
            self.label
        );
        GraphicsContext::new(ComputeContext::new(self))
    }
}

// getters
impl<D: RenderDevice> CommandContext<D> {
    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[inline]
    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    #[inline]
    pub fn command_list(&self) -> &CommandList<D> {
        &self.recording().command_list
    }

    #[inline]
    pub fn core(&self) -> &Arc<GpuCore<D>> {
        &self.core
    }

    #[inline]
    pub fn state_tracker(&self) -> &ResourceStateTracker {
        &self.recording().session.tracker
    }

    #[inline]
    fn recording(&self) -> &Recording<D> {
        self.recording.as_ref().expect("上下文已经结束录制")
    }

    #[inline]
    fn recording_mut(&mut self) -> &mut Recording<D> {
        self.recording.as_mut().expect("上下文已经结束录制")
    }

    #[inline]
    fn session_mut(&mut self) -> &mut RecordingSession<D> {
        &mut self.recording_mut().session
    }

    #[inline]
    pub(crate) fn native_list(&mut self) -> &mut D::CommandList {
        self.recording_mut().command_list.native_mut()
    }
}

// resources & barriers
impl<D: RenderDevice> CommandContext<D> {
    /// 句柄失效时记录错误并返回 None
    pub(crate) fn resolve(&mut self, handle: GpuResourceHandle) -> Option<Arc<GpuResource<D>>> {
        if let Some(resource) = self.recording().session.referenced.get(&handle) {
            return Some(resource.clone());
        }
        let Some(resource) = self.core.resource(handle) else {
            log::error!("上下文 '{}' 使用了已销毁的资源 {:?}", self.label, handle);
            return None;
        };
        self.session_mut().referenced.insert(handle, resource.clone());
        Some(resource)
    }

    pub(crate) fn track(&mut self, resource: &GpuResource<D>, state: ResourceStates) {
        self.session_mut().tracker.transition_resource(resource.tracked(), state, Subresource::All);
    }

    /// 把资源转换到 `new_state`，`flush_immediate` 为 true 时立即录制 barrier
    pub fn transition_barrier(
        &mut self,
        handle: GpuResourceHandle,
        new_state: ResourceStates,
        subresource: Subresource,
        flush_immediate: bool,
    ) {
        let Some(resource) = self.resolve(handle) else {
            return;
        };
        self.session_mut().tracker.transition_resource(resource.tracked(), new_state, subresource);
        if flush_immediate {
            self.flush_resource_barriers();
        }
    }

    pub fn aliasing_barrier(
        &mut self,
        before: Option<GpuResourceHandle>,
        after: Option<GpuResourceHandle>,
        flush_immediate: bool,
    ) {
        let before = match before {
            Some(handle) => match self.resolve(handle) {
                Some(resource) => Some(resource.id()),
                None => return,
            },
            None => None,
        };
        let after = match after {
            Some(handle) => match self.resolve(handle) {
                Some(resource) => Some(resource.id()),
                None => return,
            },
            None => None,
        };
        self.session_mut().tracker.aliasing_barrier(before, after);
        if flush_immediate {
            self.flush_resource_barriers();
        }
    }

    pub fn flush_resource_barriers(&mut self) {
        let Recording { command_list, session } = self.recording_mut();
        session.tracker.flush_resource_barriers(command_list);
    }

    /// draw / dispatch 之前调用：录制 barrier，并提交暂存的 descriptor
    pub(crate) fn commit_before_work(&mut self, bind_point: BindPoint) {
        self.flush_resource_barriers();

        let mut heap_changed = false;
        for heap in &mut self.session_mut().dynamic_heaps {
            heap_changed |= heap.ensure_heap_capacity();
        }
        if heap_changed {
            self.bind_descriptor_heaps();
        }
        let Recording { command_list, session } = self.recording_mut();
        for heap in &mut session.dynamic_heaps {
            heap.commit_staged_descriptors(command_list, bind_point);
        }
    }

    pub(crate) fn bind_descriptor_heaps(&mut self) {
        let Recording { command_list, session } = self.recording_mut();
        let heaps: Vec<&D::DescriptorHeap> = session
            .dynamic_heaps
            .iter()
            .filter_map(|heap| heap.current_heap())
            .map(|heap| heap.native())
            .collect();
        command_list.native_mut().set_descriptor_heaps(&heaps);
    }
}

// copy
impl<D: RenderDevice> CommandContext<D> {
    pub fn copy_buffer_region(
        &mut self,
        dst: GpuResourceHandle,
        dst_offset: u64,
        src: GpuResourceHandle,
        src_offset: u64,
        num_bytes: u64,
    ) {
        let (Some(dst), Some(src)) = (self.resolve(dst), self.resolve(src)) else {
            return;
        };
        self.track(&dst, ResourceStates::COPY_DEST);
        self.track(&src, ResourceStates::COPY_SOURCE);
        self.flush_resource_barriers();
        self.native_list().copy_buffer_region(dst.native(), dst_offset, src.native(), src_offset, num_bytes);
    }

    pub fn copy_resource(&mut self, dst: GpuResourceHandle, src: GpuResourceHandle) {
        let (Some(dst), Some(src)) = (self.resolve(dst), self.resolve(src)) else {
            return;
        };
        self.track(&dst, ResourceStates::COPY_DEST);
        self.track(&src, ResourceStates::COPY_SOURCE);
        self.flush_resource_barriers();
        self.native_list().copy_resource(dst.native(), src.native());
    }

    /// 经由 upload 内存把 `data` 写入 buffer
    pub fn write_buffer(&mut self, dst: GpuResourceHandle, dst_offset: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let Some(dst) = self.resolve(dst) else {
            return;
        };
        let upload = self.allocate_upload_memory(data.len() as u64, 4);
        upload.write(data);

        self.track(&dst, ResourceStates::COPY_DEST);
        self.flush_resource_barriers();
        self.native_list().copy_buffer_region(
            dst.native(),
            dst_offset,
            upload.resource(),
            upload.offset(),
            data.len() as u64,
        );
    }

    /// 用重复的 `value` 填充 buffer 的 `[offset, offset + num_bytes)`
    ///
    /// # Panics
    /// `num_bytes` 不是 4 的倍数
    pub fn fill_buffer(&mut self, dst: GpuResourceHandle, offset: u64, value: u32, num_bytes: u64) {
        assert!(num_bytes % 4 == 0, "填充长度需要是 4 的倍数: {}", num_bytes);
        let data: Vec<u8> = std::iter::repeat(value.to_le_bytes())
            .take((num_bytes / 4) as usize)
            .flatten()
            .collect();
        self.write_buffer(dst, offset, &data);
    }

    pub fn end_query(&mut self, query_heap: &D::QueryHeap, index: u32) {
        self.native_list().end_query(query_heap, index);
    }

    pub fn resolve_query_data(
        &mut self,
        query_heap: &D::QueryHeap,
        start_index: u32,
        num_queries: u32,
        dst: GpuResourceHandle,
        dst_offset: u64,
    ) {
        let Some(dst) = self.resolve(dst) else {
            return;
        };
        self.track(&dst, ResourceStates::COPY_DEST);
        self.flush_resource_barriers();
        self.native_list().resolve_query_data(query_heap, start_index, num_queries, dst.native(), dst_offset);
    }

    pub fn begin_event(&mut self, label: &str) {
        self.native_list().begin_event(label);
    }

    pub fn end_event(&mut self) {
        self.native_list().end_event();
    }

    /// CPU 可写、GPU 可读的临时内存，提交完成后回收
    pub fn allocate_upload_memory(&mut self, size: u64, alignment: u64) -> LinearAllocation<D> {
        self.session_mut().upload_allocator.allocate(size, alignment)
    }

    /// GPU 独占的临时内存，提交完成后回收
    pub fn allocate_gpu_memory(&mut self, size: u64, alignment: u64) -> LinearAllocation<D> {
        self.session_mut().gpu_allocator.allocate(size, alignment)
    }
}

// submit
impl<D: RenderDevice> CommandContext<D> {
    /// 提交录制的命令，返回本次提交的 fence
    ///
    /// 首次出现在本上下文中的资源，其 barrier 依据全局状态解析，录制在一个辅助 command list 中，
    /// 先于主 command list 执行。这些 barrier 当前队列无法执行时，交给 graphics 队列执行，
    /// 当前队列在 GPU 上等待它完成。
    pub fn finish(mut self, wait_for_completion: bool) -> FenceValue {
        let _span = cinder_crate_tools::profile_span!("CommandContext::finish");
        let Recording {
            mut command_list,
            mut session,
        } = self.take_recording();
        let core = &self.core;
        let label = &self.label;

        session.tracker.flush_resource_barriers(&mut command_list);
        command_list.native_mut().end_event();

        let queues = core.queues();
        let queue = queues.queue(session.queue_type);
        let fence = {
            let mut global = core.resource_states().lock();
            let pending = session.tracker.flush_pending_resource_barriers(&mut global, session.queue_type);

            let fence = if pending.barriers.is_empty() {
                queue.execute_command_lists(&mut [&mut command_list])
            } else if pending.requires_graphics_queue && session.queue_type != QueueType::Graphics {
                log::debug!(
                    "上下文 '{}' 的 {} 个 pending barrier 无法在 {} 队列执行，转交 graphics 队列",
                    label,
                    pending.barriers.len(),
                    session.queue_type
                );
                let graphics = queues.graphics();
                let mut barrier_list = graphics.request_command_list();
                barrier_list.native_mut().resource_barrier(&pending.barriers);
                let barrier_fence = graphics.execute_command_lists(&mut [&mut barrier_list]);
                graphics.retire_command_list(barrier_fence, barrier_list);

                queue.wait_for_fence_on_gpu(graphics, barrier_fence);
                queue.execute_command_lists(&mut [&mut command_list])
            } else {
                let mut barrier_list = queue.request_command_list();
                barrier_list.native_mut().resource_barrier(&pending.barriers);
                let fence = queue.execute_command_lists(&mut [&mut barrier_list, &mut command_list]);
                queue.retire_command_list(fence, barrier_list);
                fence
            };

            session.tracker.commit_final_resource_states(&mut global);
            fence
        };

        queue.retire_command_list(fence, command_list);
        session.retire(fence);
        core.contexts().free_session(fence, session);
        log::trace!("finish context '{}': {:?}", label, fence);

        if wait_for_completion {
            queues.wait_for_fence(fence);
        }
        fence
    }

    /// 不提交，直接把 command list 与会话归还，所有录制的状态被丢弃
    pub fn abandon(mut self) {
        log::debug!("abandon context '{}'", self.label);
        let recording = self.take_recording();
        self.discard(recording);
    }

    fn take_recording(&mut self) -> Recording<D> {
        self.recording.take().expect("上下文已经结束录制")
    }

    fn discard(&self, recording: Recording<D>) {
        let Recording {
            mut command_list,
            mut session,
        } = recording;
        command_list.close();
        let fence = FenceValue::initial(self.queue_type);
        self.core.queues().queue(self.queue_type).retire_command_list(fence, command_list);
        session.retire(fence);
        session.release_references();
        self.core.contexts().free_session(fence, session);
    }
}

impl<D: RenderDevice> Drop for CommandContext<D> {
    fn drop(&mut self) {
        let Some(recording) = self.recording.take() else {
            return;
        };
        // panic 展开时池子的锁可能已经中毒
        if std::thread::panicking() {
            return;
        }
        log::warn!("上下文 '{}' 没有提交就被 drop，录制的内容被丢弃", self.label);
        self.discard(recording);
    }
}
