use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use cinder_rhi::{descriptor::DescriptorHeapType, device::RenderDevice, queue_type::QueueType};

use crate::{
    command_queue::CommandQueueManager,
    config::GpuCoreConfig,
    context::{RecordingSession, dynamic_heap_slot},
    descriptor::ShaderVisibleHeapPool,
    fence::FenceValue,
    linear_allocator::{LinearAllocatorPageManager, LinearAllocatorType},
    retire_queue::RetireQueue,
};

struct ManagerInner<D: RenderDevice> {
    available: [VecDeque<RecordingSession<D>>; QueueType::COUNT],
    retired: RetireQueue<FenceValue, RecordingSession<D>>,
    created: usize,
}

/// 录制会话的池子，以及会话所依赖的全局 heap 池与 page 管理者
pub struct CommandContextManager<D: RenderDevice> {
    device: Arc<D>,
    queues: Arc<CommandQueueManager<D>>,
    heap_pools: [Arc<ShaderVisibleHeapPool<D>>; 2],
    page_managers: [Arc<LinearAllocatorPageManager<D>>; LinearAllocatorType::COUNT],
    inner: Mutex<ManagerInner<D>>,
}

// new & init
impl<D: RenderDevice> CommandContextManager<D> {
    pub fn new(device: Arc<D>, queues: Arc<CommandQueueManager<D>>, config: &GpuCoreConfig) -> Self {
        let heap_pools = DescriptorHeapType::SHADER_VISIBLE.map(|heap_type| {
            let descriptors_per_heap = match heap_type {
                DescriptorHeapType::Sampler => config.samplers_per_shader_visible_heap,
                _ => config.descriptors_per_shader_visible_heap,
            };
            Arc::new(ShaderVisibleHeapPool::new(device.clone(), queues.clone(), heap_type, descriptors_per_heap))
        });
        let page_managers = [LinearAllocatorType::GpuExclusive, LinearAllocatorType::CpuWritable].map(|allocator_type| {
            let page_size = match allocator_type {
                LinearAllocatorType::GpuExclusive => config.gpu_linear_page_size,
                LinearAllocatorType::CpuWritable => config.cpu_linear_page_size,
            };
            Arc::new(LinearAllocatorPageManager::new(device.clone(), queues.clone(), allocator_type, page_size))
        });

        Self {
            device,
            queues,
            heap_pools,
            page_managers,
            inner: Mutex::new(ManagerInner {
                available: std::array::from_fn(|_| VecDeque::new()),
                retired: RetireQueue::new(),
                created: 0,
            }),
        }
    }
}

// getters
impl<D: RenderDevice> CommandContextManager<D> {
    /// # Panics
    /// `heap_type` 不能 shader visible
    pub fn heap_pool(&self, heap_type: DescriptorHeapType) -> &Arc<ShaderVisibleHeapPool<D>> {
        let slot = dynamic_heap_slot(heap_type)
            .unwrap_or_else(|| panic!("{:?} 类型没有 shader visible heap 池", heap_type));
        &self.heap_pools[slot]
    }

    #[inline]
    pub fn page_manager(&self, allocator_type: LinearAllocatorType) -> &Arc<LinearAllocatorPageManager<D>> {
        &self.page_managers[allocator_type.index()]
    }

    pub fn created_count(&self) -> usize {
        self.inner.lock().unwrap().created
    }

    pub fn available_count(&self, queue_type: QueueType) -> usize {
        self.inner.lock().unwrap().available[queue_type.index()].len()
    }

    pub fn retired_count(&self) -> usize {
        self.inner.lock().unwrap().retired.len()
    }
}

// request & free
impl<D: RenderDevice> CommandContextManager<D> {
    pub(crate) fn request_session(&self, queue_type: QueueType) -> RecordingSession<D> {
        let mut inner = self.inner.lock().unwrap();
        Self::drain_retired(&mut inner, |fence| self.queues.is_fence_completed(*fence));

        if let Some(session) = inner.available[queue_type.index()].pop_front() {
            return session;
        }

        let id = inner.created;
        inner.created += 1;
        log::trace!("create {} recording session #{}", queue_type, id);
        RecordingSession::new(id, queue_type, &self.device, &self.heap_pools, &self.page_managers)
    }

    /// 会话在 `fence` 完成后才能再次使用
    pub(crate) fn free_session(&self, fence: FenceValue, session: RecordingSession<D>) {
        self.inner.lock().unwrap().retired.push(fence, session);
    }

    fn drain_retired(inner: &mut ManagerInner<D>, is_ready: impl FnMut(&FenceValue) -> bool) {
        for mut session in inner.retired.drain_ready(is_ready) {
            session.release_references();
            inner.available[session.queue_type.index()].push_back(session);
        }
    }

    /// 销毁 fence 已经完成的 large page，返回销毁的数量
    pub fn collect_retired(&self) -> usize {
        self.page_managers.iter().map(|manager| manager.free_large_pages()).sum()
    }

    /// GPU 空闲后回收所有会话、heap 与 page
    pub fn reclaim_all(&self) {
        Self::drain_retired(&mut self.inner.lock().unwrap(), |_| true);
        for pool in &self.heap_pools {
            pool.reclaim_all();
        }
        for manager in &self.page_managers {
            manager.reclaim_all();
        }
    }
}
