use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use anyhow::Context;
use cinder_rhi::{
    descriptor::{CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapType, GpuDescriptorHandle},
    device::{NativeDescriptorHeap, RenderDevice},
};

use crate::{command_queue::CommandQueueManager, fence::FenceValue, retire_queue::RetireQueue};

/// 一个 shader visible 的 descriptor heap
pub struct ShaderVisibleHeap<D: RenderDevice> {
    native: D::DescriptorHeap,
    id: usize,
    cpu_start: CpuDescriptorHandle,
    gpu_start: GpuDescriptorHandle,
}

impl<D: RenderDevice> ShaderVisibleHeap<D> {
    fn new(device: &D, heap_type: DescriptorHeapType, num_descriptors: u32, id: usize) -> anyhow::Result<Self> {
        let native = device.create_descriptor_heap(
            &DescriptorHeapDesc {
                heap_type,
                num_descriptors,
                shader_visible: true,
            },
            &format!("shader-visible-{:?}-{}", heap_type, id),
        )?;
        let gpu_start = native.gpu_start().context("shader visible heap 缺少 GPU 句柄")?;
        Ok(Self {
            cpu_start: native.cpu_start(),
            gpu_start,
            native,
            id,
        })
    }

    #[inline]
    pub fn native(&self) -> &D::DescriptorHeap {
        &self.native
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn cpu_start(&self) -> CpuDescriptorHandle {
        self.cpu_start
    }

    #[inline]
    pub fn gpu_start(&self) -> GpuDescriptorHandle {
        self.gpu_start
    }

    #[inline]
    pub fn num_descriptors(&self) -> u32 {
        self.native.desc().num_descriptors
    }
}

struct PoolInner<D: RenderDevice> {
    available: VecDeque<Arc<ShaderVisibleHeap<D>>>,
    retired: RetireQueue<FenceValue, Arc<ShaderVisibleHeap<D>>>,
    created: usize,
}

/// 全局共享的 shader visible heap 池，heap 在使用它的提交完成后回到池中
pub struct ShaderVisibleHeapPool<D: RenderDevice> {
    device: Arc<D>,
    queues: Arc<CommandQueueManager<D>>,
    heap_type: DescriptorHeapType,
    descriptors_per_heap: u32,
    inner: Mutex<PoolInner<D>>,
}

impl<D: RenderDevice> ShaderVisibleHeapPool<D> {
    pub fn new(
        device: Arc<D>,
        queues: Arc<CommandQueueManager<D>>,
        heap_type: DescriptorHeapType,
        descriptors_per_heap: u32,
    ) -> Self {
        assert!(heap_type.can_be_shader_visible(), "{:?} 类型的 heap 不能 shader visible", heap_type);
        Self {
            device,
            queues,
            heap_type,
            descriptors_per_heap,
            inner: Mutex::new(PoolInner {
                available: VecDeque::new(),
                retired: RetireQueue::new(),
                created: 0,
            }),
        }
    }

    /// # Panics
    /// 需要新建 heap 而创建失败时 panic
    pub fn request_heap(&self) -> Arc<ShaderVisibleHeap<D>> {
        let _span = cinder_crate_tools::profile_span!("ShaderVisibleHeapPool::request_heap");
        let mut inner = self.inner.lock().unwrap();

        let completed = inner.retired.drain_ready(|fence| self.queues.is_fence_completed(*fence));
        inner.available.extend(completed);
        if let Some(heap) = inner.available.pop_front() {
            return heap;
        }

        let id = inner.created;
        inner.created += 1;
        log::debug!("create shader visible {:?} heap #{}", self.heap_type, id);
        Arc::new(
            ShaderVisibleHeap::new(&*self.device, self.heap_type, self.descriptors_per_heap, id)
                .unwrap_or_else(|e| panic!("创建 shader visible {:?} heap 失败: {e:?}", self.heap_type)),
        )
    }

    pub fn retire_heaps(&self, fence: FenceValue, heaps: impl IntoIterator<Item = Arc<ShaderVisibleHeap<D>>>) {
        let mut inner = self.inner.lock().unwrap();
        for heap in heaps {
            inner.retired.push(fence, heap);
        }
    }

    /// GPU 空闲后回收所有 heap
    pub fn reclaim_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        let retired = inner.retired.drain_all();
        inner.available.extend(retired);
    }

    #[inline]
    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    #[inline]
    pub fn descriptors_per_heap(&self) -> u32 {
        self.descriptors_per_heap
    }

    pub fn created_count(&self) -> usize {
        self.inner.lock().unwrap().created
    }

    pub fn available_count(&self) -> usize {
        self.inner.lock().unwrap().available.len()
    }
}
