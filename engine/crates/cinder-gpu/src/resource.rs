use std::{
    ptr::NonNull,
    sync::{Arc, Mutex, RwLock},
};

use cinder_rhi::{
    barrier::ResourceId,
    device::{NativeResource, RenderDevice},
    queue_type::QueueType,
    resource::ResourceDesc,
    resource_state::ResourceStates,
};
use slotmap::SlotMap;

use crate::{fence::FenceValue, retire_queue::RetireQueue, state_tracker::TrackedResource};

slotmap::new_key_type! {
    /// 资源句柄，带有代数检查：资源销毁后旧句柄不会再命中新的资源
    pub struct GpuResourceHandle;
}

/// 由编排核心管理的 GPU 资源
pub struct GpuResource<D: RenderDevice> {
    handle: GpuResourceHandle,
    native: D::Resource,
    desc: ResourceDesc,
    name: String,
}

// getters
impl<D: RenderDevice> GpuResource<D> {
    #[inline]
    pub fn handle(&self) -> GpuResourceHandle {
        self.handle
    }

    #[inline]
    pub fn native(&self) -> &D::Resource {
        &self.native
    }

    #[inline]
    pub fn id(&self) -> ResourceId {
        self.native.id()
    }

    #[inline]
    pub fn desc(&self) -> &ResourceDesc {
        &self.desc
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn gpu_virtual_address(&self) -> u64 {
        self.native.gpu_virtual_address()
    }

    #[inline]
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.native.mapped_ptr()
    }

    #[inline]
    pub fn subresource_count(&self) -> u32 {
        self.desc.subresource_count()
    }

    /// 状态追踪所需的信息
    #[inline]
    pub fn tracked(&self) -> TrackedResource {
        TrackedResource {
            handle: self.handle,
            id: self.native.id(),
            subresource_count: self.desc.subresource_count(),
        }
    }
}

/// 资源的 arena
///
/// 销毁的资源立刻从 arena 中移除（句柄失效），但原生资源要等到所有队列上
/// 销毁时刻之前提交的工作都完成之后才会释放
pub struct GpuResourceRegistry<D: RenderDevice> {
    device: Arc<D>,
    resources: RwLock<SlotMap<GpuResourceHandle, Arc<GpuResource<D>>>>,
    pending_destroy: Mutex<RetireQueue<[FenceValue; QueueType::COUNT], Arc<GpuResource<D>>>>,
}

// new & init
impl<D: RenderDevice> GpuResourceRegistry<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            resources: RwLock::new(SlotMap::with_key()),
            pending_destroy: Mutex::new(RetireQueue::new()),
        }
    }
}

// create & destroy
impl<D: RenderDevice> GpuResourceRegistry<D> {
    pub fn create(
        &self,
        desc: &ResourceDesc,
        initial_state: ResourceStates,
        name: &str,
    ) -> anyhow::Result<Arc<GpuResource<D>>> {
        let native = self.device.create_resource(desc, initial_state, name)?;
        let mut resources = self.resources.write().unwrap();
        let handle = resources.insert_with_key(|handle| {
            Arc::new(GpuResource {
                handle,
                native,
                desc: *desc,
                name: name.to_string(),
            })
        });
        Ok(resources[handle].clone())
    }

    /// 从 arena 中移除，原生资源在 `fences` 全部完成后释放
    pub fn retire(
        &self,
        handle: GpuResourceHandle,
        fences: [FenceValue; QueueType::COUNT],
    ) -> Option<Arc<GpuResource<D>>> {
        let resource = self.resources.write().unwrap().remove(handle)?;
        self.pending_destroy.lock().unwrap().push(fences, resource.clone());
        Some(resource)
    }

    /// 释放已经不再被 GPU 使用的资源，返回释放的数量
    pub fn collect_retired(&self, is_fence_completed: impl Fn(FenceValue) -> bool) -> usize {
        let released = self
            .pending_destroy
            .lock()
            .unwrap()
            .drain_ready(|fences| fences.iter().all(|fence| is_fence_completed(*fence)));
        for resource in &released {
            log::trace!("release resource: {}", resource.name());
        }
        released.len()
    }

    /// GPU 空闲后释放所有等待销毁的资源
    pub fn collect_all_retired(&self) -> usize {
        self.pending_destroy.lock().unwrap().drain_all().len()
    }
}

// getters
impl<D: RenderDevice> GpuResourceRegistry<D> {
    pub fn get(&self, handle: GpuResourceHandle) -> Option<Arc<GpuResource<D>>> {
        self.resources.read().unwrap().get(handle).cloned()
    }

    pub fn contains(&self, handle: GpuResourceHandle) -> bool {
        self.resources.read().unwrap().contains_key(handle)
    }

    pub fn len(&self) -> usize {
        self.resources.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_destroy_count(&self) -> usize {
        self.pending_destroy.lock().unwrap().len()
    }
}
