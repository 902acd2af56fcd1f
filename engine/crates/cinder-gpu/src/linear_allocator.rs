//! 基于 page 的线性分配器
//!
//! 每个录制上下文持有自己的 [`GpuLinearAllocator`]，只向前推进偏移量，不支持单独释放。
//! 提交后，用过的 page 连同 fence 一起交给全局的 [`LinearAllocatorPageManager`]，
//! fence 完成后才会被再次分配。超过 page 大小的请求使用单独的 large page，用完即销毁。

use std::{
    collections::VecDeque,
    ptr::NonNull,
    sync::{Arc, Mutex},
};

use cinder_rhi::{
    device::{NativeResource, RenderDevice},
    resource::{HeapKind, ResourceDesc},
    resource_state::ResourceStates,
};

use crate::{command_queue::CommandQueueManager, fence::FenceValue, retire_queue::RetireQueue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinearAllocatorType {
    /// default heap，只能由 GPU 读写
    GpuExclusive,
    /// upload heap，CPU 写入、GPU 读取
    CpuWritable,
}

impl LinearAllocatorType {
    pub const COUNT: usize = 2;

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    fn heap_kind(self) -> HeapKind {
        match self {
            Self::GpuExclusive => HeapKind::Default,
            Self::CpuWritable => HeapKind::Upload,
        }
    }

    /// page 在整个生命周期内保持的状态，不参与状态追踪
    pub fn resource_state(self) -> ResourceStates {
        match self {
            Self::GpuExclusive => ResourceStates::UNORDERED_ACCESS,
            Self::CpuWritable => ResourceStates::GENERIC_READ,
        }
    }
}

#[inline]
fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

pub struct LinearAllocationPage<D: RenderDevice> {
    native: D::Resource,
    size: u64,
    id: usize,
    large: bool,
}

impl<D: RenderDevice> LinearAllocationPage<D> {
    #[inline]
    pub fn native(&self) -> &D::Resource {
        &self.native
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn is_large(&self) -> bool {
        self.large
    }

    #[inline]
    pub fn gpu_virtual_address(&self) -> u64 {
        self.native.gpu_virtual_address()
    }
}

/// 线性分配得到的一段内存，持有所在 page 的引用
#[derive(Clone)]
pub struct LinearAllocation<D: RenderDevice> {
    page: Arc<LinearAllocationPage<D>>,
    offset: u64,
    size: u64,
}

impl<D: RenderDevice> LinearAllocation<D> {
    #[inline]
    pub fn resource(&self) -> &D::Resource {
        self.page.native()
    }

    #[inline]
    pub fn page(&self) -> &Arc<LinearAllocationPage<D>> {
        &self.page
    }

    /// 在 page 内的偏移
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn gpu_address(&self) -> u64 {
        self.page.gpu_virtual_address() + self.offset
    }

    /// GPU 独占的 page 返回 None
    pub fn cpu_ptr(&self) -> Option<NonNull<u8>> {
        let base = self.page.native.mapped_ptr()?;
        NonNull::new(base.as_ptr().wrapping_add(self.offset as usize))
    }

    /// 把 `data` 写到这段内存的开头
    ///
    /// # Panics
    /// 数据超出分配大小，或者内存不可由 CPU 写入
    pub fn write(&self, data: &[u8]) {
        assert!(
            data.len() as u64 <= self.size,
            "写入的数据 ({} 字节) 超出了线性分配的大小 ({} 字节)",
            data.len(),
            self.size
        );
        let dst = self.cpu_ptr().unwrap_or_else(|| panic!("GPU 独占的线性内存不能由 CPU 写入"));
        // SAFETY: 映射内存在 page 存活期间有效，范围已经检查过
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_ptr(), data.len());
        }
    }
}

struct PageManagerInner<D: RenderDevice> {
    available: VecDeque<Arc<LinearAllocationPage<D>>>,
    retired: RetireQueue<FenceValue, Arc<LinearAllocationPage<D>>>,
    /// 等待销毁的 large page
    deletion: RetireQueue<FenceValue, Arc<LinearAllocationPage<D>>>,
    created: usize,
}

/// 同一种类型的 page 的全局管理者
pub struct LinearAllocatorPageManager<D: RenderDevice> {
    device: Arc<D>,
    queues: Arc<CommandQueueManager<D>>,
    allocator_type: LinearAllocatorType,
    page_size: u64,
    inner: Mutex<PageManagerInner<D>>,
}

// new & init
impl<D: RenderDevice> LinearAllocatorPageManager<D> {
    pub fn new(
        device: Arc<D>,
        queues: Arc<CommandQueueManager<D>>,
        allocator_type: LinearAllocatorType,
        page_size: u64,
    ) -> Self {
        Self {
            device,
            queues,
            allocator_type,
            page_size,
            inner: Mutex::new(PageManagerInner {
                available: VecDeque::new(),
                retired: RetireQueue::new(),
                deletion: RetireQueue::new(),
                created: 0,
            }),
        }
    }

    fn create_page(&self, id: usize, size: u64, large: bool) -> LinearAllocationPage<D> {
        let mut desc = ResourceDesc::buffer(size, self.allocator_type.heap_kind());
        if self.allocator_type == LinearAllocatorType::GpuExclusive {
            desc = desc.with_unordered_access();
        }
        let name = format!("linear-{:?}-page-{}", self.allocator_type, id);
        let native = self
            .device
            .create_resource(&desc, self.allocator_type.resource_state(), &name)
            .unwrap_or_else(|e| panic!("创建线性分配 page '{}' 失败: {e:?}", name));
        LinearAllocationPage {
            native,
            size,
            id,
            large,
        }
    }
}

// getters
impl<D: RenderDevice> LinearAllocatorPageManager<D> {
    #[inline]
    pub fn allocator_type(&self) -> LinearAllocatorType {
        self.allocator_type
    }

    #[inline]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn created_count(&self) -> usize {
        self.inner.lock().unwrap().created
    }

    pub fn available_count(&self) -> usize {
        self.inner.lock().unwrap().available.len()
    }

    pub fn pending_deletion_count(&self) -> usize {
        self.inner.lock().unwrap().deletion.len()
    }
}

// tools
impl<D: RenderDevice> LinearAllocatorPageManager<D> {
    pub fn request_page(&self) -> Arc<LinearAllocationPage<D>> {
        let _span = cinder_crate_tools::profile_span!("LinearAllocatorPageManager::request_page");
        let mut inner = self.inner.lock().unwrap();

        let completed = inner.retired.drain_ready(|fence| self.queues.is_fence_completed(*fence));
        inner.available.extend(completed);
        if let Some(page) = inner.available.pop_front() {
            return page;
        }

        let id = inner.created;
        inner.created += 1;
        log::trace!("create {:?} linear page #{} ({} bytes)", self.allocator_type, id, self.page_size);
        Arc::new(self.create_page(id, self.page_size, false))
    }

    /// 大小恰好为 `size` 的 large page，不会被复用
    pub fn create_large_page(&self, size: u64) -> Arc<LinearAllocationPage<D>> {
        self.free_large_pages();

        let mut inner = self.inner.lock().unwrap();
        let id = inner.created;
        inner.created += 1;
        log::trace!("create {:?} large linear page #{} ({} bytes)", self.allocator_type, id, size);
        Arc::new(self.create_page(id, size, true))
    }

    /// 用过的 page 在 `fence` 完成后才能再次使用，large page 在 `fence` 完成后销毁
    pub fn discard_pages(&self, fence: FenceValue, pages: impl IntoIterator<Item = Arc<LinearAllocationPage<D>>>) {
        let mut inner = self.inner.lock().unwrap();
        for page in pages {
            if page.is_large() {
                inner.deletion.push(fence, page);
            } else {
                inner.retired.push(fence, page);
            }
        }
    }

    /// 销毁 fence 已经完成的 large page，返回销毁的数量
    pub fn free_large_pages(&self) -> usize {
        let freed = self
            .inner
            .lock()
            .unwrap()
            .deletion
            .drain_ready(|fence| self.queues.is_fence_completed(*fence));
        freed.len()
    }

    /// GPU 空闲后回收所有 page
    pub fn reclaim_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        let retired = inner.retired.drain_all();
        inner.available.extend(retired);
        inner.deletion.drain_all();
    }
}

/// 每个录制上下文私有的线性分配器
pub struct GpuLinearAllocator<D: RenderDevice> {
    manager: Arc<LinearAllocatorPageManager<D>>,
    current_page: Option<Arc<LinearAllocationPage<D>>>,
    current_offset: u64,
    /// 本次录制中已经用满的 page
    retired_pages: Vec<Arc<LinearAllocationPage<D>>>,
    large_pages: Vec<Arc<LinearAllocationPage<D>>>,
}

impl<D: RenderDevice> GpuLinearAllocator<D> {
    pub fn new(manager: Arc<LinearAllocatorPageManager<D>>) -> Self {
        Self {
            manager,
            current_page: None,
            current_offset: 0,
            retired_pages: Vec::new(),
            large_pages: Vec::new(),
        }
    }

    #[inline]
    pub fn allocator_type(&self) -> LinearAllocatorType {
        self.manager.allocator_type()
    }

    /// 本次录制用到的 page 数量，包括 large page
    pub fn num_used_pages(&self) -> usize {
        self.retired_pages.len() + self.large_pages.len() + usize::from(self.current_page.is_some())
    }

    /// # Panics
    /// `alignment` 不是 2 的幂
    pub fn allocate(&mut self, size: u64, alignment: u64) -> LinearAllocation<D> {
        assert!(alignment.is_power_of_two(), "线性分配的对齐必须是 2 的幂: {}", alignment);
        let aligned_size = align_up(size, alignment);
        let page_size = self.manager.page_size();

        if aligned_size > page_size {
            let page = self.manager.create_large_page(aligned_size);
            self.large_pages.push(page.clone());
            return LinearAllocation { page, offset: 0, size };
        }

        let mut offset = align_up(self.current_offset, alignment);
        let page = match &self.current_page {
            Some(page) if offset + aligned_size <= page_size => page.clone(),
            _ => {
                if let Some(full_page) = self.current_page.take() {
                    self.retired_pages.push(full_page);
                }
                let page = self.manager.request_page();
                self.current_page = Some(page.clone());
                offset = 0;
                page
            }
        };

        self.current_offset = offset + aligned_size;
        LinearAllocation { page, offset, size }
    }

    /// 提交后调用，所有用过的 page 在 `fence` 完成前不会被再次分配
    pub fn retire_used_pages(&mut self, fence: FenceValue) {
        let pages = std::mem::take(&mut self.retired_pages)
            .into_iter()
            .chain(self.current_page.take())
            .chain(std::mem::take(&mut self.large_pages));
        self.manager.discard_pages(fence, pages);
        self.current_offset = 0;
    }
}
