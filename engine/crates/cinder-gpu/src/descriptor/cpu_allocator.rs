use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
};

use cinder_rhi::{
    descriptor::{CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapType},
    device::{NativeDescriptorHeap, RenderDevice},
};

use crate::retire_queue::RetireQueue;

/// 一段连续的 descriptor，析构时归还给所属的 page
///
/// 归还的 descriptor 不会立即可用，要等到 [`CpuDescriptorAllocator::release_stale_descriptors`]
pub struct DescriptorAllocation<D: RenderDevice> {
    descriptor: CpuDescriptorHandle,
    num_handles: u32,
    increment_size: u32,
    page: Option<Arc<CpuDescriptorAllocatorPage<D>>>,
}

impl<D: RenderDevice> Default for DescriptorAllocation<D> {
    fn default() -> Self {
        Self {
            descriptor: CpuDescriptorHandle::NULL,
            num_handles: 0,
            increment_size: 0,
            page: None,
        }
    }
}

impl<D: RenderDevice> DescriptorAllocation<D> {
    #[inline]
    pub fn is_null(&self) -> bool {
        self.descriptor.is_null()
    }

    /// 第 `offset` 个 descriptor 的句柄
    pub fn descriptor_handle(&self, offset: u32) -> CpuDescriptorHandle {
        assert!(offset < self.num_handles, "descriptor 偏移越界: {} >= {}", offset, self.num_handles);
        self.descriptor.offset(offset, self.increment_size)
    }

    #[inline]
    pub fn num_handles(&self) -> u32 {
        self.num_handles
    }

    pub fn heap_type(&self) -> Option<DescriptorHeapType> {
        self.page.as_ref().map(|page| page.heap_type())
    }

    /// 在所属 page 内的 descriptor 偏移
    pub fn offset_in_page(&self) -> Option<u32> {
        let page = self.page.as_ref()?;
        Some(page.offset_of(self.descriptor))
    }

    pub fn page(&self) -> Option<&Arc<CpuDescriptorAllocatorPage<D>>> {
        self.page.as_ref()
    }
}

impl<D: RenderDevice> Drop for DescriptorAllocation<D> {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            page.free(self.descriptor, self.num_handles);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FreeBlock {
    offset: u32,
    size: u32,
}

/// page 内部的空闲块信息
///
/// `free_by_offset` 用于合并相邻块，`free_by_size` 用于 best-fit 查找；两者始终保持一致
struct PageInner {
    free_by_offset: BTreeMap<u32, u32>,
    free_by_size: BTreeSet<(u32, u32)>,
    num_free_handles: u32,
    /// 已释放但还不能复用的块，key 为释放时的 epoch
    stale: RetireQueue<u64, FreeBlock>,
    release_epoch: u64,
}

impl PageInner {
    fn add_free_block(&mut self, offset: u32, size: u32) {
        self.free_by_offset.insert(offset, size);
        self.free_by_size.insert((size, offset));
    }

    fn remove_free_block(&mut self, offset: u32, size: u32) {
        self.free_by_offset.remove(&offset);
        self.free_by_size.remove(&(size, offset));
    }

    /// 归还一个块，并与前后相邻的空闲块合并
    fn free_block(&mut self, offset: u32, size: u32) {
        self.num_free_handles += size;

        let mut offset = offset;
        let mut size = size;

        let prev = self.free_by_offset.range(..offset).next_back().map(|(&o, &s)| (o, s));
        if let Some((prev_offset, prev_size)) = prev {
            if prev_offset + prev_size == offset {
                self.remove_free_block(prev_offset, prev_size);
                offset = prev_offset;
                size += prev_size;
            }
        }

        let next = self.free_by_offset.range(offset + size..).next().map(|(&o, &s)| (o, s));
        if let Some((next_offset, next_size)) = next {
            if offset + size == next_offset {
                self.remove_free_block(next_offset, next_size);
                size += next_size;
            }
        }

        self.add_free_block(offset, size);
    }
}

/// 一个非 shader visible 的 descriptor heap
pub struct CpuDescriptorAllocatorPage<D: RenderDevice> {
    heap: D::DescriptorHeap,
    heap_type: DescriptorHeapType,
    base: CpuDescriptorHandle,
    increment_size: u32,
    num_descriptors: u32,
    inner: Mutex<PageInner>,
}

// new & init
impl<D: RenderDevice> CpuDescriptorAllocatorPage<D> {
    pub fn new(device: &D, heap_type: DescriptorHeapType, num_descriptors: u32) -> anyhow::Result<Self> {
        let heap = device.create_descriptor_heap(
            &DescriptorHeapDesc {
                heap_type,
                num_descriptors,
                shader_visible: false,
            },
            &format!("cpu-descriptor-page-{:?}", heap_type),
        )?;
        let base = heap.cpu_start();

        let mut inner = PageInner {
            free_by_offset: BTreeMap::new(),
            free_by_size: BTreeSet::new(),
            num_free_handles: num_descriptors,
            stale: RetireQueue::new(),
            release_epoch: 0,
        };
        inner.add_free_block(0, num_descriptors);

        Ok(Self {
            heap,
            heap_type,
            base,
            increment_size: device.descriptor_increment_size(heap_type),
            num_descriptors,
            inner: Mutex::new(inner),
        })
    }
}

// getters
impl<D: RenderDevice> CpuDescriptorAllocatorPage<D> {
    #[inline]
    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    #[inline]
    pub fn native(&self) -> &D::DescriptorHeap {
        &self.heap
    }

    #[inline]
    pub fn num_descriptors(&self) -> u32 {
        self.num_descriptors
    }

    pub fn num_free_handles(&self) -> u32 {
        self.inner.lock().unwrap().num_free_handles
    }

    /// 是否存在足够大的连续空闲块
    pub fn has_space(&self, num_descriptors: u32) -> bool {
        self.inner.lock().unwrap().free_by_size.range((num_descriptors, 0)..).next().is_some()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.inner.lock().unwrap().free_by_offset.len()
    }

    pub fn num_stale_blocks(&self) -> usize {
        self.inner.lock().unwrap().stale.len()
    }

    fn offset_of(&self, handle: CpuDescriptorHandle) -> u32 {
        ((handle.0 - self.base.0) / self.increment_size as usize) as u32
    }
}

// allocate & free
impl<D: RenderDevice> CpuDescriptorAllocatorPage<D> {
    /// best-fit 分配；没有足够大的连续块时返回 None
    pub fn allocate(self: &Arc<Self>, num_descriptors: u32) -> Option<DescriptorAllocation<D>> {
        debug_assert!(num_descriptors > 0);
        let mut inner = self.inner.lock().unwrap();

        let &(block_size, block_offset) = inner.free_by_size.range((num_descriptors, 0)..).next()?;
        inner.remove_free_block(block_offset, block_size);
        if block_size > num_descriptors {
            inner.add_free_block(block_offset + num_descriptors, block_size - num_descriptors);
        }
        inner.num_free_handles -= num_descriptors;

        Some(DescriptorAllocation {
            descriptor: self.base.offset(block_offset, self.increment_size),
            num_handles: num_descriptors,
            increment_size: self.increment_size,
            page: Some(self.clone()),
        })
    }

    /// 归还的块先进入过期队列
    fn free(&self, handle: CpuDescriptorHandle, num_handles: u32) {
        let offset = self.offset_of(handle);
        let mut inner = self.inner.lock().unwrap();
        let epoch = inner.release_epoch;
        inner.stale.push(epoch, FreeBlock { offset, size: num_handles });
    }

    /// 把过期块真正归还到空闲列表
    pub fn release_stale_descriptors(&self) {
        let mut inner = self.inner.lock().unwrap();
        let epoch = inner.release_epoch;
        let released = inner.stale.drain_ready(|freed_at| *freed_at <= epoch);
        for block in released {
            inner.free_block(block.offset, block.size);
        }
        inner.release_epoch += 1;
    }
}

struct AllocatorInner<D: RenderDevice> {
    pages: Vec<Arc<CpuDescriptorAllocatorPage<D>>>,
    /// 还有空闲 descriptor 的 page 索引
    available_pages: BTreeSet<usize>,
}

/// 某一类型的 CPU descriptor 分配器，按需增加 page
pub struct CpuDescriptorAllocator<D: RenderDevice> {
    device: Arc<D>,
    heap_type: DescriptorHeapType,
    descriptors_per_page: u32,
    inner: Mutex<AllocatorInner<D>>,
}

impl<D: RenderDevice> CpuDescriptorAllocator<D> {
    pub fn new(device: Arc<D>, heap_type: DescriptorHeapType, descriptors_per_page: u32) -> Self {
        Self {
            device,
            heap_type,
            descriptors_per_page,
            inner: Mutex::new(AllocatorInner {
                pages: Vec::new(),
                available_pages: BTreeSet::new(),
            }),
        }
    }

    /// 分配 `num_descriptors` 个连续的 descriptor
    ///
    /// # Panics
    /// 需要新 page 而 descriptor heap 创建失败时 panic
    pub fn allocate(&self, num_descriptors: u32) -> DescriptorAllocation<D> {
        let _span = cinder_crate_tools::profile_span!("CpuDescriptorAllocator::allocate");
        let mut inner = self.inner.lock().unwrap();

        let mut allocation = None;
        let mut exhausted_pages = Vec::new();
        for &index in &inner.available_pages {
            let page = &inner.pages[index];
            if let Some(result) = page.allocate(num_descriptors) {
                if page.num_free_handles() == 0 {
                    exhausted_pages.push(index);
                }
                allocation = Some(result);
                break;
            }
        }
        for index in exhausted_pages {
            inner.available_pages.remove(&index);
        }
        if let Some(allocation) = allocation {
            return allocation;
        }

        let page_size = num_descriptors.max(self.descriptors_per_page);
        let page = Arc::new(
            CpuDescriptorAllocatorPage::new(&*self.device, self.heap_type, page_size)
                .unwrap_or_else(|e| panic!("创建 {:?} descriptor page 失败: {e:?}", self.heap_type)),
        );
        log::trace!("create {:?} descriptor page #{}: {} descriptors", self.heap_type, inner.pages.len(), page_size);

        let Some(allocation) = page.allocate(num_descriptors) else {
            unreachable!("新建的 page 一定能满足分配");
        };
        let index = inner.pages.len();
        if page.num_free_handles() > 0 {
            inner.available_pages.insert(index);
        }
        inner.pages.push(page);
        allocation
    }

    /// 每帧调用一次，调用者需要保证相关的 GPU 工作已经完成
    pub fn release_stale_descriptors(&self) {
        let mut inner = self.inner.lock().unwrap();
        let AllocatorInner { pages, available_pages } = &mut *inner;
        for (index, page) in pages.iter().enumerate() {
            page.release_stale_descriptors();
            if page.num_free_handles() > 0 {
                available_pages.insert(index);
            }
        }
    }

    #[inline]
    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    pub fn num_pages(&self) -> usize {
        self.inner.lock().unwrap().pages.len()
    }

    pub fn page(&self, index: usize) -> Option<Arc<CpuDescriptorAllocatorPage<D>>> {
        self.inner.lock().unwrap().pages.get(index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use cinder_rhi::headless::HeadlessDevice;
    use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};

    use super::*;

    fn create_allocator(descriptors_per_page: u32) -> CpuDescriptorAllocator<HeadlessDevice> {
        CpuDescriptorAllocator::new(Arc::new(HeadlessDevice::new()), DescriptorHeapType::CbvSrvUav, descriptors_per_page)
    }

    #[test]
    fn test_freed_descriptor_is_not_reused_before_release() {
        let allocator = create_allocator(256);
        let first = allocator.allocate(1);
        assert_eq!(first.offset_in_page(), Some(0));
        drop(first);

        // 还没有调用 release_stale_descriptors，不会复用 offset 0
        let second = allocator.allocate(1);
        assert_eq!(second.offset_in_page(), Some(1));

        allocator.release_stale_descriptors();
        let third = allocator.allocate(1);
        assert_eq!(third.offset_in_page(), Some(0));
    }

    #[test]
    fn test_best_fit_prefers_smallest_block() {
        let allocator = create_allocator(64);
        let a = allocator.allocate(8);
        let _b = allocator.allocate(2);
        let c = allocator.allocate(4);
        let _d = allocator.allocate(2);
        // 空闲块: [0, 8), [10, 14), [16, 64)
        drop(a);
        drop(c);
        allocator.release_stale_descriptors();

        let fit = allocator.allocate(4);
        assert_eq!(fit.offset_in_page(), Some(10));
        let fit = allocator.allocate(6);
        assert_eq!(fit.offset_in_page(), Some(0));
    }

    #[test]
    fn test_coalesce_with_both_neighbours() {
        let allocator = create_allocator(16);
        let a = allocator.allocate(4);
        let b = allocator.allocate(4);
        let c = allocator.allocate(4);
        let page = allocator.page(0).unwrap();

        drop(a);
        drop(c);
        allocator.release_stale_descriptors();
        // [0,4) 与 [8,16) 两个块
        assert_eq!(page.num_free_blocks(), 2);

        drop(b);
        allocator.release_stale_descriptors();
        assert_eq!(page.num_free_blocks(), 1);
        assert_eq!(page.num_free_handles(), 16);
        assert!(page.has_space(16));
    }

    #[test]
    fn test_large_request_creates_dedicated_page() {
        let allocator = create_allocator(16);
        let small = allocator.allocate(4);
        let large = allocator.allocate(40);
        assert_eq!(allocator.num_pages(), 2);
        assert_eq!(large.page().unwrap().num_descriptors(), 40);
        assert_eq!(large.num_handles(), 40);
        assert!(!Arc::ptr_eq(small.page().unwrap(), large.page().unwrap()));

        // 第一个 page 仍然可用
        let again = allocator.allocate(12);
        assert!(Arc::ptr_eq(again.page().unwrap(), small.page().unwrap()));
    }

    #[test]
    fn test_free_handle_count_invariant() {
        let allocator = create_allocator(32);
        let a = allocator.allocate(10);
        let page = allocator.page(0).unwrap();
        assert_eq!(page.num_free_handles(), 22);

        // 归还只进入过期队列，数量不变
        drop(a);
        assert_eq!(page.num_free_handles(), 22);
        assert_eq!(page.num_stale_blocks(), 1);

        allocator.release_stale_descriptors();
        assert_eq!(page.num_free_handles(), 32);
        assert_eq!(page.num_stale_blocks(), 0);
    }

    #[test]
    fn test_random_round_trip_restores_page() {
        let allocator = create_allocator(256);
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..8 {
            let mut allocations = Vec::new();
            let mut total = 0;
            while total < 200 {
                let size: u32 = rng.gen_range(1..=12);
                total += size;
                allocations.push(allocator.allocate(size));
            }
            allocations.shuffle(&mut rng);

            // 分两批释放，中途 release 一次
            let second_half = allocations.split_off(allocations.len() / 2);
            drop(allocations);
            allocator.release_stale_descriptors();
            drop(second_half);
            allocator.release_stale_descriptors();

            // 所有块都合并回一个完整的块
            let page = allocator.page(0).unwrap();
            assert_eq!(page.num_free_handles(), 256);
            assert_eq!(page.num_free_blocks(), 1);

            let full = allocator.allocate(256);
            assert_eq!(full.offset_in_page(), Some(0));
            assert_eq!(allocator.num_pages(), 1);
            drop(full);
            allocator.release_stale_descriptors();
        }
    }

    #[test]
    fn test_descriptor_handle_offsets() {
        let allocator = create_allocator(8);
        let allocation = allocator.allocate(3);
        let stride = 32;
        assert_eq!(allocation.descriptor_handle(2), allocation.descriptor_handle(0).offset(2, stride));
        assert_eq!(allocation.heap_type(), Some(DescriptorHeapType::CbvSrvUav));
        assert!(DescriptorAllocation::<HeadlessDevice>::default().is_null());
    }
}
