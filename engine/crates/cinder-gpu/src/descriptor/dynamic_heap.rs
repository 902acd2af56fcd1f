//! 录制期间暂存 descriptor，在 draw/dispatch 前统一拷贝到 shader visible heap
//!
//! 每个 [`DynamicDescriptorHeap`] 只处理一种 heap 类型。root signature 中属于该类型的
//! descriptor table 在暂存区中按 root 索引顺序紧密排列；被修改过的 table 记在 stale 掩码中，
//! 提交时只拷贝 stale 的部分。

use std::sync::Arc;

use cinder_rhi::{
    descriptor::{CpuDescriptorHandle, DescriptorHeapType, GpuDescriptorHandle},
    device::{NativeCommandList, RenderDevice},
    root_signature::{BindPoint, MAX_ROOT_PARAMETERS, RootViewKind},
};

use crate::{
    command_list::CommandList,
    descriptor::shader_visible_pool::{ShaderVisibleHeap, ShaderVisibleHeapPool},
    fence::FenceValue,
    pipeline::RootSignatureLayout,
};

#[derive(Clone, Copy, Debug, Default)]
struct DescriptorTableCache {
    num_descriptors: u32,
    /// 在暂存区中的起始位置
    base_offset: usize,
}

const INLINE_VIEW_KINDS: [RootViewKind; 3] = [RootViewKind::Cbv, RootViewKind::Srv, RootViewKind::Uav];

#[inline]
fn inline_slot(kind: RootViewKind) -> usize {
    match kind {
        RootViewKind::Cbv => 0,
        RootViewKind::Srv => 1,
        RootViewKind::Uav => 2,
    }
}

/// 遍历掩码中置位的 root 索引
fn bit_indices(mut mask: u32) -> impl Iterator<Item = u32> {
    std::iter::from_fn(move || {
        if mask == 0 {
            return None;
        }
        let index = mask.trailing_zeros();
        mask &= mask - 1;
        Some(index)
    })
}

pub struct DynamicDescriptorHeap<D: RenderDevice> {
    device: Arc<D>,
    pool: Arc<ShaderVisibleHeapPool<D>>,
    heap_type: DescriptorHeapType,
    increment_size: u32,

    handle_cache: Vec<CpuDescriptorHandle>,
    table_cache: [DescriptorTableCache; MAX_ROOT_PARAMETERS],
    descriptor_table_bitmask: u32,
    stale_descriptor_table_bitmask: u32,
    /// 已经拷贝进某个 heap 的 table，换 heap 时只有它们需要重新拷贝
    committed_descriptor_table_bitmask: u32,

    /// 以 GPU 地址直接绑定的 CBV/SRV/UAV
    inline_views: [[u64; MAX_ROOT_PARAMETERS]; 3],
    stale_inline_bitmasks: [u32; 3],

    current_heap: Option<Arc<ShaderVisibleHeap<D>>>,
    current_cpu_handle: CpuDescriptorHandle,
    current_gpu_handle: GpuDescriptorHandle,
    num_free_handles: u32,

    /// 本次录制中已经用满、等待提交完成的 heap
    retired_heaps: Vec<Arc<ShaderVisibleHeap<D>>>,
}

// new & init
impl<D: RenderDevice> DynamicDescriptorHeap<D> {
    pub fn new(device: Arc<D>, pool: Arc<ShaderVisibleHeapPool<D>>) -> Self {
        let heap_type = pool.heap_type();
        let increment_size = device.descriptor_increment_size(heap_type);
        let capacity = pool.descriptors_per_heap() as usize;
        Self {
            device,
            pool,
            heap_type,
            increment_size,
            handle_cache: vec![CpuDescriptorHandle::NULL; capacity],
            table_cache: [DescriptorTableCache::default(); MAX_ROOT_PARAMETERS],
            descriptor_table_bitmask: 0,
            stale_descriptor_table_bitmask: 0,
            committed_descriptor_table_bitmask: 0,
            inline_views: [[0; MAX_ROOT_PARAMETERS]; 3],
            stale_inline_bitmasks: [0; 3],
            current_heap: None,
            current_cpu_handle: CpuDescriptorHandle::NULL,
            current_gpu_handle: GpuDescriptorHandle::NULL,
            num_free_handles: 0,
            retired_heaps: Vec::new(),
        }
    }
}

// getters
impl<D: RenderDevice> DynamicDescriptorHeap<D> {
    #[inline]
    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    #[inline]
    pub fn current_heap(&self) -> Option<&Arc<ShaderVisibleHeap<D>>> {
        self.current_heap.as_ref()
    }

    #[inline]
    pub fn num_free_handles(&self) -> u32 {
        self.num_free_handles
    }

    #[inline]
    pub fn num_retired_heaps(&self) -> usize {
        self.retired_heaps.len()
    }

    /// stale table 需要拷贝的 descriptor 总数
    pub fn stale_descriptor_count(&self) -> u32 {
        bit_indices(self.stale_descriptor_table_bitmask)
            .map(|root_index| self.table_cache[root_index as usize].num_descriptors)
            .sum()
    }

    /// 是否有待提交的 table 或 inline view
    pub fn has_stale(&self) -> bool {
        self.stale_descriptor_table_bitmask != 0 || self.stale_inline_bitmasks.iter().any(|mask| *mask != 0)
    }
}

// stage
impl<D: RenderDevice> DynamicDescriptorHeap<D> {
    /// 按 root signature 重新划分暂存区，之前暂存的内容全部作废
    pub fn parse_root_signature(&mut self, layout: &RootSignatureLayout) {
        self.stale_descriptor_table_bitmask = 0;
        self.committed_descriptor_table_bitmask = 0;
        self.stale_inline_bitmasks = [0; 3];
        self.table_cache = [DescriptorTableCache::default(); MAX_ROOT_PARAMETERS];
        self.descriptor_table_bitmask = layout.descriptor_table_bitmask(self.heap_type);

        let mut offset = 0;
        for root_index in bit_indices(self.descriptor_table_bitmask) {
            let num_descriptors = layout.num_descriptors(root_index);
            self.table_cache[root_index as usize] = DescriptorTableCache {
                num_descriptors,
                base_offset: offset,
            };
            offset += num_descriptors as usize;
        }

        assert!(
            offset <= self.handle_cache.len(),
            "root signature 需要 {} 个 {:?} descriptor，超过了暂存容量 {}",
            offset,
            self.heap_type,
            self.handle_cache.len()
        );
        self.handle_cache[..offset].fill(CpuDescriptorHandle::NULL);
    }

    /// 暂存从 `src` 开始的 `num` 个连续 descriptor，写入 table 的 `offset` 位置
    pub fn stage_descriptors(&mut self, root_index: u32, offset: u32, num: u32, src: CpuDescriptorHandle) {
        let base = self.table_range(root_index, offset, num);
        for i in 0..num {
            self.handle_cache[base + i as usize] = src.offset(i, self.increment_size);
        }
        self.stale_descriptor_table_bitmask |= 1 << root_index;
    }

    /// 暂存一组不连续的 descriptor
    pub fn stage_descriptor_handles(&mut self, root_index: u32, offset: u32, handles: &[CpuDescriptorHandle]) {
        let base = self.table_range(root_index, offset, handles.len() as u32);
        self.handle_cache[base..base + handles.len()].copy_from_slice(handles);
        self.stale_descriptor_table_bitmask |= 1 << root_index;
    }

    fn table_range(&self, root_index: u32, offset: u32, num: u32) -> usize {
        assert!(
            (root_index as usize) < MAX_ROOT_PARAMETERS,
            "root 参数索引越界: {}",
            root_index
        );
        assert!(
            self.descriptor_table_bitmask & (1 << root_index) != 0,
            "root 参数 {} 不是 {:?} 类型的 descriptor table",
            root_index,
            self.heap_type
        );
        let table = self.table_cache[root_index as usize];
        assert!(
            offset + num <= table.num_descriptors,
            "暂存的 descriptor [{}, {}) 超出了 table {} 的大小 {}",
            offset,
            offset + num,
            root_index,
            table.num_descriptors
        );
        table.base_offset + offset as usize
    }

    pub fn stage_inline_view(&mut self, kind: RootViewKind, root_index: u32, gpu_address: u64) {
        assert_eq!(
            self.heap_type,
            DescriptorHeapType::CbvSrvUav,
            "inline view 只能暂存在 CBV/SRV/UAV heap 中"
        );
        assert!(
            (root_index as usize) < MAX_ROOT_PARAMETERS,
            "root 参数索引越界: {}",
            root_index
        );
        let slot = inline_slot(kind);
        self.inline_views[slot][root_index as usize] = gpu_address;
        self.stale_inline_bitmasks[slot] |= 1 << root_index;
    }

    #[inline]
    pub fn stage_inline_cbv(&mut self, root_index: u32, gpu_address: u64) {
        self.stage_inline_view(RootViewKind::Cbv, root_index, gpu_address);
    }

    #[inline]
    pub fn stage_inline_srv(&mut self, root_index: u32, gpu_address: u64) {
        self.stage_inline_view(RootViewKind::Srv, root_index, gpu_address);
    }

    #[inline]
    pub fn stage_inline_uav(&mut self, root_index: u32, gpu_address: u64) {
        self.stage_inline_view(RootViewKind::Uav, root_index, gpu_address);
    }
}

// commit
impl<D: RenderDevice> DynamicDescriptorHeap<D> {
    /// 确保当前 heap 能容纳所有 stale table
    ///
    /// 空间不足时换一个新的 heap，此时已经提交过的 table 都需要重新拷贝。
    /// 返回 heap 是否发生了变化，调用者需要据此重新绑定 descriptor heap。
    pub fn ensure_heap_capacity(&mut self) -> bool {
        let required = self.stale_descriptor_count();
        if required == 0 || (self.current_heap.is_some() && required <= self.num_free_handles) {
            return false;
        }

        if let Some(old_heap) = self.current_heap.take() {
            self.retired_heaps.push(old_heap);
        }
        let heap = self.pool.request_heap();
        self.current_cpu_handle = heap.cpu_start();
        self.current_gpu_handle = heap.gpu_start();
        self.num_free_handles = heap.num_descriptors();
        log::trace!("{:?} dynamic descriptor heap 切换到 #{}", self.heap_type, heap.id());
        self.current_heap = Some(heap);

        self.stale_descriptor_table_bitmask |= self.committed_descriptor_table_bitmask;
        let required = self.stale_descriptor_count();
        assert!(
            required <= self.num_free_handles,
            "root signature 需要 {} 个 descriptor，超过了单个 shader visible heap 的容量 {}",
            required,
            self.num_free_handles
        );
        true
    }

    /// 把 stale table 拷贝进当前 heap 并设置 root 参数，同时提交 inline view
    ///
    /// 调用前需要先 [`Self::ensure_heap_capacity`] 并绑定 heap
    pub fn commit_staged_descriptors(&mut self, command_list: &mut CommandList<D>, bind_point: BindPoint) {
        let _span = cinder_crate_tools::profile_span!("DynamicDescriptorHeap::commit_staged_descriptors");

        if self.stale_descriptor_table_bitmask != 0 {
            assert!(
                self.current_heap.is_some() && self.stale_descriptor_count() <= self.num_free_handles,
                "提交 descriptor 之前需要先调用 ensure_heap_capacity"
            );

            for root_index in bit_indices(self.stale_descriptor_table_bitmask) {
                let table = self.table_cache[root_index as usize];
                let sources = &self.handle_cache[table.base_offset..table.base_offset + table.num_descriptors as usize];
                self.device.copy_descriptors(self.current_cpu_handle, sources, self.heap_type);
                command_list
                    .native_mut()
                    .set_root_descriptor_table(bind_point, root_index, self.current_gpu_handle);

                self.current_cpu_handle = self.current_cpu_handle.offset(table.num_descriptors, self.increment_size);
                self.current_gpu_handle = self.current_gpu_handle.offset(table.num_descriptors, self.increment_size);
                self.num_free_handles -= table.num_descriptors;
            }
            self.committed_descriptor_table_bitmask |= self.stale_descriptor_table_bitmask;
            self.stale_descriptor_table_bitmask = 0;
        }

        for (slot, kind) in INLINE_VIEW_KINDS.into_iter().enumerate() {
            for root_index in bit_indices(self.stale_inline_bitmasks[slot]) {
                command_list.native_mut().set_root_view(
                    bind_point,
                    kind,
                    root_index,
                    self.inline_views[slot][root_index as usize],
                );
            }
            self.stale_inline_bitmasks[slot] = 0;
        }
    }

    /// 把单个 descriptor 拷贝进当前 heap，返回它的 GPU 句柄
    ///
    /// 返回值中的 bool 表示 heap 是否发生了变化
    pub fn copy_descriptor(&mut self, src: CpuDescriptorHandle) -> (GpuDescriptorHandle, bool) {
        let mut heap_changed = false;
        if self.current_heap.is_none() || self.num_free_handles == 0 {
            if let Some(old_heap) = self.current_heap.take() {
                self.retired_heaps.push(old_heap);
            }
            let heap = self.pool.request_heap();
            self.current_cpu_handle = heap.cpu_start();
            self.current_gpu_handle = heap.gpu_start();
            self.num_free_handles = heap.num_descriptors();
            self.current_heap = Some(heap);
            self.stale_descriptor_table_bitmask |= self.committed_descriptor_table_bitmask;
            heap_changed = true;
        }

        let gpu_handle = self.current_gpu_handle;
        self.device.copy_descriptors(self.current_cpu_handle, &[src], self.heap_type);
        self.current_cpu_handle = self.current_cpu_handle.offset(1, self.increment_size);
        self.current_gpu_handle = self.current_gpu_handle.offset(1, self.increment_size);
        self.num_free_handles -= 1;
        (gpu_handle, heap_changed)
    }
}

// retire
impl<D: RenderDevice> DynamicDescriptorHeap<D> {
    /// 录制结束后，把用过的 heap 交还给池子，并清空所有暂存状态
    pub fn retire_used_heaps(&mut self, fence: FenceValue) {
        let mut heaps = std::mem::take(&mut self.retired_heaps);
        heaps.extend(self.current_heap.take());
        if !heaps.is_empty() {
            self.pool.retire_heaps(fence, heaps);
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.current_cpu_handle = CpuDescriptorHandle::NULL;
        self.current_gpu_handle = GpuDescriptorHandle::NULL;
        self.num_free_handles = 0;
        self.descriptor_table_bitmask = 0;
        self.stale_descriptor_table_bitmask = 0;
        self.committed_descriptor_table_bitmask = 0;
        self.stale_inline_bitmasks = [0; 3];
        self.table_cache = [DescriptorTableCache::default(); MAX_ROOT_PARAMETERS];
    }
}
