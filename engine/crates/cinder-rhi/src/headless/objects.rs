use std::{
    alloc::Layout,
    collections::BTreeMap,
    ptr::NonNull,
    sync::{Arc, Mutex},
};

use crate::{
    barrier::ResourceId,
    descriptor::{CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapType, GpuDescriptorHandle, ViewDesc},
    device::{NativeDescriptorHeap, NativeResource},
    pipeline::PipelineStateDesc,
    resource::ResourceDesc,
    root_signature::RootSignatureDesc,
};

/// buffer 的 GPU 地址以及映射内存的对齐，与 D3D12 的资源放置对齐一致
pub const RESOURCE_ALIGNMENT: u64 = 64 * 1024;

/// upload / readback 资源的持久映射内存
struct MappedMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: 映射内存的读写由调用者保证同步，和 GPU 映射内存的语义一致
unsafe impl Send for MappedMemory {}
unsafe impl Sync for MappedMemory {}

impl MappedMemory {
    fn new(size: u64) -> anyhow::Result<Self> {
        let layout = Layout::from_size_align(size as usize, RESOURCE_ALIGNMENT as usize)?;
        // SAFETY: layout 的大小在创建资源时已经保证非零
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| anyhow::anyhow!("映射内存分配失败: {} bytes", size))?;
        Ok(Self { ptr, layout })
    }
}

impl Drop for MappedMemory {
    fn drop(&mut self) {
        // SAFETY: ptr 由 alloc_zeroed 以相同的 layout 分配
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

pub struct HeadlessResource {
    id: ResourceId,
    desc: ResourceDesc,
    name: String,
    gpu_address: u64,
    memory: Option<MappedMemory>,
}

impl HeadlessResource {
    pub(crate) fn new(id: ResourceId, desc: ResourceDesc, name: &str, gpu_address: u64) -> anyhow::Result<Self> {
        let memory = if desc.heap.is_cpu_visible() {
            anyhow::ensure!(desc.is_buffer(), "只有 buffer 可以放在 CPU 可见的堆上: {}", name);
            Some(MappedMemory::new(desc.buffer_size())?)
        } else {
            None
        };

        Ok(Self {
            id,
            desc,
            name: name.to_string(),
            gpu_address,
            memory,
        })
    }

    #[inline]
    pub fn desc(&self) -> &ResourceDesc {
        &self.desc
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 读取映射内存中的数据，用于检查 upload 的结果
    pub fn read_mapped(&self, offset: u64, len: usize) -> Option<Vec<u8>> {
        let memory = self.memory.as_ref()?;
        assert!(offset as usize + len <= memory.layout.size(), "读取超出映射范围");
        // SAFETY: 范围已检查，内存在 self 存活期间有效
        let bytes = unsafe { std::slice::from_raw_parts(memory.ptr.as_ptr().add(offset as usize), len) };
        Some(bytes.to_vec())
    }
}

impl NativeResource for HeadlessResource {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn gpu_virtual_address(&self) -> u64 {
        self.gpu_address
    }

    fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.memory.as_ref().map(|memory| memory.ptr)
    }
}

/// 一个 descriptor heap 中所有 descriptor 的内容
pub(crate) struct HeapSlots {
    pub heap_type: DescriptorHeapType,
    pub cpu_start: CpuDescriptorHandle,
    pub gpu_start: Option<GpuDescriptorHandle>,
    pub stride: u32,
    pub slots: Mutex<Vec<Option<ViewDesc>>>,
}

impl HeapSlots {
    fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

#[derive(Default)]
struct DirectoryInner {
    by_cpu: BTreeMap<usize, Arc<HeapSlots>>,
    by_gpu: BTreeMap<u64, Arc<HeapSlots>>,
}

/// 通过 descriptor 句柄反查所在的 heap
#[derive(Default)]
pub(crate) struct HeapDirectory {
    inner: Mutex<DirectoryInner>,
}

impl HeapDirectory {
    pub(crate) fn register(&self, slots: Arc<HeapSlots>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(gpu_start) = slots.gpu_start {
            inner.by_gpu.insert(gpu_start.0, slots.clone());
        }
        inner.by_cpu.insert(slots.cpu_start.0, slots);
    }

    fn unregister(&self, cpu_start: CpuDescriptorHandle, gpu_start: Option<GpuDescriptorHandle>) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_cpu.remove(&cpu_start.0);
        if let Some(gpu_start) = gpu_start {
            inner.by_gpu.remove(&gpu_start.0);
        }
    }

    pub(crate) fn locate_cpu(&self, handle: CpuDescriptorHandle) -> Option<(Arc<HeapSlots>, usize)> {
        let inner = self.inner.lock().unwrap();
        let (&start, slots) = inner.by_cpu.range(..=handle.0).next_back()?;
        Self::slot_index(slots, (handle.0 - start) as u64).map(|index| (slots.clone(), index))
    }

    pub(crate) fn locate_gpu(&self, handle: GpuDescriptorHandle) -> Option<(Arc<HeapSlots>, usize)> {
        let inner = self.inner.lock().unwrap();
        let (&start, slots) = inner.by_gpu.range(..=handle.0).next_back()?;
        Self::slot_index(slots, handle.0 - start).map(|index| (slots.clone(), index))
    }

    fn slot_index(slots: &HeapSlots, byte_offset: u64) -> Option<usize> {
        let stride = slots.stride as u64;
        let index = (byte_offset / stride) as usize;
        (byte_offset % stride == 0 && index < slots.len()).then_some(index)
    }
}

pub struct HeadlessDescriptorHeap {
    id: u64,
    desc: DescriptorHeapDesc,
    cpu_start: CpuDescriptorHandle,
    gpu_start: Option<GpuDescriptorHandle>,
    directory: Arc<HeapDirectory>,
}

impl HeadlessDescriptorHeap {
    pub(crate) fn new(
        id: u64,
        desc: DescriptorHeapDesc,
        cpu_start: CpuDescriptorHandle,
        gpu_start: Option<GpuDescriptorHandle>,
        directory: Arc<HeapDirectory>,
    ) -> Self {
        Self {
            id,
            desc,
            cpu_start,
            gpu_start,
            directory,
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl NativeDescriptorHeap for HeadlessDescriptorHeap {
    fn desc(&self) -> &DescriptorHeapDesc {
        &self.desc
    }

    fn cpu_start(&self) -> CpuDescriptorHandle {
        self.cpu_start
    }

    fn gpu_start(&self) -> Option<GpuDescriptorHandle> {
        self.gpu_start
    }
}

impl Drop for HeadlessDescriptorHeap {
    fn drop(&mut self) {
        self.directory.unregister(self.cpu_start, self.gpu_start);
    }
}

pub struct HeadlessRootSignature {
    id: u64,
    desc: RootSignatureDesc,
}

impl HeadlessRootSignature {
    pub(crate) fn new(id: u64, desc: RootSignatureDesc) -> Self {
        Self { id, desc }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn desc(&self) -> &RootSignatureDesc {
        &self.desc
    }
}

pub struct HeadlessPipelineState {
    desc: PipelineStateDesc,
    root_signature: u64,
}

impl HeadlessPipelineState {
    pub(crate) fn new(desc: PipelineStateDesc, root_signature: u64) -> Self {
        Self { desc, root_signature }
    }

    #[inline]
    pub fn desc(&self) -> &PipelineStateDesc {
        &self.desc
    }

    #[inline]
    pub fn root_signature(&self) -> u64 {
        self.root_signature
    }
}

pub struct HeadlessQueryHeap {
    count: u32,
}

impl HeadlessQueryHeap {
    pub(crate) fn new(count: u32) -> Self {
        Self { count }
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }
}
