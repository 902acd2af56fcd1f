//! 不依赖 GPU 的确定性 device 实现
//!
//! - 命令只会被录制，提交后进入对应队列的时间线
//! - 只有 CPU 等待 fence 或者调用 [`HeadlessDevice::advance_all`] 时，时间线才会推进
//! - descriptor heap 是真实的 slot 数组，可以通过句柄读回写入的 view

mod command_list;
mod objects;
mod timeline;

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

pub use command_list::{HeadlessCommandList, RecordedBarrier, RecordedCommand};
pub use objects::{
    HeadlessDescriptorHeap, HeadlessPipelineState, HeadlessQueryHeap, HeadlessResource, HeadlessRootSignature,
    RESOURCE_ALIGNMENT,
};
pub use timeline::{ExecutedBatch, HeadlessQueue, RecordedCommandList};

use crate::{
    barrier::ResourceId,
    descriptor::{CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapType, GpuDescriptorHandle, ViewDesc},
    device::RenderDevice,
    pipeline::PipelineStateDesc,
    queue_type::QueueType,
    resource::ResourceDesc,
    resource_state::ResourceStates,
    root_signature::RootSignatureDesc,
};
use objects::{HeapDirectory, HeapSlots};
use timeline::GpuTimeline;

/// 所有 heap 类型都使用相同的 descriptor 大小
pub const HEADLESS_DESCRIPTOR_SIZE: u32 = 32;

const CPU_HANDLE_BASE: usize = 0x1000_0000;
const GPU_HANDLE_BASE: u64 = 0x8000_0000_0000;
const GPU_ADDRESS_BASE: u64 = 0x1_0000_0000;

/// 创建对象的计数，用于检查池化行为
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub command_lists_created: usize,
    pub descriptor_heaps_created: usize,
    pub resources_created: usize,
}

pub struct HeadlessDevice {
    timeline: Arc<GpuTimeline>,
    heap_directory: Arc<HeapDirectory>,
    created_queues: Mutex<[bool; QueueType::COUNT]>,

    next_object_id: AtomicU64,
    next_cpu_handle: AtomicUsize,
    next_gpu_handle: AtomicU64,
    next_gpu_address: AtomicU64,

    command_lists_created: AtomicUsize,
    descriptor_heaps_created: AtomicUsize,
    resources_created: AtomicUsize,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

// new & init
impl HeadlessDevice {
    pub fn new() -> Self {
        Self {
            timeline: Arc::new(GpuTimeline::default()),
            heap_directory: Arc::new(HeapDirectory::default()),
            created_queues: Mutex::new([false; QueueType::COUNT]),
            next_object_id: AtomicU64::new(1),
            next_cpu_handle: AtomicUsize::new(CPU_HANDLE_BASE),
            next_gpu_handle: AtomicU64::new(GPU_HANDLE_BASE),
            next_gpu_address: AtomicU64::new(GPU_ADDRESS_BASE),
            command_lists_created: AtomicUsize::new(0),
            descriptor_heaps_created: AtomicUsize::new(0),
            resources_created: AtomicUsize::new(0),
        }
    }
}

// 模拟 GPU 的控制与检查
impl HeadlessDevice {
    /// 让所有队列尽可能执行完已经提交的工作
    pub fn advance_all(&self) {
        self.timeline.advance_all();
    }

    /// 已经在模拟 GPU 上执行过的提交，按执行顺序排列
    pub fn executed_batches(&self) -> Vec<ExecutedBatch> {
        self.timeline.executed_batches()
    }

    pub fn take_executed_batches(&self) -> Vec<ExecutedBatch> {
        self.timeline.take_executed_batches()
    }

    pub fn stats(&self) -> HeadlessStats {
        HeadlessStats {
            command_lists_created: self.command_lists_created.load(Ordering::Relaxed),
            descriptor_heaps_created: self.descriptor_heaps_created.load(Ordering::Relaxed),
            resources_created: self.resources_created.load(Ordering::Relaxed),
        }
    }

    /// 读取 CPU 句柄处的 descriptor 内容
    pub fn descriptor_at(&self, handle: CpuDescriptorHandle) -> Option<ViewDesc> {
        let (slots, index) = self.heap_directory.locate_cpu(handle)?;
        slots.slots.lock().unwrap()[index]
    }

    /// 读取 GPU 句柄处的 descriptor 内容
    pub fn descriptor_at_gpu(&self, handle: GpuDescriptorHandle) -> Option<ViewDesc> {
        let (slots, index) = self.heap_directory.locate_gpu(handle)?;
        slots.slots.lock().unwrap()[index]
    }
}

// tools
impl HeadlessDevice {
    fn next_id(&self) -> u64 {
        self.next_object_id.fetch_add(1, Ordering::Relaxed)
    }

    /// 分配一段地址区间，区间之间留出一个 descriptor 的空隙，避免相邻 heap 的句柄混淆
    fn reserve_cpu_range(&self, bytes: usize) -> CpuDescriptorHandle {
        let stride = HEADLESS_DESCRIPTOR_SIZE as usize;
        CpuDescriptorHandle(self.next_cpu_handle.fetch_add(bytes + stride, Ordering::Relaxed))
    }

    fn reserve_gpu_range(&self, bytes: u64) -> GpuDescriptorHandle {
        let stride = HEADLESS_DESCRIPTOR_SIZE as u64;
        GpuDescriptorHandle(self.next_gpu_handle.fetch_add(bytes + stride, Ordering::Relaxed))
    }

    fn write_descriptor(&self, dest: CpuDescriptorHandle, view: Option<ViewDesc>) {
        let Some((slots, index)) = self.heap_directory.locate_cpu(dest) else {
            log::error!("写入无效的 descriptor 句柄: {:#x}", dest.0);
            return;
        };
        if let Some(view) = &view {
            debug_assert_eq!(view.heap_type(), slots.heap_type, "view 类型与 heap 类型不匹配");
        }
        slots.slots.lock().unwrap()[index] = view;
    }
}

impl RenderDevice for HeadlessDevice {
    type Resource = HeadlessResource;
    type DescriptorHeap = HeadlessDescriptorHeap;
    type RootSignature = HeadlessRootSignature;
    type PipelineState = HeadlessPipelineState;
    type QueryHeap = HeadlessQueryHeap;
    type CommandList = HeadlessCommandList;
    type Queue = HeadlessQueue;

    fn create_queue(&self, queue_type: QueueType) -> anyhow::Result<HeadlessQueue> {
        let mut created = self.created_queues.lock().unwrap();
        anyhow::ensure!(!created[queue_type.index()], "headless device 的每种队列只能创建一个: {}", queue_type);
        created[queue_type.index()] = true;
        Ok(HeadlessQueue::new(queue_type, self.timeline.clone()))
    }

    fn create_command_list(&self, queue_type: QueueType, debug_name: &str) -> anyhow::Result<HeadlessCommandList> {
        self.command_lists_created.fetch_add(1, Ordering::Relaxed);
        Ok(HeadlessCommandList::new(queue_type, debug_name))
    }

    fn create_resource(
        &self,
        desc: &ResourceDesc,
        _initial_state: ResourceStates,
        debug_name: &str,
    ) -> anyhow::Result<HeadlessResource> {
        let gpu_address = if desc.is_buffer() {
            let size = desc.buffer_size();
            anyhow::ensure!(size > 0, "buffer 大小不能为 0: {}", debug_name);
            let reserved = size.div_ceil(RESOURCE_ALIGNMENT) * RESOURCE_ALIGNMENT;
            self.next_gpu_address.fetch_add(reserved, Ordering::Relaxed)
        } else {
            0
        };

        let resource = HeadlessResource::new(ResourceId(self.next_id()), *desc, debug_name, gpu_address)?;
        self.resources_created.fetch_add(1, Ordering::Relaxed);
        Ok(resource)
    }

    fn create_descriptor_heap(
        &self,
        desc: &DescriptorHeapDesc,
        debug_name: &str,
    ) -> anyhow::Result<HeadlessDescriptorHeap> {
        anyhow::ensure!(desc.num_descriptors > 0, "descriptor heap 不能为空: {}", debug_name);
        anyhow::ensure!(
            !desc.shader_visible || desc.heap_type.can_be_shader_visible(),
            "{:?} 类型的 heap 不能 shader visible: {}",
            desc.heap_type,
            debug_name
        );

        let stride = self.descriptor_increment_size(desc.heap_type);
        let bytes = desc.num_descriptors as usize * stride as usize;
        let cpu_start = self.reserve_cpu_range(bytes);
        let gpu_start = desc.shader_visible.then(|| self.reserve_gpu_range(bytes as u64));

        self.heap_directory.register(Arc::new(HeapSlots {
            heap_type: desc.heap_type,
            cpu_start,
            gpu_start,
            stride,
            slots: Mutex::new(vec![None; desc.num_descriptors as usize]),
        }));
        self.descriptor_heaps_created.fetch_add(1, Ordering::Relaxed);
        log::trace!("create descriptor heap {}: {:?}", debug_name, desc);

        Ok(HeadlessDescriptorHeap::new(
            self.next_id(),
            *desc,
            cpu_start,
            gpu_start,
            self.heap_directory.clone(),
        ))
    }

    fn create_root_signature(&self, desc: &RootSignatureDesc) -> anyhow::Result<HeadlessRootSignature> {
        Ok(HeadlessRootSignature::new(self.next_id(), desc.clone()))
    }

    fn create_pipeline_state(
        &self,
        desc: &PipelineStateDesc,
        root_signature: &HeadlessRootSignature,
    ) -> anyhow::Result<HeadlessPipelineState> {
        Ok(HeadlessPipelineState::new(desc.clone(), root_signature.id()))
    }

    fn create_query_heap(&self, count: u32, debug_name: &str) -> anyhow::Result<HeadlessQueryHeap> {
        anyhow::ensure!(count > 0, "query heap 不能为空: {}", debug_name);
        Ok(HeadlessQueryHeap::new(count))
    }

    fn descriptor_increment_size(&self, _heap_type: DescriptorHeapType) -> u32 {
        HEADLESS_DESCRIPTOR_SIZE
    }

    fn create_view(&self, view: &ViewDesc, dest: CpuDescriptorHandle) {
        self.write_descriptor(dest, Some(*view));
    }

    fn copy_descriptors(&self, dest_start: CpuDescriptorHandle, sources: &[CpuDescriptorHandle], heap_type: DescriptorHeapType) {
        let stride = self.descriptor_increment_size(heap_type);
        for (i, source) in sources.iter().enumerate() {
            // 未初始化的源 descriptor 复制为空
            let view = if source.is_null() { None } else { self.descriptor_at(*source) };
            self.write_descriptor(dest_start.offset(i as u32, stride), view);
        }
    }
}
