//! 编排核心的服务容器
//!
//! 所有全局共享的状态（队列、全局资源状态表、资源 arena、descriptor 分配器、各类池子）
//! 都由 [`GpuCore`] 持有，以 `Arc<GpuCore>` 显式传递给录制上下文。

use std::sync::Arc;

use anyhow::Context;
use cinder_rhi::{
    descriptor::{DescriptorHeapType, SamplerDesc, ViewDesc},
    device::RenderDevice,
    pipeline::PipelineStateDesc,
    queue_type::QueueType,
    resource::{HeapKind, ResourceDesc},
    resource_state::ResourceStates,
    root_signature::RootSignatureDesc,
};

use crate::{
    command_queue::CommandQueueManager,
    config::GpuCoreConfig,
    context::{CommandContext, CommandContextManager},
    descriptor::{CpuDescriptorAllocator, DescriptorAllocation},
    pipeline::{PipelineState, RootSignature, RootSignatureCache, ShaderBindings},
    resource::{GpuResource, GpuResourceHandle, GpuResourceRegistry},
    state_tracker::GlobalResourceStateTable,
};

pub struct GpuCore<D: RenderDevice> {
    device: Arc<D>,
    config: GpuCoreConfig,
    queues: Arc<CommandQueueManager<D>>,
    resource_states: GlobalResourceStateTable,
    resources: GpuResourceRegistry<D>,
    descriptor_allocators: [CpuDescriptorAllocator<D>; DescriptorHeapType::COUNT],
    root_signatures: RootSignatureCache<D>,
    contexts: CommandContextManager<D>,
}

// new & init
impl<D: RenderDevice> GpuCore<D> {
    pub fn new(device: Arc<D>, config: GpuCoreConfig) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        let queues = Arc::new(CommandQueueManager::new(&device).context("无法创建命令队列")?);
        let descriptor_allocators = DescriptorHeapType::ALL.map(|heap_type| {
            CpuDescriptorAllocator::new(device.clone(), heap_type, config.descriptors_per_cpu_page)
        });
        let contexts = CommandContextManager::new(device.clone(), queues.clone(), &config);

        log::info!("GpuCore created: {:?}", config);
        Ok(Arc::new(Self {
            resources: GpuResourceRegistry::new(device.clone()),
            root_signatures: RootSignatureCache::new(device.clone()),
            resource_states: GlobalResourceStateTable::new(),
            device,
            config,
            queues,
            descriptor_allocators,
            contexts,
        }))
    }
}

// getters
impl<D: RenderDevice> GpuCore<D> {
    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    #[inline]
    pub fn config(&self) -> &GpuCoreConfig {
        &self.config
    }

    #[inline]
    pub fn queues(&self) -> &Arc<CommandQueueManager<D>> {
        &self.queues
    }

    #[inline]
    pub fn resource_states(&self) -> &GlobalResourceStateTable {
        &self.resource_states
    }

    #[inline]
    pub fn resources(&self) -> &GpuResourceRegistry<D> {
        &self.resources
    }

    #[inline]
    pub fn contexts(&self) -> &CommandContextManager<D> {
        &self.contexts
    }

    #[inline]
    pub fn descriptor_allocator(&self, heap_type: DescriptorHeapType) -> &CpuDescriptorAllocator<D> {
        &self.descriptor_allocators[heap_type.index()]
    }

    #[inline]
    pub fn resource(&self, handle: GpuResourceHandle) -> Option<Arc<GpuResource<D>>> {
        self.resources.get(handle)
    }
}

// contexts
impl<D: RenderDevice> GpuCore<D> {
    /// 在 `queue_type` 队列上开始录制
    pub fn begin_context(self: &Arc<Self>, label: &str, queue_type: QueueType) -> CommandContext<D> {
        CommandContext::begin(self.clone(), label, queue_type)
    }
}

// resources
impl<D: RenderDevice> GpuCore<D> {
    /// 创建资源并在全局状态表中登记初始状态
    pub fn create_resource(
        &self,
        desc: &ResourceDesc,
        initial_state: ResourceStates,
        name: &str,
    ) -> anyhow::Result<Arc<GpuResource<D>>> {
        let resource = self
            .resources
            .create(desc, initial_state, name)
            .with_context(|| format!("无法创建资源 '{}'", name))?;
        self.resource_states.register(resource.handle(), initial_state);
        Ok(resource)
    }

    /// upload 堆的 buffer 初始为 GENERIC_READ，readback 堆为 COPY_DEST，其余为 COMMON
    pub fn create_buffer(&self, size: u64, heap: HeapKind, name: &str) -> anyhow::Result<Arc<GpuResource<D>>> {
        let initial_state = match heap {
            HeapKind::Default => ResourceStates::COMMON,
            HeapKind::Upload => ResourceStates::GENERIC_READ,
            HeapKind::Readback => ResourceStates::COPY_DEST,
        };
        self.create_resource(&ResourceDesc::buffer(size, heap), initial_state, name)
    }

    pub fn create_texture(&self, desc: &ResourceDesc, name: &str) -> anyhow::Result<Arc<GpuResource<D>>> {
        anyhow::ensure!(!desc.is_buffer(), "'{}' 不是 texture 描述", name);
        self.create_resource(desc, ResourceStates::COMMON, name)
    }

    /// 从 arena 与全局状态表中移除，原生资源在所有队列当前的工作完成后释放
    pub fn destroy_resource(&self, handle: GpuResourceHandle) -> bool {
        let fences = self.queues.last_signaled_fences();
        match self.resources.retire(handle, fences) {
            Some(resource) => {
                self.resource_states.remove(handle);
                log::trace!("destroy resource '{}', pending {:?}", resource.name(), fences);
                true
            }
            None => {
                log::warn!("销毁了不存在的资源 {:?}", handle);
                false
            }
        }
    }

    pub fn create_query_heap(&self, count: u32, name: &str) -> anyhow::Result<D::QueryHeap> {
        self.device
            .create_query_heap(count, name)
            .with_context(|| format!("无法创建 query heap '{}'", name))
    }

    /// 释放 fence 已经完成的资源与 large page，返回释放的数量
    pub fn collect_retired_resources(&self) -> usize {
        self.resources.collect_retired(|fence| self.queues.is_fence_completed(fence)) + self.contexts.collect_retired()
    }
}

// descriptors
impl<D: RenderDevice> GpuCore<D> {
    pub fn allocate_descriptors(&self, heap_type: DescriptorHeapType, num_descriptors: u32) -> DescriptorAllocation<D> {
        self.descriptor_allocator(heap_type).allocate(num_descriptors)
    }

    fn create_view(&self, view: ViewDesc) -> DescriptorAllocation<D> {
        let allocation = self.allocate_descriptors(view.heap_type(), 1);
        self.device.create_view(&view, allocation.descriptor_handle(0));
        allocation
    }

    fn live_resource(&self, handle: GpuResourceHandle) -> anyhow::Result<Arc<GpuResource<D>>> {
        self.resource(handle).with_context(|| format!("资源 {:?} 已经被销毁", handle))
    }

    pub fn create_shader_resource_view(&self, handle: GpuResourceHandle) -> anyhow::Result<DescriptorAllocation<D>> {
        let resource = self.live_resource(handle)?;
        Ok(self.create_view(ViewDesc::ShaderResource { resource: resource.id() }))
    }

    pub fn create_unordered_access_view(&self, handle: GpuResourceHandle) -> anyhow::Result<DescriptorAllocation<D>> {
        let resource = self.live_resource(handle)?;
        anyhow::ensure!(
            resource.desc().allow_unordered_access,
            "资源 '{}' 不允许 unordered access",
            resource.name()
        );
        Ok(self.create_view(ViewDesc::UnorderedAccess { resource: resource.id() }))
    }

    pub fn create_constant_buffer_view(
        &self,
        handle: GpuResourceHandle,
        offset: u64,
        size_in_bytes: u32,
    ) -> anyhow::Result<DescriptorAllocation<D>> {
        let resource = self.live_resource(handle)?;
        anyhow::ensure!(resource.desc().is_buffer(), "资源 '{}' 不是 buffer", resource.name());
        anyhow::ensure!(
            offset + size_in_bytes as u64 <= resource.desc().buffer_size(),
            "CBV 范围超出了 buffer '{}' 的大小",
            resource.name()
        );
        Ok(self.create_view(ViewDesc::ConstantBuffer {
            buffer_location: resource.gpu_virtual_address() + offset,
            size_in_bytes,
        }))
    }

    pub fn create_render_target_view(
        &self,
        handle: GpuResourceHandle,
        mip_slice: u32,
    ) -> anyhow::Result<DescriptorAllocation<D>> {
        let resource = self.live_resource(handle)?;
        anyhow::ensure!(
            resource.desc().allow_render_target,
            "资源 '{}' 不能作为 render target",
            resource.name()
        );
        Ok(self.create_view(ViewDesc::RenderTarget {
            resource: resource.id(),
            mip_slice,
        }))
    }

    pub fn create_depth_stencil_view(
        &self,
        handle: GpuResourceHandle,
        read_only: bool,
    ) -> anyhow::Result<DescriptorAllocation<D>> {
        let resource = self.live_resource(handle)?;
        anyhow::ensure!(
            resource.desc().allow_depth_stencil,
            "资源 '{}' 不能作为 depth stencil",
            resource.name()
        );
        Ok(self.create_view(ViewDesc::DepthStencil {
            resource: resource.id(),
            read_only,
        }))
    }

    pub fn create_sampler(&self, desc: SamplerDesc) -> DescriptorAllocation<D> {
        self.create_view(ViewDesc::Sampler(desc))
    }

    /// 每帧调用一次，让上一帧释放的 descriptor 重新可用
    pub fn release_stale_descriptors(&self) {
        for allocator in &self.descriptor_allocators {
            allocator.release_stale_descriptors();
        }
    }
}

// pipelines
impl<D: RenderDevice> GpuCore<D> {
    pub fn create_root_signature(&self, desc: &RootSignatureDesc) -> anyhow::Result<Arc<RootSignature<D>>> {
        self.root_signatures.get_or_create(desc)
    }

    pub fn create_pipeline_state(
        &self,
        desc: PipelineStateDesc,
        root_signature: &RootSignatureDesc,
        bindings: ShaderBindings,
    ) -> anyhow::Result<Arc<PipelineState<D>>> {
        let root_signature = self.create_root_signature(root_signature)?;
        Ok(Arc::new(PipelineState::new(&*self.device, desc, root_signature, bindings)?))
    }
}

// teardown
impl<D: RenderDevice> GpuCore<D> {
    /// 等待所有队列空闲，并回收所有等待 fence 的对象
    pub fn idle_gpu(&self) {
        self.queues.idle_gpu();
        self.contexts.reclaim_all();
        self.resources.collect_all_retired();
        self.release_stale_descriptors();
    }
}

impl<D: RenderDevice> Drop for GpuCore<D> {
    fn drop(&mut self) {
        self.idle_gpu();
        log::info!("GpuCore destroyed");
    }
}

#[cfg(test)]
mod tests {
    use cinder_rhi::{headless::HeadlessDevice, resource::Format};

    use super::*;

    fn core() -> Arc<GpuCore<HeadlessDevice>> {
        cinder_crate_tools::init_log::init_test_log();
        GpuCore::new(Arc::new(HeadlessDevice::new()), GpuCoreConfig::default()).unwrap()
    }

    #[test]
    fn test_create_registers_initial_state() {
        let core = core();
        let upload = core.create_buffer(256, HeapKind::Upload, "upload").unwrap();
        let readback = core.create_buffer(256, HeapKind::Readback, "readback").unwrap();
        let texture = core
            .create_texture(&ResourceDesc::texture_2d(64, 64, 1, 4, Format::Rgba8Unorm), "texture")
            .unwrap();

        let uniform = |handle| core.resource_states().states_of(handle).unwrap().uniform_state();
        assert_eq!(uniform(upload.handle()), Some(ResourceStates::GENERIC_READ));
        assert_eq!(uniform(readback.handle()), Some(ResourceStates::COPY_DEST));
        assert_eq!(uniform(texture.handle()), Some(ResourceStates::COMMON));
        assert_eq!(core.resources().len(), 3);

        assert!(core.create_texture(&ResourceDesc::buffer(16, HeapKind::Default), "not-a-texture").is_err());
    }

    #[test]
    fn test_destroy_defers_until_fences_complete() {
        let core = core();
        let buffer = core.create_buffer(1024, HeapKind::Default, "buffer").unwrap();
        let handle = buffer.handle();
        drop(buffer);

        let fence = core.queues().graphics().signal();
        assert!(core.destroy_resource(handle));
        assert!(core.resource(handle).is_none());
        assert!(core.resource_states().states_of(handle).is_none());
        assert!(!core.destroy_resource(handle));

        assert_eq!(core.collect_retired_resources(), 0);
        core.queues().wait_for_fence(fence);
        assert_eq!(core.collect_retired_resources(), 1);
        assert_eq!(core.resources().pending_destroy_count(), 0);
    }

    #[test]
    fn test_views_validate_resource_usage() {
        let core = core();
        let buffer = core.create_buffer(1024, HeapKind::Default, "buffer").unwrap();

        let srv = core.create_shader_resource_view(buffer.handle()).unwrap();
        assert_eq!(
            core.device().descriptor_at(srv.descriptor_handle(0)),
            Some(ViewDesc::ShaderResource { resource: buffer.id() })
        );
        assert!(core.create_unordered_access_view(buffer.handle()).is_err());
        assert!(core.create_render_target_view(buffer.handle(), 0).is_err());
        assert!(core.create_constant_buffer_view(buffer.handle(), 768, 512).is_err());

        let cbv = core.create_constant_buffer_view(buffer.handle(), 256, 256).unwrap();
        assert_eq!(
            core.device().descriptor_at(cbv.descriptor_handle(0)),
            Some(ViewDesc::ConstantBuffer {
                buffer_location: buffer.gpu_virtual_address() + 256,
                size_in_bytes: 256,
            })
        );

        let sampler = core.create_sampler(SamplerDesc::default());
        assert_eq!(sampler.heap_type(), Some(DescriptorHeapType::Sampler));

        let handle = buffer.handle();
        core.destroy_resource(handle);
        assert!(core.create_shader_resource_view(handle).is_err());
    }

    #[test]
    fn test_root_signatures_are_cached() {
        let core = core();
        let desc = RootSignatureDesc::new(vec![cinder_rhi::root_signature::RootParameter::constants(4, 0)]);
        let a = core.create_root_signature(&desc).unwrap();
        let b = core.create_root_signature(&desc).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let pipeline = core
            .create_pipeline_state(PipelineStateDesc::compute("cs"), &desc, ShaderBindings::new())
            .unwrap();
        assert!(Arc::ptr_eq(pipeline.root_signature(), &a));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = GpuCoreConfig {
            default_linear_alignment: 3,
            ..Default::default()
        };
        assert!(GpuCore::new(Arc::new(HeadlessDevice::new()), config).is_err());
    }
}
