//! root signature 与 pipeline state 的封装
//!
//! root signature 在创建时解析出布局信息，供 [`DynamicDescriptorHeap`] 使用；
//! pipeline 附带由外部反射得到的参数名到绑定位置的映射。
//!
//! [`DynamicDescriptorHeap`]: crate::descriptor::DynamicDescriptorHeap

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::Context;
use cinder_rhi::{
    descriptor::DescriptorHeapType,
    device::RenderDevice,
    pipeline::{PipelineKind, PipelineStateDesc},
    root_signature::{BindPoint, MAX_ROOT_PARAMETERS, RootParameter, RootSignatureDesc, RootViewKind},
};
use itertools::Itertools;

/// 解析后的 root 参数
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RootParameterLayout {
    DescriptorTable {
        heap_type: DescriptorHeapType,
        num_descriptors: u32,
    },
    Constants {
        num_32bit_values: u32,
    },
    View(RootViewKind),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootSignatureLayout {
    parameters: Vec<RootParameterLayout>,
    /// CBV/SRV/UAV 与 sampler 两种 descriptor table 的掩码
    table_bitmasks: [u32; 2],
}

impl RootSignatureLayout {
    pub fn parse(desc: &RootSignatureDesc) -> anyhow::Result<Self> {
        anyhow::ensure!(
            desc.parameters.len() <= MAX_ROOT_PARAMETERS,
            "root 参数数量 {} 超过上限 {}",
            desc.parameters.len(),
            MAX_ROOT_PARAMETERS
        );

        let mut table_bitmasks = [0u32; 2];
        let mut parameters = Vec::with_capacity(desc.parameters.len());
        for (root_index, parameter) in desc.parameters.iter().enumerate() {
            let layout = match parameter {
                RootParameter::DescriptorTable { ranges, .. } => {
                    let heap_type = ranges
                        .first()
                        .map(|range| range.range_type.heap_type())
                        .with_context(|| format!("descriptor table {} 为空", root_index))?;
                    anyhow::ensure!(
                        ranges.iter().all(|range| range.range_type.heap_type() == heap_type),
                        "descriptor table {} 混合了 sampler 与 CBV/SRV/UAV",
                        root_index
                    );
                    let num_descriptors: u32 = ranges.iter().map(|range| range.num_descriptors).sum();
                    anyhow::ensure!(num_descriptors > 0, "descriptor table {} 不包含 descriptor", root_index);

                    table_bitmasks[Self::table_slot(heap_type)] |= 1 << root_index;
                    RootParameterLayout::DescriptorTable {
                        heap_type,
                        num_descriptors,
                    }
                }
                RootParameter::Constants { num_32bit_values, .. } => RootParameterLayout::Constants {
                    num_32bit_values: *num_32bit_values,
                },
                RootParameter::View { kind, .. } => RootParameterLayout::View(*kind),
            };
            parameters.push(layout);
        }

        Ok(Self {
            parameters,
            table_bitmasks,
        })
    }

    fn table_slot(heap_type: DescriptorHeapType) -> usize {
        match heap_type {
            DescriptorHeapType::Sampler => 1,
            _ => 0,
        }
    }

    /// 指定类型的 descriptor table 所在的 root 参数掩码
    pub fn descriptor_table_bitmask(&self, heap_type: DescriptorHeapType) -> u32 {
        if heap_type.can_be_shader_visible() {
            self.table_bitmasks[Self::table_slot(heap_type)]
        } else {
            0
        }
    }

    /// descriptor table 包含的 descriptor 数量，非 table 参数返回 0
    pub fn num_descriptors(&self, root_index: u32) -> u32 {
        match self.parameters.get(root_index as usize) {
            Some(RootParameterLayout::DescriptorTable { num_descriptors, .. }) => *num_descriptors,
            _ => 0,
        }
    }

    #[inline]
    pub fn parameter(&self, root_index: u32) -> Option<&RootParameterLayout> {
        self.parameters.get(root_index as usize)
    }

    #[inline]
    pub fn num_parameters(&self) -> usize {
        self.parameters.len()
    }
}

pub struct RootSignature<D: RenderDevice> {
    native: D::RootSignature,
    desc: RootSignatureDesc,
    layout: RootSignatureLayout,
}

impl<D: RenderDevice> RootSignature<D> {
    pub fn new(device: &D, desc: &RootSignatureDesc) -> anyhow::Result<Self> {
        let layout = RootSignatureLayout::parse(desc)?;
        let native = device.create_root_signature(desc).context("无法创建 root signature")?;
        Ok(Self {
            native,
            desc: desc.clone(),
            layout,
        })
    }

    #[inline]
    pub fn native(&self) -> &D::RootSignature {
        &self.native
    }

    #[inline]
    pub fn desc(&self) -> &RootSignatureDesc {
        &self.desc
    }

    #[inline]
    pub fn layout(&self) -> &RootSignatureLayout {
        &self.layout
    }
}

/// 以描述为 key 的 root signature 缓存
pub struct RootSignatureCache<D: RenderDevice> {
    device: Arc<D>,
    cache: Mutex<HashMap<RootSignatureDesc, Arc<RootSignature<D>>>>,
}

impl<D: RenderDevice> RootSignatureCache<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, desc: &RootSignatureDesc) -> anyhow::Result<Arc<RootSignature<D>>> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(root_signature) = cache.get(desc) {
            return Ok(root_signature.clone());
        }

        let root_signature = Arc::new(RootSignature::new(&*self.device, desc)?);
        cache.insert(desc.clone(), root_signature.clone());
        Ok(root_signature)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// shader 参数的绑定位置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingSlot {
    /// descriptor table 中的某个位置
    Table { root_index: u32, offset: u32 },
    /// 以 GPU 地址直接绑定
    RootView { kind: RootViewKind, root_index: u32 },
    Constants { root_index: u32 },
}

impl BindingSlot {
    #[inline]
    pub fn root_index(&self) -> u32 {
        match self {
            Self::Table { root_index, .. } | Self::RootView { root_index, .. } | Self::Constants { root_index } => {
                *root_index
            }
        }
    }
}

/// 由 shader 反射得到的参数名到绑定位置的映射
#[derive(Clone, Debug, Default)]
pub struct ShaderBindings {
    slots: HashMap<String, BindingSlot>,
}

impl ShaderBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, slot: BindingSlot) -> Self {
        self.slots.insert(name.into(), slot);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, slot: BindingSlot) {
        self.slots.insert(name.into(), slot);
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<BindingSlot> {
        self.slots.get(name).copied()
    }

    /// 检查每个绑定位置都与 root signature 的布局一致
    pub fn validate(&self, layout: &RootSignatureLayout) -> anyhow::Result<()> {
        for (name, slot) in self.slots.iter().sorted_by_key(|(name, _)| name.as_str()) {
            let parameter = layout
                .parameter(slot.root_index())
                .with_context(|| format!("参数 '{}' 的 root 索引 {} 越界", name, slot.root_index()))?;
            let matched = match (slot, parameter) {
                (BindingSlot::Table { offset, .. }, RootParameterLayout::DescriptorTable { num_descriptors, .. }) => {
                    offset < num_descriptors
                }
                (BindingSlot::RootView { kind, .. }, RootParameterLayout::View(expected)) => kind == expected,
                (BindingSlot::Constants { .. }, RootParameterLayout::Constants { .. }) => true,
                _ => false,
            };
            anyhow::ensure!(matched, "参数 '{}' 的绑定 {:?} 与 root 参数 {:?} 不匹配", name, slot, parameter);
        }
        Ok(())
    }
}

pub struct PipelineState<D: RenderDevice> {
    native: D::PipelineState,
    desc: PipelineStateDesc,
    root_signature: Arc<RootSignature<D>>,
    bindings: ShaderBindings,
}

impl<D: RenderDevice> PipelineState<D> {
    pub fn new(
        device: &D,
        desc: PipelineStateDesc,
        root_signature: Arc<RootSignature<D>>,
        bindings: ShaderBindings,
    ) -> anyhow::Result<Self> {
        bindings
            .validate(root_signature.layout())
            .with_context(|| format!("pipeline '{}' 的 shader 绑定无效", desc.name))?;
        let native = device
            .create_pipeline_state(&desc, root_signature.native())
            .with_context(|| format!("无法创建 pipeline '{}'", desc.name))?;
        Ok(Self {
            native,
            desc,
            root_signature,
            bindings,
        })
    }

    #[inline]
    pub fn native(&self) -> &D::PipelineState {
        &self.native
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.desc.name
    }

    #[inline]
    pub fn kind(&self) -> PipelineKind {
        self.desc.kind
    }

    #[inline]
    pub fn bind_point(&self) -> BindPoint {
        match self.desc.kind {
            PipelineKind::Graphics => BindPoint::Graphics,
            PipelineKind::Compute => BindPoint::Compute,
        }
    }

    #[inline]
    pub fn root_signature(&self) -> &Arc<RootSignature<D>> {
        &self.root_signature
    }

    #[inline]
    pub fn binding(&self, name: &str) -> Option<BindingSlot> {
        self.bindings.get(name)
    }
}

#[cfg(test)]
mod tests {
    use cinder_rhi::{
        headless::HeadlessDevice,
        root_signature::{DescriptorRange, DescriptorRangeType},
    };

    use super::*;

    fn sample_desc() -> RootSignatureDesc {
        RootSignatureDesc::new(vec![
            RootParameter::constants(4, 0),
            RootParameter::table(vec![
                DescriptorRange::new(DescriptorRangeType::Srv, 2, 0),
                DescriptorRange::new(DescriptorRangeType::Uav, 1, 0),
            ]),
            RootParameter::view(RootViewKind::Cbv, 1),
            RootParameter::table(vec![DescriptorRange::new(DescriptorRangeType::Sampler, 1, 0)]),
        ])
    }

    #[test]
    fn test_parse_layout() {
        let layout = RootSignatureLayout::parse(&sample_desc()).unwrap();
        assert_eq!(layout.num_parameters(), 4);
        assert_eq!(layout.descriptor_table_bitmask(DescriptorHeapType::CbvSrvUav), 0b0010);
        assert_eq!(layout.descriptor_table_bitmask(DescriptorHeapType::Sampler), 0b1000);
        assert_eq!(layout.descriptor_table_bitmask(DescriptorHeapType::Rtv), 0);
        assert_eq!(layout.num_descriptors(1), 3);
        assert_eq!(layout.num_descriptors(0), 0);
        assert_eq!(layout.parameter(2), Some(&RootParameterLayout::View(RootViewKind::Cbv)));
    }

    #[test]
    fn test_mixed_table_rejected() {
        let desc = RootSignatureDesc::new(vec![RootParameter::table(vec![
            DescriptorRange::new(DescriptorRangeType::Srv, 1, 0),
            DescriptorRange::new(DescriptorRangeType::Sampler, 1, 0),
        ])]);
        assert!(RootSignatureLayout::parse(&desc).is_err());

        let empty = RootSignatureDesc::new(vec![RootParameter::table(vec![])]);
        assert!(RootSignatureLayout::parse(&empty).is_err());
    }

    #[test]
    fn test_too_many_parameters_rejected() {
        let desc = RootSignatureDesc::new((0..33).map(|i| RootParameter::constants(1, i)).collect());
        assert!(RootSignatureLayout::parse(&desc).is_err());
    }

    #[test]
    fn test_cache_returns_same_instance() {
        let cache = RootSignatureCache::new(Arc::new(HeadlessDevice::new()));
        let a = cache.get_or_create(&sample_desc()).unwrap();
        let b = cache.get_or_create(&sample_desc()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        let other = cache.get_or_create(&RootSignatureDesc::new(vec![RootParameter::constants(1, 0)])).unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_bindings_validated_against_root_signature() {
        let device = HeadlessDevice::new();
        let root_signature = Arc::new(RootSignature::new(&device, &sample_desc()).unwrap());

        let bindings = ShaderBindings::new()
            .with("params", BindingSlot::Constants { root_index: 0 })
            .with("input", BindingSlot::Table { root_index: 1, offset: 0 })
            .with("output", BindingSlot::Table { root_index: 1, offset: 2 })
            .with("frame", BindingSlot::RootView { kind: RootViewKind::Cbv, root_index: 2 });
        let pipeline = PipelineState::new(
            &device,
            PipelineStateDesc::compute("blur"),
            root_signature.clone(),
            bindings,
        )
        .unwrap();
        assert_eq!(pipeline.binding("output"), Some(BindingSlot::Table { root_index: 1, offset: 2 }));
        assert_eq!(pipeline.binding("missing"), None);
        assert_eq!(pipeline.bind_point(), BindPoint::Compute);

        // table 偏移越界
        let bad = ShaderBindings::new().with("input", BindingSlot::Table { root_index: 1, offset: 3 });
        assert!(PipelineState::new(&device, PipelineStateDesc::compute("bad"), root_signature.clone(), bad).is_err());

        // root view 类型不一致
        let bad = ShaderBindings::new().with("frame", BindingSlot::RootView { kind: RootViewKind::Srv, root_index: 2 });
        assert!(PipelineState::new(&device, PipelineStateDesc::compute("bad"), root_signature, bad).is_err());
    }
}
