use crate::barrier::ResourceId;

/// descriptor heap 的类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorHeapType {
    CbvSrvUav = 0,
    Sampler = 1,
    Rtv = 2,
    Dsv = 3,
}

impl DescriptorHeapType {
    pub const COUNT: usize = 4;
    pub const ALL: [DescriptorHeapType; Self::COUNT] = [Self::CbvSrvUav, Self::Sampler, Self::Rtv, Self::Dsv];

    /// 只有这两种类型的 heap 可以 shader visible
    pub const SHADER_VISIBLE: [DescriptorHeapType; 2] = [Self::CbvSrvUav, Self::Sampler];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn can_be_shader_visible(self) -> bool {
        matches!(self, Self::CbvSrvUav | Self::Sampler)
    }
}

/// CPU 可见的 descriptor 句柄（heap 内的地址）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuDescriptorHandle(pub usize);

impl CpuDescriptorHandle {
    pub const NULL: Self = Self(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn offset(self, count: u32, increment_size: u32) -> Self {
        Self(self.0 + count as usize * increment_size as usize)
    }
}

/// GPU 可见的 descriptor 句柄，只存在于 shader visible heap 中
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuDescriptorHandle(pub u64);

impl GpuDescriptorHandle {
    pub const NULL: Self = Self(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn offset(self, count: u32, increment_size: u32) -> Self {
        Self(self.0 + count as u64 * increment_size as u64)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorHeapDesc {
    pub heap_type: DescriptorHeapType,
    pub num_descriptors: u32,
    pub shader_visible: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Filter {
    Point,
    Linear,
    Anisotropic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Wrap,
    Mirror,
    Clamp,
    Border,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub filter: Filter,
    pub address_mode: AddressMode,
    pub max_anisotropy: u32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: Filter::Linear,
            address_mode: AddressMode::Wrap,
            max_anisotropy: 1,
        }
    }
}

/// 写入 descriptor 的 view 描述
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ViewDesc {
    ConstantBuffer {
        buffer_location: u64,
        size_in_bytes: u32,
    },
    ShaderResource {
        resource: ResourceId,
    },
    UnorderedAccess {
        resource: ResourceId,
    },
    RenderTarget {
        resource: ResourceId,
        mip_slice: u32,
    },
    DepthStencil {
        resource: ResourceId,
        read_only: bool,
    },
    Sampler(SamplerDesc),
}

impl ViewDesc {
    /// view 需要写入哪一种 heap
    pub fn heap_type(&self) -> DescriptorHeapType {
        match self {
            Self::ConstantBuffer { .. } | Self::ShaderResource { .. } | Self::UnorderedAccess { .. } => {
                DescriptorHeapType::CbvSrvUav
            }
            Self::RenderTarget { .. } => DescriptorHeapType::Rtv,
            Self::DepthStencil { .. } => DescriptorHeapType::Dsv,
            Self::Sampler(_) => DescriptorHeapType::Sampler,
        }
    }
}
