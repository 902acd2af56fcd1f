use crate::descriptor::DescriptorHeapType;

/// root signature 最多能够包含的参数个数，和 32 bit 的掩码对应
pub const MAX_ROOT_PARAMETERS: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorRangeType {
    Srv,
    Uav,
    Cbv,
    Sampler,
}

impl DescriptorRangeType {
    #[inline]
    pub fn heap_type(self) -> DescriptorHeapType {
        match self {
            Self::Sampler => DescriptorHeapType::Sampler,
            _ => DescriptorHeapType::CbvSrvUav,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorRange {
    pub range_type: DescriptorRangeType,
    pub num_descriptors: u32,
    pub base_register: u32,
    pub register_space: u32,
}

impl DescriptorRange {
    pub fn new(range_type: DescriptorRangeType, num_descriptors: u32, base_register: u32) -> Self {
        Self {
            range_type,
            num_descriptors,
            base_register,
            register_space: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ShaderVisibility {
    #[default]
    All,
    Vertex,
    Pixel,
}

/// root view 的类别：直接以 GPU 地址绑定的 CBV / SRV / UAV
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RootViewKind {
    Cbv,
    Srv,
    Uav,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RootParameter {
    DescriptorTable {
        ranges: Vec<DescriptorRange>,
        visibility: ShaderVisibility,
    },
    Constants {
        num_32bit_values: u32,
        register: u32,
        register_space: u32,
        visibility: ShaderVisibility,
    },
    View {
        kind: RootViewKind,
        register: u32,
        register_space: u32,
        visibility: ShaderVisibility,
    },
}

impl RootParameter {
    pub fn table(ranges: Vec<DescriptorRange>) -> Self {
        Self::DescriptorTable {
            ranges,
            visibility: ShaderVisibility::All,
        }
    }

    pub fn constants(num_32bit_values: u32, register: u32) -> Self {
        Self::Constants {
            num_32bit_values,
            register,
            register_space: 0,
            visibility: ShaderVisibility::All,
        }
    }

    pub fn view(kind: RootViewKind, register: u32) -> Self {
        Self::View {
            kind,
            register,
            register_space: 0,
            visibility: ShaderVisibility::All,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RootSignatureDesc {
    pub parameters: Vec<RootParameter>,
    pub static_samplers: u32,
}

impl RootSignatureDesc {
    pub fn new(parameters: Vec<RootParameter>) -> Self {
        Self {
            parameters,
            static_samplers: 0,
        }
    }
}

/// root 参数的绑定点
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindPoint {
    Graphics,
    Compute,
}
