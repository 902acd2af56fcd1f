/// 资源所在的内存堆
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// GPU 独占
    Default,
    /// CPU 写，GPU 读；持久映射
    Upload,
    /// GPU 写，CPU 读；持久映射
    Readback,
}

impl HeapKind {
    #[inline]
    pub fn is_cpu_visible(self) -> bool {
        !matches!(self, Self::Default)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    Unknown,
    Rgba8Unorm,
    Rgba16Float,
    R32Float,
    R32Uint,
    D32Float,
    D24UnormS8Uint,
}

impl Format {
    #[inline]
    pub fn is_depth(self) -> bool {
        matches!(self, Self::D32Float | Self::D24UnormS8Uint)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceDimension {
    Buffer {
        size: u64,
    },
    Texture2D {
        width: u32,
        height: u32,
        array_size: u16,
        mip_levels: u16,
        format: Format,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceDesc {
    pub dimension: ResourceDimension,
    pub heap: HeapKind,
    pub allow_unordered_access: bool,
    pub allow_render_target: bool,
    pub allow_depth_stencil: bool,
}

impl ResourceDesc {
    pub fn buffer(size: u64, heap: HeapKind) -> Self {
        Self {
            dimension: ResourceDimension::Buffer { size },
            heap,
            allow_unordered_access: false,
            allow_render_target: false,
            allow_depth_stencil: false,
        }
    }

    pub fn texture_2d(width: u32, height: u32, array_size: u16, mip_levels: u16, format: Format) -> Self {
        Self {
            dimension: ResourceDimension::Texture2D {
                width,
                height,
                array_size,
                mip_levels,
                format,
            },
            heap: HeapKind::Default,
            allow_unordered_access: false,
            allow_render_target: false,
            allow_depth_stencil: format.is_depth(),
        }
    }

    pub fn with_unordered_access(mut self) -> Self {
        self.allow_unordered_access = true;
        self
    }

    pub fn with_render_target(mut self) -> Self {
        self.allow_render_target = true;
        self
    }

    #[inline]
    pub fn is_buffer(&self) -> bool {
        matches!(self.dimension, ResourceDimension::Buffer { .. })
    }

    /// buffer 的字节大小；texture 返回 0
    pub fn buffer_size(&self) -> u64 {
        match self.dimension {
            ResourceDimension::Buffer { size } => size,
            ResourceDimension::Texture2D { .. } => 0,
        }
    }

    /// 子资源的数量：mip_levels * array_size，buffer 只有一个子资源
    pub fn subresource_count(&self) -> u32 {
        match self.dimension {
            ResourceDimension::Buffer { .. } => 1,
            ResourceDimension::Texture2D {
                array_size, mip_levels, ..
            } => array_size as u32 * mip_levels as u32,
        }
    }

    /// 计算子资源索引，和 D3D12CalcSubresource 一致（不考虑 plane）
    pub fn subresource_index(&self, mip_slice: u32, array_slice: u32) -> u32 {
        match self.dimension {
            ResourceDimension::Buffer { .. } => 0,
            ResourceDimension::Texture2D { mip_levels, .. } => mip_slice + array_slice * mip_levels as u32,
        }
    }
}
