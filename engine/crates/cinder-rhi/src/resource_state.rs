use crate::queue_type::QueueType;

bitflags::bitflags! {
    /// 资源状态，取值与 D3D12_RESOURCE_STATES 保持一致
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ResourceStates: u32 {
        const COMMON = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 0x1;
        const INDEX_BUFFER = 0x2;
        const RENDER_TARGET = 0x4;
        const UNORDERED_ACCESS = 0x8;
        const DEPTH_WRITE = 0x10;
        const DEPTH_READ = 0x20;
        const NON_PIXEL_SHADER_RESOURCE = 0x40;
        const PIXEL_SHADER_RESOURCE = 0x80;
        const STREAM_OUT = 0x100;
        const INDIRECT_ARGUMENT = 0x200;
        const COPY_DEST = 0x400;
        const COPY_SOURCE = 0x800;
        const RESOLVE_DEST = 0x1000;
        const RESOLVE_SOURCE = 0x2000;
        const GENERIC_READ = Self::VERTEX_AND_CONSTANT_BUFFER.bits()
            | Self::INDEX_BUFFER.bits()
            | Self::NON_PIXEL_SHADER_RESOURCE.bits()
            | Self::PIXEL_SHADER_RESOURCE.bits()
            | Self::INDIRECT_ARGUMENT.bits()
            | Self::COPY_SOURCE.bits();
        const PRESENT = 0;
    }
}

impl ResourceStates {
    /// compute queue 上合法的状态
    pub const COMPUTE_QUEUE_STATES: Self = Self::VERTEX_AND_CONSTANT_BUFFER
        .union(Self::UNORDERED_ACCESS)
        .union(Self::NON_PIXEL_SHADER_RESOURCE)
        .union(Self::INDIRECT_ARGUMENT)
        .union(Self::COPY_DEST)
        .union(Self::COPY_SOURCE);

    /// copy queue 上合法的状态
    pub const COPY_QUEUE_STATES: Self = Self::COPY_DEST.union(Self::COPY_SOURCE);

    /// 该状态能否出现在 `queue_type` 类型的 command list 的 barrier 中
    pub fn is_legal_on(self, queue_type: QueueType) -> bool {
        match queue_type {
            QueueType::Graphics => true,
            QueueType::Compute => Self::COMPUTE_QUEUE_STATES.contains(self),
            QueueType::Copy => Self::COPY_QUEUE_STATES.contains(self),
        }
    }

    /// 只有 graphics queue 才能进行的状态转换：render target / depth / pixel shader resource 等
    #[inline]
    pub fn requires_graphics_queue(self) -> bool {
        !self.is_legal_on(QueueType::Compute)
    }

    /// 是否包含写入语义
    pub fn is_write(self) -> bool {
        self.intersects(
            Self::RENDER_TARGET
                | Self::UNORDERED_ACCESS
                | Self::DEPTH_WRITE
                | Self::STREAM_OUT
                | Self::COPY_DEST
                | Self::RESOLVE_DEST,
        )
    }
}
