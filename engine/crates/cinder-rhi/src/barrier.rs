use crate::{queue_type::QueueType, resource_state::ResourceStates};

/// 原生资源的唯一标识，由 device 分配
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

/// 资源的子资源选择
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Subresource {
    /// 资源的所有子资源
    All,
    /// 某一个子资源（mip + array slice 展开后的索引）
    Index(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceBarrier {
    Transition {
        resource: ResourceId,
        subresource: Subresource,
        before: ResourceStates,
        after: ResourceStates,
    },
    /// `resource` 为 None 表示针对所有 UAV 访问
    Uav { resource: Option<ResourceId> },
    Aliasing {
        before: Option<ResourceId>,
        after: Option<ResourceId>,
    },
}

impl ResourceBarrier {
    #[inline]
    pub fn transition(
        resource: ResourceId,
        subresource: Subresource,
        before: ResourceStates,
        after: ResourceStates,
    ) -> Self {
        Self::Transition {
            resource,
            subresource,
            before,
            after,
        }
    }

    #[inline]
    pub fn uav(resource: Option<ResourceId>) -> Self {
        Self::Uav { resource }
    }

    #[inline]
    pub fn aliasing(before: Option<ResourceId>, after: Option<ResourceId>) -> Self {
        Self::Aliasing { before, after }
    }

    /// barrier 能否被 `queue_type` 类型的 command list 执行
    pub fn is_legal_on(&self, queue_type: QueueType) -> bool {
        match self {
            Self::Transition { before, after, .. } => before.is_legal_on(queue_type) && after.is_legal_on(queue_type),
            Self::Uav { .. } => queue_type != QueueType::Copy,
            Self::Aliasing { .. } => true,
        }
    }
}
