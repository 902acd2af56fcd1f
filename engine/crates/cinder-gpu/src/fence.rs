use std::fmt;

use cinder_rhi::queue_type::QueueType;

/// 带有队列标签的 fence 值
///
/// 高 8 位为队列类型，低 56 位为该队列上单调递增的计数。
/// 计数 0 表示"什么都没有提交"，从一开始就处于完成状态。
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FenceValue(u64);

impl FenceValue {
    const QUEUE_SHIFT: u32 = 56;
    const COUNTER_MASK: u64 = (1 << Self::QUEUE_SHIFT) - 1;

    #[inline]
    pub const fn new(queue_type: QueueType, counter: u64) -> Self {
        debug_assert!(counter <= Self::COUNTER_MASK);
        Self(((queue_type as u64) << Self::QUEUE_SHIFT) | counter)
    }

    /// 队列上最初的 fence 值
    #[inline]
    pub const fn initial(queue_type: QueueType) -> Self {
        Self::new(queue_type, 0)
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn counter(self) -> u64 {
        self.0 & Self::COUNTER_MASK
    }

    /// # Panics
    /// 标签不是合法的队列类型时 panic
    pub fn queue_type(self) -> QueueType {
        let index = (self.0 >> Self::QUEUE_SHIFT) as usize;
        QueueType::from_index(index).unwrap_or_else(|| panic!("fence 值 {:#x} 的队列标签非法", self.0))
    }
}

impl fmt::Debug for FenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FenceValue({}:{})", self.queue_type(), self.counter())
    }
}
