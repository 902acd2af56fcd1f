use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use cinder_rhi::{
    device::{NativeQueue, RenderDevice},
    queue_type::QueueType,
};

use crate::{
    command_list::{CommandList, CommandListPool},
    fence::FenceValue,
};

/// 在限定时间内 fence 没有完成
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FenceTimeout {
    pub fence: FenceValue,
    pub timeout: Duration,
}

impl fmt::Display for FenceTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "等待 {:?} 超时 ({:?})", self.fence, self.timeout)
    }
}

impl std::error::Error for FenceTimeout {}

/// 硬件队列 + 单调递增的 fence
pub struct CommandQueue<D: RenderDevice> {
    queue_type: QueueType,
    native: D::Queue,

    /// 下一个要 signal 的计数；持有该锁期间完成 execute + signal
    next_fence_counter: Mutex<u64>,
    /// 已知完成的最大 fence 值（raw），只增不减
    last_completed_fence: AtomicU64,

    command_list_pool: CommandListPool<D>,
}

// new & init
impl<D: RenderDevice> CommandQueue<D> {
    pub fn new(device: &Arc<D>, queue_type: QueueType) -> anyhow::Result<Self> {
        let native = device.create_queue(queue_type)?;
        Ok(Self {
            queue_type,
            native,
            next_fence_counter: Mutex::new(1),
            last_completed_fence: AtomicU64::new(FenceValue::initial(queue_type).raw()),
            command_list_pool: CommandListPool::new(device.clone(), queue_type),
        })
    }
}

// getters
impl<D: RenderDevice> CommandQueue<D> {
    #[inline]
    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    #[inline]
    pub fn native(&self) -> &D::Queue {
        &self.native
    }

    #[inline]
    pub fn command_list_pool(&self) -> &CommandListPool<D> {
        &self.command_list_pool
    }

    /// 最近一次 signal 的 fence 值
    pub fn last_signaled_fence(&self) -> FenceValue {
        FenceValue::new(self.queue_type, *self.next_fence_counter.lock().unwrap() - 1)
    }

    /// 下一次 signal 将使用的 fence 值
    pub fn next_fence(&self) -> FenceValue {
        FenceValue::new(self.queue_type, *self.next_fence_counter.lock().unwrap())
    }

    pub fn last_completed_fence(&self) -> FenceValue {
        FenceValue::from_raw(self.last_completed_fence.load(Ordering::Acquire))
    }
}

// submit
impl<D: RenderDevice> CommandQueue<D> {
    /// 关闭并提交 command lists，随后 signal 新的 fence
    pub fn execute_command_lists(&self, command_lists: &mut [&mut CommandList<D>]) -> FenceValue {
        let _span = cinder_crate_tools::profile_span!("CommandQueue::execute_command_lists");

        for command_list in command_lists.iter_mut() {
            debug_assert_eq!(command_list.queue_type(), self.queue_type, "command list 提交到了错误的队列");
            if !command_list.is_closed() {
                command_list.close();
            }
        }
        let natives = command_lists.iter().map(|command_list| command_list.native()).collect::<Vec<_>>();

        let mut next_fence_counter = self.next_fence_counter.lock().unwrap();
        self.native.execute_command_lists(&natives);
        self.signal_locked(&mut next_fence_counter)
    }

    /// 不提交任何工作，直接 signal
    pub fn signal(&self) -> FenceValue {
        let mut next_fence_counter = self.next_fence_counter.lock().unwrap();
        self.signal_locked(&mut next_fence_counter)
    }

    fn signal_locked(&self, next_fence_counter: &mut u64) -> FenceValue {
        let fence = FenceValue::new(self.queue_type, *next_fence_counter);
        self.native.signal(fence.raw());
        *next_fence_counter += 1;
        fence
    }

    pub fn request_command_list(&self) -> CommandList<D> {
        self.command_list_pool.request_command_list(|fence| self.is_fence_completed(fence))
    }

    pub fn retire_command_list(&self, fence: FenceValue, command_list: CommandList<D>) {
        self.command_list_pool.retire_command_list(fence, command_list);
    }
}

// fence
impl<D: RenderDevice> CommandQueue<D> {
    /// 先查缓存，缓存不足时才查询原生 fence
    pub fn is_fence_completed(&self, fence: FenceValue) -> bool {
        debug_assert_eq!(fence.queue_type(), self.queue_type, "{:?} 不属于 {} 队列", fence, self.queue_type);

        if fence.raw() > self.last_completed_fence.load(Ordering::Acquire) {
            self.last_completed_fence.fetch_max(self.native.completed_value(), Ordering::AcqRel);
        }
        fence.raw() <= self.last_completed_fence.load(Ordering::Acquire)
    }

    /// 阻塞等待 fence 完成
    pub fn wait_for_fence(&self, fence: FenceValue) {
        if self.is_fence_completed(fence) {
            return;
        }

        let _span = cinder_crate_tools::profile_span!("CommandQueue::wait_for_fence");
        self.native.wait_for_value(fence.raw(), None);
        self.last_completed_fence.fetch_max(fence.raw(), Ordering::AcqRel);
    }

    /// 带超时的阻塞等待
    pub fn wait_for_fence_timeout(&self, fence: FenceValue, timeout: Duration) -> Result<(), FenceTimeout> {
        if self.is_fence_completed(fence) {
            return Ok(());
        }

        let _span = cinder_crate_tools::profile_span!("CommandQueue::wait_for_fence_timeout");
        if !self.native.wait_for_value(fence.raw(), Some(timeout)) {
            log::warn!("{} 队列等待 {:?} 超时", self.queue_type, fence);
            return Err(FenceTimeout { fence, timeout });
        }
        self.last_completed_fence.fetch_max(fence.raw(), Ordering::AcqRel);
        Ok(())
    }

    /// GPU 侧等待 `other` 队列上的某个 fence，不阻塞 CPU
    pub fn wait_for_fence_on_gpu(&self, other: &CommandQueue<D>, fence: FenceValue) {
        debug_assert_eq!(fence.queue_type(), other.queue_type);
        self.native.gpu_wait(&other.native, fence.raw());
    }

    /// GPU 侧等待 `other` 队列上最近一次提交
    pub fn wait_for_command_queue(&self, other: &CommandQueue<D>) {
        self.wait_for_fence_on_gpu(other, other.last_signaled_fence());
    }

    /// signal 并等待，返回时队列上所有已提交的工作都已完成
    pub fn flush(&self) -> FenceValue {
        let fence = self.signal();
        self.wait_for_fence(fence);
        fence
    }
}

/// 三条硬件队列
pub struct CommandQueueManager<D: RenderDevice> {
    queues: [CommandQueue<D>; QueueType::COUNT],
}

impl<D: RenderDevice> CommandQueueManager<D> {
    pub fn new(device: &Arc<D>) -> anyhow::Result<Self> {
        let [graphics, compute, copy] = QueueType::ALL.map(|queue_type| CommandQueue::new(device, queue_type));
        Ok(Self {
            queues: [graphics?, compute?, copy?],
        })
    }

    #[inline]
    pub fn queue(&self, queue_type: QueueType) -> &CommandQueue<D> {
        &self.queues[queue_type.index()]
    }

    #[inline]
    pub fn graphics(&self) -> &CommandQueue<D> {
        self.queue(QueueType::Graphics)
    }

    #[inline]
    pub fn compute(&self) -> &CommandQueue<D> {
        self.queue(QueueType::Compute)
    }

    #[inline]
    pub fn copy(&self) -> &CommandQueue<D> {
        self.queue(QueueType::Copy)
    }

    /// 按 fence 的队列标签路由
    pub fn is_fence_completed(&self, fence: FenceValue) -> bool {
        self.queue(fence.queue_type()).is_fence_completed(fence)
    }

    pub fn wait_for_fence(&self, fence: FenceValue) {
        self.queue(fence.queue_type()).wait_for_fence(fence);
    }

    pub fn wait_for_fence_timeout(&self, fence: FenceValue, timeout: Duration) -> Result<(), FenceTimeout> {
        self.queue(fence.queue_type()).wait_for_fence_timeout(fence, timeout)
    }

    /// 每条队列最近一次 signal 的 fence
    pub fn last_signaled_fences(&self) -> [FenceValue; QueueType::COUNT] {
        QueueType::ALL.map(|queue_type| self.queue(queue_type).last_signaled_fence())
    }

    pub fn are_fences_completed(&self, fences: &[FenceValue]) -> bool {
        fences.iter().all(|fence| self.is_fence_completed(*fence))
    }

    /// 等待所有队列空闲
    pub fn idle_gpu(&self) {
        let _span = cinder_crate_tools::profile_span!("CommandQueueManager::idle_gpu");
        for queue in &self.queues {
            queue.flush();
        }
    }
}
