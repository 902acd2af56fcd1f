use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use cinder_rhi::{
    device::{NativeCommandList, RenderDevice},
    queue_type::QueueType,
};

use crate::{fence::FenceValue, retire_queue::RetireQueue};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CommandListState {
    Recording,
    Closed,
}

/// 原生 command list 的封装，附带队列类型和录制状态
pub struct CommandList<D: RenderDevice> {
    native: D::CommandList,
    queue_type: QueueType,
    id: usize,
    state: CommandListState,
}

// new & init
impl<D: RenderDevice> CommandList<D> {
    fn new(device: &D, queue_type: QueueType, id: usize) -> anyhow::Result<Self> {
        let native = device.create_command_list(queue_type, &format!("{}-command-list-{}", queue_type, id))?;
        Ok(Self {
            native,
            queue_type,
            id,
            state: CommandListState::Recording,
        })
    }
}

// getters
impl<D: RenderDevice> CommandList<D> {
    #[inline]
    pub fn native(&self) -> &D::CommandList {
        &self.native
    }

    #[inline]
    pub fn native_mut(&mut self) -> &mut D::CommandList {
        &mut self.native
    }

    #[inline]
    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state == CommandListState::Closed
    }
}

// tools
impl<D: RenderDevice> CommandList<D> {
    /// 重置为录制状态，只能在 GPU 完成之后调用
    pub fn reset(&mut self) {
        self.native.reset();
        self.state = CommandListState::Recording;
    }

    /// # Panics
    /// 重复关闭时 panic
    pub fn close(&mut self) {
        assert!(
            self.state == CommandListState::Recording,
            "command list {}-{} 被重复关闭",
            self.queue_type,
            self.id
        );
        self.native.close();
        self.state = CommandListState::Closed;
    }
}

struct PoolInner<D: RenderDevice> {
    available: VecDeque<CommandList<D>>,
    retired: RetireQueue<FenceValue, CommandList<D>>,
    created: usize,
}

/// 每条队列一个 command list 池
///
/// 提交之后的 command list 以提交的 fence 为 key 退休，fence 完成后才会被复用
pub struct CommandListPool<D: RenderDevice> {
    device: Arc<D>,
    queue_type: QueueType,
    inner: Mutex<PoolInner<D>>,
}

impl<D: RenderDevice> CommandListPool<D> {
    pub fn new(device: Arc<D>, queue_type: QueueType) -> Self {
        Self {
            device,
            queue_type,
            inner: Mutex::new(PoolInner {
                available: VecDeque::new(),
                retired: RetireQueue::new(),
                created: 0,
            }),
        }
    }

    /// 获取一个处于录制状态的 command list
    ///
    /// # Panics
    /// 原生 command list 创建失败时 panic
    pub fn request_command_list(&self, is_fence_completed: impl Fn(FenceValue) -> bool) -> CommandList<D> {
        let _span = cinder_crate_tools::profile_span!("CommandListPool::request_command_list");
        let mut inner = self.inner.lock().unwrap();

        let completed = inner.retired.drain_ready(|fence| is_fence_completed(*fence));
        inner.available.extend(completed);

        if let Some(mut command_list) = inner.available.pop_front() {
            command_list.reset();
            return command_list;
        }

        let id = inner.created;
        inner.created += 1;
        log::trace!("create {} command list #{}", self.queue_type, id);
        CommandList::new(&*self.device, self.queue_type, id)
            .unwrap_or_else(|e| panic!("创建 {} command list 失败: {e:?}", self.queue_type))
    }

    /// 提交之后归还 command list，`fence` 完成之前不会被复用
    pub fn retire_command_list(&self, fence: FenceValue, command_list: CommandList<D>) {
        debug_assert_eq!(command_list.queue_type(), self.queue_type);
        self.inner.lock().unwrap().retired.push(fence, command_list);
    }

    pub fn created_count(&self) -> usize {
        self.inner.lock().unwrap().created
    }

    pub fn available_count(&self) -> usize {
        self.inner.lock().unwrap().available.len()
    }

    pub fn retired_count(&self) -> usize {
        self.inner.lock().unwrap().retired.len()
    }
}
