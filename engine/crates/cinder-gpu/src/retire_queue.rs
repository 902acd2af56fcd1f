use std::collections::VecDeque;

/// 延迟回收队列
///
/// 对象在被 GPU 使用完之前不能复用或释放。每个条目带有一个 key（fence 值、帧号等），
/// 由调用者判断 key 对应的工作是否完成。
///
/// command list 池、shader visible heap 池、线性分配 page、CPU descriptor 的过期块、
/// 上下文池以及资源的延迟销毁都使用这一个结构。
pub struct RetireQueue<K, T> {
    entries: VecDeque<(K, T)>,
}

impl<K, T> Default for RetireQueue<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> RetireQueue<K, T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    #[inline]
    pub fn push(&mut self, key: K, item: T) {
        self.entries.push_back((key, item));
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 取出最早入队的一个已就绪条目
    pub fn pop_ready(&mut self, mut is_ready: impl FnMut(&K) -> bool) -> Option<T> {
        let index = self.entries.iter().position(|(key, _)| is_ready(key))?;
        self.entries.remove(index).map(|(_, item)| item)
    }

    /// 取出所有已就绪的条目，保持入队顺序
    ///
    /// 来自不同队列的 key 之间没有先后关系，因此会检查所有条目而不只是队首
    pub fn drain_ready(&mut self, mut is_ready: impl FnMut(&K) -> bool) -> Vec<T> {
        let (ready, pending): (VecDeque<_>, VecDeque<_>) =
            std::mem::take(&mut self.entries).into_iter().partition(|(key, _)| is_ready(key));
        self.entries = pending;
        ready.into_iter().map(|(_, item)| item).collect()
    }

    /// 不论是否就绪，取出全部条目；用于 GPU 空闲之后的清理
    pub fn drain_all(&mut self) -> Vec<T> {
        self.entries.drain(..).map(|(_, item)| item).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_ready_keeps_order() {
        let mut queue = RetireQueue::new();
        queue.push(3, "c");
        queue.push(1, "a");
        queue.push(5, "e");
        queue.push(2, "b");

        let completed = 3;
        assert_eq!(queue.drain_ready(|key| *key <= completed), vec!["c", "a", "b"]);
        assert_eq!(queue.len(), 1);
        assert!(queue.drain_ready(|key| *key <= completed).is_empty());
    }

    #[test]
    fn test_pop_ready() {
        let mut queue = RetireQueue::new();
        queue.push(10, 'x');
        queue.push(1, 'y');

        // 队首未完成时，后面已完成的条目也能被取出
        assert_eq!(queue.pop_ready(|key| *key < 5), Some('y'));
        assert_eq!(queue.pop_ready(|key| *key < 5), None);
        assert_eq!(queue.drain_all(), vec!['x']);
        assert!(queue.is_empty());
    }
}
