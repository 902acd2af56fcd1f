use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use crate::{
    device::{NativeCommandList, NativeQueue},
    headless::{HeadlessDevice, command_list::HeadlessCommandList, command_list::RecordedCommand},
    queue_type::QueueType,
};

/// 一个 command list 在模拟 GPU 上执行时的记录
#[derive(Clone, Debug)]
pub struct RecordedCommandList {
    pub name: String,
    pub commands: Vec<RecordedCommand>,
}

/// 一次 `execute_command_lists` 提交
#[derive(Clone, Debug)]
pub struct ExecutedBatch {
    pub queue_type: QueueType,
    pub command_lists: Vec<RecordedCommandList>,
}

enum QueueOp {
    Execute(ExecutedBatch),
    Signal(u64),
    Wait { queue: QueueType, value: u64 },
}

#[derive(Default)]
struct QueueTimeline {
    completed: u64,
    ops: VecDeque<QueueOp>,
}

#[derive(Default)]
struct TimelineState {
    queues: [QueueTimeline; QueueType::COUNT],
    executed: Vec<ExecutedBatch>,
}

impl TimelineState {
    /// 推进 `queue` 直到其 completed 值达到 `target`；`target` 为 None 时尽可能推进
    ///
    /// 返回是否执行了任何操作
    fn run(&mut self, queue: QueueType, target: Option<u64>, visiting: &mut [bool; QueueType::COUNT]) -> bool {
        // 队列之间的相互等待会形成环，此时无法继续推进
        if visiting[queue.index()] {
            return false;
        }
        visiting[queue.index()] = true;

        let mut progressed = false;
        while target.is_none_or(|target| self.queues[queue.index()].completed < target) {
            if !self.step(queue, visiting) {
                break;
            }
            progressed = true;
        }

        visiting[queue.index()] = false;
        progressed
    }

    fn step(&mut self, queue: QueueType, visiting: &mut [bool; QueueType::COUNT]) -> bool {
        let pending_wait = match self.queues[queue.index()].ops.front() {
            None => return false,
            Some(QueueOp::Wait { queue, value }) => Some((*queue, *value)),
            Some(_) => None,
        };

        // GPU 侧等待：先推进被等待的队列
        if let Some((other, value)) = pending_wait {
            if self.queues[other.index()].completed < value {
                self.run(other, Some(value), visiting);
            }
            if self.queues[other.index()].completed < value {
                return false;
            }
        }

        let Some(op) = self.queues[queue.index()].ops.pop_front() else {
            return false;
        };
        match op {
            QueueOp::Execute(batch) => self.executed.push(batch),
            QueueOp::Signal(value) => {
                let timeline = &mut self.queues[queue.index()];
                timeline.completed = timeline.completed.max(value);
            }
            QueueOp::Wait { .. } => {}
        }
        true
    }
}

/// 所有队列共享的模拟 GPU 时间线
///
/// 提交的工作不会自动执行，只有在 CPU 等待或者显式推进时才会被"执行"，
/// 因此 fence 在 signal 之后、等待之前一定处于未完成状态。
#[derive(Default)]
pub(crate) struct GpuTimeline {
    state: Mutex<TimelineState>,
    progress: Condvar,
}

impl GpuTimeline {
    fn push(&self, queue: QueueType, op: QueueOp) {
        let mut state = self.state.lock().unwrap();
        state.queues[queue.index()].ops.push_back(op);
        self.progress.notify_all();
    }

    fn completed_value(&self, queue: QueueType) -> u64 {
        self.state.lock().unwrap().queues[queue.index()].completed
    }

    fn wait_for_value(&self, queue: QueueType, value: u64, timeout: Option<Duration>) -> bool {
        let _span = cinder_crate_tools::profile_span!("GpuTimeline::wait_for_value");
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock().unwrap();
        loop {
            let progressed = state.run(queue, Some(value), &mut [false; QueueType::COUNT]);
            if progressed {
                self.progress.notify_all();
            }
            if state.queues[queue.index()].completed >= value {
                return true;
            }

            // 等待其他线程提交新的工作
            match deadline {
                None => state = self.progress.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    state = self.progress.wait_timeout(state, deadline - now).unwrap().0;
                }
            }
        }
    }

    pub(crate) fn advance_all(&self) {
        let _span = cinder_crate_tools::profile_span!("GpuTimeline::advance_all");
        let mut state = self.state.lock().unwrap();
        loop {
            let mut progressed = false;
            for queue in QueueType::ALL {
                progressed |= state.run(queue, None, &mut [false; QueueType::COUNT]);
            }
            if !progressed {
                break;
            }
        }
        self.progress.notify_all();
    }

    pub(crate) fn executed_batches(&self) -> Vec<ExecutedBatch> {
        self.state.lock().unwrap().executed.clone()
    }

    pub(crate) fn take_executed_batches(&self) -> Vec<ExecutedBatch> {
        std::mem::take(&mut self.state.lock().unwrap().executed)
    }

    /// 尚未执行的队列操作数量
    #[cfg(test)]
    pub(crate) fn pending_op_count(&self, queue: QueueType) -> usize {
        self.state.lock().unwrap().queues[queue.index()].ops.len()
    }
}

pub struct HeadlessQueue {
    queue_type: QueueType,
    timeline: Arc<GpuTimeline>,
}

impl HeadlessQueue {
    pub(crate) fn new(queue_type: QueueType, timeline: Arc<GpuTimeline>) -> Self {
        Self { queue_type, timeline }
    }
}

impl NativeQueue<HeadlessDevice> for HeadlessQueue {
    fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    fn execute_command_lists(&self, command_lists: &[&HeadlessCommandList]) {
        let _span = cinder_crate_tools::profile_span!("HeadlessQueue::execute_command_lists");
        let command_lists = command_lists
            .iter()
            .map(|command_list| {
                assert!(command_list.is_closed(), "提交了未关闭的 command list: {}", command_list.name());
                assert_eq!(
                    command_list.queue_type(),
                    self.queue_type,
                    "command list {} 的类型与队列不匹配",
                    command_list.name()
                );
                command_list.snapshot()
            })
            .collect();

        self.timeline.push(
            self.queue_type,
            QueueOp::Execute(ExecutedBatch {
                queue_type: self.queue_type,
                command_lists,
            }),
        );
    }

    fn signal(&self, value: u64) {
        self.timeline.push(self.queue_type, QueueOp::Signal(value));
    }

    fn completed_value(&self) -> u64 {
        self.timeline.completed_value(self.queue_type)
    }

    fn wait_for_value(&self, value: u64, timeout: Option<Duration>) -> bool {
        self.timeline.wait_for_value(self.queue_type, value, timeout)
    }

    fn gpu_wait(&self, other: &HeadlessQueue, value: u64) {
        self.timeline.push(
            self.queue_type,
            QueueOp::Wait {
                queue: other.queue_type,
                value,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_batch(queue_type: QueueType) -> QueueOp {
        QueueOp::Execute(ExecutedBatch {
            queue_type,
            command_lists: vec![],
        })
    }

    #[test]
    fn test_signal_completes_only_after_wait() {
        let timeline = GpuTimeline::default();
        timeline.push(QueueType::Graphics, empty_batch(QueueType::Graphics));
        timeline.push(QueueType::Graphics, QueueOp::Signal(3));

        // 还没有被执行
        assert_eq!(timeline.completed_value(QueueType::Graphics), 0);
        assert!(timeline.wait_for_value(QueueType::Graphics, 3, None));
        assert_eq!(timeline.completed_value(QueueType::Graphics), 3);
        assert_eq!(timeline.executed_batches().len(), 1);
    }

    #[test]
    fn test_cross_queue_wait_drives_other_queue() {
        let timeline = GpuTimeline::default();
        timeline.push(QueueType::Graphics, empty_batch(QueueType::Graphics));
        timeline.push(QueueType::Graphics, QueueOp::Signal(5));
        timeline.push(
            QueueType::Compute,
            QueueOp::Wait {
                queue: QueueType::Graphics,
                value: 5,
            },
        );
        timeline.push(QueueType::Compute, empty_batch(QueueType::Compute));
        timeline.push(QueueType::Compute, QueueOp::Signal(1));

        assert!(timeline.wait_for_value(QueueType::Compute, 1, None));

        // graphics 的工作一定先于 compute 执行
        let executed = timeline.executed_batches();
        assert_eq!(executed.len(), 2);
        assert_eq!(executed[0].queue_type, QueueType::Graphics);
        assert_eq!(executed[1].queue_type, QueueType::Compute);
    }

    #[test]
    fn test_wait_timeout_on_unsignaled_value() {
        let timeline = GpuTimeline::default();
        timeline.push(QueueType::Copy, QueueOp::Signal(1));
        assert!(!timeline.wait_for_value(QueueType::Copy, 2, Some(Duration::from_millis(10))));
        assert_eq!(timeline.completed_value(QueueType::Copy), 1);
    }

    #[test]
    fn test_cyclic_wait_does_not_recurse_forever() {
        let timeline = GpuTimeline::default();
        timeline.push(
            QueueType::Graphics,
            QueueOp::Wait {
                queue: QueueType::Compute,
                value: 1,
            },
        );
        timeline.push(
            QueueType::Compute,
            QueueOp::Wait {
                queue: QueueType::Graphics,
                value: 1,
            },
        );
        timeline.advance_all();
        assert_eq!(timeline.pending_op_count(QueueType::Graphics), 1);
        assert_eq!(timeline.pending_op_count(QueueType::Compute), 1);
    }

    #[test]
    fn test_queue_submission_stays_pending_until_waited() {
        let timeline = Arc::new(GpuTimeline::default());
        let queue = HeadlessQueue::new(QueueType::Compute, timeline.clone());

        let mut command_list = HeadlessCommandList::new(QueueType::Compute, "compute-0");
        command_list.dispatch(1, 1, 1);
        command_list.close();
        queue.execute_command_lists(&[&command_list]);
        queue.signal(1);

        // 提交之后只是排队
        assert_eq!(timeline.pending_op_count(QueueType::Compute), 2);
        assert_eq!(queue.completed_value(), 0);
        assert!(timeline.executed_batches().is_empty());

        assert!(queue.wait_for_value(1, None));
        assert_eq!(timeline.pending_op_count(QueueType::Compute), 0);
        assert_eq!(queue.completed_value(), 1);
        assert_eq!(timeline.executed_batches().len(), 1);
    }
}
