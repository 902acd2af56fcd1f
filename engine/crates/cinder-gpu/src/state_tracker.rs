//! 资源状态追踪
//!
//! 每个录制上下文持有一个 [`ResourceStateTracker`]，记录本上下文内资源的最终状态：
//! - 本地已知状态的资源：状态变化时立即生成 barrier，录制进自己的 command list
//! - 本地第一次遇到的资源：其"之前"的状态只有在提交时才能确定，先放入 pending 列表
//!
//! 提交时持有 [`GlobalResourceStateTable`] 的锁，依据全局状态解析 pending barrier，
//! 再把本地最终状态写回全局表。持锁期间完成提交，因此全局状态的更新顺序与提交顺序一致。

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard},
};

use cinder_rhi::{
    barrier::{ResourceBarrier, ResourceId, Subresource},
    device::{NativeCommandList, RenderDevice},
    queue_type::QueueType,
    resource_state::ResourceStates,
};
use itertools::Itertools;

use crate::{command_list::CommandList, resource::GpuResourceHandle};

/// 状态追踪需要的资源信息
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TrackedResource {
    pub handle: GpuResourceHandle,
    pub id: ResourceId,
    pub subresource_count: u32,
}

/// 一个资源所有子资源的状态
///
/// 大部分时间所有子资源状态一致，只记录 `whole`；个别子资源偏离时记录在 `diverged` 中
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubresourceStates {
    whole: ResourceStates,
    diverged: BTreeMap<u32, ResourceStates>,
}

impl SubresourceStates {
    pub fn new(state: ResourceStates) -> Self {
        Self {
            whole: state,
            diverged: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn is_uniform(&self) -> bool {
        self.diverged.is_empty()
    }

    /// 所有子资源状态一致时返回该状态
    #[inline]
    pub fn uniform_state(&self) -> Option<ResourceStates> {
        self.is_uniform().then_some(self.whole)
    }

    #[inline]
    pub fn get(&self, index: u32) -> ResourceStates {
        self.diverged.get(&index).copied().unwrap_or(self.whole)
    }

    pub fn set(&mut self, subresource: Subresource, state: ResourceStates, subresource_count: u32) {
        match subresource {
            Subresource::All => {
                self.whole = state;
                self.diverged.clear();
            }
            Subresource::Index(index) => {
                if state == self.whole {
                    self.diverged.remove(&index);
                } else {
                    self.diverged.insert(index, state);
                }

                // 所有子资源都偏离到同一个状态时，折叠回 whole
                if self.diverged.len() as u32 == subresource_count && self.diverged.values().all_equal() {
                    if let Some(&state) = self.diverged.values().next() {
                        self.whole = state;
                        self.diverged.clear();
                    }
                }
            }
        }
    }
}

/// 全局资源状态表，所有上下文共享，只能在持锁时访问
#[derive(Default)]
pub struct GlobalResourceStateTable {
    states: Mutex<HashMap<GpuResourceHandle, SubresourceStates>>,
}

/// 全局状态表的锁，解析 pending barrier 与提交最终状态都需要它
pub struct GlobalStateGuard<'a> {
    states: MutexGuard<'a, HashMap<GpuResourceHandle, SubresourceStates>>,
}

impl GlobalResourceStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> GlobalStateGuard<'_> {
        GlobalStateGuard {
            states: self.states.lock().unwrap(),
        }
    }

    /// 资源创建时登记初始状态
    pub fn register(&self, handle: GpuResourceHandle, state: ResourceStates) {
        self.states.lock().unwrap().insert(handle, SubresourceStates::new(state));
    }

    /// 资源销毁时移除
    pub fn remove(&self, handle: GpuResourceHandle) {
        self.states.lock().unwrap().remove(&handle);
    }

    pub fn states_of(&self, handle: GpuResourceHandle) -> Option<SubresourceStates> {
        self.states.lock().unwrap().get(&handle).cloned()
    }

    pub fn len(&self) -> usize {
        self.states.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl GlobalStateGuard<'_> {
    pub fn get(&self, handle: GpuResourceHandle) -> Option<&SubresourceStates> {
        self.states.get(&handle)
    }

    /// 表中没有记录的资源已经被销毁
    fn get_mut(&mut self, handle: GpuResourceHandle) -> Option<&mut SubresourceStates> {
        self.states.get_mut(&handle)
    }
}

/// 本地最终状态；`whole` 为 None 表示资源整体状态未知，只有部分子资源已知
#[derive(Clone, Debug, Default)]
struct LocalResourceState {
    whole: Option<ResourceStates>,
    per_subresource: BTreeMap<u32, ResourceStates>,
}

impl LocalResourceState {
    fn get(&self, index: u32) -> Option<ResourceStates> {
        self.per_subresource.get(&index).copied().or(self.whole)
    }

    fn set(&mut self, subresource: Subresource, state: ResourceStates) {
        match subresource {
            Subresource::All => {
                self.whole = Some(state);
                self.per_subresource.clear();
            }
            Subresource::Index(index) => {
                if self.whole == Some(state) {
                    self.per_subresource.remove(&index);
                } else {
                    self.per_subresource.insert(index, state);
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct PendingTransition {
    resource: TrackedResource,
    subresource: Subresource,
    after: ResourceStates,
}

/// 依据全局状态解析出的 pending barrier
#[derive(Debug, Default)]
pub struct PendingBarriers {
    pub barriers: Vec<ResourceBarrier>,
    /// 存在当前队列无法执行的 barrier，需要转交给 graphics 队列
    pub requires_graphics_queue: bool,
}

/// 单个录制上下文的状态追踪器
#[derive(Default)]
pub struct ResourceStateTracker {
    pending_transitions: Vec<PendingTransition>,
    barriers: Vec<ResourceBarrier>,
    final_states: HashMap<GpuResourceHandle, (TrackedResource, LocalResourceState)>,
}

// record
impl ResourceStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 把资源（或其某个子资源）转换到 `after` 状态
    pub fn transition_resource(&mut self, resource: TrackedResource, after: ResourceStates, subresource: Subresource) {
        if let Subresource::Index(index) = subresource {
            debug_assert!(
                index < resource.subresource_count,
                "子资源索引越界: {} >= {}",
                index,
                resource.subresource_count
            );
        }

        let Some((_, local)) = self.final_states.get_mut(&resource.handle) else {
            // 第一次遇到，之前的状态要等提交时才知道
            self.pending_transitions.push(PendingTransition {
                resource,
                subresource,
                after,
            });
            let mut local = LocalResourceState::default();
            local.set(subresource, after);
            self.final_states.insert(resource.handle, (resource, local));
            return;
        };

        match subresource {
            Subresource::Index(index) => match local.get(index) {
                Some(before) => {
                    if before != after {
                        self.barriers.push(ResourceBarrier::transition(resource.id, subresource, before, after));
                    }
                }
                None => self.pending_transitions.push(PendingTransition {
                    resource,
                    subresource,
                    after,
                }),
            },
            Subresource::All => match local.whole {
                Some(whole) if local.per_subresource.is_empty() => {
                    if whole != after {
                        self.barriers.push(ResourceBarrier::transition(resource.id, subresource, whole, after));
                    }
                }
                _ => {
                    // 子资源状态不一致：逐个子资源转换，本地未知的子资源进入 pending
                    for index in 0..resource.subresource_count {
                        match local.get(index) {
                            Some(before) if before != after => self.barriers.push(ResourceBarrier::transition(
                                resource.id,
                                Subresource::Index(index),
                                before,
                                after,
                            )),
                            Some(_) => {}
                            None => self.pending_transitions.push(PendingTransition {
                                resource,
                                subresource: Subresource::Index(index),
                                after,
                            }),
                        }
                    }
                }
            },
        }

        local.set(subresource, after);
    }

    pub fn uav_barrier(&mut self, resource: Option<ResourceId>) {
        self.barriers.push(ResourceBarrier::uav(resource));
    }

    pub fn aliasing_barrier(&mut self, before: Option<ResourceId>, after: Option<ResourceId>) {
        self.barriers.push(ResourceBarrier::aliasing(before, after));
    }
}

// flush & commit
impl ResourceStateTracker {
    /// 把已知的 barrier 录制到 command list 中；没有 barrier 时什么都不做
    pub fn flush_resource_barriers<D: RenderDevice>(&mut self, command_list: &mut CommandList<D>) -> usize {
        let count = self.barriers.len();
        if count > 0 {
            command_list.native_mut().resource_barrier(&self.barriers);
            self.barriers.clear();
        }
        count
    }

    /// 依据全局状态解析 pending barrier，需要持有全局锁
    ///
    /// 全局状态已经等于目标状态的 pending 转换不会产生 barrier
    pub fn flush_pending_resource_barriers(
        &mut self,
        global: &mut GlobalStateGuard<'_>,
        queue_type: QueueType,
    ) -> PendingBarriers {
        let _span = cinder_crate_tools::profile_span!("ResourceStateTracker::flush_pending_resource_barriers");

        let mut barriers = Vec::new();
        for pending in self.pending_transitions.drain(..) {
            let resource = pending.resource;
            let Some(global_states) = global.get_mut(resource.handle) else {
                log::trace!("跳过已经销毁的资源 {:?} 的 pending barrier", resource.id);
                continue;
            };

            match pending.subresource {
                Subresource::All => match global_states.uniform_state() {
                    Some(before) => {
                        if before != pending.after {
                            barriers.push(ResourceBarrier::transition(resource.id, Subresource::All, before, pending.after));
                        }
                    }
                    None => {
                        for index in 0..resource.subresource_count {
                            let before = global_states.get(index);
                            if before != pending.after {
                                barriers.push(ResourceBarrier::transition(
                                    resource.id,
                                    Subresource::Index(index),
                                    before,
                                    pending.after,
                                ));
                            }
                        }
                    }
                },
                Subresource::Index(index) => {
                    let before = global_states.get(index);
                    if before != pending.after {
                        barriers.push(ResourceBarrier::transition(
                            resource.id,
                            pending.subresource,
                            before,
                            pending.after,
                        ));
                    }
                }
            }
        }

        let requires_graphics_queue = barriers.iter().any(|barrier| !barrier.is_legal_on(queue_type));
        PendingBarriers {
            barriers,
            requires_graphics_queue,
        }
    }

    /// 把本地最终状态写回全局表，需要持有全局锁
    pub fn commit_final_resource_states(&mut self, global: &mut GlobalStateGuard<'_>) {
        for (handle, (resource, local)) in self.final_states.drain() {
            let Some(global_states) = global.get_mut(handle) else {
                continue;
            };
            if let Some(whole) = local.whole {
                global_states.set(Subresource::All, whole, resource.subresource_count);
            }
            for (index, state) in local.per_subresource {
                global_states.set(Subresource::Index(index), state, resource.subresource_count);
            }
        }
    }

    /// 丢弃所有记录
    pub fn reset(&mut self) {
        self.pending_transitions.clear();
        self.barriers.clear();
        self.final_states.clear();
    }
}

// getters
impl ResourceStateTracker {
    #[inline]
    pub fn num_pending_transitions(&self) -> usize {
        self.pending_transitions.len()
    }

    #[inline]
    pub fn num_barriers(&self) -> usize {
        self.barriers.len()
    }

    /// 本地已知的最终状态
    pub fn final_state(&self, handle: GpuResourceHandle, index: u32) -> Option<ResourceStates> {
        self.final_states.get(&handle).and_then(|(_, local)| local.get(index))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use cinder_rhi::headless::{HeadlessDevice, RecordedCommand};
    use slotmap::SlotMap;

    use super::*;
    use crate::command_list::CommandListPool;

    fn make_resources(count: usize, subresource_count: u32) -> Vec<TrackedResource> {
        let mut keys: SlotMap<GpuResourceHandle, ()> = SlotMap::with_key();
        (0..count)
            .map(|i| TrackedResource {
                handle: keys.insert(()),
                id: ResourceId(i as u64 + 1),
                subresource_count,
            })
            .collect()
    }

    fn transition(resource: &TrackedResource, sub: Subresource, before: ResourceStates, after: ResourceStates) -> ResourceBarrier {
        ResourceBarrier::transition(resource.id, sub, before, after)
    }

    #[test]
    fn test_first_use_goes_to_pending() {
        let resources = make_resources(1, 1);
        let mut tracker = ResourceStateTracker::new();

        tracker.transition_resource(resources[0], ResourceStates::UNORDERED_ACCESS, Subresource::All);
        assert_eq!(tracker.num_pending_transitions(), 1);
        assert_eq!(tracker.num_barriers(), 0);

        // 本地已知：立即生成 barrier
        tracker.transition_resource(resources[0], ResourceStates::NON_PIXEL_SHADER_RESOURCE, Subresource::All);
        assert_eq!(tracker.num_pending_transitions(), 1);
        assert_eq!(tracker.num_barriers(), 1);

        // 状态相同，不生成 barrier
        tracker.transition_resource(resources[0], ResourceStates::NON_PIXEL_SHADER_RESOURCE, Subresource::All);
        assert_eq!(tracker.num_barriers(), 1);
        assert_eq!(
            tracker.final_state(resources[0].handle, 0),
            Some(ResourceStates::NON_PIXEL_SHADER_RESOURCE)
        );
    }

    #[test]
    fn test_pending_resolved_against_global_state() {
        let resources = make_resources(2, 1);
        let table = GlobalResourceStateTable::new();
        table.register(resources[0].handle, ResourceStates::COPY_DEST);
        table.register(resources[1].handle, ResourceStates::UNORDERED_ACCESS);

        let mut tracker = ResourceStateTracker::new();
        tracker.transition_resource(resources[0], ResourceStates::UNORDERED_ACCESS, Subresource::All);
        tracker.transition_resource(resources[1], ResourceStates::UNORDERED_ACCESS, Subresource::All);

        let mut guard = table.lock();
        let pending = tracker.flush_pending_resource_barriers(&mut guard, QueueType::Compute);
        // 第二个资源的全局状态已经是目标状态，没有 barrier
        assert_eq!(
            pending.barriers,
            vec![transition(
                &resources[0],
                Subresource::All,
                ResourceStates::COPY_DEST,
                ResourceStates::UNORDERED_ACCESS
            )]
        );
        assert!(!pending.requires_graphics_queue);

        tracker.commit_final_resource_states(&mut guard);
        drop(guard);
        for resource in &resources {
            assert_eq!(
                table.states_of(resource.handle).unwrap().uniform_state(),
                Some(ResourceStates::UNORDERED_ACCESS)
            );
        }
    }

    #[test]
    fn test_removed_resource_is_not_committed() {
        let resources = make_resources(2, 1);
        let table = GlobalResourceStateTable::new();
        table.register(resources[0].handle, ResourceStates::COMMON);
        table.register(resources[1].handle, ResourceStates::COMMON);

        let mut tracker = ResourceStateTracker::new();
        tracker.transition_resource(resources[0], ResourceStates::COPY_DEST, Subresource::All);
        tracker.transition_resource(resources[1], ResourceStates::COPY_DEST, Subresource::All);
        tracker.transition_resource(resources[1], ResourceStates::COPY_SOURCE, Subresource::All);

        // 录制期间资源 1 被销毁
        table.remove(resources[1].handle);

        let mut guard = table.lock();
        let pending = tracker.flush_pending_resource_barriers(&mut guard, QueueType::Copy);
        assert_eq!(
            pending.barriers,
            vec![transition(&resources[0], Subresource::All, ResourceStates::COMMON, ResourceStates::COPY_DEST)]
        );
        tracker.commit_final_resource_states(&mut guard);
        drop(guard);

        assert_eq!(table.len(), 1);
        assert!(table.states_of(resources[1].handle).is_none());
        assert_eq!(
            table.states_of(resources[0].handle).unwrap().uniform_state(),
            Some(ResourceStates::COPY_DEST)
        );
    }

    #[test]
    fn test_graphics_only_pending_barrier_flagged() {
        let resources = make_resources(1, 1);
        let table = GlobalResourceStateTable::new();
        table.register(resources[0].handle, ResourceStates::RENDER_TARGET);

        let mut tracker = ResourceStateTracker::new();
        tracker.transition_resource(resources[0], ResourceStates::NON_PIXEL_SHADER_RESOURCE, Subresource::All);

        let mut guard = table.lock();
        let pending = tracker.flush_pending_resource_barriers(&mut guard, QueueType::Compute);
        assert!(pending.requires_graphics_queue);

        // graphics 队列可以直接执行
        let mut tracker = ResourceStateTracker::new();
        tracker.transition_resource(resources[0], ResourceStates::NON_PIXEL_SHADER_RESOURCE, Subresource::All);
        let pending = tracker.flush_pending_resource_barriers(&mut guard, QueueType::Graphics);
        assert!(!pending.requires_graphics_queue);
    }

    #[test]
    fn test_diverged_global_state_expands_per_subresource() {
        let resources = make_resources(1, 3);
        let table = GlobalResourceStateTable::new();
        table.register(resources[0].handle, ResourceStates::PIXEL_SHADER_RESOURCE);

        // 第一个上下文只改变子资源 1
        let mut first = ResourceStateTracker::new();
        first.transition_resource(resources[0], ResourceStates::RENDER_TARGET, Subresource::Index(1));
        {
            let mut guard = table.lock();
            first.flush_pending_resource_barriers(&mut guard, QueueType::Graphics);
            first.commit_final_resource_states(&mut guard);
        }
        let states = table.states_of(resources[0].handle).unwrap();
        assert!(!states.is_uniform());
        assert_eq!(states.get(1), ResourceStates::RENDER_TARGET);

        // 第二个上下文整体转换：只有与目标不同的子资源需要 barrier
        let mut second = ResourceStateTracker::new();
        second.transition_resource(resources[0], ResourceStates::PIXEL_SHADER_RESOURCE, Subresource::All);
        let mut guard = table.lock();
        let pending = second.flush_pending_resource_barriers(&mut guard, QueueType::Graphics);
        assert_eq!(
            pending.barriers,
            vec![transition(
                &resources[0],
                Subresource::Index(1),
                ResourceStates::RENDER_TARGET,
                ResourceStates::PIXEL_SHADER_RESOURCE
            )]
        );
        second.commit_final_resource_states(&mut guard);
        assert_eq!(
            guard.get(resources[0].handle).unwrap().uniform_state(),
            Some(ResourceStates::PIXEL_SHADER_RESOURCE)
        );
    }

    #[test]
    fn test_whole_transition_with_partially_known_subresources() {
        let resources = make_resources(1, 3);
        let mut tracker = ResourceStateTracker::new();

        // 子资源 0 进入 pending，随后整体转换时：0 已知 -> 立即 barrier，1、2 未知 -> pending
        tracker.transition_resource(resources[0], ResourceStates::COPY_DEST, Subresource::Index(0));
        tracker.transition_resource(resources[0], ResourceStates::COPY_SOURCE, Subresource::All);
        assert_eq!(tracker.num_barriers(), 1);
        assert_eq!(tracker.num_pending_transitions(), 3);

        let table = GlobalResourceStateTable::new();
        table.register(resources[0].handle, ResourceStates::COMMON);
        let mut guard = table.lock();
        let pending = tracker.flush_pending_resource_barriers(&mut guard, QueueType::Copy);
        assert_eq!(
            pending.barriers,
            vec![
                transition(&resources[0], Subresource::Index(0), ResourceStates::COMMON, ResourceStates::COPY_DEST),
                transition(&resources[0], Subresource::Index(1), ResourceStates::COMMON, ResourceStates::COPY_SOURCE),
                transition(&resources[0], Subresource::Index(2), ResourceStates::COMMON, ResourceStates::COPY_SOURCE),
            ]
        );

        tracker.commit_final_resource_states(&mut guard);
        assert_eq!(
            guard.get(resources[0].handle).unwrap().uniform_state(),
            Some(ResourceStates::COPY_SOURCE)
        );
    }

    #[test]
    fn test_flush_barriers_into_command_list() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = CommandListPool::new(device, QueueType::Compute);
        let mut list = pool.request_command_list(|_| true);

        let resources = make_resources(1, 1);
        let mut tracker = ResourceStateTracker::new();
        assert_eq!(tracker.flush_resource_barriers(&mut list), 0);
        assert!(list.native().commands().is_empty());

        tracker.transition_resource(resources[0], ResourceStates::UNORDERED_ACCESS, Subresource::All);
        tracker.transition_resource(resources[0], ResourceStates::NON_PIXEL_SHADER_RESOURCE, Subresource::All);
        tracker.uav_barrier(Some(resources[0].id));
        tracker.aliasing_barrier(None, Some(resources[0].id));
        assert_eq!(tracker.flush_resource_barriers(&mut list), 3);
        assert_eq!(tracker.num_barriers(), 0);

        let RecordedCommand::Barriers(recorded) = &list.native().commands()[0] else {
            panic!("期望 barrier 命令");
        };
        assert_eq!(recorded.len(), 3);
        assert_eq!(
            recorded[0].barrier,
            transition(
                &resources[0],
                Subresource::All,
                ResourceStates::UNORDERED_ACCESS,
                ResourceStates::NON_PIXEL_SHADER_RESOURCE
            )
        );
    }

    #[test]
    fn test_reset_discards_everything() {
        let resources = make_resources(1, 1);
        let table = GlobalResourceStateTable::new();
        table.register(resources[0].handle, ResourceStates::COPY_SOURCE);

        let mut tracker = ResourceStateTracker::new();
        tracker.transition_resource(resources[0], ResourceStates::UNORDERED_ACCESS, Subresource::All);
        tracker.uav_barrier(None);
        tracker.reset();

        let mut guard = table.lock();
        assert!(tracker.flush_pending_resource_barriers(&mut guard, QueueType::Compute).barriers.is_empty());
        tracker.commit_final_resource_states(&mut guard);
        assert_eq!(
            guard.get(resources[0].handle).unwrap().uniform_state(),
            Some(ResourceStates::COPY_SOURCE)
        );
    }

    #[test]
    fn test_subresource_states_collapse() {
        let mut states = SubresourceStates::new(ResourceStates::COMMON);
        states.set(Subresource::Index(0), ResourceStates::COPY_DEST, 2);
        assert!(!states.is_uniform());
        states.set(Subresource::Index(1), ResourceStates::COPY_DEST, 2);
        assert_eq!(states.uniform_state(), Some(ResourceStates::COPY_DEST));

        states.set(Subresource::Index(1), ResourceStates::COPY_DEST, 2);
        assert!(states.is_uniform());
    }
}
