use super::{GroupList, GroupSlot, OnGroupFinished};
use crate::task::{FIRST_GROUP_COUNTER, TaskGroupId, TaskPriority, next_group_counter};
use parking_lot::Condvar;
use std::mem;
use std::sync::Arc;

/// What the scheduler needs to finish off a group once its slot is released.
pub(crate) struct ReleasedGroup {
    pub(crate) successors: GroupList,
    pub(crate) finished: Arc<Condvar>,
}

/// Slot storage for task groups.
///
/// Slots are addressed by index and never removed, free slots are recycled
/// LIFO before the arena grows. Every lookup goes through the counter stored
/// in the [`TaskGroupId`], so a handle to a finished group never resolves to
/// whatever group occupies the slot now.
#[derive(Default)]
pub(crate) struct GroupArena {
    slots: Vec<GroupSlot>,
    free: Vec<u32>,
}

impl GroupArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn allocate(
        &mut self,
        priority: TaskPriority,
        on_finished: Option<OnGroupFinished>,
    ) -> TaskGroupId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.reuse(priority, on_finished);
            return TaskGroupId::new(index, slot.counter);
        }

        let index = u32::try_from(self.slots.len()).expect("exhausted task group slots");
        self.slots
            .push(GroupSlot::new(FIRST_GROUP_COUNTER, priority, on_finished));

        TaskGroupId::new(index, FIRST_GROUP_COUNTER)
    }

    /// The live group `id` refers to, `None` once it finished.
    pub(crate) fn get(&self, id: TaskGroupId) -> Option<&GroupSlot> {
        self.slots
            .get(id.slot())
            .filter(|slot| slot.in_use && slot.counter == id.counter)
    }

    pub(crate) fn get_mut(&mut self, id: TaskGroupId) -> Option<&mut GroupSlot> {
        self.slots
            .get_mut(id.slot())
            .filter(|slot| slot.in_use && slot.counter == id.counter)
    }

    /// Invalid and stale handles count as finished.
    pub(crate) fn is_finished(&self, id: TaskGroupId) -> bool {
        self.get(id).is_none()
    }

    /// Marks the group as finished and frees its slot. Returns `None` if `id`
    /// was not live.
    pub(crate) fn release(&mut self, id: TaskGroupId) -> Option<ReleasedGroup> {
        let slot = self.get_mut(id)?;

        slot.counter = next_group_counter(slot.counter);
        slot.in_use = false;
        slot.started_by_user = false;
        slot.tasks.clear();
        slot.on_finished = None;

        let released = ReleasedGroup {
            successors: mem::take(&mut slot.successors),
            finished: Arc::clone(&slot.finished),
        };

        self.free.push(id.slot);
        Some(released)
    }

    /// Number of slots ever allocated.
    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub(crate) fn num_in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}
