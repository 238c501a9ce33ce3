use crate::task::{PriorityRange, Task, TaskGroupId, TaskPriority};
use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;

/// One queued invocation of a task.
pub(crate) struct ScheduledTask {
    pub(crate) task: Arc<Task>,
    pub(crate) invocation: u32,
    pub(crate) group: TaskGroupId,

    /// Remaining invocations of `group`, decremented once this one is done.
    pub(crate) remaining: Arc<AtomicU32>,
}

/// One FIFO lane per priority.
pub(crate) struct ReadyQueues {
    lanes: [VecDeque<ScheduledTask>; TaskPriority::COUNT],
}

impl ReadyQueues {
    pub(crate) fn new() -> Self {
        Self {
            lanes: std::array::from_fn(|_| VecDeque::new()),
        }
    }

    pub(crate) fn push(&mut self, priority: TaskPriority, task: ScheduledTask) {
        self.lanes[priority.index()].push_back(task);
    }

    /// Oldest entry of the most urgent non-empty lane in `range`.
    pub(crate) fn pop(&mut self, range: PriorityRange) -> Option<ScheduledTask> {
        range
            .indices()
            .find_map(|lane| self.lanes[lane].pop_front())
    }

    /// Like [`ReadyQueues::pop`] but only considers entries accepted by `filter`.
    pub(crate) fn pop_where<F>(&mut self, range: PriorityRange, filter: F) -> Option<ScheduledTask>
    where
        F: Fn(&ScheduledTask) -> bool,
    {
        for lane in range.indices() {
            let queue = &mut self.lanes[lane];
            if let Some(pos) = queue.iter().position(&filter) {
                return queue.remove(pos);
            }
        }

        None
    }

    pub(crate) fn has_work(&self, range: PriorityRange) -> bool {
        range.indices().any(|lane| !self.lanes[lane].is_empty())
    }

    #[cfg(test)]
    pub(crate) fn len(&self, priority: TaskPriority) -> usize {
        self.lanes[priority.index()].len()
    }

    /// Moves every next-frame entry to the matching this-frame lane, behind
    /// what is already queued there. Returns the number of moved entries.
    pub(crate) fn promote_next_frame(&mut self) -> usize {
        let mut moved = 0;

        for from in TaskPriority::ALL {
            let Some(to) = from.promoted() else {
                continue;
            };

            let entries = mem::take(&mut self.lanes[from.index()]);
            moved += entries.len();
            self.lanes[to.index()].extend(entries);
        }

        moved
    }

    /// Removes every queued invocation matching `filter`, in queue order.
    pub(crate) fn drain_where<F>(&mut self, filter: F) -> Vec<ScheduledTask>
    where
        F: Fn(&ScheduledTask) -> bool,
    {
        let mut drained = Vec::new();

        for queue in self.lanes.iter_mut() {
            let mut kept = VecDeque::with_capacity(queue.len());
            for entry in queue.drain(..) {
                if filter(&entry) {
                    drained.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            *queue = kept;
        }

        drained
    }
}
