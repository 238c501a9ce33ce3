//! Task group bookkeeping.
//!
//! Groups live in a slot arena guarded by the scheduler mutex. A
//! [`TaskGroupId`](crate::task::TaskGroupId) remembers the slot counter it was
//! handed out with, so finished groups can be recycled without invalidating
//! old handles.

mod arena;
pub(crate) use arena::{GroupArena, ReleasedGroup};

use crate::task::{Task, TaskGroupId, TaskPriority};
use parking_lot::Condvar;
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;

/// Called once when all tasks of a group are done, before dependent groups get
/// scheduled.
pub type OnGroupFinished = Box<dyn FnOnce(TaskGroupId) + Send + 'static>;

// Most groups hold a handful of tasks and dependencies, keep those inline.
pub(crate) const SPILL_TO_HEAP_THRESHOLD: usize = 8;

pub(crate) type TaskList = SmallVec<[Arc<Task>; SPILL_TO_HEAP_THRESHOLD]>;

pub(crate) type GroupList = SmallVec<[TaskGroupId; SPILL_TO_HEAP_THRESHOLD]>;

/// Whether a mutating operation expects the group to be started already.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expect {
    NotStarted,
    Started,
}

pub(crate) struct GroupSlot {
    /// Odd while the slot is live, see [`crate::task::next_group_counter`].
    pub(crate) counter: u32,

    pub(crate) in_use: bool,

    pub(crate) started_by_user: bool,

    pub(crate) priority: TaskPriority,

    pub(crate) tasks: TaskList,

    /// Groups waiting for this one.
    pub(crate) successors: GroupList,

    /// Predecessors that have not finished yet.
    pub(crate) active_dependencies: u32,

    /// Queued invocations of this group that have not completed. Shared with
    /// the queue entries so completion can be counted without the scheduler
    /// lock.
    pub(crate) remaining_invocations: Arc<AtomicU32>,

    pub(crate) on_finished: Option<OnGroupFinished>,

    /// Notified when the group finishes. Always used together with the
    /// scheduler mutex.
    pub(crate) finished: Arc<Condvar>,
}

impl GroupSlot {
    fn new(counter: u32, priority: TaskPriority, on_finished: Option<OnGroupFinished>) -> Self {
        Self {
            counter,
            in_use: true,
            started_by_user: false,
            priority,
            tasks: SmallVec::new(),
            successors: SmallVec::new(),
            active_dependencies: 0,
            remaining_invocations: Arc::new(AtomicU32::new(0)),
            on_finished,
            finished: Arc::new(Condvar::new()),
        }
    }

    /// Puts a free slot back into service. The counter moves on, so handles of
    /// the previous occupant keep reporting "finished".
    fn reuse(&mut self, priority: TaskPriority, on_finished: Option<OnGroupFinished>) {
        debug_assert!(!self.in_use, "reusing a group slot that is still in use");

        self.counter = crate::task::next_group_counter(self.counter);
        self.in_use = true;
        self.started_by_user = false;
        self.priority = priority;
        self.tasks.clear();
        self.successors.clear();
        self.active_dependencies = 0;
        self.remaining_invocations = Arc::new(AtomicU32::new(0));
        self.on_finished = on_finished;
    }

    /// Asserts that the group is (or is not) started yet. Compiled out in
    /// release builds.
    #[track_caller]
    pub(crate) fn debug_check(&self, id: TaskGroupId, expect: Expect) {
        match expect {
            Expect::NotStarted => debug_assert!(
                !self.started_by_user,
                "task group {id} was already started, it can't be modified anymore"
            ),
            Expect::Started => debug_assert!(
                self.started_by_user,
                "task group {id} was not started yet"
            ),
        }
    }

    /// Number of queue entries the group produces once scheduled.
    pub(crate) fn invocation_count(&self) -> u32 {
        self.tasks.iter().map(|task| task.invocation_count()).sum()
    }
}
