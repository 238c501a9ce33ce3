use crate::task::TaskGroupId;
use crate::utils::{ScopeGuard, panic_message};
use bitflags::bitflags;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

/// The work a task performs. Called once per invocation.
pub type TaskBody = dyn Fn(&TaskContext<'_>) + Send + Sync + 'static;

/// Called exactly once per run of a task, when its last invocation is done or
/// when it got canceled before that.
pub type OnTaskFinished = Arc<dyn Fn(&Task) + Send + Sync + 'static>;

/// Whether a task may itself wait on other task groups.
///
/// Threads that are waiting on a group only pick up tasks marked `Never`
/// (besides tasks of the group they wait for). Executing a task that waits
/// again from inside a wait could otherwise build arbitrarily deep stacks of
/// blocked work on a single thread.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TaskNesting {
    #[default]
    Maybe,
    Never,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TaskFlags: u8 {
        /// The task is queued as part of a started group.
        const SCHEDULED = 1;

        /// Cancellation was requested, remaining invocations are skipped.
        const CANCELED = 1 << 1;
    }
}

/// Per invocation view handed to the task body.
pub struct TaskContext<'a> {
    task: &'a Task,
    invocation: u32,
}

impl TaskContext<'_> {
    /// Index of this invocation, in `0..multiplicity`. Always 0 for tasks
    /// without multiplicity.
    pub fn invocation(&self) -> u32 {
        self.invocation
    }

    pub fn task(&self) -> &Task {
        self.task
    }

    /// Long running bodies should poll this and bail out early.
    pub fn is_canceled(&self) -> bool {
        self.task.is_canceled()
    }
}

/// A schedulable unit of work.
///
/// A task with a multiplicity of `n > 0` represents `n` independent
/// invocations of its body that may run concurrently on different threads and
/// in any order. With a multiplicity of 0 the body runs exactly once.
///
/// A task is inert when created. Adding it to a group resets it, after which
/// it has `max(1, multiplicity)` remaining runs. It may be reused once all of
/// them are done.
pub struct Task {
    name: Mutex<Arc<str>>,

    never_nests: AtomicBool,

    on_finished: Mutex<Option<OnTaskFinished>>,

    body: Box<TaskBody>,

    multiplicity: AtomicU32,

    /// Run generation in the upper half, remaining invocations of that run in
    /// the lower half. Invocations only count towards the run they started in.
    runs: AtomicU64,

    /// Invocations currently executing the body.
    in_flight: AtomicU32,

    flags: AtomicU8,

    /// Group this task was last added to.
    group: Mutex<TaskGroupId>,
}

impl Task {
    pub fn new<F>(name: impl Into<Arc<str>>, body: F) -> Self
    where
        F: Fn(&TaskContext<'_>) + Send + Sync + 'static,
    {
        Self {
            name: Mutex::new(name.into()),
            never_nests: AtomicBool::new(false),
            on_finished: Mutex::new(None),
            body: Box::new(body),
            multiplicity: AtomicU32::new(0),
            runs: AtomicU64::new(0),
            in_flight: AtomicU32::new(0),
            flags: AtomicU8::new(0),
            group: Mutex::new(TaskGroupId::default()),
        }
    }

    /// Shorthand for [`Task::new`] followed by [`Task::set_multiplicity`].
    pub fn with_multiplicity<F>(name: impl Into<Arc<str>>, multiplicity: u32, body: F) -> Self
    where
        F: Fn(&TaskContext<'_>) + Send + Sync + 'static,
    {
        let task = Self::new(name, body);
        task.set_multiplicity(multiplicity);
        task
    }

    /// Changes name, nesting mode and completion callback.
    ///
    /// # Panics
    ///
    /// In debug builds, if the task still has unfinished runs.
    #[track_caller]
    pub fn configure_task(
        &self,
        name: impl Into<Arc<str>>,
        nesting: TaskNesting,
        on_finished: Option<OnTaskFinished>,
    ) {
        debug_assert!(
            self.is_finished(),
            "can't reconfigure task `{}` while it has unfinished runs",
            self.name()
        );

        *self.name.lock() = name.into();
        self.never_nests
            .store(nesting == TaskNesting::Never, Ordering::Release);
        *self.on_finished.lock() = on_finished;
    }

    /// Sets how many independent invocations a run consists of. Zero means the
    /// body is invoked exactly once.
    #[track_caller]
    pub fn set_multiplicity(&self, multiplicity: u32) {
        debug_assert!(
            self.is_finished(),
            "can't change multiplicity of task `{}` while it has unfinished runs",
            self.name()
        );

        self.multiplicity.store(multiplicity, Ordering::Release);
    }

    pub fn multiplicity(&self) -> u32 {
        self.multiplicity.load(Ordering::Acquire)
    }

    /// Number of times [`Task::run`] has to be called for one full run.
    pub(crate) fn invocation_count(&self) -> u32 {
        self.multiplicity().max(1)
    }

    pub fn name(&self) -> Arc<str> {
        Arc::clone(&self.name.lock())
    }

    pub fn nesting(&self) -> TaskNesting {
        if self.never_nests.load(Ordering::Acquire) {
            TaskNesting::Never
        } else {
            TaskNesting::Maybe
        }
    }

    /// Prepares the task for another run.
    ///
    /// Sets the remaining runs to `max(1, multiplicity)` and clears the
    /// canceled and scheduled state. Called when the task is added to a group.
    pub fn reset(&self) {
        let remaining = self.invocation_count();
        let _ = self
            .runs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |runs| {
                let (generation, _) = split_runs(runs);
                Some(join_runs(generation.wrapping_add(1), remaining))
            });
        self.flags.store(TaskFlags::empty().bits(), Ordering::SeqCst);
    }

    /// Executes one invocation of the task.
    ///
    /// Does nothing once all runs are done. If cancellation was requested the
    /// remaining runs are dropped to zero instead. Otherwise the body runs
    /// inside a `task` span and the remaining run counter is decremented.
    ///
    /// A panicking body is logged and still counts as a completed invocation.
    pub fn run(&self, invocation: u32) {
        let (generation, remaining) = split_runs(self.runs.load(Ordering::Acquire));
        if remaining == 0 {
            return;
        }

        // Announce the invocation *before* looking at the cancel flag, so that
        // `cancel` either prevents this invocation or observes it in flight.
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _in_flight = ScopeGuard::new(|| {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        if self.is_canceled() {
            if self.update_remaining(generation, |_| 0).is_some() {
                self.notify_finished();
            }
            return;
        }

        let name = self.name();
        let span = if self.multiplicity() > 0 {
            tracing::trace_span!("task", name = %name, invocation)
        } else {
            tracing::trace_span!("task", name = %name)
        };

        {
            let _entered = span.enter();
            let ctx = TaskContext {
                task: self,
                invocation,
            };

            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (self.body)(&ctx))) {
                tracing::error!(
                    task = %name,
                    invocation,
                    panic = panic_message(payload.as_ref()),
                    "task body panicked"
                );
            }
        }

        // A concurrent cancel may already have forced the counter to zero, or
        // the task may have been reset for its next run meanwhile.
        if self.update_remaining(generation, |remaining| remaining - 1) == Some(1) {
            self.notify_finished();
        }
    }

    /// Requests cooperative cancellation.
    ///
    /// Invocations that have not started yet will not execute the body. An
    /// invocation that is already executing is not interrupted.
    pub fn cancel(&self) {
        self.flags
            .fetch_or(TaskFlags::CANCELED.bits(), Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.load_flags().contains(TaskFlags::CANCELED)
    }

    /// True when the current run has no remaining invocations, so the task
    /// may be added to a group again.
    ///
    /// After a cancellation an invocation of the canceled run may still be
    /// executing, see [`Task::is_running`]. It does not count towards later
    /// runs.
    pub fn is_finished(&self) -> bool {
        self.remaining_runs() == 0
    }

    pub fn remaining_runs(&self) -> u32 {
        split_runs(self.runs.load(Ordering::Acquire)).1
    }

    /// True while some thread executes the body of this task.
    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    pub fn is_scheduled(&self) -> bool {
        self.load_flags().contains(TaskFlags::SCHEDULED)
    }

    /// The group this task was last added to.
    pub fn belongs_to_group(&self) -> TaskGroupId {
        *self.group.lock()
    }

    pub(crate) fn set_group(&self, group: TaskGroupId) {
        *self.group.lock() = group;
    }

    pub(crate) fn mark_scheduled(&self) {
        self.flags
            .fetch_or(TaskFlags::SCHEDULED.bits(), Ordering::AcqRel);
    }

    fn load_flags(&self) -> TaskFlags {
        TaskFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    /// Applies `f` to the remaining invocations if `generation` is still the
    /// current run and has invocations left. Returns the previous count.
    fn update_remaining(&self, generation: u32, f: impl Fn(u32) -> u32) -> Option<u32> {
        self.runs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |runs| {
                let (current, remaining) = split_runs(runs);
                (current == generation && remaining > 0).then(|| join_runs(current, f(remaining)))
            })
            .ok()
            .map(|runs| split_runs(runs).1)
    }

    fn notify_finished(&self) {
        let callback = self.on_finished.lock().clone();
        if let Some(callback) = callback {
            callback(self);
        }
    }
}

fn split_runs(runs: u64) -> (u32, u32) {
    ((runs >> 32) as u32, runs as u32)
}

fn join_runs(generation: u32, remaining: u32) -> u64 {
    (u64::from(generation) << 32) | u64::from(remaining)
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name())
            .field("nesting", &self.nesting())
            .field("multiplicity", &self.multiplicity())
            .field("remaining_runs", &self.remaining_runs())
            .field("flags", &self.load_flags())
            .finish_non_exhaustive()
    }
}
