use crate::errors::TaskSystemError;
use crate::group::{Expect, GroupArena, GroupList, GroupSlot, OnGroupFinished, TaskList};
use crate::runtime::context::{self, ThreadRole};
use crate::runtime::frame::FrameState;
use crate::runtime::pool::WorkerPool;
use crate::runtime::queue::{ReadyQueues, ScheduledTask};
use crate::runtime::worker::run_worker;
use crate::runtime::{OnTaskRunning, TaskSystemConfig};
use crate::task::{PriorityRange, Task, TaskGroupId, TaskNesting, TaskPriority, WorkerThreadType};
use crate::utils::{ScopeGuard, panic_message};
use parking_lot::Mutex;
use smallvec::smallvec;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

#[cfg(test)]
use crate::utils::tracker::{Call, Method, Tracker};

/// Back-off of `wait_for_condition` when there is nothing to help with.
const CONDITION_BACKOFF: Duration = Duration::from_micros(50);

/// Everything guarded by the one scheduler mutex.
pub(crate) struct SchedulerState {
    pub(crate) groups: GroupArena,
    pub(crate) queues: ReadyQueues,

    #[cfg(test)]
    tracker: Tracker,
}

/// Workers to wake once the scheduler lock is released.
#[derive(Debug, Default)]
pub(crate) struct WakeList([usize; WorkerThreadType::COUNT]);

impl WakeList {
    fn add(&mut self, priority: TaskPriority, invocations: usize) {
        if let Some(kind) = priority.worker_type() {
            self.0[kind.index()] += invocations;
        }
    }
}

impl SchedulerState {
    /// Queues every invocation of a ready group. Returns false if the group had
    /// nothing to queue, in which case the caller has to finish it.
    fn enqueue_group(&mut self, id: TaskGroupId, wake: &mut WakeList) -> bool {
        let SchedulerState { groups, queues, .. } = self;
        let Some(slot) = groups.get_mut(id) else {
            return true;
        };

        let total = slot.invocation_count();
        slot.remaining_invocations.store(total, Ordering::Release);

        for task in slot.tasks.iter() {
            task.mark_scheduled();

            for invocation in 0..task.invocation_count() {
                #[cfg(test)]
                self.tracker.record(
                    Method::Schedule,
                    Call::Schedule {
                        group: id,
                        priority: slot.priority,
                        task: task.name(),
                        invocation,
                    },
                );

                queues.push(
                    slot.priority,
                    ScheduledTask {
                        task: Arc::clone(task),
                        invocation,
                        group: id,
                        remaining: Arc::clone(&slot.remaining_invocations),
                    },
                );
            }
        }

        tracing::trace!(group = %id, priority = %slot.priority, invocations = total, "group scheduled");

        wake.add(slot.priority, total as usize);
        total > 0
    }

    /// The live, not yet started group `id` refers to.
    #[track_caller]
    fn unstarted_group(&mut self, id: TaskGroupId) -> Option<&mut GroupSlot> {
        let slot = self.groups.get_mut(id);
        debug_assert!(slot.is_some(), "task group {id} is stale, it already finished");

        if slot.is_none() {
            tracing::warn!(group = %id, "ignoring modification of a finished task group");
        }

        let slot = slot?;
        slot.debug_check(id, Expect::NotStarted);
        Some(slot)
    }

    #[track_caller]
    fn add_dependency(&mut self, group: TaskGroupId, depends_on: TaskGroupId) {
        debug_assert_ne!(group, depends_on, "task group {group} can't depend on itself");

        // Nothing to wait for.
        if self.groups.is_finished(depends_on) {
            return;
        }

        let Some(slot) = self.unstarted_group(group) else {
            return;
        };

        slot.active_dependencies += 1;

        if let Some(predecessor) = self.groups.get_mut(depends_on) {
            predecessor.successors.push(group);
        }
    }

    /// Returns the group if it is ready but empty and has to be finished by the
    /// caller.
    #[track_caller]
    fn start_group(&mut self, id: TaskGroupId, wake: &mut WakeList) -> Option<TaskGroupId> {
        let slot = self.unstarted_group(id)?;
        slot.started_by_user = true;

        if slot.active_dependencies > 0 || self.enqueue_group(id, wake) {
            None
        } else {
            Some(id)
        }
    }
}

/// State shared by the task system handle and all worker threads.
pub(crate) struct Shared {
    pub(crate) cfg: TaskSystemConfig,

    /// Distinguishes the workers of this system from those of others.
    pub(crate) id: u64,

    main_thread: ThreadId,

    pub(crate) state: Mutex<SchedulerState>,

    pools: [WorkerPool; WorkerThreadType::COUNT],

    pub(crate) frame: Mutex<FrameState>,

    shutdown: AtomicBool,

    #[cfg(test)]
    pub(crate) tracker: Tracker,
}

impl Shared {
    pub(crate) fn new(cfg: TaskSystemConfig) -> Self {
        let pools = WorkerThreadType::ALL.map(|kind| WorkerPool::new(kind, cfg.workers(kind)));

        #[cfg(test)]
        let tracker = Tracker::new();

        Self {
            id: context::next_system_id(),
            main_thread: thread::current().id(),
            state: Mutex::new(SchedulerState {
                groups: GroupArena::new(),
                queues: ReadyQueues::new(),
                #[cfg(test)]
                tracker: tracker.clone(),
            }),
            pools,
            frame: Mutex::new(FrameState::new(cfg.target_frame_time)),
            shutdown: AtomicBool::new(false),
            cfg,
            #[cfg(test)]
            tracker,
        }
    }

    pub(crate) fn pool(&self, kind: WorkerThreadType) -> &WorkerPool {
        &self.pools[kind.index()]
    }

    pub(crate) fn pools(&self) -> &[WorkerPool] {
        &self.pools
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn is_main_thread(&self) -> bool {
        thread::current().id() == self.main_thread
    }

    pub(crate) fn role(&self) -> ThreadRole {
        ThreadRole::current(self.id, self.is_main_thread())
    }

    // --- Worker threads ---

    pub(crate) fn spawn_initial_workers(self: &Arc<Self>) -> anyhow::Result<()> {
        for kind in WorkerThreadType::ALL {
            let wanted = self.cfg.workers(kind);
            let spawned = self.wake(kind, wanted);

            if spawned < wanted {
                self.shutdown()?;
                anyhow::bail!("only {spawned} of {wanted} {kind:?} workers could be started");
            }
        }

        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, kind: WorkerThreadType) -> Result<(), TaskSystemError> {
        let pool = self.pool(kind);
        let slot = pool.register_worker();

        let mut builder = thread::Builder::new().name(self.cfg.thread_name.name(kind, slot.index));
        if let Some(stack_size) = self.cfg.thread_stack_size {
            builder = builder.stack_size(stack_size);
        }

        let shared = Arc::clone(self);
        let worker_slot = Arc::clone(&slot);

        match builder.spawn(move || run_worker(shared, kind, worker_slot)) {
            Ok(handle) => {
                pool.push_handle(handle);
                tracing::debug!(?kind, index = slot.index, "spawned worker thread");
                Ok(())
            }
            Err(e) => {
                pool.unregister_worker(&slot);
                Err(TaskSystemError::Spawn(e))
            }
        }
    }

    /// Wakes (or allocates) up to `wanted` workers of a category. Must not be
    /// called while holding the scheduler lock.
    pub(crate) fn wake(self: &Arc<Self>, kind: WorkerThreadType, wanted: usize) -> usize {
        if self.is_shutdown() {
            return 0;
        }

        self.pool(kind).wake(wanted, self.cfg.max_allocated_workers, || {
            Ok(self.spawn_worker(kind)?)
        })
    }

    fn wake_workers(self: &Arc<Self>, wake: &WakeList) {
        for kind in WorkerThreadType::ALL {
            let wanted = wake.0[kind.index()];
            if wanted > 0 {
                self.wake(kind, wanted);
            }
        }
    }

    pub(crate) fn set_worker_thread_count(self: &Arc<Self>, kind: WorkerThreadType, count: usize) {
        let count = count.clamp(1, self.cfg.max_allocated_workers);
        let pool = self.pool(kind);
        let previous = pool.max_active();

        pool.set_max_active(count);
        tracing::debug!(?kind, previous, count, "changed worker thread count");

        if self.is_shutdown() {
            return;
        }

        // Allocated up front, workers without anything to do park right away.
        for _ in pool.num_allocated()..count {
            if let Err(e) = self.spawn_worker(kind) {
                tracing::error!(?kind, error = %e, "failed to allocate worker thread");
                break;
            }
        }
    }

    /// Stops and joins every worker thread. Queued tasks are not executed.
    pub(crate) fn shutdown(&self) -> Result<(), TaskSystemError> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        debug_assert!(
            self.role().worker_type().is_none(),
            "task system can't be shut down from one of its own workers"
        );
        tracing::debug!("shutting down task system");

        for pool in &self.pools {
            pool.unpark_all();
        }

        let panicked: usize = self.pools.iter().map(|pool| pool.join_all()).sum();
        if panicked > 0 {
            return Err(TaskSystemError::WorkerPanicked(panicked));
        }

        Ok(())
    }

    // --- Task groups ---

    pub(crate) fn create_group(
        &self,
        priority: TaskPriority,
        on_finished: Option<OnGroupFinished>,
    ) -> TaskGroupId {
        self.state.lock().groups.allocate(priority, on_finished)
    }

    #[track_caller]
    pub(crate) fn add_task(&self, group: TaskGroupId, task: &Arc<Task>) {
        debug_assert!(
            task.is_finished(),
            "task `{}` is still in use by group {}",
            task.name(),
            task.belongs_to_group()
        );

        let mut state = self.state.lock();
        let Some(slot) = state.unstarted_group(group) else {
            return;
        };

        task.reset();
        task.set_group(group);
        slot.tasks.push(Arc::clone(task));
    }

    #[track_caller]
    pub(crate) fn add_dependencies(&self, batch: &[(TaskGroupId, TaskGroupId)]) {
        let mut state = self.state.lock();

        for &(group, depends_on) in batch {
            state.add_dependency(group, depends_on);
        }
    }

    #[track_caller]
    pub(crate) fn start_groups(self: &Arc<Self>, batch: &[TaskGroupId]) {
        let mut wake = WakeList::default();

        let ready_but_empty: GroupList = {
            let mut state = self.state.lock();
            batch
                .iter()
                .filter_map(|&id| state.start_group(id, &mut wake))
                .collect()
        };

        self.wake_workers(&wake);

        for id in ready_but_empty {
            self.group_finished(id);
        }
    }

    pub(crate) fn is_group_finished(&self, id: TaskGroupId) -> bool {
        self.state.lock().groups.is_finished(id)
    }

    #[track_caller]
    pub(crate) fn debug_check_group(&self, id: TaskGroupId, expect: Expect) {
        let state = self.state.lock();
        let slot = state.groups.get(id);
        debug_assert!(slot.is_some(), "task group {id} is stale, it already finished");

        if let Some(slot) = slot {
            slot.debug_check(id, expect);
        }
    }

    /// Called once the last invocation of a group completed, or right away for
    /// groups without tasks.
    ///
    /// Runs the group callback, frees the slot, wakes waiters and schedules
    /// successors whose last dependency this was. Successors that turn out to
    /// be empty are finished in the same loop.
    pub(crate) fn group_finished(self: &Arc<Self>, id: TaskGroupId) {
        let mut pending: GroupList = smallvec![id];

        while let Some(id) = pending.pop() {
            let on_finished = self
                .state
                .lock()
                .groups
                .get_mut(id)
                .and_then(|slot| slot.on_finished.take());

            if let Some(on_finished) = on_finished
                && let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| on_finished(id)))
            {
                tracing::error!(
                    group = %id,
                    panic = panic_message(payload.as_ref()),
                    "group completion callback panicked"
                );
            }

            let mut wake = WakeList::default();
            {
                let mut state = self.state.lock();
                let Some(released) = state.groups.release(id) else {
                    continue;
                };

                released.finished.notify_all();
                tracing::trace!(group = %id, "group finished");

                #[cfg(test)]
                self.tracker
                    .record(Method::GroupFinished, Call::GroupFinished { group: id });

                for successor in released.successors {
                    let ready = match state.groups.get_mut(successor) {
                        Some(slot) => {
                            debug_assert!(slot.active_dependencies > 0);
                            slot.active_dependencies -= 1;
                            slot.active_dependencies == 0 && slot.started_by_user
                        }
                        None => false,
                    };

                    if ready && !state.enqueue_group(successor, &mut wake) {
                        pending.push(successor);
                    }
                }
            }

            self.wake_workers(&wake);
        }
    }

    // --- Execution ---

    /// Runs one queued invocation and accounts for it in its group.
    pub(crate) fn execute(self: &Arc<Self>, scheduled: ScheduledTask) {
        #[cfg(test)]
        self.tracker.record(
            Method::Execute,
            Call::Execute {
                group: scheduled.group,
                task: scheduled.task.name(),
                invocation: scheduled.invocation,
            },
        );

        scheduled.task.run(scheduled.invocation);

        if scheduled.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.group_finished(scheduled.group);
        }
    }

    /// Executes and attributes the busy time to the worker, if `role` is one.
    fn execute_as(self: &Arc<Self>, role: ThreadRole, scheduled: ScheduledTask) {
        let start = Instant::now();
        self.execute(scheduled);

        if let ThreadRole::Worker { kind, index } = role
            && let Some(slot) = self.pool(kind).slot(index)
        {
            slot.record_task(start.elapsed());
        }
    }

    /// Takes the most urgent invocation `role` may execute.
    ///
    /// While waiting for a group, a thread only takes tasks of that group or
    /// tasks that never wait themselves. `waiting_for` set to the invalid id
    /// therefore restricts it to the latter.
    pub(crate) fn pop_task(
        &self,
        role: ThreadRole,
        waiting_for: Option<TaskGroupId>,
    ) -> Option<ScheduledTask> {
        let (primary, fallback) = role.ranges();
        let mut state = self.state.lock();

        [Some(primary), fallback]
            .into_iter()
            .flatten()
            .find_map(|range| match waiting_for {
                None => state.queues.pop(range),
                Some(group) => state.queues.pop_where(range, |scheduled| {
                    scheduled.group == group || scheduled.task.nesting() == TaskNesting::Never
                }),
            })
    }

    pub(crate) fn pop_range(&self, range: PriorityRange) -> Option<ScheduledTask> {
        self.state.lock().queues.pop(range)
    }

    pub(crate) fn has_work(&self, primary: PriorityRange, fallback: Option<PriorityRange>) -> bool {
        let state = self.state.lock();
        state.queues.has_work(primary) || fallback.is_some_and(|range| state.queues.has_work(range))
    }

    /// Executes one task the calling thread may help with. Returns false if
    /// there was none.
    fn help_executing(self: &Arc<Self>, role: ThreadRole, waiting_for: TaskGroupId) -> bool {
        match self.pop_task(role, Some(waiting_for)) {
            Some(scheduled) => {
                self.execute_as(role, scheduled);
                true
            }
            None => false,
        }
    }

    /// Accounts the calling worker as blocked until the guard drops, and wakes
    /// a replacement if its category has queued work.
    fn enter_blocked(self: &Arc<Self>, role: ThreadRole) -> ScopeGuard<'_, impl FnOnce() + '_> {
        let pool = role.worker_type().map(|kind| {
            let pool = self.pool(kind);
            pool.mark_blocked();

            let (primary, fallback) = role.ranges();
            if self.has_work(primary, fallback) && self.wake(kind, 1) > 0 {
                tracing::debug!(?kind, "woke replacement for blocked worker");
            }

            pool
        });

        ScopeGuard::new(move || {
            if let Some(pool) = pool {
                pool.mark_unblocked();
            }
        })
    }

    pub(crate) fn wait_for_group(self: &Arc<Self>, id: TaskGroupId) {
        if !id.is_valid() {
            return;
        }

        let role = self.role();

        loop {
            if self.help_executing(role, id) {
                continue;
            }

            let _blocked = self.enter_blocked(role);

            let mut state = self.state.lock();
            let Some(slot) = state.groups.get(id) else {
                return;
            };

            // Workers are gone, nobody would finish the group.
            if self.is_shutdown() {
                tracing::warn!(group = %id, "stopped waiting for group, task system shut down");
                return;
            }

            // Woken on completion, the timeout lets us look for new work to
            // help with.
            let finished = Arc::clone(&slot.finished);
            finished.wait_for(&mut state, self.cfg.wait_poll_interval);
        }
    }

    pub(crate) fn wait_for_condition<F>(self: &Arc<Self>, mut condition: F)
    where
        F: FnMut() -> bool,
    {
        let role = self.role();

        while !condition() {
            if self.help_executing(role, TaskGroupId::default()) {
                continue;
            }

            if self.is_shutdown() {
                return;
            }

            let _blocked = self.enter_blocked(role);
            thread::sleep(CONDITION_BACKOFF);
        }
    }

    // --- Cancellation ---

    /// Drops queued invocations matching `filter` without running their body,
    /// but still counts them as completed for their groups.
    fn discard_queued<F>(self: &Arc<Self>, filter: F)
    where
        F: Fn(&ScheduledTask) -> bool,
    {
        let discarded = self.state.lock().queues.drain_where(filter);

        for scheduled in discarded {
            // Canceled, so this only settles the counters.
            self.execute(scheduled);
        }
    }

    pub(crate) fn cancel_task(
        self: &Arc<Self>,
        task: &Arc<Task>,
        on_running: OnTaskRunning,
    ) -> Result<(), TaskSystemError> {
        task.cancel();
        self.discard_queued(|scheduled| Arc::ptr_eq(&scheduled.task, task));

        if !task.is_running() {
            return Ok(());
        }

        if on_running == OnTaskRunning::WaitTillFinished {
            self.wait_for_condition(|| !task.is_running());
        }

        Err(TaskSystemError::TaskRunning(task.name()))
    }

    pub(crate) fn cancel_group(
        self: &Arc<Self>,
        group: TaskGroupId,
        on_running: OnTaskRunning,
    ) -> Result<(), TaskSystemError> {
        let tasks: TaskList = match self.state.lock().groups.get(group) {
            Some(slot) => slot.tasks.clone(),
            None => return Ok(()),
        };

        for task in tasks.iter() {
            task.cancel();
        }

        self.discard_queued(|scheduled| scheduled.group == group);

        let running = tasks.iter().filter(|task| task.is_running()).count();
        if running == 0 {
            return Ok(());
        }

        if on_running == OnTaskRunning::WaitTillFinished {
            self.wait_for_condition(|| tasks.iter().all(|task| !task.is_running()));
        }

        Err(TaskSystemError::GroupRunning { group, running })
    }
}
