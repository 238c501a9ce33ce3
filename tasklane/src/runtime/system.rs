use crate::errors::TaskSystemError;
use crate::group::{Expect, OnGroupFinished};
use crate::runtime::{Builder, FrameStats, Shared, TaskSystemConfig, ThreadUtilization};
use crate::task::{Task, TaskGroupId, TaskPriority, WorkerThreadType};
use anyhow::Result;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

/// What cancellation does about invocations that are already executing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OnTaskRunning {
    /// Block until the running invocations returned.
    #[default]
    WaitTillFinished,
    ReturnWithoutBlocking,
}

/// Cheap, cloneable access to a task system.
///
/// Can be moved into task bodies to create and wait on further work. The
/// workers keep running until the owning [`TaskSystem`] shuts down.
#[derive(Clone)]
pub struct Handle(pub(crate) Arc<Shared>);

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("id", &self.0.id).finish()
    }
}

impl Handle {
    /// Creates a group for one-time use. All its tasks run with `priority`.
    /// `on_finished` runs once all tasks are done, before dependent groups are
    /// scheduled.
    pub fn create_task_group(
        &self,
        priority: TaskPriority,
        on_finished: Option<OnGroupFinished>,
    ) -> TaskGroupId {
        self.0.create_group(priority, on_finished)
    }

    /// Adds a task to a group that has not been started yet.
    ///
    /// # Panics
    ///
    /// In debug builds, if the task is still in use by another group, or if
    /// the group was started already.
    #[track_caller]
    pub fn add_task_to_group(&self, group: TaskGroupId, task: &Arc<Task>) {
        self.0.add_task(group, task);
    }

    /// `group` will not be scheduled before `depends_on` has finished.
    /// Depending on a group that finished already is a no-op.
    #[track_caller]
    pub fn add_task_group_dependency(&self, group: TaskGroupId, depends_on: TaskGroupId) {
        self.0.add_dependencies(&[(group, depends_on)]);
    }

    /// Same as [`Handle::add_task_group_dependency`] for many `(group,
    /// depends_on)` pairs, under a single lock.
    #[track_caller]
    pub fn add_task_group_dependency_batch(&self, batch: &[(TaskGroupId, TaskGroupId)]) {
        self.0.add_dependencies(batch);
    }

    /// After this the group can't be modified anymore. Its tasks get queued as
    /// soon as all dependencies finished.
    #[track_caller]
    pub fn start_task_group(&self, group: TaskGroupId) {
        self.0.start_groups(&[group]);
    }

    #[track_caller]
    pub fn start_task_group_batch(&self, batch: &[TaskGroupId]) {
        self.0.start_groups(batch);
    }

    /// Puts `task` in a group of its own and starts it.
    #[track_caller]
    pub fn start_single_task(&self, task: &Arc<Task>, priority: TaskPriority) -> TaskGroupId {
        self.start_single_task_with_dependency(task, priority, TaskGroupId::default())
    }

    /// Like [`Handle::start_single_task`], the task only runs after
    /// `dependency` has finished.
    #[track_caller]
    pub fn start_single_task_with_dependency(
        &self,
        task: &Arc<Task>,
        priority: TaskPriority,
        dependency: TaskGroupId,
    ) -> TaskGroupId {
        let group = self.create_task_group(priority, None);
        self.add_task_to_group(group, task);

        if dependency.is_valid() {
            self.add_task_group_dependency(group, dependency);
        }

        self.start_task_group(group);
        group
    }

    /// Works with handles of any age, finished groups stay finished.
    pub fn is_task_group_finished(&self, group: TaskGroupId) -> bool {
        self.0.is_group_finished(group)
    }

    /// Blocks until `group` finished. Returns immediately for stale handles.
    ///
    /// While waiting, the calling thread executes tasks of `group` and tasks
    /// that never wait themselves. A worker thread that has nothing to help
    /// with is counted as blocked, which allows another worker of its
    /// category to run in its place.
    pub fn wait_for_group(&self, group: TaskGroupId) {
        self.0.wait_for_group(group);
    }

    /// Blocks until `condition` returns true, helping with tasks that never
    /// wait in the meantime. Prefer [`Handle::wait_for_group`] where possible.
    pub fn wait_for_condition<F>(&self, condition: F)
    where
        F: FnMut() -> bool,
    {
        self.0.wait_for_condition(condition);
    }

    /// Prevents queued invocations of `task` from running.
    ///
    /// Succeeds if nothing of the task is executing (anymore). Invocations that
    /// are executing are not interrupted, their body can poll
    /// [`TaskContext::is_canceled`](crate::task::TaskContext::is_canceled). In
    /// that case [`TaskSystemError::TaskRunning`] is returned, after they
    /// returned if `on_running` says so.
    pub fn cancel_task(
        &self,
        task: &Arc<Task>,
        on_running: OnTaskRunning,
    ) -> Result<(), TaskSystemError> {
        self.0.cancel_task(task, on_running)
    }

    /// Cancels every task of `group`, see [`Handle::cancel_task`]. The group
    /// still finishes, and its dependents still run.
    pub fn cancel_group(
        &self,
        group: TaskGroupId,
        on_running: OnTaskRunning,
    ) -> Result<(), TaskSystemError> {
        self.0.cancel_group(group, on_running)
    }

    /// Frame time `finish_frame_tasks` tries not to exceed. Defaults to 25ms.
    pub fn set_target_frame_time(&self, target: Duration) {
        self.0.set_target_frame_time(target);
    }

    /// Call once per frame from the main thread.
    ///
    /// Promotes next-frame tasks to this frame, executes all
    /// `ThisFrameMainThread` tasks and helps with whatever this-frame work is
    /// still queued. Then `SomeFrameMainThread` tasks are executed for as long
    /// as the frame stays under the target frame time. If the frame time
    /// stays above target, one of them runs every few frames regardless.
    ///
    /// Afterwards all `ThisFrameMainThread` tasks are finished, this-frame tasks
    /// are either finished or executing on some worker.
    pub fn finish_frame_tasks(&self) -> FrameStats {
        self.0.finish_frame_tasks()
    }

    /// Sets how many workers of each category may run at the same time.
    /// `None` restores the default for that category.
    pub fn set_worker_thread_count(
        &self,
        short_tasks: Option<usize>,
        long_tasks: Option<usize>,
    ) -> Result<()> {
        for (kind, count) in [
            (WorkerThreadType::ShortTasks, short_tasks),
            (WorkerThreadType::LongTasks, long_tasks),
        ] {
            let count = match count {
                Some(count) => count,
                None => TaskSystemConfig::default_workers(kind)?,
            };

            self.0.set_worker_thread_count(kind, count);
        }

        Ok(())
    }

    /// Maximum number of workers of a category that run at the same time.
    pub fn worker_thread_count(&self, kind: WorkerThreadType) -> usize {
        self.0.pool(kind).max_active()
    }

    /// Threads allocated for a category. Grows beyond
    /// [`Handle::worker_thread_count`] when workers block inside tasks.
    pub fn num_allocated_worker_threads(&self, kind: WorkerThreadType) -> usize {
        self.0.pool(kind).num_allocated()
    }

    /// Utilization of a worker during the last frame. Only meaningful if
    /// [`Handle::finish_frame_tasks`] is called once per frame.
    pub fn thread_utilization(&self, kind: WorkerThreadType, index: usize) -> Option<ThreadUtilization> {
        self.0.pool(kind).slot(index).map(|slot| slot.utilization())
    }

    /// Category of the calling thread, `None` unless it is a worker of this
    /// system.
    pub fn current_thread_worker_type(&self) -> Option<WorkerThreadType> {
        self.0.role().worker_type()
    }

    /// Asserts that `group` is live and started (or not). Compiled out in
    /// release builds.
    #[track_caller]
    pub fn debug_check_task_group(&self, group: TaskGroupId, started: bool) {
        let expect = if started {
            Expect::Started
        } else {
            Expect::NotStarted
        };

        self.0.debug_check_group(group, expect);
    }
}

/// Owns the worker threads. Dereferences to a [`Handle`].
///
/// The thread building the task system becomes its main thread, the only one
/// executing `ThisFrameMainThread` and `SomeFrameMainThread` tasks.
#[derive(Debug)]
pub struct TaskSystem {
    handle: Handle,
}

impl TaskSystem {
    pub(super) fn new(shared: Arc<Shared>) -> Self {
        Self {
            handle: Handle(shared),
        }
    }

    /// A task system with default settings.
    pub fn try_new() -> Result<Self> {
        Builder::new().try_build()
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Stops and joins all workers. Queued tasks are dropped without running.
    pub fn shutdown(self) -> Result<()> {
        self.shutdown_inner()
    }

    fn shutdown_inner(&self) -> Result<()> {
        Ok(self.handle.0.shutdown()?)
    }
}

impl Deref for TaskSystem {
    type Target = Handle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for TaskSystem {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown_inner() {
            tracing::error!(error = %e, "error during task system shutdown");
        }
    }
}
