use crate::runtime::{Shared, TaskSystem};
use crate::task::WorkerThreadType;
use crate::utils::ThreadNameFn;
use anyhow::{Result, anyhow};
use std::convert::TryFrom;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// 40 FPS.
const TARGET_FRAME_TIME: Duration = Duration::from_millis(25);

/// Upper bound of `SomeFrameMainThread` tasks executed by one frame drain.
const SOME_FRAME_TASKS_PER_FRAME: u32 = 8;

/// Frames in a row above the target frame time after which one
/// `SomeFrameMainThread` task is executed anyway.
const STARVED_FRAMES_BEFORE_PROGRESS: u32 = 10;

/// Hard cap of threads a single category may ever allocate, including the
/// replacements spawned for blocked workers.
const MAX_ALLOCATED_WORKERS: usize = 64;

/// Long and file workers mostly wait, there is no point in matching the core
/// count.
const LONG_TASK_WORKERS: usize = 2;
const FILE_ACCESS_WORKERS: usize = 1;

/// How long a group wait sleeps before looking for new work to help with.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Short task workers default to one per core, minus the main thread, within
/// `[2, 8]`.
fn default_short_task_workers() -> Result<usize> {
    let cores = thread::available_parallelism()?.get();
    Ok(cores.saturating_sub(1).clamp(2, 8))
}

#[derive(Debug)]
pub struct Builder {
    /// Concurrently active short task workers. Defaults to the number of cores
    /// minus one, clamped to `[2, 8]`.
    short_task_workers: Option<usize>,

    /// Concurrently active long task workers.
    long_task_workers: usize,

    /// Threads a category may allocate at most, parked and blocked ones
    /// included.
    max_allocated_workers: usize,

    /// Name fn used for worker threads.
    thread_name: ThreadNameFn,

    /// Stack size used for worker threads.
    thread_stack_size: Option<usize>,

    /// Frame time `finish_frame_tasks` tries to stay under.
    target_frame_time: Duration,

    some_frame_tasks_per_frame: u32,

    starved_frames_before_progress: u32,

    wait_poll_interval: Duration,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            short_task_workers: None,
            long_task_workers: LONG_TASK_WORKERS,
            max_allocated_workers: MAX_ALLOCATED_WORKERS,
            thread_name: ThreadNameFn::default(),
            thread_stack_size: None,
            target_frame_time: TARGET_FRAME_TIME,
            some_frame_tasks_per_frame: SOME_FRAME_TASKS_PER_FRAME,
            starved_frames_before_progress: STARVED_FRAMES_BEFORE_PROGRESS,
            wait_poll_interval: WAIT_POLL_INTERVAL,
        }
    }

    #[track_caller]
    pub fn short_task_workers(mut self, val: usize) -> Self {
        assert!(val > 0, "short_task_workers must be greater than 0");
        self.short_task_workers = Some(val);
        self
    }

    #[track_caller]
    pub fn long_task_workers(mut self, val: usize) -> Self {
        assert!(val > 0, "long_task_workers must be greater than 0");
        self.long_task_workers = val;
        self
    }

    /// Blocked workers get replaced by fresh threads, up to this many threads
    /// per category.
    #[track_caller]
    pub fn max_allocated_workers(mut self, val: usize) -> Self {
        assert!(val > 0, "max_allocated_workers must be greater than 0");
        self.max_allocated_workers = val;
        self
    }

    /// Sets a function used to generate the name of worker threads from their
    /// category and index.
    ///
    /// The default yields "tasklane-{short|long|file}-{index}".
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(WorkerThreadType, usize) -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    #[track_caller]
    pub fn target_frame_time(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "target_frame_time must be greater than 0");
        self.target_frame_time = val;
        self
    }

    pub fn some_frame_tasks_per_frame(mut self, val: u32) -> Self {
        self.some_frame_tasks_per_frame = val;
        self
    }

    #[track_caller]
    pub fn starved_frames_before_progress(mut self, val: u32) -> Self {
        assert!(val > 0, "starved_frames_before_progress must be greater than 0");
        self.starved_frames_before_progress = val;
        self
    }

    #[track_caller]
    pub fn wait_poll_interval(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "wait_poll_interval must be greater than 0");
        self.wait_poll_interval = val;
        self
    }

    /// Creates the task system and starts its worker threads.
    ///
    /// The calling thread becomes the main thread of the system.
    pub fn try_build(self) -> Result<TaskSystem> {
        let cfg = TaskSystemConfig::try_from(self)?;
        let shared = Arc::new(Shared::new(cfg));

        shared.spawn_initial_workers()?;

        Ok(TaskSystem::new(shared))
    }
}

// Builder exported as an immutable config, consumed by the shared scheduler
// state and the worker threads.
#[derive(Debug, Clone)]
pub(crate) struct TaskSystemConfig {
    pub(crate) short_task_workers: usize,
    pub(crate) long_task_workers: usize,
    pub(crate) file_access_workers: usize,
    pub(crate) max_allocated_workers: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) target_frame_time: Duration,
    pub(crate) some_frame_tasks_per_frame: u32,
    pub(crate) starved_frames_before_progress: u32,
    pub(crate) wait_poll_interval: Duration,
}

impl TaskSystemConfig {
    fn validate(&self) -> Result<()> {
        let largest = self
            .short_task_workers
            .max(self.long_task_workers)
            .max(self.file_access_workers);

        if largest > self.max_allocated_workers {
            return Err(anyhow!(
                "max_allocated_workers ({}) is lower than the number of active workers ({}) \
                 requested for a single category",
                self.max_allocated_workers,
                largest
            ));
        }

        Ok(())
    }

    /// Configured number of concurrently active workers of a category.
    pub(crate) fn workers(&self, kind: WorkerThreadType) -> usize {
        match kind {
            WorkerThreadType::ShortTasks => self.short_task_workers,
            WorkerThreadType::LongTasks => self.long_task_workers,
            WorkerThreadType::FileAccess => self.file_access_workers,
        }
    }

    pub(crate) fn default_workers(kind: WorkerThreadType) -> Result<usize> {
        match kind {
            WorkerThreadType::ShortTasks => default_short_task_workers(),
            WorkerThreadType::LongTasks => Ok(LONG_TASK_WORKERS),
            WorkerThreadType::FileAccess => Ok(FILE_ACCESS_WORKERS),
        }
    }
}

impl TryFrom<Builder> for TaskSystemConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let short_task_workers = match builder.short_task_workers {
            Some(val) => val,
            None => default_short_task_workers()?,
        };

        let cfg = TaskSystemConfig {
            short_task_workers,
            long_task_workers: builder.long_task_workers,
            file_access_workers: FILE_ACCESS_WORKERS,
            max_allocated_workers: builder.max_allocated_workers,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            target_frame_time: builder.target_frame_time,
            some_frame_tasks_per_frame: builder.some_frame_tasks_per_frame,
            starved_frames_before_progress: builder.starved_frames_before_progress,
            wait_poll_interval: builder.wait_poll_interval,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}
