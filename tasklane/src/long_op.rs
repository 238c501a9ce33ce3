//! Operations that take many frames, such as baking navigation data, run on
//! the long task workers and report their progress.

use crate::errors::LongOpError;
use crate::runtime::{Handle, OnTaskRunning};
use crate::task::{Task, TaskGroupId, TaskPriority};
use anyhow::anyhow;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Work executed by [`start_long_op`].
pub trait LongOp: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Does the actual work. Should call [`LongOpProgress::report`] regularly
    /// and return once it reports cancellation.
    fn execute(&self, progress: &LongOpProgress) -> anyhow::Result<()>;
}

/// Called with the new completion in `[0, 1]` whenever the operation reports
/// progress. Runs on the thread executing the operation.
pub type OnProgress = Box<dyn Fn(f32) + Send + Sync + 'static>;

/// How a long operation ended.
#[derive(Debug)]
pub enum LongOpOutcome {
    Succeeded,
    Failed(anyhow::Error),
    Canceled,
}

struct LongOpState {
    name: Arc<str>,

    /// `f32` bits of the last reported completion.
    completion: AtomicU32,

    canceled: AtomicBool,

    on_progress: Option<OnProgress>,

    outcome: Mutex<Option<LongOpOutcome>>,
}

impl LongOpState {
    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    fn completion(&self) -> f32 {
        f32::from_bits(self.completion.load(Ordering::Acquire))
    }
}

/// Progress reporting for a running [`LongOp`].
pub struct LongOpProgress {
    state: Arc<LongOpState>,
}

impl LongOpProgress {
    /// Records `completion`, clamped to `[0, 1]`.
    ///
    /// # Errors
    ///
    /// [`LongOpError::Canceled`] once the operation got canceled, which the
    /// operation can propagate with `?`.
    pub fn report(&self, completion: f32) -> Result<(), LongOpError> {
        let completion = if completion.is_nan() {
            0.0
        } else {
            completion.clamp(0.0, 1.0)
        };

        self.state
            .completion
            .store(completion.to_bits(), Ordering::Release);

        if let Some(on_progress) = &self.state.on_progress {
            on_progress(completion);
        }

        if self.is_canceled() {
            return Err(LongOpError::Canceled(Arc::clone(&self.state.name)));
        }

        Ok(())
    }

    pub fn is_canceled(&self) -> bool {
        self.state.is_canceled()
    }
}

impl fmt::Debug for LongOpProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LongOpProgress")
            .field("name", &self.state.name)
            .field("completion", &self.state.completion())
            .finish()
    }
}

/// Starts `op` as a [`TaskPriority::LongRunning`] task.
pub fn start_long_op(
    system: &Handle,
    op: Arc<dyn LongOp>,
    on_progress: Option<OnProgress>,
) -> LongOpHandle {
    let state = Arc::new(LongOpState {
        name: op.name().into(),
        completion: AtomicU32::new(0.0f32.to_bits()),
        canceled: AtomicBool::new(false),
        on_progress,
        outcome: Mutex::new(None),
    });

    let task_state = Arc::clone(&state);
    let task = Arc::new(Task::new(Arc::clone(&state.name), move |_| {
        let progress = LongOpProgress {
            state: Arc::clone(&task_state),
        };

        let outcome = match op.execute(&progress) {
            Ok(()) => {
                task_state
                    .completion
                    .store(1.0f32.to_bits(), Ordering::Release);
                LongOpOutcome::Succeeded
            }
            Err(e) if task_state.is_canceled() || e.downcast_ref::<LongOpError>().is_some() => {
                LongOpOutcome::Canceled
            }
            Err(e) => {
                tracing::warn!(op = %task_state.name, error = %e, "long operation failed");
                LongOpOutcome::Failed(e)
            }
        };

        *task_state.outcome.lock() = Some(outcome);
    }));

    let group = system.start_single_task(&task, TaskPriority::LongRunning);
    tracing::debug!(op = %state.name, %group, "started long operation");

    LongOpHandle {
        system: system.clone(),
        task,
        group,
        state,
    }
}

/// Controls a long operation started with [`start_long_op`].
pub struct LongOpHandle {
    system: Handle,
    task: Arc<Task>,
    group: TaskGroupId,
    state: Arc<LongOpState>,
}

impl LongOpHandle {
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Last reported completion in `[0, 1]`.
    pub fn progress(&self) -> f32 {
        self.state.completion()
    }

    /// Group to depend on or wait for.
    pub fn group(&self) -> TaskGroupId {
        self.group
    }

    /// Requests cancellation. Does not block. If the operation hasn't started
    /// yet it never will, otherwise it learns about it with its next progress
    /// report.
    pub fn cancel(&self) {
        self.state.canceled.store(true, Ordering::Release);

        // Still running is the common case, the operation polls the flag.
        let _ = self
            .system
            .cancel_task(&self.task, OnTaskRunning::ReturnWithoutBlocking);
    }

    pub fn is_finished(&self) -> bool {
        self.system.is_task_group_finished(self.group)
    }

    /// Blocks until the operation ended.
    pub fn wait(self) -> LongOpOutcome {
        self.system.wait_for_group(self.group);

        match self.state.outcome.lock().take() {
            Some(outcome) => outcome,
            None if self.state.is_canceled() => LongOpOutcome::Canceled,
            None => LongOpOutcome::Failed(anyhow!("long operation `{}` panicked", self.state.name)),
        }
    }
}

impl fmt::Debug for LongOpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LongOpHandle")
            .field("name", &self.state.name)
            .field("group", &self.group)
            .field("progress", &self.progress())
            .finish()
    }
}
