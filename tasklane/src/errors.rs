use crate::task::TaskGroupId;
use crate::world::UpdatePhase;
use std::io;
use std::sync::Arc;

/// Errors surfaced by the task system.
#[derive(thiserror::Error, Debug)]
pub enum TaskSystemError {
    #[error("task `{0}` was already running and could not be prevented from executing")]
    TaskRunning(Arc<str>),

    #[error("{running} task(s) of group {group} were already running when it got canceled")]
    GroupRunning { group: TaskGroupId, running: usize },

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),

    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),

    /// A catch-all for any other type of unexpected error.
    #[error("An unexpected error occurred: {0}")]
    Other(#[from] anyhow::Error),
}

/// Errors surfaced by the world update scheduling.
#[derive(thiserror::Error, Debug)]
pub enum WorldError {
    #[error("update function `{name}` depends on unknown functions {missing:?} in phase {phase:?}")]
    UnresolvedDependencies {
        name: Arc<str>,
        phase: UpdatePhase,
        missing: Vec<Arc<str>>,
    },

    #[error("update function `{0}` sets a granularity but only async functions can be batched")]
    GranularityOnSyncFunction(Arc<str>),

    #[error("async update function `{0}` can't depend on other functions")]
    AsyncFunctionWithDependencies(Arc<str>),

    #[error("update function `{0}` is already registered")]
    DuplicateFunction(Arc<str>),

    #[error("no module with id {0} in this world")]
    UnknownModule(usize),
}

/// Errors a long operation reports through its progress handle.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LongOpError {
    #[error("long operation `{0}` was canceled")]
    Canceled(Arc<str>),
}
