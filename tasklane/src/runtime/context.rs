use crate::task::{PriorityRange, WorkerThreadType};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SYSTEM_ID: AtomicU64 = AtomicU64::new(1);

/// Unique per task system, so worker threads of one system are not mistaken
/// for workers of another one living in the same process.
pub(crate) fn next_system_id() -> u64 {
    NEXT_SYSTEM_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy)]
struct WorkerInfo {
    system: u64,
    kind: WorkerThreadType,
    index: usize,
}

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerInfo>> = const { Cell::new(None) };
}

/// Called once by every worker thread before it enters its loop.
pub(crate) fn set_current_worker(system: u64, kind: WorkerThreadType, index: usize) {
    CURRENT_WORKER.with(|current| {
        current.set(Some(WorkerInfo {
            system,
            kind,
            index,
        }))
    });
}

/// What the calling thread is to a given task system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThreadRole {
    /// The thread that built the system. It is the only one executing main
    /// thread priorities.
    Main,
    Worker {
        kind: WorkerThreadType,
        index: usize,
    },
    Other,
}

impl ThreadRole {
    pub(crate) fn current(system: u64, is_main: bool) -> Self {
        if is_main {
            return ThreadRole::Main;
        }

        match CURRENT_WORKER.with(Cell::get) {
            Some(info) if info.system == system => ThreadRole::Worker {
                kind: info.kind,
                index: info.index,
            },
            _ => ThreadRole::Other,
        }
    }

    /// The priorities this thread may execute, most important range first.
    pub(crate) fn ranges(self) -> (PriorityRange, Option<PriorityRange>) {
        match self {
            ThreadRole::Main => (PriorityRange::MAIN_THREAD, Some(PriorityRange::SHORT)),
            ThreadRole::Worker { kind, .. } => match kind {
                WorkerThreadType::ShortTasks => (PriorityRange::SHORT, None),
                WorkerThreadType::LongTasks => (PriorityRange::LONG, Some(PriorityRange::SHORT)),
                WorkerThreadType::FileAccess => (PriorityRange::FILE, None),
            },
            ThreadRole::Other => (PriorityRange::SHORT, None),
        }
    }

    pub(crate) fn worker_type(self) -> Option<WorkerThreadType> {
        match self {
            ThreadRole::Worker { kind, .. } => Some(kind),
            ThreadRole::Main | ThreadRole::Other => None,
        }
    }
}
