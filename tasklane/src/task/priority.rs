use std::fmt;
use std::ops::RangeInclusive;

/// Describes when a task has to be finished.
///
/// Priorities are ordered: inside the range of work a thread is allowed to
/// execute, lower values are dequeued first. Tasks of equal priority are
/// dequeued in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TaskPriority {
    /// Highest priority, guaranteed to get finished in this frame.
    EarlyThisFrame = 0,
    /// Medium priority, guaranteed to get finished in this frame.
    ThisFrame,
    /// Low priority, guaranteed to get finished in this frame.
    LateThisFrame,
    /// Highest priority in the next frame, promoted to `EarlyThisFrame` by
    /// the next frame drain.
    EarlyNextFrame,
    /// Promoted to `ThisFrame` by the next frame drain.
    NextFrame,
    /// Promoted to `LateThisFrame` by the next frame drain.
    LateNextFrame,
    /// Needs to finish within a couple of frames, never promoted.
    InNFrames,
    LongRunningHighPriority,
    /// Work that may take several frames, executed by the long task workers.
    LongRunning,
    FileAccessHighPriority,
    /// Work that is bound by file access, executed by the file access worker.
    FileAccess,
    /// Executed by the main thread during the frame drain, always completed.
    ThisFrameMainThread,
    /// Executed by the main thread during the frame drain, as long as the
    /// frame stays under the target frame time.
    SomeFrameMainThread,
}

impl TaskPriority {
    pub const COUNT: usize = 13;

    pub const ALL: [TaskPriority; Self::COUNT] = [
        TaskPriority::EarlyThisFrame,
        TaskPriority::ThisFrame,
        TaskPriority::LateThisFrame,
        TaskPriority::EarlyNextFrame,
        TaskPriority::NextFrame,
        TaskPriority::LateNextFrame,
        TaskPriority::InNFrames,
        TaskPriority::LongRunningHighPriority,
        TaskPriority::LongRunning,
        TaskPriority::FileAccessHighPriority,
        TaskPriority::FileAccess,
        TaskPriority::ThisFrameMainThread,
        TaskPriority::SomeFrameMainThread,
    ];

    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }

    /// The category of worker threads responsible for this priority, `None`
    /// for main thread priorities.
    pub fn worker_type(self) -> Option<WorkerThreadType> {
        use TaskPriority::*;

        match self {
            EarlyThisFrame | ThisFrame | LateThisFrame | EarlyNextFrame | NextFrame
            | LateNextFrame | InNFrames => Some(WorkerThreadType::ShortTasks),
            LongRunningHighPriority | LongRunning => Some(WorkerThreadType::LongTasks),
            FileAccessHighPriority | FileAccess => Some(WorkerThreadType::FileAccess),
            ThisFrameMainThread | SomeFrameMainThread => None,
        }
    }

    /// The priority a next-frame task is promoted to when a frame ends.
    pub(crate) fn promoted(self) -> Option<TaskPriority> {
        match self {
            TaskPriority::EarlyNextFrame => Some(TaskPriority::EarlyThisFrame),
            TaskPriority::NextFrame => Some(TaskPriority::ThisFrame),
            TaskPriority::LateNextFrame => Some(TaskPriority::LateThisFrame),
            _ => None,
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Categories of worker threads. Every category has its own pool and its own
/// limit of concurrently active threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkerThreadType {
    ShortTasks,
    LongTasks,
    FileAccess,
}

impl WorkerThreadType {
    pub const COUNT: usize = 3;

    pub const ALL: [WorkerThreadType; Self::COUNT] = [
        WorkerThreadType::ShortTasks,
        WorkerThreadType::LongTasks,
        WorkerThreadType::FileAccess,
    ];

    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub(crate) fn label(self) -> &'static str {
        match self {
            WorkerThreadType::ShortTasks => "short",
            WorkerThreadType::LongTasks => "long",
            WorkerThreadType::FileAccess => "file",
        }
    }
}

/// A contiguous range of priorities, scanned from first to last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PriorityRange {
    pub(crate) first: TaskPriority,
    pub(crate) last: TaskPriority,
}

impl PriorityRange {
    pub(crate) const SHORT: PriorityRange =
        PriorityRange::new(TaskPriority::EarlyThisFrame, TaskPriority::InNFrames);

    pub(crate) const LONG: PriorityRange = PriorityRange::new(
        TaskPriority::LongRunningHighPriority,
        TaskPriority::LongRunning,
    );

    pub(crate) const FILE: PriorityRange =
        PriorityRange::new(TaskPriority::FileAccessHighPriority, TaskPriority::FileAccess);

    pub(crate) const MAIN_THREAD: PriorityRange = PriorityRange::new(
        TaskPriority::ThisFrameMainThread,
        TaskPriority::SomeFrameMainThread,
    );

    pub(crate) const THIS_FRAME: PriorityRange =
        PriorityRange::new(TaskPriority::EarlyThisFrame, TaskPriority::LateThisFrame);

    pub(crate) const fn new(first: TaskPriority, last: TaskPriority) -> Self {
        Self { first, last }
    }

    pub(crate) const fn single(priority: TaskPriority) -> Self {
        Self::new(priority, priority)
    }

    pub(crate) fn indices(&self) -> RangeInclusive<usize> {
        self.first.index()..=self.last.index()
    }
}

impl From<WorkerThreadType> for PriorityRange {
    fn from(kind: WorkerThreadType) -> Self {
        match kind {
            WorkerThreadType::ShortTasks => PriorityRange::SHORT,
            WorkerThreadType::LongTasks => PriorityRange::LONG,
            WorkerThreadType::FileAccess => PriorityRange::FILE,
        }
    }
}
