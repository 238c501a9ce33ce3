use crate::runtime::{Builder, Handle, TaskSystem};
use crate::task::{Task, TaskGroupId, TaskPriority};
use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub(crate) fn init_task_system(
    short_workers: usize,
    long_workers: usize,
    builder: Option<Builder>,
) -> Result<TaskSystem> {
    builder
        .unwrap_or_default()
        .short_task_workers(short_workers)
        .long_task_workers(long_workers)
        .try_build()
}

/// A task counting how often its body ran.
pub(crate) fn counting_task(name: &str, multiplicity: u32) -> (Arc<Task>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let count_clone = Arc::clone(&count);

    let task = Task::with_multiplicity(name, multiplicity, move |_| {
        count_clone.fetch_add(1, Ordering::SeqCst);
    });

    (Arc::new(task), count)
}

/// Wall-clock start and end of labelled units of work.
#[derive(Debug, Clone, Default)]
pub(crate) struct Timeline {
    spans: Arc<Mutex<Vec<(Arc<str>, Instant, Instant)>>>,
}

impl Timeline {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Runs `f` and stores when it started and ended under `label`.
    pub(crate) fn record<R>(&self, label: &str, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let res = f();
        self.spans.lock().push((label.into(), start, Instant::now()));
        res
    }

    /// A task that sleeps for `busy` and records itself under `label`.
    pub(crate) fn task(&self, label: &str, busy: Duration) -> Arc<Task> {
        let timeline = self.clone();
        let label: Arc<str> = label.into();

        Arc::new(Task::new(Arc::clone(&label), move |_| {
            timeline.record(&label, || std::thread::sleep(busy));
        }))
    }

    pub(crate) fn spans_of(&self, label: &str) -> Vec<(Instant, Instant)> {
        self.spans
            .lock()
            .iter()
            .filter(|(l, ..)| &**l == label)
            .map(|(_, start, end)| (*start, *end))
            .collect()
    }

    /// Asserts every span of `first` ended before any span of `then` started.
    #[track_caller]
    pub(crate) fn assert_before(&self, first: &str, then: &str) {
        let first_spans = self.spans_of(first);
        let then_spans = self.spans_of(then);
        assert!(!first_spans.is_empty(), "nothing recorded for `{first}`");
        assert!(!then_spans.is_empty(), "nothing recorded for `{then}`");

        let last_end = first_spans.iter().map(|(_, end)| *end).max();
        let first_start = then_spans.iter().map(|(start, _)| *start).min();
        assert!(last_end <= first_start, "`{first}` overlaps with `{then}`");
    }

    pub(crate) fn len(&self) -> usize {
        self.spans.lock().len()
    }
}

/// Keeps every thread that passes it blocked until it gets opened.
#[derive(Debug, Default)]
pub(crate) struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
    entered: AtomicUsize,
}

impl Gate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn pass(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);

        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
    }

    #[track_caller]
    pub(crate) fn wait_entered(&self, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);

        while self.entered.load(Ordering::SeqCst) < n {
            assert!(Instant::now() < deadline, "only {} threads entered the gate", self.entered.load(Ordering::SeqCst));
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub(crate) fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }
}

/// Occupies the single short task and the single long task worker of
/// `system` until `gate` opens. Returns the groups of the two gate tasks.
///
/// The long task is queued first, long workers prefer their own category, so
/// each worker ends up in a different gate task.
pub(crate) fn occupy_workers(system: &Handle, gate: &Arc<Gate>) -> [TaskGroupId; 2] {
    let gate_task = |name: &str| {
        let gate = Arc::clone(gate);
        Arc::new(Task::new(name, move |_| gate.pass()))
    };

    let long = system.start_single_task(&gate_task("long-gate"), TaskPriority::LongRunning);
    let short = system.start_single_task(&gate_task("short-gate"), TaskPriority::EarlyThisFrame);

    gate.wait_entered(2);
    [long, short]
}
