use crate::task::WorkerThreadType;
use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, Thread};
use std::time::Duration;

/// Utilization of a worker thread during the last frame.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ThreadUtilization {
    /// Fraction of the frame spent executing tasks, in `[0, 1]`.
    pub utilization: f64,
    pub tasks_executed: u32,
}

/// Per worker data shared between the worker thread and the scheduler.
#[derive(Debug)]
pub(crate) struct WorkerSlot {
    pub(crate) index: usize,

    /// Set by whoever unparks the worker, spurious wakeups leave it false.
    should_unpark: AtomicBool,

    busy_nanos: AtomicU64,

    tasks_executed: AtomicU32,

    last_frame: Mutex<ThreadUtilization>,
}

impl WorkerSlot {
    fn new(index: usize) -> Self {
        Self {
            index,
            should_unpark: AtomicBool::new(false),
            busy_nanos: AtomicU64::new(0),
            tasks_executed: AtomicU32::new(0),
            last_frame: Mutex::new(ThreadUtilization::default()),
        }
    }

    pub(crate) fn record_task(&self, busy: Duration) {
        let nanos = u64::try_from(busy.as_nanos()).unwrap_or(u64::MAX);
        self.busy_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);
    }

    /// Closes the current measurement window of length `frame`.
    pub(crate) fn end_frame(&self, frame: Duration) {
        let busy = self.busy_nanos.swap(0, Ordering::Relaxed);
        let tasks_executed = self.tasks_executed.swap(0, Ordering::Relaxed);

        let utilization = if frame.is_zero() {
            0.0
        } else {
            (busy as f64 / frame.as_nanos() as f64).min(1.0)
        };

        *self.last_frame.lock() = ThreadUtilization {
            utilization,
            tasks_executed,
        };
    }

    pub(crate) fn utilization(&self) -> ThreadUtilization {
        *self.last_frame.lock()
    }
}

#[derive(Debug)]
struct ParkedWorker {
    slot: Arc<WorkerSlot>,
    thread: Thread,
}

impl ParkedWorker {
    fn unpark(self) {
        self.slot.should_unpark.store(true, Ordering::Release);
        self.thread.unpark();
    }
}

/// Threads of one worker category.
///
/// A worker is either parked (idle), blocked (waiting on a group from inside
/// a task) or running. At most `max_active` workers should be running at any
/// time, blocked workers don't count, which is what lets the pool allocate
/// replacements for them.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    pub(crate) kind: WorkerThreadType,

    max_active: AtomicUsize,

    allocated: AtomicUsize,

    blocked: AtomicUsize,

    /// LIFO, the last parked thread has the hottest cache.
    parked: Mutex<Vec<ParkedWorker>>,

    slots: RwLock<Vec<Arc<WorkerSlot>>>,

    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub(crate) fn new(kind: WorkerThreadType, max_active: usize) -> Self {
        Self {
            kind,
            max_active: AtomicUsize::new(max_active),
            allocated: AtomicUsize::new(0),
            blocked: AtomicUsize::new(0),
            parked: Mutex::new(Vec::with_capacity(max_active)),
            slots: RwLock::new(Vec::with_capacity(max_active)),
            handles: Mutex::new(Vec::with_capacity(max_active)),
        }
    }

    pub(crate) fn max_active(&self) -> usize {
        self.max_active.load(Ordering::Acquire)
    }

    pub(crate) fn set_max_active(&self, val: usize) {
        self.max_active.store(val, Ordering::Release);
    }

    pub(crate) fn num_allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    pub(crate) fn num_blocked(&self) -> usize {
        self.blocked.load(Ordering::Acquire)
    }

    pub(crate) fn num_parked(&self) -> usize {
        self.parked.lock().len()
    }

    fn running_unblocked(&self, parked: usize) -> usize {
        self.num_allocated()
            .saturating_sub(parked + self.num_blocked())
    }

    pub(crate) fn mark_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn mark_unblocked(&self) {
        self.blocked.fetch_sub(1, Ordering::AcqRel);
    }

    /// Reserves a slot for a new worker thread.
    pub(crate) fn register_worker(&self) -> Arc<WorkerSlot> {
        let mut slots = self.slots.write();
        let slot = Arc::new(WorkerSlot::new(slots.len()));
        slots.push(Arc::clone(&slot));
        self.allocated.fetch_add(1, Ordering::AcqRel);
        slot
    }

    /// Undoes [`WorkerPool::register_worker`] when the thread failed to spawn.
    pub(crate) fn unregister_worker(&self, slot: &Arc<WorkerSlot>) {
        let mut slots = self.slots.write();
        if let Some(pos) = slots.iter().position(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(pos);
            self.allocated.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn push_handle(&self, handle: thread::JoinHandle<()>) {
        self.handles.lock().push(handle);
    }

    pub(crate) fn slot(&self, index: usize) -> Option<Arc<WorkerSlot>> {
        self.slots.read().get(index).cloned()
    }

    pub(crate) fn for_each_slot(&self, mut f: impl FnMut(&WorkerSlot)) {
        for slot in self.slots.read().iter() {
            f(slot);
        }
    }

    /// Wakes up to `wanted` parked workers, as long as fewer than `max_active`
    /// workers are running. Calls `spawn` when a worker should run but none is
    /// parked, as long as the pool has not allocated `max_allocated` threads.
    ///
    /// Returns how many workers were woken or spawned.
    pub(crate) fn wake<F>(&self, wanted: usize, max_allocated: usize, mut spawn: F) -> usize
    where
        F: FnMut() -> Result<()>,
    {
        let mut parked = self.parked.lock();
        let mut woken = 0;

        while woken < wanted && self.running_unblocked(parked.len()) < self.max_active() {
            if let Some(worker) = parked.pop() {
                worker.unpark();
            } else if self.num_allocated() < max_allocated {
                if let Err(e) = spawn() {
                    tracing::error!(kind = ?self.kind, error = %e, "failed to allocate worker thread");
                    break;
                }
            } else {
                tracing::warn!(
                    kind = ?self.kind,
                    allocated = self.num_allocated(),
                    "worker allocation cap reached, can't replace blocked workers"
                );
                break;
            }

            woken += 1;
        }

        woken
    }

    /// Parks the calling worker until it gets woken again.
    ///
    /// `keep_running` is evaluated while holding the parked lock. Wakers
    /// take that lock too, so a worker never misses a wakeup between checking
    /// for work and parking.
    pub(crate) fn park<F>(&self, slot: &Arc<WorkerSlot>, keep_running: F)
    where
        F: FnOnce(bool) -> bool,
    {
        {
            let mut parked = self.parked.lock();

            let over_budget = self.running_unblocked(parked.len()) > self.max_active();
            if keep_running(over_budget) {
                return;
            }

            slot.should_unpark.store(false, Ordering::Release);
            parked.push(ParkedWorker {
                slot: Arc::clone(slot),
                thread: thread::current(),
            });
        }

        tracing::trace!(kind = ?self.kind, index = slot.index, "worker parked");

        // Account for spurious wakeups.
        while !slot.should_unpark.load(Ordering::Acquire) {
            thread::park();
        }

        tracing::trace!(kind = ?self.kind, index = slot.index, "worker unparked");
    }

    pub(crate) fn unpark_all(&self) -> usize {
        let mut parked = self.parked.lock();
        let num_unparked = parked.len();

        for worker in parked.drain(..) {
            worker.unpark();
        }

        num_unparked
    }

    /// True if more workers are running than allowed.
    pub(crate) fn is_over_budget(&self) -> bool {
        self.running_unblocked(self.num_parked()) > self.max_active()
    }

    /// Joins every worker thread, returns how many of them panicked.
    pub(crate) fn join_all(&self) -> usize {
        let handles = std::mem::take(&mut *self.handles.lock());

        handles
            .into_iter()
            .filter_map(|handle| handle.join().err())
            .count()
    }
}
