use crate::runtime::Shared;
use crate::runtime::context::{self, ThreadRole};
use crate::runtime::pool::WorkerSlot;
use crate::task::WorkerThreadType;
use std::sync::Arc;
use std::time::Instant;

/// Main loop of a worker thread.
///
/// Pulls the most urgent task of its category (falling back to short tasks for
/// long task workers), and parks when there is nothing to do or when more
/// workers of its category are running than allowed.
pub(crate) fn run_worker(shared: Arc<Shared>, kind: WorkerThreadType, slot: Arc<WorkerSlot>) {
    context::set_current_worker(shared.id, kind, slot.index);

    let role = ThreadRole::Worker {
        kind,
        index: slot.index,
    };
    let (primary, fallback) = role.ranges();
    let pool = shared.pool(kind);

    tracing::debug!(?kind, index = slot.index, "worker started");

    while !shared.is_shutdown() {
        if !pool.is_over_budget()
            && let Some(scheduled) = shared.pop_task(role, None)
        {
            let start = Instant::now();
            shared.execute(scheduled);
            slot.record_task(start.elapsed());
            continue;
        }

        pool.park(&slot, |over_budget| {
            shared.is_shutdown() || (!over_budget && shared.has_work(primary, fallback))
        });
    }

    tracing::debug!(?kind, index = slot.index, "worker stopped");
}
