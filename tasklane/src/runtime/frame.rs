use crate::runtime::Shared;
use crate::task::{PriorityRange, TaskPriority, WorkerThreadType};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What one call to `finish_frame_tasks` did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    /// Time since the previous frame drain ended, measured before executing
    /// any `SomeFrameMainThread` task.
    pub frame_time: Duration,

    /// Next-frame invocations moved to the this-frame queues.
    pub promoted_tasks: usize,

    /// `ThisFrameMainThread` invocations executed.
    pub main_thread_tasks: u32,

    /// This-frame invocations the main thread helped with.
    pub helped_tasks: u32,

    /// `SomeFrameMainThread` invocations executed.
    pub some_frame_tasks: u32,
}

#[derive(Debug)]
pub(crate) struct FrameState {
    last_frame_end: Instant,
    pub(crate) target_frame_time: Duration,

    /// Consecutive frames that went over the target frame time.
    starved_frames: u32,
}

impl FrameState {
    pub(crate) fn new(target_frame_time: Duration) -> Self {
        Self {
            last_frame_end: Instant::now(),
            target_frame_time,
            starved_frames: 0,
        }
    }
}

impl Shared {
    fn drain(self: &Arc<Self>, range: PriorityRange, limit: Option<u32>) -> u32 {
        let mut executed = 0;

        while limit.is_none_or(|limit| executed < limit)
            && let Some(scheduled) = self.pop_range(range)
        {
            self.execute(scheduled);
            executed += 1;
        }

        executed
    }

    pub(crate) fn finish_frame_tasks(self: &Arc<Self>) -> FrameStats {
        debug_assert!(
            self.is_main_thread(),
            "finish_frame_tasks must be called from the main thread"
        );

        let _span = tracing::debug_span!("finish_frame_tasks").entered();
        let mut stats = FrameStats::default();

        stats.promoted_tasks = self.state.lock().queues.promote_next_frame();
        if stats.promoted_tasks > 0 {
            self.wake(WorkerThreadType::ShortTasks, stats.promoted_tasks);
        }

        stats.main_thread_tasks =
            self.drain(PriorityRange::single(TaskPriority::ThisFrameMainThread), None);

        // Whatever this-frame work is still queued, help getting it done.
        stats.helped_tasks = self.drain(PriorityRange::THIS_FRAME, None);

        // Never hold the frame lock while running tasks, they may change the
        // target frame time.
        let (last_frame_end, target, starved_frames) = {
            let frame = self.frame.lock();
            (
                frame.last_frame_end,
                frame.target_frame_time,
                frame.starved_frames,
            )
        };

        stats.frame_time = last_frame_end.elapsed();
        let some_frame = PriorityRange::single(TaskPriority::SomeFrameMainThread);

        let starved_frames = if stats.frame_time < target {
            while stats.some_frame_tasks < self.cfg.some_frame_tasks_per_frame
                && last_frame_end.elapsed() < target
                && self.drain(some_frame, Some(1)) == 1
            {
                stats.some_frame_tasks += 1;
            }
            0
        } else if starved_frames + 1 >= self.cfg.starved_frames_before_progress {
            // Over budget for a while, still guarantee some progress.
            stats.some_frame_tasks = self.drain(some_frame, Some(1));
            0
        } else {
            starved_frames + 1
        };

        let now = Instant::now();
        let window = now.duration_since(last_frame_end);
        for pool in self.pools() {
            pool.for_each_slot(|slot| slot.end_frame(window));
        }

        {
            let mut frame = self.frame.lock();
            frame.last_frame_end = now;
            frame.starved_frames = starved_frames;
        }

        tracing::debug!(
            frame_time = ?stats.frame_time,
            promoted = stats.promoted_tasks,
            main_thread = stats.main_thread_tasks,
            helped = stats.helped_tasks,
            some_frame = stats.some_frame_tasks,
            "frame tasks finished"
        );

        stats
    }

    pub(crate) fn set_target_frame_time(&self, target: Duration) {
        self.frame.lock().target_frame_time = target;
    }
}
