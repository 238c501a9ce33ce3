use crate::runtime::Handle;
use crate::task::{Task, TaskNesting, TaskPriority, WorkerThreadType};
use std::ops::Range;
use std::sync::Arc;

/// Tunes how `parallel_for` splits its items into task invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelForParams {
    /// Minimum number of items per invocation. With fewer items in total
    /// everything runs serially on the calling thread.
    pub bin_size: u32,

    /// Invocations per short task worker at most. Higher values balance
    /// uneven items better.
    pub max_tasks_per_thread: u32,
}

impl Default for ParallelForParams {
    fn default() -> Self {
        Self {
            bin_size: 1,
            max_tasks_per_thread: 2,
        }
    }
}

impl ParallelForParams {
    /// Multiplicity to split `num_items` into with `num_workers` short task
    /// workers. 0 means serial execution.
    pub fn determine_multiplicity(&self, num_items: u32, num_workers: usize) -> u32 {
        let bin_size = self.bin_size.max(1);
        if num_items <= bin_size {
            return 0;
        }

        let workers = u32::try_from(num_workers.max(1)).unwrap_or(u32::MAX);
        let max_invocations = workers.saturating_mul(self.max_tasks_per_thread.max(1));
        let multiplicity = num_items.div_ceil(bin_size).min(max_invocations);

        // A single invocation is cheaper on the calling thread.
        if multiplicity < 2 { 0 } else { multiplicity }
    }

    /// Items each invocation processes, such that `multiplicity` invocations
    /// cover all of them.
    pub fn determine_items_per_invocation(&self, num_items: u32, multiplicity: u32) -> u32 {
        if multiplicity == 0 {
            num_items
        } else {
            num_items.div_ceil(multiplicity)
        }
    }
}

impl Handle {
    /// Calls `f` with sub-ranges covering `range`, in parallel, and returns
    /// once all of them are done. The calling thread helps.
    pub fn parallel_for_indexed<F>(&self, name: &str, range: Range<u32>, params: ParallelForParams, f: F)
    where
        F: Fn(Range<u32>) + Send + Sync + 'static,
    {
        let num_items = range.end.saturating_sub(range.start);
        let multiplicity = params.determine_multiplicity(
            num_items,
            self.worker_thread_count(WorkerThreadType::ShortTasks),
        );

        if multiplicity == 0 {
            if num_items > 0 {
                f(range);
            }
            return;
        }

        let per_invocation = params.determine_items_per_invocation(num_items, multiplicity);
        let Range { start, end } = range;

        let task = Arc::new(Task::with_multiplicity(name, multiplicity, move |ctx| {
            let first = start.saturating_add(ctx.invocation().saturating_mul(per_invocation));
            let last = first.saturating_add(per_invocation).min(end);

            if first < last {
                f(first..last);
            }
        }));
        task.configure_task(name, TaskNesting::Never, None);

        let group = self.start_single_task(&task, TaskPriority::EarlyThisFrame);
        self.wait_for_group(group);
    }

    /// Calls `f` with consecutive slices of `items` and the index of their
    /// first element, in parallel.
    pub fn parallel_for<T, F>(&self, name: &str, items: Arc<[T]>, params: ParallelForParams, f: F)
    where
        T: Send + Sync + 'static,
        F: Fn(u32, &[T]) + Send + Sync + 'static,
    {
        let len = u32::try_from(items.len()).unwrap_or(u32::MAX);

        self.parallel_for_indexed(name, 0..len, params, move |range| {
            let slice = &items[range.start as usize..range.end as usize];
            f(range.start, slice);
        });
    }

    /// Calls `f` once per element of `items`, in parallel.
    pub fn parallel_for_single<T, F>(&self, name: &str, items: Arc<[T]>, params: ParallelForParams, f: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.parallel_for(name, items, params, move |_, slice| slice.iter().for_each(&f));
    }

    /// Like [`Handle::parallel_for_single`], `f` also gets the index of the
    /// element within `items`.
    pub fn parallel_for_single_index<T, F>(
        &self,
        name: &str,
        items: Arc<[T]>,
        params: ParallelForParams,
        f: F,
    ) where
        T: Send + Sync + 'static,
        F: Fn(u32, &T) + Send + Sync + 'static,
    {
        self.parallel_for(name, items, params, move |first, slice| {
            for (index, item) in (first..).zip(slice) {
                f(index, item);
            }
        });
    }
}
