use crate::errors::TaskSystemError;
use crate::runtime::{Builder, OnTaskRunning, ParallelForParams, TaskSystem, TaskSystemConfig};
use crate::task::{Task, TaskGroupId, TaskNesting, TaskPriority, WorkerThreadType};
use crate::test_utils::{Gate, Timeline, counting_task, init_task_system, occupy_workers};
use crate::utils::tracker::{Call, Method};
use anyhow::{Result, bail};
use parking_lot::Mutex;
use rstest::rstest;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

#[test]
fn test_group_waits_for_dependency() -> Result<()> {
    let system = init_task_system(4, 1, None)?;
    let timeline = Timeline::new();

    let first = system.create_task_group(TaskPriority::ThisFrame, None);
    for _ in 0..3 {
        system.add_task_to_group(first, &timeline.task("first", Duration::from_millis(10)));
    }

    let second = system.create_task_group(TaskPriority::EarlyThisFrame, None);
    system.add_task_to_group(second, &timeline.task("second", Duration::from_millis(1)));
    system.add_task_group_dependency(second, first);

    // Starting the dependent group first must not matter.
    system.start_task_group(second);
    system.start_task_group(first);
    system.wait_for_group(second);

    assert!(system.is_task_group_finished(first));
    assert_eq!(timeline.len(), 4);
    timeline.assert_before("first", "second");
    Ok(())
}

#[test]
fn test_stale_group_handles() -> Result<()> {
    let system = init_task_system(2, 1, None)?;
    let (task, count) = counting_task("once", 0);

    let group = system.start_single_task(&task, TaskPriority::ThisFrame);
    system.wait_for_group(group);

    // The slot gets recycled, the old handle has to stay finished.
    let (other, _) = counting_task("other", 0);
    let recycled = system.create_task_group(TaskPriority::ThisFrame, None);
    system.add_task_to_group(recycled, &other);

    system.wait_for_group(group);
    system.wait_for_group(TaskGroupId::default());
    assert!(system.is_task_group_finished(group));
    assert!(!system.is_task_group_finished(recycled));
    assert_ne!(group, recycled);

    system.start_task_group(recycled);
    system.wait_for_group(recycled);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_end_to_end_multiplicity() -> Result<()> {
    let system = init_task_system(4, 1, None)?;
    let timeline = Timeline::new();

    let a = system.create_task_group(TaskPriority::EarlyThisFrame, None);
    system.add_task_to_group(a, &timeline.task("a", Duration::from_millis(10)));
    system.add_task_to_group(a, &timeline.task("a", Duration::from_millis(10)));

    let invocations = Arc::new(Mutex::new(Vec::new()));
    let invocations_clone = Arc::clone(&invocations);
    let timeline_clone = timeline.clone();
    let b_task = Arc::new(Task::with_multiplicity("b", 4, move |ctx| {
        timeline_clone.record("b", || invocations_clone.lock().push(ctx.invocation()));
    }));

    let b = system.create_task_group(TaskPriority::EarlyThisFrame, None);
    system.add_task_to_group(b, &b_task);
    system.add_task_group_dependency(b, a);
    system.start_task_group_batch(&[a, b]);
    system.wait_for_group(b);

    let mut invocations = invocations.lock().clone();
    invocations.sort_unstable();
    assert_eq!(invocations, [0, 1, 2, 3]);
    assert!(b_task.is_finished());
    timeline.assert_before("a", "b");

    let handle = system.handle();
    let tracker = &handle.0.tracker;
    assert_eq!(tracker.num_calls(&Method::Execute), 6);
    assert_eq!(
        tracker.get_calls(&Method::GroupFinished),
        [Call::GroupFinished { group: a }, Call::GroupFinished { group: b }]
    );
    Ok(())
}

#[test]
fn test_priority_order_within_queue() -> Result<()> {
    let system = init_task_system(1, 1, None)?;
    let gate = Gate::new();
    let gates = occupy_workers(&system, &gate);

    let order = Arc::new(Mutex::new(Vec::new()));
    let priorities = [
        TaskPriority::LateThisFrame,
        TaskPriority::EarlyThisFrame,
        TaskPriority::LateThisFrame,
        TaskPriority::EarlyThisFrame,
    ];

    let mut groups = Vec::new();
    for (i, priority) in priorities.into_iter().enumerate() {
        let order = Arc::clone(&order);
        let name = format!("{priority:?}-{i}");
        let task = Arc::new(Task::new(name.clone(), move |_| order.lock().push(name.clone())));
        groups.push(system.start_single_task(&task, priority));
    }

    // Both workers are stuck in the gate, the main thread drains in order.
    let stats = system.finish_frame_tasks();
    assert_eq!(stats.helped_tasks, 4);
    assert_eq!(
        *order.lock(),
        [
            "EarlyThisFrame-1",
            "EarlyThisFrame-3",
            "LateThisFrame-0",
            "LateThisFrame-2"
        ]
    );

    gate.open();
    for group in gates.into_iter().chain(groups) {
        system.wait_for_group(group);
    }
    Ok(())
}

#[test]
fn test_empty_group_finishes_and_releases_dependents() -> Result<()> {
    let system = init_task_system(2, 1, None)?;
    let finished = Arc::new(AtomicBool::new(false));
    let finished_clone = Arc::clone(&finished);

    let empty = system.create_task_group(
        TaskPriority::ThisFrame,
        Some(Box::new(move |_| finished_clone.store(true, Ordering::SeqCst))),
    );

    let (task, count) = counting_task("after-empty", 3);
    let dependent = system.start_single_task_with_dependency(&task, TaskPriority::ThisFrame, empty);
    assert!(!system.is_task_group_finished(dependent));

    system.start_task_group(empty);
    system.wait_for_group(dependent);

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(count.load(Ordering::SeqCst), 3);
    Ok(())
}

#[test]
fn test_group_callback_runs_before_waiters_return() -> Result<()> {
    let system = init_task_system(2, 1, None)?;
    let seen = Arc::new(Mutex::new(None));
    let seen_clone = Arc::clone(&seen);

    let group = system.create_task_group(
        TaskPriority::LateThisFrame,
        Some(Box::new(move |id| *seen_clone.lock() = Some(id))),
    );
    let (task, _) = counting_task("work", 2);
    system.add_task_to_group(group, &task);
    system.start_task_group(group);
    system.wait_for_group(group);

    assert_eq!(*seen.lock(), Some(group));
    Ok(())
}

#[test]
fn test_dependency_on_finished_group_is_ignored() -> Result<()> {
    let system = init_task_system(2, 1, None)?;
    let (first, _) = counting_task("first", 0);
    let done = system.start_single_task(&first, TaskPriority::ThisFrame);
    system.wait_for_group(done);

    let (second, count) = counting_task("second", 0);
    let group = system.start_single_task_with_dependency(&second, TaskPriority::ThisFrame, done);
    system.wait_for_group(group);

    assert_eq!(count.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_cancel_group_before_it_runs() -> Result<()> {
    let system = init_task_system(1, 1, None)?;
    let gate = Gate::new();

    let blocker = {
        let gate = Arc::clone(&gate);
        Arc::new(Task::new("blocker", move |_| gate.pass()))
    };
    let blocking = system.start_single_task(&blocker, TaskPriority::LongRunning);

    let (task, count) = counting_task("canceled", 4);
    let group = system.start_single_task_with_dependency(&task, TaskPriority::ThisFrame, blocking);

    system.cancel_group(group, OnTaskRunning::WaitTillFinished)?;
    assert!(task.is_canceled());

    gate.open();
    system.wait_for_group(group);

    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert!(task.is_finished());

    // Nothing left to cancel.
    system.cancel_group(group, OnTaskRunning::ReturnWithoutBlocking)?;
    Ok(())
}

#[test]
fn test_cancel_drops_queued_invocations() -> Result<()> {
    let system = init_task_system(1, 1, None)?;
    let gate = Gate::new();
    let gates = occupy_workers(&system, &gate);

    let (task, count) = counting_task("queued", 8);
    let group = system.start_single_task(&task, TaskPriority::ThisFrame);

    system.cancel_task(&task, OnTaskRunning::ReturnWithoutBlocking)?;
    assert!(system.is_task_group_finished(group));
    assert_eq!(count.load(Ordering::SeqCst), 0);

    gate.open();
    for group in gates {
        system.wait_for_group(group);
    }
    Ok(())
}

#[rstest]
#[case::wait(OnTaskRunning::WaitTillFinished)]
#[case::no_wait(OnTaskRunning::ReturnWithoutBlocking)]
fn test_cancel_running_task(#[case] on_running: OnTaskRunning) -> Result<()> {
    let system = init_task_system(2, 1, None)?;
    let started = Arc::new(AtomicBool::new(false));
    let started_clone = Arc::clone(&started);

    let task = Arc::new(Task::new("spinning", move |ctx| {
        started_clone.store(true, Ordering::SeqCst);
        while !ctx.is_canceled() {
            thread::sleep(Duration::from_millis(1));
        }
        // Still running when cancellation checks for it.
        thread::sleep(Duration::from_millis(50));
    }));

    let group = system.start_single_task(&task, TaskPriority::LongRunning);
    system.wait_for_condition(|| started.load(Ordering::SeqCst));

    match system.cancel_task(&task, on_running) {
        Err(TaskSystemError::TaskRunning(name)) => assert_eq!(&*name, "spinning"),
        other => bail!("unexpected result {other:?}"),
    }

    if on_running == OnTaskRunning::WaitTillFinished {
        assert!(!task.is_running());
    }

    system.wait_for_group(group);
    assert!(task.is_finished());
    Ok(())
}

#[test]
fn test_reuse_after_canceling_running_task_runs_every_invocation() -> Result<()> {
    // The single file access worker runs invocation 0, invocation 1 stays queued.
    let system = init_task_system(1, 1, None)?;
    let gate = Gate::new();
    let count = Arc::new(AtomicUsize::new(0));

    let gate_clone = Arc::clone(&gate);
    let count_clone = Arc::clone(&count);
    let task = Arc::new(Task::with_multiplicity("reused", 2, move |_| {
        count_clone.fetch_add(1, Ordering::SeqCst);
        gate_clone.pass();
    }));

    let first = system.start_single_task(&task, TaskPriority::FileAccess);
    gate.wait_entered(1);

    match system.cancel_task(&task, OnTaskRunning::ReturnWithoutBlocking) {
        Err(TaskSystemError::TaskRunning(name)) => assert_eq!(&*name, "reused"),
        other => bail!("unexpected result {other:?}"),
    }
    assert!(task.is_finished());
    assert!(task.is_running());

    let second = system.start_single_task(&task, TaskPriority::FileAccess);
    gate.open();
    system.wait_for_group(first);
    system.wait_for_group(second);

    assert_eq!(count.load(Ordering::SeqCst), 3);
    assert!(task.is_finished());
    assert!(system.is_task_group_finished(second));
    Ok(())
}

#[test]
fn test_finish_frame_promotes_and_runs_main_thread_tasks() -> Result<()> {
    let system = init_task_system(1, 1, None)?;
    let gate = Gate::new();
    let gates = occupy_workers(&system, &gate);

    let main_thread = thread::current().id();
    let ran_on_main = Arc::new(AtomicBool::new(false));
    let ran_on_main_clone = Arc::clone(&ran_on_main);

    let main_task = Arc::new(Task::new("main-only", move |_| {
        ran_on_main_clone.store(thread::current().id() == main_thread, Ordering::SeqCst);
    }));
    let main_group = system.start_single_task(&main_task, TaskPriority::ThisFrameMainThread);

    let (next_frame, count) = counting_task("next-frame", 0);
    let next_group = system.start_single_task(&next_frame, TaskPriority::NextFrame);

    let stats = system.finish_frame_tasks();
    assert_eq!(stats.promoted_tasks, 1);
    assert_eq!(stats.main_thread_tasks, 1);
    assert_eq!(stats.helped_tasks, 1);

    assert!(ran_on_main.load(Ordering::SeqCst));
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(system.is_task_group_finished(main_group));
    assert!(system.is_task_group_finished(next_group));

    gate.open();
    for group in gates {
        system.wait_for_group(group);
    }
    Ok(())
}

#[test]
fn test_some_frame_tasks_respect_budget() -> Result<()> {
    let builder = Builder::new()
        .target_frame_time(Duration::from_secs(60))
        .some_frame_tasks_per_frame(8);
    let system = init_task_system(1, 1, Some(builder))?;

    let (task, count) = counting_task("some-frame", 20);
    let group = system.start_single_task(&task, TaskPriority::SomeFrameMainThread);

    let executed: Vec<u32> = (0..3)
        .map(|_| system.finish_frame_tasks().some_frame_tasks)
        .collect();

    assert_eq!(executed, [8, 8, 4]);
    assert_eq!(count.load(Ordering::SeqCst), 20);
    assert!(system.is_task_group_finished(group));
    Ok(())
}

#[test]
fn test_starved_frames_still_make_progress() -> Result<()> {
    let builder = Builder::new().starved_frames_before_progress(3);
    let system = init_task_system(1, 1, Some(builder))?;

    // Every frame is over budget.
    system.set_target_frame_time(Duration::from_nanos(1));
    let (task, count) = counting_task("some-frame", 4);
    system.start_single_task(&task, TaskPriority::SomeFrameMainThread);

    let executed: Vec<u32> = (0..6)
        .map(|_| {
            thread::sleep(Duration::from_millis(1));
            system.finish_frame_tasks().some_frame_tasks
        })
        .collect();

    assert_eq!(executed, [0, 0, 1, 0, 0, 1]);
    assert_eq!(count.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn test_blocked_worker_gets_replaced() -> Result<()> {
    let system = init_task_system(1, 1, None)?;
    let gate = Gate::new();

    // Keep the long worker from helping with short tasks.
    let long_gate = {
        let gate = Arc::clone(&gate);
        Arc::new(Task::new("long-gate", move |_| gate.pass()))
    };
    let long_group = system.start_single_task(&long_gate, TaskPriority::LongRunning);
    gate.wait_entered(1);

    let handle = system.handle();
    let (inner, inner_count) = counting_task("inner", 0);
    let (after, after_count) = counting_task("after", 0);

    let outer = Arc::new(Task::new("outer", move |_| {
        let first = handle.start_single_task(&inner, TaskPriority::EarlyThisFrame);
        let second = handle.start_single_task_with_dependency(&after, TaskPriority::EarlyThisFrame, first);

        // Can't help with `first`, so this worker blocks.
        handle.wait_for_group(second);
    }));

    let outer_group = system.start_single_task(&outer, TaskPriority::EarlyThisFrame);
    system.wait_for_condition(|| system.is_task_group_finished(outer_group));

    assert_eq!(inner_count.load(Ordering::SeqCst), 1);
    assert_eq!(after_count.load(Ordering::SeqCst), 1);
    assert_eq!(system.num_allocated_worker_threads(WorkerThreadType::ShortTasks), 2);
    assert_eq!(system.worker_thread_count(WorkerThreadType::ShortTasks), 1);

    gate.open();
    system.wait_for_group(long_group);
    Ok(())
}

#[test]
fn test_waiting_thread_helps_with_never_nesting_tasks() -> Result<()> {
    let system = init_task_system(1, 1, None)?;
    let gate = Gate::new();
    let gates = occupy_workers(&system, &gate);

    let (task, count) = counting_task("never-nests", 4);
    task.configure_task("never-nests", TaskNesting::Never, None);
    system.start_single_task(&task, TaskPriority::ThisFrame);

    // Workers are stuck, only the waiting thread can run them.
    system.wait_for_condition(|| count.load(Ordering::SeqCst) == 4);

    gate.open();
    for group in gates {
        system.wait_for_group(group);
    }
    Ok(())
}

#[test]
fn test_parallel_for_covers_all_items() -> Result<()> {
    let system = init_task_system(4, 1, None)?;

    let visits: Arc<Vec<AtomicU32>> = Arc::new((0..1000).map(|_| AtomicU32::new(0)).collect());
    let visits_clone = Arc::clone(&visits);
    system.parallel_for_indexed("indexed", 0..1000, ParallelForParams::default(), move |range| {
        for i in range {
            visits_clone[i as usize].fetch_add(1, Ordering::Relaxed);
        }
    });
    assert!(visits.iter().all(|v| v.load(Ordering::Relaxed) == 1));

    let items: Arc<[u64]> = (1..=100).collect();
    let sum = Arc::new(AtomicU64::new(0));
    let sum_clone = Arc::clone(&sum);
    let params = ParallelForParams {
        bin_size: 10,
        max_tasks_per_thread: 1,
    };
    system.parallel_for("sum", items, params, move |first, slice| {
        assert_eq!(slice[0], u64::from(first) + 1);
        sum_clone.fetch_add(slice.iter().sum::<u64>(), Ordering::Relaxed);
    });
    assert_eq!(sum.load(Ordering::Relaxed), 5050);
    Ok(())
}

#[rstest]
#[case::serial(ParallelForParams { bin_size: 64, max_tasks_per_thread: 1 })]
#[case::parallel(ParallelForParams::default())]
fn test_parallel_for_single_visits_each_item(#[case] params: ParallelForParams) -> Result<()> {
    let system = init_task_system(3, 1, None)?;
    let items: Arc<[u32]> = (0..50).map(|i| i * 2).collect();

    let visits: Arc<Vec<AtomicU32>> = Arc::new((0..50).map(|_| AtomicU32::new(0)).collect());
    let visits_clone = Arc::clone(&visits);
    system.parallel_for_single("single", Arc::clone(&items), params, move |item| {
        visits_clone[(*item / 2) as usize].fetch_add(1, Ordering::Relaxed);
    });
    assert!(visits.iter().all(|v| v.load(Ordering::Relaxed) == 1));

    let indices = Arc::new(Mutex::new(Vec::new()));
    let indices_clone = Arc::clone(&indices);
    system.parallel_for_single_index("single-index", items, params, move |index, item| {
        assert_eq!(*item, index * 2);
        indices_clone.lock().push(index);
    });

    let mut indices = indices.lock().clone();
    indices.sort_unstable();
    assert_eq!(indices, (0..50).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_parallel_for_small_input_runs_inline() -> Result<()> {
    let system = init_task_system(2, 1, None)?;
    let main_thread = thread::current().id();
    let inline = Arc::new(AtomicBool::new(false));
    let inline_clone = Arc::clone(&inline);

    system.parallel_for_indexed("tiny", 5..6, ParallelForParams::default(), move |range| {
        assert_eq!(range, 5..6);
        inline_clone.store(thread::current().id() == main_thread, Ordering::SeqCst);
    });

    assert!(inline.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn test_set_worker_thread_count() -> Result<()> {
    let system = init_task_system(1, 1, None)?;

    system.set_worker_thread_count(Some(3), Some(2))?;
    assert_eq!(system.worker_thread_count(WorkerThreadType::ShortTasks), 3);
    assert_eq!(system.worker_thread_count(WorkerThreadType::LongTasks), 2);
    assert_eq!(system.num_allocated_worker_threads(WorkerThreadType::ShortTasks), 3);

    system.set_worker_thread_count(None, None)?;
    assert_eq!(
        system.worker_thread_count(WorkerThreadType::ShortTasks),
        TaskSystemConfig::default_workers(WorkerThreadType::ShortTasks)?
    );
    assert_eq!(system.worker_thread_count(WorkerThreadType::LongTasks), 2);

    // Lowering the count parks workers, it doesn't free them.
    system.set_worker_thread_count(Some(1), Some(1))?;
    let (task, count) = counting_task("after-shrink", 16);
    let group = system.start_single_task(&task, TaskPriority::ThisFrame);
    system.wait_for_group(group);
    assert_eq!(count.load(Ordering::SeqCst), 16);
    Ok(())
}

#[test]
fn test_worker_thread_names_and_types() -> Result<()> {
    let builder = Builder::new().thread_name_fn(|kind, index| format!("lane-{}-{index}", kind.label()));
    let system = init_task_system(1, 1, Some(builder))?;

    let seen = Arc::new(Mutex::new(None));
    let seen_clone = Arc::clone(&seen);
    let handle = system.handle();

    let task = Arc::new(Task::new("whoami", move |_| {
        *seen_clone.lock() = Some((
            thread::current().name().map(str::to_owned),
            handle.current_thread_worker_type(),
        ));
    }));

    let group = system.start_single_task(&task, TaskPriority::LongRunning);
    system.wait_for_group(group);

    assert_eq!(
        *seen.lock(),
        Some((
            Some("lane-long-0".to_owned()),
            Some(WorkerThreadType::LongTasks)
        ))
    );
    assert_eq!(system.current_thread_worker_type(), None);
    Ok(())
}

#[test]
fn test_thread_utilization_is_recorded() -> Result<()> {
    let system = init_task_system(1, 1, None)?;
    let busy = Arc::new(Task::new("busy", |_| thread::sleep(Duration::from_millis(20))));

    let group = system.start_single_task(&busy, TaskPriority::LongRunning);
    system.wait_for_group(group);

    // The worker accounts for the task right after it returned.
    let mut utilization = None;
    for _ in 0..500 {
        system.finish_frame_tasks();
        let last = system.thread_utilization(WorkerThreadType::LongTasks, 0);
        if last.is_some_and(|u| u.tasks_executed == 1) {
            utilization = last;
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }

    let Some(utilization) = utilization else {
        bail!("worker never reported the task");
    };
    assert!(utilization.utilization > 0.0);
    assert!(utilization.utilization <= 1.0);
    assert!(system.thread_utilization(WorkerThreadType::LongTasks, 7).is_none());
    Ok(())
}

#[test]
fn test_many_groups_recycle_slots() -> Result<()> {
    let system = init_task_system(4, 1, None)?;
    let total = Arc::new(AtomicUsize::new(0));

    for _ in 0..50 {
        let groups: Vec<_> = (0..20)
            .map(|_| {
                let total = Arc::clone(&total);
                let task = Arc::new(Task::with_multiplicity("tick", 2, move |_| {
                    total.fetch_add(1, Ordering::Relaxed);
                }));
                system.start_single_task(&task, TaskPriority::ThisFrame)
            })
            .collect();

        for group in groups {
            system.wait_for_group(group);
        }
    }

    assert_eq!(total.load(Ordering::Relaxed), 2000);
    assert!(system.handle().0.state.lock().groups.capacity() <= 20 + 1);
    Ok(())
}

#[test]
fn test_shutdown_stops_workers() -> Result<()> {
    let system = init_task_system(2, 1, None)?;
    let handle = system.handle();
    let (task, count) = counting_task("before", 0);
    let group = handle.start_single_task(&task, TaskPriority::ThisFrame);
    handle.wait_for_group(group);

    system.shutdown()?;
    assert!(handle.0.is_shutdown());
    assert_eq!(count.load(Ordering::SeqCst), 1);

    // Nobody will run it, waiting must not hang.
    let (late, _) = counting_task("late", 0);
    let late_group = handle.create_task_group(TaskPriority::LongRunning, None);
    handle.add_task_to_group(late_group, &late);
    handle.start_task_group(late_group);
    handle.wait_for_group(late_group);
    Ok(())
}

#[test]
fn test_group_lifecycle_checks() -> Result<()> {
    let system = TaskSystem::try_new()?;
    let (task, count) = counting_task("checked", 0);

    let blocker = system.create_task_group(TaskPriority::ThisFrame, None);
    let group = system.create_task_group(TaskPriority::ThisFrame, None);
    system.add_task_to_group(group, &task);
    system.add_task_group_dependency(group, blocker);
    assert_eq!(task.belongs_to_group(), group);

    system.debug_check_task_group(group, false);
    system.start_task_group(group);
    system.debug_check_task_group(group, true);

    // Started, but held back by its dependency.
    assert!(!task.is_scheduled());
    assert!(!system.is_task_group_finished(group));

    system.start_task_group(blocker);
    system.wait_for_group(group);

    assert!(task.is_scheduled());
    assert_eq!(count.load(Ordering::SeqCst), 1);
    Ok(())
}
