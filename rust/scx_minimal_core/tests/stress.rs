// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::Arc;

use scx_minimal_core::*;

/// 20 short-lived tasks churning through 2 CPUs: everyone completes, no
/// task is lost, and no CPU is accounted for more than the window.
#[test]
fn test_task_churn_under_load() {
    let mut builder = Scenario::builder().cpus(2).duration_ms(500);
    for i in 0..20 {
        builder = builder.task(TaskDef {
            name: format!("churn{i}"),
            task: TaskId(i + 1),
            weight: Weight::DEFAULT,
            behavior: TaskBehavior::one_shot(2_000_000),
            // Staggered arrivals keep the run queue churning.
            start_time_ns: i as u64 * 1_000_000,
        });
    }
    let scenario = builder.build();

    let sched = Arc::new(MinimalScheduler::new(SliceConfig::default()).unwrap());
    let trace = Simulator::new(sched.clone()).run(&scenario);

    for i in 0..20 {
        let task = TaskId(i + 1);
        assert!(trace.completed(task), "task {} never completed", i + 1);
        assert_eq!(
            trace.total_runtime(task),
            2_000_000,
            "task {} ran the wrong amount",
            i + 1
        );
    }

    // Everyone departed; the registry holds nothing.
    let m = sched.metrics();
    assert_eq!(m.nr_tasks, 0);
    assert_eq!(m.nr_queued, 0);

    for cpu in [CpuId(0), CpuId(1)] {
        let busy = trace.cpu_busy(cpu);
        assert!(
            busy <= scenario.duration_ns,
            "cpu {} accounted {}ns in a {}ns window",
            cpu.0,
            busy,
            scenario.duration_ns
        );
    }
    // 40ms of total work across both CPUs.
    let total_busy = trace.cpu_busy(CpuId(0)) + trace.cpu_busy(CpuId(1));
    assert_eq!(total_busy, 40_000_000);
}

/// Oversubscription: more runnable tasks than the base slice can cover
/// still makes progress because the slice is clamped, never zero.
#[test]
fn test_heavy_oversubscription() {
    let mut builder = Scenario::builder().cpus(1).duration_ms(1000);
    for i in 0..50 {
        builder = builder.add_task(
            &format!("w{i}"),
            Weight::DEFAULT,
            TaskBehavior::cpu_bound(),
        );
    }
    let trace = Simulator::new(Arc::new(
        MinimalScheduler::new(SliceConfig::default()).unwrap(),
    ))
    .run(&builder.build());

    for i in 1..=50 {
        let rt = trace.total_runtime(TaskId(i));
        assert!(rt > 0, "task {i} starved under oversubscription");
    }
    let runtimes: Vec<u64> = (1..=50).map(|i| trace.total_runtime(TaskId(i))).collect();
    let min = *runtimes.iter().min().unwrap();
    let max = *runtimes.iter().max().unwrap();
    eprintln!("50-task window: min={min}ns max={max}ns");
    assert!(
        min as f64 / max as f64 > 0.8,
        "uneven split under oversubscription: min={min} max={max}"
    );
}

/// A mixed workload (sleepers, batch jobs, hogs) runs the full window
/// without accounting anomalies.
#[test]
fn test_mixed_workload_stability() {
    let scenario = Scenario::builder()
        .cpus(2)
        .add_task("hog1", Weight::DEFAULT, TaskBehavior::cpu_bound())
        .add_task("hog2", Weight(200), TaskBehavior::cpu_bound())
        .add_task(
            "chatty",
            Weight::DEFAULT,
            TaskBehavior::interactive(500_000, 2_000_000),
        )
        .add_task("batch", Weight::DEFAULT, TaskBehavior::one_shot(30_000_000))
        .duration_ms(300)
        .build();

    let sched = Arc::new(MinimalScheduler::new(SliceConfig::default()).unwrap());
    let trace = Simulator::new(sched.clone()).run(&scenario);

    assert!(trace.completed(TaskId(4)), "batch job never finished");
    assert_eq!(trace.total_runtime(TaskId(4)), 30_000_000);
    assert!(trace.total_runtime(TaskId(3)) > 0, "interactive task starved");

    // The two hogs together soak up whatever the others leave behind.
    let total: u64 = (1..=4).map(|i| trace.total_runtime(TaskId(i))).sum();
    let capacity = 2 * scenario.duration_ns;
    assert!(total <= capacity, "accounted {total}ns on {capacity}ns of CPU");
    assert!(
        total as f64 > 0.9 * capacity as f64,
        "CPUs sat idle with runnable work: {total}ns of {capacity}ns"
    );

    // Dispatch accounting stayed consistent.
    let m = sched.metrics();
    assert!(m.nr_dispatches > 0);
    assert_eq!(m.nr_sched_congested, 0, "single-threaded sim saw contention");
}
