// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The scheduler core: event processing and dispatch.
//!
//! All mutable policy state (registry + run queue + vruntime floor) lives
//! behind a single mutex. The dispatch path acquires it with `try_lock`
//! only: a contended CPU is told to go idle for the step rather than
//! spin, and a congestion counter records the miss.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::warn;

use crate::fair::{vruntime_delta, RunQueue, SliceConfig, SliceConfigError};
use crate::host::{Decision, SchedEvent};
use crate::registry::{RegistryError, TaskRegistry, TaskState};
use crate::types::{TaskId, TimeNs, Vtime, Weight};

/// Read-only accounting snapshot for a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStats {
    /// Total CPU time consumed, in nanoseconds.
    pub consumed_ns: TimeNs,
    /// Weight-normalized accumulated runtime.
    pub vruntime: Vtime,
    pub state: TaskState,
}

/// Instance-wide counters, sampled for the stats surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedMetrics {
    /// Tasks currently tracked by the registry.
    pub nr_tasks: u64,
    /// Tasks waiting in the run queue.
    pub nr_queued: u64,
    /// Total dispatch decisions handed out.
    pub nr_dispatches: u64,
    /// Total enqueue events processed.
    pub nr_enqueues: u64,
    /// Dispatch steps that found the core contended and went idle.
    pub nr_sched_congested: u64,
}

#[derive(Debug)]
struct SchedCore {
    registry: TaskRegistry,
    runq: RunQueue,
    slice: SliceConfig,
    /// Floor for newly enqueued vruntimes: the largest vruntime ever
    /// dispatched. Sleepers waking with a lagging vruntime are aligned
    /// up to it so they cannot monopolize the CPU.
    min_vruntime: Vtime,
    nr_dispatches: u64,
    nr_enqueues: u64,
}

/// The vruntime-fair scheduling policy.
#[derive(Debug)]
pub struct MinimalScheduler {
    inner: Mutex<SchedCore>,
    nr_sched_congested: AtomicU64,
}

impl MinimalScheduler {
    pub fn new(slice: SliceConfig) -> Result<Self, SliceConfigError> {
        slice.validate()?;
        Ok(MinimalScheduler {
            inner: Mutex::new(SchedCore {
                registry: TaskRegistry::new(),
                runq: RunQueue::new(),
                slice,
                min_vruntime: Vtime(0),
                nr_dispatches: 0,
                nr_enqueues: 0,
            }),
            nr_sched_congested: AtomicU64::new(0),
        })
    }

    /// Process one host event. Errors on the event path are logged and
    /// degrade to `Idle`; the dispatch path must never panic or block.
    pub fn process_event(&self, ev: SchedEvent) -> Decision {
        match ev {
            SchedEvent::TaskEnqueued { task, weight } => {
                if let Err(err) = self.enqueue(task, weight) {
                    warn!("enqueue failed for {:?}: {}", task, err);
                }
                Decision::Idle
            }
            SchedEvent::TaskDequeued { task } => {
                if let Err(err) = self.dequeue(task) {
                    warn!("dequeue failed for {:?}: {}", task, err);
                }
                Decision::Idle
            }
            SchedEvent::CpuIdle { .. } => self.pick_next(),
        }
    }

    /// Make a task runnable and queue it for dispatch. Unknown tasks are
    /// enrolled on their first enqueue; blocked tasks transition back to
    /// Runnable. A task enqueued while Running is rejected.
    pub fn enqueue(&self, task: TaskId, weight: Weight) -> Result<(), RegistryError> {
        let mut core = self.inner.lock().unwrap();
        core.nr_enqueues += 1;
        if !core.registry.contains(task) {
            let floor = core.min_vruntime;
            core.registry.enroll(task, weight, floor)?;
        }
        let floor = core.min_vruntime;
        let ctx = core
            .registry
            .get_mut(task)
            .ok_or(RegistryError::UnknownTask(task))?;
        match ctx.state {
            TaskState::Running => {
                return Err(RegistryError::InvalidTransition {
                    task,
                    state: TaskState::Running,
                });
            }
            TaskState::Blocked => ctx.state = TaskState::Runnable,
            _ => {}
        }
        // Align a lagging vruntime to the dispatch floor. Credit for
        // partially consumed slices is preserved: vruntime only moves up.
        if ctx.vruntime < floor {
            ctx.vruntime = floor;
        }
        let (vtime, seq) = (ctx.vruntime, ctx.seq);
        core.runq.push(task, vtime, seq);
        Ok(())
    }

    /// Drop a task from the policy (exit or migration away).
    pub fn dequeue(&self, task: TaskId) -> Result<(), RegistryError> {
        let mut core = self.inner.lock().unwrap();
        core.runq.remove(task);
        core.registry.remove(task)
    }

    /// Select the next task to run. Returns `Idle` when the run queue is
    /// empty or when another CPU holds the core lock.
    pub fn pick_next(&self) -> Decision {
        let mut core = match self.inner.try_lock() {
            Ok(core) => core,
            Err(_) => {
                self.nr_sched_congested.fetch_add(1, Ordering::Relaxed);
                return Decision::Idle;
            }
        };
        let Some((task, vtime)) = core.runq.pop() else {
            return Decision::Idle;
        };
        if core.min_vruntime < vtime {
            core.min_vruntime = vtime;
        }
        match core.registry.get_mut(task) {
            Some(ctx) => ctx.state = TaskState::Running,
            None => {
                // Queue entry outlived the task; skip it.
                warn!("dropping stale run queue entry for {:?}", task);
                return Decision::Idle;
            }
        }
        let slice_ns = core.slice.slice_for(core.runq.len());
        core.nr_dispatches += 1;
        Decision::Dispatch { task, slice_ns }
    }

    /// Account `consumed` nanoseconds of CPU time to a running task and
    /// hand it back as Runnable. This is the only path through which
    /// vruntime advances.
    pub fn on_slice_consumed(&self, task: TaskId, consumed: TimeNs) -> Result<(), RegistryError> {
        let mut core = self.inner.lock().unwrap();
        let ctx = core
            .registry
            .get_mut(task)
            .ok_or(RegistryError::UnknownTask(task))?;
        if ctx.state != TaskState::Running {
            return Err(RegistryError::InvalidTransition {
                task,
                state: ctx.state,
            });
        }
        ctx.sum_exec_runtime += consumed;
        ctx.vruntime = Vtime(ctx.vruntime.0.wrapping_add(vruntime_delta(consumed, ctx.weight)));
        ctx.state = TaskState::Runnable;
        Ok(())
    }

    /// Mark a runnable task as blocked (sleeping). Its vruntime stays
    /// where accounting left it.
    pub fn block(&self, task: TaskId) -> Result<(), RegistryError> {
        let mut core = self.inner.lock().unwrap();
        core.runq.remove(task);
        core.registry.mark_blocked(task)
    }

    /// Accounting snapshot for one task.
    pub fn task_stats(&self, task: TaskId) -> Option<TaskStats> {
        let core = self.inner.lock().unwrap();
        core.registry.get(task).map(|ctx| TaskStats {
            consumed_ns: ctx.sum_exec_runtime,
            vruntime: ctx.vruntime,
            state: ctx.state,
        })
    }

    /// Ordered (vruntime, enrollment) snapshot of runnable tasks.
    pub fn runnable_snapshot(&self) -> Vec<(TaskId, Vtime)> {
        self.inner.lock().unwrap().registry.snapshot()
    }

    pub fn metrics(&self) -> SchedMetrics {
        let core = self.inner.lock().unwrap();
        SchedMetrics {
            nr_tasks: core.registry.len() as u64,
            nr_queued: core.runq.len() as u64,
            nr_dispatches: core.nr_dispatches,
            nr_enqueues: core.nr_enqueues,
            nr_sched_congested: self.nr_sched_congested.load(Ordering::Relaxed),
        }
    }

    /// Hand every tracked task back to the host's default policy.
    /// Bounded by the registry size; never waits on task completion.
    pub fn drain(&self) -> usize {
        let mut core = self.inner.lock().unwrap();
        core.runq.clear();
        core.registry.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fair::DEFAULT_SLICE_NS;

    fn sched() -> MinimalScheduler {
        MinimalScheduler::new(SliceConfig::default()).unwrap()
    }

    fn dispatch(s: &MinimalScheduler) -> (TaskId, TimeNs) {
        match s.pick_next() {
            Decision::Dispatch { task, slice_ns } => (task, slice_ns),
            Decision::Idle => panic!("expected a dispatch"),
        }
    }

    #[test]
    fn test_rejects_invalid_slice_config() {
        let cfg = SliceConfig {
            slice_ns: 0,
            slice_ns_min: 0,
        };
        assert!(MinimalScheduler::new(cfg).is_err());
    }

    #[test]
    fn test_empty_queue_idles() {
        assert_eq!(sched().pick_next(), Decision::Idle);
    }

    #[test]
    fn test_enqueue_enrolls_and_dispatches() {
        let s = sched();
        s.enqueue(TaskId(1), Weight::DEFAULT).unwrap();
        let (task, slice_ns) = dispatch(&s);
        assert_eq!(task, TaskId(1));
        // Lone runnable task gets the full base slice.
        assert_eq!(slice_ns, DEFAULT_SLICE_NS);
        assert_eq!(s.task_stats(TaskId(1)).unwrap().state, TaskState::Running);
    }

    #[test]
    fn test_slice_shrinks_with_backlog() {
        let s = sched();
        s.enqueue(TaskId(1), Weight::DEFAULT).unwrap();
        s.enqueue(TaskId(2), Weight::DEFAULT).unwrap();
        // One task stays waiting after the pick.
        let (_, slice_ns) = dispatch(&s);
        assert_eq!(slice_ns, DEFAULT_SLICE_NS / 2);
    }

    #[test]
    fn test_lowest_vruntime_runs_first() {
        let s = sched();
        s.enqueue(TaskId(1), Weight::DEFAULT).unwrap();
        s.enqueue(TaskId(2), Weight::DEFAULT).unwrap();
        // Task 1 consumes a slice; task 2 must run next.
        let (t, _) = dispatch(&s);
        assert_eq!(t, TaskId(1));
        s.on_slice_consumed(TaskId(1), 1_000_000).unwrap();
        s.enqueue(TaskId(1), Weight::DEFAULT).unwrap();
        let (t, _) = dispatch(&s);
        assert_eq!(t, TaskId(2));
    }

    #[test]
    fn test_consume_requires_running() {
        let s = sched();
        s.enqueue(TaskId(1), Weight::DEFAULT).unwrap();
        assert_eq!(
            s.on_slice_consumed(TaskId(1), 1_000),
            Err(RegistryError::InvalidTransition {
                task: TaskId(1),
                state: TaskState::Runnable,
            })
        );
        assert_eq!(
            s.on_slice_consumed(TaskId(9), 1_000),
            Err(RegistryError::UnknownTask(TaskId(9)))
        );
    }

    #[test]
    fn test_vruntime_monotonic_and_frozen_while_blocked() {
        let s = sched();
        s.enqueue(TaskId(1), Weight::DEFAULT).unwrap();
        let mut last = s.task_stats(TaskId(1)).unwrap().vruntime;
        for consumed in [1_000u64, 250_000, 5_000_000, 1] {
            dispatch(&s);
            s.on_slice_consumed(TaskId(1), consumed).unwrap();
            let now = s.task_stats(TaskId(1)).unwrap().vruntime;
            assert!(now > last);
            last = now;
            s.enqueue(TaskId(1), Weight::DEFAULT).unwrap();
        }
        dispatch(&s);
        s.on_slice_consumed(TaskId(1), 1_000).unwrap();
        s.block(TaskId(1)).unwrap();
        let frozen = s.task_stats(TaskId(1)).unwrap().vruntime;
        assert_eq!(s.task_stats(TaskId(1)).unwrap().state, TaskState::Blocked);
        // Blocked tasks cannot be accounted against.
        assert!(s.on_slice_consumed(TaskId(1), 1_000).is_err());
        assert_eq!(s.task_stats(TaskId(1)).unwrap().vruntime, frozen);
    }

    #[test]
    fn test_waking_sleeper_aligned_to_floor() {
        let s = sched();
        s.enqueue(TaskId(1), Weight::DEFAULT).unwrap();
        s.enqueue(TaskId(2), Weight::DEFAULT).unwrap();
        // Task 1 sleeps immediately; task 2 accumulates runtime.
        dispatch(&s);
        s.on_slice_consumed(TaskId(1), 1_000).unwrap();
        s.block(TaskId(1)).unwrap();
        for _ in 0..10 {
            let (t, _) = dispatch(&s);
            assert_eq!(t, TaskId(2));
            s.on_slice_consumed(TaskId(2), 5_000_000).unwrap();
            s.enqueue(TaskId(2), Weight::DEFAULT).unwrap();
        }
        // On wake, task 1 does not get to replay its sleep as credit.
        s.enqueue(TaskId(1), Weight::DEFAULT).unwrap();
        let woken = s.task_stats(TaskId(1)).unwrap().vruntime;
        let runner = s.task_stats(TaskId(2)).unwrap().vruntime;
        assert!(woken >= Vtime(runner.0.saturating_sub(5_000_000)));
    }

    #[test]
    fn test_dequeue_removes_task() {
        let s = sched();
        s.enqueue(TaskId(1), Weight::DEFAULT).unwrap();
        s.dequeue(TaskId(1)).unwrap();
        assert_eq!(s.pick_next(), Decision::Idle);
        assert_eq!(s.task_stats(TaskId(1)), None);
        assert_eq!(
            s.dequeue(TaskId(1)),
            Err(RegistryError::UnknownTask(TaskId(1)))
        );
    }

    #[test]
    fn test_drain_resets_everything() {
        let s = sched();
        for pid in 1..=5 {
            s.enqueue(TaskId(pid), Weight::DEFAULT).unwrap();
        }
        assert_eq!(s.drain(), 5);
        assert_eq!(s.pick_next(), Decision::Idle);
        let m = s.metrics();
        assert_eq!(m.nr_tasks, 0);
        assert_eq!(m.nr_queued, 0);
    }

    #[test]
    fn test_metrics_counters() {
        let s = sched();
        s.enqueue(TaskId(1), Weight::DEFAULT).unwrap();
        s.enqueue(TaskId(2), Weight::DEFAULT).unwrap();
        dispatch(&s);
        let m = s.metrics();
        assert_eq!(m.nr_tasks, 2);
        assert_eq!(m.nr_queued, 1);
        assert_eq!(m.nr_enqueues, 2);
        assert_eq!(m.nr_dispatches, 1);
    }

    #[test]
    fn test_event_errors_degrade_to_idle() {
        let s = sched();
        // Dequeue of an unknown task is logged, not propagated.
        let d = s.process_event(SchedEvent::TaskDequeued { task: TaskId(7) });
        assert_eq!(d, Decision::Idle);
    }
}
