// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Deterministic host simulation.
//!
//! Drives the scheduler core with scripted tasks on a virtual clock: an
//! event queue ordered by (time, sequence) delivers wakes, slice
//! expirations, and phase completions, and every scheduling action is
//! recorded in a trace. Two runs of the same scenario produce identical
//! traces, which makes fairness and stress properties testable without a
//! host kernel.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use log::debug;

use crate::host::Decision;
use crate::sched::MinimalScheduler;
use crate::types::{CpuId, TaskId, TimeNs, Weight};

/// A phase in a task's scripted behavior.
#[derive(Debug, Clone, Copy)]
pub enum Phase {
    /// Consume CPU for the given number of nanoseconds.
    Run(TimeNs),
    /// Block for the given number of nanoseconds.
    Sleep(TimeNs),
}

/// The scripted behavior for a task: a sequence of phases, optionally
/// repeating.
#[derive(Debug, Clone)]
pub struct TaskBehavior {
    pub phases: Vec<Phase>,
    pub repeat: bool,
}

impl TaskBehavior {
    /// A task that never yields the CPU voluntarily.
    pub fn cpu_bound() -> Self {
        TaskBehavior {
            phases: vec![Phase::Run(TimeNs::MAX)],
            repeat: false,
        }
    }

    /// A task alternating bursts of work with sleeps.
    pub fn interactive(run_ns: TimeNs, sleep_ns: TimeNs) -> Self {
        TaskBehavior {
            phases: vec![Phase::Run(run_ns), Phase::Sleep(sleep_ns)],
            repeat: true,
        }
    }

    /// A task that runs once for `run_ns` and exits.
    pub fn one_shot(run_ns: TimeNs) -> Self {
        TaskBehavior {
            phases: vec![Phase::Run(run_ns)],
            repeat: false,
        }
    }
}

/// Definition of a task for scenario creation.
#[derive(Debug, Clone)]
pub struct TaskDef {
    pub name: String,
    pub task: TaskId,
    pub weight: Weight,
    pub behavior: TaskBehavior,
    /// When the task first becomes runnable (simulated ns).
    pub start_time_ns: TimeNs,
}

/// A complete simulation scenario: CPUs, tasks, and duration.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub nr_cpus: u32,
    pub tasks: Vec<TaskDef>,
    pub duration_ns: TimeNs,
}

impl Scenario {
    pub fn builder() -> ScenarioBuilder {
        ScenarioBuilder {
            nr_cpus: 1,
            tasks: Vec::new(),
            duration_ns: 100_000_000,
            next_id: 1,
        }
    }
}

/// Builder for constructing scenarios.
pub struct ScenarioBuilder {
    nr_cpus: u32,
    tasks: Vec<TaskDef>,
    duration_ns: TimeNs,
    next_id: i32,
}

impl ScenarioBuilder {
    pub fn cpus(mut self, n: u32) -> Self {
        self.nr_cpus = n;
        self
    }

    /// Add a task with an auto-assigned id, starting at time 0.
    pub fn add_task(mut self, name: &str, weight: Weight, behavior: TaskBehavior) -> Self {
        let task = TaskId(self.next_id);
        self.next_id += 1;
        self.tasks.push(TaskDef {
            name: name.to_string(),
            task,
            weight,
            behavior,
            start_time_ns: 0,
        });
        self
    }

    /// Add a task with a full definition.
    pub fn task(mut self, def: TaskDef) -> Self {
        self.next_id = self.next_id.max(def.task.0 + 1);
        self.tasks.push(def);
        self
    }

    pub fn duration_ns(mut self, ns: TimeNs) -> Self {
        self.duration_ns = ns;
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ns = ms * 1_000_000;
        self
    }

    pub fn build(self) -> Scenario {
        assert!(!self.tasks.is_empty(), "scenario must have at least one task");
        assert!(self.nr_cpus > 0, "scenario must have at least one CPU");
        Scenario {
            nr_cpus: self.nr_cpus,
            tasks: self.tasks,
            duration_ns: self.duration_ns,
        }
    }
}

/// The type of scheduling event recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceKind {
    /// A task was scheduled to run on this CPU.
    TaskScheduled { task: TaskId },
    /// A task was preempted (slice expired) on this CPU.
    TaskPreempted { task: TaskId },
    /// A task voluntarily slept on this CPU.
    TaskSlept { task: TaskId },
    /// A task woke up.
    TaskWoke { task: TaskId },
    /// A task completed all its phases.
    TaskCompleted { task: TaskId },
    /// The CPU found nothing to run.
    CpuIdle,
}

/// A single trace event with a simulated timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub time_ns: TimeNs,
    pub cpu: CpuId,
    pub kind: TraceKind,
}

/// A complete simulation trace, events in chronological order.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    events: Vec<TraceEvent>,
}

impl Trace {
    fn record(&mut self, time_ns: TimeNs, cpu: CpuId, kind: TraceKind) {
        self.events.push(TraceEvent { time_ns, cpu, kind });
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Total runtime for a task: the sum of intervals between each
    /// `TaskScheduled` and the next preempt/sleep/complete for it.
    pub fn total_runtime(&self, task: TaskId) -> TimeNs {
        let mut total: TimeNs = 0;
        let mut running_since: Option<TimeNs> = None;
        for event in &self.events {
            match &event.kind {
                TraceKind::TaskScheduled { task: t } if *t == task => {
                    running_since = Some(event.time_ns);
                }
                TraceKind::TaskPreempted { task: t }
                | TraceKind::TaskSlept { task: t }
                | TraceKind::TaskCompleted { task: t }
                    if *t == task =>
                {
                    if let Some(start) = running_since.take() {
                        total += event.time_ns - start;
                    }
                }
                _ => {}
            }
        }
        total
    }

    /// Number of times a task was scheduled.
    pub fn schedule_count(&self, task: TaskId) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.kind, TraceKind::TaskScheduled { task: t } if t == task))
            .count()
    }

    /// Whether a task reached completion.
    pub fn completed(&self, task: TaskId) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e.kind, TraceKind::TaskCompleted { task: t } if t == task))
    }

    /// Total busy time of a CPU: intervals between a `TaskScheduled` on
    /// it and the matching preempt/sleep/complete. End events must match
    /// the running task: a task completing while blocked is traced
    /// without ever occupying the CPU.
    pub fn cpu_busy(&self, cpu: CpuId) -> TimeNs {
        let mut total: TimeNs = 0;
        let mut running: Option<(TaskId, TimeNs)> = None;
        for event in self.events.iter().filter(|e| e.cpu == cpu) {
            match &event.kind {
                TraceKind::TaskScheduled { task } => running = Some((*task, event.time_ns)),
                TraceKind::TaskPreempted { task }
                | TraceKind::TaskSlept { task }
                | TraceKind::TaskCompleted { task } => {
                    if let Some((running_task, start)) = running {
                        if running_task == *task {
                            total += event.time_ns - start;
                            running = None;
                        }
                    }
                }
                _ => {}
            }
        }
        total
    }

    /// Pretty-print the trace for debugging.
    pub fn dump(&self) {
        for event in &self.events {
            let desc = match &event.kind {
                TraceKind::TaskScheduled { task } => format!("SCHED    task={}", task.0),
                TraceKind::TaskPreempted { task } => format!("PREEMPT  task={}", task.0),
                TraceKind::TaskSlept { task } => format!("SLEEP    task={}", task.0),
                TraceKind::TaskWoke { task } => format!("WAKE     task={}", task.0),
                TraceKind::TaskCompleted { task } => format!("COMPLETE task={}", task.0),
                TraceKind::CpuIdle => "IDLE".to_string(),
            };
            eprintln!("[{:>12} ns] cpu={:<3} {}", event.time_ns, event.cpu.0, desc);
        }
    }
}

/// A simulation event, ordered by timestamp with a sequence tiebreaker.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Event {
    time_ns: TimeNs,
    seq: u64,
    kind: EventKind,
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time_ns
            .cmp(&other.time_ns)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EventKind {
    /// A task becomes runnable.
    TaskWake { task: TaskId },
    /// The running task's slice expires on the given CPU.
    SliceExpired { cpu: CpuId },
    /// The running task finishes its current Run phase on the given CPU.
    PhaseComplete { cpu: CpuId },
}

#[derive(Debug)]
struct SimTask {
    weight: Weight,
    behavior: TaskBehavior,
    phase_idx: usize,
    /// Remaining nanoseconds in the current Run phase.
    run_remaining_ns: TimeNs,
    /// The current Sleep phase has started and its wake is pending.
    sleeping: bool,
    exited: bool,
}

impl SimTask {
    fn new(def: &TaskDef) -> Self {
        let run_remaining_ns = match def.behavior.phases.first() {
            Some(Phase::Run(ns)) => *ns,
            _ => 0,
        };
        SimTask {
            weight: def.weight,
            behavior: def.behavior.clone(),
            phase_idx: 0,
            run_remaining_ns,
            sleeping: false,
            exited: false,
        }
    }

    fn current_phase(&self) -> Option<Phase> {
        self.behavior.phases.get(self.phase_idx).copied()
    }

    /// Step to the next phase, wrapping if the behavior repeats. Returns
    /// the new phase, or `None` when the task has exited.
    fn advance_phase(&mut self) -> Option<Phase> {
        self.phase_idx += 1;
        if self.phase_idx >= self.behavior.phases.len() {
            if !self.behavior.repeat {
                self.exited = true;
                return None;
            }
            self.phase_idx = 0;
        }
        let phase = self.behavior.phases[self.phase_idx];
        if let Phase::Run(ns) = phase {
            self.run_remaining_ns = ns;
        }
        Some(phase)
    }
}

#[derive(Debug)]
struct SimCpu {
    id: CpuId,
    current: Option<TaskId>,
    run_started_ns: TimeNs,
}

/// Drives a scheduler core through a scenario.
pub struct Simulator {
    sched: Arc<MinimalScheduler>,
}

impl Simulator {
    pub fn new(sched: Arc<MinimalScheduler>) -> Self {
        Simulator { sched }
    }

    /// Run a scenario to its virtual-time horizon and return the trace.
    pub fn run(&self, scenario: &Scenario) -> Trace {
        SimRun::new(&self.sched, scenario).run()
    }
}

struct SimRun<'a> {
    sched: &'a MinimalScheduler,
    tasks: HashMap<TaskId, SimTask>,
    cpus: Vec<SimCpu>,
    queue: BinaryHeap<Reverse<Event>>,
    next_seq: u64,
    clock: TimeNs,
    duration_ns: TimeNs,
    trace: Trace,
}

impl<'a> SimRun<'a> {
    fn new(sched: &'a MinimalScheduler, scenario: &Scenario) -> Self {
        let mut run = SimRun {
            sched,
            tasks: HashMap::new(),
            cpus: (0..scenario.nr_cpus)
                .map(|i| SimCpu {
                    id: CpuId(i),
                    current: None,
                    run_started_ns: 0,
                })
                .collect(),
            queue: BinaryHeap::new(),
            next_seq: 0,
            clock: 0,
            duration_ns: scenario.duration_ns,
            trace: Trace::default(),
        };
        for def in &scenario.tasks {
            run.tasks.insert(def.task, SimTask::new(def));
            run.post(def.start_time_ns, EventKind::TaskWake { task: def.task });
        }
        run
    }

    fn post(&mut self, time_ns: TimeNs, kind: EventKind) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Reverse(Event { time_ns, seq, kind }));
    }

    fn run(mut self) -> Trace {
        while let Some(Reverse(event)) = self.queue.pop() {
            if event.time_ns > self.duration_ns {
                break;
            }
            self.clock = event.time_ns;
            debug!("sim: t={} {:?}", self.clock, event.kind);
            match event.kind {
                EventKind::TaskWake { task } => self.handle_wake(task),
                EventKind::SliceExpired { cpu } => self.handle_slice_expired(cpu),
                EventKind::PhaseComplete { cpu } => self.handle_phase_complete(cpu),
            }
            self.dispatch_idle_cpus();
        }
        self.close_window();
        self.trace
    }

    fn handle_wake(&mut self, task: TaskId) {
        loop {
            let Some(state) = self.tasks.get_mut(&task) else {
                return;
            };
            if state.exited {
                return;
            }
            match state.current_phase() {
                Some(Phase::Run(_)) => {
                    let weight = state.weight;
                    self.trace
                        .record(self.clock, CpuId(0), TraceKind::TaskWoke { task });
                    if let Err(err) = self.sched.enqueue(task, weight) {
                        debug!("sim: wake of {:?} rejected: {}", task, err);
                    }
                    return;
                }
                Some(Phase::Sleep(ns)) if !state.sleeping => {
                    // A scripted sleep begins before the task first runs.
                    state.sleeping = true;
                    self.post(self.clock + ns, EventKind::TaskWake { task });
                    return;
                }
                Some(Phase::Sleep(_)) => {
                    // The pending sleep is over; move on to what follows.
                    state.sleeping = false;
                    if state.advance_phase().is_none() {
                        self.complete_while_blocked(task);
                        return;
                    }
                }
                None => {
                    self.complete_while_blocked(task);
                    return;
                }
            }
        }
    }

    /// A task ran out of phases while blocked: hand it back to the host.
    /// The completion never occupied a CPU, so it is traced on CpuId(0)
    /// purely for the timeline.
    fn complete_while_blocked(&mut self, task: TaskId) {
        self.trace
            .record(self.clock, CpuId(0), TraceKind::TaskCompleted { task });
        if let Err(err) = self.sched.dequeue(task) {
            debug!("sim: dequeue of {:?} rejected: {}", task, err);
        }
    }

    fn handle_slice_expired(&mut self, cpu: CpuId) {
        let Some(task) = self.cpus[cpu.0 as usize].current.take() else {
            return;
        };
        let consumed = self.clock - self.cpus[cpu.0 as usize].run_started_ns;
        let weight = self.account(task, consumed);
        self.trace
            .record(self.clock, cpu, TraceKind::TaskPreempted { task });
        // Preempted tasks go straight back to the run queue.
        if let Err(err) = self.sched.enqueue(task, weight) {
            debug!("sim: re-enqueue of {:?} rejected: {}", task, err);
        }
    }

    fn handle_phase_complete(&mut self, cpu: CpuId) {
        let Some(task) = self.cpus[cpu.0 as usize].current.take() else {
            return;
        };
        let consumed = self.clock - self.cpus[cpu.0 as usize].run_started_ns;
        let weight = self.account(task, consumed);
        let next = self
            .tasks
            .get_mut(&task)
            .and_then(|state| state.advance_phase());
        match next {
            Some(Phase::Sleep(ns)) => {
                if let Some(state) = self.tasks.get_mut(&task) {
                    state.sleeping = true;
                }
                self.trace
                    .record(self.clock, cpu, TraceKind::TaskSlept { task });
                if let Err(err) = self.sched.block(task) {
                    debug!("sim: block of {:?} rejected: {}", task, err);
                }
                self.post(self.clock + ns, EventKind::TaskWake { task });
            }
            Some(Phase::Run(_)) => {
                // Back-to-back run phases: stay runnable.
                self.trace
                    .record(self.clock, cpu, TraceKind::TaskPreempted { task });
                if let Err(err) = self.sched.enqueue(task, weight) {
                    debug!("sim: re-enqueue of {:?} rejected: {}", task, err);
                }
            }
            None => {
                self.trace
                    .record(self.clock, cpu, TraceKind::TaskCompleted { task });
                if let Err(err) = self.sched.dequeue(task) {
                    debug!("sim: dequeue of {:?} rejected: {}", task, err);
                }
            }
        }
    }

    /// Hand work to every idle CPU, in CPU id order for determinism.
    fn dispatch_idle_cpus(&mut self) {
        for i in 0..self.cpus.len() {
            if self.cpus[i].current.is_some() {
                continue;
            }
            match self.sched.pick_next() {
                Decision::Dispatch { task, slice_ns } => {
                    let cpu = self.cpus[i].id;
                    self.cpus[i].current = Some(task);
                    self.cpus[i].run_started_ns = self.clock;
                    self.trace
                        .record(self.clock, cpu, TraceKind::TaskScheduled { task });
                    let remaining = self
                        .tasks
                        .get(&task)
                        .map(|t| t.run_remaining_ns)
                        .unwrap_or(0);
                    if remaining > slice_ns {
                        self.post(self.clock + slice_ns, EventKind::SliceExpired { cpu });
                    } else {
                        self.post(self.clock + remaining, EventKind::PhaseComplete { cpu });
                    }
                }
                Decision::Idle => {
                    self.trace.record(self.clock, self.cpus[i].id, TraceKind::CpuIdle);
                }
            }
        }
    }

    fn account(&mut self, task: TaskId, consumed: TimeNs) -> Weight {
        if let Err(err) = self.sched.on_slice_consumed(task, consumed) {
            debug!("sim: accounting for {:?} rejected: {}", task, err);
        }
        let state = self.tasks.get_mut(&task);
        match state {
            Some(state) => {
                state.run_remaining_ns = state.run_remaining_ns.saturating_sub(consumed);
                state.weight
            }
            None => Weight::DEFAULT,
        }
    }

    /// Close out tasks still on a CPU when the window ends so runtime
    /// accounting covers the full horizon.
    fn close_window(&mut self) {
        self.clock = self.duration_ns;
        for i in 0..self.cpus.len() {
            let Some(task) = self.cpus[i].current.take() else {
                continue;
            };
            let consumed = self.duration_ns - self.cpus[i].run_started_ns;
            self.account(task, consumed);
            let cpu = self.cpus[i].id;
            self.trace
                .record(self.duration_ns, cpu, TraceKind::TaskPreempted { task });
        }
    }
}
