// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Task registry: the set of tasks known to the scheduler and their
//! accounting state.
//!
//! Entries are indexed by task id and removed when the corresponding task
//! departs. Every enrolled task is always in exactly one of the tracked
//! states; there is no silent task loss.

use std::collections::HashMap;

use thiserror::Error;

use crate::types::{TaskId, TimeNs, Vtime, Weight};

/// The state a tracked task can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Task is ready to run but not currently executing on any CPU.
    Runnable,
    /// Task is currently executing on a CPU.
    Running,
    /// Task is blocked (not runnable).
    Blocked,
    /// Task has departed and is about to be evicted.
    Departed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("task {0:?} is already enrolled")]
    DuplicateTask(TaskId),
    #[error("task {0:?} is not tracked")]
    UnknownTask(TaskId),
    #[error("invalid transition for task {task:?}: already {state:?}")]
    InvalidTransition { task: TaskId, state: TaskState },
    #[error("invalid weight {0}: must be greater than zero")]
    InvalidWeight(u32),
}

/// Bookkeeping for a single tracked task.
#[derive(Debug)]
pub(crate) struct TaskCtx {
    pub weight: Weight,
    pub state: TaskState,
    /// Weight-normalized accumulated runtime. Only advances while the
    /// task consumes CPU; never reset until the task departs.
    pub vruntime: Vtime,
    /// Total CPU time consumed, in nanoseconds.
    pub sum_exec_runtime: TimeNs,
    /// Enrollment sequence number, used for FIFO tie-breaking.
    pub seq: u64,
}

/// Tracks all tasks currently known to the scheduler instance.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<TaskId, TaskCtx>,
    next_seq: u64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new task in the Runnable state. `vruntime` is the
    /// starting virtual runtime (callers pass the instance-wide minimum
    /// so newcomers do not starve existing tasks).
    pub fn enroll(
        &mut self,
        task: TaskId,
        weight: Weight,
        vruntime: Vtime,
    ) -> Result<(), RegistryError> {
        if !weight.is_valid() {
            return Err(RegistryError::InvalidWeight(weight.0));
        }
        if self.tasks.contains_key(&task) {
            return Err(RegistryError::DuplicateTask(task));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tasks.insert(
            task,
            TaskCtx {
                weight,
                state: TaskState::Runnable,
                vruntime,
                sum_exec_runtime: 0,
                seq,
            },
        );
        Ok(())
    }

    /// Transition a task to Blocked. Blocking an already blocked task is
    /// an error, as is blocking an untracked task.
    pub fn mark_blocked(&mut self, task: TaskId) -> Result<(), RegistryError> {
        let ctx = self
            .tasks
            .get_mut(&task)
            .ok_or(RegistryError::UnknownTask(task))?;
        match ctx.state {
            TaskState::Blocked | TaskState::Departed => Err(RegistryError::InvalidTransition {
                task,
                state: ctx.state,
            }),
            _ => {
                ctx.state = TaskState::Blocked;
                Ok(())
            }
        }
    }

    /// Transition a Blocked task back to Runnable.
    pub fn mark_runnable(&mut self, task: TaskId) -> Result<(), RegistryError> {
        let ctx = self
            .tasks
            .get_mut(&task)
            .ok_or(RegistryError::UnknownTask(task))?;
        match ctx.state {
            TaskState::Blocked => {
                ctx.state = TaskState::Runnable;
                Ok(())
            }
            state => Err(RegistryError::InvalidTransition { task, state }),
        }
    }

    /// Evict a departed task's bookkeeping.
    pub fn remove(&mut self, task: TaskId) -> Result<(), RegistryError> {
        match self.tasks.remove(&task) {
            Some(_) => Ok(()),
            None => Err(RegistryError::UnknownTask(task)),
        }
    }

    /// Ordered snapshot of all Runnable tasks: sorted by vruntime, ties
    /// broken by enrollment order.
    pub fn snapshot(&self) -> Vec<(TaskId, Vtime)> {
        let mut runnable: Vec<(&TaskId, &TaskCtx)> = self
            .tasks
            .iter()
            .filter(|(_, ctx)| ctx.state == TaskState::Runnable)
            .collect();
        runnable.sort_by(|(_, a), (_, b)| a.vruntime.cmp(&b.vruntime).then(a.seq.cmp(&b.seq)));
        runnable
            .into_iter()
            .map(|(id, ctx)| (*id, ctx.vruntime))
            .collect()
    }

    /// Drop all tracked tasks, handing them back to the host's default
    /// policy. Returns the number of tasks drained.
    pub fn drain(&mut self) -> usize {
        let n = self.tasks.len();
        self.tasks.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.tasks.contains_key(&task)
    }

    pub(crate) fn get(&self, task: TaskId) -> Option<&TaskCtx> {
        self.tasks.get(&task)
    }

    pub(crate) fn get_mut(&mut self, task: TaskId) -> Option<&mut TaskCtx> {
        self.tasks.get_mut(&task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(tasks: &[i32]) -> TaskRegistry {
        let mut reg = TaskRegistry::new();
        for &pid in tasks {
            reg.enroll(TaskId(pid), Weight::DEFAULT, Vtime(0)).unwrap();
        }
        reg
    }

    #[test]
    fn test_enroll_duplicate() {
        let mut reg = registry_with(&[1]);
        assert_eq!(
            reg.enroll(TaskId(1), Weight::DEFAULT, Vtime(0)),
            Err(RegistryError::DuplicateTask(TaskId(1)))
        );
    }

    #[test]
    fn test_enroll_invalid_weight() {
        let mut reg = TaskRegistry::new();
        assert_eq!(
            reg.enroll(TaskId(1), Weight(0), Vtime(0)),
            Err(RegistryError::InvalidWeight(0))
        );
        assert!(reg.is_empty());
    }

    #[test]
    fn test_block_wake_transitions() {
        let mut reg = registry_with(&[1]);
        reg.mark_blocked(TaskId(1)).unwrap();
        // Double block is rejected.
        assert_eq!(
            reg.mark_blocked(TaskId(1)),
            Err(RegistryError::InvalidTransition {
                task: TaskId(1),
                state: TaskState::Blocked,
            })
        );
        reg.mark_runnable(TaskId(1)).unwrap();
        // Waking an already runnable task is rejected.
        assert_eq!(
            reg.mark_runnable(TaskId(1)),
            Err(RegistryError::InvalidTransition {
                task: TaskId(1),
                state: TaskState::Runnable,
            })
        );
    }

    #[test]
    fn test_unknown_task() {
        let mut reg = TaskRegistry::new();
        assert_eq!(
            reg.mark_blocked(TaskId(99)),
            Err(RegistryError::UnknownTask(TaskId(99)))
        );
        assert_eq!(
            reg.remove(TaskId(99)),
            Err(RegistryError::UnknownTask(TaskId(99)))
        );
    }

    #[test]
    fn test_snapshot_orders_by_vruntime_then_fifo() {
        let mut reg = registry_with(&[1, 2, 3]);
        reg.get_mut(TaskId(2)).unwrap().vruntime = Vtime(500);
        // 1 and 3 tie at vruntime 0; task 1 enrolled first.
        let snap = reg.snapshot();
        let ids: Vec<TaskId> = snap.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![TaskId(1), TaskId(3), TaskId(2)]);
    }

    #[test]
    fn test_snapshot_skips_non_runnable() {
        let mut reg = registry_with(&[1, 2]);
        reg.mark_blocked(TaskId(2)).unwrap();
        let snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].0, TaskId(1));
    }

    #[test]
    fn test_drain() {
        let mut reg = registry_with(&[1, 2, 3]);
        assert_eq!(reg.drain(), 3);
        assert!(reg.is_empty());
    }
}
