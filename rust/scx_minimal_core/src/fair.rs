// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Fairness allocator: the vruntime-ordered run queue and the time slice
//! policy.
//!
//! Tasks are dispatched from the lowest to the highest vruntime, so any
//! task falling behind its fair share is preferentially rescheduled until
//! it catches up. Ties are broken by enrollment order and then by task id
//! to keep behavior deterministic under equal weights.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use crate::types::{TaskId, TimeNs, Vtime, Weight};

pub const NSEC_PER_USEC: u64 = 1_000;
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Default time slice: 5ms, the value the minimal BPF policy grants.
pub const DEFAULT_SLICE_NS: TimeNs = 5_000_000;

/// Default minimum time slice when scaling down under backlog: 500us.
pub const DEFAULT_SLICE_NS_MIN: TimeNs = 500_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SliceConfigError {
    #[error("invalid slice configuration: slice_ns={slice_ns} slice_ns_min={slice_ns_min}")]
    InvalidSliceConfig { slice_ns: TimeNs, slice_ns_min: TimeNs },
}

/// Time slice configuration for the allocator.
#[derive(Debug, Clone, Copy)]
pub struct SliceConfig {
    /// Base slice granted when a single task is runnable.
    pub slice_ns: TimeNs,
    /// Lower bound when the slice is scaled down under backlog.
    pub slice_ns_min: TimeNs,
}

impl Default for SliceConfig {
    fn default() -> Self {
        SliceConfig {
            slice_ns: DEFAULT_SLICE_NS,
            slice_ns_min: DEFAULT_SLICE_NS_MIN,
        }
    }
}

impl SliceConfig {
    pub fn validate(&self) -> Result<(), SliceConfigError> {
        if self.slice_ns == 0 || self.slice_ns_min == 0 || self.slice_ns_min > self.slice_ns {
            return Err(SliceConfigError::InvalidSliceConfig {
                slice_ns: self.slice_ns,
                slice_ns_min: self.slice_ns_min,
            });
        }
        Ok(())
    }

    /// Scale the slice based on the amount of tasks still waiting to be
    /// scheduled, but never below the minimum. A lone runnable task
    /// receives the full base slice.
    pub fn slice_for(&self, nr_waiting: usize) -> TimeNs {
        (self.slice_ns / (nr_waiting as u64 + 1)).max(self.slice_ns_min)
    }
}

/// Advance a task's vruntime for `consumed` nanoseconds of CPU time,
/// normalized by weight (weight 100 advances 1:1, heavier tasks slower).
///
/// This is the sole formula through which vruntime moves.
pub fn vruntime_delta(consumed: TimeNs, weight: Weight) -> u64 {
    debug_assert!(weight.is_valid());
    consumed.saturating_mul(100) / weight.0 as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RqEntry {
    vtime: Vtime,
    seq: u64,
    task: TaskId,
}

impl Ord for RqEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.vtime
            .cmp(&other.vtime)
            .then_with(|| self.seq.cmp(&other.seq))
            .then_with(|| self.task.cmp(&other.task))
    }
}

impl PartialOrd for RqEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Run queue ordered by vruntime, with a side map from task id to its
/// current entry so re-enqueues and removals stay O(log N).
#[derive(Debug, Default)]
pub struct RunQueue {
    entries: BTreeSet<RqEntry>,
    by_task: HashMap<TaskId, RqEntry>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a task at the given vruntime. If the task is already queued
    /// its previous position is replaced.
    pub fn push(&mut self, task: TaskId, vtime: Vtime, seq: u64) {
        if let Some(prev) = self.by_task.remove(&task) {
            self.entries.remove(&prev);
        }
        let entry = RqEntry { vtime, seq, task };
        self.entries.insert(entry);
        self.by_task.insert(task, entry);
    }

    /// Pop the task with the smallest vruntime, along with that vruntime.
    pub fn pop(&mut self) -> Option<(TaskId, Vtime)> {
        let entry = self.entries.pop_first()?;
        self.by_task.remove(&entry.task);
        Some((entry.task, entry.vtime))
    }

    /// Remove a specific task from the queue. Returns true if it was
    /// queued.
    pub fn remove(&mut self, task: TaskId) -> bool {
        match self.by_task.remove(&task) {
            Some(entry) => self.entries.remove(&entry),
            None => false,
        }
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.by_task.contains_key(&task)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_task.clear();
    }
}
