// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Newtype wrappers and type aliases for scheduler domain concepts.
//!
//! Newtypes for identifiers (task IDs, CPU IDs) and virtual time prevent
//! silent type confusion. Type aliases for plain quantities (timestamps)
//! provide self-documenting code without the boilerplate of implementing
//! arithmetic traits.

/// Task identifier, opaque and stable for the task's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub i32);

/// CPU identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuId(pub u32);

/// Time in nanoseconds.
pub type TimeNs = u64;

/// Virtual time for fair scheduling (opaque u64, not nanoseconds).
///
/// Ordering uses wrapping comparison (like the kernel's `time_before64`),
/// so `Vtime(u64::MAX)` compares as less than `Vtime(0)` when they are
/// within half the u64 range of each other.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Vtime(pub u64);

impl PartialOrd for Vtime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Vtime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Matches kernel time_before64: (s64)(a - b) < 0 means a < b.
        // Wrapping subtraction cast to i64 handles overflow correctly.
        (self.0.wrapping_sub(other.0) as i64).cmp(&0)
    }
}

/// Relative share entitlement of a task. The default weight is 100,
/// matching the sched_ext static priority scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Weight(pub u32);

impl Weight {
    pub const DEFAULT: Weight = Weight(100);

    /// A weight of zero would make a task's vruntime advance unbounded.
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl Default for Weight {
    fn default() -> Self {
        Weight::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vtime_wrapping_order() {
        assert!(Vtime(1) < Vtime(2));
        assert!(Vtime(u64::MAX) < Vtime(0));
        assert!(Vtime(u64::MAX - 10) < Vtime(5));
        assert_eq!(Vtime(7).cmp(&Vtime(7)), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_weight_validity() {
        assert!(Weight::DEFAULT.is_valid());
        assert!(!Weight(0).is_valid());
    }
}
