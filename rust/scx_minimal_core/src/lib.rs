// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! scx_minimal_core - A minimal vruntime-fair pluggable CPU scheduling
//! policy.
//!
//! The policy attaches to a host's scheduling class (at most one active
//! instance at a time), tracks every runnable task in a registry, and
//! dispatches the task with the lowest weight-normalized virtual runtime
//! on every idle-CPU request. Compute-bound tasks of equal weight
//! converge to equal shares of CPU time.
//!
//! # Architecture
//!
//! - **Registry**: per-task bookkeeping (weight, state, vruntime)
//! - **Fair**: vtime-ordered run queue and time slice policy
//! - **Sched**: event processing and the try-lock dispatch path
//! - **Lifecycle**: single-active attach/detach state machine
//! - **Host**: the event/decision boundary to the hosting system
//! - **Status**: the on-disk active-policy surface
//! - **Sim**: deterministic host simulation for testing
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use scx_minimal_core::*;
//!
//! let sched = Arc::new(MinimalScheduler::new(SliceConfig::default()).unwrap());
//! let port = Arc::new(FakeHostPort::new());
//! let ctl = LifecycleController::new(port, sched.clone(), None);
//!
//! let handle = ctl.attach("minimal_scheduler").unwrap();
//! sched.enqueue(TaskId(1), Weight::DEFAULT).unwrap();
//! let decision = sched.pick_next();
//! ctl.detach(handle).unwrap();
//! ```

pub mod fair;
pub mod host;
pub mod lifecycle;
pub mod registry;
pub mod sched;
pub mod sim;
pub mod status;
pub mod types;

// Re-export the main public types for convenience.
pub use fair::{
    SliceConfig, SliceConfigError, DEFAULT_SLICE_NS, DEFAULT_SLICE_NS_MIN, NSEC_PER_SEC,
    NSEC_PER_USEC,
};
pub use host::{Decision, FakeHostPort, HostError, HostPort, PolicySpec, SchedEvent};
pub use lifecycle::{
    AttachError, DetachError, InstanceHandle, LifecycleController, LifecycleState,
};
pub use registry::{RegistryError, TaskRegistry, TaskState};
pub use sched::{MinimalScheduler, SchedMetrics, TaskStats};
pub use sim::{Phase, Scenario, Simulator, TaskBehavior, TaskDef, Trace, TraceEvent, TraceKind};
pub use status::{StatusFile, DEFAULT_STATUS_PATH};
pub use types::{CpuId, TaskId, TimeNs, Vtime, Weight};

/// Default policy name, matching the name the host reads back from the
/// status surface.
pub const DEFAULT_POLICY_NAME: &str = "minimal_scheduler";
