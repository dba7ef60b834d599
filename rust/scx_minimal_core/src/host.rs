// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Host port: the narrow boundary between the policy and whatever system
//! hosts it.
//!
//! The host delivers scheduling events (`SchedEvent`) and consumes
//! per-step decisions (`Decision`). Registration installs the policy as
//! the host's scheduling class; deregistration reverts the host to its
//! default policy. The boundary is a trait so tests can substitute an
//! in-process fake.

use std::sync::Mutex;

use thiserror::Error;

use crate::types::{CpuId, TaskId, TimeNs, Weight};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("host registration failed: {0}")]
    RegistrationFailed(String),
    #[error("host deregistration failed: {0}")]
    DeregistrationFailed(String),
}

/// What the policy registers with the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySpec {
    /// Policy name reported on the observability surface.
    pub name: String,
}

/// Inbound scheduling event from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedEvent {
    /// A task became runnable (first wake enrolls it).
    TaskEnqueued { task: TaskId, weight: Weight },
    /// A task left the scheduling class (exit or migration away).
    TaskDequeued { task: TaskId },
    /// A CPU went idle and wants work.
    CpuIdle { cpu: CpuId, now: TimeNs },
}

/// Outbound decision for one dispatch step. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run this task for at most `slice_ns`.
    Dispatch { task: TaskId, slice_ns: TimeNs },
    /// Nothing to run (or the dispatch path was contended).
    Idle,
}

/// Attachment boundary to the host's scheduling class.
pub trait HostPort: Send + Sync {
    /// Install the policy. Called exactly once per attach, by the
    /// lifecycle winner only.
    fn register(&self, spec: &PolicySpec) -> Result<(), HostError>;

    /// Revert the host to its default policy.
    fn deregister(&self) -> Result<(), HostError>;
}

/// In-process host port for tests and simulation. Records the currently
/// registered policy name and can be armed to fail either operation.
#[derive(Debug, Default)]
pub struct FakeHostPort {
    inner: Mutex<FakeHostState>,
}

#[derive(Debug, Default)]
struct FakeHostState {
    registered: Option<String>,
    fail_register: bool,
    fail_deregister: bool,
}

impl FakeHostPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_register(&self) {
        self.inner.lock().unwrap().fail_register = true;
    }

    pub fn fail_next_deregister(&self) {
        self.inner.lock().unwrap().fail_deregister = true;
    }

    /// Name of the policy the host currently has installed, if any.
    pub fn registered_policy(&self) -> Option<String> {
        self.inner.lock().unwrap().registered.clone()
    }
}

impl HostPort for FakeHostPort {
    fn register(&self, spec: &PolicySpec) -> Result<(), HostError> {
        let mut state = self.inner.lock().unwrap();
        if state.fail_register {
            state.fail_register = false;
            return Err(HostError::RegistrationFailed("injected failure".into()));
        }
        state.registered = Some(spec.name.clone());
        Ok(())
    }

    fn deregister(&self) -> Result<(), HostError> {
        let mut state = self.inner.lock().unwrap();
        // The host reverts to its default policy even when deregistration
        // reports an error.
        state.registered = None;
        if state.fail_deregister {
            state.fail_deregister = false;
            return Err(HostError::DeregistrationFailed("injected failure".into()));
        }
        Ok(())
    }
}
