// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Lifecycle controller: single-active attach/detach with a lock-free
//! state machine.
//!
//! States move strictly Unloaded -> Loading -> Active -> Unloading ->
//! Unloaded. All transitions go through compare-exchange on one atomic,
//! so under concurrent attach attempts exactly one caller wins the
//! Unloaded -> Loading edge and performs host registration; every loser
//! observes `AlreadyActive` without blocking.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};
use thiserror::Error;

use crate::host::{HostPort, PolicySpec};
use crate::sched::MinimalScheduler;
use crate::status::StatusFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Unloaded = 0,
    Loading = 1,
    Active = 2,
    Unloading = 3,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LifecycleState::Unloaded,
            1 => LifecycleState::Loading,
            2 => LifecycleState::Active,
            _ => LifecycleState::Unloading,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttachError {
    #[error("a policy instance is already active")]
    AlreadyActive,
    #[error("host registration failed: {0}")]
    RegistrationFailed(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DetachError {
    #[error("no matching active policy instance")]
    NotActive,
    #[error("host deregistration failed: {0}")]
    DeregistrationFailed(String),
}

/// Proof of a successful attach. Handles are tied to one instance
/// generation; a handle left over from an earlier attach cannot detach a
/// newer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceHandle {
    generation: u64,
}

/// Owns the attach/detach state machine for one host port and one
/// scheduler core.
pub struct LifecycleController {
    state: AtomicU8,
    generation: AtomicU64,
    port: Arc<dyn HostPort>,
    sched: Arc<MinimalScheduler>,
    status: Option<StatusFile>,
    active_name: Mutex<Option<String>>,
}

impl LifecycleController {
    pub fn new(
        port: Arc<dyn HostPort>,
        sched: Arc<MinimalScheduler>,
        status: Option<StatusFile>,
    ) -> Self {
        LifecycleController {
            state: AtomicU8::new(LifecycleState::Unloaded as u8),
            generation: AtomicU64::new(0),
            port,
            sched,
            status,
            active_name: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Name of the active policy, `None` unless the state is Active.
    pub fn current_policy_name(&self) -> Option<String> {
        if self.state() != LifecycleState::Active {
            return None;
        }
        self.active_name.lock().unwrap().clone()
    }

    /// Install the policy on the host. Exactly one caller can hold an
    /// active instance; everyone else gets `AlreadyActive` immediately.
    pub fn attach(&self, name: &str) -> Result<InstanceHandle, AttachError> {
        self.state
            .compare_exchange(
                LifecycleState::Unloaded as u8,
                LifecycleState::Loading as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| AttachError::AlreadyActive)?;

        let spec = PolicySpec { name: name.to_string() };
        if let Err(err) = self.port.register(&spec) {
            self.state
                .store(LifecycleState::Unloaded as u8, Ordering::Release);
            return Err(AttachError::RegistrationFailed(err.to_string()));
        }

        if let Some(status) = &self.status {
            // The status write is also the cross-process claim: another
            // process holding the slot shows up as AlreadyExists here.
            if let Err(err) = status.write_name(name) {
                // Unwind: the host must not stay registered when the
                // attach reports failure.
                if let Err(err) = self.port.deregister() {
                    warn!("deregister during attach unwind failed: {}", err);
                }
                self.state
                    .store(LifecycleState::Unloaded as u8, Ordering::Release);
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    return Err(AttachError::AlreadyActive);
                }
                return Err(AttachError::RegistrationFailed(format!(
                    "status file: {}",
                    err
                )));
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *self.active_name.lock().unwrap() = Some(name.to_string());
        self.state
            .store(LifecycleState::Active as u8, Ordering::Release);
        info!("{} scheduler attached", name);
        Ok(InstanceHandle { generation })
    }

    /// Remove the policy from the host. Always reaches Unloaded, even
    /// when host deregistration reports an error: the host reverts to
    /// its default policy regardless, and wedging in Unloading would
    /// block every future attach.
    pub fn detach(&self, handle: InstanceHandle) -> Result<(), DetachError> {
        self.state
            .compare_exchange(
                LifecycleState::Active as u8,
                LifecycleState::Unloading as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| DetachError::NotActive)?;

        if handle.generation != self.generation.load(Ordering::Acquire) {
            // Stale handle from a previous instance; the current one
            // stays up.
            self.state
                .store(LifecycleState::Active as u8, Ordering::Release);
            return Err(DetachError::NotActive);
        }

        let drained = self.sched.drain();
        let name = self.active_name.lock().unwrap().take();
        if let Some(status) = &self.status {
            if let Err(err) = status.clear() {
                warn!("failed to clear status file: {}", err);
            }
        }
        let result = self.port.deregister();
        self.state
            .store(LifecycleState::Unloaded as u8, Ordering::Release);
        info!(
            "{} scheduler detached ({} tasks handed back)",
            name.as_deref().unwrap_or("?"),
            drained
        );
        result.map_err(|err| DetachError::DeregistrationFailed(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fair::SliceConfig;
    use crate::host::FakeHostPort;
    use crate::types::{TaskId, Weight};

    fn controller() -> (Arc<FakeHostPort>, LifecycleController) {
        let port = Arc::new(FakeHostPort::new());
        let sched = Arc::new(MinimalScheduler::new(SliceConfig::default()).unwrap());
        let ctl = LifecycleController::new(port.clone(), sched, None);
        (port, ctl)
    }

    #[test]
    fn test_attach_detach_cycle() {
        let (port, ctl) = controller();
        assert_eq!(ctl.state(), LifecycleState::Unloaded);
        let handle = ctl.attach("minimal_scheduler").unwrap();
        assert_eq!(ctl.state(), LifecycleState::Active);
        assert_eq!(
            ctl.current_policy_name(),
            Some("minimal_scheduler".to_string())
        );
        assert_eq!(port.registered_policy(), Some("minimal_scheduler".into()));
        ctl.detach(handle).unwrap();
        assert_eq!(ctl.state(), LifecycleState::Unloaded);
        assert_eq!(ctl.current_policy_name(), None);
        assert_eq!(port.registered_policy(), None);
    }

    #[test]
    fn test_second_attach_rejected() {
        let (_port, ctl) = controller();
        let handle = ctl.attach("minimal_scheduler").unwrap();
        assert_eq!(
            ctl.attach("minimal_scheduler"),
            Err(AttachError::AlreadyActive)
        );
        ctl.detach(handle).unwrap();
        // After a full cycle a fresh attach succeeds.
        ctl.attach("minimal_scheduler").unwrap();
    }

    #[test]
    fn test_double_detach_rejected() {
        let (_port, ctl) = controller();
        let handle = ctl.attach("minimal_scheduler").unwrap();
        ctl.detach(handle).unwrap();
        assert_eq!(ctl.detach(handle), Err(DetachError::NotActive));
    }

    #[test]
    fn test_registration_failure_unwinds() {
        let (port, ctl) = controller();
        port.fail_next_register();
        assert!(matches!(
            ctl.attach("minimal_scheduler"),
            Err(AttachError::RegistrationFailed(_))
        ));
        assert_eq!(ctl.state(), LifecycleState::Unloaded);
        // The failed attempt holds nothing; a retry works.
        ctl.attach("minimal_scheduler").unwrap();
    }

    #[test]
    fn test_deregistration_failure_still_unloads() {
        let (port, ctl) = controller();
        let handle = ctl.attach("minimal_scheduler").unwrap();
        port.fail_next_deregister();
        assert!(matches!(
            ctl.detach(handle),
            Err(DetachError::DeregistrationFailed(_))
        ));
        assert_eq!(ctl.state(), LifecycleState::Unloaded);
        ctl.attach("minimal_scheduler").unwrap();
    }

    #[test]
    fn test_stale_handle_cannot_detach_new_instance() {
        let (_port, ctl) = controller();
        let old = ctl.attach("minimal_scheduler").unwrap();
        ctl.detach(old).unwrap();
        let fresh = ctl.attach("minimal_scheduler").unwrap();
        assert_eq!(ctl.detach(old), Err(DetachError::NotActive));
        assert_eq!(ctl.state(), LifecycleState::Active);
        ctl.detach(fresh).unwrap();
    }

    #[test]
    fn test_detach_drains_registry() {
        let port = Arc::new(FakeHostPort::new());
        let sched = Arc::new(MinimalScheduler::new(SliceConfig::default()).unwrap());
        let ctl = LifecycleController::new(port, sched.clone(), None);
        let handle = ctl.attach("minimal_scheduler").unwrap();
        for pid in 1..=4 {
            sched.enqueue(TaskId(pid), Weight::DEFAULT).unwrap();
        }
        ctl.detach(handle).unwrap();
        assert_eq!(sched.metrics().nr_tasks, 0);
        assert_eq!(sched.metrics().nr_queued, 0);
    }

    fn controller_with_status(status: StatusFile) -> LifecycleController {
        let port = Arc::new(FakeHostPort::new());
        let sched = Arc::new(MinimalScheduler::new(SliceConfig::default()).unwrap());
        LifecycleController::new(port, sched, Some(status))
    }

    #[test]
    fn test_status_file_claims_single_active_slot() {
        // Two controllers (standing in for two processes) share one
        // status path; only one may hold an active instance at a time.
        let dir = tempfile::tempdir().unwrap();
        let status = StatusFile::new(dir.path().join("status"));
        let ctl_a = controller_with_status(status.clone());
        let ctl_b = controller_with_status(status.clone());

        let handle_a = ctl_a.attach("policy_a").unwrap();
        assert_eq!(ctl_b.attach("policy_b"), Err(AttachError::AlreadyActive));
        // The loser must not clobber the published name, and must unwind
        // fully.
        assert_eq!(status.read().unwrap(), Some("policy_a".to_string()));
        assert_eq!(ctl_a.state(), LifecycleState::Active);
        assert_eq!(ctl_b.state(), LifecycleState::Unloaded);

        // Once the winner detaches, the slot is free for the other side.
        ctl_a.detach(handle_a).unwrap();
        let handle_b = ctl_b.attach("policy_b").unwrap();
        assert_eq!(status.read().unwrap(), Some("policy_b".to_string()));
        ctl_b.detach(handle_b).unwrap();
    }

    #[test]
    fn test_status_file_follows_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let status = StatusFile::new(dir.path().join("status"));
        let port = Arc::new(FakeHostPort::new());
        let sched = Arc::new(MinimalScheduler::new(SliceConfig::default()).unwrap());
        let ctl = LifecycleController::new(port, sched, Some(status.clone()));
        let handle = ctl.attach("minimal_scheduler").unwrap();
        assert_eq!(
            status.read().unwrap(),
            Some("minimal_scheduler".to_string())
        );
        ctl.detach(handle).unwrap();
        assert_eq!(status.read().unwrap(), None);
    }
}
