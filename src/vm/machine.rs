//! The per-instance power state machine.
//!
//! Every operation takes the instance's lock for its whole duration, so
//! operations on one instance are serialised while different instances
//! proceed independently. A transition is persisted through the
//! [`StatusMonitor`] before it is applied in memory.

use super::backend::Hypervisor;
use super::guest::{broadcast_bounded, GuestChannel};
use super::shutdown::{ShutdownController, CANCEL_NOTICE, FINAL_NOTICE};
use super::specs::VmSpecs;
use super::state::VmState;
use super::StatusMonitor;
use crate::config::ShutdownSettings;
use crate::error::{Error, ErrorKind, Result};
use crate::snapshot::{SnapshotChain, SnapshotInfo, SnapshotRecord};
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;

struct VmInner {
    state: VmState,
    specs: VmSpecs,
    chain: SnapshotChain,
    shutdown: Option<ShutdownController>,
    active_mounts: BTreeSet<String>,
    saved_state: Option<VmState>,
    next_shutdown_id: u64,
}

/// One instance: power state, specs and snapshot chain.
pub struct VirtualMachine {
    name: String,
    inner: Mutex<VmInner>,
    hypervisor: Option<Arc<dyn Hypervisor>>,
    guest: Option<Arc<dyn GuestChannel>>,
    monitor: Arc<dyn StatusMonitor>,
    settings: ShutdownSettings,
    guest_identity_token: String,
    weak_self: Weak<VirtualMachine>,
}

impl std::fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("name", &self.name)
            .field("hypervisor", &self.hypervisor.as_ref().map(|h| h.name()))
            .finish_non_exhaustive()
    }
}

/// Builder for [`VirtualMachine`].
pub struct VmBuilder {
    name: String,
    chain: SnapshotChain,
    monitor: Arc<dyn StatusMonitor>,
    state: VmState,
    specs: VmSpecs,
    hypervisor: Option<Arc<dyn Hypervisor>>,
    guest: Option<Arc<dyn GuestChannel>>,
    settings: ShutdownSettings,
    guest_identity_token: Option<String>,
}

impl VmBuilder {
    /// Initial power state (default `off`).
    pub fn state(mut self, state: VmState) -> Self {
        self.state = state;
        self
    }

    /// Current specs.
    pub fn specs(mut self, specs: VmSpecs) -> Self {
        self.specs = specs;
        self
    }

    /// Attach a hypervisor.
    pub fn hypervisor(mut self, hypervisor: Arc<dyn Hypervisor>) -> Self {
        self.hypervisor = Some(hypervisor);
        self
    }

    /// Attach a guest channel.
    pub fn guest(mut self, guest: Arc<dyn GuestChannel>) -> Self {
        self.guest = Some(guest);
        self
    }

    /// Shutdown timing.
    pub fn shutdown_settings(mut self, settings: ShutdownSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Guest identity token recorded in new snapshots (default: the name).
    pub fn guest_identity_token(mut self, token: impl Into<String>) -> Self {
        self.guest_identity_token = Some(token.into());
        self
    }

    /// Build the instance.
    pub fn build(self) -> Arc<VirtualMachine> {
        let token = self
            .guest_identity_token
            .unwrap_or_else(|| self.name.clone());
        Arc::new_cyclic(|weak_self| VirtualMachine {
            name: self.name,
            inner: Mutex::new(VmInner {
                state: self.state,
                specs: self.specs,
                chain: self.chain,
                shutdown: None,
                active_mounts: BTreeSet::new(),
                saved_state: None,
                next_shutdown_id: 1,
            }),
            hypervisor: self.hypervisor,
            guest: self.guest,
            monitor: self.monitor,
            settings: self.settings,
            guest_identity_token: token,
            weak_self: weak_self.clone(),
        })
    }
}

fn invalid_state(expected: &str, actual: VmState) -> Error {
    Error::InvalidState {
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

impl VirtualMachine {
    /// Start building an instance around its chain.
    pub fn builder(
        name: impl Into<String>,
        chain: SnapshotChain,
        monitor: Arc<dyn StatusMonitor>,
    ) -> VmBuilder {
        VmBuilder {
            name: name.into(),
            chain,
            monitor,
            state: VmState::Off,
            specs: VmSpecs::default(),
            hypervisor: None,
            guest: None,
            settings: ShutdownSettings::default(),
            guest_identity_token: None,
        }
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current power state.
    pub async fn state(&self) -> VmState {
        self.inner.lock().await.state
    }

    /// Current specs.
    pub async fn specs(&self) -> VmSpecs {
        self.inner.lock().await.specs.clone()
    }

    /// Time left on a pending delayed shutdown.
    pub async fn pending_shutdown(&self) -> Option<Duration> {
        self.inner
            .lock()
            .await
            .shutdown
            .as_ref()
            .map(|c| c.remaining())
    }

    fn hypervisor(&self) -> Result<Arc<dyn Hypervisor>> {
        self.hypervisor
            .clone()
            .ok_or_else(|| Error::HypervisorUnavailable(format!("no hypervisor attached to {}", self.name)))
    }

    fn commit_state(&self, inner: &mut VmInner, to: VmState) -> Result<()> {
        let from = inner.state;
        if from == to {
            return Ok(());
        }
        self.monitor.persist_state_for(&self.name, to)?;
        inner.state = to;
        tracing::info!(vm = %self.name, from = %from, to = %to, "state changed");
        self.monitor.on_transition(&self.name, from, to);
        Ok(())
    }

    /// Settle the state after a failed backend call and hand back the error.
    fn settle_failure(&self, inner: &mut VmInner, prior: VmState, err: Error) -> Error {
        let fallback = if err.is_no_op() {
            prior
        } else {
            VmState::Unknown
        };
        tracing::warn!(vm = %self.name, error = %err, fallback = %fallback, "backend call failed");
        if let Err(e) = self.commit_state(inner, fallback) {
            tracing::error!(vm = %self.name, error = %e, "failed to record state after backend failure");
        }
        err
    }

    async fn send_notice(&self, message: &str) -> Result<()> {
        let guest = self
            .guest
            .as_ref()
            .ok_or_else(|| Error::guest(&self.name, "no guest channel"))?;
        broadcast_bounded(guest.as_ref(), &self.name, message, self.settings.notice_timeout).await
    }

    async fn activate_mounts(&self, inner: &mut VmInner, hv: &dyn Hypervisor) {
        let pending: Vec<_> = inner
            .specs
            .mounts
            .iter()
            .filter(|(target, _)| !inner.active_mounts.contains(*target))
            .map(|(target, mount)| (target.clone(), mount.clone()))
            .collect();
        for (target, mount) in pending {
            match hv.activate_mount(&target, &mount).await {
                Ok(()) => {
                    inner.active_mounts.insert(target);
                }
                Err(e) => {
                    tracing::warn!(vm = %self.name, target = %target, error = %e, "failed to activate mount")
                }
            }
        }
    }

    async fn deactivate_mounts(&self, inner: &mut VmInner, hv: &dyn Hypervisor) {
        for target in std::mem::take(&mut inner.active_mounts) {
            if let Err(e) = hv.deactivate_mount(&target).await {
                tracing::warn!(vm = %self.name, target = %target, error = %e, "failed to deactivate mount");
            }
        }
    }

    async fn power_on(&self, inner: &mut VmInner, hv: &dyn Hypervisor) -> Result<()> {
        let prior = inner.state;
        self.commit_state(inner, VmState::Starting)?;

        let result = if prior == VmState::Suspended {
            hv.resume().await
        } else {
            let boot_disk = inner.chain.boot_disk().await;
            match boot_disk {
                Ok(disk) => hv.start(&disk, &inner.specs).await,
                Err(e) => {
                    self.commit_state(inner, prior)?;
                    return Err(e);
                }
            }
        };

        if let Err(e) = result {
            return Err(self.settle_failure(inner, prior, e));
        }
        self.commit_state(inner, VmState::Running)?;
        self.activate_mounts(inner, hv).await;
        Ok(())
    }

    /// Power on from `off`, `stopped` or `suspended`. No-op when running.
    pub async fn start(&self) -> Result<()> {
        let hv = self.hypervisor()?;
        let mut inner = self.inner.lock().await;
        match inner.state {
            s if s.is_running() => Ok(()),
            s if s.can_start() => self.power_on(&mut inner, hv.as_ref()).await,
            s => Err(invalid_state("off, stopped or suspended", s)),
        }
    }

    /// Continue a suspended instance.
    pub async fn resume(&self) -> Result<()> {
        let hv = self.hypervisor()?;
        let mut inner = self.inner.lock().await;
        match inner.state {
            VmState::Suspended => self.power_on(&mut inner, hv.as_ref()).await,
            s => Err(invalid_state("suspended", s)),
        }
    }

    /// Suspend a running instance.
    pub async fn suspend(&self) -> Result<()> {
        let hv = self.hypervisor()?;
        let mut inner = self.inner.lock().await;
        match inner.state {
            VmState::Suspended => return Ok(()),
            VmState::Running => {}
            s => return Err(invalid_state("running", s)),
        }

        self.commit_state(&mut inner, VmState::Suspending)?;
        if let Err(e) = hv.suspend().await {
            return Err(self.settle_failure(&mut inner, VmState::Running, e));
        }
        self.commit_state(&mut inner, VmState::Suspended)?;
        self.monitor.on_suspend(&self.name);
        Ok(())
    }

    /// Reboot a running instance.
    pub async fn restart(&self) -> Result<()> {
        let hv = self.hypervisor()?;
        let mut inner = self.inner.lock().await;
        if inner.state != VmState::Running {
            return Err(invalid_state("running", inner.state));
        }

        self.commit_state(&mut inner, VmState::Restarting)?;
        if let Err(e) = hv.restart().await {
            return Err(self.settle_failure(&mut inner, VmState::Running, e));
        }
        self.commit_state(&mut inner, VmState::Running)?;
        self.monitor.on_restart(&self.name);
        Ok(())
    }

    /// Request a shutdown after `delay`.
    ///
    /// A zero delay powers off before returning. Otherwise the instance moves
    /// to `delayed_shutdown` and a countdown is started, replacing any
    /// countdown already pending. No-op when the instance is already off.
    pub async fn shutdown(&self, delay: Duration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            s if s.is_quiescent() => {
                tracing::debug!(vm = %self.name, state = %s, "already shut down");
                return Ok(());
            }
            VmState::Running | VmState::DelayedShutdown => {}
            VmState::Suspended | VmState::Unknown if delay.is_zero() => {}
            s => return Err(invalid_state("running", s)),
        }
        let hv = self.hypervisor()?;

        if let Some(previous) = inner.shutdown.take() {
            tracing::debug!(vm = %self.name, id = previous.id(), "replacing pending shutdown");
            previous.cancel();
        }

        if delay.is_zero() {
            if let Err(e) = self.send_notice(FINAL_NOTICE).await {
                tracing::warn!(vm = %self.name, error = %e, "failed to send shutdown notice");
            }
            let prior = match inner.state {
                VmState::DelayedShutdown => VmState::Running,
                s => s,
            };
            return self.perform_shutdown(&mut inner, hv.as_ref(), prior).await;
        }

        let id = inner.next_shutdown_id;
        inner.next_shutdown_id += 1;
        self.commit_state(&mut inner, VmState::DelayedShutdown)?;
        inner.shutdown = Some(ShutdownController::spawn(
            id,
            delay,
            self.weak_self.clone(),
            self.name.clone(),
            self.guest.clone(),
            self.settings,
        ));
        tracing::info!(vm = %self.name, id, delay = %humantime::format_duration(delay), "shutdown scheduled");
        Ok(())
    }

    async fn perform_shutdown(
        &self,
        inner: &mut VmInner,
        hv: &dyn Hypervisor,
        prior: VmState,
    ) -> Result<()> {
        self.deactivate_mounts(inner, hv).await;
        if let Err(e) = hv.shutdown().await {
            return Err(self.settle_failure(inner, prior, e));
        }
        self.commit_state(inner, VmState::Off)?;
        self.monitor.on_shutdown(&self.name);
        Ok(())
    }

    /// Called by the countdown at its deadline.
    pub(crate) async fn complete_delayed_shutdown(&self, id: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match &inner.shutdown {
            Some(controller) if controller.id() == id => {}
            _ => {
                tracing::debug!(vm = %self.name, id, "shutdown request superseded");
                return Ok(());
            }
        }
        inner.shutdown = None;
        let hv = self.hypervisor()?;
        self.perform_shutdown(&mut inner, hv.as_ref(), VmState::Running)
            .await
    }

    /// Cancel a pending delayed shutdown.
    ///
    /// The guest is told the shutdown was cancelled. If it acknowledges, the
    /// instance is `running` again; if it cannot be reached the state becomes
    /// `unknown` and the error is returned. No-op when nothing is pending.
    pub async fn cancel_shutdown(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(controller) = inner.shutdown.take() else {
            tracing::debug!(vm = %self.name, "no pending shutdown to cancel");
            return Ok(());
        };
        controller.cancel();
        drop(controller);

        match self.send_notice(CANCEL_NOTICE).await {
            Ok(()) => {
                self.commit_state(&mut inner, VmState::Running)?;
                tracing::info!(vm = %self.name, "shutdown cancelled");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(vm = %self.name, error = %e, "guest did not acknowledge cancellation");
                self.commit_state(&mut inner, VmState::Unknown)?;
                Err(e)
            }
        }
    }

    /// Make the instance unavailable, or bring it back.
    ///
    /// Going unavailable powers off a running instance and remembers its
    /// state. If the power-off fails the instance stays available and the
    /// error is returned. Coming back restores that state, starting the
    /// instance again when it had been running.
    pub async fn set_available(&self, available: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if available {
            if inner.state != VmState::Unavailable {
                return Ok(());
            }
            let prior = inner.saved_state.take().unwrap_or(VmState::Off);
            if prior.is_quiescent() || prior == VmState::Suspended {
                return self.commit_state(&mut inner, prior);
            }
            self.commit_state(&mut inner, VmState::Off)?;
            let hv = self.hypervisor()?;
            return self.power_on(&mut inner, hv.as_ref()).await;
        }

        if inner.state == VmState::Unavailable {
            return Ok(());
        }
        if let Some(controller) = inner.shutdown.take() {
            controller.cancel();
        }
        let prior = match inner.state {
            VmState::DelayedShutdown => VmState::Running,
            s => s,
        };
        if prior.is_running() {
            if let Some(hv) = self.hypervisor.clone() {
                self.deactivate_mounts(&mut inner, hv.as_ref()).await;
                if let Err(e) = hv.shutdown().await {
                    return Err(self.settle_failure(&mut inner, prior, e));
                }
            }
        }
        self.commit_state(&mut inner, VmState::Unavailable)?;
        inner.saved_state = Some(prior);
        Ok(())
    }

    /// Overwrite the power state without touching the hypervisor.
    ///
    /// Recovery path for callers that have established the real state by
    /// other means. Any pending shutdown is dropped.
    pub async fn force_state(&self, state: VmState) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(controller) = inner.shutdown.take() {
            controller.cancel();
        }
        if state != VmState::Unavailable {
            inner.saved_state = None;
        }
        tracing::warn!(vm = %self.name, from = %inner.state, to = %state, "forcing state");
        self.commit_state(&mut inner, state)
    }

    /// Capture the current state as a new snapshot.
    ///
    /// An empty name generates one.
    pub async fn take_snapshot(&self, name: &str, comment: &str) -> Result<SnapshotRecord> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner
            .chain
            .capture(name, comment, &inner.specs, inner.state, &self.guest_identity_token)
            .await
    }

    /// Restore a snapshot's disk and specs.
    ///
    /// Unless `destructive`, the current state is first captured as an
    /// automatic snapshot.
    pub async fn restore_snapshot(&self, name: &str, destructive: bool) -> Result<SnapshotRecord> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.chain.get(name).is_none() {
            return Err(Error::snapshot_not_found(&self.name, name));
        }
        inner.chain.check_capture("", inner.state).or_else(|e| match e {
            Error::SnapshotLimitExceeded { .. } if destructive => Ok(()),
            e => Err(e),
        })?;

        if !destructive {
            let comment = format!("Before restoring {}", name);
            let auto = inner
                .chain
                .capture("", &comment, &inner.specs, inner.state, &self.guest_identity_token)
                .await?;
            tracing::info!(vm = %self.name, snapshot = %auto.name(), "saved state before restore");
        }

        let record = inner.chain.apply(name, inner.state).await?;
        let mut specs = inner.specs.clone();
        record.apply_to(&mut specs);

        let persisted = self.monitor.persist_specs_for(&self.name, &specs);
        inner.specs = specs;
        if let Err(e) = persisted {
            tracing::error!(vm = %self.name, error = %e, "restored disk but failed to persist specs");
            if let Err(state_err) = self.commit_state(inner, VmState::Unknown) {
                tracing::error!(vm = %self.name, error = %state_err, "failed to record unknown state");
            }
            return Err(e);
        }
        Ok(record)
    }

    /// Delete a snapshot, reparenting its children.
    pub async fn delete_snapshot(&self, name: &str) -> Result<SnapshotRecord> {
        let mut inner = self.inner.lock().await;
        if inner.chain.get(name).is_none() {
            return Err(Error::snapshot_not_found(&self.name, name));
        }
        if !inner.state.is_quiescent() {
            return Err(Error::InvalidStateForSnapshot {
                vm: self.name.clone(),
                state: inner.state.to_string(),
            });
        }
        let erased = inner.chain.erase(name).await;
        match erased {
            Err(e) if e.kind() == ErrorKind::Invariant => {
                tracing::error!(vm = %self.name, snapshot = %name, error = %e, "disk chain left inconsistent");
                self.commit_state(&mut inner, VmState::Unknown)?;
                Err(e)
            }
            result => result,
        }
    }

    /// Rename a snapshot.
    pub async fn rename_snapshot(&self, old: &str, new: &str) -> Result<()> {
        self.inner.lock().await.chain.rename(old, new)
    }

    /// Replace a snapshot's comment.
    pub async fn set_snapshot_comment(&self, name: &str, comment: &str) -> Result<()> {
        self.inner.lock().await.chain.set_comment(name, comment)
    }

    /// Describe one snapshot.
    pub async fn snapshot_info(&self, name: &str) -> Result<SnapshotInfo> {
        self.inner.lock().await.chain.info(name)
    }

    /// Describe every snapshot, in index order.
    pub async fn snapshots(&self) -> Vec<SnapshotInfo> {
        let inner = self.inner.lock().await;
        inner
            .chain
            .iter()
            .filter_map(|node| inner.chain.info(node.name()).ok())
            .collect()
    }

    /// Number of snapshots.
    pub async fn snapshot_count(&self) -> usize {
        self.inner.lock().await.chain.len()
    }

    /// Check recorded disk parents against the backend.
    pub async fn verify_snapshots(&self) -> Result<()> {
        self.inner.lock().await.chain.verify().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DiskLayout;
    use crate::vm::specs::VmMount;
    use crate::vm::testing::TestVm;

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let t = TestVm::new(VmState::Off);
        t.vm.start().await.unwrap();
        assert_eq!(t.vm.state().await, VmState::Running);
        assert_eq!(
            t.monitor.states(),
            vec![VmState::Starting, VmState::Running]
        );
        assert_eq!(t.hypervisor.calls()[0], format!("start {}", t.base_disk()));

        t.vm.shutdown(Duration::ZERO).await.unwrap();
        assert_eq!(t.vm.state().await, VmState::Off);
        assert_eq!(t.guest.messages(), vec![FINAL_NOTICE.to_string()]);
        assert_eq!(t.monitor.shutdowns(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_goes_unknown() {
        let t = TestVm::new(VmState::Stopped);
        t.hypervisor.fail_next("start", false);
        assert!(t.vm.start().await.is_err());
        assert_eq!(t.vm.state().await, VmState::Unknown);
    }

    #[tokio::test]
    async fn test_no_op_failure_reverts() {
        let t = TestVm::new(VmState::Stopped);
        t.hypervisor.fail_next("start", true);
        assert!(t.vm.start().await.is_err());
        assert_eq!(t.vm.state().await, VmState::Stopped);
    }

    #[tokio::test]
    async fn test_start_boots_live_disk_after_snapshot() {
        let t = TestVm::new(VmState::Off);
        t.vm.take_snapshot("s1", "").await.unwrap();
        t.vm.start().await.unwrap();
        assert!(t.hypervisor.calls()[0].ends_with(".0002.img"));
    }

    #[tokio::test]
    async fn test_suspend_resume_restart() {
        let t = TestVm::new(VmState::Running);
        t.vm.suspend().await.unwrap();
        assert_eq!(t.vm.state().await, VmState::Suspended);
        assert_eq!(t.monitor.suspends(), 1);

        assert!(matches!(
            t.vm.restart().await,
            Err(Error::InvalidState { .. })
        ));

        t.vm.resume().await.unwrap();
        assert_eq!(t.vm.state().await, VmState::Running);
        assert!(t.hypervisor.calls().contains(&"resume".to_string()));

        t.vm.restart().await.unwrap();
        assert_eq!(t.vm.state().await, VmState::Running);
        assert_eq!(
            t.monitor.states(),
            vec![
                VmState::Suspending,
                VmState::Suspended,
                VmState::Starting,
                VmState::Running,
                VmState::Restarting,
                VmState::Running
            ]
        );
    }

    #[tokio::test]
    async fn test_persist_failure_leaves_state() {
        let t = TestVm::new(VmState::Off);
        t.monitor.fail_persist(true);
        assert!(t.vm.start().await.is_err());
        assert_eq!(t.vm.state().await, VmState::Off);
        assert!(t.hypervisor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_power_ops_without_hypervisor() {
        let t = TestVm::offline(VmState::Off);
        assert!(matches!(
            t.vm.start().await,
            Err(Error::HypervisorUnavailable(_))
        ));
        t.vm.take_snapshot("s1", "").await.unwrap();
        t.vm.shutdown(Duration::ZERO).await.unwrap();
    }

    #[tokio::test]
    async fn test_mounts_follow_power_state() {
        let t = TestVm::with_specs(
            VmState::Off,
            VmSpecs::builder()
                .mount("/home/ubuntu/src", VmMount::new("/src"))
                .build(),
        );
        t.vm.start().await.unwrap();
        assert!(t
            .hypervisor
            .calls()
            .contains(&"activate_mount /home/ubuntu/src".to_string()));

        t.vm.shutdown(Duration::ZERO).await.unwrap();
        assert!(t
            .hypervisor
            .calls()
            .contains(&"deactivate_mount /home/ubuntu/src".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_shutdown_runs_to_completion() {
        let t = TestVm::new(VmState::Running);
        t.vm.shutdown(Duration::from_secs(7 * 60)).await.unwrap();
        assert_eq!(t.vm.state().await, VmState::DelayedShutdown);

        tokio::time::sleep(Duration::from_secs(7 * 60 + 1)).await;

        assert_eq!(t.vm.state().await, VmState::Off);
        assert_eq!(
            t.guest.messages(),
            vec![
                "The system is going down for poweroff in 7 minutes",
                "The system is going down for poweroff in 5 minutes",
                "The system is going down for poweroff in 4 minutes",
                "The system is going down for poweroff in 3 minutes",
                "The system is going down for poweroff in 2 minutes",
                "The system is going down for poweroff in 1 minute",
                FINAL_NOTICE,
            ]
        );
        assert!(t.vm.pending_shutdown().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_delay_ticks_once() {
        let t = TestVm::new(VmState::Running);
        t.vm.shutdown(Duration::from_secs(20)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(t.vm.state().await, VmState::Off);
        assert_eq!(
            t.guest.messages(),
            vec![
                "The system is going down for poweroff in less than a minute",
                FINAL_NOTICE
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_returns_to_running() {
        let t = TestVm::new(VmState::Running);
        t.vm.shutdown(Duration::from_secs(10 * 60)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2 * 60)).await;

        t.vm.cancel_shutdown().await.unwrap();
        assert_eq!(t.vm.state().await, VmState::Running);
        assert_eq!(t.guest.messages().last().map(String::as_str), Some(CANCEL_NOTICE));

        tokio::time::sleep(Duration::from_secs(10 * 60)).await;
        assert_eq!(t.vm.state().await, VmState::Running);
        assert!(!t.hypervisor.calls().contains(&"shutdown".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_with_dead_guest_goes_unknown() {
        let t = TestVm::new(VmState::Running);
        t.vm.shutdown(Duration::from_secs(10 * 60)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        t.guest.set_dead(true);

        let err = t.vm.cancel_shutdown().await.unwrap_err();
        assert!(matches!(err, Error::GuestUnreachable { .. }));
        assert_eq!(t.vm.state().await, VmState::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_with_hung_guest_is_bounded() {
        let t = TestVm::new(VmState::Running);
        t.vm.shutdown(Duration::from_secs(10 * 60)).await.unwrap();
        t.guest.set_hang(true);

        let err = t.vm.cancel_shutdown().await.unwrap_err();
        assert!(matches!(err, Error::GuestUnreachable { .. }));
        assert_eq!(t.vm.state().await, VmState::Unknown);
    }

    #[tokio::test]
    async fn test_cancel_without_pending_is_noop() {
        let t = TestVm::new(VmState::Running);
        t.vm.cancel_shutdown().await.unwrap();
        assert!(t.guest.messages().is_empty());
        assert_eq!(t.vm.state().await, VmState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_request_replaces_pending() {
        let t = TestVm::new(VmState::Running);
        t.vm.shutdown(Duration::from_secs(10 * 60)).await.unwrap();
        t.vm.shutdown(Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(t.vm.state().await, VmState::Off);

        let shutdowns = t
            .hypervisor
            .calls()
            .iter()
            .filter(|c| *c == "shutdown")
            .count();
        assert_eq!(shutdowns, 1);
    }

    #[tokio::test]
    async fn test_shutdown_when_off_is_noop() {
        let t = TestVm::new(VmState::Off);
        t.vm.shutdown(Duration::from_secs(60)).await.unwrap();
        assert_eq!(t.vm.state().await, VmState::Off);
        assert!(t.hypervisor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_requires_quiescent_state() {
        let t = TestVm::new(VmState::Running);
        t.disks.clear_log();
        let err = t.vm.take_snapshot("s1", "").await.unwrap_err();
        assert!(matches!(err, Error::InvalidStateForSnapshot { .. }));
        assert!(t.disks.log().is_empty());
    }

    #[tokio::test]
    async fn test_restore_applies_specs_and_keeps_backup() {
        let t = TestVm::new(VmState::Stopped);
        t.vm.take_snapshot("s1", "").await.unwrap();
        t.monitor.clear();

        let record = t.vm.restore_snapshot("s1", false).await.unwrap();
        assert_eq!(record.name(), "s1");

        let backup = t.vm.snapshot_info("snapshot2").await.unwrap();
        assert_eq!(backup.record.comment(), "Before restoring s1");
        assert_eq!(backup.record.parent_index(), 1);

        let head = t
            .vm
            .snapshots()
            .await
            .into_iter()
            .find(|s| s.is_head)
            .unwrap();
        assert_eq!(head.record.name(), "s1");
        assert_eq!(t.monitor.specs_saved(), 1);
    }

    #[tokio::test]
    async fn test_restore_destructive_takes_no_backup() {
        let t = TestVm::new(VmState::Stopped);
        t.vm.take_snapshot("s1", "").await.unwrap();
        t.vm.restore_snapshot("s1", true).await.unwrap();
        assert_eq!(t.vm.snapshot_count().await, 1);
    }

    #[tokio::test]
    async fn test_restore_validation_order() {
        let t = TestVm::new(VmState::Running);
        let missing = t.vm.restore_snapshot("s1", true).await.unwrap_err();
        assert!(matches!(missing, Error::SnapshotNotFound { .. }));
    }

    #[tokio::test]
    async fn test_restore_persist_failure_goes_unknown() {
        let t = TestVm::new(VmState::Off);
        t.vm.take_snapshot("s1", "").await.unwrap();
        t.monitor.fail_specs(true);
        assert!(t.vm.restore_snapshot("s1", true).await.is_err());
        assert_eq!(t.vm.state().await, VmState::Unknown);
    }

    #[tokio::test]
    async fn test_delete_requires_quiescent_state() {
        let t = TestVm::new(VmState::Off);
        t.vm.take_snapshot("s1", "").await.unwrap();
        t.vm.force_state(VmState::Running).await.unwrap();
        assert!(matches!(
            t.vm.delete_snapshot("s1").await,
            Err(Error::InvalidStateForSnapshot { .. })
        ));
        t.vm.force_state(VmState::Off).await.unwrap();
        t.vm.delete_snapshot("s1").await.unwrap();
        assert_eq!(t.vm.snapshot_count().await, 0);
        t.vm.verify_snapshots().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_with_stranded_disk_goes_unknown() {
        let t = TestVm::new(VmState::Off);
        let layout = DiskLayout::new(t.dir.path(), t.base_disk().path(), "img");
        t.vm.take_snapshot("s1", "").await.unwrap();
        t.vm.take_snapshot("a", "").await.unwrap();
        t.vm.restore_snapshot("s1", true).await.unwrap();
        t.vm.take_snapshot("b", "").await.unwrap();
        t.disks.fail_on("reparent", &layout.disk(3));
        t.disks.fail_reparent_onto(&layout.disk(1));

        let err = t.vm.delete_snapshot("s1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invariant);
        assert_eq!(t.vm.state().await, VmState::Unknown);
    }

    #[tokio::test]
    async fn test_unavailable_with_failed_power_off_goes_unknown() {
        let t = TestVm::new(VmState::Running);
        t.hypervisor.fail_next("shutdown", false);

        assert!(t.vm.set_available(false).await.is_err());
        assert_eq!(t.vm.state().await, VmState::Unknown);

        t.vm.set_available(true).await.unwrap();
        assert_eq!(t.vm.state().await, VmState::Unknown);
        assert!(!t.hypervisor.calls().iter().any(|c| c.starts_with("start")));
    }

    #[tokio::test]
    async fn test_unavailable_with_refused_power_off_stays_running() {
        let t = TestVm::new(VmState::Running);
        t.hypervisor.fail_next("shutdown", true);

        assert!(t.vm.set_available(false).await.is_err());
        assert_eq!(t.vm.state().await, VmState::Running);
    }

    #[tokio::test]
    async fn test_unavailable_round_trip() {
        let t = TestVm::new(VmState::Running);
        t.vm.set_available(false).await.unwrap();
        assert_eq!(t.vm.state().await, VmState::Unavailable);
        assert!(t.hypervisor.calls().contains(&"shutdown".to_string()));

        t.vm.set_available(true).await.unwrap();
        assert_eq!(t.vm.state().await, VmState::Running);
    }

    #[tokio::test]
    async fn test_unavailable_restores_quiescent_state() {
        let t = TestVm::new(VmState::Stopped);
        t.vm.set_available(false).await.unwrap();
        t.vm.set_available(true).await.unwrap();
        assert_eq!(t.vm.state().await, VmState::Stopped);
        assert!(t.hypervisor.calls().is_empty());
    }
}
