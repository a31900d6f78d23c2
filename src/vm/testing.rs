//! Test doubles for the VM seams.

use super::backend::Hypervisor;
use super::guest::GuestChannel;
use super::machine::VirtualMachine;
use super::specs::{MemorySize, VmMount, VmSpecs};
use super::state::VmState;
use super::StatusMonitor;
use crate::error::{Error, Result};
use crate::snapshot::{ChainStore, LegacyBackfill, SnapshotChain};
use crate::storage::{DiskHandle, DiskLayout, MemoryDiskBackend};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Hypervisor recording every call.
#[derive(Debug, Default)]
pub struct MockHypervisor {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, bool>>,
}

impl MockHypervisor {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Fail the next `op`; `no_op` marks the failure as harmless.
    pub fn fail_next(&self, op: &str, no_op: bool) {
        self.failures.lock().insert(op.to_string(), no_op);
    }

    fn call(&self, op: &str, detail: Option<&str>) -> Result<()> {
        let entry = match detail {
            Some(d) => format!("{} {}", op, d),
            None => op.to_string(),
        };
        self.calls.lock().push(entry);
        match self.failures.lock().remove(op) {
            Some(true) => Err(Error::hypervisor_no_op(op, "refused")),
            Some(false) => Err(Error::hypervisor(op, "crashed")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn start(&self, boot_disk: &DiskHandle, _specs: &VmSpecs) -> Result<()> {
        self.call("start", Some(boot_disk.to_string().as_str()))
    }

    async fn shutdown(&self) -> Result<()> {
        self.call("shutdown", None)
    }

    async fn suspend(&self) -> Result<()> {
        self.call("suspend", None)
    }

    async fn resume(&self) -> Result<()> {
        self.call("resume", None)
    }

    async fn restart(&self) -> Result<()> {
        self.call("restart", None)
    }

    async fn activate_mount(&self, target: &str, _mount: &VmMount) -> Result<()> {
        self.call("activate_mount", Some(target))
    }

    async fn deactivate_mount(&self, target: &str) -> Result<()> {
        self.call("deactivate_mount", Some(target))
    }
}

/// Guest channel that records messages, or fails when dead.
#[derive(Debug, Default)]
pub struct MockGuest {
    messages: Mutex<Vec<String>>,
    dead: AtomicBool,
    hang: AtomicBool,
}

impl MockGuest {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    pub fn set_dead(&self, dead: bool) {
        self.dead.store(dead, Ordering::SeqCst);
    }

    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }
}

#[async_trait]
impl GuestChannel for MockGuest {
    async fn broadcast(&self, message: &str) -> Result<()> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.dead.load(Ordering::SeqCst) {
            return Err(Error::guest("mock", "connection refused"));
        }
        self.messages.lock().push(message.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MonitorLog {
    states: Vec<VmState>,
    specs_saved: usize,
    suspends: usize,
    shutdowns: usize,
}

/// Monitor recording persisted states.
#[derive(Debug, Default)]
pub struct RecordingMonitor {
    log: Mutex<MonitorLog>,
    fail_persist: AtomicBool,
    fail_specs: AtomicBool,
}

impl RecordingMonitor {
    pub fn states(&self) -> Vec<VmState> {
        self.log.lock().states.clone()
    }

    pub fn specs_saved(&self) -> usize {
        self.log.lock().specs_saved
    }

    pub fn suspends(&self) -> usize {
        self.log.lock().suspends
    }

    pub fn shutdowns(&self) -> usize {
        self.log.lock().shutdowns
    }

    pub fn clear(&self) {
        *self.log.lock() = MonitorLog::default();
    }

    pub fn fail_persist(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::SeqCst);
    }

    pub fn fail_specs(&self, fail: bool) {
        self.fail_specs.store(fail, Ordering::SeqCst);
    }
}

impl StatusMonitor for RecordingMonitor {
    fn persist_state_for(&self, _vm: &str, state: VmState) -> Result<()> {
        if self.fail_persist.load(Ordering::SeqCst) {
            return Err(Error::Storage("disk full".into()));
        }
        self.log.lock().states.push(state);
        Ok(())
    }

    fn persist_specs_for(&self, _vm: &str, _specs: &VmSpecs) -> Result<()> {
        if self.fail_specs.load(Ordering::SeqCst) {
            return Err(Error::Storage("disk full".into()));
        }
        self.log.lock().specs_saved += 1;
        Ok(())
    }

    fn on_suspend(&self, _vm: &str) {
        self.log.lock().suspends += 1;
    }

    fn on_shutdown(&self, _vm: &str) {
        self.log.lock().shutdowns += 1;
    }
}

/// A VM wired to mocks, with its chain in a temporary directory.
pub struct TestVm {
    pub dir: TempDir,
    pub disks: Arc<MemoryDiskBackend>,
    pub hypervisor: Arc<MockHypervisor>,
    pub guest: Arc<MockGuest>,
    pub monitor: Arc<RecordingMonitor>,
    pub vm: Arc<VirtualMachine>,
}

impl TestVm {
    pub fn new(state: VmState) -> Self {
        Self::build(state, VmSpecs::default(), true)
    }

    pub fn with_specs(state: VmState, specs: VmSpecs) -> Self {
        Self::build(state, specs, true)
    }

    pub fn offline(state: VmState) -> Self {
        Self::build(state, VmSpecs::default(), false)
    }

    fn build(state: VmState, specs: VmSpecs, online: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let disks = Arc::new(MemoryDiskBackend::default());
        let layout = DiskLayout::new(dir.path(), dir.path().join("web.img"), "img");
        disks.add_base(layout.base(), MemorySize::from_gib(5));
        let chain = SnapshotChain::open(
            "web",
            layout,
            ChainStore::new(dir.path()),
            disks.clone(),
            &LegacyBackfill::default(),
        )
        .unwrap();

        let hypervisor = Arc::new(MockHypervisor::default());
        let guest = Arc::new(MockGuest::default());
        let monitor = Arc::new(RecordingMonitor::default());

        let mut builder = VirtualMachine::builder("web", chain, monitor.clone())
            .state(state)
            .specs(specs);
        if online {
            builder = builder.hypervisor(hypervisor.clone()).guest(guest.clone());
        }

        Self {
            dir,
            disks,
            hypervisor,
            guest,
            monitor,
            vm: builder.build(),
        }
    }

    pub fn base_disk(&self) -> DiskHandle {
        DiskHandle::new(self.dir.path().join("web.img"))
    }
}
