//! Availability zones.
//!
//! A zone groups instances that are taken offline together. Its
//! availability is persisted to `<data_dir>/zones/<name>.json`; changing it
//! cascades to every member instance.

use crate::error::{Error, Result};
use crate::persist;
use crate::vm::{VirtualMachine, VmState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ZoneFile {
    #[serde(default)]
    subnet: String,
    #[serde(default = "default_available")]
    available: bool,
}

fn default_available() -> bool {
    true
}

/// One availability zone and its member instances.
pub struct AvailabilityZone {
    name: String,
    path: PathBuf,
    subnet: String,
    available: Mutex<bool>,
    vms: Mutex<Vec<Arc<VirtualMachine>>>,
    transition: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for AvailabilityZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvailabilityZone")
            .field("name", &self.name)
            .field("subnet", &self.subnet)
            .field("available", &*self.available.lock())
            .field("vms", &self.vms.lock().len())
            .finish()
    }
}

impl AvailabilityZone {
    /// Load a zone from `dir`, creating its file when missing.
    pub fn open(name: impl Into<String>, dir: &Path) -> Result<Self> {
        let name = name.into();
        let path = dir.join(format!("{}.json", name));
        let file: ZoneFile = persist::read_json(&path)?.unwrap_or(ZoneFile {
            subnet: String::new(),
            available: true,
        });
        std::fs::create_dir_all(dir)?;
        persist::write_json_atomic(&path, &file)?;

        tracing::debug!(zone = %name, available = file.available, "loaded availability zone");
        Ok(Self {
            name,
            path,
            subnet: file.subnet,
            available: Mutex::new(file.available),
            vms: Mutex::new(Vec::new()),
            transition: tokio::sync::Mutex::new(()),
        })
    }

    /// Zone name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subnet assigned to the zone.
    pub fn subnet(&self) -> &str {
        &self.subnet
    }

    /// Whether the zone is available.
    pub fn is_available(&self) -> bool {
        *self.available.lock()
    }

    /// Names of member instances.
    pub fn vm_names(&self) -> Vec<String> {
        self.vms.lock().iter().map(|vm| vm.name().to_string()).collect()
    }

    /// Add an instance.
    pub fn add_vm(&self, vm: Arc<VirtualMachine>) {
        tracing::info!(zone = %self.name, vm = %vm.name(), "adding vm to zone");
        self.vms.lock().push(vm);
    }

    /// Remove an instance by name.
    pub fn remove_vm(&self, name: &str) {
        tracing::info!(zone = %self.name, vm = %name, "removing vm from zone");
        self.vms.lock().retain(|vm| vm.name() != name);
    }

    /// Change availability and propagate it to every member.
    ///
    /// Every member is attempted. When bringing the zone back fails for any
    /// member, every member left in `unknown`, `unavailable` or a transient
    /// state is forced to `off`, and the first error is returned.
    pub async fn set_available(&self, available: bool) -> Result<()> {
        let _serial = self.transition.lock().await;
        if self.is_available() == available {
            return Ok(());
        }

        tracing::info!(zone = %self.name, available, "changing zone availability");
        persist::write_json_atomic(
            &self.path,
            &ZoneFile {
                subnet: self.subnet.clone(),
                available,
            },
        )?;
        *self.available.lock() = available;

        let vms = self.vms.lock().clone();
        let mut first_error = None;
        for vm in &vms {
            if let Err(e) = vm.set_available(available).await {
                tracing::warn!(zone = %self.name, vm = %vm.name(), error = %e, "failed to change vm availability");
                first_error.get_or_insert(e);
            }
        }

        let Some(err) = first_error else {
            return Ok(());
        };
        if available {
            for vm in &vms {
                let state = vm.state().await;
                if matches!(state, VmState::Unknown | VmState::Unavailable) || state.is_transient() {
                    if let Err(e) = vm.force_state(VmState::Off).await {
                        tracing::error!(vm = %vm.name(), error = %e, "failed to fall back to off");
                    }
                }
            }
        }
        Err(err)
    }
}

/// The configured availability zones.
#[derive(Debug)]
pub struct ZoneManager {
    zones: Vec<AvailabilityZone>,
}

impl ZoneManager {
    /// Open every named zone under `dir`.
    pub fn open(dir: &Path, names: &[String]) -> Result<Self> {
        let zones = names
            .iter()
            .map(|name| AvailabilityZone::open(name.as_str(), dir))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { zones })
    }

    /// Look up a zone.
    pub fn zone(&self, name: &str) -> Result<&AvailabilityZone> {
        self.zones
            .iter()
            .find(|z| z.name() == name)
            .ok_or_else(|| Error::Config(format!("unknown availability zone '{}'", name)))
    }

    /// All zones, in configuration order.
    pub fn zones(&self) -> &[AvailabilityZone] {
        &self.zones
    }

    /// Zones currently available.
    pub fn available_zones(&self) -> impl Iterator<Item = &AvailabilityZone> {
        self.zones.iter().filter(|z| z.is_available())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::testing::TestVm;

    #[test]
    fn test_open_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let zone = AvailabilityZone::open("zone1", dir.path()).unwrap();
        assert!(zone.is_available());
        assert!(dir.path().join("zone1.json").exists());
    }

    #[test]
    fn test_open_reads_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("zone2.json"),
            r#"{"subnet": "10.1.2.0/24", "available": false}"#,
        )
        .unwrap();
        let zone = AvailabilityZone::open("zone2", dir.path()).unwrap();
        assert!(!zone.is_available());
        assert_eq!(zone.subnet(), "10.1.2.0/24");
    }

    #[tokio::test]
    async fn test_availability_cascades_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let zone = AvailabilityZone::open("zone1", dir.path()).unwrap();
        let a = TestVm::new(VmState::Running);
        let b = TestVm::new(VmState::Stopped);
        zone.add_vm(a.vm.clone());
        zone.add_vm(b.vm.clone());

        zone.set_available(false).await.unwrap();
        assert_eq!(a.vm.state().await, VmState::Unavailable);
        assert_eq!(b.vm.state().await, VmState::Unavailable);
        assert!(!AvailabilityZone::open("zone1", dir.path())
            .unwrap()
            .is_available());

        zone.set_available(true).await.unwrap();
        assert_eq!(a.vm.state().await, VmState::Running);
        assert_eq!(b.vm.state().await, VmState::Stopped);
    }

    #[tokio::test]
    async fn test_failed_restore_falls_back_to_off() {
        let dir = tempfile::tempdir().unwrap();
        let zone = AvailabilityZone::open("zone1", dir.path()).unwrap();
        let good = TestVm::new(VmState::Running);
        let bad = TestVm::new(VmState::Running);
        zone.add_vm(good.vm.clone());
        zone.add_vm(bad.vm.clone());

        zone.set_available(false).await.unwrap();
        bad.hypervisor.fail_next("start", false);

        let err = zone.set_available(true).await.unwrap_err();
        assert!(matches!(err, Error::Hypervisor { .. }));
        assert_eq!(good.vm.state().await, VmState::Running);
        assert_eq!(bad.vm.state().await, VmState::Off);
        assert!(zone.is_available());
    }

    #[tokio::test]
    async fn test_failed_power_off_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let zone = AvailabilityZone::open("zone1", dir.path()).unwrap();
        let good = TestVm::new(VmState::Running);
        let bad = TestVm::new(VmState::Running);
        zone.add_vm(good.vm.clone());
        zone.add_vm(bad.vm.clone());
        bad.hypervisor.fail_next("shutdown", false);

        let err = zone.set_available(false).await.unwrap_err();
        assert!(matches!(err, Error::Hypervisor { .. }));
        assert_eq!(good.vm.state().await, VmState::Unavailable);
        assert_eq!(bad.vm.state().await, VmState::Unknown);
        assert!(!zone.is_available());

        zone.set_available(true).await.unwrap();
        assert_eq!(good.vm.state().await, VmState::Running);
        assert!(!bad.hypervisor.calls().iter().any(|c| c.starts_with("start")));
    }

    #[test]
    fn test_manager_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let names = vec!["zone1".to_string(), "zone2".to_string()];
        let manager = ZoneManager::open(dir.path(), &names).unwrap();
        assert_eq!(manager.zone("zone2").unwrap().name(), "zone2");
        assert!(manager.zone("zone9").is_err());
        assert_eq!(manager.available_zones().count(), 2);
    }

    #[test]
    fn test_remove_vm() {
        let dir = tempfile::tempdir().unwrap();
        let zone = AvailabilityZone::open("zone1", dir.path()).unwrap();
        let t = TestVm::new(VmState::Off);
        zone.add_vm(t.vm.clone());
        assert_eq!(zone.vm_names(), ["web"]);
        zone.remove_vm("web");
        assert!(zone.vm_names().is_empty());
    }
}
