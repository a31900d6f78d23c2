//! Registry of instances on disk.
//!
//! Each instance owns a directory under `<data_dir>/instances/<name>/`
//! holding `instance.json`, the snapshot chain file and the snapshot disks.
//! The store persists every state and specs change reported by the state
//! machine.

use crate::error::{Error, Result};
use crate::persist;
use crate::snapshot::{ChainStore, LegacyBackfill, SnapshotChain};
use crate::storage::{DiskLayout, VirtualDiskBackend};
use crate::vm::{StatusMonitor, VirtualMachine, VmSpecs, VmState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Instance file name.
pub const INSTANCE_FILE: &str = "instance.json";

/// Persisted description of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Instance name.
    pub name: String,
    /// Last committed power state.
    pub state: VmState,
    /// Current specs.
    pub specs: VmSpecs,
    /// Root of the disk chain.
    pub base_image: PathBuf,
    /// Token identifying the guest's current identity.
    pub guest_identity_token: String,
    /// Availability zone the instance belongs to.
    #[serde(default)]
    pub zone: Option<String>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// New record in the `off` state.
    pub fn new(name: impl Into<String>, base_image: impl Into<PathBuf>, specs: VmSpecs) -> Self {
        let name = name.into();
        Self {
            guest_identity_token: name.clone(),
            name,
            state: VmState::Off,
            specs,
            base_image: base_image.into(),
            zone: None,
            created_at: Utc::now(),
        }
    }

    /// Place the instance in an availability zone.
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }
}

fn check_instance_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(Error::Storage(format!("invalid instance name '{}'", name)))
    }
}

/// Instance records under one data directory.
#[derive(Debug)]
pub struct InstanceStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl InstanceStore {
    /// Store rooted at `<data_dir>/instances`.
    ///
    /// A relative root is resolved against the working directory, so disk
    /// backing paths recorded under it are absolute.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            root: std::path::absolute(&root).unwrap_or(root),
            write_lock: Mutex::new(()),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one instance.
    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.instance_dir(name).join(INSTANCE_FILE)
    }

    /// Record a new instance.
    pub fn register(&self, record: &InstanceRecord) -> Result<()> {
        check_instance_name(&record.name)?;
        let _guard = self.write_lock.lock();
        let path = self.record_path(&record.name);
        if path.exists() {
            return Err(Error::Storage(format!(
                "instance '{}' already exists",
                record.name
            )));
        }
        std::fs::create_dir_all(self.instance_dir(&record.name))?;
        persist::write_json_atomic(&path, record)?;
        tracing::info!(vm = %record.name, base = %record.base_image.display(), "registered instance");
        Ok(())
    }

    /// Load an instance record.
    pub fn load(&self, name: &str) -> Result<InstanceRecord> {
        check_instance_name(name).map_err(|_| Error::VmNotFound(name.to_string()))?;
        persist::read_json(&self.record_path(name))?
            .ok_or_else(|| Error::VmNotFound(name.to_string()))
    }

    /// Names of all registered instances, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.path().join(INSTANCE_FILE).is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Names of the instances placed in `zone`, sorted.
    pub fn zone_members(&self, zone: &str) -> Result<Vec<String>> {
        let mut members = Vec::new();
        for name in self.list()? {
            if self.load(&name)?.zone.as_deref() == Some(zone) {
                members.push(name);
            }
        }
        Ok(members)
    }

    /// Rewrite one record.
    ///
    /// Runs synchronously on the caller's thread: a read and an atomic write
    /// of a small JSON file.
    fn update(&self, name: &str, f: impl FnOnce(&mut InstanceRecord)) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut record = self.load(name)?;
        f(&mut record);
        persist::write_json_atomic(&self.record_path(name), &record)
    }

    /// Open an instance with its chain on the given disk backend.
    ///
    /// The returned machine reports back to this store.
    pub fn open_vm(
        self: &Arc<Self>,
        name: &str,
        backend: Arc<dyn VirtualDiskBackend>,
    ) -> Result<Arc<VirtualMachine>> {
        let record = self.load(name)?;
        let dir = self.instance_dir(name);
        let layout = DiskLayout::new(&dir, &record.base_image, backend.disk_extension());
        let backfill = LegacyBackfill {
            guest_identity_token: record.guest_identity_token.clone(),
            extra_interfaces: record.specs.extra_interfaces.clone(),
        };
        let chain = SnapshotChain::open(name, layout, ChainStore::new(&dir), backend, &backfill)?;

        let monitor: Arc<dyn StatusMonitor> = self.clone();
        Ok(VirtualMachine::builder(name, chain, monitor)
            .state(record.state)
            .specs(record.specs)
            .guest_identity_token(record.guest_identity_token)
            .build())
    }
}

impl StatusMonitor for InstanceStore {
    fn persist_state_for(&self, vm: &str, state: VmState) -> Result<()> {
        self.update(vm, |r| r.state = state)
    }

    fn persist_specs_for(&self, vm: &str, specs: &VmSpecs) -> Result<()> {
        self.update(vm, |r| r.specs = specs.clone())
    }

    fn on_transition(&self, vm: &str, from: VmState, to: VmState) {
        tracing::debug!(vm = %vm, from = %from, to = %to, "persisted state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DiskHandle, MemoryDiskBackend};
    use crate::vm::MemorySize;

    fn fixture() -> (tempfile::TempDir, Arc<InstanceStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InstanceStore::new(dir.path().join("instances")));
        (dir, store)
    }

    fn record(dir: &Path, name: &str) -> InstanceRecord {
        let specs = VmSpecs::builder()
            .cpus(2)
            .memory(MemorySize::from_gib(2))
            .build();
        InstanceRecord::new(name, dir.join(format!("{}.img", name)), specs)
    }

    #[test]
    fn test_register_and_load() {
        let (dir, store) = fixture();
        let web = record(dir.path(), "web");
        store.register(&web).unwrap();
        assert_eq!(store.load("web").unwrap(), web);

        let err = store.register(&web).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_list_sorted() {
        let (dir, store) = fixture();
        assert!(store.list().unwrap().is_empty());
        for name in ["db", "api", "web"] {
            store.register(&record(dir.path(), name)).unwrap();
        }
        assert_eq!(store.list().unwrap(), ["api", "db", "web"]);
    }

    #[test]
    fn test_relative_root_is_made_absolute() {
        let store = InstanceStore::new("vms/instances");
        assert!(store.root().is_absolute());
        assert!(store.instance_dir("web").ends_with("vms/instances/web"));
    }

    #[test]
    fn test_zone_members() {
        let (dir, store) = fixture();
        store
            .register(&record(dir.path(), "web").with_zone("zone1"))
            .unwrap();
        store
            .register(&record(dir.path(), "db").with_zone("zone2"))
            .unwrap();
        store
            .register(&record(dir.path(), "api").with_zone("zone1"))
            .unwrap();
        store.register(&record(dir.path(), "tmp")).unwrap();

        assert_eq!(store.zone_members("zone1").unwrap(), ["api", "web"]);
        assert_eq!(store.zone_members("zone2").unwrap(), ["db"]);
        assert!(store.zone_members("zone3").unwrap().is_empty());
    }

    #[test]
    fn test_record_without_zone_loads() {
        let (dir, store) = fixture();
        store.register(&record(dir.path(), "web")).unwrap();
        let path = store.instance_dir("web").join(INSTANCE_FILE);
        let mut raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        raw.as_object_mut().unwrap().remove("zone");
        std::fs::write(&path, raw.to_string()).unwrap();

        assert_eq!(store.load("web").unwrap().zone, None);
    }

    #[test]
    fn test_unknown_or_bad_name() {
        let (_dir, store) = fixture();
        assert!(matches!(store.load("ghost"), Err(Error::VmNotFound(_))));
        assert!(matches!(store.load("../etc"), Err(Error::VmNotFound(_))));
        let bad = InstanceRecord::new("a/b", "/tmp/x.img", VmSpecs::default());
        assert!(store.register(&bad).is_err());
    }

    #[test]
    fn test_monitor_persists_changes() {
        let (dir, store) = fixture();
        store.register(&record(dir.path(), "web")).unwrap();

        store.persist_state_for("web", VmState::Running).unwrap();
        let specs = VmSpecs::builder().cpus(8).build();
        store.persist_specs_for("web", &specs).unwrap();

        let loaded = store.load("web").unwrap();
        assert_eq!(loaded.state, VmState::Running);
        assert_eq!(loaded.specs.num_cores, 8);
    }

    #[tokio::test]
    async fn test_open_vm_round_trip() {
        let (dir, store) = fixture();
        let web = record(dir.path(), "web");
        store.register(&web).unwrap();

        let disks = Arc::new(MemoryDiskBackend::default());
        disks.add_base(&DiskHandle::new(&web.base_image), MemorySize::from_gib(5));

        let vm = store.open_vm("web", disks.clone()).unwrap();
        let snap = vm.take_snapshot("clean", "fresh install").await.unwrap();
        assert_eq!(snap.num_cores(), 2);
        vm.force_state(VmState::Stopped).await.unwrap();
        drop(vm);

        let vm = store.open_vm("web", disks).unwrap();
        assert_eq!(vm.state().await, VmState::Stopped);
        let info = vm.snapshot_info("clean").await.unwrap();
        assert_eq!(info.record.comment(), "fresh install");
        assert!(info.is_head);
    }
}
