//! CLI command implementations.

pub mod delete;
pub mod info;
pub mod list;
pub mod parsers;
pub mod register;
pub mod restore;
pub mod snapshot;
pub mod zone;

use std::sync::Arc;
use vmchain::config::VmchainConfig;
use vmchain::instance::InstanceStore;
use vmchain::storage::VirtualDiskBackend;
use vmchain::vm::VirtualMachine;
use vmchain::zone::{AvailabilityZone, ZoneManager};

/// State shared by every command.
pub struct Context {
    /// Instance registry.
    pub store: Arc<InstanceStore>,
    /// Disk backend for snapshot chains.
    pub disks: Arc<dyn VirtualDiskBackend>,
    /// Configured availability zones.
    pub zones: ZoneManager,
}

impl Context {
    /// Build the context from configuration.
    pub fn new(config: &VmchainConfig) -> vmchain::Result<Self> {
        let store = Arc::new(InstanceStore::new(config.instances_dir()));
        let disks: Arc<dyn VirtualDiskBackend> = Arc::new(config.disk_backend());
        let zones = ZoneManager::open(&config.zones_dir(), &config.zones)?;
        Ok(Self {
            store,
            disks,
            zones,
        })
    }

    /// Open a registered instance.
    pub fn open_vm(&self, name: &str) -> vmchain::Result<Arc<VirtualMachine>> {
        self.store.open_vm(name, self.disks.clone())
    }

    /// Look up a zone and attach its member instances.
    pub fn open_zone(&self, name: &str) -> vmchain::Result<&AvailabilityZone> {
        let zone = self.zones.zone(name)?;
        for member in self.store.zone_members(zone.name())? {
            zone.add_vm(self.open_vm(&member)?);
        }
        Ok(zone)
    }
}
