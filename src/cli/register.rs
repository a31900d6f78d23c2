//! Register command implementation.

use super::parsers::{parse_mount, parse_size};
use super::Context;
use clap::Args;
use std::path::PathBuf;
use vmchain::instance::InstanceRecord;
use vmchain::vm::specs::{MemorySize, VmMount, VmSpecs, DEFAULT_SSH_USERNAME};
use vmchain::Error;

/// Record an instance backed by an existing base image.
#[derive(Args, Debug)]
pub struct RegisterCmd {
    /// Instance name.
    pub name: String,

    /// Base disk image (qcow2).
    #[arg(long)]
    pub image: PathBuf,

    /// Number of vCPUs.
    #[arg(long, default_value = "1")]
    pub cpus: u32,

    /// Memory size (e.g., 1G, 512M).
    #[arg(long, default_value = "1G", value_parser = parse_size)]
    pub memory: MemorySize,

    /// Disk size (e.g., 5G).
    #[arg(long, default_value = "5G", value_parser = parse_size)]
    pub disk: MemorySize,

    /// Primary MAC address.
    #[arg(long)]
    pub mac: Option<String>,

    /// Guest user for SSH.
    #[arg(long, default_value = DEFAULT_SSH_USERNAME)]
    pub ssh_username: String,

    /// Mount a host directory (host_path:guest_path).
    #[arg(long = "mount", value_parser = parse_mount)]
    pub mounts: Vec<(String, VmMount)>,

    /// Availability zone (default: first available zone).
    #[arg(long)]
    pub zone: Option<String>,
}

impl RegisterCmd {
    /// Execute the register command.
    pub fn run(self, ctx: &Context) -> vmchain::Result<()> {
        if self.cpus == 0 {
            return Err(Error::Config("--cpus must be at least 1".into()));
        }
        let image = std::fs::canonicalize(&self.image).map_err(|e| {
            Error::Storage(format!("base image {}: {}", self.image.display(), e))
        })?;

        let mut builder = VmSpecs::builder()
            .cpus(self.cpus)
            .memory(self.memory)
            .disk(self.disk)
            .ssh_username(self.ssh_username);
        if let Some(mac) = self.mac {
            builder = builder.mac_address(mac);
        }
        for (target, mount) in self.mounts {
            builder = builder.mount(target, mount);
        }

        let zone = match &self.zone {
            Some(name) => ctx.zones.zone(name)?,
            None => ctx
                .zones
                .available_zones()
                .next()
                .ok_or_else(|| Error::Config("no availability zone is available".into()))?,
        };
        if !zone.is_available() {
            return Err(Error::Config(format!(
                "availability zone '{}' is unavailable",
                zone.name()
            )));
        }

        let record =
            InstanceRecord::new(&self.name, image, builder.build()).with_zone(zone.name());
        ctx.store.register(&record)?;
        println!("Registered instance '{}' in zone '{}'", self.name, zone.name());
        Ok(())
    }
}
