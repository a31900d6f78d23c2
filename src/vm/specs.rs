//! VM specification types.
//!
//! [`VmSpecs`] is the live, mutable description of an instance's resources.
//! Snapshot records capture a copy of it, and restoring a snapshot writes the
//! captured values back.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Default guest user.
pub const DEFAULT_SSH_USERNAME: &str = "ubuntu";

/// A size in bytes.
///
/// Serialized as a decimal string so 64-bit values survive JSON consumers
/// that only handle doubles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemorySize(u64);

impl MemorySize {
    /// One kibibyte.
    pub const KIB: u64 = 1024;
    /// One mebibyte.
    pub const MIB: u64 = 1024 * 1024;
    /// One gibibyte.
    pub const GIB: u64 = 1024 * 1024 * 1024;

    /// Create a size from a byte count.
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create a size from mebibytes.
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * Self::MIB)
    }

    /// Create a size from gibibytes.
    pub const fn from_gib(gib: u64) -> Self {
        Self(gib * Self::GIB)
    }

    /// Size in bytes.
    pub const fn in_bytes(&self) -> u64 {
        self.0
    }

    /// Human-readable rendering with a binary suffix (e.g. "1.5GiB").
    pub fn human_readable(&self) -> String {
        let units = [(Self::GIB * 1024, "TiB"), (Self::GIB, "GiB"), (Self::MIB, "MiB"), (Self::KIB, "KiB")];
        for (unit, suffix) in units {
            if self.0 >= unit {
                let value = self.0 as f64 / unit as f64;
                return if self.0 % unit == 0 {
                    format!("{}{}", self.0 / unit, suffix)
                } else {
                    format!("{:.1}{}", value, suffix)
                };
            }
        }
        format!("{}B", self.0)
    }
}

impl FromStr for MemorySize {
    type Err = Error;

    /// Parse "1024", "512M", "1.5G", "2GiB", "10k".
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let lower = trimmed.to_ascii_lowercase();
        let body = lower
            .strip_suffix("ib")
            .or_else(|| lower.strip_suffix('b'))
            .unwrap_or(&lower);

        let (number, multiplier) = match body.chars().last() {
            Some('k') => (&body[..body.len() - 1], Self::KIB),
            Some('m') => (&body[..body.len() - 1], Self::MIB),
            Some('g') => (&body[..body.len() - 1], Self::GIB),
            Some('t') => (&body[..body.len() - 1], Self::GIB * 1024),
            _ => (body, 1),
        };

        let invalid = || Error::Config(format!("invalid size '{}'", trimmed));
        if number.is_empty() {
            return Err(invalid());
        }

        if let Ok(whole) = number.parse::<u64>() {
            return whole.checked_mul(multiplier).map(Self).ok_or_else(invalid);
        }

        let value: f64 = number.parse().map_err(|_| invalid())?;
        if !value.is_finite() || value < 0.0 {
            return Err(invalid());
        }
        Ok(Self((value * multiplier as f64) as u64))
    }
}

impl std::fmt::Display for MemorySize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for MemorySize {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for MemorySize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// An additional guest network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// Host network the interface is bridged to.
    pub id: String,
    /// Guest MAC address.
    pub mac_address: String,
    /// Whether the guest configures the interface automatically.
    pub auto_mode: bool,
}

impl NetworkInterface {
    /// Create an automatically configured interface.
    pub fn new(id: impl Into<String>, mac_address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            mac_address: mac_address.into(),
            auto_mode: true,
        }
    }
}

/// Host to guest uid mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UidMapping {
    /// Uid on the host.
    pub host_uid: i32,
    /// Uid in the guest.
    pub instance_uid: i32,
}

/// Host to guest gid mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GidMapping {
    /// Gid on the host.
    pub host_gid: i32,
    /// Gid in the guest.
    pub instance_gid: i32,
}

/// How a host directory is exposed to the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MountType {
    /// Userspace file sharing (sshfs-style).
    #[default]
    Classic,
    /// Hypervisor-native file sharing.
    Native,
}

impl From<MountType> for u8 {
    fn from(t: MountType) -> u8 {
        match t {
            MountType::Classic => 0,
            MountType::Native => 1,
        }
    }
}

impl TryFrom<u8> for MountType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(MountType::Classic),
            1 => Ok(MountType::Native),
            other => Err(format!("unsupported mount type {}", other)),
        }
    }
}

/// A host directory mounted into the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmMount {
    /// Path on the host.
    pub source_path: String,
    /// Uid mappings.
    #[serde(default)]
    pub uid_mappings: Vec<UidMapping>,
    /// Gid mappings.
    #[serde(default)]
    pub gid_mappings: Vec<GidMapping>,
    /// Sharing mechanism.
    #[serde(default)]
    pub mount_type: MountType,
}

impl VmMount {
    /// Create a classic mount with no id mappings.
    pub fn new(source_path: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            uid_mappings: Vec::new(),
            gid_mappings: Vec::new(),
            mount_type: MountType::Classic,
        }
    }

    /// Set the mount type.
    pub fn mount_type(mut self, mount_type: MountType) -> Self {
        self.mount_type = mount_type;
        self
    }
}

/// Mount table keyed by guest target path.
pub type MountTable = BTreeMap<String, VmMount>;

/// Serializes a [`MountTable`] as an array of mounts, each carrying its
/// `target_path`.
pub mod mounts_as_array {
    use super::{MountTable, VmMount};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Entry {
        target_path: String,
        #[serde(flatten)]
        mount: VmMount,
    }

    #[derive(Serialize)]
    struct EntryRef<'a> {
        target_path: &'a str,
        #[serde(flatten)]
        mount: &'a VmMount,
    }

    pub fn serialize<S: Serializer>(mounts: &MountTable, serializer: S) -> Result<S::Ok, S::Error> {
        let entries: Vec<EntryRef<'_>> = mounts
            .iter()
            .map(|(target_path, mount)| EntryRef { target_path, mount })
            .collect();
        entries.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<MountTable, D::Error> {
        let entries = Vec::<Entry>::deserialize(deserializer)?;
        Ok(entries
            .into_iter()
            .map(|e| (e.target_path, e.mount))
            .collect())
    }
}

/// Live resource description of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSpecs {
    /// Number of vCPUs.
    pub num_cores: u32,

    /// Memory size.
    pub mem_size: MemorySize,

    /// Disk size.
    pub disk_space: MemorySize,

    /// MAC address of the primary interface.
    #[serde(rename = "mac_addr", default)]
    pub default_mac_address: String,

    /// Additional interfaces.
    #[serde(default)]
    pub extra_interfaces: Vec<NetworkInterface>,

    /// Guest user.
    #[serde(default = "default_ssh_username")]
    pub ssh_username: String,

    /// Mounts keyed by guest target path.
    #[serde(default, with = "mounts_as_array")]
    pub mounts: MountTable,

    /// Free-form metadata owned by the hypervisor backend.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

fn default_ssh_username() -> String {
    DEFAULT_SSH_USERNAME.to_string()
}

impl Default for VmSpecs {
    fn default() -> Self {
        Self {
            num_cores: 1,
            mem_size: MemorySize::from_gib(1),
            disk_space: MemorySize::from_gib(5),
            default_mac_address: String::new(),
            extra_interfaces: Vec::new(),
            ssh_username: default_ssh_username(),
            mounts: MountTable::new(),
            metadata: serde_json::Map::new(),
        }
    }
}

impl VmSpecs {
    /// Create a builder for VmSpecs.
    pub fn builder() -> VmSpecsBuilder {
        VmSpecsBuilder::default()
    }
}

/// Builder for VmSpecs.
#[derive(Debug, Default)]
pub struct VmSpecsBuilder {
    specs: VmSpecs,
}

impl VmSpecsBuilder {
    /// Set the number of CPUs.
    pub fn cpus(mut self, cores: u32) -> Self {
        self.specs.num_cores = cores;
        self
    }

    /// Set the memory size.
    pub fn memory(mut self, size: MemorySize) -> Self {
        self.specs.mem_size = size;
        self
    }

    /// Set the disk size.
    pub fn disk(mut self, size: MemorySize) -> Self {
        self.specs.disk_space = size;
        self
    }

    /// Set the primary MAC address.
    pub fn mac_address(mut self, mac: impl Into<String>) -> Self {
        self.specs.default_mac_address = mac.into();
        self
    }

    /// Add an extra network interface.
    pub fn interface(mut self, iface: NetworkInterface) -> Self {
        self.specs.extra_interfaces.push(iface);
        self
    }

    /// Set the guest user.
    pub fn ssh_username(mut self, user: impl Into<String>) -> Self {
        self.specs.ssh_username = user.into();
        self
    }

    /// Add a mount at a guest path.
    pub fn mount(mut self, target: impl Into<String>, mount: VmMount) -> Self {
        self.specs.mounts.insert(target.into(), mount);
        self
    }

    /// Build the specs.
    pub fn build(self) -> VmSpecs {
        self.specs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_size_parsing() {
        let cases = [
            ("1024", 1024),
            ("1k", 1024),
            ("512M", 512 * MemorySize::MIB),
            ("2G", 2 * MemorySize::GIB),
            ("2GiB", 2 * MemorySize::GIB),
            ("1.5G", 3 * MemorySize::GIB / 2),
            ("3gb", 3 * MemorySize::GIB),
        ];
        for (input, bytes) in cases {
            let size: MemorySize = input.parse().unwrap();
            assert_eq!(size.in_bytes(), bytes, "parsing {}", input);
        }
    }

    #[test]
    fn test_memory_size_rejects_garbage() {
        for input in ["", "G", "abc", "-1G", "1.2.3M"] {
            assert!(input.parse::<MemorySize>().is_err(), "{} should fail", input);
        }
    }

    #[test]
    fn test_memory_size_serializes_as_string() {
        let json = serde_json::to_string(&MemorySize::from_gib(1)).unwrap();
        assert_eq!(json, "\"1073741824\"");
        assert_eq!(MemorySize::from_mib(1536).human_readable(), "1.5GiB");
        assert_eq!(MemorySize::from_gib(2).human_readable(), "2GiB");
    }

    #[test]
    fn test_mounts_serialize_as_array_with_target() {
        let specs = VmSpecs::builder()
            .mount("/home/ubuntu/src", VmMount::new("/src").mount_type(MountType::Native))
            .build();
        let json = serde_json::to_value(&specs).unwrap();
        let mounts = json["mounts"].as_array().unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0]["target_path"], "/home/ubuntu/src");
        assert_eq!(mounts[0]["source_path"], "/src");
        assert_eq!(mounts[0]["mount_type"], 1);

        let back: VmSpecs = serde_json::from_value(json).unwrap();
        assert_eq!(back, specs);
    }

    #[test]
    fn test_specs_builder() {
        let specs = VmSpecs::builder()
            .cpus(4)
            .memory(MemorySize::from_gib(2))
            .disk(MemorySize::from_gib(20))
            .mac_address("52:54:00:00:00:01")
            .interface(NetworkInterface::new("eth1", "52:54:00:00:00:02"))
            .build();
        assert_eq!(specs.num_cores, 4);
        assert_eq!(specs.mem_size.in_bytes(), 2 * MemorySize::GIB);
        assert_eq!(specs.extra_interfaces.len(), 1);
        assert_eq!(specs.ssh_username, DEFAULT_SSH_USERNAME);
    }
}
