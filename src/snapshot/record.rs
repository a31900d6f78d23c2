//! Snapshot records and their persisted form.

use crate::error::{Error, Result};
use crate::vm::specs::{mounts_as_array, MemorySize, MountTable, NetworkInterface, VmSpecs};
use crate::vm::VmState;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Highest snapshot index a chain may allocate.
pub const MAX_SNAPSHOT_INDEX: u32 = 9999;

/// Longest accepted snapshot name.
pub const MAX_NAME_LEN: usize = 63;

/// Check that a user-supplied snapshot name is usable.
///
/// Names follow hostname rules: ASCII letters, digits and hyphens, starting
/// with a letter and not ending with a hyphen.
pub fn validate_snapshot_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("name is empty")
    } else if name.len() > MAX_NAME_LEN {
        Some("name is longer than 63 characters")
    } else if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        Some("name must start with a letter")
    } else if name.ends_with('-') {
        Some("name must not end with a hyphen")
    } else if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        Some("name may only contain letters, digits and hyphens")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(Error::invalid_name(name, reason)),
        None => Ok(()),
    }
}

/// One captured point in time.
///
/// Validated on construction and immutable afterwards, apart from the
/// chain-internal edits exposed as `pub(crate)` setters.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    name: String,
    comment: String,
    index: u32,
    parent_index: u32,
    guest_identity_token: String,
    created_at: DateTime<Utc>,
    num_cores: u32,
    mem_size: MemorySize,
    disk_space: MemorySize,
    extra_interfaces: Vec<NetworkInterface>,
    state: VmState,
    mounts: MountTable,
    metadata: serde_json::Map<String, serde_json::Value>,
    upgraded: bool,
}

impl SnapshotRecord {
    /// Capture the given specs as a new record, timestamped now.
    pub fn capture(
        name: impl Into<String>,
        comment: impl Into<String>,
        index: u32,
        parent_index: u32,
        guest_identity_token: impl Into<String>,
        specs: &VmSpecs,
        state: VmState,
    ) -> Result<Self> {
        let record = Self {
            name: name.into(),
            comment: comment.into(),
            index,
            parent_index,
            guest_identity_token: guest_identity_token.into(),
            created_at: Utc::now().trunc_subsecs(3),
            num_cores: specs.num_cores,
            mem_size: specs.mem_size,
            disk_space: specs.disk_space,
            extra_interfaces: specs.extra_interfaces.clone(),
            state,
            mounts: specs.mounts.clone(),
            metadata: specs.metadata.clone(),
            upgraded: false,
        };
        record.validate()?;
        Ok(record)
    }

    fn validate(&self) -> Result<()> {
        let fail = |what: &str| {
            Err(Error::InvalidSnapshot(format!(
                "snapshot '{}' (index {}): {}",
                self.name, self.index, what
            )))
        };

        if self.name.is_empty() {
            return fail("name is empty");
        }
        if !self.state.is_quiescent() {
            return fail(&format!("unsupported vm state {}", self.state));
        }
        if self.num_cores < 1 {
            return fail("invalid number of cores");
        }
        if self.mem_size.in_bytes() < 1 {
            return fail("invalid memory size");
        }
        if self.disk_space.in_bytes() < 1 {
            return fail("invalid disk size");
        }
        if self.index < 1 {
            return fail("index is not positive");
        }
        if self.index > MAX_SNAPSHOT_INDEX {
            return fail(&format!("index exceeds maximum of {}", MAX_SNAPSHOT_INDEX));
        }
        if self.parent_index >= self.index {
            return fail(&format!("parent {} does not precede it", self.parent_index));
        }
        Ok(())
    }

    /// Snapshot name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Free-form comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Index within the chain.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Parent index, 0 for a root snapshot.
    pub fn parent_index(&self) -> u32 {
        self.parent_index
    }

    /// Guest identity token at capture time.
    pub fn guest_identity_token(&self) -> &str {
        &self.guest_identity_token
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Captured core count.
    pub fn num_cores(&self) -> u32 {
        self.num_cores
    }

    /// Captured memory size.
    pub fn mem_size(&self) -> MemorySize {
        self.mem_size
    }

    /// Captured disk size.
    pub fn disk_space(&self) -> MemorySize {
        self.disk_space
    }

    /// Captured extra interfaces.
    pub fn extra_interfaces(&self) -> &[NetworkInterface] {
        &self.extra_interfaces
    }

    /// Captured power state.
    pub fn state(&self) -> VmState {
        self.state
    }

    /// Captured mounts.
    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    /// Captured metadata.
    pub fn metadata(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.metadata
    }

    /// Whether this record was migrated from an older format.
    pub fn is_upgraded(&self) -> bool {
        self.upgraded
    }

    /// Overwrite the restorable parts of `specs` with the captured values.
    pub fn apply_to(&self, specs: &mut VmSpecs) {
        specs.num_cores = self.num_cores;
        specs.mem_size = self.mem_size;
        specs.disk_space = self.disk_space;
        specs.extra_interfaces = self.extra_interfaces.clone();
        specs.mounts = self.mounts.clone();
        specs.metadata = self.metadata.clone();
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub(crate) fn set_comment(&mut self, comment: impl Into<String>) {
        self.comment = comment.into();
    }

    pub(crate) fn set_parent_index(&mut self, parent_index: u32) {
        self.parent_index = parent_index;
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::InvalidSnapshot(format!("invalid creation timestamp '{}': {}", raw, e)))
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// On-disk form of a [`SnapshotRecord`].
///
/// Integers are signed and optional fields are tolerated so that malformed
/// or legacy input reaches validation instead of failing in the parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    /// Snapshot name.
    pub name: String,
    /// Comment.
    #[serde(default)]
    pub comment: String,
    /// Parent index.
    pub parent: i64,
    /// Guest identity token. Legacy files name it `cloud_init_instance_id`
    /// or omit it.
    #[serde(default, alias = "cloud_init_instance_id", skip_serializing_if = "Option::is_none")]
    pub guest_identity_token: Option<String>,
    /// Index.
    pub index: i64,
    /// ISO-8601 timestamp with millisecond precision.
    pub creation_timestamp: String,
    /// Core count.
    pub num_cores: i64,
    /// Memory size in bytes.
    pub mem_size: MemorySize,
    /// Disk size in bytes.
    pub disk_space: MemorySize,
    /// Extra interfaces. Absent in legacy files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_interfaces: Option<Vec<NetworkInterface>>,
    /// Power state as an integer.
    pub state: u8,
    /// Mounts.
    #[serde(default, with = "mounts_as_array")]
    pub mounts: MountTable,
    /// Metadata.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Set once a legacy record has been backfilled.
    #[serde(default, skip_serializing_if = "is_false")]
    pub upgraded: bool,
}

/// Values used to complete records that predate newer fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyBackfill {
    /// Current guest identity token of the instance.
    pub guest_identity_token: String,
    /// Current extra interfaces of the instance.
    pub extra_interfaces: Vec<NetworkInterface>,
}

impl PersistedSnapshot {
    /// Whether newer fields are missing.
    pub fn is_legacy(&self) -> bool {
        self.guest_identity_token.is_none() || self.extra_interfaces.is_none()
    }

    /// Fill missing fields from the live instance and mark the record upgraded.
    pub fn backfill(&mut self, from: &LegacyBackfill) {
        if !self.is_legacy() {
            return;
        }
        if self.guest_identity_token.is_none() {
            self.guest_identity_token = Some(from.guest_identity_token.clone());
        }
        if self.extra_interfaces.is_none() {
            self.extra_interfaces = Some(from.extra_interfaces.clone());
        }
        self.upgraded = true;
    }
}

impl From<&SnapshotRecord> for PersistedSnapshot {
    fn from(record: &SnapshotRecord) -> Self {
        Self {
            name: record.name.clone(),
            comment: record.comment.clone(),
            parent: record.parent_index.into(),
            guest_identity_token: Some(record.guest_identity_token.clone()),
            index: record.index.into(),
            creation_timestamp: format_timestamp(&record.created_at),
            num_cores: record.num_cores.into(),
            mem_size: record.mem_size,
            disk_space: record.disk_space,
            extra_interfaces: Some(record.extra_interfaces.clone()),
            state: record.state.into(),
            mounts: record.mounts.clone(),
            metadata: record.metadata.clone(),
            upgraded: record.upgraded,
        }
    }
}

impl TryFrom<PersistedSnapshot> for SnapshotRecord {
    type Error = Error;

    fn try_from(p: PersistedSnapshot) -> Result<Self> {
        let invalid = |what: String| Error::InvalidSnapshot(format!("snapshot '{}': {}", p.name, what));

        if p.is_legacy() {
            return Err(invalid("record has not been backfilled".to_string()));
        }
        let index = u32::try_from(p.index)
            .map_err(|_| invalid(format!("index {} is not positive", p.index)))?;
        let parent_index = u32::try_from(p.parent)
            .map_err(|_| invalid(format!("parent {} is negative", p.parent)))?;
        let num_cores = u32::try_from(p.num_cores)
            .map_err(|_| invalid("invalid number of cores".to_string()))?;
        let state = VmState::try_from(p.state).map_err(invalid)?;
        let created_at = parse_timestamp(&p.creation_timestamp)?;

        let record = Self {
            name: p.name,
            comment: p.comment,
            index,
            parent_index,
            guest_identity_token: p.guest_identity_token.unwrap_or_default(),
            created_at,
            num_cores,
            mem_size: p.mem_size,
            disk_space: p.disk_space,
            extra_interfaces: p.extra_interfaces.unwrap_or_default(),
            state,
            mounts: p.mounts,
            metadata: p.metadata,
            upgraded: p.upgraded,
        };
        record.validate()?;
        Ok(record)
    }
}
