//! A snapshot record bound to its frozen disk.

use super::record::SnapshotRecord;
use crate::error::Result;
use crate::storage::{DiskHandle, VirtualDiskBackend};

/// A [`SnapshotRecord`] plus the differencing disk that holds its contents.
///
/// The parent is referenced by index only; the owning chain resolves it.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotNode {
    record: SnapshotRecord,
    disk: DiskHandle,
}

impl SnapshotNode {
    /// Bind a record to an existing disk.
    pub fn new(record: SnapshotRecord, disk: DiskHandle) -> Self {
        Self { record, disk }
    }

    /// Freeze `live` as the disk of `record` and stack `next_live` on top.
    ///
    /// `live` keeps its name and becomes read-only from the chain's point of
    /// view. On failure nothing has been created.
    pub async fn capture(
        backend: &dyn VirtualDiskBackend,
        record: SnapshotRecord,
        live: DiskHandle,
        next_live: &DiskHandle,
    ) -> Result<Self> {
        backend.create_child_disk(&live, next_live).await?;
        Ok(Self::new(record, live))
    }

    /// Replace the live disk with a fresh child of this snapshot's disk.
    pub async fn apply(&self, backend: &dyn VirtualDiskBackend, live: &DiskHandle) -> Result<()> {
        if backend.exists(live).await? {
            backend.remove(live).await?;
        }
        backend.create_child_disk(&self.disk, live).await
    }

    /// Delete this snapshot's disk once nothing is backed by it.
    pub async fn erase_disk(&self, backend: &dyn VirtualDiskBackend) -> Result<()> {
        backend.remove(&self.disk).await
    }

    /// The record.
    pub fn record(&self) -> &SnapshotRecord {
        &self.record
    }

    pub(crate) fn record_mut(&mut self) -> &mut SnapshotRecord {
        &mut self.record
    }

    /// The frozen disk.
    pub fn disk(&self) -> &DiskHandle {
        &self.disk
    }

    /// Shorthand for the record's index.
    pub fn index(&self) -> u32 {
        self.record.index()
    }

    /// Shorthand for the record's parent index.
    pub fn parent_index(&self) -> u32 {
        self.record.parent_index()
    }

    /// Shorthand for the record's name.
    pub fn name(&self) -> &str {
        self.record.name()
    }
}
