//! Differencing-disk storage.
//!
//! The snapshot engine never touches disk files itself. Every mutation goes
//! through a [`VirtualDiskBackend`], one implementation per on-disk format:
//!
//! - [`QemuImgBackend`]: qcow2 overlays driven by `qemu-img`
//! - [`MemoryDiskBackend`]: in-process model with fault injection
//!
//! # Layout
//!
//! ```text
//! <instance dir>/
//! ├── ubuntu.qcow2           # base image
//! ├── ubuntu.0001.qcow2      # snapshot 1 (backed by base)
//! ├── ubuntu.0002.qcow2      # snapshot 2 (backed by 0001)
//! └── ubuntu.0003.qcow2      # live disk (backed by head), named for next_index
//! ```

pub mod memory;
pub mod qemu_img;

use crate::error::Result;
use crate::vm::specs::MemorySize;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use memory::MemoryDiskBackend;
pub use qemu_img::QemuImgBackend;

/// Handle to one disk in a differencing chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiskHandle(PathBuf);

impl DiskHandle {
    /// Create a handle for a disk path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Path to the disk.
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl std::fmt::Display for DiskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Disk metadata reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    /// Disk path.
    pub path: PathBuf,
    /// Format name (e.g. "qcow2").
    pub format: String,
    /// Guest-visible size in bytes.
    pub virtual_size: u64,
    /// Host bytes used, when known.
    pub actual_size: Option<u64>,
    /// Immediate parent, if any.
    pub backing_file: Option<PathBuf>,
}

/// How a backend removes an intermediate disk from a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReparentMode {
    /// Children can be rebased onto the grandparent with contents preserved.
    Rebase,
    /// The disk must be merged into its parent first; every disk that was
    /// backed by either of them is then relinked onto the parent.
    MergeThenRelink,
}

/// Operations on a per-hypervisor differencing-disk format.
#[async_trait]
pub trait VirtualDiskBackend: Send + Sync {
    /// Backend name (e.g. "qemu-img", "memory").
    fn name(&self) -> &'static str;

    /// File extension of disks this backend creates.
    fn disk_extension(&self) -> &'static str;

    /// How intermediate disks are removed.
    fn reparent_mode(&self) -> ReparentMode {
        ReparentMode::Rebase
    }

    /// Check whether a disk exists.
    async fn exists(&self, disk: &DiskHandle) -> Result<bool>;

    /// Create `child` as a new, empty differencing disk on top of `parent`.
    async fn create_child_disk(&self, parent: &DiskHandle, child: &DiskHandle) -> Result<()>;

    /// Point `child` at `new_parent`.
    ///
    /// In [`ReparentMode::Rebase`] the guest-visible contents of `child` are
    /// preserved. In [`ReparentMode::MergeThenRelink`] only the link changes.
    async fn reparent(&self, child: &DiskHandle, new_parent: &DiskHandle) -> Result<()>;

    /// Merge `child` into its parent.
    async fn merge(&self, child: &DiskHandle) -> Result<()>;

    /// Ordered chain starting at `disk` and ending at its root.
    async fn list_chain(&self, disk: &DiskHandle) -> Result<Vec<DiskHandle>>;

    /// Grow or shrink the guest-visible size.
    async fn resize(&self, disk: &DiskHandle, size: MemorySize) -> Result<()>;

    /// Describe a disk.
    async fn get_info(&self, disk: &DiskHandle) -> Result<DiskInfo>;

    /// Delete a disk.
    async fn remove(&self, disk: &DiskHandle) -> Result<()>;
}

/// Where an instance's disks live and how they are named.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskLayout {
    dir: PathBuf,
    base: DiskHandle,
    stem: String,
    extension: String,
}

impl DiskLayout {
    /// Create a layout in `dir` for a chain rooted at `base`.
    pub fn new(dir: impl Into<PathBuf>, base: impl Into<PathBuf>, extension: &str) -> Self {
        let base = base.into();
        let stem = base
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "disk".to_string());
        Self {
            dir: dir.into(),
            base: DiskHandle::new(base),
            stem,
            extension: extension.to_string(),
        }
    }

    /// Directory holding snapshot and live disks.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Base image at the root of the chain.
    pub fn base(&self) -> &DiskHandle {
        &self.base
    }

    /// Disk named for `index`.
    pub fn disk(&self, index: u32) -> DiskHandle {
        DiskHandle::new(
            self.dir
                .join(format!("{}.{:04}.{}", self.stem, index, self.extension)),
        )
    }

    /// Disk of the snapshot at `index`, or the base image for index 0.
    pub fn disk_or_base(&self, index: u32) -> DiskHandle {
        if index == 0 {
            self.base.clone()
        } else {
            self.disk(index)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_names_disks_by_index() {
        let layout = DiskLayout::new("/vms/web", "/vms/web/ubuntu-24.04.img", "qcow2");
        assert_eq!(
            layout.disk(7).path(),
            Path::new("/vms/web/ubuntu-24.04.0007.qcow2")
        );
        assert_eq!(
            layout.disk(12345).path(),
            Path::new("/vms/web/ubuntu-24.04.12345.qcow2")
        );
        assert_eq!(layout.disk_or_base(0), *layout.base());
        assert_eq!(layout.disk_or_base(1), layout.disk(1));
    }

    #[test]
    fn test_disk_handle_display() {
        let disk = DiskHandle::new("/tmp/a.qcow2");
        assert_eq!(disk.to_string(), "/tmp/a.qcow2");
    }
}
