//! In-memory differencing-disk backend.
//!
//! Models parent links and sizes only. Every call is appended to an
//! operation log, and any operation can be made to fail for a given disk,
//! which lets callers exercise partial-failure paths deterministically.

use super::{DiskHandle, DiskInfo, ReparentMode, VirtualDiskBackend};
use crate::error::{Error, Result};
use crate::vm::specs::MemorySize;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

#[derive(Debug, Clone)]
struct MemDisk {
    parent: Option<PathBuf>,
    size: u64,
}

#[derive(Debug, Default)]
struct Inner {
    disks: HashMap<PathBuf, MemDisk>,
    log: Vec<String>,
    failures: HashSet<(String, PathBuf)>,
    fail_all: HashSet<String>,
    fail_onto: HashSet<PathBuf>,
}

/// In-memory [`VirtualDiskBackend`].
#[derive(Debug)]
pub struct MemoryDiskBackend {
    mode: ReparentMode,
    inner: Mutex<Inner>,
}

impl Default for MemoryDiskBackend {
    fn default() -> Self {
        Self::new(ReparentMode::Rebase)
    }
}

impl MemoryDiskBackend {
    /// Create an empty backend with the given reparent capability.
    pub fn new(mode: ReparentMode) -> Self {
        Self {
            mode,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Register a root disk.
    pub fn add_base(&self, disk: &DiskHandle, size: MemorySize) {
        self.inner.lock().disks.insert(
            disk.path().to_path_buf(),
            MemDisk {
                parent: None,
                size: size.in_bytes(),
            },
        );
    }

    /// Make `operation` fail whenever it targets `disk`.
    pub fn fail_on(&self, operation: &str, disk: &DiskHandle) {
        self.inner
            .lock()
            .failures
            .insert((operation.to_string(), disk.path().to_path_buf()));
    }

    /// Make `operation` fail for every disk.
    pub fn fail_all(&self, operation: &str) {
        self.inner.lock().fail_all.insert(operation.to_string());
    }

    /// Make every reparent onto `parent` fail.
    pub fn fail_reparent_onto(&self, parent: &DiskHandle) {
        self.inner
            .lock()
            .fail_onto
            .insert(parent.path().to_path_buf());
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        let mut inner = self.inner.lock();
        inner.failures.clear();
        inner.fail_all.clear();
        inner.fail_onto.clear();
    }

    /// Operations performed so far, as "op path" strings.
    pub fn log(&self) -> Vec<String> {
        self.inner.lock().log.clone()
    }

    /// Forget the operation log.
    pub fn clear_log(&self) {
        self.inner.lock().log.clear();
    }

    /// Current parent of a disk.
    pub fn parent_of(&self, disk: &DiskHandle) -> Option<DiskHandle> {
        self.inner
            .lock()
            .disks
            .get(disk.path())
            .and_then(|d| d.parent.clone())
            .map(DiskHandle::new)
    }

    /// Whether a disk exists (synchronous helper).
    pub fn contains(&self, disk: &DiskHandle) -> bool {
        self.inner.lock().disks.contains_key(disk.path())
    }

    fn begin(&self, operation: &str, disk: &DiskHandle) -> Result<parking_lot::MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock();
        let path = disk.path().to_path_buf();
        inner.log.push(format!("{} {}", operation, path.display()));
        if inner.fail_all.contains(operation)
            || inner.failures.contains(&(operation.to_string(), path.clone()))
        {
            return Err(Error::disk(operation, path, "injected failure"));
        }
        Ok(inner)
    }
}

fn missing(operation: &str, disk: &DiskHandle) -> Error {
    Error::disk(operation, disk.path(), "no such disk")
}

#[async_trait]
impl VirtualDiskBackend for MemoryDiskBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn disk_extension(&self) -> &'static str {
        "img"
    }

    fn reparent_mode(&self) -> ReparentMode {
        self.mode
    }

    async fn exists(&self, disk: &DiskHandle) -> Result<bool> {
        Ok(self.contains(disk))
    }

    async fn create_child_disk(&self, parent: &DiskHandle, child: &DiskHandle) -> Result<()> {
        let mut inner = self.begin("create", child)?;
        let size = inner
            .disks
            .get(parent.path())
            .map(|d| d.size)
            .ok_or_else(|| missing("create", parent))?;
        if inner.disks.contains_key(child.path()) {
            return Err(Error::disk("create", child.path(), "already exists"));
        }
        inner.disks.insert(
            child.path().to_path_buf(),
            MemDisk {
                parent: Some(parent.path().to_path_buf()),
                size,
            },
        );
        Ok(())
    }

    async fn reparent(&self, child: &DiskHandle, new_parent: &DiskHandle) -> Result<()> {
        let mut inner = self.begin("reparent", child)?;
        if inner.fail_onto.contains(new_parent.path()) {
            return Err(Error::disk("reparent", child.path(), "injected failure"));
        }
        if !inner.disks.contains_key(new_parent.path()) {
            return Err(missing("reparent", new_parent));
        }
        let disk = inner
            .disks
            .get_mut(child.path())
            .ok_or_else(|| missing("reparent", child))?;
        disk.parent = Some(new_parent.path().to_path_buf());
        Ok(())
    }

    async fn merge(&self, child: &DiskHandle) -> Result<()> {
        let inner = self.begin("merge", child)?;
        match inner.disks.get(child.path()) {
            Some(MemDisk {
                parent: Some(_), ..
            }) => Ok(()),
            Some(_) => Err(Error::disk("merge", child.path(), "disk has no parent")),
            None => Err(missing("merge", child)),
        }
    }

    async fn list_chain(&self, disk: &DiskHandle) -> Result<Vec<DiskHandle>> {
        let inner = self.begin("list", disk)?;
        let mut chain = Vec::new();
        let mut current = Some(disk.path().to_path_buf());
        while let Some(path) = current {
            let entry = inner
                .disks
                .get(&path)
                .ok_or_else(|| Error::disk("list", &path, "no such disk"))?;
            current = entry.parent.clone();
            chain.push(DiskHandle::new(path));
            if chain.len() > inner.disks.len() {
                return Err(Error::disk("list", disk.path(), "backing chain loops"));
            }
        }
        Ok(chain)
    }

    async fn resize(&self, disk: &DiskHandle, size: MemorySize) -> Result<()> {
        let mut inner = self.begin("resize", disk)?;
        let entry = inner
            .disks
            .get_mut(disk.path())
            .ok_or_else(|| missing("resize", disk))?;
        entry.size = size.in_bytes();
        Ok(())
    }

    async fn get_info(&self, disk: &DiskHandle) -> Result<DiskInfo> {
        let inner = self.begin("info", disk)?;
        let entry = inner
            .disks
            .get(disk.path())
            .ok_or_else(|| missing("info", disk))?;
        Ok(DiskInfo {
            path: disk.path().to_path_buf(),
            format: "memory".to_string(),
            virtual_size: entry.size,
            actual_size: None,
            backing_file: entry.parent.clone(),
        })
    }

    async fn remove(&self, disk: &DiskHandle) -> Result<()> {
        let mut inner = self.begin("remove", disk)?;
        let path = disk.path();
        if inner
            .disks
            .values()
            .any(|d| d.parent.as_deref() == Some(path))
        {
            return Err(Error::disk("remove", path, "disk still backs other disks"));
        }
        inner
            .disks
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| missing("remove", disk))
    }
}
