//! Persistence of a snapshot chain.
//!
//! The whole chain lives in one `snapshots.json` file that is replaced
//! atomically on every change. Older installations kept one
//! `NNNN.snapshot.json` file per snapshot plus `snapshot-head` and
//! `snapshot-count` files; those are imported once and then superseded.

use super::record::{LegacyBackfill, PersistedSnapshot};
use crate::error::{Error, Result};
use crate::persist;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Chain file name.
pub const CHAIN_FILE: &str = "snapshots.json";

/// Current chain file format version.
pub const CHAIN_FORMAT_VERSION: u32 = 1;

const LEGACY_SUFFIX: &str = ".snapshot.json";
const LEGACY_HEAD: &str = "snapshot-head";
const LEGACY_COUNT: &str = "snapshot-count";

/// On-disk form of a whole chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainFile {
    /// Format version.
    pub version: u32,
    /// Index of the head snapshot, 0 when the live disk descends from the base.
    pub head: u32,
    /// Next index to allocate.
    pub next_index: u32,
    /// Snapshots ordered by index.
    pub snapshots: Vec<PersistedSnapshot>,
}

impl Default for ChainFile {
    fn default() -> Self {
        Self {
            version: CHAIN_FORMAT_VERSION,
            head: 0,
            next_index: 1,
            snapshots: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
struct LegacyWrapper {
    snapshot: PersistedSnapshot,
}

/// Reads and writes the chain file of one instance.
#[derive(Debug, Clone)]
pub struct ChainStore {
    dir: PathBuf,
}

impl ChainStore {
    /// Create a store rooted at an instance directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Instance directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the chain file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(CHAIN_FILE)
    }

    /// Load the chain file, if present.
    pub fn load(&self) -> Result<Option<ChainFile>> {
        let path = self.path();
        let file: Option<ChainFile> = persist::read_json(&path)
            .map_err(|e| Error::corrupt(&path, format!("unreadable chain file: {}", e)))?;
        if let Some(file) = &file {
            if file.version > CHAIN_FORMAT_VERSION {
                return Err(Error::corrupt(
                    &path,
                    format!("unsupported format version {}", file.version),
                ));
            }
        }
        Ok(file)
    }

    /// Atomically replace the chain file.
    pub fn save(&self, file: &ChainFile) -> Result<()> {
        persist::write_json_atomic(&self.path(), file)
    }

    fn legacy_files(&self) -> Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_legacy = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(LEGACY_SUFFIX))
                .map(|stem| stem.len() == 4 && stem.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(false);
            if is_legacy {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn read_counter(&self, name: &str) -> Result<Option<u32>> {
        let path = self.dir.join(name);
        match std::fs::read_to_string(&path) {
            Ok(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| Error::corrupt(&path, format!("not a number: '{}'", raw.trim()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Import per-snapshot legacy files, backfilling missing fields.
    ///
    /// Returns `None` when no legacy files exist.
    pub fn load_legacy(&self, backfill: &LegacyBackfill) -> Result<Option<ChainFile>> {
        let files = self.legacy_files()?;
        if files.is_empty() {
            return Ok(None);
        }

        let mut snapshots = Vec::with_capacity(files.len());
        for path in &files {
            let data = std::fs::read(path)?;
            let wrapper: LegacyWrapper = serde_json::from_slice(&data)
                .map_err(|e| Error::corrupt(path, format!("unreadable snapshot file: {}", e)))?;
            let mut snapshot = wrapper.snapshot;
            if snapshot.is_legacy() {
                tracing::info!(snapshot = %snapshot.name, "upgrading legacy snapshot record");
                snapshot.backfill(backfill);
            }
            snapshots.push(snapshot);
        }
        snapshots.sort_by_key(|s| s.index);

        let max_index = snapshots
            .iter()
            .map(|s| u32::try_from(s.index).unwrap_or(0))
            .max()
            .unwrap_or(0);
        let next_index = match self.read_counter(LEGACY_COUNT)? {
            Some(count) => count.saturating_add(1),
            None => max_index.saturating_add(1),
        };
        let head = self.read_counter(LEGACY_HEAD)?.unwrap_or(0);

        tracing::info!(
            dir = %self.dir.display(),
            snapshots = snapshots.len(),
            head,
            next_index,
            "imported legacy snapshot files"
        );

        Ok(Some(ChainFile {
            version: CHAIN_FORMAT_VERSION,
            head,
            next_index,
            snapshots,
        }))
    }

    /// Delete legacy files after the chain file has superseded them.
    pub fn remove_legacy(&self) -> Result<()> {
        for path in self.legacy_files()? {
            std::fs::remove_file(&path)?;
        }
        for name in [LEGACY_HEAD, LEGACY_COUNT] {
            match std::fs::remove_file(self.dir.join(name)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
