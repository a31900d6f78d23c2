//! Crash-safe JSON files.
//!
//! Every metadata file vmchain owns is rewritten whole: the new content goes
//! to a temporary sibling, is synced, and is renamed over the destination.
//! A crash mid-write leaves either the old file or the new one.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Atomically replace `path` with the pretty-printed JSON of `value`.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let data = serde_json::to_vec_pretty(value)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".vmchain-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(&data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;

    tracing::trace!(path = %path.display(), bytes = data.len(), "wrote json");
    Ok(())
}

/// Read a JSON file, returning `None` when it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.json");

        let mut value = BTreeMap::new();
        value.insert("head".to_string(), 3);
        write_json_atomic(&path, &value).unwrap();

        let back: BTreeMap<String, i32> = read_json(&path).unwrap().unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_overwrite_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_json_atomic(&path, &1).unwrap();
        write_json_atomic(&path, &2).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(read_json::<i32>(&path).unwrap(), Some(2));
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let value: Option<i32> = read_json(&dir.path().join("absent.json")).unwrap();
        assert!(value.is_none());
    }
}
