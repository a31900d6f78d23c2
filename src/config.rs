//! Global vmchain configuration.
//!
//! Stored as TOML under the user's config directory. A missing file yields
//! the defaults; durations are written in human-readable form (`"1m"`,
//! `"10s"`).

use crate::error::{Error, Result};
use crate::storage::QemuImgBackend;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for config and data directories.
const APP_NAME: &str = "vmchain";

/// Config file name.
const CONFIG_FILE: &str = "config.toml";

/// Serde adapter writing a [`Duration`] through `humantime`.
mod human_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Timing of delayed shutdowns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownSettings {
    /// Interval between countdown ticks.
    #[serde(with = "human_duration")]
    pub tick: Duration,

    /// Upper bound on a single guest notification.
    #[serde(with = "human_duration")]
    pub notice_timeout: Duration,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            notice_timeout: Duration::from_secs(10),
        }
    }
}

/// Global vmchain configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmchainConfig {
    /// Root of instance and zone data.
    pub data_dir: PathBuf,

    /// `qemu-img` binary.
    pub qemu_img: PathBuf,

    /// Timeout for one `qemu-img` invocation.
    #[serde(with = "human_duration")]
    pub qemu_img_timeout: Duration,

    /// Availability zone names.
    pub zones: Vec<String>,

    /// Delayed shutdown timing.
    pub shutdown: ShutdownSettings,
}

impl Default for VmchainConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            qemu_img: PathBuf::from(crate::storage::qemu_img::DEFAULT_QEMU_IMG),
            qemu_img_timeout: crate::storage::qemu_img::DEFAULT_TIMEOUT,
            zones: vec!["zone1".into(), "zone2".into(), "zone3".into()],
            shutdown: ShutdownSettings::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
}

impl VmchainConfig {
    /// Default config file location.
    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_NAME).join(CONFIG_FILE))
            .ok_or_else(|| Error::ConfigLoad("no config directory on this platform".into()))
    }

    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path().map_err(|e| Error::ConfigSave(e.to_string()))?;
        self.save_to(&path)
    }

    /// Load configuration from a file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(Error::ConfigLoad(format!("{}: {}", path.display(), e))),
        };
        let mut config: Self = toml::from_str(&raw)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        let data_dir = config.data_dir.clone();
        config.set_data_dir(&data_dir)?;
        Ok(config)
    }

    /// Replace the data directory, resolving a relative path against the
    /// working directory.
    pub fn set_data_dir(&mut self, dir: &Path) -> Result<()> {
        self.data_dir = std::path::absolute(dir)
            .map_err(|e| Error::Config(format!("data dir {}: {}", dir.display(), e)))?;
        Ok(())
    }

    /// Absolute form of `data_dir`.
    fn data_root(&self) -> PathBuf {
        std::path::absolute(&self.data_dir).unwrap_or_else(|_| self.data_dir.clone())
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let raw = toml::to_string_pretty(self).map_err(|e| Error::ConfigSave(e.to_string()))?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::ConfigSave(format!("{}: {}", dir.display(), e)))?;
        }
        std::fs::write(path, raw).map_err(|e| Error::ConfigSave(format!("{}: {}", path.display(), e)))
    }

    /// Directory holding one subdirectory per instance.
    pub fn instances_dir(&self) -> PathBuf {
        self.data_root().join("instances")
    }

    /// Directory holding availability zone files.
    pub fn zones_dir(&self) -> PathBuf {
        self.data_root().join("zones")
    }

    /// Disk backend configured for qcow2 images.
    pub fn disk_backend(&self) -> QemuImgBackend {
        QemuImgBackend::new(&self.qemu_img, self.qemu_img_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VmchainConfig::default();
        assert_eq!(config.shutdown.tick, Duration::from_secs(60));
        assert_eq!(config.shutdown.notice_timeout, Duration::from_secs(10));
        assert_eq!(config.qemu_img_timeout, Duration::from_secs(300));
        assert_eq!(config.zones, ["zone1", "zone2", "zone3"]);
        assert!(config.data_dir.ends_with("vmchain"));
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = VmchainConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, VmchainConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        let config = VmchainConfig {
            data_dir: dir.path().join("data"),
            shutdown: ShutdownSettings {
                tick: Duration::from_secs(30),
                notice_timeout: Duration::from_secs(2),
            },
            zones: vec!["east".into()],
            ..Default::default()
        };
        config.save_to(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("tick = \"30s\""));

        assert_eq!(VmchainConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "qemu_img_timeout = \"1m 30s\"\n").unwrap();

        let config = VmchainConfig::load_from(&path).unwrap();
        assert_eq!(config.qemu_img_timeout, Duration::from_secs(90));
        assert_eq!(config.shutdown, ShutdownSettings::default());
    }

    #[test]
    fn test_relative_data_dir_is_made_absolute() {
        let mut config = VmchainConfig::default();
        config.set_data_dir(Path::new("vms")).unwrap();
        assert!(config.data_dir.is_absolute());
        assert!(config.data_dir.ends_with("vms"));

        let config = VmchainConfig {
            data_dir: PathBuf::from("./relative"),
            ..Default::default()
        };
        assert!(config.instances_dir().is_absolute());
        assert!(config.zones_dir().is_absolute());
    }

    #[test]
    fn test_loaded_data_dir_is_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "data_dir = \"state/vmchain\"\n").unwrap();

        let config = VmchainConfig::load_from(&path).unwrap();
        assert!(config.data_dir.is_absolute());
        assert!(config.data_dir.ends_with("state/vmchain"));
    }

    #[test]
    fn test_bad_duration_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[shutdown]\ntick = \"soon\"\nnotice_timeout = \"1s\"\n").unwrap();

        let err = VmchainConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigLoad(_)));
        assert!(err.to_string().contains(CONFIG_FILE));
    }
}
