//! qcow2 backend driven by `qemu-img`.
//!
//! Snapshots are chains of qcow2 overlays. Reparenting uses a safe
//! `qemu-img rebase`, which copies any clusters the child would otherwise
//! lose, so intermediate disks can be dropped without merging.

use super::{DiskHandle, DiskInfo, ReparentMode, VirtualDiskBackend};
use crate::error::{Error, Result};
use crate::vm::specs::MemorySize;
use async_trait::async_trait;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

/// Default `qemu-img` binary.
pub const DEFAULT_QEMU_IMG: &str = "qemu-img";

/// Default timeout for a single `qemu-img` invocation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

const FORMAT: &str = "qcow2";

/// `qemu-img` subcommands used by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QemuImgCmd {
    Create,
    Rebase,
    Commit,
    Info,
    Resize,
}

impl QemuImgCmd {
    fn name(&self) -> &'static str {
        match self {
            QemuImgCmd::Create => "create",
            QemuImgCmd::Rebase => "rebase",
            QemuImgCmd::Commit => "commit",
            QemuImgCmd::Info => "info",
            QemuImgCmd::Resize => "resize",
        }
    }
}

/// [`VirtualDiskBackend`] for qcow2 images.
#[derive(Debug, Clone)]
pub struct QemuImgBackend {
    binary: PathBuf,
    timeout: Duration,
}

impl Default for QemuImgBackend {
    fn default() -> Self {
        Self::new(DEFAULT_QEMU_IMG, DEFAULT_TIMEOUT)
    }
}

impl QemuImgBackend {
    /// Create a backend using the given binary and per-call timeout.
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Run a subcommand, returning stdout on success.
    async fn run(&self, cmd: QemuImgCmd, disk: &DiskHandle, args: Vec<OsString>) -> Result<Vec<u8>> {
        let label = format!("qemu-img {}", cmd.name());
        tracing::debug!(command = %label, disk = %disk, "running");

        let mut command = Command::new(&self.binary);
        command.arg(cmd.name()).args(&args).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                Error::command_failed(
                    &label,
                    format!("timed out after {}", humantime::format_duration(self.timeout)),
                )
            })?
            .map_err(|e| Error::command_failed(&label, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::disk(cmd.name(), disk.path(), stderr.trim()));
        }

        Ok(output.stdout)
    }
}

fn create_args(parent: &DiskHandle, child: &DiskHandle) -> Vec<OsString> {
    vec![
        "-f".into(),
        FORMAT.into(),
        "-F".into(),
        FORMAT.into(),
        "-b".into(),
        parent.path().into(),
        child.path().into(),
    ]
}

fn rebase_args(child: &DiskHandle, new_parent: &DiskHandle) -> Vec<OsString> {
    vec![
        "-f".into(),
        FORMAT.into(),
        "-F".into(),
        FORMAT.into(),
        "-b".into(),
        new_parent.path().into(),
        child.path().into(),
    ]
}

fn info_args(disk: &DiskHandle, backing_chain: bool) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["--output=json".into()];
    if backing_chain {
        args.push("--backing-chain".into());
    }
    args.push(disk.path().into());
    args
}

#[derive(Debug, Deserialize)]
struct ImageInfo {
    filename: PathBuf,
    format: String,
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
    #[serde(rename = "actual-size")]
    actual_size: Option<u64>,
    #[serde(rename = "full-backing-filename")]
    full_backing_filename: Option<PathBuf>,
    #[serde(rename = "backing-filename")]
    backing_filename: Option<PathBuf>,
}

impl From<ImageInfo> for DiskInfo {
    fn from(info: ImageInfo) -> Self {
        DiskInfo {
            path: info.filename,
            format: info.format,
            virtual_size: info.virtual_size,
            actual_size: info.actual_size,
            backing_file: info.full_backing_filename.or(info.backing_filename),
        }
    }
}

fn parse_info(data: &[u8]) -> Result<DiskInfo> {
    let info: ImageInfo = serde_json::from_slice(data)?;
    Ok(info.into())
}

fn parse_chain(data: &[u8]) -> Result<Vec<DiskHandle>> {
    let infos: Vec<ImageInfo> = serde_json::from_slice(data)?;
    Ok(infos
        .into_iter()
        .map(|i| DiskHandle::new(i.filename))
        .collect())
}

#[async_trait]
impl VirtualDiskBackend for QemuImgBackend {
    fn name(&self) -> &'static str {
        "qemu-img"
    }

    fn disk_extension(&self) -> &'static str {
        FORMAT
    }

    fn reparent_mode(&self) -> ReparentMode {
        ReparentMode::Rebase
    }

    async fn exists(&self, disk: &DiskHandle) -> Result<bool> {
        Ok(tokio::fs::try_exists(disk.path()).await?)
    }

    async fn create_child_disk(&self, parent: &DiskHandle, child: &DiskHandle) -> Result<()> {
        self.run(QemuImgCmd::Create, child, create_args(parent, child))
            .await?;
        tracing::info!(parent = %parent, child = %child, "created differencing disk");
        Ok(())
    }

    async fn reparent(&self, child: &DiskHandle, new_parent: &DiskHandle) -> Result<()> {
        self.run(QemuImgCmd::Rebase, child, rebase_args(child, new_parent))
            .await?;
        tracing::info!(child = %child, parent = %new_parent, "rebased disk");
        Ok(())
    }

    async fn merge(&self, child: &DiskHandle) -> Result<()> {
        self.run(QemuImgCmd::Commit, child, vec![child.path().into()])
            .await?;
        Ok(())
    }

    async fn list_chain(&self, disk: &DiskHandle) -> Result<Vec<DiskHandle>> {
        let out = self
            .run(QemuImgCmd::Info, disk, info_args(disk, true))
            .await?;
        parse_chain(&out)
    }

    async fn resize(&self, disk: &DiskHandle, size: MemorySize) -> Result<()> {
        self.run(
            QemuImgCmd::Resize,
            disk,
            vec![disk.path().into(), size.in_bytes().to_string().into()],
        )
        .await?;
        Ok(())
    }

    async fn get_info(&self, disk: &DiskHandle) -> Result<DiskInfo> {
        let out = self
            .run(QemuImgCmd::Info, disk, info_args(disk, false))
            .await?;
        parse_info(&out)
    }

    async fn remove(&self, disk: &DiskHandle) -> Result<()> {
        tokio::fs::remove_file(disk.path())
            .await
            .map_err(|e| Error::disk("remove", disk.path(), e.to_string()))
    }
}
