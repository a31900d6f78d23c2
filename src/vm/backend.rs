//! Hypervisor seam.
//!
//! The state machine drives power transitions through [`Hypervisor`] and
//! never branches on which implementation is behind it.

use super::specs::{VmMount, VmSpecs};
use crate::error::Result;
use crate::storage::DiskHandle;
use async_trait::async_trait;

/// Controls the native VM object of one instance.
///
/// A call that fails without changing anything should return
/// [`Error::hypervisor_no_op`](crate::Error::hypervisor_no_op) so the caller
/// can revert to the prior state instead of assuming `unknown`.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Backend name (e.g., "qemu", "hyperv").
    fn name(&self) -> &'static str;

    /// Boot from `boot_disk` with the given specs.
    async fn start(&self, boot_disk: &DiskHandle, specs: &VmSpecs) -> Result<()>;

    /// Power off.
    async fn shutdown(&self) -> Result<()>;

    /// Save guest memory and pause.
    async fn suspend(&self) -> Result<()>;

    /// Continue from a suspended image.
    async fn resume(&self) -> Result<()>;

    /// Reboot the guest.
    async fn restart(&self) -> Result<()>;

    /// Attach a host directory at `target` inside the guest.
    async fn activate_mount(&self, target: &str, mount: &VmMount) -> Result<()>;

    /// Detach the mount at `target`.
    async fn deactivate_mount(&self, target: &str) -> Result<()>;
}
