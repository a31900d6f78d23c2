//! VM lifecycle state types.

use serde::{Deserialize, Serialize};

/// VM power states.
///
/// Persisted as an integer; the discriminants are part of the on-disk format
/// of both instance records and snapshot records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum VmState {
    /// Powered off.
    Off = 0,

    /// Stopped. Same semantics as `Off`; kept for records that used it.
    Stopped = 1,

    /// Booting or resuming.
    Starting = 2,

    /// Rebooting.
    Restarting = 3,

    /// Running.
    Running = 4,

    /// Running with a pending, cancellable shutdown.
    DelayedShutdown = 5,

    /// Saving guest state.
    Suspending = 6,

    /// Guest state saved, not running.
    Suspended = 7,

    /// Indeterminate; needs operator attention.
    Unknown = 8,

    /// Forced offline by an availability zone.
    Unavailable = 9,
}

impl VmState {
    /// Check if disk contents are consistent and safe to capture or restore.
    pub fn is_quiescent(&self) -> bool {
        matches!(self, VmState::Off | VmState::Stopped)
    }

    /// Check if the VM can be started (or resumed).
    pub fn can_start(&self) -> bool {
        matches!(self, VmState::Off | VmState::Stopped | VmState::Suspended)
    }

    /// Check if the VM is up (including a pending delayed shutdown).
    pub fn is_running(&self) -> bool {
        matches!(self, VmState::Running | VmState::DelayedShutdown)
    }

    /// Check if the VM is mid-transition.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VmState::Starting | VmState::Restarting | VmState::Suspending
        )
    }

    /// Get the state name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            VmState::Off => "off",
            VmState::Stopped => "stopped",
            VmState::Starting => "starting",
            VmState::Restarting => "restarting",
            VmState::Running => "running",
            VmState::DelayedShutdown => "delayed_shutdown",
            VmState::Suspending => "suspending",
            VmState::Suspended => "suspended",
            VmState::Unknown => "unknown",
            VmState::Unavailable => "unavailable",
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl From<VmState> for u8 {
    fn from(state: VmState) -> u8 {
        state as u8
    }
}

impl TryFrom<u8> for VmState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => VmState::Off,
            1 => VmState::Stopped,
            2 => VmState::Starting,
            3 => VmState::Restarting,
            4 => VmState::Running,
            5 => VmState::DelayedShutdown,
            6 => VmState::Suspending,
            7 => VmState::Suspended,
            8 => VmState::Unknown,
            9 => VmState::Unavailable,
            other => return Err(format!("unsupported vm state {}", other)),
        })
    }
}
