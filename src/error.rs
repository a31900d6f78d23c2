//! Error types for vmchain.

use std::path::PathBuf;
use thiserror::Error;
use vmchain_protocol::ErrorCode;

/// Result type alias using vmchain's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad failure class, used to decide how callers and transports react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any backend call; nothing changed.
    Validation,
    /// A hypervisor or disk operation failed.
    Backend,
    /// The guest could not be reached.
    Guest,
    /// Persisted data contradicts itself.
    Invariant,
    /// Local I/O, serialization or configuration problem.
    Internal,
}

/// Errors that can occur in vmchain operations.
#[derive(Error, Debug)]
pub enum Error {
    // Validation errors
    /// Snapshot name is malformed.
    #[error("invalid snapshot name '{name}': {reason}")]
    InvalidSnapshotName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Snapshot record failed validation.
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// Instance is not in a state that allows capture or restore.
    #[error("instance {vm} must be off or stopped for snapshot operations, current state: {state}")]
    InvalidStateForSnapshot {
        /// Instance name.
        vm: String,
        /// Current state.
        state: String,
    },

    /// No more snapshot indices are available.
    #[error("instance {vm} reached the maximum of {max} snapshots")]
    SnapshotLimitExceeded {
        /// Instance name.
        vm: String,
        /// Maximum index.
        max: u32,
    },

    /// Another snapshot already has this name.
    #[error("instance {vm} already has a snapshot named '{name}'")]
    DuplicateSnapshotName {
        /// Instance name.
        vm: String,
        /// Duplicated name.
        name: String,
    },

    /// Snapshot not found.
    #[error("instance {vm} has no snapshot named '{name}'")]
    SnapshotNotFound {
        /// Instance name.
        vm: String,
        /// Requested name.
        name: String,
    },

    /// VM not found.
    #[error("vm not found: {0}")]
    VmNotFound(String),

    /// VM is in an invalid state for the requested operation.
    #[error("invalid vm state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    // Backend errors
    /// Hypervisor call failed.
    ///
    /// `no_op` is set when the backend guarantees nothing changed, which lets
    /// the state machine revert instead of falling back to `unknown`.
    #[error("hypervisor {operation} failed: {message}")]
    Hypervisor {
        /// Operation that failed.
        operation: String,
        /// Error message.
        message: String,
        /// Whether the failed call left the VM untouched.
        no_op: bool,
    },

    /// No hypervisor is attached to this VM.
    #[error("hypervisor unavailable: {0}")]
    HypervisorUnavailable(String),

    /// Differencing-disk operation failed.
    #[error("disk {operation} failed for {}: {message}", disk.display())]
    DiskOperation {
        /// Operation that failed.
        operation: String,
        /// Disk involved.
        disk: PathBuf,
        /// Error message.
        message: String,
    },

    /// Generic storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// External command failed.
    #[error("command failed: {command}: {message}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Error message.
        message: String,
    },

    // Guest errors
    /// Guest did not accept a message.
    #[error("guest of {vm} unreachable: {message}")]
    GuestUnreachable {
        /// Instance name.
        vm: String,
        /// Error message.
        message: String,
    },

    // Invariant violations
    /// Persisted chain metadata is inconsistent.
    #[error("corrupt snapshot chain at {}: {reason}", path.display())]
    CorruptChain {
        /// Chain file or directory.
        path: PathBuf,
        /// What is wrong.
        reason: String,
    },

    // Configuration errors
    /// Generic configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to load configuration.
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    /// Failed to save configuration.
    #[error("failed to save config: {0}")]
    ConfigSave(String),

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error wrapper.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create an invalid snapshot name error.
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSnapshotName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a snapshot not found error.
    pub fn snapshot_not_found(vm: impl Into<String>, name: impl Into<String>) -> Self {
        Self::SnapshotNotFound {
            vm: vm.into(),
            name: name.into(),
        }
    }

    /// Create a hypervisor error whose outcome is unknown.
    pub fn hypervisor(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hypervisor {
            operation: operation.into(),
            message: message.into(),
            no_op: false,
        }
    }

    /// Create a hypervisor error for a call that provably changed nothing.
    pub fn hypervisor_no_op(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hypervisor {
            operation: operation.into(),
            message: message.into(),
            no_op: true,
        }
    }

    /// Create a disk operation error.
    pub fn disk(
        operation: impl Into<String>,
        disk: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self::DiskOperation {
            operation: operation.into(),
            disk: disk.into(),
            message: message.into(),
        }
    }

    /// Create a command failed error.
    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a guest unreachable error.
    pub fn guest(vm: impl Into<String>, message: impl Into<String>) -> Self {
        Self::GuestUnreachable {
            vm: vm.into(),
            message: message.into(),
        }
    }

    /// Create a corrupt chain error.
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptChain {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether a failed backend call is known to have left the VM untouched.
    pub fn is_no_op(&self) -> bool {
        matches!(self, Error::Hypervisor { no_op: true, .. })
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidSnapshotName { .. }
            | Error::InvalidSnapshot(_)
            | Error::InvalidStateForSnapshot { .. }
            | Error::SnapshotLimitExceeded { .. }
            | Error::DuplicateSnapshotName { .. }
            | Error::SnapshotNotFound { .. }
            | Error::VmNotFound(_)
            | Error::InvalidState { .. } => ErrorKind::Validation,
            Error::Hypervisor { .. }
            | Error::HypervisorUnavailable(_)
            | Error::DiskOperation { .. }
            | Error::Storage(_)
            | Error::CommandFailed { .. } => ErrorKind::Backend,
            Error::GuestUnreachable { .. } => ErrorKind::Guest,
            Error::CorruptChain { .. } => ErrorKind::Invariant,
            Error::Config(_)
            | Error::ConfigLoad(_)
            | Error::ConfigSave(_)
            | Error::Io(_)
            | Error::Json(_) => ErrorKind::Internal,
        }
    }

    /// Map onto the client-facing failure class.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::SnapshotNotFound { .. } | Error::VmNotFound(_) => ErrorCode::NotFound,
            Error::InvalidSnapshotName { .. } | Error::InvalidSnapshot(_) => {
                ErrorCode::InvalidArgument
            }
            Error::InvalidStateForSnapshot { .. }
            | Error::InvalidState { .. }
            | Error::DuplicateSnapshotName { .. } => ErrorCode::FailedPrecondition,
            Error::SnapshotLimitExceeded { .. } => ErrorCode::ResourceExhausted,
            _ => match self.kind() {
                ErrorKind::Backend | ErrorKind::Guest => ErrorCode::Unavailable,
                _ => ErrorCode::Internal,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Error messages should include context that helps users fix the problem.

    #[test]
    fn test_snapshot_not_found_includes_names() {
        let err = Error::snapshot_not_found("web", "nightly");
        let msg = err.to_string();
        assert!(msg.contains("web"), "Error should include instance name");
        assert!(msg.contains("nightly"), "Error should include snapshot name");
    }

    #[test]
    fn test_invalid_state_for_snapshot_includes_state() {
        let err = Error::InvalidStateForSnapshot {
            vm: "web".to_string(),
            state: "running".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("running"));
        assert!(msg.contains("off or stopped"), "Error should say what is allowed");
    }

    #[test]
    fn test_disk_error_includes_path_and_operation() {
        let err = Error::disk("rebase", "/var/lib/vm/disk.0002.qcow2", "backing file missing");
        let msg = err.to_string();
        assert!(msg.contains("rebase"));
        assert!(msg.contains("disk.0002.qcow2"));
        assert!(msg.contains("backing file missing"));
    }

    #[test]
    fn test_corrupt_chain_includes_reason() {
        let err = Error::corrupt("/data/snapshots.json", "dangling parent 7 of snapshot 9");
        let msg = err.to_string();
        assert!(msg.contains("snapshots.json"));
        assert!(msg.contains("dangling parent"));
    }

    #[test]
    fn test_error_taxonomy() {
        let cases = [
            (Error::invalid_name("-x", "must start with a letter"), ErrorKind::Validation),
            (Error::hypervisor("start", "boom"), ErrorKind::Backend),
            (Error::disk("merge", "/d", "boom"), ErrorKind::Backend),
            (Error::guest("web", "connection refused"), ErrorKind::Guest),
            (Error::corrupt("/c", "duplicate index"), ErrorKind::Invariant),
            (Error::Config("bad".into()), ErrorKind::Internal),
        ];
        for (err, kind) in cases {
            assert_eq!(err.kind(), kind, "{}", err);
        }
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            Error::SnapshotLimitExceeded {
                vm: "web".into(),
                max: 9999
            }
            .code(),
            ErrorCode::ResourceExhausted
        );
        assert_eq!(
            Error::snapshot_not_found("web", "s1").code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            Error::guest("web", "gone").code(),
            ErrorCode::Unavailable
        );
        assert_eq!(Error::corrupt("/c", "x").code(), ErrorCode::Internal);
    }

    #[test]
    fn test_no_op_flag() {
        assert!(Error::hypervisor_no_op("suspend", "not supported").is_no_op());
        assert!(!Error::hypervisor("suspend", "timeout").is_no_op());
    }
}
