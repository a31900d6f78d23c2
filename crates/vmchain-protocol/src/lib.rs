//! Client-facing operation types for vmchain.
//!
//! These types describe the semantic contract of the snapshot and power
//! operations a client may request against one instance. They carry no
//! framing: any transport that can move JSON documents can carry them.
//!
//! ```text
//! {"instance": "web", "operation": {"method": "create_snapshot", "name": "s1"}}
//! ```

#![deny(missing_docs)]

use serde::{Deserialize, Serialize};

/// Protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// A request addressed to one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Instance name.
    pub instance: String,
    /// Operation to perform.
    pub operation: Operation,
}

impl Request {
    /// Create a request for an instance.
    pub fn new(instance: impl Into<String>, operation: Operation) -> Self {
        Self {
            instance: instance.into(),
            operation,
        }
    }
}

/// Operations a client may request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Operation {
    /// Capture a snapshot of a stopped instance.
    CreateSnapshot {
        /// Snapshot name. Empty means "generate one".
        #[serde(default)]
        name: String,
        /// Free-form comment.
        #[serde(default)]
        comment: String,
    },

    /// Restore a stopped instance to a snapshot.
    RestoreSnapshot {
        /// Snapshot name.
        name: String,
        /// Skip the automatic safety snapshot taken before restoring.
        #[serde(default)]
        destructive: bool,
    },

    /// Delete a snapshot, reparenting its children.
    DeleteSnapshot {
        /// Snapshot name.
        name: String,
    },

    /// Stop an instance, optionally after a delay.
    Stop {
        /// Delay before powering off, in seconds.
        #[serde(default)]
        delay_secs: u64,
        /// Cancel a pending delayed stop instead of starting one.
        #[serde(default)]
        cancel: bool,
    },

    /// Describe one snapshot.
    SnapshotInfo {
        /// Snapshot name.
        name: String,
    },

    /// List all snapshots of the instance.
    ListSnapshots,
}

impl Operation {
    /// Operation name as used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateSnapshot { .. } => "create_snapshot",
            Operation::RestoreSnapshot { .. } => "restore_snapshot",
            Operation::DeleteSnapshot { .. } => "delete_snapshot",
            Operation::Stop { .. } => "stop",
            Operation::SnapshotInfo { .. } => "snapshot_info",
            Operation::ListSnapshots => "list_snapshots",
        }
    }
}

/// Responses to operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// Operation completed with nothing to report.
    Ok,

    /// A single snapshot description.
    Snapshot {
        /// The snapshot.
        snapshot: SnapshotSummary,
    },

    /// A list of snapshots, ordered by index.
    Snapshots {
        /// The snapshots.
        snapshots: Vec<SnapshotSummary>,
    },

    /// Operation failed.
    Error {
        /// Human-readable message.
        message: String,
        /// Failure class.
        code: ErrorCode,
    },
}

impl Response {
    /// Create an error response.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
            code,
        }
    }

    /// Whether this response reports a failure.
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

/// Failure classes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Named instance or snapshot does not exist.
    NotFound,
    /// Malformed argument (for example a bad snapshot name).
    InvalidArgument,
    /// Instance is in the wrong state or the name is taken.
    FailedPrecondition,
    /// Snapshot index space is exhausted.
    ResourceExhausted,
    /// Hypervisor, disk tooling or guest could not complete the request.
    Unavailable,
    /// Persisted data is inconsistent or an unexpected error occurred.
    Internal,
}

/// Client-facing description of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    /// Snapshot name.
    pub name: String,
    /// Comment.
    #[serde(default)]
    pub comment: String,
    /// Index within the chain.
    pub index: u32,
    /// Parent index (0 for a root snapshot).
    pub parent: u32,
    /// Name of the parent snapshot, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_name: Option<String>,
    /// Names of direct children.
    #[serde(default)]
    pub children: Vec<String>,
    /// Creation time, ISO-8601.
    pub created_at: String,
    /// Captured core count.
    pub num_cores: u32,
    /// Captured memory size in bytes.
    pub mem_size: u64,
    /// Captured disk size in bytes.
    pub disk_space: u64,
    /// Whether the instance is currently based on this snapshot.
    #[serde(default)]
    pub is_head: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let req = Request::new(
            "web",
            Operation::CreateSnapshot {
                name: "s1".to_string(),
                comment: String::new(),
            },
        );
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"method\":\"create_snapshot\""));
        assert!(json.contains("\"instance\":\"web\""));
    }

    #[test]
    fn test_stop_defaults() {
        let op: Operation = serde_json::from_str(r#"{"method":"stop"}"#).unwrap();
        assert_eq!(
            op,
            Operation::Stop {
                delay_secs: 0,
                cancel: false
            }
        );

        let op: Operation =
            serde_json::from_str(r#"{"method":"restore_snapshot","name":"s1"}"#).unwrap();
        assert_eq!(
            op,
            Operation::RestoreSnapshot {
                name: "s1".to_string(),
                destructive: false
            }
        );
    }

    #[test]
    fn test_error_response_serialization() {
        let resp = Response::error(ErrorCode::ResourceExhausted, "limit reached");
        assert!(resp.is_error());
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"status\":\"error\""));
        assert!(json.contains("resource_exhausted"));
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(Operation::ListSnapshots.name(), "list_snapshots");
        let op = Operation::DeleteSnapshot {
            name: "x".to_string(),
        };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains(op.name()));
    }
}
