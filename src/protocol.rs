//! Execution of client-facing operations.
//!
//! This module re-exports the wire types from vmchain-protocol and maps each
//! [`Operation`] onto a [`VirtualMachine`] call. Failures become
//! [`Response::Error`] carrying the error's [`ErrorCode`].

pub use vmchain_protocol::*;

use crate::error::Result;
use crate::snapshot::SnapshotInfo;
use crate::vm::VirtualMachine;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Wire summary of a snapshot.
pub fn summarize(info: &SnapshotInfo) -> SnapshotSummary {
    let record = &info.record;
    SnapshotSummary {
        name: record.name().to_string(),
        comment: record.comment().to_string(),
        index: record.index(),
        parent: record.parent_index(),
        parent_name: info.parent_name.clone(),
        children: info.children.clone(),
        created_at: record
            .created_at()
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        num_cores: record.num_cores(),
        mem_size: record.mem_size().in_bytes(),
        disk_space: record.disk_space().in_bytes(),
        is_head: info.is_head,
    }
}

async fn execute(vm: &VirtualMachine, operation: Operation) -> Result<Response> {
    match operation {
        Operation::CreateSnapshot { name, comment } => {
            let record = vm.take_snapshot(&name, &comment).await?;
            let info = vm.snapshot_info(record.name()).await?;
            Ok(Response::Snapshot {
                snapshot: summarize(&info),
            })
        }
        Operation::RestoreSnapshot { name, destructive } => {
            vm.restore_snapshot(&name, destructive).await?;
            Ok(Response::Ok)
        }
        Operation::DeleteSnapshot { name } => {
            vm.delete_snapshot(&name).await?;
            Ok(Response::Ok)
        }
        Operation::Stop { cancel: true, .. } => {
            vm.cancel_shutdown().await?;
            Ok(Response::Ok)
        }
        Operation::Stop { delay_secs, .. } => {
            vm.shutdown(Duration::from_secs(delay_secs)).await?;
            Ok(Response::Ok)
        }
        Operation::SnapshotInfo { name } => {
            let info = vm.snapshot_info(&name).await?;
            Ok(Response::Snapshot {
                snapshot: summarize(&info),
            })
        }
        Operation::ListSnapshots => Ok(Response::Snapshots {
            snapshots: vm.snapshots().await.iter().map(summarize).collect(),
        }),
    }
}

/// Execute one operation against an instance.
pub async fn handle(vm: &VirtualMachine, operation: Operation) -> Response {
    let method = operation.name();
    tracing::debug!(vm = %vm.name(), method, "handling operation");
    match execute(vm, operation).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(vm = %vm.name(), method, error = %e, kind = ?e.kind(), "operation failed");
            Response::error(e.code(), e.to_string())
        }
    }
}

/// Route a request to the named instance.
pub async fn dispatch(vms: &HashMap<String, Arc<VirtualMachine>>, request: Request) -> Response {
    match vms.get(&request.instance) {
        Some(vm) => handle(vm, request.operation).await,
        None => Response::error(
            ErrorCode::NotFound,
            format!("instance '{}' does not exist", request.instance),
        ),
    }
}
