//! vmchain - VM lifecycle state machine and snapshot chain engine.
//!
//! An instance ([`vm::VirtualMachine`]) moves through power states under a
//! per-instance lock and owns a tree of snapshots ([`snapshot::SnapshotChain`])
//! stored as differencing disks behind a [`storage::VirtualDiskBackend`].

pub mod config;
pub mod error;
pub mod instance;
pub mod persist;
pub mod protocol;
pub mod snapshot;
pub mod storage;
pub mod vm;
pub mod zone;

pub use error::{Error, ErrorKind, Result};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
