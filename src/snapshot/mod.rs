//! Snapshot history of an instance.
//!
//! A chain of differencing disks plus the metadata describing them:
//! - [`SnapshotRecord`]: captured metadata of one snapshot
//! - [`SnapshotNode`]: a record bound to its frozen disk
//! - [`SnapshotChain`]: the tree of nodes with capture, erase and apply
//! - [`ChainStore`]: atomic persistence of the whole tree

pub mod chain;
pub mod node;
pub mod record;
pub mod store;

pub use chain::{SnapshotChain, SnapshotInfo};
pub use node::SnapshotNode;
pub use record::{
    validate_snapshot_name, LegacyBackfill, PersistedSnapshot, SnapshotRecord, MAX_NAME_LEN,
    MAX_SNAPSHOT_INDEX,
};
pub use store::{ChainFile, ChainStore, CHAIN_FILE};
