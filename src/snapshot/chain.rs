//! The snapshot chain engine.
//!
//! A chain is an arena of [`SnapshotNode`]s keyed by index. Parent links are
//! indices, never references. Every mutation is staged on a copy of the
//! in-memory state, written to disk as one atomic replacement of the chain
//! file, and only then swapped in, so a failed operation leaves both the
//! file and memory untouched.

use super::node::SnapshotNode;
use super::record::{
    validate_snapshot_name, LegacyBackfill, PersistedSnapshot, SnapshotRecord, MAX_SNAPSHOT_INDEX,
};
use super::store::{ChainFile, ChainStore, CHAIN_FORMAT_VERSION};
use crate::error::{Error, Result};
use crate::storage::{DiskHandle, DiskLayout, ReparentMode, VirtualDiskBackend};
use crate::vm::{VmSpecs, VmState};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct ChainState {
    nodes: BTreeMap<u32, SnapshotNode>,
    names: HashMap<String, u32>,
    next_index: u32,
    head: Option<u32>,
}

impl ChainState {
    fn empty() -> Self {
        Self {
            nodes: BTreeMap::new(),
            names: HashMap::new(),
            next_index: 1,
            head: None,
        }
    }

    fn insert(&mut self, node: SnapshotNode) {
        self.names.insert(node.name().to_string(), node.index());
        self.nodes.insert(node.index(), node);
    }

    fn children_of(&self, index: u32) -> Vec<u32> {
        self.nodes
            .values()
            .filter(|n| n.parent_index() == index)
            .map(|n| n.index())
            .collect()
    }

    fn to_file(&self) -> ChainFile {
        ChainFile {
            version: CHAIN_FORMAT_VERSION,
            head: self.head.unwrap_or(0),
            next_index: self.next_index,
            snapshots: self
                .nodes
                .values()
                .map(|n| PersistedSnapshot::from(n.record()))
                .collect(),
        }
    }

    fn from_file(
        path: &Path,
        file: ChainFile,
        layout: &DiskLayout,
        backfill: &LegacyBackfill,
    ) -> Result<(Self, bool)> {
        if file.next_index < 1 || file.next_index > MAX_SNAPSHOT_INDEX + 1 {
            return Err(Error::corrupt(
                path,
                format!("next index {} out of range", file.next_index),
            ));
        }

        let mut state = Self {
            next_index: file.next_index,
            ..Self::empty()
        };
        let mut upgraded = false;

        for mut persisted in file.snapshots {
            if persisted.is_legacy() {
                persisted.backfill(backfill);
                upgraded = true;
            }
            let record =
                SnapshotRecord::try_from(persisted).map_err(|e| Error::corrupt(path, e.to_string()))?;
            let index = record.index();
            if index >= state.next_index {
                return Err(Error::corrupt(
                    path,
                    format!("index {} is not below next index {}", index, state.next_index),
                ));
            }
            if state.nodes.contains_key(&index) {
                return Err(Error::corrupt(path, format!("duplicate index {}", index)));
            }
            if state.names.contains_key(record.name()) {
                return Err(Error::corrupt(
                    path,
                    format!("duplicate name '{}'", record.name()),
                ));
            }
            state.insert(SnapshotNode::new(record, layout.disk(index)));
        }

        for node in state.nodes.values() {
            let parent = node.parent_index();
            if parent != 0 && !state.nodes.contains_key(&parent) {
                return Err(Error::corrupt(
                    path,
                    format!("dangling parent {} of snapshot {}", parent, node.index()),
                ));
            }
        }

        state.head = match file.head {
            0 => None,
            head if state.nodes.contains_key(&head) => Some(head),
            head => return Err(Error::corrupt(path, format!("head {} does not exist", head))),
        };

        Ok((state, upgraded))
    }
}

/// One snapshot with its relationships resolved to names.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotInfo {
    /// The record.
    pub record: SnapshotRecord,
    /// Parent snapshot name, `None` for a root snapshot.
    pub parent_name: Option<String>,
    /// Names of direct children, in index order.
    pub children: Vec<String>,
    /// Whether the live disk descends directly from this snapshot.
    pub is_head: bool,
}

/// The snapshot history of one instance.
pub struct SnapshotChain {
    vm_name: String,
    state: ChainState,
    layout: DiskLayout,
    store: ChainStore,
    backend: Arc<dyn VirtualDiskBackend>,
}

impl std::fmt::Debug for SnapshotChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotChain")
            .field("vm_name", &self.vm_name)
            .field("backend", &self.backend.name())
            .field("snapshots", &self.state.nodes.len())
            .field("head", &self.state.head)
            .field("next_index", &self.state.next_index)
            .finish()
    }
}

impl SnapshotChain {
    /// Open the chain of an instance.
    ///
    /// Reads the chain file if present, otherwise imports legacy per-snapshot
    /// files, otherwise starts empty. Records missing newer fields are
    /// backfilled and the chain file is rewritten.
    pub fn open(
        vm_name: impl Into<String>,
        layout: DiskLayout,
        store: ChainStore,
        backend: Arc<dyn VirtualDiskBackend>,
        backfill: &LegacyBackfill,
    ) -> Result<Self> {
        let vm_name = vm_name.into();
        let (file, imported) = match store.load()? {
            Some(file) => (file, false),
            None => match store.load_legacy(backfill)? {
                Some(file) => (file, true),
                None => (ChainFile::default(), false),
            },
        };

        let (state, upgraded) = ChainState::from_file(&store.path(), file, &layout, backfill)?;
        let chain = Self {
            vm_name,
            state,
            layout,
            store,
            backend,
        };

        if imported || upgraded {
            chain.store.save(&chain.state.to_file())?;
        }
        if imported {
            if let Err(e) = chain.store.remove_legacy() {
                tracing::warn!(vm = %chain.vm_name, error = %e, "failed to remove legacy snapshot files");
            }
        }

        tracing::debug!(
            vm = %chain.vm_name,
            snapshots = chain.len(),
            head = chain.head_index(),
            next_index = chain.next_index(),
            "opened snapshot chain"
        );
        Ok(chain)
    }

    /// Instance name.
    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    /// Disk layout.
    pub fn layout(&self) -> &DiskLayout {
        &self.layout
    }

    /// Number of snapshots.
    pub fn len(&self) -> usize {
        self.state.nodes.len()
    }

    /// Whether the chain has no snapshots.
    pub fn is_empty(&self) -> bool {
        self.state.nodes.is_empty()
    }

    /// Index the next capture will use.
    pub fn next_index(&self) -> u32 {
        self.state.next_index
    }

    /// Head index, 0 when the live disk descends from the base image.
    pub fn head_index(&self) -> u32 {
        self.state.head.unwrap_or(0)
    }

    /// Head snapshot.
    pub fn head(&self) -> Option<&SnapshotNode> {
        self.state.head.and_then(|i| self.state.nodes.get(&i))
    }

    /// Look up a snapshot by name.
    pub fn get(&self, name: &str) -> Option<&SnapshotNode> {
        self.state
            .names
            .get(name)
            .and_then(|i| self.state.nodes.get(i))
    }

    /// Look up a snapshot by index.
    pub fn get_by_index(&self, index: u32) -> Option<&SnapshotNode> {
        self.state.nodes.get(&index)
    }

    /// Snapshots in index order.
    pub fn iter(&self) -> impl Iterator<Item = &SnapshotNode> {
        self.state.nodes.values()
    }

    /// Disk currently (or next) backing the running instance.
    pub fn live_disk(&self) -> DiskHandle {
        self.layout.disk(self.state.next_index)
    }

    fn find(&self, name: &str) -> Result<&SnapshotNode> {
        self.get(name)
            .ok_or_else(|| Error::snapshot_not_found(&self.vm_name, name))
    }

    /// Describe a snapshot.
    pub fn info(&self, name: &str) -> Result<SnapshotInfo> {
        let node = self.find(name)?;
        let parent_name = self
            .state
            .nodes
            .get(&node.parent_index())
            .map(|p| p.name().to_string());
        let children = self
            .state
            .children_of(node.index())
            .into_iter()
            .filter_map(|i| self.state.nodes.get(&i))
            .map(|c| c.name().to_string())
            .collect();
        Ok(SnapshotInfo {
            record: node.record().clone(),
            parent_name,
            children,
            is_head: self.state.head == Some(node.index()),
        })
    }

    /// Name used when a capture is requested without one.
    pub fn generate_name(&self) -> String {
        (self.state.next_index..)
            .map(|i| format!("snapshot{}", i))
            .find(|name| !self.state.names.contains_key(name))
            .unwrap_or_else(|| format!("snapshot{}", self.state.next_index))
    }

    /// Validate a capture request without touching any disk.
    ///
    /// An empty name is accepted; [`SnapshotChain::capture`] generates one.
    pub fn check_capture(&self, name: &str, state: VmState) -> Result<()> {
        if !state.is_quiescent() {
            return Err(Error::InvalidStateForSnapshot {
                vm: self.vm_name.clone(),
                state: state.to_string(),
            });
        }
        if self.state.next_index > MAX_SNAPSHOT_INDEX {
            return Err(Error::SnapshotLimitExceeded {
                vm: self.vm_name.clone(),
                max: MAX_SNAPSHOT_INDEX,
            });
        }
        if !name.is_empty() {
            validate_snapshot_name(name)?;
            if self.state.names.contains_key(name) {
                return Err(Error::DuplicateSnapshotName {
                    vm: self.vm_name.clone(),
                    name: name.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Capture the current disk and specs as a new snapshot under the head.
    ///
    /// The live disk is frozen in place as the snapshot's disk and a new live
    /// disk is created on top of it. The index is consumed only if every step
    /// succeeds.
    pub async fn capture(
        &mut self,
        name: &str,
        comment: &str,
        specs: &VmSpecs,
        state: VmState,
        guest_identity_token: &str,
    ) -> Result<SnapshotRecord> {
        self.check_capture(name, state)?;
        let name = if name.is_empty() {
            self.generate_name()
        } else {
            name.to_string()
        };

        let index = self.state.next_index;
        let parent_index = self.head_index();
        let record = SnapshotRecord::capture(
            &name,
            comment,
            index,
            parent_index,
            guest_identity_token,
            specs,
            state,
        )?;

        let backend = self.backend.as_ref();
        let live = self.layout.disk(index);
        let next_live = self.layout.disk(index + 1);

        if !backend.exists(&live).await? {
            let parent = self.layout.disk_or_base(parent_index);
            backend.create_child_disk(&parent, &live).await?;
        }
        if backend.exists(&next_live).await? {
            tracing::warn!(vm = %self.vm_name, disk = %next_live, "removing stale disk");
            backend.remove(&next_live).await?;
        }

        let node = SnapshotNode::capture(backend, record.clone(), live, &next_live).await?;

        let mut next = self.state.clone();
        next.insert(node);
        next.head = Some(index);
        next.next_index = index + 1;

        if let Err(e) = self.store.save(&next.to_file()) {
            if let Err(cleanup) = backend.remove(&next_live).await {
                tracing::warn!(vm = %self.vm_name, disk = %next_live, error = %cleanup, "failed to remove disk after aborted capture");
            }
            return Err(e);
        }
        self.state = next;

        tracing::info!(
            vm = %self.vm_name,
            snapshot = %name,
            index,
            parent = parent_index,
            "captured snapshot"
        );
        Ok(record)
    }

    /// Delete a snapshot, reparenting its children onto its parent.
    ///
    /// Metadata is written only after every disk operation has succeeded.
    /// Disks already moved off the erased snapshot are moved back when a
    /// later step fails, so recorded and actual disk parents keep agreeing.
    /// If that is impossible the error is [`Error::CorruptChain`].
    pub async fn erase(&mut self, name: &str) -> Result<SnapshotRecord> {
        let node = self.find(name)?.clone();
        let index = node.index();
        let parent_index = node.parent_index();
        let parent_disk = self.layout.disk_or_base(parent_index);
        let children = self.state.children_of(index);
        let head_is_erased = self.state.head == Some(index);

        let backend = self.backend.as_ref();
        let live = self.live_disk();
        let live_exists = backend.exists(&live).await?;

        let mut relink: Vec<DiskHandle> = children
            .iter()
            .filter_map(|i| self.state.nodes.get(i))
            .map(|c| c.disk().clone())
            .collect();
        if head_is_erased && live_exists {
            relink.push(live.clone());
        }

        match backend.reparent_mode() {
            ReparentMode::Rebase => {
                self.reparent_all(&relink, node.disk(), &parent_disk).await?;
            }
            ReparentMode::MergeThenRelink => {
                backend.merge(node.disk()).await?;

                let mut siblings: Vec<DiskHandle> = self
                    .state
                    .children_of(parent_index)
                    .into_iter()
                    .filter(|&i| i != index)
                    .filter_map(|i| self.state.nodes.get(&i))
                    .map(|s| s.disk().clone())
                    .collect();
                if self.head_index() == parent_index && live_exists {
                    siblings.push(live.clone());
                }

                if let Err(e) = self.reparent_all(&relink, node.disk(), &parent_disk).await {
                    tracing::error!(
                        vm = %self.vm_name,
                        snapshot = %name,
                        error = %e,
                        "merge completed but relinking children failed"
                    );
                    return Err(e);
                }
                for sibling in &siblings {
                    if let Err(e) = backend.reparent(sibling, &parent_disk).await {
                        tracing::error!(
                            vm = %self.vm_name,
                            snapshot = %name,
                            disk = %sibling,
                            error = %e,
                            "merge completed but relinking failed"
                        );
                        self.restore_parents(&relink, node.disk()).await?;
                        return Err(e);
                    }
                }
            }
        }

        let mut next = self.state.clone();
        next.nodes.remove(&index);
        next.names.remove(node.name());
        for child in &children {
            if let Some(c) = next.nodes.get_mut(child) {
                c.record_mut().set_parent_index(parent_index);
            }
        }
        if head_is_erased {
            next.head = (parent_index != 0).then_some(parent_index);
        }

        if let Err(e) = self.store.save(&next.to_file()) {
            self.restore_parents(&relink, node.disk()).await?;
            return Err(e);
        }
        self.state = next;

        if let Err(e) = node.erase_disk(backend).await {
            tracing::warn!(vm = %self.vm_name, disk = %node.disk(), error = %e, "failed to delete snapshot disk");
        }

        tracing::info!(
            vm = %self.vm_name,
            snapshot = %name,
            index,
            reparented = children.len(),
            "erased snapshot"
        );
        Ok(node.record().clone())
    }

    /// Move `disks` onto `new_parent`, putting them back on `old_parent` if
    /// any move fails.
    async fn reparent_all(
        &self,
        disks: &[DiskHandle],
        old_parent: &DiskHandle,
        new_parent: &DiskHandle,
    ) -> Result<()> {
        for (done, disk) in disks.iter().enumerate() {
            if let Err(e) = self.backend.reparent(disk, new_parent).await {
                self.restore_parents(&disks[..done], old_parent).await?;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Put `disks` back on `old_parent`.
    ///
    /// Fails with [`Error::CorruptChain`] when a disk cannot be moved back.
    async fn restore_parents(&self, disks: &[DiskHandle], old_parent: &DiskHandle) -> Result<()> {
        let mut stranded = Vec::new();
        for disk in disks.iter().rev() {
            if let Err(e) = self.backend.reparent(disk, old_parent).await {
                tracing::error!(
                    vm = %self.vm_name,
                    disk = %disk,
                    parent = %old_parent,
                    error = %e,
                    "failed to restore disk parent"
                );
                stranded.push(disk.to_string());
            }
        }
        if stranded.is_empty() {
            return Ok(());
        }
        Err(Error::corrupt(
            self.store.path(),
            format!(
                "{} no longer backed by recorded parent {}",
                stranded.join(", "),
                old_parent
            ),
        ))
    }

    /// Make the named snapshot the head, discarding the live disk.
    pub async fn apply(&mut self, name: &str, state: VmState) -> Result<SnapshotRecord> {
        let node = self.find(name)?.clone();
        if !state.is_quiescent() {
            return Err(Error::InvalidStateForSnapshot {
                vm: self.vm_name.clone(),
                state: state.to_string(),
            });
        }

        let backend = self.backend.as_ref();
        let live = self.live_disk();
        node.apply(backend, &live).await?;

        let mut next = self.state.clone();
        next.head = Some(node.index());

        if let Err(e) = self.store.save(&next.to_file()) {
            // Keep the live disk consistent with the head still on file.
            let old_parent = self.layout.disk_or_base(self.head_index());
            let relinked = match backend.remove(&live).await {
                Ok(()) => backend.create_child_disk(&old_parent, &live).await,
                Err(e) => Err(e),
            };
            if let Err(relink) = relinked {
                tracing::error!(vm = %self.vm_name, disk = %live, error = %relink, "failed to recreate live disk");
            }
            return Err(e);
        }
        self.state = next;

        tracing::info!(vm = %self.vm_name, snapshot = %name, index = node.index(), "applied snapshot");
        Ok(node.record().clone())
    }

    /// Rename a snapshot.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let index = self.find(old)?.index();
        if old == new {
            return Ok(());
        }
        validate_snapshot_name(new)?;
        if self.state.names.contains_key(new) {
            return Err(Error::DuplicateSnapshotName {
                vm: self.vm_name.clone(),
                name: new.to_string(),
            });
        }

        let mut next = self.state.clone();
        next.names.remove(old);
        next.names.insert(new.to_string(), index);
        if let Some(node) = next.nodes.get_mut(&index) {
            node.record_mut().set_name(new);
        }
        self.store.save(&next.to_file())?;
        self.state = next;

        tracing::info!(vm = %self.vm_name, from = %old, to = %new, "renamed snapshot");
        Ok(())
    }

    /// Replace a snapshot's comment.
    pub fn set_comment(&mut self, name: &str, comment: &str) -> Result<()> {
        let index = self.find(name)?.index();
        let mut next = self.state.clone();
        if let Some(node) = next.nodes.get_mut(&index) {
            node.record_mut().set_comment(comment);
        }
        self.store.save(&next.to_file())?;
        self.state = next;
        Ok(())
    }

    /// Disk to boot from, creating the live disk on top of the head if needed.
    pub async fn boot_disk(&self) -> Result<DiskHandle> {
        let live = self.live_disk();
        if self.backend.exists(&live).await? {
            return Ok(live);
        }
        match self.state.head {
            Some(head) => {
                self.backend
                    .create_child_disk(&self.layout.disk(head), &live)
                    .await?;
                Ok(live)
            }
            None => Ok(self.layout.base().clone()),
        }
    }

    /// Check that every disk's actual parent matches the recorded one.
    pub async fn verify(&self) -> Result<()> {
        let path = self.store.path();
        let mut expected: Vec<(DiskHandle, DiskHandle)> = self
            .state
            .nodes
            .values()
            .map(|n| (n.disk().clone(), self.layout.disk_or_base(n.parent_index())))
            .collect();
        let live = self.live_disk();
        if self.backend.exists(&live).await? {
            expected.push((live, self.layout.disk_or_base(self.head_index())));
        }

        for (disk, parent) in expected {
            let chain = self.backend.list_chain(&disk).await?;
            match chain.get(1) {
                Some(actual) if *actual == parent => {}
                actual => {
                    return Err(Error::corrupt(
                        &path,
                        format!(
                            "disk {} is backed by {} but {} is recorded",
                            disk,
                            actual.map(|d| d.to_string()).unwrap_or_else(|| "nothing".into()),
                            parent
                        ),
                    ))
                }
            }
        }
        Ok(())
    }
}
