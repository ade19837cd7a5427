// Copyright (c) MerkleDB Contributors
// SPDX-License-Identifier: Apache-2.0

//! The incremental Merkle engine and its write-back caches.
//!
//! The tree grows one leaf at a time with the hanging-node construction: a
//! node without a sibling "hangs" at its level until the next arrival pairs
//! with it. Every mutation funnels through [`TreeInner::update_node_hash`],
//! which replaces a node's identity wherever it appears (cache, hanging
//! registry, neighbor edges) and records the stale row for deletion at the
//! next flush.
//!
//! All methods expect the owning facade to hold the tree's lock in the
//! appropriate mode.

use crate::error::{Result, TreeError};
use crate::hash::{leaf_hash, H256};
use crate::node::Node;
use crate::tree_store::{StoredMetadata, TreeStore, KEYDATA_CF_NAME, NODES_CF_NAME};
use merkle_store::{RocksdbConfig, WriteBatch};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// In-memory state of one open tree.
pub(crate) struct TreeInner {
    name: String,
    path: PathBuf,
    rocksdb_config: RocksdbConfig,
    /// `None` while the tree is dormant (storage handles released).
    store: Option<TreeStore>,
    /// Write-back node cache; holds every node read or mutated since the
    /// last flush.
    node_cache: HashMap<H256, Node>,
    /// Unpaired node per level; the deepest entry is the root.
    hanging: BTreeMap<u32, H256>,
    /// Pending `key → value` records not yet flushed.
    key_data_cache: HashMap<Vec<u8>, Vec<u8>>,
    num_leaves: u32,
    depth: u32,
    root_hash: Option<H256>,
    has_unsaved_changes: bool,
    closed: bool,
}

impl TreeInner {
    pub fn open(name: String, path: PathBuf, rocksdb_config: RocksdbConfig) -> Result<Self> {
        let store = TreeStore::open(&path, &rocksdb_config)?;
        let StoredMetadata {
            root_hash,
            num_leaves,
            depth,
            hanging,
        } = store.load_metadata()?;
        tracing::debug!(name = %name, num_leaves, depth, "opened tree");
        Ok(Self {
            name,
            path,
            rocksdb_config,
            store: Some(store),
            node_cache: HashMap::new(),
            hanging,
            key_data_cache: HashMap::new(),
            num_leaves,
            depth,
            root_hash,
            has_unsaved_changes: false,
            closed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub fn num_leaves(&self) -> u32 {
        self.num_leaves
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn root_hash(&self) -> Option<H256> {
        self.root_hash
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.has_unsaved_changes
    }

    pub fn cached_node_count(&self) -> usize {
        self.node_cache.len()
    }

    pub fn cached_key_data_count(&self) -> usize {
        self.key_data_cache.len()
    }

    pub fn hanging_level_count(&self) -> usize {
        self.hanging.len()
    }

    pub fn storage_open(&self) -> bool {
        self.store.is_some()
    }

    /// Reopens the storage handles of a dormant tree.
    pub fn ensure_open(&mut self) -> Result<()> {
        if self.store.is_none() {
            tracing::debug!(name = %self.name, "reopening dormant storage handles");
            self.store = Some(TreeStore::open(&self.path, &self.rocksdb_config)?);
        }
        Ok(())
    }

    pub fn release_storage(&mut self) {
        self.store = None;
    }

    fn store(&self) -> &TreeStore {
        self.store
            .as_ref()
            .expect("storage handles must be open; callers go through ensure_open")
    }

    // ---------- key data ----------

    pub fn get_data(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.key_data_cache.get(key) {
            return Ok(Some(value.clone()));
        }
        self.ensure_open()?;
        self.store().get_key_data(key)
    }

    pub fn contains_key(&mut self, key: &[u8]) -> Result<bool> {
        Ok(self.get_data(key)?.is_some())
    }

    /// Persisted rows overlaid with the pending cache, in key order.
    pub fn collect_key_data(&mut self) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        self.ensure_open()?;
        let mut entries = self.store().collect_key_data()?;
        for (key, value) in &self.key_data_cache {
            entries.insert(key.clone(), value.clone());
        }
        Ok(entries)
    }

    /// Records `key → value`, inserting a new leaf or updating the existing
    /// one. Re-inserting an identical record is a no-op.
    pub fn add_or_update_data(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(TreeError::InvalidArgument("key must not be empty".into()));
        }
        let existing = self.get_data(key)?;
        let new_leaf_hash = leaf_hash(key, value);
        if let Some(existing) = existing {
            let old_leaf_hash = leaf_hash(key, &existing);
            if old_leaf_hash == new_leaf_hash {
                return Ok(());
            }
            self.key_data_cache.insert(key.to_vec(), value.to_vec());
            self.has_unsaved_changes = true;
            self.update_leaf(old_leaf_hash, new_leaf_hash)
        } else {
            self.key_data_cache.insert(key.to_vec(), value.to_vec());
            self.has_unsaved_changes = true;
            self.add_leaf(new_leaf_hash)
        }
    }

    // ---------- node access ----------

    fn get_node(&mut self, hash: H256) -> Result<Option<Node>> {
        if let Some(node) = self.node_cache.get(&hash) {
            return Ok(Some(node.clone()));
        }
        self.ensure_open()?;
        match self.store().get_node(hash)? {
            Some(node) => {
                self.node_cache.insert(hash, node.clone());
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    fn expect_node(&mut self, hash: H256) -> Result<Node> {
        self.get_node(hash)?.ok_or_else(|| {
            TreeError::CorruptedTree(format!("node {hash:#x} is absent from cache and storage"))
        })
    }

    fn put_node(&mut self, node: Node) {
        self.node_cache.insert(node.hash(), node);
    }

    fn set_parent(&mut self, child_hash: H256, parent_hash: H256) -> Result<()> {
        let mut child = self.expect_node(child_hash)?;
        child.touch();
        child.parent = Some(parent_hash);
        self.put_node(child);
        Ok(())
    }

    // ---------- structural inserts ----------

    /// Grows the tree by one leaf.
    fn add_leaf(&mut self, leaf_hash: H256) -> Result<()> {
        if self.num_leaves == 0 {
            self.put_node(Node::new_leaf(leaf_hash));
            self.hanging.insert(0, leaf_hash);
            self.root_hash = Some(leaf_hash);
            self.num_leaves = 1;
            return Ok(());
        }

        match self.hanging.get(&0).copied() {
            None => {
                // The leaf plane is even; this leaf hangs and gets a
                // single-child parent pushed one level up.
                let parent = Node::new_internal(leaf_hash, None);
                let parent_hash = parent.hash();
                let mut leaf = Node::new_leaf(leaf_hash);
                leaf.parent = Some(parent_hash);
                self.put_node(leaf);
                self.put_node(parent);
                self.hanging.insert(0, leaf_hash);
                self.add_node(1, parent_hash)?;
            }
            Some(hanging_hash) => {
                let hanging_node = self.expect_node(hanging_hash)?;
                self.hanging.remove(&0);
                match hanging_node.parent() {
                    None => {
                        // The hanging leaf is the root; pair the two leaves
                        // under a fresh parent.
                        let parent = Node::new_internal(hanging_hash, Some(leaf_hash));
                        let parent_hash = parent.hash();
                        self.set_parent(hanging_hash, parent_hash)?;
                        let mut leaf = Node::new_leaf(leaf_hash);
                        leaf.parent = Some(parent_hash);
                        self.put_node(leaf);
                        self.put_node(parent);
                        self.add_node(1, parent_hash)?;
                    }
                    Some(parent_hash) => {
                        let mut leaf = Node::new_leaf(leaf_hash);
                        leaf.parent = Some(parent_hash);
                        self.put_node(leaf);
                        self.adopt_child(parent_hash, leaf_hash)?;
                    }
                }
            }
        }
        self.num_leaves += 1;
        Ok(())
    }

    /// Hangs `node_hash` at `level`, pairing it with the level's hanging
    /// node when one exists and recursing upward otherwise.
    fn add_node(&mut self, level: u32, node_hash: H256) -> Result<()> {
        match self.hanging.get(&level).copied() {
            None => {
                self.hanging.insert(level, node_hash);
                if level >= self.depth {
                    self.depth = level;
                    self.root_hash = Some(node_hash);
                } else {
                    let parent = Node::new_internal(node_hash, None);
                    let parent_hash = parent.hash();
                    self.set_parent(node_hash, parent_hash)?;
                    self.put_node(parent);
                    self.add_node(level + 1, parent_hash)?;
                }
            }
            Some(hanging_hash) => {
                let hanging_node = self.expect_node(hanging_hash)?;
                self.hanging.remove(&level);
                match hanging_node.parent() {
                    None => {
                        let parent = Node::new_internal(hanging_hash, Some(node_hash));
                        let parent_hash = parent.hash();
                        self.set_parent(hanging_hash, parent_hash)?;
                        self.set_parent(node_hash, parent_hash)?;
                        self.put_node(parent);
                        self.add_node(level + 1, parent_hash)?;
                    }
                    Some(parent_hash) => {
                        // The hash change of the adopting parent propagates
                        // on its own; no recursion here.
                        self.set_parent(node_hash, parent_hash)?;
                        self.adopt_child(parent_hash, node_hash)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Fills the missing child slot of `parent_hash` and propagates the
    /// resulting hash change.
    fn adopt_child(&mut self, parent_hash: H256, child_hash: H256) -> Result<()> {
        let mut parent = self.expect_node(parent_hash)?;
        if !parent.adopt_child(child_hash) {
            return Err(TreeError::NodeFull(parent_hash));
        }
        let new_hash = parent.computed_hash();
        self.put_node(parent);
        self.update_node_hash(parent_hash, new_hash)
    }

    // ---------- hash propagation ----------

    /// Replaces a node's identity everywhere it appears and propagates the
    /// change to the root.
    fn update_node_hash(&mut self, old_hash: H256, new_hash: H256) -> Result<()> {
        let mut node = match self.node_cache.remove(&old_hash) {
            Some(node) => node,
            None => {
                self.ensure_open()?;
                self.store().get_node(old_hash)?.ok_or_else(|| {
                    TreeError::CorruptedTree(format!(
                        "node {old_hash:#x} is absent from cache and storage"
                    ))
                })?
            }
        };
        if node.pending_old_hash.is_none() {
            node.pending_old_hash = Some(old_hash);
        }
        node.hash = new_hash;

        if let Some(level) = self
            .hanging
            .iter()
            .find_map(|(level, hash)| (*hash == old_hash).then_some(*level))
        {
            self.hanging.insert(level, new_hash);
        }

        let parent = node.parent();
        let children: Vec<H256> = [node.left(), node.right()].into_iter().flatten().collect();
        let is_leaf = node.is_leaf();
        self.put_node(node);

        match parent {
            None => {
                self.root_hash = Some(new_hash);
                for child in children {
                    self.set_parent(child, new_hash)?;
                }
            }
            Some(parent_hash) => {
                if !is_leaf {
                    for child in children {
                        self.set_parent(child, new_hash)?;
                    }
                }
                let mut parent_node = self.expect_node(parent_hash)?;
                if !parent_node.replace_child(old_hash, new_hash) {
                    return Err(TreeError::CorruptedTree(format!(
                        "parent {parent_hash:#x} does not reference child {old_hash:#x}"
                    )));
                }
                let parent_new_hash = parent_node.computed_hash();
                self.put_node(parent_node);
                self.update_node_hash(parent_hash, parent_new_hash)?;
            }
        }
        Ok(())
    }

    /// Re-keys the leaf currently stored under `old_leaf_hash`.
    fn update_leaf(&mut self, old_leaf_hash: H256, new_leaf_hash: H256) -> Result<()> {
        if old_leaf_hash == new_leaf_hash {
            return Err(TreeError::InvalidArgument(
                "old and new leaf hashes are identical".into(),
            ));
        }
        let exists = self.get_node(old_leaf_hash)?.is_some();
        if !exists {
            return Err(TreeError::LeafNotFound(old_leaf_hash));
        }
        self.update_node_hash(old_leaf_hash, new_leaf_hash)
    }

    // ---------- persistence ----------

    /// Writes all pending state in one durable batch, then drops the
    /// caches. With `release_storage` the handles are closed afterwards.
    pub fn flush_to_disk(&mut self, release_storage: bool) -> Result<()> {
        if !self.has_unsaved_changes {
            if release_storage {
                self.release_storage();
            }
            return Ok(());
        }
        self.ensure_open()?;

        let mut batch = WriteBatch::new();
        self.store().stage_metadata(
            &mut batch,
            self.root_hash,
            self.num_leaves,
            self.depth,
            &self.hanging,
        );
        for node in self.node_cache.values() {
            if let Some(old_hash) = node.pending_old_hash {
                // A node whose hash ended up unchanged must not delete the
                // row it is about to rewrite.
                if old_hash != node.hash() {
                    batch.delete(NODES_CF_NAME, old_hash.as_bytes().to_vec());
                }
            }
        }
        for (hash, node) in &self.node_cache {
            batch.put(NODES_CF_NAME, hash.as_bytes().to_vec(), node.encode());
        }
        for (key, value) in &self.key_data_cache {
            batch.put(KEYDATA_CF_NAME, key.clone(), value.clone());
        }
        tracing::debug!(
            name = %self.name,
            rows = batch.len(),
            nodes = self.node_cache.len(),
            "flushing tree to disk"
        );
        self.store().write_batch(batch, true)?;

        self.node_cache.clear();
        self.key_data_cache.clear();
        self.has_unsaved_changes = false;
        if release_storage {
            self.release_storage();
        }
        Ok(())
    }

    /// Drops all unsaved state and reloads the persisted metadata.
    pub fn revert_unsaved_changes(&mut self) -> Result<()> {
        if !self.has_unsaved_changes {
            return Ok(());
        }
        self.node_cache.clear();
        self.hanging.clear();
        self.key_data_cache.clear();
        self.load_metadata()?;
        self.has_unsaved_changes = false;
        Ok(())
    }

    pub fn load_metadata(&mut self) -> Result<()> {
        self.ensure_open()?;
        let StoredMetadata {
            root_hash,
            num_leaves,
            depth,
            hanging,
        } = self.store().load_metadata()?;
        self.root_hash = root_hash;
        self.num_leaves = num_leaves;
        self.depth = depth;
        self.hanging = hanging;
        Ok(())
    }

    /// Deletes every persisted row and zeroes the in-memory state.
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.store().clear()?;
        self.node_cache.clear();
        self.hanging.clear();
        self.key_data_cache.clear();
        self.num_leaves = 0;
        self.depth = 0;
        self.root_hash = None;
        self.has_unsaved_changes = false;
        Ok(())
    }

    pub fn root_hash_saved_on_disk(&mut self) -> Result<Option<H256>> {
        self.ensure_open()?;
        self.store().get_root_hash()
    }

    /// Every persisted node; callers flush first so the cache is empty.
    pub fn collect_nodes(&mut self) -> Result<Vec<Node>> {
        self.ensure_open()?;
        self.store().collect_nodes()
    }

    pub fn checkpoint(&mut self, target: &std::path::Path) -> Result<()> {
        self.ensure_open()?;
        self.store().checkpoint(target)
    }

    /// Mirrors `source`'s in-memory state; both trees must already share
    /// identical persisted state.
    pub fn copy_in_memory_state_from(&mut self, source: &TreeInner) {
        self.node_cache = source.node_cache.clone();
        self.hanging = source.hanging.clone();
        self.key_data_cache = source.key_data_cache.clone();
        self.num_leaves = source.num_leaves;
        self.depth = source.depth;
        self.root_hash = source.root_hash;
        self.has_unsaved_changes = source.has_unsaved_changes;
    }

    /// Discards all local state and caches after the directory was replaced
    /// by a checkpoint of another tree.
    pub fn reload_from_checkpoint(&mut self) -> Result<()> {
        self.store = Some(TreeStore::open(&self.path, &self.rocksdb_config)?);
        self.node_cache.clear();
        self.hanging.clear();
        self.key_data_cache.clear();
        self.load_metadata()?;
        self.has_unsaved_changes = false;
        Ok(())
    }
}
