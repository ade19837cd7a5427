// Copyright (c) MerkleDB Contributors
// SPDX-License-Identifier: Apache-2.0

//! Public facade over one persistent keyed Merkle tree.
//!
//! Every operation acquires the tree's [`PriorityRwLock`] in the appropriate
//! mode before touching state: shared for reads, exclusive for mutations,
//! with lifecycle operations requesting [`Priority::High`]. The facade also
//! enforces the open/dormant/closed lifecycle and the one-open-instance-per-
//! name process invariant.

use crate::error::{Result, TreeError};
use crate::hash::H256;
use crate::lock::{Priority, PriorityRwLock, DEFAULT_UNHEALTHY_WAIT};
use crate::node::Node;
use crate::registry;
use crate::tree::TreeInner;
use merkle_store::RocksdbConfig;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_BASE_DIR: &str = "merkle";

/// Settings for opening a tree.
#[derive(Clone, Debug)]
pub struct TreeConfig {
    /// Directory under which each tree gets its own subdirectory.
    pub base_dir: PathBuf,
    pub rocksdb: RocksdbConfig,
    /// Lock waits longer than this are reported through `tracing`.
    pub unhealthy_lock_wait: Duration,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(DEFAULT_BASE_DIR),
            rocksdb: RocksdbConfig::default(),
            unhealthy_lock_wait: DEFAULT_UNHEALTHY_WAIT,
        }
    }
}

/// Point-in-time memory diagnostics of one tree.
#[derive(Clone, Debug, serde::Serialize)]
pub struct RamInfo {
    pub name: String,
    pub cached_nodes: usize,
    pub cached_key_data: usize,
    pub hanging_levels: usize,
    pub num_leaves: u32,
    pub depth: u32,
    pub root_hash: Option<String>,
    pub has_unsaved_changes: bool,
    pub storage_open: bool,
}

/// A persistent Merkle tree keyed by arbitrary byte strings.
///
/// Instances are process-unique per name and shared via `Arc`; all methods
/// take `&self` and serialize through the internal lock.
pub struct MerkleTree {
    name: String,
    config: TreeConfig,
    lock: PriorityRwLock,
    inner: Mutex<TreeInner>,
}

impl MerkleTree {
    /// Opens (creating if missing) the tree named `name` under the default
    /// configuration.
    pub fn open(name: &str) -> Result<Arc<Self>> {
        Self::open_with_config(name, TreeConfig::default())
    }

    pub fn open_with_config(name: &str, config: TreeConfig) -> Result<Arc<Self>> {
        if name.is_empty() {
            return Err(TreeError::InvalidArgument(
                "tree name must not be empty".into(),
            ));
        }
        if registry::open_tree(name).is_some() {
            return Err(TreeError::DuplicateInstance(name.to_string()));
        }
        let path = config.base_dir.join(name);
        std::fs::create_dir_all(&path)?;
        let inner = TreeInner::open(name.to_string(), path, config.rocksdb.clone())?;
        let tree = Arc::new(Self {
            name: name.to_string(),
            lock: PriorityRwLock::new(config.unhealthy_lock_wait),
            config,
            inner: Mutex::new(inner),
        });
        registry::register(&tree)?;
        Ok(tree)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ---------- reads ----------

    pub fn root_hash(&self) -> Result<Option<H256>> {
        self.read(Priority::Medium, |inner| Ok(inner.root_hash()))
    }

    /// The root hash as currently persisted, ignoring unsaved changes.
    pub fn root_hash_saved_on_disk(&self) -> Result<Option<H256>> {
        self.read(Priority::Medium, |inner| inner.root_hash_saved_on_disk())
    }

    pub fn num_leaves(&self) -> Result<u32> {
        self.read(Priority::Medium, |inner| Ok(inner.num_leaves()))
    }

    pub fn depth(&self) -> Result<u32> {
        self.read(Priority::Medium, |inner| Ok(inner.depth()))
    }

    pub fn get_data(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.read(Priority::Medium, |inner| inner.get_data(key))
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        self.read(Priority::Medium, |inner| inner.contains_key(key))
    }

    pub fn get_all_keys(&self) -> Result<Vec<Vec<u8>>> {
        self.read(Priority::Medium, |inner| {
            Ok(inner.collect_key_data()?.into_keys().collect())
        })
    }

    pub fn get_all_data(&self) -> Result<Vec<Vec<u8>>> {
        self.read(Priority::Medium, |inner| {
            Ok(inner.collect_key_data()?.into_values().collect())
        })
    }

    /// All records as parallel key/value vectors, in key order.
    pub fn keys_and_values(&self) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
        self.read(Priority::Medium, |inner| {
            Ok(inner.collect_key_data()?.into_iter().unzip())
        })
    }

    /// Memory diagnostics for this instance.
    pub fn ram_info(&self) -> Result<RamInfo> {
        self.read(Priority::Medium, |inner| {
            Ok(RamInfo {
                name: inner.name().to_string(),
                cached_nodes: inner.cached_node_count(),
                cached_key_data: inner.cached_key_data_count(),
                hanging_levels: inner.hanging_level_count(),
                num_leaves: inner.num_leaves(),
                depth: inner.depth(),
                root_hash: inner.root_hash().map(|h| hex::encode(h.as_bytes())),
                has_unsaved_changes: inner.has_unsaved_changes(),
                storage_open: inner.storage_open(),
            })
        })
    }

    // ---------- mutations ----------

    /// Inserts or updates one record. Re-inserting the identical record
    /// leaves the root hash untouched.
    pub fn add_or_update_data(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(Priority::Medium, |inner| {
            inner.add_or_update_data(key, value)
        })
    }

    /// Discards all unsaved changes and reloads the persisted state.
    pub fn revert_unsaved_changes(&self) -> Result<()> {
        self.write(Priority::Medium, |inner| inner.revert_unsaved_changes())
    }

    /// Persists all pending state in one durable batch. With
    /// `release_storage` the tree goes dormant afterwards; the next
    /// storage-touching operation reopens the handles.
    pub fn flush_to_disk(&self, release_storage: bool) -> Result<()> {
        self.write(Priority::High, |inner| {
            inner.flush_to_disk(release_storage)
        })
    }

    /// Deletes every record and node; the tree stays open and empty.
    pub fn clear(&self) -> Result<()> {
        self.write(Priority::High, |inner| inner.clear())
    }

    /// Every persisted node. Flushes first, so the returned set is the
    /// complete tree.
    pub fn all_nodes(&self) -> Result<HashSet<Node>> {
        self.write(Priority::Medium, |inner| {
            inner.flush_to_disk(false)?;
            Ok(inner.collect_nodes()?.into_iter().collect())
        })
    }

    // ---------- lifecycle ----------

    /// Materializes a flushed copy of this tree under `new_name` and opens
    /// it. An instance already open under that name is closed first.
    pub fn clone_tree(&self, new_name: &str) -> Result<Arc<MerkleTree>> {
        if new_name.is_empty() {
            return Err(TreeError::InvalidArgument(
                "tree name must not be empty".into(),
            ));
        }
        if new_name == self.name {
            return Err(TreeError::InvalidArgument(
                "cannot clone a tree onto itself".into(),
            ));
        }
        {
            let _guard = self.lock.write(Priority::High)?;
            let mut inner = self.inner.lock();
            self.ensure_not_closed(&inner)?;
            inner.flush_to_disk(false)?;

            if let Some(existing) = registry::open_tree(new_name) {
                existing.close()?;
            }
            let target = self.config.base_dir.join(new_name);
            if target.exists() {
                std::fs::remove_dir_all(&target)?;
            }
            inner.checkpoint(&target)?;
        }
        Self::open_with_config(new_name, self.config.clone())
    }

    /// Resynchronizes this tree to mirror `source`.
    ///
    /// When both trees already share the same persisted root, only the
    /// in-memory caches are copied. Otherwise this tree's directory is
    /// replaced by a checkpoint of the flushed source and reloaded. Callers
    /// synchronizing trees from multiple threads must keep a consistent
    /// source/target order to avoid lock cycles.
    pub fn update_from(&self, source: &MerkleTree) -> Result<()> {
        if std::ptr::eq(self, source) || source.name == self.name {
            return Err(TreeError::InvalidArgument(
                "cannot update a tree from itself".into(),
            ));
        }
        let _guard = self.lock.write(Priority::High)?;
        let _source_guard = source.lock.write(Priority::High)?;
        let mut inner = self.inner.lock();
        self.ensure_not_closed(&inner)?;
        let mut source_inner = source.inner.lock();
        source.ensure_not_closed(&source_inner)?;

        let my_disk_root = inner.root_hash_saved_on_disk()?;
        let source_disk_root = source_inner.root_hash_saved_on_disk()?;
        if my_disk_root == source_disk_root {
            // Already a persistent copy; mirroring the caches suffices.
            inner.copy_in_memory_state_from(&source_inner);
            return Ok(());
        }

        inner.release_storage();
        source_inner.flush_to_disk(false)?;
        let path = inner.path().clone();
        std::fs::remove_dir_all(&path)?;
        source_inner.checkpoint(&path)?;
        inner.reload_from_checkpoint()
    }

    /// Flushes, releases storage and unregisters this instance. Idempotent;
    /// every later operation fails with `TreeClosed`.
    pub fn close(&self) -> Result<()> {
        let _guard = self.lock.write(Priority::High)?;
        let mut inner = self.inner.lock();
        if inner.is_closed() {
            return Ok(());
        }
        inner.flush_to_disk(true)?;
        inner.mark_closed();
        registry::unregister(&self.name);
        tracing::debug!(name = %self.name, "closed tree");
        Ok(())
    }

    // ---------- plumbing ----------

    fn read<R>(&self, priority: Priority, f: impl FnOnce(&mut TreeInner) -> Result<R>) -> Result<R> {
        let _guard = self.lock.read(priority)?;
        let mut inner = self.inner.lock();
        self.ensure_not_closed(&inner)?;
        f(&mut inner)
    }

    fn write<R>(
        &self,
        priority: Priority,
        f: impl FnOnce(&mut TreeInner) -> Result<R>,
    ) -> Result<R> {
        let _guard = self.lock.write(priority)?;
        let mut inner = self.inner.lock();
        self.ensure_not_closed(&inner)?;
        f(&mut inner)
    }

    fn ensure_not_closed(&self, inner: &TreeInner) -> Result<()> {
        if inner.is_closed() {
            return Err(TreeError::TreeClosed(self.name.clone()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for MerkleTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MerkleTree")
            .field("name", &self.name)
            .field("base_dir", &self.config.base_dir)
            .finish()
    }
}
