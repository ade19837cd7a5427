// Copyright (c) MerkleDB Contributors
// SPDX-License-Identifier: Apache-2.0

//! Process-wide registry of open trees.
//!
//! At most one open instance may exist per tree name. The registry holds
//! strong references; `close` removes them, and [`close_all_open_trees`]
//! is the shutdown hook for embedding processes.

use crate::error::{Result, TreeError};
use crate::merkle_tree::MerkleTree;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

static OPEN_TREES: Lazy<Mutex<HashMap<String, Arc<MerkleTree>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Registers a freshly opened tree; fails when the name is taken.
pub(crate) fn register(tree: &Arc<MerkleTree>) -> Result<()> {
    let mut trees = OPEN_TREES.lock();
    let name = tree.name().to_string();
    if trees.contains_key(&name) {
        return Err(TreeError::DuplicateInstance(name));
    }
    trees.insert(name, tree.clone());
    Ok(())
}

pub(crate) fn unregister(name: &str) {
    OPEN_TREES.lock().remove(name);
}

/// The open instance registered under `name`, if any.
pub fn open_tree(name: &str) -> Option<Arc<MerkleTree>> {
    OPEN_TREES.lock().get(name).cloned()
}

/// Closes every open tree. Intended for process shutdown; failures are
/// logged and do not stop the sweep.
pub fn close_all_open_trees() {
    let trees: Vec<Arc<MerkleTree>> = OPEN_TREES.lock().values().cloned().collect();
    for tree in trees {
        if let Err(error) = tree.close() {
            tracing::warn!(name = tree.name(), %error, "failed to close tree at shutdown");
        }
    }
}
