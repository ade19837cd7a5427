// Copyright (c) MerkleDB Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::hash::H256;
use crate::lock::LockError;
use crate::node::NodeDecodeError;
use merkle_store::StoreError;

pub type Result<T, E = TreeError> = std::result::Result<T, E>;

/// Errors surfaced by the tree's public API.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    /// A caller-supplied argument is unusable: empty tree name, empty key,
    /// or an update where the old and new leaf hashes coincide.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The instance was closed; no further operations are accepted.
    #[error("tree {0} is closed")]
    TreeClosed(String),

    /// A tree with this name is already open in the process.
    #[error("tree {0} is already open in this process")]
    DuplicateInstance(String),

    /// `update_leaf` addressed a leaf hash with no node behind it.
    #[error("leaf {0:#x} not found")]
    LeafNotFound(H256),

    /// An internal node was asked to adopt a child while both slots are
    /// occupied.
    #[error("node {0:#x} already has two children")]
    NodeFull(H256),

    /// A stored node row failed to decode.
    #[error("corrupted node: {0}")]
    CorruptedNode(#[from] NodeDecodeError),

    /// Persisted metadata references state that is absent from storage;
    /// fatal for the instance.
    #[error("corrupted tree: {0}")]
    CorruptedTree(String),

    /// A lock release or upgrade that the lock contract forbids.
    #[error("lock misuse: {0}")]
    LockMisuse(#[from] LockError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
