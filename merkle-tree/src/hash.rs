// Copyright (c) MerkleDB Contributors
// SPDX-License-Identifier: Apache-2.0

use sha3::{Digest, Sha3_256};

pub use primitive_types::H256;

pub const HASH_LENGTH: usize = 32;

/// SHA3-256 of a single byte string.
pub fn sha3_256_of(buffer: &[u8]) -> H256 {
    let mut hasher = Sha3_256::new();
    hasher.update(buffer);
    H256::from_slice(hasher.finalize().as_slice())
}

/// The tree's two-argument digest `H(a, b)`: SHA3-256 over `a || b`.
///
/// Both leaf hashes (`H(key, value)`) and internal-node hashes
/// (`H(left, right)`) go through this function, so a two-leaf tree's root
/// equals `hash_pair(leaf_1, leaf_2)`.
pub fn hash_pair(a: &[u8], b: &[u8]) -> H256 {
    let mut hasher = Sha3_256::new();
    hasher.update(a);
    hasher.update(b);
    H256::from_slice(hasher.finalize().as_slice())
}

/// Leaf hash of one `(key, value)` record.
pub fn leaf_hash(key: &[u8], value: &[u8]) -> H256 {
    hash_pair(key, value)
}

/// Internal-node hash with single-child duplication: a missing slot is
/// stood in for by the present child.
pub fn internal_hash(left: Option<H256>, right: Option<H256>) -> H256 {
    let l = left.or(right).expect("internal node must have a child");
    let r = right.or(left).expect("internal node must have a child");
    hash_pair(l.as_bytes(), r.as_bytes())
}
