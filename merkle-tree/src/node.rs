// Copyright (c) MerkleDB Contributors
// SPDX-License-Identifier: Apache-2.0

//! The structural unit of the tree and its on-disk codec.
//!
//! A node row is laid out as
//! `[hash:32][flag_left:1][flag_right:1][flag_parent:1]` followed by the
//! 32-byte hashes whose flags are set, in that order. Flags are strictly
//! `0` or `1`; anything else, or a length that disagrees with the flags,
//! fails decoding.

use crate::hash::{internal_hash, H256, HASH_LENGTH};
use byteorder::ReadBytesExt;
use std::io::{Cursor, Read};

const FLAG_COUNT: usize = 3;
const MIN_ENCODED_LEN: usize = HASH_LENGTH + FLAG_COUNT;

/// One tree node, addressed by its content hash.
///
/// `pending_old_hash` is transient bookkeeping: the hash under which this
/// node is still persisted, recorded on the first mutation after load so the
/// stale row can be deleted at the next flush. It is never encoded.
#[derive(Clone, Debug)]
pub struct Node {
    pub(crate) hash: H256,
    pub(crate) left: Option<H256>,
    pub(crate) right: Option<H256>,
    pub(crate) parent: Option<H256>,
    pub(crate) pending_old_hash: Option<H256>,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        // Transient bookkeeping does not participate in node identity.
        self.hash == other.hash
            && self.left == other.left
            && self.right == other.right
            && self.parent == other.parent
    }
}

impl Eq for Node {}

impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl Node {
    pub fn new_leaf(hash: H256) -> Self {
        Self {
            hash,
            left: None,
            right: None,
            parent: None,
            pending_old_hash: None,
        }
    }

    /// A fresh internal node over the given children; the hash is derived
    /// with single-child duplication when `right` is absent.
    pub fn new_internal(left: H256, right: Option<H256>) -> Self {
        Self {
            hash: internal_hash(Some(left), right),
            left: Some(left),
            right,
            parent: None,
            pending_old_hash: None,
        }
    }

    pub fn hash(&self) -> H256 {
        self.hash
    }

    pub fn left(&self) -> Option<H256> {
        self.left
    }

    pub fn right(&self) -> Option<H256> {
        self.right
    }

    pub fn parent(&self) -> Option<H256> {
        self.parent
    }

    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }

    /// The hash this node's children currently imply. Only meaningful for
    /// internal nodes.
    pub(crate) fn computed_hash(&self) -> H256 {
        internal_hash(self.left, self.right)
    }

    /// Records the persisted identity before the first mutation after load.
    pub(crate) fn touch(&mut self) {
        if self.pending_old_hash.is_none() {
            self.pending_old_hash = Some(self.hash);
        }
    }

    /// Fills the missing child slot with `child`, left slot first. Returns
    /// `false` when both slots are already occupied.
    pub(crate) fn adopt_child(&mut self, child: H256) -> bool {
        if self.left.is_none() {
            self.touch();
            self.left = Some(child);
            true
        } else if self.right.is_none() {
            self.touch();
            self.right = Some(child);
            true
        } else {
            false
        }
    }

    /// Rewrites the child slot currently holding `old` to `new`. Returns
    /// `false` when neither slot holds `old`.
    pub(crate) fn replace_child(&mut self, old: H256, new: H256) -> bool {
        if self.left == Some(old) {
            self.touch();
            self.left = Some(new);
            true
        } else if self.right == Some(old) {
            self.touch();
            self.right = Some(new);
            true
        } else {
            false
        }
    }

    /// Serializes to bytes for physical storage.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            MIN_ENCODED_LEN
                + HASH_LENGTH
                    * (self.left.is_some() as usize
                        + self.right.is_some() as usize
                        + self.parent.is_some() as usize),
        );
        out.extend_from_slice(self.hash.as_bytes());
        out.push(self.left.is_some() as u8);
        out.push(self.right.is_some() as u8);
        out.push(self.parent.is_some() as u8);
        for slot in [self.left, self.right, self.parent].into_iter().flatten() {
            out.extend_from_slice(slot.as_bytes());
        }
        out
    }

    /// Recovers from serialized bytes in physical storage.
    pub fn decode(data: &[u8]) -> Result<Self, NodeDecodeError> {
        if data.len() < MIN_ENCODED_LEN {
            return Err(NodeDecodeError::Truncated { actual: data.len() });
        }
        let mut reader = Cursor::new(data);
        let hash = read_hash(&mut reader)?;
        let mut flags = [false; FLAG_COUNT];
        for flag in flags.iter_mut() {
            *flag = match reader.read_u8().map_err(|_| NodeDecodeError::Truncated {
                actual: data.len(),
            })? {
                0 => false,
                1 => true,
                other => return Err(NodeDecodeError::InvalidFlag { flag: other }),
            };
        }
        let expected = MIN_ENCODED_LEN + HASH_LENGTH * flags.iter().filter(|f| **f).count();
        if data.len() != expected {
            return Err(NodeDecodeError::LengthMismatch {
                expected,
                actual: data.len(),
            });
        }
        let mut slots = [None; FLAG_COUNT];
        for (slot, flag) in slots.iter_mut().zip(flags) {
            if flag {
                *slot = Some(read_hash(&mut reader)?);
            }
        }
        Ok(Self {
            hash,
            left: slots[0],
            right: slots[1],
            parent: slots[2],
            pending_old_hash: None,
        })
    }
}

fn read_hash(reader: &mut Cursor<&[u8]>) -> Result<H256, NodeDecodeError> {
    let mut buffer = [0u8; HASH_LENGTH];
    reader
        .read_exact(&mut buffer)
        .map_err(|_| NodeDecodeError::Truncated {
            actual: reader.get_ref().len(),
        })?;
    Ok(H256::from(buffer))
}

/// Error thrown when a [`Node`] fails to be deserialized out of a byte
/// sequence stored in physical storage, via [`Node::decode`].
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum NodeDecodeError {
    #[error("buffer of {actual} bytes is too short for a node row")]
    Truncated { actual: usize },

    #[error("flag byte is neither 0 nor 1: {flag}")]
    InvalidFlag { flag: u8 },

    #[error("declared flags require {expected} bytes, buffer has {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}
