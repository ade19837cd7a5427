// Copyright (c) MerkleDB Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::ColumnFamilyName;

/// A single staged mutation against one column family.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WriteOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
    /// Deletes every key in `[start, end)`.
    DeleteRange(Vec<u8>, Vec<u8>),
}

/// An ordered list of mutations spanning any number of column families,
/// committed atomically by [`StoreInstance::write_batch`].
///
/// Operations apply in insertion order, so a `Put` staged after a
/// `DeleteRange` covering the same key survives the commit.
///
/// [`StoreInstance::write_batch`]: crate::StoreInstance::write_batch
#[derive(Debug, Default)]
pub struct WriteBatch {
    rows: Vec<(ColumnFamilyName, WriteOp)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, cf_name: ColumnFamilyName, key: Vec<u8>, value: Vec<u8>) {
        self.rows.push((cf_name, WriteOp::Put(key, value)));
    }

    pub fn delete(&mut self, cf_name: ColumnFamilyName, key: Vec<u8>) {
        self.rows.push((cf_name, WriteOp::Delete(key)));
    }

    pub fn delete_range(&mut self, cf_name: ColumnFamilyName, start: Vec<u8>, end: Vec<u8>) {
        self.rows.push((cf_name, WriteOp::DeleteRange(start, end)));
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Total payload bytes staged in this batch, for metrics.
    pub fn size_in_bytes(&self) -> usize {
        self.rows
            .iter()
            .map(|(_, op)| match op {
                WriteOp::Put(k, v) => k.len() + v.len(),
                WriteOp::Delete(k) => k.len(),
                WriteOp::DeleteRange(s, e) => s.len() + e.len(),
            })
            .sum()
    }

    pub(crate) fn into_rows(self) -> Vec<(ColumnFamilyName, WriteOp)> {
        self.rows
    }
}
