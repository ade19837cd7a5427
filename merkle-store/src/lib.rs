// Copyright (c) MerkleDB Contributors
// SPDX-License-Identifier: Apache-2.0

//! Thin storage layer over an embedded RocksDB instance.
//!
//! A [`StoreInstance`] owns one RocksDB database opened with a fixed set of
//! named column families. Callers address rows by `(column family, key)`,
//! stage multi-family mutations in a [`WriteBatch`] and commit them
//! atomically, iterate a family in key order, range-delete, compact, and
//! materialize point-in-time checkpoints of the whole store.

pub mod config;
pub mod metrics;
pub mod rocks;

pub use config::RocksdbConfig;
pub use metrics::DBMetrics;
pub use rocks::batch::{WriteBatch, WriteOp};
pub use rocks::StoreInstance;

/// Column families are addressed by their static registration name.
pub type ColumnFamilyName = &'static str;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Errors surfaced by the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("rocksdb error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("column family {0} is not registered")]
    MissingColumnFamily(ColumnFamilyName),
}
