// Copyright (c) MerkleDB Contributors
// SPDX-License-Identifier: Apache-2.0

pub mod batch;

use crate::metrics::DBMetrics;
use crate::{ColumnFamilyName, Result, RocksdbConfig, StoreError};
use self::batch::{WriteBatch, WriteOp};
use rocksdb::checkpoint::Checkpoint;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, WriteOptions, DB};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// One open RocksDB database with a fixed set of column families.
///
/// The instance exclusively owns the underlying handles; dropping it closes
/// the database and releases the directory lock.
pub struct StoreInstance {
    db: DB,
    path: PathBuf,
    cf_names: Vec<ColumnFamilyName>,
    metrics: Option<Arc<DBMetrics>>,
}

impl std::fmt::Debug for StoreInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreInstance")
            .field("path", &self.path)
            .field("cf_names", &self.cf_names)
            .finish()
    }
}

impl StoreInstance {
    /// Opens (creating if missing) the database at `path` with the given
    /// column families. Metrics are recorded when [`DBMetrics`] has been
    /// initialized for the process.
    pub fn open(
        path: impl AsRef<Path>,
        cf_names: Vec<ColumnFamilyName>,
        config: &RocksdbConfig,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let block_cache = config.new_block_cache();
        let opts = config.to_options(&block_cache);
        let cf_descriptors = cf_names
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, config.to_options(&block_cache)))
            .collect::<Vec<_>>();
        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)?;
        tracing::debug!(path = %path.display(), cfs = cf_names.len(), "opened store instance");

        let metrics = DBMetrics::get().cloned();
        if let Some(metrics) = &metrics {
            metrics.increment_open_instances();
        }
        Ok(Self {
            db,
            path,
            cf_names,
            metrics,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cf_names(&self) -> &[ColumnFamilyName] {
        &self.cf_names
    }

    fn cf_handle(&self, cf_name: ColumnFamilyName) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(cf_name)
            .ok_or(StoreError::MissingColumnFamily(cf_name))
    }

    pub fn get(&self, cf_name: ColumnFamilyName, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let start = Instant::now();
        let cf = self.cf_handle(cf_name)?;
        let value = self.db.get_cf(cf, key)?;
        if let Some(metrics) = &self.metrics {
            metrics.observe_get(cf_name, start.elapsed(), value.as_ref().map_or(0, |v| v.len()));
        }
        Ok(value)
    }

    pub fn put(&self, cf_name: ColumnFamilyName, key: &[u8], value: &[u8]) -> Result<()> {
        let start = Instant::now();
        let cf = self.cf_handle(cf_name)?;
        self.db.put_cf(cf, key, value)?;
        if let Some(metrics) = &self.metrics {
            metrics.observe_put(cf_name, start.elapsed(), key.len() + value.len());
        }
        Ok(())
    }

    pub fn delete(&self, cf_name: ColumnFamilyName, key: &[u8]) -> Result<()> {
        let cf = self.cf_handle(cf_name)?;
        self.db.delete_cf(cf, key)?;
        if let Some(metrics) = &self.metrics {
            metrics.increment_deletes(cf_name);
        }
        Ok(())
    }

    /// Forward iteration over every `(key, value)` of one column family in
    /// key order. The iterator reflects committed state only.
    pub fn iter(
        &self,
        cf_name: ColumnFamilyName,
    ) -> Result<impl Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + '_> {
        let cf = self.cf_handle(cf_name)?;
        Ok(self.db.iterator_cf(cf, IteratorMode::Start).map(|entry| {
            entry
                .map(|(key, value)| (key.into_vec(), value.into_vec()))
                .map_err(StoreError::from)
        }))
    }

    /// Deletes every key in `[start, end)` of one column family.
    pub fn delete_range(
        &self,
        cf_name: ColumnFamilyName,
        start: &[u8],
        end: &[u8],
    ) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete_range(cf_name, start.to_vec(), end.to_vec());
        self.write_batch(batch, false)
    }

    /// Commits the staged mutations atomically. With `sync`, the commit is
    /// durable before the call returns.
    pub fn write_batch(&self, batch: WriteBatch, sync: bool) -> Result<()> {
        let start = Instant::now();
        let size = batch.size_in_bytes();
        let mut inner = rocksdb::WriteBatch::default();
        for (cf_name, op) in batch.into_rows() {
            let cf = self.cf_handle(cf_name)?;
            match op {
                WriteOp::Put(key, value) => inner.put_cf(cf, key, value),
                WriteOp::Delete(key) => inner.delete_cf(cf, key),
                WriteOp::DeleteRange(from, to) => inner.delete_range_cf(cf, from, to),
            }
        }
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(sync);
        self.db.write_opt(inner, &write_opts)?;
        if let Some(metrics) = &self.metrics {
            metrics.observe_write_batch(start.elapsed(), size, sync);
        }
        Ok(())
    }

    pub fn compact(&self, cf_name: ColumnFamilyName) -> Result<()> {
        let cf = self.cf_handle(cf_name)?;
        self.db
            .compact_range_cf(cf, None::<&[u8]>, None::<&[u8]>);
        Ok(())
    }

    /// Materializes a point-in-time copy of the whole store at `target`.
    /// The target directory must not exist yet.
    pub fn checkpoint(&self, target: impl AsRef<Path>) -> Result<()> {
        let target = target.as_ref();
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Checkpoint::new(&self.db)?.create_checkpoint(target)?;
        tracing::debug!(
            source = %self.path.display(),
            target = %target.display(),
            "created checkpoint"
        );
        Ok(())
    }
}

impl Drop for StoreInstance {
    fn drop(&mut self) {
        if let Some(metrics) = &self.metrics {
            metrics.decrement_open_instances();
        }
    }
}
