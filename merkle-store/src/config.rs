// Copyright (c) MerkleDB Contributors
// SPDX-License-Identifier: Apache-2.0

use rocksdb::{BlockBasedOptions, Cache, Options};

const DEFAULT_MAX_OPEN_FILES: i32 = 256;
const DEFAULT_MAX_TOTAL_WAL_SIZE: u64 = 64 * 1024 * 1024;
const DEFAULT_BYTES_PER_SYNC: u64 = 1024 * 1024;
const DEFAULT_BLOCK_CACHE_SIZE: usize = 32 * 1024 * 1024;

/// RocksDB tunables for one store instance.
///
/// The defaults target an embedded, single-process database holding a few
/// million small rows; embedders with larger trees raise the cache and file
/// limits through their own config layer.
#[derive(Clone, Debug)]
pub struct RocksdbConfig {
    pub max_open_files: i32,
    pub max_total_wal_size: u64,
    pub bytes_per_sync: u64,
    pub block_cache_size: usize,
}

impl Default for RocksdbConfig {
    fn default() -> Self {
        Self {
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            max_total_wal_size: DEFAULT_MAX_TOTAL_WAL_SIZE,
            bytes_per_sync: DEFAULT_BYTES_PER_SYNC,
            block_cache_size: DEFAULT_BLOCK_CACHE_SIZE,
        }
    }
}

impl RocksdbConfig {
    pub(crate) fn new_block_cache(&self) -> Cache {
        Cache::new_lru_cache(self.block_cache_size)
    }

    /// Options for the database and each column family. `block_cache` is
    /// built once per instance and shared by every caller, so
    /// `block_cache_size` stays the actual memory ceiling.
    pub(crate) fn to_options(&self, block_cache: &Cache) -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(self.max_open_files);
        opts.set_max_total_wal_size(self.max_total_wal_size);
        opts.set_bytes_per_sync(self.bytes_per_sync);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(block_cache);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }
}
