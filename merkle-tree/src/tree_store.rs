// Copyright (c) MerkleDB Contributors
// SPDX-License-Identifier: Apache-2.0

//! Column-family layout and storage access for one tree.
//!
//! A tree directory holds one RocksDB instance with four column families:
//! `metadata` (scalar rows plus one row per hanging level), `nodes`
//! (hash → encoded node), `keydata` (user key → user value) and the unused
//! but always-opened `default`.

use crate::error::{Result, TreeError};
use crate::hash::{H256, HASH_LENGTH};
use crate::node::Node;
use byteorder::{BigEndian, ByteOrder};
use merkle_store::{ColumnFamilyName, RocksdbConfig, StoreInstance, WriteBatch};
use std::collections::BTreeMap;
use std::path::Path;

pub const DEFAULT_CF_NAME: ColumnFamilyName = "default";
pub const METADATA_CF_NAME: ColumnFamilyName = "metadata";
pub const NODES_CF_NAME: ColumnFamilyName = "nodes";
pub const KEYDATA_CF_NAME: ColumnFamilyName = "keydata";

pub const TREE_COLUMN_FAMILIES: [ColumnFamilyName; 4] = [
    DEFAULT_CF_NAME,
    METADATA_CF_NAME,
    NODES_CF_NAME,
    KEYDATA_CF_NAME,
];

const ROOT_HASH_KEY: &[u8] = b"rootHash";
const NUM_LEAVES_KEY: &[u8] = b"numLeaves";
const DEPTH_KEY: &[u8] = b"depth";
const HANGING_NODE_KEY_PREFIX: &str = "hangingNode";

/// Live column families wiped by `clear`; `default` carries no rows.
const CLEARED_COLUMN_FAMILIES: [ColumnFamilyName; 3] =
    [METADATA_CF_NAME, NODES_CF_NAME, KEYDATA_CF_NAME];

fn hanging_node_key(level: u32) -> Vec<u8> {
    format!("{HANGING_NODE_KEY_PREFIX}{level}").into_bytes()
}

/// Metadata as read back from storage.
#[derive(Debug, Default)]
pub(crate) struct StoredMetadata {
    pub root_hash: Option<H256>,
    pub num_leaves: u32,
    pub depth: u32,
    pub hanging: BTreeMap<u32, H256>,
}

/// The tree's view over its [`StoreInstance`].
#[derive(Debug)]
pub(crate) struct TreeStore {
    instance: StoreInstance,
}

impl TreeStore {
    pub fn open(path: &Path, config: &RocksdbConfig) -> Result<Self> {
        let instance = StoreInstance::open(path, TREE_COLUMN_FAMILIES.to_vec(), config)?;
        Ok(Self { instance })
    }

    pub fn get_node(&self, hash: H256) -> Result<Option<Node>> {
        match self.instance.get(NODES_CF_NAME, hash.as_bytes())? {
            Some(bytes) => Ok(Some(Node::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_root_hash(&self) -> Result<Option<H256>> {
        self.get_hash_row(ROOT_HASH_KEY)
    }

    pub fn get_key_data(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.instance.get(KEYDATA_CF_NAME, key)?)
    }

    /// All persisted `(key, value)` rows in key order.
    pub fn collect_key_data(&self) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        let mut entries = BTreeMap::new();
        for entry in self.instance.iter(KEYDATA_CF_NAME)? {
            let (key, value) = entry?;
            entries.insert(key, value);
        }
        Ok(entries)
    }

    /// Decodes every persisted node row.
    pub fn collect_nodes(&self) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        for entry in self.instance.iter(NODES_CF_NAME)? {
            let (key, value) = entry?;
            let node = Node::decode(&value)?;
            if node.hash().as_bytes() != key.as_slice() {
                return Err(TreeError::CorruptedTree(format!(
                    "node row keyed {} decodes to hash {:#x}",
                    hex::encode(&key),
                    node.hash()
                )));
            }
            nodes.push(node);
        }
        Ok(nodes)
    }

    /// Reads the scalar rows and resolves every hanging level. A hanging row
    /// whose node is absent from the `nodes` family is a corrupted tree.
    pub fn load_metadata(&self) -> Result<StoredMetadata> {
        let root_hash = self.get_root_hash()?;
        let num_leaves = self.get_u32_row(NUM_LEAVES_KEY)?.unwrap_or(0);
        let depth = self.get_u32_row(DEPTH_KEY)?.unwrap_or(0);

        let mut hanging = BTreeMap::new();
        for level in 0..=depth {
            let Some(hash) = self.get_hash_row(&hanging_node_key(level))? else {
                continue;
            };
            let node = self.get_node(hash)?.ok_or_else(|| {
                TreeError::CorruptedTree(format!(
                    "hanging node {hash:#x} at level {level} is absent from storage"
                ))
            })?;
            hanging.insert(level, node.hash());
        }

        Ok(StoredMetadata {
            root_hash,
            num_leaves,
            depth,
            hanging,
        })
    }

    /// Stages the full metadata rewrite: wipe the family, then re-put every
    /// current row. Batch order makes the puts survive the wipe.
    pub fn stage_metadata(
        &self,
        batch: &mut WriteBatch,
        root_hash: Option<H256>,
        num_leaves: u32,
        depth: u32,
        hanging: &BTreeMap<u32, H256>,
    ) {
        batch.delete_range(METADATA_CF_NAME, vec![0x00], vec![0xff]);
        if let Some(root_hash) = root_hash {
            batch.put(
                METADATA_CF_NAME,
                ROOT_HASH_KEY.to_vec(),
                root_hash.as_bytes().to_vec(),
            );
        }
        batch.put(
            METADATA_CF_NAME,
            NUM_LEAVES_KEY.to_vec(),
            encode_u32(num_leaves),
        );
        batch.put(METADATA_CF_NAME, DEPTH_KEY.to_vec(), encode_u32(depth));
        for (level, hash) in hanging {
            batch.put(
                METADATA_CF_NAME,
                hanging_node_key(*level),
                hash.as_bytes().to_vec(),
            );
        }
    }

    pub fn write_batch(&self, batch: WriteBatch, sync: bool) -> Result<()> {
        Ok(self.instance.write_batch(batch, sync)?)
    }

    /// Removes every row from the live column families and compacts them.
    /// Range delete covers keys below `0xFF...`; the sweep afterwards picks
    /// up anything the range bound missed.
    pub fn clear(&self) -> Result<()> {
        for cf_name in CLEARED_COLUMN_FAMILIES {
            self.instance
                .delete_range(cf_name, &[0x00], &[0xff; HASH_LENGTH + 1])?;
            let leftovers = self
                .instance
                .iter(cf_name)?
                .map(|entry| entry.map(|(key, _)| key))
                .collect::<Result<Vec<_>, _>>()?;
            for key in leftovers {
                self.instance.delete(cf_name, &key)?;
            }
            self.instance.compact(cf_name)?;
        }
        Ok(())
    }

    pub fn checkpoint(&self, target: &Path) -> Result<()> {
        Ok(self.instance.checkpoint(target)?)
    }

    fn get_hash_row(&self, key: &[u8]) -> Result<Option<H256>> {
        match self.instance.get(METADATA_CF_NAME, key)? {
            Some(bytes) if bytes.len() == HASH_LENGTH => Ok(Some(H256::from_slice(&bytes))),
            Some(bytes) => Err(TreeError::CorruptedTree(format!(
                "metadata row {} holds {} bytes, expected a hash",
                String::from_utf8_lossy(key),
                bytes.len()
            ))),
            None => Ok(None),
        }
    }

    fn get_u32_row(&self, key: &[u8]) -> Result<Option<u32>> {
        match self.instance.get(METADATA_CF_NAME, key)? {
            Some(bytes) if bytes.len() == 4 => Ok(Some(BigEndian::read_u32(&bytes))),
            Some(bytes) => Err(TreeError::CorruptedTree(format!(
                "metadata row {} holds {} bytes, expected a big-endian u32",
                String::from_utf8_lossy(key),
                bytes.len()
            ))),
            None => Ok(None),
        }
    }
}

fn encode_u32(value: u32) -> Vec<u8> {
    let mut buffer = [0u8; 4];
    BigEndian::write_u32(&mut buffer, value);
    buffer.to_vec()
}
