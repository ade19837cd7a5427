// Copyright (c) MerkleDB Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::error::TreeError;
use crate::hash::{hash_pair, internal_hash, leaf_hash, H256};
use crate::merkle_tree::{MerkleTree, TreeConfig};
use crate::node::Node;
use itertools::Itertools;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn config(dir: &TempDir) -> TreeConfig {
    TreeConfig {
        base_dir: dir.path().to_path_buf(),
        ..Default::default()
    }
}

fn open(dir: &TempDir, name: &str) -> Arc<MerkleTree> {
    MerkleTree::open_with_config(name, config(dir)).unwrap()
}

fn record(i: usize) -> (Vec<u8>, Vec<u8>) {
    (
        format!("key-{i:04}").into_bytes(),
        format!("value-{i:04}").into_bytes(),
    )
}

/// Structural invariants that must hold after any public operation. Works
/// on the persisted node set, so the tree gets flushed as a side effect.
fn assert_invariants(tree: &MerkleTree) {
    let num_leaves = tree.num_leaves().unwrap();
    let root = tree.root_hash().unwrap();
    assert_eq!(root.is_none(), num_leaves == 0);

    let nodes: HashMap<H256, Node> = tree
        .all_nodes()
        .unwrap()
        .into_iter()
        .map(|node| (node.hash(), node))
        .collect();
    for node in nodes.values() {
        if !node.is_leaf() {
            assert_eq!(node.hash(), internal_hash(node.left(), node.right()));
        }
        for child_hash in [node.left(), node.right()].into_iter().flatten() {
            let child = nodes
                .get(&child_hash)
                .unwrap_or_else(|| panic!("child {child_hash:#x} missing from node set"));
            assert_eq!(child.parent(), Some(node.hash()));
        }
    }
    if let Some(root) = root {
        let root_node = nodes.get(&root).expect("root must be persisted");
        assert_eq!(root_node.parent(), None);
    }
}

#[test]
fn empty_tree_boundaries() {
    let dir = TempDir::new().unwrap();
    let tree = open(&dir, "t_empty");
    assert_eq!(tree.root_hash().unwrap(), None);
    assert_eq!(tree.num_leaves().unwrap(), 0);
    assert_eq!(tree.depth().unwrap(), 0);
    assert!(tree.get_all_keys().unwrap().is_empty());
    assert!(!tree.contains_key(b"anything").unwrap());
    assert_eq!(tree.get_data(b"anything").unwrap(), None);
    tree.close().unwrap();
}

#[test]
fn single_leaf_idempotence() {
    let dir = TempDir::new().unwrap();
    let tree = open(&dir, "t_single_leaf");
    tree.add_or_update_data(b"k", b"v").unwrap();

    let expected = leaf_hash(b"k", b"v");
    assert_eq!(tree.root_hash().unwrap(), Some(expected));
    assert_eq!(tree.num_leaves().unwrap(), 1);
    assert_eq!(tree.depth().unwrap(), 0);

    // Re-inserting the identical record changes nothing.
    tree.add_or_update_data(b"k", b"v").unwrap();
    assert_eq!(tree.root_hash().unwrap(), Some(expected));
    assert_eq!(tree.num_leaves().unwrap(), 1);
    tree.close().unwrap();
}

#[test]
fn two_leaves_root_is_pair_hash() {
    let dir = TempDir::new().unwrap();
    let tree = open(&dir, "t_two_leaves");
    tree.add_or_update_data(b"a", b"1").unwrap();
    tree.add_or_update_data(b"b", b"2").unwrap();

    let l1 = leaf_hash(b"a", b"1");
    let l2 = leaf_hash(b"b", b"2");
    assert_eq!(
        tree.root_hash().unwrap(),
        Some(hash_pair(l1.as_bytes(), l2.as_bytes()))
    );
    assert_eq!(tree.depth().unwrap(), 1);
    assert_invariants(&tree);
    tree.close().unwrap();
}

#[test]
fn third_leaf_hangs_with_duplicated_parent() {
    let dir = TempDir::new().unwrap();
    let tree = open(&dir, "t_three_leaves");
    tree.add_or_update_data(b"a", b"1").unwrap();
    tree.add_or_update_data(b"b", b"2").unwrap();
    tree.add_or_update_data(b"c", b"3").unwrap();

    let l1 = leaf_hash(b"a", b"1");
    let l2 = leaf_hash(b"b", b"2");
    let l3 = leaf_hash(b"c", b"3");
    let pair = hash_pair(l1.as_bytes(), l2.as_bytes());
    let dup = hash_pair(l3.as_bytes(), l3.as_bytes());
    assert_eq!(
        tree.root_hash().unwrap(),
        Some(hash_pair(pair.as_bytes(), dup.as_bytes()))
    );
    assert_eq!(tree.depth().unwrap(), 2);
    assert_eq!(tree.num_leaves().unwrap(), 3);
    assert_invariants(&tree);
    tree.close().unwrap();
}

#[test]
fn fourth_leaf_completes_the_tree() {
    let dir = TempDir::new().unwrap();
    let tree = open(&dir, "t_four_leaves");
    let leaves: Vec<H256> = (0..4)
        .map(|i| {
            let (key, value) = record(i);
            tree.add_or_update_data(&key, &value).unwrap();
            leaf_hash(&key, &value)
        })
        .collect();

    let left = hash_pair(leaves[0].as_bytes(), leaves[1].as_bytes());
    let right = hash_pair(leaves[2].as_bytes(), leaves[3].as_bytes());
    assert_eq!(
        tree.root_hash().unwrap(),
        Some(hash_pair(left.as_bytes(), right.as_bytes()))
    );
    assert_eq!(tree.depth().unwrap(), 2);

    // A perfect tree of 4 leaves persists exactly 7 nodes.
    assert_eq!(tree.all_nodes().unwrap().len(), 7);
    assert_invariants(&tree);
    tree.close().unwrap();
}

#[test]
fn updating_a_record_moves_the_root_deterministically() {
    let dir = TempDir::new().unwrap();
    let tree = open(&dir, "t_update_record");
    tree.add_or_update_data(b"k1", b"v1").unwrap();
    tree.add_or_update_data(b"k2", b"other").unwrap();
    let original_root = tree.root_hash().unwrap();

    tree.add_or_update_data(b"k1", b"v2").unwrap();
    let updated_root = tree.root_hash().unwrap();
    assert_ne!(original_root, updated_root);
    assert_eq!(tree.num_leaves().unwrap(), 2);

    // Updating back restores the original root.
    tree.add_or_update_data(b"k1", b"v1").unwrap();
    assert_eq!(tree.root_hash().unwrap(), original_root);
    assert_invariants(&tree);
    tree.close().unwrap();
}

#[test]
fn update_survives_flush_boundaries() {
    let dir = TempDir::new().unwrap();
    let tree = open(&dir, "t_update_flushed");
    for i in 0..5 {
        let (key, value) = record(i);
        tree.add_or_update_data(&key, &value).unwrap();
    }
    tree.flush_to_disk(false).unwrap();

    // The updated leaf and its ancestors now live only on disk.
    let (key, _) = record(2);
    tree.add_or_update_data(&key, b"rewritten").unwrap();
    assert_eq!(tree.get_data(&key).unwrap(), Some(b"rewritten".to_vec()));
    tree.flush_to_disk(false).unwrap();
    assert_eq!(tree.get_data(&key).unwrap(), Some(b"rewritten".to_vec()));
    assert_invariants(&tree);
    tree.close().unwrap();
}

#[test]
fn revert_drops_unsaved_changes() {
    let dir = TempDir::new().unwrap();
    let tree = open(&dir, "t_revert");
    tree.add_or_update_data(b"x", b"y").unwrap();
    tree.flush_to_disk(false).unwrap();

    tree.add_or_update_data(b"p", b"q").unwrap();
    assert_eq!(tree.num_leaves().unwrap(), 2);

    tree.revert_unsaved_changes().unwrap();
    assert_eq!(tree.num_leaves().unwrap(), 1);
    assert_eq!(tree.root_hash().unwrap(), Some(leaf_hash(b"x", b"y")));
    assert_eq!(tree.get_data(b"p").unwrap(), None);
    assert_eq!(tree.get_data(b"x").unwrap(), Some(b"y".to_vec()));

    // Reverting a clean tree is a no-op.
    tree.revert_unsaved_changes().unwrap();
    assert_eq!(tree.num_leaves().unwrap(), 1);
    tree.close().unwrap();
}

#[test]
fn flush_and_reopen_preserves_everything() {
    let dir = TempDir::new().unwrap();
    let tree = open(&dir, "t_reopen");
    let mut expected = BTreeMap::new();
    for i in 0..100 {
        let (key, value) = record(i);
        tree.add_or_update_data(&key, &value).unwrap();
        expected.insert(key, value);
    }
    let root = tree.root_hash().unwrap();
    let depth = tree.depth().unwrap();
    tree.flush_to_disk(false).unwrap();
    assert_eq!(tree.root_hash_saved_on_disk().unwrap(), root);
    tree.close().unwrap();

    let reopened = open(&dir, "t_reopen");
    assert_eq!(reopened.root_hash().unwrap(), root);
    assert_eq!(reopened.num_leaves().unwrap(), 100);
    assert_eq!(reopened.depth().unwrap(), depth);

    let (keys, values) = reopened.keys_and_values().unwrap();
    for ((key, value), (expected_key, expected_value)) in
        keys.iter().zip(&values).zip_eq(expected.iter())
    {
        assert_eq!(key, expected_key);
        assert_eq!(value, expected_value);
    }
    assert_invariants(&reopened);
    reopened.close().unwrap();
}

#[test]
fn unsaved_root_differs_from_disk_root() {
    let dir = TempDir::new().unwrap();
    let tree = open(&dir, "t_disk_root");
    assert_eq!(tree.root_hash_saved_on_disk().unwrap(), None);

    tree.add_or_update_data(b"k", b"v").unwrap();
    assert_eq!(tree.root_hash_saved_on_disk().unwrap(), None);
    assert!(tree.ram_info().unwrap().has_unsaved_changes);

    tree.flush_to_disk(false).unwrap();
    assert_eq!(
        tree.root_hash_saved_on_disk().unwrap(),
        Some(leaf_hash(b"k", b"v"))
    );
    let info = tree.ram_info().unwrap();
    assert!(!info.has_unsaved_changes);
    assert_eq!(info.cached_nodes, 0);
    assert_eq!(info.cached_key_data, 0);
    tree.close().unwrap();
}

#[test]
fn release_storage_goes_dormant_and_recovers() {
    let dir = TempDir::new().unwrap();
    let tree = open(&dir, "t_dormant");
    tree.add_or_update_data(b"k", b"v").unwrap();
    tree.flush_to_disk(true).unwrap();
    assert!(!tree.ram_info().unwrap().storage_open);

    // Any storage-touching operation reopens the handles.
    assert_eq!(tree.get_data(b"k").unwrap(), Some(b"v".to_vec()));
    assert!(tree.ram_info().unwrap().storage_open);
    tree.close().unwrap();
}

#[test]
fn clear_empties_the_tree_but_keeps_it_usable() {
    let dir = TempDir::new().unwrap();
    let tree = open(&dir, "t_clear");
    for i in 0..10 {
        let (key, value) = record(i);
        tree.add_or_update_data(&key, &value).unwrap();
    }
    tree.flush_to_disk(false).unwrap();

    tree.clear().unwrap();
    assert_eq!(tree.root_hash().unwrap(), None);
    assert_eq!(tree.num_leaves().unwrap(), 0);
    assert!(tree.get_all_keys().unwrap().is_empty());
    assert!(tree.all_nodes().unwrap().is_empty());

    tree.add_or_update_data(b"fresh", b"start").unwrap();
    assert_eq!(
        tree.root_hash().unwrap(),
        Some(leaf_hash(b"fresh", b"start"))
    );
    tree.close().unwrap();
}

#[test]
fn clone_is_a_frozen_copy() {
    let dir = TempDir::new().unwrap();
    let tree = open(&dir, "t_clone_a");
    for i in 0..50 {
        let (key, value) = record(i);
        tree.add_or_update_data(&key, &value).unwrap();
    }
    tree.flush_to_disk(false).unwrap();
    let frozen_root = tree.root_hash().unwrap();
    let frozen_nodes = tree.all_nodes().unwrap();

    let copy = tree.clone_tree("t_clone_b").unwrap();

    // Mutating the original leaves the clone untouched.
    tree.add_or_update_data(b"mutation", b"after-clone").unwrap();
    assert_ne!(tree.root_hash().unwrap(), frozen_root);
    assert_eq!(copy.root_hash().unwrap(), frozen_root);
    assert_eq!(copy.num_leaves().unwrap(), 50);
    assert_eq!(copy.all_nodes().unwrap(), frozen_nodes);
    assert_eq!(copy.get_data(&record(7).0).unwrap(), Some(record(7).1));

    tree.close().unwrap();
    copy.close().unwrap();
}

#[test]
fn update_from_mirrors_a_diverged_tree() {
    let dir = TempDir::new().unwrap();
    let source = open(&dir, "t_mirror_source");
    for i in 0..20 {
        let (key, value) = record(i);
        source.add_or_update_data(&key, &value).unwrap();
    }

    let target = open(&dir, "t_mirror_target");
    for i in 5..15 {
        let (key, _) = record(i);
        target.add_or_update_data(&key, b"diverged").unwrap();
    }
    target.flush_to_disk(false).unwrap();

    target.update_from(&source).unwrap();
    assert_eq!(target.root_hash().unwrap(), source.root_hash().unwrap());
    assert_eq!(target.num_leaves().unwrap(), 20);
    assert_eq!(target.get_all_keys().unwrap(), source.get_all_keys().unwrap());
    assert_eq!(
        target.get_data(&record(5).0).unwrap(),
        Some(record(5).1)
    );
    assert_invariants(&target);

    source.close().unwrap();
    target.close().unwrap();
}

#[test]
fn update_from_identical_disk_state_copies_caches() {
    let dir = TempDir::new().unwrap();
    let source = open(&dir, "t_sync_source");
    for i in 0..8 {
        let (key, value) = record(i);
        source.add_or_update_data(&key, &value).unwrap();
    }
    source.flush_to_disk(false).unwrap();
    let copy = source.clone_tree("t_sync_copy").unwrap();

    // Unsaved changes on the source reach the copy without a rebuild.
    source.add_or_update_data(b"pending", b"only-in-ram").unwrap();
    copy.update_from(&source).unwrap();
    assert_eq!(copy.root_hash().unwrap(), source.root_hash().unwrap());
    assert_eq!(copy.num_leaves().unwrap(), 9);
    assert!(copy.ram_info().unwrap().has_unsaved_changes);
    assert_eq!(
        copy.get_data(b"pending").unwrap(),
        Some(b"only-in-ram".to_vec())
    );

    source.close().unwrap();
    copy.close().unwrap();
}

#[test]
fn closed_tree_rejects_operations() {
    let dir = TempDir::new().unwrap();
    let tree = open(&dir, "t_closed");
    tree.add_or_update_data(b"k", b"v").unwrap();
    tree.close().unwrap();
    // Idempotent.
    tree.close().unwrap();

    assert!(matches!(tree.root_hash(), Err(TreeError::TreeClosed(_))));
    assert!(matches!(
        tree.add_or_update_data(b"k", b"v2"),
        Err(TreeError::TreeClosed(_))
    ));

    // The name is free again.
    let reopened = open(&dir, "t_closed");
    assert_eq!(reopened.get_data(b"k").unwrap(), Some(b"v".to_vec()));
    reopened.close().unwrap();
}

#[test]
fn duplicate_open_is_rejected() {
    let dir = TempDir::new().unwrap();
    let tree = open(&dir, "t_duplicate");
    assert!(matches!(
        MerkleTree::open_with_config("t_duplicate", config(&dir)),
        Err(TreeError::DuplicateInstance(_))
    ));
    tree.close().unwrap();
}

#[test]
fn empty_arguments_are_rejected() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        MerkleTree::open_with_config("", config(&dir)),
        Err(TreeError::InvalidArgument(_))
    ));

    let tree = open(&dir, "t_bad_args");
    assert!(matches!(
        tree.add_or_update_data(b"", b"v"),
        Err(TreeError::InvalidArgument(_))
    ));
    assert!(matches!(
        tree.clone_tree(""),
        Err(TreeError::InvalidArgument(_))
    ));
    assert!(matches!(
        tree.update_from(&tree),
        Err(TreeError::InvalidArgument(_))
    ));
    tree.close().unwrap();
}

#[test]
fn concurrent_writers_insert_distinct_keys() {
    let dir = TempDir::new().unwrap();
    let tree = open(&dir, "t_concurrent");
    let writers = 8;
    let keys_per_writer = 10;

    let mut handles = vec![];
    for writer in 0..writers {
        let tree = tree.clone();
        handles.push(thread::spawn(move || {
            for i in 0..keys_per_writer {
                let key = format!("w{writer}-k{i}").into_bytes();
                tree.add_or_update_data(&key, b"payload").unwrap();
            }
        }));
    }
    // Readers run alongside and must always see a coherent
    // (root_hash, num_leaves) pair.
    let reader_tree = tree.clone();
    let reader = thread::spawn(move || {
        for _ in 0..200 {
            let info = reader_tree.ram_info().unwrap();
            assert_eq!(info.root_hash.is_none(), info.num_leaves == 0);
        }
    });
    for handle in handles {
        handle.join().unwrap();
    }
    reader.join().unwrap();

    assert_eq!(
        tree.num_leaves().unwrap(),
        (writers * keys_per_writer) as u32
    );
    assert_invariants(&tree);
    tree.close().unwrap();
}

#[test]
fn stale_rows_are_deleted_at_flush() {
    let dir = TempDir::new().unwrap();
    let tree = open(&dir, "t_stale_rows");
    for i in 0..3 {
        let (key, value) = record(i);
        tree.add_or_update_data(&key, &value).unwrap();
    }
    tree.flush_to_disk(false).unwrap();
    let before = tree.all_nodes().unwrap().len();

    let (key, _) = record(1);
    tree.add_or_update_data(&key, b"changed").unwrap();
    tree.flush_to_disk(false).unwrap();

    // Rewritten ancestors replace their stale rows instead of piling up.
    assert_eq!(tree.all_nodes().unwrap().len(), before);
    assert_invariants(&tree);
    tree.close().unwrap();
}
