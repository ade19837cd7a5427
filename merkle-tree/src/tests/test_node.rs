// Copyright (c) MerkleDB Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::hash::{hash_pair, sha3_256_of, H256};
use crate::node::{Node, NodeDecodeError};
use proptest::prelude::*;

fn h(tag: &[u8]) -> H256 {
    sha3_256_of(tag)
}

#[test]
fn leaf_roundtrip() {
    let leaf = Node::new_leaf(h(b"leaf"));
    let decoded = Node::decode(&leaf.encode()).unwrap();
    assert_eq!(decoded, leaf);
    assert!(decoded.is_leaf());
    assert_eq!(decoded.parent(), None);
}

#[test]
fn internal_roundtrip_all_slot_combinations() {
    let left = h(b"left");
    let right = h(b"right");
    let parent = h(b"parent");

    let mut single = Node::new_internal(left, None);
    let decoded = Node::decode(&single.encode()).unwrap();
    assert_eq!(decoded, single);
    assert_eq!(decoded.left(), Some(left));
    assert_eq!(decoded.right(), None);

    single.parent = Some(parent);
    assert_eq!(Node::decode(&single.encode()).unwrap(), single);

    let mut full = Node::new_internal(left, Some(right));
    full.parent = Some(parent);
    let decoded = Node::decode(&full.encode()).unwrap();
    assert_eq!(decoded, full);
    assert_eq!(decoded.right(), Some(right));
    assert_eq!(decoded.parent(), Some(parent));
}

#[test]
fn internal_hash_uses_single_child_duplication() {
    let child = h(b"only");
    let node = Node::new_internal(child, None);
    assert_eq!(node.hash(), hash_pair(child.as_bytes(), child.as_bytes()));
}

#[test]
fn decode_rejects_truncated_buffer() {
    assert!(matches!(
        Node::decode(&[0u8; 10]),
        Err(NodeDecodeError::Truncated { actual: 10 })
    ));
    assert!(matches!(
        Node::decode(&[]),
        Err(NodeDecodeError::Truncated { .. })
    ));
}

#[test]
fn decode_rejects_bad_flag_byte() {
    let mut bytes = Node::new_leaf(h(b"x")).encode();
    bytes[32] = 7;
    assert_eq!(
        Node::decode(&bytes),
        Err(NodeDecodeError::InvalidFlag { flag: 7 })
    );
}

#[test]
fn decode_rejects_flag_length_mismatch() {
    // Claim a left child without supplying its hash.
    let mut bytes = Node::new_leaf(h(b"x")).encode();
    bytes[32] = 1;
    assert_eq!(
        Node::decode(&bytes),
        Err(NodeDecodeError::LengthMismatch {
            expected: 67,
            actual: 35,
        })
    );

    // Trailing garbage after a well-formed row.
    let mut bytes = Node::new_internal(h(b"l"), Some(h(b"r"))).encode();
    bytes.push(0);
    assert!(matches!(
        Node::decode(&bytes),
        Err(NodeDecodeError::LengthMismatch { .. })
    ));
}

#[test]
fn adopt_child_fills_left_then_right() {
    let mut node = Node::new_internal(h(b"l"), None);
    assert!(node.adopt_child(h(b"r")));
    assert_eq!(node.left(), Some(h(b"l")));
    assert_eq!(node.right(), Some(h(b"r")));
    // Both slots occupied now.
    assert!(!node.adopt_child(h(b"extra")));
}

#[test]
fn replace_child_rewrites_matching_slot_only() {
    let mut node = Node::new_internal(h(b"l"), Some(h(b"r")));
    assert!(node.replace_child(h(b"r"), h(b"r2")));
    assert_eq!(node.right(), Some(h(b"r2")));
    assert!(!node.replace_child(h(b"unknown"), h(b"other")));
}

#[test]
fn first_mutation_records_pending_old_hash() {
    let mut node = Node::new_internal(h(b"l"), None);
    let original = node.hash();
    assert!(node.pending_old_hash.is_none());
    node.adopt_child(h(b"r"));
    assert_eq!(node.pending_old_hash, Some(original));
    // A second mutation keeps the first recording.
    node.replace_child(h(b"r"), h(b"r2"));
    assert_eq!(node.pending_old_hash, Some(original));
}

#[test]
fn equality_ignores_transient_bookkeeping() {
    let mut a = Node::new_leaf(h(b"n"));
    let b = Node::new_leaf(h(b"n"));
    a.pending_old_hash = Some(h(b"stale"));
    assert_eq!(a, b);
}

fn arb_hash() -> impl Strategy<Value = H256> {
    any::<[u8; 32]>().prop_map(H256::from)
}

proptest! {
    #[test]
    fn encode_decode_roundtrip(
        hash in arb_hash(),
        left in proptest::option::of(arb_hash()),
        right in proptest::option::of(arb_hash()),
        parent in proptest::option::of(arb_hash()),
    ) {
        let mut node = Node::new_leaf(hash);
        node.left = left;
        node.right = right;
        node.parent = parent;
        let bytes = node.encode();
        prop_assert_eq!(Node::decode(&bytes).unwrap(), node);
    }

    #[test]
    fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..140)) {
        let _ = Node::decode(&bytes);
    }
}
