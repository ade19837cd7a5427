// Copyright (c) MerkleDB Contributors
// SPDX-License-Identifier: Apache-2.0

mod test_node;
mod test_tree;
