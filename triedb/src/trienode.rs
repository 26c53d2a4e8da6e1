//! # Dirty Trie Nodes
//!
//! The output of one trie commit: every node that was created, changed or
//! removed, grouped by the trie that owns it. The account trie is owned by
//! [`ZERO_HASH`]; every storage trie is owned by its account hash.
//!
//! Node sets are handed to [`crate::Database::update`] by value. Once there,
//! they belong to the backend and are retained without copying.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{hash_node, Hash, ZERO_HASH};

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// An encoded trie node together with its content hash.
///
/// An empty blob marks a deleted node. The path scheme removes deleted nodes
/// from disk; the hash scheme never deletes and simply skips them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// BLAKE3 of `blob`, or [`ZERO_HASH`] for a deletion marker.
    pub hash: Hash,
    /// The encoded node.
    pub blob: Vec<u8>,
}

impl Node {
    /// Wrap an encoded node, computing its hash.
    pub fn new(blob: Vec<u8>) -> Self {
        Self {
            hash: hash_node(&blob),
            blob,
        }
    }

    /// A deletion marker.
    pub fn deleted() -> Self {
        Self {
            hash: ZERO_HASH,
            blob: Vec::new(),
        }
    }

    /// Whether this node marks a deletion.
    pub fn is_deleted(&self) -> bool {
        self.blob.is_empty()
    }

    /// Approximate memory footprint: blob plus hash.
    pub fn size(&self) -> u64 {
        self.blob.len() as u64 + 32
    }
}

/// A storage trie root referenced from a leaf of the account trie.
///
/// The hash scheme uses this to keep storage tries alive for as long as the
/// account trie node holding the leaf is alive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leaf {
    /// The storage trie root carried by the account leaf.
    pub root: Hash,
    /// Hash of the account trie node that embeds the leaf.
    pub parent: Hash,
}

// ---------------------------------------------------------------------------
// NodeSet
// ---------------------------------------------------------------------------

/// Dirty nodes of a single trie, keyed by path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSet {
    /// Owner of the trie: zero for the account trie, account hash otherwise.
    pub owner: Hash,
    /// Nodes keyed by their path from the trie root.
    pub nodes: BTreeMap<Vec<u8>, Node>,
    /// Account leaves that reference storage tries.
    pub leaves: Vec<Leaf>,
}

impl NodeSet {
    /// Create an empty set for `owner`.
    pub fn new(owner: Hash) -> Self {
        Self {
            owner,
            nodes: BTreeMap::new(),
            leaves: Vec::new(),
        }
    }

    /// Record a node at `path`. A later call for the same path wins.
    pub fn add_node(&mut self, path: impl Into<Vec<u8>>, node: Node) {
        self.nodes.insert(path.into(), node);
    }

    /// Record that the node `parent` embeds a leaf pointing at storage
    /// trie `root`.
    pub fn add_leaf(&mut self, parent: Hash, root: Hash) {
        self.leaves.push(Leaf { root, parent });
    }

    /// Take every node out of the set, children first: paths in reverse
    /// lexicographic order, so `0a01` comes before `0a` and `0a` before the
    /// root path. Leaves stay in place.
    pub fn drain_children_first(&mut self) -> impl Iterator<Item = (Vec<u8>, Node)> {
        std::mem::take(&mut self.nodes).into_iter().rev()
    }
}

// ---------------------------------------------------------------------------
// MergedNodeSet
// ---------------------------------------------------------------------------

/// Node sets of every trie touched by one state transition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergedNodeSet {
    /// Sets keyed by owner.
    pub sets: HashMap<Hash, NodeSet>,
}

impl MergedNodeSet {
    /// An empty merged set.
    pub fn new() -> Self {
        Self::default()
    }

    /// A merged set seeded with one trie's nodes.
    pub fn with_set(set: NodeSet) -> Self {
        let mut merged = Self::new();
        merged.sets.insert(set.owner, set);
        merged
    }

    /// Add a trie's nodes. Each owner may appear once.
    pub fn merge(&mut self, set: NodeSet) -> Result<()> {
        if self.sets.contains_key(&set.owner) {
            return Err(Error::DuplicateOwner(set.owner));
        }
        self.sets.insert(set.owner, set);
        Ok(())
    }

    /// Owners in commit order: storage tries first (sorted for determinism),
    /// the account trie last.
    pub fn owners_in_order(&self) -> Vec<Hash> {
        let mut owners: Vec<Hash> = self
            .sets
            .keys()
            .filter(|owner| **owner != ZERO_HASH)
            .copied()
            .collect();
        owners.sort_unstable();
        if self.sets.contains_key(&ZERO_HASH) {
            owners.push(ZERO_HASH);
        }
        owners
    }

    /// Drop the grouping metadata and keep owner → path → node.
    pub fn flatten(self) -> HashMap<Hash, BTreeMap<Vec<u8>, Node>> {
        self.sets
            .into_iter()
            .map(|(owner, set)| (owner, set.nodes))
            .collect()
    }

    /// Total number of nodes across all owners.
    pub fn len(&self) -> usize {
        self.sets.values().map(|set| set.nodes.len()).sum()
    }

    /// Whether no owner carries any node.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deleted_node_has_no_blob() {
        let node = Node::deleted();
        assert!(node.is_deleted());
        assert_eq!(node.hash, ZERO_HASH);
        assert!(!Node::new(vec![1, 2, 3]).is_deleted());
    }

    #[test]
    fn ordered_iteration_visits_children_first() {
        let mut set = NodeSet::new(ZERO_HASH);
        set.add_node(vec![], Node::new(b"root".to_vec()));
        set.add_node(vec![0x0a], Node::new(b"branch".to_vec()));
        set.add_node(vec![0x0a, 0x01], Node::new(b"leaf".to_vec()));
        set.add_node(vec![0x03], Node::new(b"other".to_vec()));

        set.add_leaf([1u8; 32], [2u8; 32]);

        let order: Vec<Vec<u8>> = set.drain_children_first().map(|(path, _)| path).collect();
        assert_eq!(order, vec![vec![0x0a, 0x01], vec![0x0a], vec![0x03], vec![]]);
        assert!(set.nodes.is_empty());
        assert_eq!(set.leaves.len(), 1);
    }

    #[test]
    fn merge_rejects_duplicate_owner() {
        let mut merged = MergedNodeSet::with_set(NodeSet::new([7u8; 32]));
        assert!(merged.merge(NodeSet::new([8u8; 32])).is_ok());
        assert!(matches!(
            merged.merge(NodeSet::new([7u8; 32])),
            Err(Error::DuplicateOwner(_))
        ));
    }

    #[test]
    fn account_trie_is_committed_last() {
        let mut merged = MergedNodeSet::new();
        merged.merge(NodeSet::new(ZERO_HASH)).unwrap();
        merged.merge(NodeSet::new([9u8; 32])).unwrap();
        merged.merge(NodeSet::new([2u8; 32])).unwrap();

        assert_eq!(
            merged.owners_in_order(),
            vec![[2u8; 32], [9u8; 32], ZERO_HASH]
        );
    }
}
