//! State histories: the reverse diffs that make rollback possible.
//!
//! Every time a diff layer is flattened into the disk layer, the values the
//! disk layer held *before* the merge are recorded under the new state id.
//! Walking these records backwards reconstructs any retained ancestor.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::disk::DiskDb;
use crate::error::{Error, Result};
use crate::trienode::Node;
use crate::triestate::StateSet;
use crate::types::Hash;

/// Owner → path → node. The flattened shape every layer works with.
pub type NodeMap = HashMap<Hash, BTreeMap<Vec<u8>, Node>>;

/// The original value of one node slot before a transition. An empty blob
/// means the slot was vacant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOrigin {
    /// Trie owner.
    pub owner: Hash,
    /// Path within the trie.
    pub path: Vec<u8>,
    /// Blob before the transition.
    pub blob: Vec<u8>,
}

/// Reverse diff of one state transition, persisted under its state id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateHistory {
    /// State id of the post-transition state.
    pub id: u64,
    /// Root after the transition.
    pub root: Hash,
    /// Root before the transition.
    pub parent: Hash,
    /// Block number of the transition.
    pub block: u64,
    /// Original flat state values.
    pub states: StateSet,
    /// Original node values.
    pub origins: Vec<NodeOrigin>,
}

impl StateHistory {
    /// Whether this history carries everything needed to revert it.
    pub fn is_complete(&self) -> bool {
        self.states.is_complete()
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Persist this history and index its root.
    pub(crate) fn write(&self, disk: &DiskDb) -> Result<()> {
        if disk.read_state_id(&self.parent)?.is_none() {
            disk.write_state_id(&self.parent, self.id - 1)?;
        }
        disk.write_state_history(self.id, &self.root, &self.encode()?)
    }

    /// Load the history with sequence number `id`.
    pub(crate) fn read(disk: &DiskDb, id: u64) -> Result<Option<Self>> {
        match disk.read_state_history(id)? {
            Some(bytes) => {
                let history = Self::decode(&bytes)?;
                if history.id != id {
                    return Err(Error::UnexpectedHistory {
                        id,
                        reason: format!("stored under id {id} but carries id {}", history.id),
                    });
                }
                Ok(Some(history))
            }
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// TrieLoader
// ---------------------------------------------------------------------------

/// Produces the node set that undoes one state transition.
///
/// Reverting a transition means re-deriving the trie nodes of the parent
/// state. How that is done (replaying the original flat state through a
/// trie, or restoring recorded node values) is up to the implementation.
pub trait TrieLoader {
    /// Nodes that move the disk layer from `history.root` back to
    /// `history.parent`. Deleted nodes mark slots to clear.
    fn revert(&self, history: &StateHistory) -> Result<NodeMap>;
}

/// Reverts transitions by restoring the node values recorded in the
/// history itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct OriginLoader;

impl TrieLoader for OriginLoader {
    fn revert(&self, history: &StateHistory) -> Result<NodeMap> {
        let mut nodes = NodeMap::new();
        for origin in &history.origins {
            let node = if origin.blob.is_empty() {
                Node::deleted()
            } else {
                Node::new(origin.blob.clone())
            };
            nodes
                .entry(origin.owner)
                .or_default()
                .insert(origin.path.clone(), node);
        }
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ZERO_HASH;

    fn history(id: u64) -> StateHistory {
        StateHistory {
            id,
            root: [id as u8; 32],
            parent: [(id - 1) as u8; 32],
            block: id,
            states: StateSet::new(),
            origins: vec![
                NodeOrigin {
                    owner: ZERO_HASH,
                    path: vec![],
                    blob: b"old-root".to_vec(),
                },
                NodeOrigin {
                    owner: ZERO_HASH,
                    path: vec![0x01],
                    blob: Vec::new(),
                },
            ],
        }
    }

    #[test]
    fn write_indexes_both_roots() {
        let disk = DiskDb::open_temporary().unwrap();
        history(1).write(&disk).unwrap();

        assert_eq!(disk.read_state_id(&[1u8; 32]).unwrap(), Some(1));
        assert_eq!(disk.read_state_id(&[0u8; 32]).unwrap(), Some(0));
        assert_eq!(StateHistory::read(&disk, 1).unwrap(), Some(history(1)));
        assert_eq!(StateHistory::read(&disk, 2).unwrap(), None);
    }

    #[test]
    fn origin_loader_restores_and_deletes() {
        let nodes = OriginLoader.revert(&history(3)).unwrap();
        let account = &nodes[&ZERO_HASH];
        assert_eq!(account[&vec![]].blob, b"old-root".to_vec());
        assert!(account[&vec![0x01]].is_deleted());
    }

    #[test]
    fn incomplete_states_make_history_incomplete() {
        let mut h = history(1);
        assert!(h.is_complete());
        h.states.mark_incomplete([4u8; 32]);
        assert!(!h.is_complete());
    }
}
