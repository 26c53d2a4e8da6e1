//! Layer journal.
//!
//! On shutdown the in-memory layers (node buffer plus the diff chain up to
//! the head root) are serialized into `metadata/trie_journal`. On startup
//! the journal is loaded back if it was written on top of the same
//! persisted state; otherwise it is discarded and the database starts from
//! the persisted disk layer alone.
//!
//! The disk layer's own root runs ahead of the persisted root whenever the
//! node buffer holds transitions, so the journal records both.

use serde::{Deserialize, Serialize};

use crate::config::JOURNAL_VERSION;
use crate::disk::DiskDb;
use crate::error::Result;
use crate::triestate::StateSet;
use crate::types::{short_hex, Hash};

use super::buffer::NodeBuffer;
use super::history::NodeMap;
use super::layer::{DiffLayer, DiskLayer, DiskParams, LayerTree};

#[derive(Debug, Serialize, Deserialize)]
struct JournalDiff {
    root: Hash,
    parent: Hash,
    id: u64,
    block: u64,
    nodes: NodeMap,
    states: StateSet,
}

/// Serialized form of the layer tree.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Journal {
    version: u64,
    /// Root of the account trie actually on disk when the journal was taken.
    persisted_root: Hash,
    disk_root: Hash,
    disk_id: u64,
    buffer_layers: u64,
    buffer: NodeMap,
    diffs: Vec<JournalDiff>,
}

impl Journal {
    /// Capture the disk layer and the diff chain up to `root`, on top of
    /// the on-disk state `persisted_root`.
    pub(crate) fn capture(tree: &LayerTree, root: Hash, persisted_root: Hash) -> Result<Self> {
        let diffs = tree
            .diffs_to(root)?
            .into_iter()
            .map(|diff| JournalDiff {
                root: diff.root,
                parent: diff.parent,
                id: diff.id,
                block: diff.block,
                nodes: diff.nodes.clone(),
                states: diff.states.clone(),
            })
            .collect();
        Ok(Self {
            version: JOURNAL_VERSION,
            persisted_root,
            disk_root: tree.disk.root,
            disk_id: tree.disk.id,
            buffer_layers: tree.disk.buffer.layers,
            buffer: tree.disk.buffer.nodes.clone(),
            diffs,
        })
    }

    /// Number of diff layers captured.
    pub(crate) fn diff_count(&self) -> usize {
        self.diffs.len()
    }

    pub(crate) fn write(&self, disk: &DiskDb) -> Result<usize> {
        let encoded = bincode::serialize(self)?;
        disk.write_trie_journal(&encoded)?;
        Ok(encoded.len())
    }

    /// Load the stored journal if it sits on the persisted state
    /// `(root, id)`. Unusable journals are logged and ignored.
    pub(crate) fn load(disk: &DiskDb, root: Hash, id: u64) -> Result<Option<Self>> {
        let Some(encoded) = disk.read_trie_journal()? else {
            return Ok(None);
        };
        let journal: Self = match bincode::deserialize(&encoded) {
            Ok(journal) => journal,
            Err(err) => {
                tracing::info!(%err, "failed to decode trie journal, discarding it");
                return Ok(None);
            }
        };
        if journal.version != JOURNAL_VERSION {
            tracing::info!(
                have = journal.version,
                want = JOURNAL_VERSION,
                "trie journal version mismatch, discarding it"
            );
            return Ok(None);
        }
        // The disk layer may hold buffered transitions, so its id can run
        // ahead of the persisted one but never behind it.
        if journal.persisted_root != root || journal.disk_id < id {
            tracing::info!(
                journal = %short_hex(&journal.persisted_root),
                persisted = %short_hex(&root),
                "trie journal is not on top of the persisted state, discarding it"
            );
            return Ok(None);
        }
        Ok(Some(journal))
    }

    /// Rebuild the layer tree from this journal.
    pub(crate) fn into_tree(self, params: &DiskParams, buffer_limit: u64) -> LayerTree {
        let buffer = NodeBuffer::with_nodes(buffer_limit, self.buffer, self.buffer_layers);
        let mut tree = LayerTree::new(DiskLayer::new(params, self.disk_root, self.disk_id, buffer));
        for diff in self.diffs {
            tree.diffs.insert(
                diff.root,
                DiffLayer::new(diff.root, diff.parent, diff.id, diff.block, diff.nodes, diff.states),
            );
        }
        tree
    }
}
