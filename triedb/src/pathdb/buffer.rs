//! The node buffer sitting between the disk layer and sled.
//!
//! Flattened diff layers land here first. The buffer is written out in one
//! batch once it outgrows its byte budget, which turns many small random
//! writes into one large one.

use sled::Batch;

use crate::disk::{path_node_key, DiskDb};
use crate::error::Result;
use crate::scheme::Scheme;
use crate::trienode::Node;
use crate::types::Hash;

use super::history::NodeMap;

/// Aggregated, not-yet-persisted nodes of the disk layer.
#[derive(Debug, Clone, Default)]
pub struct NodeBuffer {
    /// Number of transitions merged in since the last flush.
    pub(crate) layers: u64,
    pub(crate) nodes: NodeMap,
    size: u64,
    limit: u64,
}

fn entry_size(path: &[u8], node: &Node) -> u64 {
    path.len() as u64 + node.blob.len() as u64
}

impl NodeBuffer {
    /// An empty buffer with a byte budget of `limit`.
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    /// A buffer restored from a journal.
    pub fn with_nodes(limit: u64, nodes: NodeMap, layers: u64) -> Self {
        let size = nodes
            .values()
            .flat_map(|subset| subset.iter())
            .map(|(path, node)| entry_size(path, node))
            .sum();
        Self {
            layers,
            nodes,
            size,
            limit,
        }
    }

    /// Look up a buffered node.
    pub fn node(&self, owner: &Hash, path: &[u8]) -> Option<&Node> {
        self.nodes.get(owner)?.get(path)
    }

    /// Merge the nodes of one flattened transition.
    pub fn commit(&mut self, nodes: NodeMap) {
        for (owner, subset) in nodes {
            let current = self.nodes.entry(owner).or_default();
            for (path, node) in subset {
                let added = entry_size(&path, &node);
                if let Some(old) = current.insert(path.clone(), node) {
                    self.size -= entry_size(&path, &old);
                }
                self.size += added;
            }
        }
        self.layers += 1;
    }

    /// Undo the most recent transition merged into the buffer by writing
    /// back its original nodes. When the buffer held a single transition it
    /// simply empties: the disk already holds the parent state.
    pub fn revert(&mut self, nodes: NodeMap) {
        self.layers = self.layers.saturating_sub(1);
        if self.layers == 0 {
            self.reset();
            return;
        }
        let layers = self.layers;
        self.commit(nodes);
        self.layers = layers;
    }

    /// Write every buffered node to disk, record `id` as the persisted state
    /// id, and empty the buffer.
    pub fn flush(&mut self, disk: &DiskDb, id: u64) -> Result<usize> {
        let mut batch = Batch::default();
        let mut count = 0;
        for (owner, subset) in &self.nodes {
            for (path, node) in subset {
                let key = path_node_key(owner, path);
                if node.is_deleted() {
                    batch.remove(key);
                } else {
                    batch.insert(key, node.blob.as_slice());
                }
                count += 1;
            }
        }
        disk.apply_path_nodes(batch)?;
        disk.write_persistent_state_id(id)?;
        disk.ensure_state_scheme(Scheme::Path)?;
        self.reset();
        Ok(count)
    }

    /// Drop all buffered nodes.
    pub fn reset(&mut self) {
        self.layers = 0;
        self.nodes.clear();
        self.size = 0;
    }

    /// Bytes held.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.layers == 0
    }

    /// Whether the buffer exceeds its budget.
    pub fn is_full(&self) -> bool {
        self.size > self.limit
    }

    /// Change the byte budget.
    pub fn set_limit(&mut self, limit: u64) {
        self.limit = limit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ZERO_HASH;

    fn nodes(entries: &[(&[u8], &[u8])]) -> NodeMap {
        let mut map = NodeMap::new();
        for (path, blob) in entries {
            let node = if blob.is_empty() {
                Node::deleted()
            } else {
                Node::new(blob.to_vec())
            };
            map.entry(ZERO_HASH).or_default().insert(path.to_vec(), node);
        }
        map
    }

    #[test]
    fn commit_replaces_and_tracks_size() {
        let mut buffer = NodeBuffer::new(1024);
        buffer.commit(nodes(&[(b"\x01", b"aaaa")]));
        assert_eq!(buffer.size(), 5);

        buffer.commit(nodes(&[(b"\x01", b"bb")]));
        assert_eq!(buffer.size(), 3);
        assert_eq!(buffer.layers, 2);
        assert_eq!(buffer.node(&ZERO_HASH, b"\x01").unwrap().blob, b"bb".to_vec());
    }

    #[test]
    fn flush_writes_and_deletes() {
        let disk = DiskDb::open_temporary().unwrap();
        let mut buffer = NodeBuffer::new(1024);
        buffer.commit(nodes(&[(b"\x01", b"keep"), (b"\x02", b"gone")]));
        buffer.flush(&disk, 1).unwrap();
        assert_eq!(disk.path_node_count(), 2);

        buffer.commit(nodes(&[(b"\x02", b"")]));
        buffer.flush(&disk, 2).unwrap();

        assert!(buffer.is_empty());
        assert_eq!(disk.read_path_node(&ZERO_HASH, b"\x01").unwrap(), Some(b"keep".to_vec()));
        assert_eq!(disk.read_path_node(&ZERO_HASH, b"\x02").unwrap(), None);
        assert_eq!(disk.read_persistent_state_id().unwrap(), 2);
        assert_eq!(disk.read_state_scheme().unwrap(), Some(Scheme::Path));
    }

    #[test]
    fn reverting_last_layer_empties_buffer() {
        let mut buffer = NodeBuffer::new(1024);
        buffer.commit(nodes(&[(b"\x01", b"a")]));
        buffer.commit(nodes(&[(b"\x01", b"b")]));

        buffer.revert(nodes(&[(b"\x01", b"a")]));
        assert_eq!(buffer.layers, 1);
        assert_eq!(buffer.node(&ZERO_HASH, b"\x01").unwrap().blob, b"a".to_vec());

        buffer.revert(nodes(&[(b"\x01", b"")]));
        assert!(buffer.is_empty());
        assert_eq!(buffer.size(), 0);
    }

    #[test]
    fn full_when_over_limit() {
        let mut buffer = NodeBuffer::new(4);
        buffer.commit(nodes(&[(b"\x01", b"abcd")]));
        assert!(buffer.is_full());
        buffer.set_limit(64);
        assert!(!buffer.is_full());
    }
}
