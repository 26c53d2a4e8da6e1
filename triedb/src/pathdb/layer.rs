//! The layer tree.
//!
//! One disk layer (persisted state plus the node buffer) sits at the
//! bottom. Every `update` stacks a diff layer keyed by its root on top of
//! an existing layer. Forks are allowed; the tree is a DAG rooted at the
//! disk layer. Capping flattens the bottom diff layers of a chain into the
//! disk layer and drops every layer that no longer descends from it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::disk::{path_node_key, DiskDb};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::trienode::Node;
use crate::triestate::StateSet;
use crate::types::{hash_node, short_hex, Hash, StorageSize};

use super::buffer::NodeBuffer;
use super::history::{NodeMap, NodeOrigin, StateHistory};

fn check_node(owner: &Hash, path: &[u8], hash: &Hash, node: &Node) -> Result<Vec<u8>> {
    if node.is_deleted() {
        return Err(Error::missing_node(owner, path, *hash));
    }
    if node.hash != *hash {
        return Err(Error::UnexpectedNode {
            owner: hex::encode(owner),
            path: hex::encode(path),
            want: *hash,
            got: node.hash,
        });
    }
    Ok(node.blob.clone())
}

// ---------------------------------------------------------------------------
// DiffLayer
// ---------------------------------------------------------------------------

/// In-memory changes of one state transition.
#[derive(Debug, Clone)]
pub struct DiffLayer {
    pub(crate) root: Hash,
    pub(crate) parent: Hash,
    pub(crate) id: u64,
    pub(crate) block: u64,
    pub(crate) nodes: NodeMap,
    pub(crate) states: StateSet,
    size: u64,
}

impl DiffLayer {
    pub(crate) fn new(
        root: Hash,
        parent: Hash,
        id: u64,
        block: u64,
        nodes: NodeMap,
        states: StateSet,
    ) -> Self {
        let size = nodes
            .values()
            .flat_map(|subset| subset.iter())
            .map(|(path, node)| path.len() as u64 + node.size())
            .sum::<u64>()
            + states.size();
        Self {
            root,
            parent,
            id,
            block,
            nodes,
            states,
            size,
        }
    }

    fn node(&self, owner: &Hash, path: &[u8]) -> Option<&Node> {
        self.nodes.get(owner)?.get(path)
    }

    /// Approximate memory held by this layer.
    pub fn size(&self) -> u64 {
        self.size
    }
}

// ---------------------------------------------------------------------------
// DiskLayer
// ---------------------------------------------------------------------------

/// The bottom layer: persisted state plus the node buffer on top of it.
pub struct DiskLayer {
    pub(crate) root: Hash,
    pub(crate) id: u64,
    pub(crate) buffer: NodeBuffer,
    disk: DiskDb,
    cleans: DashMap<Vec<u8>, Vec<u8>>,
    cleans_size: AtomicU64,
    clean_limit: u64,
    state_history: u64,
    metrics: Arc<Metrics>,
}

/// Construction parameters of a [`DiskLayer`] shared across rebuilds.
#[derive(Clone)]
pub(crate) struct DiskParams {
    pub disk: DiskDb,
    pub clean_limit: u64,
    pub state_history: u64,
    pub metrics: Arc<Metrics>,
}

impl DiskLayer {
    pub(crate) fn new(params: &DiskParams, root: Hash, id: u64, buffer: NodeBuffer) -> Self {
        Self {
            root,
            id,
            buffer,
            disk: params.disk.clone(),
            cleans: DashMap::new(),
            cleans_size: AtomicU64::new(0),
            clean_limit: params.clean_limit,
            state_history: params.state_history,
            metrics: params.metrics.clone(),
        }
    }

    fn node(&self, owner: &Hash, path: &[u8], hash: &Hash) -> Result<Vec<u8>> {
        if let Some(node) = self.buffer.node(owner, path) {
            return check_node(owner, path, hash, node);
        }
        let key = path_node_key(owner, path);
        let blob = match self.cleans.get(&key) {
            Some(blob) => blob.value().clone(),
            None => {
                let blob = self
                    .disk
                    .read_path_node(owner, path)?
                    .ok_or_else(|| Error::missing_node(owner, path, *hash))?;
                let size = (key.len() + blob.len()) as u64;
                if self.cleans_size.load(Ordering::Relaxed) + size <= self.clean_limit {
                    self.cleans_size.fetch_add(size, Ordering::Relaxed);
                    self.cleans.insert(key, blob.clone());
                }
                blob
            }
        };
        let got = hash_node(&blob);
        if got != *hash {
            return Err(Error::UnexpectedNode {
                owner: hex::encode(owner),
                path: hex::encode(path),
                want: *hash,
                got,
            });
        }
        Ok(blob)
    }

    /// Current value of a slot in the disk layer, empty when vacant.
    fn origin(&self, owner: &Hash, path: &[u8]) -> Result<Vec<u8>> {
        match self.buffer.node(owner, path) {
            Some(node) => Ok(node.blob.clone()),
            None => Ok(self.disk.read_path_node(owner, path)?.unwrap_or_default()),
        }
    }

    /// Merge `diff` into this layer, recording the state history that
    /// undoes it.
    fn commit(&mut self, diff: &DiffLayer) -> Result<()> {
        if diff.parent != self.root || diff.id != self.id + 1 {
            return Err(Error::UnexpectedHistory {
                id: diff.id,
                reason: format!(
                    "layer {} does not sit on disk layer {} (id {})",
                    short_hex(&diff.root),
                    short_hex(&self.root),
                    self.id
                ),
            });
        }
        let mut origins = Vec::new();
        for (owner, subset) in &diff.nodes {
            for path in subset.keys() {
                origins.push(NodeOrigin {
                    owner: *owner,
                    path: path.clone(),
                    blob: self.origin(owner, path)?,
                });
            }
        }
        let history = StateHistory {
            id: diff.id,
            root: diff.root,
            parent: diff.parent,
            block: diff.block,
            states: diff.states.clone(),
            origins,
        };
        history.write(&self.disk)?;
        self.metrics.path_history_writes_total.inc();

        self.buffer.commit(diff.nodes.clone());
        self.root = diff.root;
        self.id = diff.id;

        if self.buffer.is_full() {
            self.flush()?;
        }
        if self.state_history > 0 && self.id > self.state_history {
            let pruned = self.disk.truncate_history_tail(self.id - self.state_history)?;
            if pruned > 0 {
                tracing::debug!(pruned, tail = self.id - self.state_history + 1, "pruned state histories");
            }
        }
        Ok(())
    }

    /// Write the node buffer to disk and record the persisted state id.
    pub(crate) fn flush(&mut self) -> Result<()> {
        let layers = self.buffer.layers;
        let size = self.buffer.size();
        let nodes = self.buffer.flush(&self.disk, self.id)?;
        self.clear_cache();
        self.metrics.path_buffer_flushes_total.inc();
        tracing::debug!(
            id = self.id,
            layers,
            nodes,
            size = %StorageSize(size),
            "persisted node buffer"
        );
        Ok(())
    }

    /// Undo the transition recorded in `history` using the reverting
    /// `nodes`.
    pub(crate) fn revert(&mut self, history: &StateHistory, nodes: NodeMap) -> Result<()> {
        if history.root != self.root || history.id != self.id {
            return Err(Error::UnexpectedHistory {
                id: history.id,
                reason: format!(
                    "history root {} does not match disk layer {} (id {})",
                    short_hex(&history.root),
                    short_hex(&self.root),
                    self.id
                ),
            });
        }
        if !self.buffer.is_empty() {
            self.buffer.revert(nodes);
        } else {
            let mut batch = sled::Batch::default();
            for (owner, subset) in &nodes {
                for (path, node) in subset {
                    let key = path_node_key(owner, path);
                    if node.is_deleted() {
                        batch.remove(key);
                    } else {
                        batch.insert(key, node.blob.as_slice());
                    }
                }
            }
            self.disk.apply_path_nodes(batch)?;
            self.disk.write_persistent_state_id(history.id - 1)?;
        }
        self.clear_cache();
        self.root = history.parent;
        self.id = history.id - 1;
        Ok(())
    }

    pub(crate) fn clear_cache(&self) {
        self.cleans.clear();
        self.cleans_size.store(0, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// LayerTree
// ---------------------------------------------------------------------------

/// All live layers.
pub struct LayerTree {
    pub(crate) disk: DiskLayer,
    pub(crate) diffs: HashMap<Hash, DiffLayer>,
}

impl LayerTree {
    pub(crate) fn new(disk: DiskLayer) -> Self {
        Self {
            disk,
            diffs: HashMap::new(),
        }
    }

    /// Whether a layer with this root is live.
    pub fn contains(&self, root: &Hash) -> bool {
        *root == self.disk.root || self.diffs.contains_key(root)
    }

    fn id_of(&self, root: &Hash) -> Option<u64> {
        if *root == self.disk.root {
            return Some(self.disk.id);
        }
        self.diffs.get(root).map(|diff| diff.id)
    }

    /// Stack a new diff layer on top of `parent`.
    pub(crate) fn add(
        &mut self,
        root: Hash,
        parent: Hash,
        block: u64,
        nodes: NodeMap,
        states: StateSet,
    ) -> Result<()> {
        if root == parent {
            return Err(Error::LayerCycle(root));
        }
        let parent_id = self.id_of(&parent).ok_or(Error::ParentMissing(parent))?;
        if self.contains(&root) {
            tracing::debug!(root = %short_hex(&root), block, "layer already present");
            return Ok(());
        }
        self.diffs.insert(
            root,
            DiffLayer::new(root, parent, parent_id + 1, block, nodes, states),
        );
        Ok(())
    }

    /// Roots from `root` down to, but excluding, the disk layer.
    fn chain(&self, root: Hash) -> Result<Vec<Hash>> {
        let mut chain = Vec::new();
        let mut current = root;
        while current != self.disk.root {
            let diff = self
                .diffs
                .get(&current)
                .ok_or_else(|| Error::unavailable(root, "layer not found"))?;
            chain.push(current);
            current = diff.parent;
        }
        Ok(chain)
    }

    /// Keep at most `layers` diff layers below and including `root`,
    /// flattening the rest into the disk layer. `layers == 0` flattens
    /// everything and force-flushes the node buffer.
    pub(crate) fn cap(&mut self, root: Hash, layers: usize) -> Result<()> {
        let chain = self.chain(root)?;
        if layers == 0 {
            for target in chain.iter().rev() {
                self.flatten(target)?;
            }
            self.disk.flush()?;
        } else if chain.len() > layers {
            for target in chain[layers..].iter().rev() {
                self.flatten(target)?;
            }
        } else {
            return Ok(());
        }
        self.drop_stale();
        Ok(())
    }

    fn flatten(&mut self, root: &Hash) -> Result<()> {
        let diff = self
            .diffs
            .get(root)
            .ok_or_else(|| Error::unavailable(*root, "layer not found"))?;
        self.disk.commit(diff)?;
        self.diffs.remove(root);
        Ok(())
    }

    /// Drop every diff layer that no longer descends from the disk layer.
    fn drop_stale(&mut self) {
        let mut live = HashSet::from([self.disk.root]);
        loop {
            let before = live.len();
            for (root, diff) in &self.diffs {
                if live.contains(&diff.parent) {
                    live.insert(*root);
                }
            }
            if live.len() == before {
                break;
            }
        }
        let total = self.diffs.len();
        self.diffs.retain(|root, _| live.contains(root));
        let dropped = total - self.diffs.len();
        if dropped > 0 {
            tracing::debug!(dropped, "dropped stale layers");
        }
    }

    /// Read a node as seen from the state `root`.
    pub(crate) fn node(&self, root: &Hash, owner: &Hash, path: &[u8], hash: &Hash) -> Result<Vec<u8>> {
        let mut current = *root;
        loop {
            if current == self.disk.root {
                return self.disk.node(owner, path, hash);
            }
            let diff = self
                .diffs
                .get(&current)
                .ok_or_else(|| Error::unavailable(*root, "layer stale"))?;
            if let Some(node) = diff.node(owner, path) {
                return check_node(owner, path, hash, node);
            }
            current = diff.parent;
        }
    }

    /// Diff layers from the disk layer up to `root`, bottom first.
    pub(crate) fn diffs_to(&self, root: Hash) -> Result<Vec<&DiffLayer>> {
        let mut chain = self.chain(root)?;
        chain.reverse();
        Ok(chain.iter().filter_map(|r| self.diffs.get(r)).collect())
    }

    /// Memory held by diff layers and the node buffer.
    pub fn size(&self) -> u64 {
        self.diffs.values().map(DiffLayer::size).sum::<u64>() + self.disk.buffer.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EMPTY_ROOT_HASH, ZERO_HASH};

    fn params(disk: &DiskDb) -> DiskParams {
        DiskParams {
            disk: disk.clone(),
            clean_limit: 1024 * 1024,
            state_history: 0,
            metrics: Arc::new(Metrics::new()),
        }
    }

    fn tree(disk: &DiskDb) -> LayerTree {
        LayerTree::new(DiskLayer::new(
            &params(disk),
            EMPTY_ROOT_HASH,
            0,
            NodeBuffer::new(1024 * 1024),
        ))
    }

    /// A transition whose account root node is `blob`.
    fn root_nodes(blob: &[u8]) -> (Hash, NodeMap) {
        let node = Node::new(blob.to_vec());
        let root = node.hash;
        let mut nodes = NodeMap::new();
        nodes.entry(ZERO_HASH).or_default().insert(Vec::new(), node);
        (root, nodes)
    }

    #[test]
    fn add_rejects_cycles_and_orphans() {
        let disk = DiskDb::open_temporary().unwrap();
        let mut tree = tree(&disk);
        let (root, nodes) = root_nodes(b"a");

        let err = tree.add(root, root, 1, nodes.clone(), StateSet::new()).unwrap_err();
        assert!(matches!(err, Error::LayerCycle(_)));

        let err = tree.add(root, [7u8; 32], 1, nodes, StateSet::new()).unwrap_err();
        assert!(matches!(err, Error::ParentMissing(_)));
        assert!(tree.diffs.is_empty());
    }

    #[test]
    fn reads_walk_down_the_chain() {
        let disk = DiskDb::open_temporary().unwrap();
        let mut tree = tree(&disk);
        let (a, mut nodes) = root_nodes(b"a");
        let child = Node::new(b"child".to_vec());
        let child_hash = child.hash;
        nodes.get_mut(&ZERO_HASH).unwrap().insert(vec![1], child);
        tree.add(a, EMPTY_ROOT_HASH, 1, nodes, StateSet::new()).unwrap();

        let (b, nodes) = root_nodes(b"b");
        tree.add(b, a, 2, nodes, StateSet::new()).unwrap();

        assert_eq!(tree.node(&b, &ZERO_HASH, &[1], &child_hash).unwrap(), b"child".to_vec());
        assert_eq!(tree.node(&b, &ZERO_HASH, &[], &b).unwrap(), b"b".to_vec());

        let err = tree.node(&b, &ZERO_HASH, &[], &a).unwrap_err();
        assert!(matches!(err, Error::UnexpectedNode { .. }));
    }

    #[test]
    fn cap_flattens_bottom_layers_and_drops_forks() {
        let disk = DiskDb::open_temporary().unwrap();
        let mut tree = tree(&disk);
        let (a, nodes) = root_nodes(b"a");
        tree.add(a, EMPTY_ROOT_HASH, 1, nodes, StateSet::new()).unwrap();
        let (fork, nodes) = root_nodes(b"fork");
        tree.add(fork, EMPTY_ROOT_HASH, 1, nodes, StateSet::new()).unwrap();
        let (b, nodes) = root_nodes(b"b");
        tree.add(b, a, 2, nodes, StateSet::new()).unwrap();

        tree.cap(b, 1).unwrap();

        assert_eq!(tree.disk.root, a);
        assert_eq!(tree.disk.id, 1);
        assert!(tree.diffs.contains_key(&b));
        assert!(!tree.contains(&fork));
        assert_eq!(disk.read_state_id(&a).unwrap(), Some(1));
        assert_eq!(disk.read_state_id(&EMPTY_ROOT_HASH).unwrap(), Some(0));
    }

    #[test]
    fn full_cap_persists_everything() {
        let disk = DiskDb::open_temporary().unwrap();
        let mut tree = tree(&disk);
        let (a, nodes) = root_nodes(b"a");
        tree.add(a, EMPTY_ROOT_HASH, 1, nodes, StateSet::new()).unwrap();

        tree.cap(a, 0).unwrap();

        assert!(tree.diffs.is_empty());
        assert!(tree.disk.buffer.is_empty());
        assert_eq!(disk.read_path_node(&ZERO_HASH, &[]).unwrap(), Some(b"a".to_vec()));
        assert_eq!(disk.read_persistent_state_id().unwrap(), 1);
        assert_eq!(tree.node(&a, &ZERO_HASH, &[], &a).unwrap(), b"a".to_vec());
    }

    #[test]
    fn unknown_root_is_unavailable() {
        let disk = DiskDb::open_temporary().unwrap();
        let tree = tree(&disk);
        let err = tree.node(&[3u8; 32], &ZERO_HASH, &[], &[3u8; 32]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::StateUnavailable);
    }
}
