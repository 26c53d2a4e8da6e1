//! # Hash Scheme — Reference-Counted Node Store
//!
//! Trie nodes are keyed by their content hash. Freshly committed nodes sit
//! in an in-memory dirty cache, each carrying the number of live parents
//! that point at it. The caller pins the roots it still cares about
//! ([`Database::reference`]) and releases the ones it does not
//! ([`Database::dereference`]); anything whose count drops to zero is
//! garbage collected on the spot and never touches disk.
//!
//! ## Getting nodes to disk
//!
//! - [`Database::commit`] writes everything reachable from one root.
//! - [`Database::cap`] writes the *oldest* dirty nodes until memory drops
//!   below a limit.
//!
//! Both preserve the same invariant: a node is never persisted before its
//! children. Commit walks children-first; cap relies on the flush list being
//! in insertion order, and [`Database::update`] inserting children before
//! parents.
//!
//! The hash scheme never deletes from disk. Old state stays there forever,
//! which is exactly why this scheme has no rollback story.

mod config;

pub use config::{ChildResolver, Config, NoChildren};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::config::CACHED_NODE_OVERHEAD;
use crate::disk::DiskDb;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::scheme::Scheme;
use crate::trienode::MergedNodeSet;
use crate::triestate::StateSet;
use crate::types::{short_hex, Hash, StorageSize, EMPTY_ROOT_HASH, ZERO_HASH};

// ---------------------------------------------------------------------------
// Dirty node cache
// ---------------------------------------------------------------------------

/// A dirty node with its reference bookkeeping.
struct CachedNode {
    blob: Vec<u8>,
    /// Live references: parent nodes, external links and root pins.
    parents: u32,
    /// Storage trie roots this node keeps alive through account leaves.
    external: HashSet<Hash>,
    /// Position in the flush list.
    seq: u64,
}

impl CachedNode {
    fn size(&self) -> u64 {
        CACHED_NODE_OVERHEAD + self.blob.len() as u64
    }
}

#[derive(Default)]
struct Dirties {
    nodes: HashMap<Hash, CachedNode>,
    /// Insertion order, oldest first.
    flush_list: BTreeMap<u64, Hash>,
    next_seq: u64,
    /// Bytes held by dirty nodes, overhead included.
    nodes_size: u64,
    /// Bytes held by external reference links.
    children_size: u64,

    // Statistics since the last commit.
    gc_nodes: u64,
    gc_size: u64,
    flush_nodes: u64,
    flush_size: u64,
}

impl Dirties {
    fn size(&self) -> u64 {
        self.nodes_size + self.children_size
    }

    /// Unlink a node from the cache and the flush list without touching
    /// its children.
    fn remove(&mut self, hash: &Hash) -> Option<CachedNode> {
        let node = self.nodes.remove(hash)?;
        self.flush_list.remove(&node.seq);
        self.nodes_size -= node.size();
        self.children_size -= 32 * node.external.len() as u64;
        Some(node)
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// Reference-counted, hash-addressed node store.
pub struct Database {
    disk: DiskDb,
    resolver: Arc<dyn ChildResolver>,
    dirties: RwLock<Dirties>,
    cleans: DashMap<Hash, Vec<u8>>,
    cleans_size: AtomicU64,
    clean_limit: u64,
    metrics: Arc<Metrics>,
}

impl Database {
    /// Create a hash scheme backend over `disk`.
    pub fn new(disk: DiskDb, config: &Config, metrics: Arc<Metrics>) -> Self {
        Self {
            disk,
            resolver: Arc::clone(&config.resolver),
            dirties: RwLock::new(Dirties::default()),
            cleans: DashMap::new(),
            cleans_size: AtomicU64::new(0),
            clean_limit: config.clean_cache_size as u64,
            metrics,
        }
    }

    /// Always [`Scheme::Hash`].
    pub fn scheme(&self) -> Scheme {
        Scheme::Hash
    }

    /// Whether the genesis root node is already on disk.
    pub fn initialized(&self, genesis_root: Hash) -> bool {
        self.disk.has_hash_node(&genesis_root).unwrap_or(false)
    }

    /// Bytes held by dirty nodes and their reference links.
    pub fn size(&self) -> StorageSize {
        StorageSize(self.dirties.read().size())
    }

    /// Number of dirty nodes currently cached.
    pub fn dirty_count(&self) -> usize {
        self.dirties.read().nodes.len()
    }

    /// Insert the nodes of one state transition into the dirty cache.
    ///
    /// Storage tries go in before the account trie, and every trie is
    /// inserted children-first, so the flush list stays persistable in
    /// order. Deletions are ignored: the hash scheme never removes nodes.
    /// Account leaves pin the storage tries they point at.
    pub fn update(
        &self,
        root: Hash,
        parent: Hash,
        block: u64,
        mut nodes: MergedNodeSet,
        _states: StateSet,
    ) -> Result<()> {
        if parent != EMPTY_ROOT_HASH && !self.exists(&parent)? {
            tracing::error!(
                parent = %short_hex(&parent),
                root = %short_hex(&root),
                block,
                "parent state is not present"
            );
        }
        let mut dirties = self.dirties.write();
        for owner in nodes.owners_in_order() {
            let Some(mut set) = nodes.sets.remove(&owner) else {
                continue;
            };
            for (_path, node) in set.drain_children_first() {
                if node.is_deleted() {
                    continue;
                }
                self.insert(&mut dirties, node.hash, node.blob);
            }
            if owner == ZERO_HASH {
                for leaf in set.leaves {
                    if leaf.root != EMPTY_ROOT_HASH {
                        Self::reference_locked(&mut dirties, leaf.root, leaf.parent);
                    }
                }
            }
        }
        tracing::debug!(
            root = %short_hex(&root),
            block,
            dirty = dirties.nodes.len(),
            size = %StorageSize(dirties.size()),
            "inserted state transition"
        );
        Ok(())
    }

    fn insert(&self, dirties: &mut Dirties, hash: Hash, blob: Vec<u8>) {
        if dirties.nodes.contains_key(&hash) {
            return;
        }
        let mut children = Vec::new();
        self.resolver
            .for_each_child(&blob, &mut |child| children.push(child));
        for child in children {
            if let Some(node) = dirties.nodes.get_mut(&child) {
                node.parents += 1;
            }
        }
        let seq = dirties.next_seq;
        dirties.next_seq += 1;
        let node = CachedNode {
            blob,
            parents: 0,
            external: HashSet::new(),
            seq,
        };
        dirties.nodes_size += node.size();
        dirties.flush_list.insert(seq, hash);
        dirties.nodes.insert(hash, node);
    }

    /// Add a reference from `parent` to `child`. A zero `parent` pins
    /// `child` as a root. Unknown children and repeated external links are
    /// ignored.
    pub fn reference(&self, child: Hash, parent: Hash) {
        let mut dirties = self.dirties.write();
        Self::reference_locked(&mut dirties, child, parent);
    }

    fn reference_locked(dirties: &mut Dirties, child: Hash, parent: Hash) {
        if !dirties.nodes.contains_key(&child) {
            return;
        }
        if parent == ZERO_HASH {
            if let Some(node) = dirties.nodes.get_mut(&child) {
                node.parents += 1;
            }
            return;
        }
        let Some(parent_node) = dirties.nodes.get_mut(&parent) else {
            return;
        };
        if !parent_node.external.insert(child) {
            return;
        }
        dirties.children_size += 32;
        if let Some(node) = dirties.nodes.get_mut(&child) {
            node.parents += 1;
        }
    }

    /// Drop one reference from `root`, garbage collecting every dirty node
    /// whose count reaches zero.
    pub fn dereference(&self, root: Hash) {
        if root == ZERO_HASH {
            tracing::error!("attempted to dereference the trie cache meta root");
            return;
        }
        let start = Instant::now();
        let mut dirties = self.dirties.write();
        let (nodes_before, size_before) = (dirties.nodes.len(), dirties.size());

        let mut pending = vec![root];
        while let Some(hash) = pending.pop() {
            let Some(node) = dirties.nodes.get_mut(&hash) else {
                continue;
            };
            node.parents = node.parents.saturating_sub(1);
            if node.parents > 0 {
                continue;
            }
            let Some(node) = dirties.remove(&hash) else {
                continue;
            };
            pending.extend(node.external.iter().copied());
            self.resolver
                .for_each_child(&node.blob, &mut |child| pending.push(child));
        }

        let gc_nodes = (nodes_before - dirties.nodes.len()) as u64;
        let gc_size = size_before - dirties.size();
        dirties.gc_nodes += gc_nodes;
        dirties.gc_size += gc_size;
        self.metrics.hash_gc_nodes_total.inc_by(gc_nodes);

        tracing::debug!(
            root = %short_hex(&root),
            nodes = gc_nodes,
            size = %StorageSize(gc_size),
            elapsed = ?start.elapsed(),
            livenodes = dirties.nodes.len(),
            livesize = %StorageSize(dirties.size()),
            "dereferenced trie from memory database"
        );
    }

    /// Flush the oldest dirty nodes to disk until the dirty cache is at or
    /// below `limit` bytes.
    pub fn cap(&self, limit: StorageSize) -> Result<()> {
        let start = Instant::now();
        let mut dirties = self.dirties.write();
        let mut size = dirties.size();
        if size <= limit.bytes() {
            return Ok(());
        }

        let mut batch = Vec::new();
        for hash in dirties.flush_list.values() {
            if size <= limit.bytes() {
                break;
            }
            if let Some(node) = dirties.nodes.get(hash) {
                batch.push((*hash, node.blob.clone()));
                size = size.saturating_sub(node.size() + 32 * node.external.len() as u64);
            }
        }
        self.disk.write_hash_nodes(&batch)?;
        self.disk.ensure_state_scheme(Scheme::Hash)?;

        let mut flushed_size = 0;
        for (hash, blob) in batch.iter() {
            if let Some(node) = dirties.remove(hash) {
                flushed_size += node.size();
            }
            self.cache_clean(*hash, blob.clone());
        }
        dirties.flush_nodes += batch.len() as u64;
        dirties.flush_size += flushed_size;
        self.metrics.hash_flush_nodes_total.inc_by(batch.len() as u64);

        tracing::debug!(
            nodes = batch.len(),
            size = %StorageSize(flushed_size),
            elapsed = ?start.elapsed(),
            livenodes = dirties.nodes.len(),
            livesize = %StorageSize(dirties.size()),
            "persisted nodes from memory database"
        );
        Ok(())
    }

    /// Persist every dirty node reachable from `root`, children first, and
    /// drop them from the dirty cache. Committing a root that has no dirty
    /// nodes writes nothing.
    pub fn commit(&self, root: Hash, report: bool) -> Result<()> {
        let start = Instant::now();
        let mut dirties = self.dirties.write();

        let batch = self.collect_reachable(&dirties, root);
        self.disk.write_hash_nodes(&batch)?;
        self.disk.ensure_state_scheme(Scheme::Hash)?;

        let mut committed_size = 0;
        for (hash, blob) in batch.iter() {
            if let Some(node) = dirties.remove(hash) {
                committed_size += node.size();
            }
            self.cache_clean(*hash, blob.clone());
        }
        self.metrics.hash_commit_nodes_total.inc_by(batch.len() as u64);

        let nodes = batch.len();
        let size = StorageSize(committed_size);
        let elapsed = start.elapsed();
        let (gcnodes, gcsize) = (dirties.gc_nodes, StorageSize(dirties.gc_size));
        let (flushnodes, flushsize) = (dirties.flush_nodes, StorageSize(dirties.flush_size));
        let (livenodes, livesize) = (dirties.nodes.len(), StorageSize(dirties.size()));
        if report {
            tracing::info!(
                root = %short_hex(&root), nodes, %size, ?elapsed,
                gcnodes, %gcsize, flushnodes, %flushsize, livenodes, %livesize,
                "persisted trie from memory database"
            );
        } else {
            tracing::debug!(
                root = %short_hex(&root), nodes, %size, ?elapsed,
                gcnodes, %gcsize, flushnodes, %flushsize, livenodes, %livesize,
                "persisted trie from memory database"
            );
        }

        dirties.gc_nodes = 0;
        dirties.gc_size = 0;
        dirties.flush_nodes = 0;
        dirties.flush_size = 0;
        Ok(())
    }

    /// Post-order walk of the dirty nodes reachable from `root`.
    fn collect_reachable(&self, dirties: &Dirties, root: Hash) -> Vec<(Hash, Vec<u8>)> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        // (hash, children already expanded)
        let mut stack = vec![(root, false)];
        while let Some((hash, expanded)) = stack.pop() {
            let Some(node) = dirties.nodes.get(&hash) else {
                continue;
            };
            if expanded {
                out.push((hash, node.blob.clone()));
                continue;
            }
            if !visited.insert(hash) {
                continue;
            }
            stack.push((hash, true));
            for child in node.external.iter() {
                stack.push((*child, false));
            }
            self.resolver
                .for_each_child(&node.blob, &mut |child| stack.push((child, false)));
        }
        out
    }

    /// Retrieve an encoded node by hash from the dirty cache, the clean
    /// cache or disk. `Ok(None)` when it exists nowhere.
    pub fn node(&self, hash: &Hash) -> Result<Option<Vec<u8>>> {
        if *hash == ZERO_HASH {
            return Ok(None);
        }
        if let Some(blob) = self.cleans.get(hash) {
            return Ok(Some(blob.value().clone()));
        }
        if let Some(node) = self.dirties.read().nodes.get(hash) {
            return Ok(Some(node.blob.clone()));
        }
        match self.disk.read_hash_node(hash)? {
            Some(blob) => {
                self.cache_clean(*hash, blob.clone());
                Ok(Some(blob))
            }
            None => Ok(None),
        }
    }

    fn exists(&self, hash: &Hash) -> Result<bool> {
        if self.cleans.contains_key(hash) || self.dirties.read().nodes.contains_key(hash) {
            return Ok(true);
        }
        self.disk.has_hash_node(hash)
    }

    fn cache_clean(&self, hash: Hash, blob: Vec<u8>) {
        if self.clean_limit == 0 {
            return;
        }
        let len = 32 + blob.len() as u64;
        if self.cleans_size.load(Ordering::Relaxed) + len > self.clean_limit {
            self.cleans.clear();
            self.cleans_size.store(0, Ordering::Relaxed);
        }
        if self.cleans.insert(hash, blob).is_none() {
            self.cleans_size.fetch_add(len, Ordering::Relaxed);
        }
    }

    /// Open a reader for the state identified by `root`. Fails with
    /// [`Error::StateUnavailable`] unless the root node is retrievable.
    pub fn reader(self: &Arc<Self>, root: Hash) -> Result<Reader> {
        if root != EMPTY_ROOT_HASH && self.node(&root)?.is_none() {
            return Err(Error::unavailable(root, "root node not found"));
        }
        Ok(Reader {
            db: Arc::clone(self),
            root,
        })
    }

    /// Drop cached clean nodes and sync the disk.
    pub fn close(&self) -> Result<()> {
        self.cleans.clear();
        self.cleans_size.store(0, Ordering::Relaxed);
        self.disk.flush()
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Node reader over the hash scheme. Owners and paths are irrelevant here;
/// nodes are found by hash alone.
#[derive(Clone)]
pub struct Reader {
    db: Arc<Database>,
    root: Hash,
}

impl Reader {
    /// The state root this reader was opened for.
    pub fn root(&self) -> Hash {
        self.root
    }

    /// Retrieve the node with `hash`.
    pub fn node(&self, owner: &Hash, path: &[u8], hash: &Hash) -> Result<Vec<u8>> {
        self.db
            .node(hash)?
            .ok_or_else(|| Error::missing_node(owner, path, *hash))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
