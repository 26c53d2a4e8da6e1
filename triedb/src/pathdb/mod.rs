//! # Journaled Node Store
//!
//! Path-addressed backend. Nodes are stored under `owner ‖ path`, so each
//! slot holds only the latest version and stale nodes never accumulate on
//! disk. Recent state transitions live in memory as diff layers stacked on
//! a single disk layer; the bottom ones are flattened into a node buffer
//! as the stack grows, and every flattening leaves behind a reverse diff
//! (state history) that lets the disk layer be rolled back.
//!
//! ```text
//!   diff(head) ─ diff ─ ... ─ diff ─┐
//!                        diff(fork) ┴─ disk layer ── node buffer ── sled
//! ```

mod buffer;
mod history;
mod journal;
mod layer;

pub use history::{NodeMap, NodeOrigin, OriginLoader, StateHistory, TrieLoader};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::config::{
    DEFAULT_BUFFER_SIZE, DEFAULT_CLEAN_CACHE_SIZE, DEFAULT_STATE_HISTORY, MAX_BUFFER_SIZE,
    MAX_DIFF_LAYERS,
};
use crate::disk::DiskDb;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::scheme::Scheme;
use crate::trienode::MergedNodeSet;
use crate::triestate::StateSet;
use crate::types::{hash_node, short_hex, Hash, StorageSize, EMPTY_ROOT_HASH, ZERO_HASH};

use buffer::NodeBuffer;
use journal::Journal;
use layer::{DiskLayer, DiskParams, LayerTree};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Path scheme settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of recent state histories kept for rollback. Zero keeps all.
    pub state_history: u64,
    /// Byte budget of the clean node cache.
    pub clean_cache_size: usize,
    /// Byte budget of the node buffer. Capped at [`MAX_BUFFER_SIZE`].
    pub dirty_cache_size: usize,
    /// Open without permitting any mutation.
    pub read_only: bool,
}

impl Config {
    /// Default settings: 90 000 histories, 16 MiB clean cache, 64 MiB
    /// node buffer.
    pub fn defaults() -> Self {
        Self {
            state_history: DEFAULT_STATE_HISTORY,
            clean_cache_size: DEFAULT_CLEAN_CACHE_SIZE,
            dirty_cache_size: DEFAULT_BUFFER_SIZE,
            read_only: false,
        }
    }

    /// Open with mutation enabled or disabled.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::defaults()
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// The journaled backend.
pub struct Database {
    disk: DiskDb,
    config: Config,
    params: DiskParams,
    tree: RwLock<LayerTree>,
    read_only: AtomicBool,
    metrics: Arc<Metrics>,
}

impl Database {
    /// Open the backend on `disk`, restoring journaled layers when the
    /// journal matches the persisted state.
    pub fn new(disk: DiskDb, config: &Config, metrics: Arc<Metrics>) -> Result<Self> {
        let mut config = config.clone();
        if config.dirty_cache_size > MAX_BUFFER_SIZE {
            tracing::info!(
                provided = %StorageSize::from(config.dirty_cache_size),
                updated = %StorageSize::from(MAX_BUFFER_SIZE),
                "capped node buffer size"
            );
            config.dirty_cache_size = MAX_BUFFER_SIZE;
        }
        let params = DiskParams {
            disk: disk.clone(),
            clean_limit: config.clean_cache_size as u64,
            state_history: config.state_history,
            metrics: metrics.clone(),
        };
        let buffer_limit = config.dirty_cache_size as u64;

        let root = Self::persisted_root(&disk)?;
        let id = disk.read_persistent_state_id()?;
        let tree = match Journal::load(&disk, root, id)? {
            Some(journal) => {
                let layers = journal.diff_count();
                let tree = journal.into_tree(&params, buffer_limit);
                tracing::info!(
                    root = %short_hex(&tree.disk.root),
                    id = tree.disk.id,
                    layers,
                    "loaded trie journal"
                );
                tree
            }
            None => LayerTree::new(DiskLayer::new(&params, root, id, NodeBuffer::new(buffer_limit))),
        };

        if !config.read_only {
            // Histories beyond the disk layer were written for transitions
            // that never reached a flush or a journal.
            let dropped = disk.truncate_history_head(tree.disk.id)?;
            if dropped > 0 {
                tracing::warn!(dropped, head = tree.disk.id, "truncated dangling state histories");
            }
        }
        metrics.path_diff_layers.set(tree.diffs.len() as i64);

        Ok(Self {
            disk,
            read_only: AtomicBool::new(config.read_only),
            config,
            params,
            tree: RwLock::new(tree),
            metrics,
        })
    }

    /// Root committed on disk, derived from the persisted account trie
    /// root node.
    fn persisted_root(disk: &DiskDb) -> Result<Hash> {
        Ok(disk
            .read_path_node(&ZERO_HASH, &[])?
            .map(|blob| hash_node(&blob))
            .unwrap_or(EMPTY_ROOT_HASH))
    }

    fn modify_allowed(&self) -> Result<()> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Always [`Scheme::Path`].
    pub fn scheme(&self) -> Scheme {
        Scheme::Path
    }

    /// Settings this backend was opened with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether any non-empty state is present.
    pub fn initialized(&self, _genesis_root: Hash) -> bool {
        let tree = self.tree.read();
        tree.disk.root != EMPTY_ROOT_HASH || tree.diffs.keys().any(|root| *root != EMPTY_ROOT_HASH)
    }

    /// Memory held by diff layers and the node buffer.
    pub fn size(&self) -> StorageSize {
        StorageSize(self.tree.read().size())
    }

    /// Number of live diff layers.
    pub fn layer_count(&self) -> usize {
        self.tree.read().diffs.len()
    }

    /// Root and state id of the disk layer.
    pub fn disk_layer(&self) -> (Hash, u64) {
        let tree = self.tree.read();
        (tree.disk.root, tree.disk.id)
    }

    /// Stack the transition `parent → root` and cap the tree.
    pub fn update(
        &self,
        root: Hash,
        parent: Hash,
        block: u64,
        nodes: MergedNodeSet,
        states: StateSet,
    ) -> Result<()> {
        self.modify_allowed()?;
        let mut tree = self.tree.write();
        tree.add(root, parent, block, nodes.flatten(), states)?;
        let result = tree.cap(root, MAX_DIFF_LAYERS);
        self.metrics.path_diff_layers.set(tree.diffs.len() as i64);
        result
    }

    /// Flatten every layer down to `root` into disk and flush.
    pub fn commit(&self, root: Hash, report: bool) -> Result<()> {
        self.modify_allowed()?;
        let start = Instant::now();
        let mut tree = self.tree.write();
        let result = tree.cap(root, 0);
        self.metrics.path_diff_layers.set(tree.diffs.len() as i64);
        result?;
        let elapsed = start.elapsed();
        if report {
            tracing::info!(root = %short_hex(&root), id = tree.disk.id, ?elapsed, "persisted trie layers");
        } else {
            tracing::debug!(root = %short_hex(&root), id = tree.disk.id, ?elapsed, "persisted trie layers");
        }
        Ok(())
    }

    /// Open a reader on the layer with `root`.
    pub fn reader(self: &Arc<Self>, root: Hash) -> Result<Reader> {
        if !self.tree.read().contains(&root) {
            return Err(Error::unavailable(root, "layer not found"));
        }
        Ok(Reader {
            db: Arc::clone(self),
            root,
        })
    }

    /// Persist the in-memory layers up to `root` and stop accepting
    /// mutations.
    pub fn journal(&self, root: Hash) -> Result<()> {
        let tree = self.tree.read();
        if !tree.contains(&root) {
            return Err(Error::unavailable(root, "layer not found"));
        }
        self.modify_allowed()?;
        let start = Instant::now();
        let journal = Journal::capture(&tree, root, Self::persisted_root(&self.disk)?)?;
        let size = journal.write(&self.disk)?;
        self.disk.ensure_state_scheme(Scheme::Path)?;
        self.disk.flush()?;
        self.read_only.store(true, Ordering::Release);
        tracing::info!(
            root = %short_hex(&root),
            layers = journal.diff_count(),
            size = %StorageSize::from(size),
            elapsed = ?start.elapsed(),
            "persisted dirty state to disk"
        );
        Ok(())
    }

    /// Whether the disk layer can be rolled back to `root`.
    pub fn recoverable(&self, root: Hash) -> Result<bool> {
        if self.read_only.load(Ordering::Acquire) {
            return Ok(false);
        }
        let disk_id = self.tree.read().disk.id;
        self.recoverable_at(root, disk_id)
    }

    fn recoverable_at(&self, root: Hash, disk_id: u64) -> Result<bool> {
        let Some(id) = self.disk.read_state_id(&root)? else {
            return Ok(false);
        };
        if id >= disk_id {
            return Ok(false);
        }
        for next in id + 1..=disk_id {
            match StateHistory::read(&self.disk, next)? {
                Some(history) if history.is_complete() => {
                    if next == id + 1 && history.parent != root {
                        return Ok(false);
                    }
                }
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Roll the disk layer back to `root`, reverting one state history at
    /// a time with `loader`. All diff layers are discarded.
    pub fn recover(&self, root: Hash, loader: &dyn TrieLoader) -> Result<()> {
        self.modify_allowed()?;
        let start = Instant::now();
        let mut tree = self.tree.write();
        if !self.recoverable_at(root, tree.disk.id)? {
            return Err(Error::Unrecoverable(root));
        }
        tree.diffs.clear();
        self.metrics.path_diff_layers.set(0);

        while tree.disk.root != root {
            let id = tree.disk.id;
            let history = StateHistory::read(&self.disk, id)?.ok_or_else(|| Error::UnexpectedHistory {
                id,
                reason: "history is missing".into(),
            })?;
            let nodes = loader.revert(&history)?;
            tree.disk.revert(&history, nodes)?;
            self.disk.truncate_history_head(tree.disk.id)?;
            self.disk.delete_state_id(&history.root)?;
        }
        self.disk.delete_trie_journal()?;
        tracing::info!(
            root = %short_hex(&root),
            id = tree.disk.id,
            elapsed = ?start.elapsed(),
            "recovered state"
        );
        Ok(())
    }

    /// Drop every layer, the journal and all histories, and restart from
    /// `root` as a fresh disk layer at state id zero.
    pub fn reset(&self, root: Hash) -> Result<()> {
        self.modify_allowed()?;
        let mut tree = self.tree.write();
        if root == EMPTY_ROOT_HASH {
            self.disk.wipe_path_nodes()?;
        } else {
            let local = Self::persisted_root(&self.disk)?;
            if local != root {
                return Err(Error::ResetMismatch {
                    local,
                    target: root,
                });
            }
        }
        self.disk.delete_trie_journal()?;
        self.disk.write_persistent_state_id(0)?;
        self.disk.wipe_state_histories()?;

        tree.disk.clear_cache();
        let buffer = NodeBuffer::new(self.config.dirty_cache_size as u64);
        *tree = LayerTree::new(DiskLayer::new(&self.params, root, 0, buffer));
        self.metrics.path_diff_layers.set(0);
        tracing::info!(root = %short_hex(&root), "rebuilt trie database");
        Ok(())
    }

    /// Change the node buffer budget, flushing if it is now exceeded.
    pub fn set_buffer_size(&self, size: usize) -> Result<()> {
        let size = if size > MAX_BUFFER_SIZE {
            tracing::info!(
                provided = %StorageSize::from(size),
                updated = %StorageSize::from(MAX_BUFFER_SIZE),
                "capped node buffer size"
            );
            MAX_BUFFER_SIZE
        } else {
            size
        };
        let mut tree = self.tree.write();
        tree.disk.buffer.set_limit(size as u64);
        if tree.disk.buffer.is_full() {
            tree.disk.flush()?;
        }
        Ok(())
    }

    /// Stop accepting mutations and release caches.
    pub fn close(&self) -> Result<()> {
        self.read_only.store(true, Ordering::Release);
        self.tree.read().disk.clear_cache();
        self.disk.flush()
    }

    fn node(&self, root: &Hash, owner: &Hash, path: &[u8], hash: &Hash) -> Result<Vec<u8>> {
        self.tree.read().node(root, owner, path, hash)
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Node reader bound to one layer.
pub struct Reader {
    db: Arc<Database>,
    root: Hash,
}

impl Reader {
    /// The state root this reader was opened for.
    pub fn root(&self) -> Hash {
        self.root
    }

    /// Retrieve the node at `path` in the trie of `owner`, verifying that
    /// it hashes to `hash`.
    pub fn node(&self, owner: &Hash, path: &[u8], hash: &Hash) -> Result<Vec<u8>> {
        self.db.node(&self.root, owner, path, hash)
    }
}
