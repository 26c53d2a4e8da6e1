//! # Database Facade
//!
//! One handle over whichever node store the resolver picked. Operations
//! every backend supports are forwarded as-is; scheme-specific operations
//! match on the backend and fail with [`Error::UnsupportedOperation`] when
//! the active scheme does not offer them. Callers that want to branch
//! rather than fail should check [`Database::scheme`] first.
//!
//! The facade also owns the optional preimage store and keeps its flushes
//! ordered before every backend persistence step, so preimages may run
//! ahead of committed nodes on disk but never behind them.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::disk::DiskDb;
use crate::error::{Error, Result};
use crate::hashdb;
use crate::metrics::Metrics;
use crate::pathdb::{self, OriginLoader, TrieLoader};
use crate::preimage::PreimageStore;
use crate::resolver::{self, SchemeMismatch};
use crate::scheme::Scheme;
use crate::trienode::MergedNodeSet;
use crate::triestate::StateSet;
use crate::types::{Hash, StorageSize};

/// The active node store. Fixed for the lifetime of a [`Database`].
enum Backend {
    Hash(Arc<hashdb::Database>),
    Path(Arc<pathdb::Database>),
}

impl Backend {
    fn scheme(&self) -> Scheme {
        match self {
            Backend::Hash(db) => db.scheme(),
            Backend::Path(db) => db.scheme(),
        }
    }

    fn hash(&self, operation: &'static str) -> Result<&Arc<hashdb::Database>> {
        match self {
            Backend::Hash(db) => Ok(db),
            Backend::Path(_) => Err(Error::unsupported(operation, Scheme::Path)),
        }
    }

    fn path(&self, operation: &'static str) -> Result<&Arc<pathdb::Database>> {
        match self {
            Backend::Path(db) => Ok(db),
            Backend::Hash(_) => Err(Error::unsupported(operation, Scheme::Hash)),
        }
    }
}

/// Read handle bound to one state root.
pub enum Reader {
    /// Reader over the hash scheme.
    Hash(hashdb::Reader),
    /// Reader over the path scheme.
    Path(pathdb::Reader),
}

impl Reader {
    /// The state root this reader was opened for.
    pub fn root(&self) -> Hash {
        match self {
            Reader::Hash(reader) => reader.root(),
            Reader::Path(reader) => reader.root(),
        }
    }

    /// Retrieve the node at `path` in the trie of `owner` with `hash`. The
    /// hash scheme looks nodes up by `hash` alone; the path scheme looks
    /// them up by location and verifies the hash.
    pub fn node(&self, owner: &Hash, path: &[u8], hash: &Hash) -> Result<Vec<u8>> {
        match self {
            Reader::Hash(reader) => reader.node(owner, path, hash),
            Reader::Path(reader) => reader.node(owner, path, hash),
        }
    }
}

/// The trie node database.
pub struct Database {
    config: Config,
    disk: DiskDb,
    preimages: Option<PreimageStore>,
    backend: Backend,
    mismatch: Option<SchemeMismatch>,
    metrics: Arc<Metrics>,
}

impl Database {
    /// Open the database on `disk`. With `config == None` the scheme
    /// recorded on disk is used, or the hash scheme for an empty disk.
    pub fn new(disk: DiskDb, config: Option<Config>) -> Result<Self> {
        let recorded = disk.read_state_scheme()?;
        let resolution = resolver::resolve(config, recorded)?;
        let config = resolution.config;
        let metrics = Arc::new(Metrics::new());

        let preimages = config
            .preimages
            .then(|| PreimageStore::new(disk.clone(), metrics.clone()));

        let backend = match resolution.scheme {
            Scheme::Hash => {
                let settings = config.hash_db.clone().unwrap_or_default();
                Backend::Hash(Arc::new(hashdb::Database::new(disk.clone(), &settings, metrics.clone())))
            }
            Scheme::Path => {
                let settings = config.path_db.clone().unwrap_or_default();
                Backend::Path(Arc::new(pathdb::Database::new(disk.clone(), &settings, metrics.clone())?))
            }
        };
        tracing::debug!(
            scheme = %resolution.scheme,
            recorded = ?recorded,
            preimages = config.preimages,
            "opened trie database"
        );

        Ok(Self {
            config,
            disk,
            preimages,
            backend,
            mismatch: resolution.mismatch,
            metrics,
        })
    }

    /// The resolved configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The disk handle the database was opened on.
    pub fn disk(&self) -> &DiskDb {
        &self.disk
    }

    /// Metric handles of this database.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Scheme selected at open time and the mismatch, if any, between it
    /// and the scheme recorded on disk.
    pub fn resolution(&self) -> (Scheme, Option<SchemeMismatch>) {
        (self.backend.scheme(), self.mismatch)
    }

    /// The active scheme.
    pub fn scheme(&self) -> Scheme {
        self.backend.scheme()
    }

    /// Whether committed state consistent with the active scheme exists.
    pub fn initialized(&self, genesis_root: Hash) -> bool {
        match &self.backend {
            Backend::Hash(db) => db.initialized(genesis_root),
            Backend::Path(db) => db.initialized(genesis_root),
        }
    }

    /// Memory used by dirty nodes and by pending preimages.
    pub fn size(&self) -> (StorageSize, StorageSize) {
        let nodes = match &self.backend {
            Backend::Hash(db) => db.size(),
            Backend::Path(db) => db.size(),
        };
        let preimages = self
            .preimages
            .as_ref()
            .map(PreimageStore::size)
            .unwrap_or(StorageSize::ZERO);
        (nodes, preimages)
    }

    /// Open a reader on the state `root`.
    pub fn reader(&self, root: Hash) -> Result<Reader> {
        match &self.backend {
            Backend::Hash(db) => db.reader(root).map(Reader::Hash),
            Backend::Path(db) => db.reader(root).map(Reader::Path),
        }
    }

    /// Apply the transition `parent → root`.
    ///
    /// The commit hook sees `states` first. Pending preimages are flushed
    /// if they have grown past the threshold; a failure there is logged and
    /// retried at the next forced flush. The sets are then handed to the
    /// backend.
    pub fn update(
        &self,
        root: Hash,
        parent: Hash,
        block: u64,
        nodes: MergedNodeSet,
        states: StateSet,
    ) -> Result<()> {
        if let Some(hook) = &self.config.on_commit {
            hook(&states);
        }
        if let Some(preimages) = &self.preimages {
            if let Err(err) = preimages.flush(false) {
                tracing::warn!(%err, block, "failed to flush preimages");
            }
        }
        match &self.backend {
            Backend::Hash(db) => db.update(root, parent, block, nodes, states),
            Backend::Path(db) => db.update(root, parent, block, nodes, states),
        }
    }

    /// Persist the state `root`, preimages first.
    pub fn commit(&self, root: Hash, report: bool) -> Result<()> {
        self.write_preimages()?;
        match &self.backend {
            Backend::Hash(db) => db.commit(root, report)?,
            Backend::Path(db) => db.commit(root, report)?,
        }
        self.metrics.commits_total.inc();
        Ok(())
    }

    /// Flush preimages and release the backend. The backend is closed even
    /// when the flush fails; if both fail, both errors are returned.
    pub fn close(&self) -> Result<()> {
        close_in_order(
            || self.write_preimages(),
            || match &self.backend {
                Backend::Hash(db) => db.close(),
                Backend::Path(db) => db.close(),
            },
        )
    }

    // -- Preimages ------------------------------------------------------------

    /// Force-flush pending preimages. A no-op when recording is disabled.
    pub fn write_preimages(&self) -> Result<()> {
        match &self.preimages {
            Some(preimages) => preimages.flush(true),
            None => Ok(()),
        }
    }

    /// Record preimages of hashed keys. Ignored when recording is disabled.
    pub fn insert_preimage(&self, preimages: HashMap<Hash, Vec<u8>>) {
        if let Some(store) = &self.preimages {
            store.insert_preimages(preimages);
        }
    }

    /// Look up the preimage of `hash`. Always `None` when recording is
    /// disabled.
    pub fn preimage(&self, hash: &Hash) -> Result<Option<Vec<u8>>> {
        match &self.preimages {
            Some(store) => store.preimage(hash),
            None => Ok(None),
        }
    }

    // -- Hash scheme only -------------------------------------------------------

    /// Flush the oldest dirty nodes until memory use drops to `limit`.
    pub fn cap(&self, limit: StorageSize) -> Result<()> {
        let db = self.backend.hash("cap")?;
        self.write_preimages()?;
        db.cap(limit)
    }

    /// Record that `parent` references `root`.
    pub fn reference(&self, root: Hash, parent: Hash) -> Result<()> {
        self.backend.hash("reference")?.reference(root, parent);
        Ok(())
    }

    /// Drop one reference to `root`, collecting it when none remain.
    pub fn dereference(&self, root: Hash) -> Result<()> {
        self.backend.hash("dereference")?.dereference(root);
        Ok(())
    }

    /// The encoded node with `hash`, or `None` if it is not stored.
    pub fn node(&self, hash: &Hash) -> Result<Option<Vec<u8>>> {
        self.backend.hash("node")?.node(hash)
    }

    // -- Path scheme only -------------------------------------------------------

    /// Roll persisted state back to `target`, rebuilding nodes from the
    /// recorded histories.
    pub fn recover(&self, target: Hash) -> Result<()> {
        self.recover_with(target, &OriginLoader)
    }

    /// Roll persisted state back to `target` using a custom loader.
    pub fn recover_with(&self, target: Hash, loader: &dyn TrieLoader) -> Result<()> {
        self.backend.path("recover")?.recover(target, loader)
    }

    /// Whether `root` is a valid [`Database::recover`] target.
    pub fn recoverable(&self, root: Hash) -> Result<bool> {
        self.backend.path("recoverable")?.recoverable(root)
    }

    /// Discard every layer, the journal and all histories, restarting from
    /// `root`.
    pub fn reset(&self, root: Hash) -> Result<()> {
        self.backend.path("reset")?.reset(root)
    }

    /// Persist the in-memory layers up to `root` for the next start.
    pub fn journal(&self, root: Hash) -> Result<()> {
        self.backend.path("journal")?.journal(root)
    }

    /// Change the node buffer budget.
    pub fn set_buffer_size(&self, size: usize) -> Result<()> {
        self.backend.path("set_buffer_size")?.set_buffer_size(size)
    }
}

/// Run `flush` then `close`, always running both, and report every failure.
fn close_in_order<F, C>(flush: F, close: C) -> Result<()>
where
    F: FnOnce() -> Result<()>,
    C: FnOnce() -> Result<()>,
{
    let flushed = flush();
    let closed = close();
    match (flushed, closed) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
        (Err(preimages), Err(backend)) => {
            tracing::error!(%preimages, %backend, "failed to close trie database");
            Err(Error::Close {
                preimages: Box::new(preimages),
                backend: Box::new(backend),
            })
        }
    }
}
