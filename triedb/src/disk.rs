//! # DiskDb — Persistent Node Storage
//!
//! The durable key-value store underneath both node backends, built on
//! sled's embedded database. The facade itself only ever reads one key from
//! here (the recorded state scheme); everything else belongs to a backend.
//!
//! ## Tree Layout
//!
//! | Tree            | Key                       | Value                    |
//! |-----------------|---------------------------|--------------------------|
//! | `hash_nodes`    | `hash` (32B)              | node blob                |
//! | `path_nodes`    | `owner` (32B) ‖ `path`    | node blob                |
//! | `preimages`     | `hash` (32B)              | preimage bytes           |
//! | `state_history` | `id` (8B BE)              | `bincode(StateHistory)`  |
//! | `state_ids`     | `root` (32B)              | `id` (8B BE)             |
//! | `metadata`      | key (UTF-8)               | value (bytes)            |
//!
//! History ids are big-endian so that sled's lexicographic order matches
//! numeric order, which makes head and tail truncation plain range scans.

use std::path::Path;

use sled::{Batch, Db, Tree};

use crate::error::{Error, Result};
use crate::scheme::Scheme;
use crate::types::Hash;

// ---------------------------------------------------------------------------
// Metadata Keys
// ---------------------------------------------------------------------------

/// The scheme the database was first written with.
const META_STATE_SCHEME: &[u8] = b"state_scheme";

/// State id of the path scheme's persisted disk layer.
const META_PERSISTENT_STATE_ID: &[u8] = b"persistent_state_id";

/// Serialized in-memory layer hierarchy of the path scheme.
const META_TRIE_JOURNAL: &[u8] = b"trie_journal";

/// Build the `path_nodes` key of a node.
pub fn path_node_key(owner: &Hash, path: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + path.len());
    key.extend_from_slice(owner);
    key.extend_from_slice(path);
    key
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Serialization("invalid u64 bytes".to_string()))?;
    Ok(u64::from_be_bytes(arr))
}

// ---------------------------------------------------------------------------
// DiskDb
// ---------------------------------------------------------------------------

/// Persistent storage handle shared by the facade and its backend.
///
/// Cloning is cheap: sled handles are reference counted, and all trees
/// support concurrent readers with serialized writers.
#[derive(Debug, Clone)]
pub struct DiskDb {
    db: Db,
    hash_nodes: Tree,
    path_nodes: Tree,
    preimages: Tree,
    state_history: Tree,
    state_ids: Tree,
    metadata: Tree,
}

impl DiskDb {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Create a throwaway database that is removed when dropped.
    pub fn open_temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        Ok(Self {
            hash_nodes: db.open_tree("hash_nodes")?,
            path_nodes: db.open_tree("path_nodes")?,
            preimages: db.open_tree("preimages")?,
            state_history: db.open_tree("state_history")?,
            state_ids: db.open_tree("state_ids")?,
            metadata: db.open_tree("metadata")?,
            db,
        })
    }

    // -- Scheme marker ------------------------------------------------------

    /// The scheme recorded on disk, or `None` for a database nothing has
    /// been persisted to yet. An unrecognised tag is treated as absent.
    pub fn read_state_scheme(&self) -> Result<Option<Scheme>> {
        Ok(self
            .metadata
            .get(META_STATE_SCHEME)?
            .and_then(|tag| Scheme::from_tag(&tag)))
    }

    /// Record `scheme` unless a scheme is already recorded. Returns the
    /// scheme that is recorded afterwards, which differs from `scheme` when
    /// the database was first written under the other one.
    pub fn ensure_state_scheme(&self, scheme: Scheme) -> Result<Scheme> {
        match self.metadata.compare_and_swap(
            META_STATE_SCHEME,
            None as Option<&[u8]>,
            Some(scheme.as_str().as_bytes()),
        )? {
            Ok(()) => Ok(scheme),
            Err(existing) => Ok(existing
                .current
                .and_then(|tag| Scheme::from_tag(&tag))
                .unwrap_or(scheme)),
        }
    }

    // -- Hash-addressed nodes -----------------------------------------------

    /// Read a node by content hash.
    pub fn read_hash_node(&self, hash: &Hash) -> Result<Option<Vec<u8>>> {
        Ok(self.hash_nodes.get(hash)?.map(|v| v.to_vec()))
    }

    /// Whether a node with this hash is persisted.
    pub fn has_hash_node(&self, hash: &Hash) -> Result<bool> {
        Ok(self.hash_nodes.contains_key(hash)?)
    }

    /// Write a batch of hash-addressed nodes atomically.
    pub fn write_hash_nodes(&self, nodes: &[(Hash, Vec<u8>)]) -> Result<()> {
        let mut batch = Batch::default();
        for (hash, blob) in nodes {
            batch.insert(hash.as_slice(), blob.as_slice());
        }
        self.hash_nodes.apply_batch(batch)?;
        Ok(())
    }

    // -- Path-addressed nodes -----------------------------------------------

    /// Read a node by owner and path.
    pub fn read_path_node(&self, owner: &Hash, path: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .path_nodes
            .get(path_node_key(owner, path))?
            .map(|v| v.to_vec()))
    }

    /// Apply a batch of path-addressed writes. Keys must come from
    /// [`path_node_key`].
    pub fn apply_path_nodes(&self, batch: Batch) -> Result<()> {
        self.path_nodes.apply_batch(batch)?;
        Ok(())
    }

    /// Delete every path-addressed node.
    pub fn wipe_path_nodes(&self) -> Result<()> {
        self.path_nodes.clear()?;
        Ok(())
    }

    /// Number of persisted path-addressed nodes.
    pub fn path_node_count(&self) -> usize {
        self.path_nodes.len()
    }

    // -- Preimages ----------------------------------------------------------

    /// Read a persisted preimage.
    pub fn read_preimage(&self, hash: &Hash) -> Result<Option<Vec<u8>>> {
        Ok(self.preimages.get(hash)?.map(|v| v.to_vec()))
    }

    /// Write a set of preimages atomically.
    pub fn write_preimages<'a, I>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a Hash, &'a Vec<u8>)>,
    {
        let mut batch = Batch::default();
        for (hash, preimage) in entries {
            batch.insert(hash.as_slice(), preimage.as_slice());
        }
        self.preimages.apply_batch(batch)?;
        Ok(())
    }

    /// Number of persisted preimages.
    pub fn preimage_count(&self) -> usize {
        self.preimages.len()
    }

    // -- Path scheme metadata -----------------------------------------------

    /// State id of the persisted disk layer. Zero for a fresh database.
    pub fn read_persistent_state_id(&self) -> Result<u64> {
        match self.metadata.get(META_PERSISTENT_STATE_ID)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    /// Record the state id of the persisted disk layer.
    pub fn write_persistent_state_id(&self, id: u64) -> Result<()> {
        self.metadata
            .insert(META_PERSISTENT_STATE_ID, &id.to_be_bytes())?;
        Ok(())
    }

    /// The serialized trie journal, if one was written.
    pub fn read_trie_journal(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.metadata.get(META_TRIE_JOURNAL)?.map(|v| v.to_vec()))
    }

    /// Store the serialized trie journal, replacing any previous one.
    pub fn write_trie_journal(&self, journal: &[u8]) -> Result<()> {
        self.metadata.insert(META_TRIE_JOURNAL, journal)?;
        Ok(())
    }

    /// Drop the trie journal.
    pub fn delete_trie_journal(&self) -> Result<()> {
        self.metadata.remove(META_TRIE_JOURNAL)?;
        Ok(())
    }

    // -- State histories ----------------------------------------------------

    /// Store the encoded history with sequence number `id` and index its
    /// post-state root.
    pub fn write_state_history(&self, id: u64, root: &Hash, encoded: &[u8]) -> Result<()> {
        self.state_history.insert(id.to_be_bytes(), encoded)?;
        self.state_ids.insert(root, &id.to_be_bytes())?;
        Ok(())
    }

    /// Read the encoded history with sequence number `id`.
    pub fn read_state_history(&self, id: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.state_history.get(id.to_be_bytes())?.map(|v| v.to_vec()))
    }

    /// The state id whose post-state root is `root`.
    pub fn read_state_id(&self, root: &Hash) -> Result<Option<u64>> {
        match self.state_ids.get(root)? {
            Some(bytes) => Ok(Some(decode_u64(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Index `root` under state id `id` without a history entry. Used for
    /// the base state a history chain starts from.
    pub fn write_state_id(&self, root: &Hash, id: u64) -> Result<()> {
        self.state_ids.insert(root, &id.to_be_bytes())?;
        Ok(())
    }

    /// Remove the root → id index entry for `root`.
    pub fn delete_state_id(&self, root: &Hash) -> Result<()> {
        self.state_ids.remove(root)?;
        Ok(())
    }

    /// Lowest and highest history ids present, if any.
    pub fn state_history_range(&self) -> Result<Option<(u64, u64)>> {
        let first = self.state_history.first()?;
        let last = self.state_history.last()?;
        match (first, last) {
            (Some((lo, _)), Some((hi, _))) => Ok(Some((decode_u64(&lo)?, decode_u64(&hi)?))),
            _ => Ok(None),
        }
    }

    /// Remove histories with id strictly greater than `id`. Returns the
    /// number removed.
    pub fn truncate_history_head(&self, id: u64) -> Result<usize> {
        let mut batch = Batch::default();
        let mut removed = 0;
        for entry in self.state_history.range(id.saturating_add(1).to_be_bytes()..) {
            let (key, _) = entry?;
            batch.remove(key);
            removed += 1;
        }
        self.state_history.apply_batch(batch)?;
        Ok(removed)
    }

    /// Remove histories with id less than or equal to `id`. Returns the
    /// number removed.
    pub fn truncate_history_tail(&self, id: u64) -> Result<usize> {
        let mut batch = Batch::default();
        let mut removed = 0;
        for entry in self.state_history.range(..=id.to_be_bytes()) {
            let (key, _) = entry?;
            batch.remove(key);
            removed += 1;
        }
        self.state_history.apply_batch(batch)?;
        Ok(removed)
    }

    /// Drop every history and root index entry.
    pub fn wipe_state_histories(&self) -> Result<()> {
        self.state_history.clear()?;
        self.state_ids.clear()?;
        Ok(())
    }

    // -- Utility ------------------------------------------------------------

    /// Block until every pending write is durable.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
