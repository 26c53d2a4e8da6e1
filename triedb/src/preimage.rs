//! Preimage store.
//!
//! Trie keys are hashes. Tooling that walks the state (dumps, debuggers)
//! wants the original keys back, so when preimage recording is enabled the
//! trie layer hands every hashed key to this store. Entries are purely
//! additive: nothing is ever deleted, and duplicates are ignored.
//!
//! Writes are batched in memory and flushed once they cross
//! [`PREIMAGE_FLUSH_THRESHOLD`], or unconditionally on a forced flush.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{PREIMAGE_FLUSH_THRESHOLD, PREIMAGE_KEY_OVERHEAD};
use crate::disk::DiskDb;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::types::{Hash, StorageSize};

#[derive(Default)]
struct Pending {
    preimages: HashMap<Hash, Vec<u8>>,
    size: u64,
}

/// In-memory accumulator of preimages in front of the disk.
pub struct PreimageStore {
    disk: DiskDb,
    pending: RwLock<Pending>,
    metrics: Arc<Metrics>,
}

impl PreimageStore {
    /// Create an empty store writing to `disk`.
    pub fn new(disk: DiskDb, metrics: Arc<Metrics>) -> Self {
        Self {
            disk,
            pending: RwLock::new(Pending::default()),
            metrics,
        }
    }

    /// Record a single preimage.
    pub fn record(&self, hash: Hash, preimage: Vec<u8>) {
        let mut pending = self.pending.write();
        if pending.preimages.contains_key(&hash) {
            return;
        }
        pending.size += PREIMAGE_KEY_OVERHEAD + preimage.len() as u64;
        pending.preimages.insert(hash, preimage);
    }

    /// Record a batch of preimages.
    pub fn insert_preimages(&self, records: HashMap<Hash, Vec<u8>>) {
        let mut pending = self.pending.write();
        for (hash, preimage) in records {
            if pending.preimages.contains_key(&hash) {
                continue;
            }
            pending.size += PREIMAGE_KEY_OVERHEAD + preimage.len() as u64;
            pending.preimages.insert(hash, preimage);
        }
    }

    /// Look up a preimage, in memory first and on disk second.
    pub fn preimage(&self, hash: &Hash) -> Result<Option<Vec<u8>>> {
        if let Some(preimage) = self.pending.read().preimages.get(hash) {
            return Ok(Some(preimage.clone()));
        }
        self.disk.read_preimage(hash)
    }

    /// Write pending preimages to disk.
    ///
    /// Without `force` this is a no-op until the pending set exceeds the
    /// flush threshold. On failure the pending set is kept so a later flush
    /// can retry it.
    pub fn flush(&self, force: bool) -> Result<()> {
        let mut pending = self.pending.write();
        if pending.preimages.is_empty() {
            return Ok(());
        }
        if pending.size <= PREIMAGE_FLUSH_THRESHOLD && !force {
            return Ok(());
        }
        self.disk.write_preimages(pending.preimages.iter())?;

        tracing::debug!(
            count = pending.preimages.len(),
            size = %StorageSize(pending.size),
            "flushed preimages"
        );
        self.metrics.preimage_flushes_total.inc();
        self.metrics.preimage_bytes_flushed_total.inc_by(pending.size);

        pending.preimages.clear();
        pending.size = 0;
        Ok(())
    }

    /// Bytes currently held in memory.
    pub fn size(&self) -> StorageSize {
        StorageSize(self.pending.read().size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PreimageStore {
        let disk = DiskDb::open_temporary().expect("temp db");
        PreimageStore::new(disk, Arc::new(Metrics::new()))
    }

    #[test]
    fn duplicates_are_charged_once() {
        let store = store();
        store.record([1u8; 32], vec![0; 10]);
        store.record([1u8; 32], vec![0; 10]);
        assert_eq!(store.size(), StorageSize(42));
    }

    #[test]
    fn soft_flush_below_threshold_keeps_memory() {
        let store = store();
        store.record([1u8; 32], b"key".to_vec());
        store.flush(false).unwrap();

        assert_eq!(store.size(), StorageSize(35));
        assert_eq!(store.disk.read_preimage(&[1u8; 32]).unwrap(), None);
        assert_eq!(store.preimage(&[1u8; 32]).unwrap(), Some(b"key".to_vec()));
    }

    #[test]
    fn forced_flush_persists_and_resets() {
        let store = store();
        store.record([1u8; 32], b"key".to_vec());
        store.flush(true).unwrap();

        assert_eq!(store.size(), StorageSize::ZERO);
        assert_eq!(store.disk.read_preimage(&[1u8; 32]).unwrap(), Some(b"key".to_vec()));
        assert_eq!(store.preimage(&[1u8; 32]).unwrap(), Some(b"key".to_vec()));
        assert_eq!(store.metrics.preimage_flushes_total.get(), 1);
    }

    #[test]
    fn soft_flush_above_threshold_writes() {
        let store = store();
        let big = vec![0u8; PREIMAGE_FLUSH_THRESHOLD as usize];
        store.record([9u8; 32], big);
        store.flush(false).unwrap();
        assert_eq!(store.size(), StorageSize::ZERO);
        assert_eq!(store.disk.preimage_count(), 1);
    }

    #[test]
    fn flushing_empty_store_is_free() {
        let store = store();
        store.flush(true).unwrap();
        assert_eq!(store.metrics.preimage_flushes_total.get(), 0);
    }
}
