//! # Trie Database Configuration & Constants
//!
//! Tunables for both node storage backends and the [`Config`] value callers
//! hand to [`crate::Database::new`]. Every threshold that decides when memory
//! is traded for disk writes lives here, in one place, so that nobody has to
//! grep three backends to learn why a node hit the disk.

use std::fmt;
use std::sync::Arc;

use crate::hashdb;
use crate::pathdb;
use crate::triestate::StateSet;

// ---------------------------------------------------------------------------
// Preimages
// ---------------------------------------------------------------------------

/// Preimages accumulate in memory until they exceed this many bytes; a
/// non-forced flush below the threshold is a no-op.
pub const PREIMAGE_FLUSH_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Per-entry bookkeeping charge for a preimage: the 32-byte key.
pub const PREIMAGE_KEY_OVERHEAD: u64 = 32;

// ---------------------------------------------------------------------------
// Hash scheme
// ---------------------------------------------------------------------------

/// Default byte budget of the hash backend's clean (already persisted)
/// node cache.
pub const DEFAULT_CLEAN_CACHE_SIZE: usize = 16 * 1024 * 1024;

/// Estimated in-memory overhead of one dirty node beyond its blob:
/// the hash key, parent counter and flush-list links.
pub const CACHED_NODE_OVERHEAD: u64 = 32 + 8 + 2 * 32;

// ---------------------------------------------------------------------------
// Path scheme
// ---------------------------------------------------------------------------

/// Maximum number of diff layers kept in memory above the disk layer.
/// Anything deeper is flattened into the node buffer. 128 layers is the
/// reorg depth we are willing to serve without touching state histories.
pub const MAX_DIFF_LAYERS: usize = 128;

/// Default byte budget of the node buffer in front of the disk layer.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Hard ceiling on the node buffer. Larger requests are capped.
pub const MAX_BUFFER_SIZE: usize = 256 * 1024 * 1024;

/// Number of recent state histories retained for rollback. Zero keeps
/// every history ever written.
pub const DEFAULT_STATE_HISTORY: u64 = 90_000;

/// Version tag written at the head of the trie journal. Journals carrying
/// any other version are discarded on load.
pub const JOURNAL_VERSION: u64 = 0;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Observer invoked with the state set of every update, before anything is
/// persisted. Meant for tests and side-channel metrics.
pub type CommitHook = Arc<dyn Fn(&StateSet) + Send + Sync>;

/// Options for opening a [`crate::Database`].
///
/// At most one of `hash_db` / `path_db` may be set. When neither is set the
/// scheme already recorded on disk wins, and an empty disk gets the hash
/// scheme. See [`crate::resolver`].
#[derive(Clone, Default)]
pub struct Config {
    /// Record the preimages of hashed trie keys.
    pub preimages: bool,

    /// Clean cache budget in MiB handed to a backend whose settings were
    /// filled in from defaults. Ignored when an explicit sub-configuration
    /// is supplied. Zero keeps the backend default.
    pub cache: usize,

    /// Settings for the hash-based scheme.
    pub hash_db: Option<hashdb::Config>,

    /// Settings for the path-based scheme.
    pub path_db: Option<pathdb::Config>,

    /// Testing hook invoked on every update.
    pub on_commit: Option<CommitHook>,
}

impl Config {
    /// Hash scheme with default settings and no preimage recording.
    pub fn hash_defaults() -> Self {
        Self {
            hash_db: Some(hashdb::Config::defaults()),
            ..Default::default()
        }
    }

    /// Path scheme with default settings and no preimage recording.
    pub fn path_defaults() -> Self {
        Self {
            path_db: Some(pathdb::Config::defaults()),
            ..Default::default()
        }
    }

    /// Enable or disable preimage recording.
    pub fn with_preimages(mut self, enabled: bool) -> Self {
        self.preimages = enabled;
        self
    }

    /// Install a commit hook.
    pub fn with_on_commit<F>(mut self, hook: F) -> Self
    where
        F: Fn(&StateSet) + Send + Sync + 'static,
    {
        self.on_commit = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("preimages", &self.preimages)
            .field("cache", &self.cache)
            .field("hash_db", &self.hash_db)
            .field("path_db", &self.path_db)
            .field("on_commit", &self.on_commit.as_ref().map(|_| "<hook>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_populate_exactly_one_variant() {
        let hash = Config::hash_defaults();
        assert!(hash.hash_db.is_some() && hash.path_db.is_none());

        let path = Config::path_defaults();
        assert!(path.path_db.is_some() && path.hash_db.is_none());

        let empty = Config::default();
        assert!(empty.hash_db.is_none() && empty.path_db.is_none());
        assert!(!empty.preimages);
    }

    #[test]
    fn debug_hides_hook_body() {
        let config = Config::default().with_on_commit(|_| {});
        let rendered = format!("{config:?}");
        assert!(rendered.contains("<hook>"));
    }

    #[test]
    fn buffer_defaults_are_consistent() {
        assert!(DEFAULT_BUFFER_SIZE <= MAX_BUFFER_SIZE);
        assert!(MAX_DIFF_LAYERS > 0);
    }
}
