//! Settings and the child-resolution seam for the hash scheme.

use std::fmt;
use std::sync::Arc;

use crate::config::DEFAULT_CLEAN_CACHE_SIZE;
use crate::types::Hash;

/// Extracts the hashes of the nodes referenced by an encoded node.
///
/// Reference counting needs to know which children a node keeps alive, but
/// decoding nodes is the trie layer's business. The trie layer plugs its
/// decoder in here.
pub trait ChildResolver: Send + Sync {
    /// Call `on_child` with the hash of every child stored by reference
    /// (not embedded inline) in `blob`.
    fn for_each_child(&self, blob: &[u8], on_child: &mut dyn FnMut(Hash));
}

/// Resolver for opaque blobs: nodes are treated as having no children.
/// Reference links then come only from account leaves and explicit
/// [`super::Database::reference`] calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoChildren;

impl ChildResolver for NoChildren {
    fn for_each_child(&self, _blob: &[u8], _on_child: &mut dyn FnMut(Hash)) {}
}

/// Hash scheme settings.
#[derive(Clone)]
pub struct Config {
    /// Byte budget of the clean node cache.
    pub clean_cache_size: usize,
    /// Child extraction used for reference counting.
    pub resolver: Arc<dyn ChildResolver>,
}

impl Config {
    /// Default settings: 16 MiB clean cache, opaque nodes.
    pub fn defaults() -> Self {
        Self {
            clean_cache_size: DEFAULT_CLEAN_CACHE_SIZE,
            resolver: Arc::new(NoChildren),
        }
    }

    /// Replace the child resolver.
    pub fn with_resolver<R: ChildResolver + 'static>(mut self, resolver: R) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::defaults()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("hashdb::Config")
            .field("clean_cache_size", &self.clean_cache_size)
            .finish_non_exhaustive()
    }
}
