//! Error types for the trie node database.
//!
//! Every fallible operation returns [`Error`]. Callers that need to branch
//! on the broad category (retry with an older root, probe a capability,
//! give up) use [`Error::kind`] instead of matching individual variants.

use thiserror::Error;

use crate::scheme::Scheme;
use crate::types::Hash;

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The operation is not offered by the active backend. Branch on
    /// [`crate::Database::scheme`] instead of retrying.
    UnsupportedOperation,
    /// The requested state cannot be produced. Pick another root.
    StateUnavailable,
    /// Durable storage, encoding or backend state failure.
    BackendFailure,
    /// The caller-supplied configuration cannot be resolved.
    InvalidConfig,
}

/// Errors produced by the facade and both node storage backends.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation only exists on the other storage scheme.
    #[error("{operation} is not supported by the {scheme} scheme")]
    UnsupportedOperation {
        /// Name of the rejected operation.
        operation: &'static str,
        /// The scheme of the active backend.
        scheme: Scheme,
    },

    /// The nodes of the requested state root are not retrievable.
    #[error("state {} is not available: {}", hex::encode(.root), .reason)]
    StateUnavailable {
        /// The requested root.
        root: Hash,
        /// Why it is unavailable (pruned, stale layer, never committed).
        reason: String,
    },

    /// A node referenced by an available state could not be found.
    #[error("missing trie node {} (owner {}, path {})", hex::encode(.hash), .owner, .path)]
    MissingNode {
        /// Hex-encoded trie owner.
        owner: String,
        /// Hex-encoded node path.
        path: String,
        /// The node hash that was asked for.
        hash: Hash,
    },

    /// A node read resolved to a blob whose hash does not match.
    #[error("unexpected node at path {} (owner {}): want {}, got {}", .path, .owner, hex::encode(.want), hex::encode(.got))]
    UnexpectedNode {
        /// Hex-encoded trie owner.
        owner: String,
        /// Hex-encoded node path.
        path: String,
        /// Expected node hash.
        want: Hash,
        /// Hash of the blob actually found.
        got: Hash,
    },

    /// Both scheme sub-configurations were supplied at once.
    #[error("conflicting configuration: both hash and path scheme settings were provided")]
    ConflictingSchemes,

    /// Update was asked to link a root to itself.
    #[error("layer cycle: root {} equals its parent", hex::encode(.0))]
    LayerCycle(Hash),

    /// Update referenced a parent layer that does not exist.
    #[error("parent layer {} is missing", hex::encode(.0))]
    ParentMissing(Hash),

    /// The backend was journaled or closed and refuses further mutation.
    #[error("trie database is read-only")]
    ReadOnly,

    /// Recover was asked for a root that is not a valid rollback target.
    #[error("state {} is not recoverable", hex::encode(.0))]
    Unrecoverable(Hash),

    /// A persisted state history does not match the layer being reverted.
    #[error("unexpected state history {id}: {reason}")]
    UnexpectedHistory {
        /// The history sequence number.
        id: u64,
        /// What did not line up.
        reason: String,
    },

    /// Reset target does not match the persisted account trie root.
    #[error("state is mismatched, local: {}, target: {}", hex::encode(.local), hex::encode(.target))]
    ResetMismatch {
        /// Root derived from the persisted account trie root node.
        local: Hash,
        /// The requested reset root.
        target: Hash,
    },

    /// Two node sets for the same owner were merged.
    #[error("duplicate node set for owner {}", hex::encode(.0))]
    DuplicateOwner(Hash),

    /// Both the preimage flush and the backend close failed.
    #[error("close failed: preimage flush: {preimages}; backend: {backend}")]
    Close {
        /// Error from the forced preimage flush.
        preimages: Box<Error>,
        /// Error from closing the backend.
        backend: Box<Error>,
    },

    /// The underlying sled store failed.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// On-disk data could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnsupportedOperation { .. } => ErrorKind::UnsupportedOperation,
            Error::StateUnavailable { .. } | Error::Unrecoverable(_) | Error::MissingNode { .. } => {
                ErrorKind::StateUnavailable
            }
            Error::ConflictingSchemes => ErrorKind::InvalidConfig,
            Error::Close { backend, .. } => backend.kind(),
            _ => ErrorKind::BackendFailure,
        }
    }

    pub(crate) fn unsupported(operation: &'static str, scheme: Scheme) -> Self {
        Error::UnsupportedOperation { operation, scheme }
    }

    pub(crate) fn missing_node(owner: &Hash, path: &[u8], hash: Hash) -> Self {
        Error::MissingNode {
            owner: hex::encode(owner),
            path: hex::encode(path),
            hash,
        }
    }

    pub(crate) fn unavailable(root: Hash, reason: impl Into<String>) -> Self {
        Error::StateUnavailable {
            root,
            reason: reason.into(),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
