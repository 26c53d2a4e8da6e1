// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # NOVA Trie Database
//!
//! Node storage for NOVA's authenticated state trie. Two storage schemes
//! exist and they do not share an on-disk layout:
//!
//! - **hash** — nodes keyed by content hash, reference counted in memory,
//!   garbage collected before they ever reach disk. Simple and battle-tested,
//!   but stale nodes that did make it to disk stay there forever.
//! - **path** — nodes keyed by their location in the trie. Recent
//!   transitions live in memory as diff layers, older ones are flattened into
//!   a single disk layer, and reverse diffs allow rolling it back.
//!
//! [`Database`] picks one at open time (explicit configuration first, then
//! whatever the disk already records, then hash) and exposes one API over
//! both. Operations that only make sense for one scheme return
//! [`ErrorKind::UnsupportedOperation`] on the other.
//!
//! ## Modules
//!
//! - **database** — the facade and its capability-gated dispatch.
//! - **resolver** — configuration resolution against the on-disk scheme.
//! - **hashdb** / **pathdb** — the two backends.
//! - **preimage** — the hashed-key preimage store.
//! - **disk** — the sled-backed persistent handle shared by everything.
//! - **trienode** / **triestate** — what a state transition hands us.

pub mod config;
pub mod database;
pub mod disk;
pub mod error;
pub mod hashdb;
pub mod metrics;
pub mod pathdb;
pub mod preimage;
pub mod resolver;
pub mod scheme;
pub mod trienode;
pub mod triestate;
pub mod types;

pub use config::{CommitHook, Config};
pub use database::{Database, Reader};
pub use disk::DiskDb;
pub use error::{Error, ErrorKind, Result};
pub use metrics::Metrics;
pub use pathdb::{OriginLoader, StateHistory, TrieLoader};
pub use resolver::{Resolution, SchemeMismatch};
pub use scheme::Scheme;
pub use trienode::{MergedNodeSet, Node, NodeSet};
pub use triestate::StateSet;
pub use types::{hash_node, Hash, StorageSize, EMPTY_ROOT_HASH, ZERO_HASH};
