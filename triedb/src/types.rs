//! # Primitive Types
//!
//! The handful of value types every other module in this crate speaks:
//! 32-byte content hashes, the well-known empty root, and a byte counter
//! that knows how to print itself for humans.
//!
//! Node hashes are BLAKE3 digests of the encoded node blob. The trie layer
//! above us decides what a blob looks like; we only ever hash it.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

/// A 32-byte content hash. Used for node hashes, state roots, trie owners
/// and preimage keys alike.
pub type Hash = [u8; 32];

/// The all-zero hash. Identifies the account trie as a node-set owner and
/// the "no parent" slot when pinning a root reference.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Root hash of a trie with no entries: BLAKE3 of the empty string.
///
/// The empty state is always available, so readers for it never fail.
pub const EMPTY_ROOT_HASH: Hash = [
    0xaf, 0x13, 0x49, 0xb9, 0xf5, 0xf9, 0xa1, 0xa6, 0xa0, 0x40, 0x4d, 0xea, 0x36, 0xdc, 0xc9,
    0x49, 0x9b, 0xcb, 0x25, 0xc9, 0xad, 0xc1, 0x12, 0xb7, 0xcc, 0x9a, 0x93, 0xca, 0xe4, 0x1f,
    0x32, 0x62,
];

/// Compute the BLAKE3 hash of a node blob.
///
/// This is the content address used by the hash-addressed backend and the
/// integrity check applied by the path-addressed backend on every read.
pub fn hash_node(blob: &[u8]) -> Hash {
    *blake3::hash(blob).as_bytes()
}

/// Short hex rendering of a hash for log fields: first four bytes, then an
/// ellipsis. Full hashes make log lines unreadable.
pub fn short_hex(hash: &Hash) -> String {
    format!("{}..", hex::encode(&hash[..4]))
}

// ---------------------------------------------------------------------------
// StorageSize
// ---------------------------------------------------------------------------

/// A byte count with a human-friendly `Display` (`"1.50 MiB"`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorageSize(pub u64);

impl StorageSize {
    /// Zero bytes.
    pub const ZERO: StorageSize = StorageSize(0);

    /// Raw byte count.
    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StorageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
        let mut value = self.0 as f64;
        let mut unit = 0;
        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }
        write!(f, "{:.2} {}", value, UNITS[unit])
    }
}

impl From<usize> for StorageSize {
    fn from(n: usize) -> Self {
        StorageSize(n as u64)
    }
}

impl From<u64> for StorageSize {
    fn from(n: u64) -> Self {
        StorageSize(n)
    }
}

impl Add for StorageSize {
    type Output = StorageSize;

    fn add(self, rhs: StorageSize) -> StorageSize {
        StorageSize(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for StorageSize {
    fn add_assign(&mut self, rhs: StorageSize) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sub for StorageSize {
    type Output = StorageSize;

    fn sub(self, rhs: StorageSize) -> StorageSize {
        StorageSize(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for StorageSize {
    fn sub_assign(&mut self, rhs: StorageSize) {
        self.0 = self.0.saturating_sub(rhs.0);
    }
}
