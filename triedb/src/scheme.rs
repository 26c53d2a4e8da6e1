//! Node storage schemes.
//!
//! A database is written under exactly one scheme. The tag is persisted in
//! the `metadata` tree the first time a backend makes data durable, and read
//! back when the database is reopened.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier of a node storage strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    /// Nodes keyed by content hash, reference counted in memory.
    Hash,
    /// Nodes keyed by owner and path, layered and journaled.
    Path,
}

impl Scheme {
    /// Stable on-disk tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Hash => "hash",
            Scheme::Path => "path",
        }
    }

    /// Parse an on-disk tag. Unknown tags yield `None`.
    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"hash" => Some(Scheme::Hash),
            b"path" => Some(Scheme::Path),
            _ => None,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scheme::from_tag(s.to_lowercase().as_bytes())
            .ok_or_else(|| format!("unknown state scheme: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_roundtrip() {
        for scheme in [Scheme::Hash, Scheme::Path] {
            assert_eq!(Scheme::from_tag(scheme.as_str().as_bytes()), Some(scheme));
        }
        assert_eq!(Scheme::from_tag(b"verkle"), None);
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("PATH".parse::<Scheme>().unwrap(), Scheme::Path);
        assert!("legacy".parse::<Scheme>().is_err());
    }
}
