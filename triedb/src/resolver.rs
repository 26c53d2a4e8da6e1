//! Backend selection.
//!
//! Turns the caller's (optional) [`Config`] plus the scheme recorded on disk
//! into a configuration with exactly one backend sub-configuration set.
//! First match wins:
//!
//! 1. explicit hash settings select the hash scheme,
//! 2. explicit path settings select the path scheme,
//! 3. a scheme recorded on disk selects that scheme's defaults,
//! 4. otherwise the hash scheme's defaults.
//!
//! Explicit settings that disagree with the recorded scheme are honoured
//! but reported as a [`SchemeMismatch`] and logged at warn level.

use std::fmt;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::hashdb;
use crate::pathdb;
use crate::scheme::Scheme;

const MIB: usize = 1024 * 1024;

/// Explicit settings selected a scheme other than the one on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemeMismatch {
    /// Scheme recorded on disk.
    pub recorded: Scheme,
    /// Scheme selected by configuration.
    pub requested: Scheme,
}

impl fmt::Display for SchemeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "incompatible state scheme: disk records {}, configuration selects {}",
            self.recorded, self.requested
        )
    }
}

/// Outcome of resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The selected scheme.
    pub scheme: Scheme,
    /// The configuration with exactly one sub-configuration set.
    pub config: Config,
    /// Present when explicit settings override the recorded scheme.
    pub mismatch: Option<SchemeMismatch>,
}

/// Resolve `config` against the scheme recorded on disk.
///
/// The only rejected input is a configuration carrying both sub-configs.
pub fn resolve(config: Option<Config>, recorded: Option<Scheme>) -> Result<Resolution> {
    let mut config = config.unwrap_or_default();

    let scheme = match (&config.hash_db, &config.path_db) {
        (Some(_), Some(_)) => return Err(Error::ConflictingSchemes),
        (Some(_), None) => Scheme::Hash,
        (None, Some(_)) => Scheme::Path,
        (None, None) => {
            let scheme = recorded.unwrap_or(Scheme::Hash);
            fill_defaults(&mut config, scheme);
            return Ok(Resolution {
                scheme,
                config,
                mismatch: None,
            });
        }
    };

    let mismatch = match recorded {
        Some(recorded) if recorded != scheme => {
            tracing::warn!(old = %recorded, new = %scheme, "incompatible state scheme");
            Some(SchemeMismatch {
                recorded,
                requested: scheme,
            })
        }
        _ => None,
    };
    Ok(Resolution {
        scheme,
        config,
        mismatch,
    })
}

/// Populate the sub-configuration for `scheme` from defaults, applying the
/// top-level cache budget.
fn fill_defaults(config: &mut Config, scheme: Scheme) {
    let clean_cache_size = (config.cache > 0).then(|| config.cache.saturating_mul(MIB));
    match scheme {
        Scheme::Hash => {
            let mut hash = hashdb::Config::defaults();
            if let Some(size) = clean_cache_size {
                hash.clean_cache_size = size;
            }
            config.hash_db = Some(hash);
        }
        Scheme::Path => {
            let mut path = pathdb::Config::defaults();
            if let Some(size) = clean_cache_size {
                path.clean_cache_size = size;
            }
            config.path_db = Some(path);
        }
    }
}
