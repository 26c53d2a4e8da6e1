//! # Logging for the `triedb` tool
//!
//! Events come from two targets: `triedb` (the library: layer flattening,
//! buffer flushes, journal loads, scheme warnings) and `triedb_cli` (this
//! binary). Both log at `info` unless `RUST_LOG` says otherwise.
//!
//! Logs go to stderr. Stdout carries only the subcommand's report, so
//! `triedb inspect --json | jq` works with logging enabled.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "triedb=info,triedb_cli=info";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, with source locations.
    Pretty,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Parse `--log-format`. Anything other than "json" (any case) is
    /// `Pretty`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// `RUST_LOG` if set and valid, [`DEFAULT_FILTER`] otherwise.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Must run once, before any subcommand
/// touches a database.
///
/// ```text
/// RUST_LOG=triedb::pathdb=debug triedb inspect -d ./state
/// ```
pub fn init_logging(format: LogFormat) {
    match format {
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(true)
                        .with_file(true)
                        .with_line_number(true),
                )
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(fmt::layer().json().with_writer(std::io::stderr).with_target(true))
                .init();
        }
    }

    tracing::debug!(?format, "logging initialized");
}
