//! # CLI Interface
//!
//! Defines the command-line argument structure for `triedb` using `clap`
//! derive. Supports three subcommands: `inspect`, `init`, and `version`.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use triedb::{Hash, Scheme};

/// Operator tool for NOVA trie node databases.
///
/// Reports which storage scheme a database uses and what state it holds,
/// and prepares fresh databases under a chosen scheme.
#[derive(Parser, Debug)]
#[command(
    name = "triedb",
    about = "Operator tool for NOVA trie node databases",
    version,
    propagate_version = true
)]
pub struct TrieDbCli {
    /// Log output format: "pretty" or "json".
    #[arg(long, global = true, env = "TRIEDB_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Open a database read-only and report its scheme and contents.
    Inspect(InspectArgs),
    /// Create a database and record the chosen scheme on it.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `inspect` subcommand.
#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Database directory.
    #[arg(long, short = 'd', env = "TRIEDB_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Hex-encoded genesis root to test initialization against.
    #[arg(long, value_parser = parse_hash)]
    pub genesis: Option<Hash>,

    /// Print the report as JSON on stdout.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Database directory. Created if missing.
    #[arg(long, short = 'd', env = "TRIEDB_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Storage scheme to record.
    #[arg(long, value_enum, default_value_t = SchemeArg::Hash)]
    pub scheme: SchemeArg,
}

/// Scheme choice on the command line.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemeArg {
    /// Hash-addressed, reference counted.
    Hash,
    /// Path-addressed, journaled.
    Path,
}

impl From<SchemeArg> for Scheme {
    fn from(arg: SchemeArg) -> Self {
        match arg {
            SchemeArg::Hash => Scheme::Hash,
            SchemeArg::Path => Scheme::Path,
        }
    }
}

/// Parse a 32-byte hash from hex, with or without a `0x` prefix.
pub fn parse_hash(s: &str) -> Result<Hash, String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(digits).map_err(|e| format!("invalid hex: {e}"))?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| format!("expected 32 bytes, got {}", bytes.len()))
}
