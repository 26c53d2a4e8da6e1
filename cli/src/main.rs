// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # NOVA Trie Database Tool
//!
//! Entry point for the `triedb` binary. Parses CLI arguments, initializes
//! logging, and runs one subcommand against a database directory:
//!
//! - `inspect` — report recorded scheme, active scheme and contents
//! - `init`    — create a database and record its scheme
//! - `version` — print build version information

mod cli;
mod logging;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use triedb::config::JOURNAL_VERSION;
use triedb::{hashdb, pathdb, Config, Database, DiskDb, Scheme, EMPTY_ROOT_HASH};

use cli::{Commands, TrieDbCli};
use logging::LogFormat;

fn main() -> Result<()> {
    let cli = TrieDbCli::parse();
    logging::init_logging(LogFormat::from_str_lossy(&cli.log_format));

    match cli.command {
        Commands::Inspect(args) => {
            let report = inspect(&args.data_dir, args.genesis)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                report.print();
            }
            Ok(())
        }
        Commands::Init(args) => init(&args.data_dir, args.scheme.into()),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// What `inspect` found.
#[derive(Debug, Serialize)]
struct InspectReport {
    data_dir: String,
    recorded_scheme: Option<String>,
    active_scheme: String,
    genesis: Option<String>,
    initialized: Option<bool>,
    dirty_size: String,
    preimage_size: String,
    path_nodes: usize,
    preimages: usize,
    state_histories: Option<(u64, u64)>,
    persistent_state_id: u64,
}

impl InspectReport {
    fn print(&self) {
        println!("Trie database      : {}", self.data_dir);
        println!("  Recorded scheme  : {}", self.recorded_scheme.as_deref().unwrap_or("none"));
        println!("  Active scheme    : {}", self.active_scheme);
        if let (Some(genesis), Some(initialized)) = (&self.genesis, self.initialized) {
            println!("  Genesis          : {genesis}");
            println!("  Initialized      : {initialized}");
        }
        println!("  Dirty nodes      : {}", self.dirty_size);
        println!("  Pending preimages: {}", self.preimage_size);
        println!("  Path nodes       : {}", self.path_nodes);
        println!("  Preimages        : {}", self.preimages);
        match self.state_histories {
            Some((lo, hi)) => println!("  State histories  : {lo}..={hi}"),
            None => println!("  State histories  : none"),
        }
        println!("  Persisted id     : {}", self.persistent_state_id);
    }
}

/// Open the database without mutating it and collect a report.
fn inspect(data_dir: &Path, genesis: Option<triedb::Hash>) -> Result<InspectReport> {
    let disk = DiskDb::open(data_dir)
        .with_context(|| format!("failed to open database at {}", data_dir.display()))?;
    let recorded = disk.read_state_scheme().context("failed to read state scheme")?;

    // The path backend truncates dangling histories on open unless it is
    // read-only.
    let config = match recorded {
        Some(Scheme::Path) => Some(Config {
            path_db: Some(pathdb::Config::defaults().with_read_only(true)),
            ..Default::default()
        }),
        _ => None,
    };
    let db = Database::new(disk.clone(), config).context("failed to open trie database")?;
    let (dirty, preimage) = db.size();

    let report = InspectReport {
        data_dir: data_dir.display().to_string(),
        recorded_scheme: recorded.map(|s| s.to_string()),
        active_scheme: db.scheme().to_string(),
        genesis: genesis.map(hex::encode),
        initialized: genesis.map(|root| db.initialized(root)),
        dirty_size: dirty.to_string(),
        preimage_size: preimage.to_string(),
        path_nodes: disk.path_node_count(),
        preimages: disk.preimage_count(),
        state_histories: disk.state_history_range()?,
        persistent_state_id: disk.read_persistent_state_id()?,
    };
    db.close().context("failed to close trie database")?;
    Ok(report)
}

/// Create the database directory and record `scheme` by committing the
/// empty root.
fn init(data_dir: &Path, scheme: Scheme) -> Result<()> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    let disk = DiskDb::open(data_dir)
        .with_context(|| format!("failed to open database at {}", data_dir.display()))?;

    if let Some(recorded) = disk.read_state_scheme()? {
        anyhow::bail!("database at {} already uses the {recorded} scheme", data_dir.display());
    }
    let config = match scheme {
        Scheme::Hash => Config {
            hash_db: Some(hashdb::Config::defaults()),
            ..Default::default()
        },
        Scheme::Path => Config::path_defaults(),
    };
    let db = Database::new(disk, Some(config)).context("failed to open trie database")?;
    db.commit(EMPTY_ROOT_HASH, false).context("failed to record state scheme")?;
    db.close().context("failed to close trie database")?;

    tracing::info!(data_dir = %data_dir.display(), %scheme, "initialized trie database");
    println!("Trie database initialized.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Scheme         : {scheme}");
    Ok(())
}

fn print_version() {
    println!("triedb  {}", env!("CARGO_PKG_VERSION"));
    println!("journal v{JOURNAL_VERSION}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_then_inspect_reports_scheme() {
        for scheme in [Scheme::Hash, Scheme::Path] {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("db");
            init(&path, scheme).unwrap();

            let report = inspect(&path, Some(EMPTY_ROOT_HASH)).unwrap();
            assert_eq!(report.recorded_scheme, Some(scheme.to_string()));
            assert_eq!(report.active_scheme, scheme.to_string());
            assert_eq!(report.initialized, Some(false));
        }
    }

    #[test]
    fn init_refuses_existing_database() {
        let dir = tempfile::tempdir().unwrap();
        init(dir.path(), Scheme::Path).unwrap();
        let err = init(dir.path(), Scheme::Hash).unwrap_err();
        assert!(err.to_string().contains("already uses the path scheme"));
    }

    #[test]
    fn inspect_empty_directory_defaults_to_hash() {
        let dir = tempfile::tempdir().unwrap();
        let report = inspect(dir.path(), None).unwrap();
        assert_eq!(report.recorded_scheme, None);
        assert_eq!(report.active_scheme, "hash");
        assert_eq!(report.initialized, None);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["active_scheme"], "hash");
    }
}
