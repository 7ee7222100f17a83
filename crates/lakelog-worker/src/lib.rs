//! # lakelog-worker
//!
//! Background maintenance for lakelog tables.
//!
//! ## Commands
//!
//! - `lakelog-worker create-table` - Register a table and create its root partition
//! - `lakelog-worker snapshot` - Write snapshots of both logs
//! - `lakelog-worker prune-snapshots` - Apply snapshot retention and truncate logs
//! - `lakelog-worker gc` - Delete unreferenced data files past their GC delay
//! - `lakelog-worker create-jobs` - Batch unassigned files into compaction jobs
//! - `lakelog-worker commit` - Commit a finished compaction job
//! - `lakelog-worker serve` - Run snapshot, prune and GC passes on an interval
//!
//! ## Configuration
//!
//! - `LAKELOG_DATA_DIR` - Root directory of the table store
//! - `LAKELOG_TABLE_IDS` - Comma-separated tables to maintain (default: all registered)
//! - `LAKELOG_LOG_FORMAT` - `pretty` or `json`
//! - `RUST_LOG` - Log filter
//!
//! State store, table property and commit retry settings are read from their
//! `LAKELOG_*` variables as well.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
// CLI uses print! macros intentionally
#![allow(clippy::print_stdout)]

pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use lakelog_core::{LogFormat, TableId};

/// Lakelog maintenance worker.
#[derive(Debug, Parser)]
#[command(name = "lakelog-worker")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Root directory of the table store.
    #[arg(long, env = "LAKELOG_DATA_DIR", global = true, default_value = ".")]
    pub data_dir: PathBuf,

    /// Tables to maintain. Defaults to every registered table.
    #[arg(long = "table", env = "LAKELOG_TABLE_IDS", value_delimiter = ',', global = true)]
    pub tables: Vec<String>,

    /// Log output format.
    #[arg(long, env = "LAKELOG_LOG_FORMAT", default_value = "pretty", global = true)]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Table ids given on the command line.
    ///
    /// # Errors
    ///
    /// Returns an error if an id is invalid.
    pub fn table_ids(&self) -> lakelog_core::Result<Vec<TableId>> {
        self.tables.iter().map(|t| TableId::new(t.trim())).collect()
    }
}

/// Worker subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Register a table and create its root partition.
    CreateTable(commands::create_table::CreateTableArgs),
    /// Write snapshots of the files and partitions logs.
    Snapshot,
    /// Apply snapshot retention and truncate logs below the oldest retained snapshot.
    PruneSnapshots,
    /// Delete unreferenced data files past their GC delay.
    Gc,
    /// Batch unassigned files into compaction jobs and print them as JSON lines.
    CreateJobs,
    /// Commit a finished compaction job.
    Commit(commands::commit::CommitArgs),
    /// Run maintenance passes on an interval until interrupted.
    Serve(commands::serve::ServeArgs),
}
