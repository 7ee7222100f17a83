//! # lakelog-compaction
//!
//! Compaction bookkeeping for lakelog tables.
//!
//! Compaction itself (reading inputs, writing the merged output) happens in
//! external workers. This crate owns the two state store interactions around
//! it:
//!
//! - **Job creation**: [`CompactionJobCreator`] batches unassigned references
//!   and assigns job ids to them
//! - **Job commit**: [`CompactionJobCommitter`] applies a finished job as one
//!   atomic replace transaction, waiting out late assignment visibility
//!
//! Commit requests arrive as JSON messages; [`CompactionJobCommitter::handle_commit_message`]
//! turns each into an ack, retry or dead-letter decision.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod committer;
pub mod config;
pub mod creator;
pub mod error;
pub mod message;
pub mod metrics;

pub use committer::{CommitOutcome, CompactionJobCommitter, MessageOutcome, outcome_for};
pub use config::CommitterConfig;
pub use creator::CompactionJobCreator;
pub use error::{CommitError, Result};
pub use message::{CompactionJob, CompactionJobCommitRequest, RecordsProcessedSummary};
