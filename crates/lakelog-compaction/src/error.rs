//! Commit errors.

use lakelog_core::{JobId, TableId};
use lakelog_statestore::StateStoreError;

/// Result type for compaction operations.
pub type Result<T> = std::result::Result<T, CommitError>;

/// Failure to commit a finished compaction job.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// The state store rejected the commit or could not be reached.
    #[error(transparent)]
    StateStore(#[from] StateStoreError),

    /// The job's input references never showed up as assigned to it.
    #[error(
        "timed out waiting for files of job {job_id} in table {table_id} to be assigned after {attempts} attempts: {last_error}"
    )]
    TimedOutWaitingForFileAssignments {
        /// Table the job belongs to.
        table_id: TableId,
        /// The job.
        job_id: JobId,
        /// Commit attempts made.
        attempts: u32,
        /// The error from the final attempt.
        #[source]
        last_error: StateStoreError,
    },

    /// The table's state store could not be loaded for a batch of commits.
    #[error("table {table_id} unavailable: {message}")]
    TableUnavailable {
        /// Table that failed to load.
        table_id: TableId,
        /// Why it failed.
        message: String,
    },

    /// A commit message could not be decoded.
    #[error("invalid commit message: {message}")]
    InvalidMessage {
        /// What was wrong.
        message: String,
    },
}
