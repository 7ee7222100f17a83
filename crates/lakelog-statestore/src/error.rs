//! Error types for state store operations.
//!
//! Each semantic failure is its own variant carrying the identifiers needed to
//! act on it. Retry loops decide what to do from [`StateStoreError::kind`],
//! never from message text.

use lakelog_core::{EntityType, JobId, TableId};
use thiserror::Error;

/// Result type alias for state store operations.
pub type Result<T> = std::result::Result<T, StateStoreError>;

/// Broad classification of a [`StateStoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A referenced file, reference, partition or table does not exist.
    NotFound,
    /// The request conflicts with current state; retrying cannot help.
    InvariantViolation,
    /// A concurrent writer won, or state is not yet visible. Retrying may help.
    Race,
    /// The underlying store failed.
    Infrastructure,
}

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// No file with this name is tracked.
    #[error("file not found: {filename}")]
    FileNotFound {
        /// The missing file.
        filename: String,
    },

    /// A file with this name is already tracked.
    #[error("file already exists: {filename}")]
    FileAlreadyExists {
        /// The duplicate file.
        filename: String,
    },

    /// The file exists but has no reference in the partition.
    #[error("file {filename} has no reference in partition {partition_id}")]
    FileReferenceNotFound {
        /// The file.
        filename: String,
        /// The partition expected to hold a reference.
        partition_id: String,
    },

    /// The file already has a reference in the partition.
    #[error("file {filename} already has a reference in partition {partition_id}")]
    FileReferenceAlreadyExists {
        /// The file.
        filename: String,
        /// The partition already holding a reference.
        partition_id: String,
    },

    /// The reference is already assigned to a compaction job.
    #[error("reference to {filename} in partition {partition_id} is already assigned to job {job_id}")]
    FileReferenceAssignedToJob {
        /// The file.
        filename: String,
        /// The partition of the reference.
        partition_id: String,
        /// The job the reference is assigned to.
        job_id: JobId,
    },

    /// The reference is not assigned to the committing job.
    #[error("reference to {filename} in partition {partition_id} is not assigned to job {job_id}")]
    FileReferenceNotAssignedToJob {
        /// The file.
        filename: String,
        /// The partition of the reference.
        partition_id: String,
        /// The job that expected to own the reference.
        job_id: JobId,
    },

    /// The file still has references and cannot be deleted.
    #[error("file {filename} still has {reference_count} references")]
    FileHasReferences {
        /// The file.
        filename: String,
        /// Its total reference count.
        reference_count: u64,
    },

    /// A compaction output has the same name as one of its inputs.
    #[error("new reference {filename} is the same as an input reference")]
    NewReferenceSameAsOldReference {
        /// The offending filename.
        filename: String,
    },

    /// No partition with this ID exists.
    #[error("partition not found: {partition_id}")]
    PartitionNotFound {
        /// The missing partition.
        partition_id: String,
    },

    /// The partition has already been split.
    #[error("partition is not a leaf: {partition_id}")]
    PartitionNotLeaf {
        /// The partition.
        partition_id: String,
    },

    /// A partition with this ID already exists.
    #[error("partition already exists: {partition_id}")]
    PartitionAlreadyExists {
        /// The partition.
        partition_id: String,
    },

    /// The partitions do not form a valid tree.
    #[error("invalid partition tree: {message}")]
    InvalidPartitionTree {
        /// What is wrong with the tree.
        message: String,
    },

    /// The request is malformed independently of current state.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// What is wrong with the request.
        message: String,
    },

    /// The state store cannot be initialised while files are present.
    #[error("state store for table {table_id} still has files")]
    StateStoreNotEmpty {
        /// The table.
        table_id: TableId,
    },

    /// The table has no properties document.
    #[error("table not found: {table_id}")]
    TableNotFound {
        /// The table.
        table_id: TableId,
    },

    /// A properties document already exists for the table.
    #[error("table already exists: {table_id}")]
    TableAlreadyExists {
        /// The table.
        table_id: TableId,
    },

    /// Another writer appended at this transaction number first.
    #[error("transaction {transaction_number} conflicts in {entity} log of table {table_id}")]
    TransactionConflict {
        /// The table.
        table_id: TableId,
        /// The log.
        entity: EntityType,
        /// The number that could not be appended.
        transaction_number: u64,
    },

    /// Appends kept losing races until the retry policy gave up.
    #[error("gave up after {attempts} conflicting attempts on {entity} log of table {table_id}")]
    TooManyConflicts {
        /// The table.
        table_id: TableId,
        /// The log.
        entity: EntityType,
        /// Attempts made.
        attempts: u32,
    },

    /// A log entry needed for replay is missing and no snapshot covers it.
    #[error("transaction {transaction_number} missing from {entity} log of table {table_id}")]
    MissingTransaction {
        /// The table.
        table_id: TableId,
        /// The log.
        entity: EntityType,
        /// The first missing number.
        transaction_number: u64,
    },

    /// A snapshot already exists at this transaction number.
    #[error("snapshot already exists at transaction {transaction_number} for {entity} of table {table_id}")]
    DuplicateSnapshot {
        /// The table.
        table_id: TableId,
        /// The entity type.
        entity: EntityType,
        /// The transaction number.
        transaction_number: u64,
    },

    /// Infrastructure failure from storage or encoding.
    #[error(transparent)]
    Core(#[from] lakelog_core::Error),
}

impl StateStoreError {
    /// Classifies the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::FileNotFound { .. }
            | Self::FileReferenceNotFound { .. }
            | Self::PartitionNotFound { .. }
            | Self::TableNotFound { .. } => ErrorKind::NotFound,
            Self::TransactionConflict { .. }
            | Self::TooManyConflicts { .. }
            | Self::FileReferenceNotAssignedToJob { .. } => ErrorKind::Race,
            Self::Core(_) | Self::MissingTransaction { .. } => ErrorKind::Infrastructure,
            Self::FileAlreadyExists { .. }
            | Self::FileReferenceAlreadyExists { .. }
            | Self::FileReferenceAssignedToJob { .. }
            | Self::FileHasReferences { .. }
            | Self::NewReferenceSameAsOldReference { .. }
            | Self::PartitionNotLeaf { .. }
            | Self::PartitionAlreadyExists { .. }
            | Self::InvalidPartitionTree { .. }
            | Self::InvalidRequest { .. }
            | Self::StateStoreNotEmpty { .. }
            | Self::TableAlreadyExists { .. }
            | Self::DuplicateSnapshot { .. } => ErrorKind::InvariantViolation,
        }
    }

    /// Creates an invalid-request error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates an invalid-partition-tree error.
    #[must_use]
    pub fn invalid_tree(message: impl Into<String>) -> Self {
        Self::InvalidPartitionTree {
            message: message.into(),
        }
    }

    /// Returns true if this is an append conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::TransactionConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_drive_retry_decisions() {
        let race = StateStoreError::FileReferenceNotAssignedToJob {
            filename: "f1".into(),
            partition_id: "root".into(),
            job_id: JobId::new("j1"),
        };
        assert_eq!(race.kind(), ErrorKind::Race);

        let missing = StateStoreError::FileNotFound {
            filename: "f1".into(),
        };
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        let core: StateStoreError = lakelog_core::Error::storage("down").into();
        assert_eq!(core.kind(), ErrorKind::Infrastructure);
        assert!(!core.is_conflict());
    }

    #[test]
    fn messages_carry_identifiers() {
        let err = StateStoreError::FileHasReferences {
            filename: "f1.parquet".into(),
            reference_count: 2,
        };
        assert_eq!(err.to_string(), "file f1.parquet still has 2 references");
    }
}
