//! # lakelog-statestore
//!
//! The transaction-log state store behind every lakelog table.
//!
//! A table's metadata is two append-only logs per table, one for file
//! references and one for the partition tree. Writers append transactions
//! with compare-and-append; readers rebuild state by loading a snapshot and
//! replaying the log tail.
//!
//! ## Storage Layout
//!
//! ```text
//! tables/{table_id}/
//! ├── properties.json                      # Table properties; presence = table exists
//! ├── transactions/
//! │   ├── files/{n:020}.json               # One object per log entry
//! │   └── partitions/{n:020}.json
//! └── snapshots/
//!     ├── files/{n:020}-{ulid}.parquet     # Materialized state at transaction n
//!     ├── files/metadata/{n:020}.json      # Snapshot metadata rows
//!     ├── files/latest.json                # CAS pointer to the newest snapshot
//!     └── partitions/...
//! ```
//!
//! ## Example
//!
//! ```rust
//! use lakelog_core::TableId;
//! use lakelog_statestore::prelude::*;
//!
//! # tokio_test::block_on(async {
//! let store = StateStore::builder(TableId::new("orders").unwrap()).build();
//! store
//!     .initialise_with_single_root(&[RowKeyField::new("id", KeyType::Long)])
//!     .await
//!     .unwrap();
//! store.add_file(FileReference::new("f1.parquet", "root", 100)).await.unwrap();
//! assert_eq!(store.file_references().await.unwrap().len(), 1);
//! # });
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod config;
pub mod error;
pub mod file_reference;
pub mod head;
pub mod log_store;
pub mod metrics;
pub mod partition;
pub mod properties_store;
pub mod snapshot;
pub mod state;
pub mod statestore;
pub mod transaction;

pub use cache::{CachedTable, StateStoreCache, StateStoreFactory};
pub use config::{StateStoreConfig, TableProperties};
pub use error::{ErrorKind, Result, StateStoreError};
pub use file_reference::{AllReferencesToAFile, AllReferencesToAllFiles, FileReference};
pub use head::TransactionLogHead;
pub use log_store::{
    InMemoryTransactionLogStore, ObjectStoreTransactionLogStore, TransactionLogStore,
};
pub use partition::{
    Key, KeyType, Partition, PartitionTree, ROOT_PARTITION_ID, Range, Region, RowKeyField,
    SplitPartitions,
};
pub use properties_store::TablePropertiesStore;
pub use snapshot::{PruneResult, SnapshotCreator, SnapshotMetadata, SnapshotRetention, SnapshotStore};
pub use state::{EntityState, StateStoreFiles, StateStorePartitions};
pub use statestore::{StateStore, StateStoreBuilder};
pub use transaction::{
    AssignJobIdRequest, FileTransaction, LogTransaction, PartitionTransaction,
    ReplaceFileReferencesRequest, SplitFileReferenceRequest, TransactionLogEntry,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{StateStoreConfig, TableProperties};
    pub use crate::error::{Result, StateStoreError};
    pub use crate::file_reference::FileReference;
    pub use crate::partition::{Key, KeyType, Partition, PartitionTree, RowKeyField};
    pub use crate::statestore::StateStore;
    pub use crate::transaction::{AssignJobIdRequest, ReplaceFileReferencesRequest};
}
