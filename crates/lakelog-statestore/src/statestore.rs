//! The state store for one table.
//!
//! [`StateStore`] pairs a files head and a partitions head. Each head sits
//! behind its own mutex, so file and partition operations never wait on each
//! other, while operations on the same entity type from one process are
//! serialized before they reach the log.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lakelog_core::observability::statestore_span;
use lakelog_core::{Clock, EntityType, JitterFn, StorageBackend, SystemClock, TableId};
use tokio::sync::Mutex;
use tracing::{Instrument, warn};

use crate::config::{StateStoreConfig, TableProperties};
use crate::error::{Result, StateStoreError};
use crate::file_reference::{AllReferencesToAllFiles, FileReference};
use crate::head::TransactionLogHead;
use crate::log_store::{
    InMemoryTransactionLogStore, ObjectStoreTransactionLogStore, TransactionLogStore,
};
use crate::partition::{Partition, PartitionTree, RowKeyField};
use crate::snapshot::{PruneResult, SnapshotCreator, SnapshotMetadata, SnapshotRetention, SnapshotStore};
use crate::state::{StateStoreFiles, StateStorePartitions};
use crate::transaction::{
    AssignJobIdRequest, FileTransaction, PartitionTransaction, ReplaceFileReferencesRequest,
    SplitFileReferenceRequest,
};

/// Builder for [`StateStore`].
pub struct StateStoreBuilder {
    table_id: TableId,
    storage: Option<Arc<dyn StorageBackend>>,
    config: StateStoreConfig,
    clock: Arc<dyn Clock>,
    jitter: Option<JitterFn>,
}

impl StateStoreBuilder {
    /// Persists logs and snapshots in `storage`.
    ///
    /// Without storage the logs live in memory and snapshots are disabled.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Sets tuning.
    #[must_use]
    pub fn config(mut self, config: StateStoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the clock that stamps update times.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the jitter source for conflict backoff.
    #[must_use]
    pub fn jitter(mut self, jitter: JitterFn) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Builds the state store. Nothing is read until the first operation.
    #[must_use]
    pub fn build(self) -> StateStore {
        let (files_log, partitions_log, snapshots): (
            Arc<dyn TransactionLogStore>,
            Arc<dyn TransactionLogStore>,
            Option<SnapshotStore>,
        ) = match &self.storage {
            Some(storage) => (
                Arc::new(ObjectStoreTransactionLogStore::new(
                    storage.clone(),
                    self.table_id.clone(),
                    EntityType::Files,
                )),
                Arc::new(ObjectStoreTransactionLogStore::new(
                    storage.clone(),
                    self.table_id.clone(),
                    EntityType::Partitions,
                )),
                Some(SnapshotStore::new(storage.clone(), self.table_id.clone())),
            ),
            None => (
                Arc::new(InMemoryTransactionLogStore::new(
                    self.table_id.clone(),
                    EntityType::Files,
                )),
                Arc::new(InMemoryTransactionLogStore::new(
                    self.table_id.clone(),
                    EntityType::Partitions,
                )),
                None,
            ),
        };

        let mut retry = self.config.retry_policy();
        if let Some(jitter) = self.jitter {
            retry = retry.with_jitter(jitter);
        }

        let files = TransactionLogHead::new(
            self.table_id.clone(),
            files_log.clone(),
            snapshots.clone(),
            self.config.clone(),
            retry.clone(),
            self.clock.clone(),
        );
        let partitions = TransactionLogHead::new(
            self.table_id.clone(),
            partitions_log.clone(),
            snapshots.clone(),
            self.config,
            retry,
            self.clock.clone(),
        );

        StateStore {
            table_id: self.table_id,
            clock: self.clock,
            files_log,
            partitions_log,
            snapshots,
            files: Mutex::new(files),
            partitions: Mutex::new(partitions),
        }
    }
}

/// File references and the partition tree of one table.
pub struct StateStore {
    table_id: TableId,
    clock: Arc<dyn Clock>,
    files_log: Arc<dyn TransactionLogStore>,
    partitions_log: Arc<dyn TransactionLogStore>,
    snapshots: Option<SnapshotStore>,
    files: Mutex<TransactionLogHead<StateStoreFiles>>,
    partitions: Mutex<TransactionLogHead<StateStorePartitions>>,
}

impl StateStore {
    /// Starts building a state store for `table_id`.
    #[must_use]
    pub fn builder(table_id: TableId) -> StateStoreBuilder {
        StateStoreBuilder {
            table_id,
            storage: None,
            config: StateStoreConfig::default(),
            clock: Arc::new(SystemClock),
            jitter: None,
        }
    }

    /// The table this store manages.
    #[must_use]
    pub fn table_id(&self) -> &TableId {
        &self.table_id
    }

    /// The store's clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    async fn write_files(&self, operation: &str, transaction: FileTransaction) -> Result<u64> {
        let span = statestore_span(operation, self.table_id.as_str(), EntityType::Files.as_str());
        async { self.files.lock().await.add_transaction(transaction).await }
            .instrument(span)
            .await
    }

    async fn write_partitions(
        &self,
        operation: &str,
        transaction: PartitionTransaction,
    ) -> Result<u64> {
        let span = statestore_span(
            operation,
            self.table_id.as_str(),
            EntityType::Partitions.as_str(),
        );
        async { self.partitions.lock().await.add_transaction(transaction).await }
            .instrument(span)
            .await
    }

    async fn read_files<R>(&self, read: impl FnOnce(&StateStoreFiles) -> R) -> Result<R> {
        let mut head = self.files.lock().await;
        head.update().await?;
        Ok(read(head.state()))
    }

    async fn read_partitions<R>(&self, read: impl FnOnce(&StateStorePartitions) -> R) -> Result<R> {
        let mut head = self.partitions.lock().await;
        head.update().await?;
        Ok(read(head.state()))
    }

    async fn require_partitions<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let missing = self
            .read_partitions(|state| ids.into_iter().find(|id| !state.contains(id)).map(str::to_owned))
            .await?;
        match missing {
            Some(partition_id) => Err(StateStoreError::PartitionNotFound { partition_id }),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Partitions
    // =========================================================================

    /// Replaces the partition tree.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError::StateStoreNotEmpty`] if any file is tracked,
    /// or [`StateStoreError::InvalidPartitionTree`] for an inconsistent tree.
    pub async fn initialise(&self, partitions: Vec<Partition>) -> Result<()> {
        if !self.read_files(StateStoreFiles::is_empty).await? {
            return Err(StateStoreError::StateStoreNotEmpty {
                table_id: self.table_id.clone(),
            });
        }
        self.write_partitions(
            "initialise",
            PartitionTransaction::InitialisePartitions { partitions },
        )
        .await?;
        Ok(())
    }

    /// Replaces the partition tree with a single root covering all keys.
    ///
    /// # Errors
    ///
    /// See [`StateStore::initialise`].
    pub async fn initialise_with_single_root(&self, fields: &[RowKeyField]) -> Result<()> {
        self.initialise(vec![PartitionTree::root(fields)]).await
    }

    /// Splits a leaf partition.
    ///
    /// `parent` is the updated record for the split partition; see
    /// [`PartitionTree::split`].
    ///
    /// # Errors
    ///
    /// Returns the partition validation error.
    pub async fn split_partition(&self, parent: Partition, new_children: Vec<Partition>) -> Result<()> {
        self.write_partitions(
            "split_partition",
            PartitionTransaction::SplitPartition {
                parent,
                new_children,
            },
        )
        .await?;
        Ok(())
    }

    /// All partitions, in id order.
    ///
    /// # Errors
    ///
    /// Returns an error if the partitions log cannot be read.
    pub async fn all_partitions(&self) -> Result<Vec<Partition>> {
        self.read_partitions(|state| state.partitions().cloned().collect())
            .await
    }

    /// Leaf partitions, in id order.
    ///
    /// # Errors
    ///
    /// Returns an error if the partitions log cannot be read.
    pub async fn leaf_partitions(&self) -> Result<Vec<Partition>> {
        self.read_partitions(|state| state.leaves().cloned().collect())
            .await
    }

    /// One partition by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the partitions log cannot be read.
    pub async fn partition(&self, partition_id: &str) -> Result<Option<Partition>> {
        self.read_partitions(|state| state.partition(partition_id).cloned())
            .await
    }

    /// A copy of the current partitions state.
    ///
    /// # Errors
    ///
    /// Returns an error if the partitions log cannot be read.
    pub async fn partitions_state(&self) -> Result<StateStorePartitions> {
        self.read_partitions(StateStorePartitions::clone).await
    }

    /// Transaction number the cached partitions state reflects, after updating.
    ///
    /// # Errors
    ///
    /// Returns an error if the partitions log cannot be read.
    pub async fn partitions_transaction_number(&self) -> Result<u64> {
        let mut head = self.partitions.lock().await;
        head.update().await?;
        Ok(head.transaction_number())
    }

    // =========================================================================
    // Files
    // =========================================================================

    /// Tracks new files.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError::PartitionNotFound`] if a reference names an
    /// unknown partition, [`StateStoreError::FileAlreadyExists`] for a known
    /// filename, or [`StateStoreError::InvalidRequest`] for duplicates within
    /// the request.
    pub async fn add_files(&self, files: Vec<FileReference>) -> Result<()> {
        self.require_partitions(files.iter().map(|f| f.partition_id.as_str()))
            .await?;
        self.write_files("add_files", FileTransaction::AddFiles { files })
            .await?;
        Ok(())
    }

    /// Tracks one new file.
    ///
    /// # Errors
    ///
    /// See [`StateStore::add_files`].
    pub async fn add_file(&self, file: FileReference) -> Result<()> {
        self.add_files(vec![file]).await
    }

    /// Assigns compaction jobs to references. All or nothing.
    ///
    /// # Errors
    ///
    /// Returns the first failed precondition; nothing is assigned.
    pub async fn assign_job_ids(&self, requests: Vec<AssignJobIdRequest>) -> Result<()> {
        self.write_files("assign_job_ids", FileTransaction::AssignJobIds { requests })
            .await?;
        Ok(())
    }

    /// Commits one finished compaction job.
    ///
    /// # Errors
    ///
    /// See [`StateStore::atomically_replace_file_references_with_new_ones`].
    pub async fn atomically_replace_file_references_with_new_one(
        &self,
        request: ReplaceFileReferencesRequest,
    ) -> Result<()> {
        self.atomically_replace_file_references_with_new_ones(vec![request])
            .await
    }

    /// Commits finished compaction jobs in one transaction. All or nothing.
    ///
    /// # Errors
    ///
    /// Returns the first failed precondition, such as
    /// [`StateStoreError::FileReferenceNotAssignedToJob`] when the input
    /// references are not (yet) assigned to the job.
    pub async fn atomically_replace_file_references_with_new_ones(
        &self,
        jobs: Vec<ReplaceFileReferencesRequest>,
    ) -> Result<()> {
        self.write_files(
            "replace_file_references",
            FileTransaction::ReplaceFileReferences { jobs },
        )
        .await?;
        Ok(())
    }

    /// Moves references from split partitions to their children.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError::PartitionNotFound`] for an unknown target
    /// partition, or the first failed reference precondition.
    pub async fn split_file_references(&self, requests: Vec<SplitFileReferenceRequest>) -> Result<()> {
        self.require_partitions(
            requests
                .iter()
                .flat_map(|r| r.new_references.iter().map(|f| f.partition_id.as_str())),
        )
        .await?;
        self.write_files(
            "split_file_references",
            FileTransaction::SplitFileReferences { requests },
        )
        .await?;
        Ok(())
    }

    /// Forgets files whose objects the garbage collector deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError::FileNotFound`] or
    /// [`StateStoreError::FileHasReferences`]; nothing is forgotten.
    pub async fn delete_garbage_collected_files(&self, filenames: Vec<String>) -> Result<()> {
        self.write_files("delete_files", FileTransaction::DeleteFiles { filenames })
            .await?;
        Ok(())
    }

    /// Forgets every file.
    ///
    /// # Errors
    ///
    /// Returns an error if the append fails.
    pub async fn clear_file_data(&self) -> Result<()> {
        self.write_files("clear_files", FileTransaction::ClearFiles)
            .await?;
        Ok(())
    }

    /// Every reference, ordered by filename then partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the files log cannot be read.
    pub async fn file_references(&self) -> Result<Vec<FileReference>> {
        self.read_files(|state| state.references().cloned().collect())
            .await
    }

    /// References not assigned to any job.
    ///
    /// # Errors
    ///
    /// Returns an error if the files log cannot be read.
    pub async fn file_references_with_no_job_id(&self) -> Result<Vec<FileReference>> {
        self.read_files(StateStoreFiles::references_with_no_job_id)
            .await
    }

    /// Filenames referenced from each partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the files log cannot be read.
    pub async fn partition_to_referenced_files(&self) -> Result<BTreeMap<String, Vec<String>>> {
        self.read_files(StateStoreFiles::partition_to_referenced_files)
            .await
    }

    /// Unreferenced files last updated at or before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns an error if the files log cannot be read.
    pub async fn ready_for_gc_filenames_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        self.read_files(|state| state.ready_for_gc_before(cutoff))
            .await
    }

    /// All referenced files plus at most `max_unreferenced` unreferenced ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the files log cannot be read.
    pub async fn all_files_with_max_unreferenced(
        &self,
        max_unreferenced: usize,
    ) -> Result<AllReferencesToAllFiles> {
        self.read_files(|state| state.all_files_with_max_unreferenced(max_unreferenced))
            .await
    }

    /// A copy of the current files state.
    ///
    /// # Errors
    ///
    /// Returns an error if the files log cannot be read.
    pub async fn files_state(&self) -> Result<StateStoreFiles> {
        self.read_files(StateStoreFiles::clone).await
    }

    /// Transaction number the cached files state reflects, after updating.
    ///
    /// # Errors
    ///
    /// Returns an error if the files log cannot be read.
    pub async fn files_transaction_number(&self) -> Result<u64> {
        let mut head = self.files.lock().await;
        head.update().await?;
        Ok(head.transaction_number())
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Writes a snapshot of each entity type that has new transactions.
    ///
    /// Returns the snapshots written. A store without persistent storage
    /// writes nothing. An entity type whose snapshot already exists is
    /// logged and skipped, so the other one still runs.
    ///
    /// # Errors
    ///
    /// Returns an error if a log or snapshot cannot be read or written.
    pub async fn create_snapshots(&self) -> Result<Vec<SnapshotMetadata>> {
        let Some(snapshots) = &self.snapshots else {
            return Ok(Vec::new());
        };
        let files = SnapshotCreator::<StateStoreFiles>::new(
            self.files_log.clone(),
            snapshots.clone(),
            self.clock.clone(),
        );
        let partitions = SnapshotCreator::<StateStorePartitions>::new(
            self.partitions_log.clone(),
            snapshots.clone(),
            self.clock.clone(),
        );
        let mut created = Vec::new();
        created.extend(skip_duplicate(files.create().await)?);
        created.extend(skip_duplicate(partitions.create().await)?);
        Ok(created)
    }

    /// Prunes old snapshots of each entity type under `properties`.
    ///
    /// # Errors
    ///
    /// Returns an error if listing, deleting, or truncating fails.
    pub async fn prune_snapshots(&self, properties: &TableProperties) -> Result<Vec<(EntityType, PruneResult)>> {
        let Some(snapshots) = &self.snapshots else {
            return Ok(Vec::new());
        };
        let retention = SnapshotRetention::new(snapshots.clone(), self.clock.clone(), properties.clone());
        Ok(vec![
            (
                EntityType::Files,
                retention.prune(EntityType::Files, self.files_log.as_ref()).await?,
            ),
            (
                EntityType::Partitions,
                retention
                    .prune(EntityType::Partitions, self.partitions_log.as_ref())
                    .await?,
            ),
        ])
    }
}

fn skip_duplicate(
    created: Result<Option<SnapshotMetadata>>,
) -> Result<Option<SnapshotMetadata>> {
    match created {
        Err(StateStoreError::DuplicateSnapshot {
            table_id,
            entity,
            transaction_number,
        }) => {
            warn!(
                table_id = %table_id,
                entity = %entity,
                transaction_number,
                "snapshot already exists, skipping"
            );
            Ok(None)
        }
        other => other,
    }
}
