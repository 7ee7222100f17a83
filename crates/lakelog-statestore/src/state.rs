//! Materialized state built by replaying the transaction logs.
//!
//! [`StateStoreFiles`] and [`StateStorePartitions`] are plain indices. Their
//! mutators are crate-private: the only code that changes them is transaction
//! `apply`, and the snapshot decoder that rebuilds them.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use lakelog_core::EntityType;

use crate::error::Result;
use crate::file_reference::{AllReferencesToAFile, AllReferencesToAllFiles, FileReference};
use crate::partition::Partition;
use crate::snapshot::codec;
use crate::transaction::{FileTransaction, LogTransaction, PartitionTransaction};

/// State materialized from one entity type's log.
pub trait EntityState: Default + Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    /// Transactions that apply to this state.
    type Transaction: LogTransaction<State = Self>;

    /// Which log this state is built from.
    const ENTITY: EntityType;

    /// Encodes the state as a snapshot object tagged with `transaction_number`.
    ///
    /// # Errors
    ///
    /// Returns an error if columnar encoding fails.
    fn encode_snapshot(&self, transaction_number: u64) -> Result<Bytes>;

    /// Decodes a snapshot object into state and the transaction number it reflects.
    ///
    /// # Errors
    ///
    /// Returns an error if the object is not a valid snapshot of this entity type.
    fn decode_snapshot(bytes: &Bytes) -> Result<(Self, u64)>;
}

/// Every tracked file and its references, keyed by filename.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StateStoreFiles {
    files: BTreeMap<String, AllReferencesToAFile>,
}

impl StateStoreFiles {
    /// Builds state from file aggregates.
    pub(crate) fn from_files(files: impl IntoIterator<Item = AllReferencesToAFile>) -> Self {
        Self {
            files: files.into_iter().map(|f| (f.filename.clone(), f)).collect(),
        }
    }

    /// Returns the aggregate for a file.
    #[must_use]
    pub fn file(&self, filename: &str) -> Option<&AllReferencesToAFile> {
        self.files.get(filename)
    }

    /// Returns true if the file is tracked.
    #[must_use]
    pub fn contains_file(&self, filename: &str) -> bool {
        self.files.contains_key(filename)
    }

    /// Returns the reference a partition holds on a file.
    #[must_use]
    pub fn reference(&self, filename: &str, partition_id: &str) -> Option<&FileReference> {
        self.files.get(filename)?.reference_in(partition_id)
    }

    /// Iterates over tracked files in filename order.
    pub fn files(&self) -> impl Iterator<Item = &AllReferencesToAFile> {
        self.files.values()
    }

    /// Iterates over every live reference.
    pub fn references(&self) -> impl Iterator<Item = &FileReference> {
        self.files.values().flat_map(AllReferencesToAFile::iter_references)
    }

    /// Number of tracked files, referenced or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if no files are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// References not yet assigned to a compaction job.
    #[must_use]
    pub fn references_with_no_job_id(&self) -> Vec<FileReference> {
        self.references()
            .filter(|r| r.job_id.is_none())
            .cloned()
            .collect()
    }

    /// Filenames referenced by each partition.
    #[must_use]
    pub fn partition_to_referenced_files(&self) -> BTreeMap<String, Vec<String>> {
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for reference in self.references() {
            out.entry(reference.partition_id.clone())
                .or_default()
                .push(reference.filename.clone());
        }
        out
    }

    /// Unreferenced files last updated at or before `cutoff`.
    #[must_use]
    pub fn ready_for_gc_before(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        self.files
            .values()
            .filter(|f| f.is_unreferenced() && f.last_update_time <= cutoff)
            .map(|f| f.filename.clone())
            .collect()
    }

    /// All referenced files plus at most `max_unreferenced` unreferenced ones.
    #[must_use]
    pub fn all_files_with_max_unreferenced(&self, max_unreferenced: usize) -> AllReferencesToAllFiles {
        let (referenced, unreferenced): (Vec<_>, Vec<_>) =
            self.files.values().partition(|f| !f.is_unreferenced());
        let more_than_max = unreferenced.len() > max_unreferenced;
        let files = referenced
            .into_iter()
            .chain(unreferenced.into_iter().take(max_unreferenced))
            .cloned()
            .collect();
        AllReferencesToAllFiles {
            files,
            more_than_max,
        }
    }

    pub(crate) fn insert_file(&mut self, file: AllReferencesToAFile) {
        self.files.insert(file.filename.clone(), file);
    }

    pub(crate) fn file_mut(&mut self, filename: &str) -> Option<&mut AllReferencesToAFile> {
        self.files.get_mut(filename)
    }

    pub(crate) fn remove_file(&mut self, filename: &str) {
        self.files.remove(filename);
    }

    pub(crate) fn clear(&mut self) {
        self.files.clear();
    }
}

impl EntityState for StateStoreFiles {
    type Transaction = FileTransaction;

    const ENTITY: EntityType = EntityType::Files;

    fn encode_snapshot(&self, transaction_number: u64) -> Result<Bytes> {
        codec::write_files(self, transaction_number)
    }

    fn decode_snapshot(bytes: &Bytes) -> Result<(Self, u64)> {
        codec::read_files(bytes)
    }
}

/// The partition tree, keyed by partition ID.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StateStorePartitions {
    partitions: BTreeMap<String, Partition>,
}

impl StateStorePartitions {
    /// Builds state from partitions.
    pub(crate) fn from_partitions(partitions: impl IntoIterator<Item = Partition>) -> Self {
        Self {
            partitions: partitions.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    /// Returns a partition by ID.
    #[must_use]
    pub fn partition(&self, partition_id: &str) -> Option<&Partition> {
        self.partitions.get(partition_id)
    }

    /// Returns true if the partition exists.
    #[must_use]
    pub fn contains(&self, partition_id: &str) -> bool {
        self.partitions.contains_key(partition_id)
    }

    /// Iterates over all partitions in ID order.
    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.values()
    }

    /// Iterates over leaf partitions in ID order.
    pub fn leaves(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.values().filter(|p| p.is_leaf)
    }

    /// Returns the root partition, if initialised.
    #[must_use]
    pub fn root(&self) -> Option<&Partition> {
        self.partitions.values().find(|p| p.is_root())
    }

    /// Number of partitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// Returns true if the tree has not been initialised.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub(crate) fn put(&mut self, partition: Partition) {
        self.partitions.insert(partition.id.clone(), partition);
    }

    pub(crate) fn clear(&mut self) {
        self.partitions.clear();
    }
}

impl EntityState for StateStorePartitions {
    type Transaction = PartitionTransaction;

    const ENTITY: EntityType = EntityType::Partitions;

    fn encode_snapshot(&self, transaction_number: u64) -> Result<Bytes> {
        codec::write_partitions(self, transaction_number)
    }

    fn decode_snapshot(bytes: &Bytes) -> Result<(Self, u64)> {
        codec::read_partitions(bytes)
    }
}
