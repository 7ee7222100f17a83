//! Transactions: the typed mutations recorded in the logs.
//!
//! Each entity type has a closed set of transactions. `validate` checks every
//! precondition against current state without touching it; `apply` performs
//! the mutation and cannot fail, because it only runs after `validate` passed
//! and the append won. Replaying the same entries in the same order always
//! produces the same state.

use std::collections::BTreeSet;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use lakelog_core::JobId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StateStoreError};
use crate::file_reference::{AllReferencesToAFile, FileReference};
use crate::partition::{Partition, validate_tree};
use crate::state::{EntityState, StateStoreFiles, StateStorePartitions};

/// A mutation that can be recorded in a transaction log.
pub trait LogTransaction:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
    /// State this transaction applies to.
    type State: EntityState<Transaction = Self>;

    /// Short name for logs and metrics.
    fn kind(&self) -> &'static str;

    /// Checks preconditions against `state`. Never mutates.
    ///
    /// # Errors
    ///
    /// Returns the specific semantic error for the first failed precondition.
    fn validate(&self, state: &Self::State) -> Result<()>;

    /// Applies the mutation. Only called after `validate` succeeded.
    fn apply(&self, state: &mut Self::State, update_time: DateTime<Utc>);
}

/// One immutable entry in a transaction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionLogEntry<T> {
    /// Position in the log, starting at 1.
    pub transaction_number: u64,
    /// Time the writer appended the entry.
    pub update_time: DateTime<Utc>,
    /// The mutation.
    pub transaction: T,
}

impl<T: Serialize + DeserializeOwned> TransactionLogEntry<T> {
    /// Serializes the entry.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the transaction cannot be encoded.
    pub fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from).map_err(|e| {
            lakelog_core::Error::serialization(
                format!("encode transaction {}", self.transaction_number),
                e,
            )
            .into()
        })
    }

    /// Deserializes an entry.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the bytes are not a valid entry.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| lakelog_core::Error::serialization("decode transaction entry", e).into())
    }
}

/// Assigns a compaction job to references in one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignJobIdRequest {
    /// The job.
    pub job_id: JobId,
    /// Partition holding the references.
    pub partition_id: String,
    /// Files whose references in the partition go to the job.
    pub filenames: Vec<String>,
}

/// Replaces a finished job's input references with its output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceFileReferencesRequest {
    /// The job that produced the output.
    pub job_id: JobId,
    /// Partition the job compacted.
    pub partition_id: String,
    /// Input files whose references in the partition are retired.
    pub input_files: Vec<String>,
    /// Reference to the output file.
    pub new_reference: FileReference,
}

/// Moves a reference from a split partition down to its children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitFileReferenceRequest {
    /// File being split.
    pub filename: String,
    /// Partition whose reference is removed.
    pub from_partition_id: String,
    /// Replacement references, one per child partition.
    pub new_references: Vec<FileReference>,
}

/// Transactions on the files log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileTransaction {
    /// Tracks new files with their initial references.
    AddFiles {
        /// New references. Several may share a filename.
        files: Vec<FileReference>,
    },
    /// Assigns references to compaction jobs.
    AssignJobIds {
        /// Assignments.
        requests: Vec<AssignJobIdRequest>,
    },
    /// Commits finished compaction jobs, all or nothing.
    ReplaceFileReferences {
        /// Job commits.
        jobs: Vec<ReplaceFileReferencesRequest>,
    },
    /// Pushes references down after partition splits.
    SplitFileReferences {
        /// Splits.
        requests: Vec<SplitFileReferenceRequest>,
    },
    /// Forgets unreferenced files whose objects were deleted.
    DeleteFiles {
        /// Files to forget.
        filenames: Vec<String>,
    },
    /// Forgets every file.
    ClearFiles,
}

/// Transactions on the partitions log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionTransaction {
    /// Replaces the whole tree.
    InitialisePartitions {
        /// The new tree.
        partitions: Vec<Partition>,
    },
    /// Splits a leaf into children.
    SplitPartition {
        /// Updated record for the split partition.
        parent: Partition,
        /// The new leaves.
        new_children: Vec<Partition>,
    },
}

impl LogTransaction for FileTransaction {
    type State = StateStoreFiles;

    fn kind(&self) -> &'static str {
        match self {
            Self::AddFiles { .. } => "add_files",
            Self::AssignJobIds { .. } => "assign_job_ids",
            Self::ReplaceFileReferences { .. } => "replace_file_references",
            Self::SplitFileReferences { .. } => "split_file_references",
            Self::DeleteFiles { .. } => "delete_files",
            Self::ClearFiles => "clear_files",
        }
    }

    fn validate(&self, state: &StateStoreFiles) -> Result<()> {
        match self {
            Self::AddFiles { files } => validate_add_files(state, files),
            Self::AssignJobIds { requests } => validate_assign_job_ids(state, requests),
            Self::ReplaceFileReferences { jobs } => validate_replace(state, jobs),
            Self::SplitFileReferences { requests } => validate_split_references(state, requests),
            Self::DeleteFiles { filenames } => validate_delete_files(state, filenames),
            Self::ClearFiles => Ok(()),
        }
    }

    fn apply(&self, state: &mut StateStoreFiles, update_time: DateTime<Utc>) {
        match self {
            Self::AddFiles { files } => {
                for reference in files {
                    let mut reference = reference.clone().at(update_time);
                    reference.job_id = None;
                    let file = state.file_mut(&reference.filename);
                    if let Some(file) = file {
                        file.last_update_time = update_time;
                        file.references
                            .insert(reference.partition_id.clone(), reference);
                    } else {
                        let mut file =
                            AllReferencesToAFile::unreferenced(&reference.filename, update_time);
                        file.references
                            .insert(reference.partition_id.clone(), reference);
                        state.insert_file(file);
                    }
                }
            }
            Self::AssignJobIds { requests } => {
                for request in requests {
                    for filename in &request.filenames {
                        let Some(file) = state.file_mut(filename) else {
                            continue;
                        };
                        file.last_update_time = update_time;
                        if let Some(reference) = file.references.get_mut(&request.partition_id) {
                            reference.job_id = Some(request.job_id.clone());
                            reference.last_update_time = Some(update_time);
                        }
                    }
                }
            }
            Self::ReplaceFileReferences { jobs } => {
                for job in jobs {
                    for input in &job.input_files {
                        if let Some(file) = state.file_mut(input) {
                            file.references.remove(&job.partition_id);
                            file.last_update_time = update_time;
                        }
                    }
                    let mut output = job.new_reference.clone().at(update_time);
                    output.job_id = None;
                    let mut file = AllReferencesToAFile::unreferenced(&output.filename, update_time);
                    file.references.insert(output.partition_id.clone(), output);
                    state.insert_file(file);
                }
            }
            Self::SplitFileReferences { requests } => {
                for request in requests {
                    let Some(file) = state.file_mut(&request.filename) else {
                        continue;
                    };
                    file.references.remove(&request.from_partition_id);
                    for reference in &request.new_references {
                        let mut reference = reference.clone().at(update_time);
                        reference.job_id = None;
                        file.references
                            .insert(reference.partition_id.clone(), reference);
                    }
                    file.last_update_time = update_time;
                }
            }
            Self::DeleteFiles { filenames } => {
                for filename in filenames {
                    state.remove_file(filename);
                }
            }
            Self::ClearFiles => state.clear(),
        }
    }
}

fn validate_add_files(state: &StateStoreFiles, files: &[FileReference]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for reference in files {
        if !seen.insert((reference.partition_id.as_str(), reference.filename.as_str())) {
            return Err(StateStoreError::invalid_request(format!(
                "file {} listed twice for partition {}",
                reference.filename, reference.partition_id
            )));
        }
        if reference.job_id.is_some() {
            return Err(StateStoreError::invalid_request(format!(
                "new reference to {} cannot already belong to a job",
                reference.filename
            )));
        }
        if state.contains_file(&reference.filename) {
            return Err(StateStoreError::FileAlreadyExists {
                filename: reference.filename.clone(),
            });
        }
    }
    Ok(())
}

fn validate_assign_job_ids(state: &StateStoreFiles, requests: &[AssignJobIdRequest]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for request in requests {
        for filename in &request.filenames {
            if !seen.insert((request.partition_id.as_str(), filename.as_str())) {
                return Err(StateStoreError::invalid_request(format!(
                    "reference to {filename} in partition {} assigned twice",
                    request.partition_id
                )));
            }
            let file = state
                .file(filename)
                .ok_or_else(|| StateStoreError::FileNotFound {
                    filename: filename.clone(),
                })?;
            let reference = file.reference_in(&request.partition_id).ok_or_else(|| {
                StateStoreError::FileReferenceNotFound {
                    filename: filename.clone(),
                    partition_id: request.partition_id.clone(),
                }
            })?;
            if let Some(existing) = &reference.job_id {
                return Err(StateStoreError::FileReferenceAssignedToJob {
                    filename: filename.clone(),
                    partition_id: request.partition_id.clone(),
                    job_id: existing.clone(),
                });
            }
        }
    }
    Ok(())
}

fn validate_replace(state: &StateStoreFiles, jobs: &[ReplaceFileReferencesRequest]) -> Result<()> {
    let mut retired = BTreeSet::new();
    let mut outputs = BTreeSet::new();
    for job in jobs {
        if job.input_files.is_empty() {
            return Err(StateStoreError::invalid_request(format!(
                "job {} has no input files",
                job.job_id
            )));
        }
        if job.new_reference.partition_id != job.partition_id {
            return Err(StateStoreError::invalid_request(format!(
                "output of job {} is in partition {}, expected {}",
                job.job_id, job.new_reference.partition_id, job.partition_id
            )));
        }
        for input in &job.input_files {
            if !retired.insert((job.partition_id.as_str(), input.as_str())) {
                return Err(StateStoreError::invalid_request(format!(
                    "input {input} in partition {} retired twice",
                    job.partition_id
                )));
            }
            let file = state.file(input).ok_or_else(|| StateStoreError::FileNotFound {
                filename: input.clone(),
            })?;
            let reference = file.reference_in(&job.partition_id).ok_or_else(|| {
                StateStoreError::FileReferenceNotFound {
                    filename: input.clone(),
                    partition_id: job.partition_id.clone(),
                }
            })?;
            if reference.job_id.as_ref() != Some(&job.job_id) {
                return Err(StateStoreError::FileReferenceNotAssignedToJob {
                    filename: input.clone(),
                    partition_id: job.partition_id.clone(),
                    job_id: job.job_id.clone(),
                });
            }
        }
        let output = &job.new_reference.filename;
        if job.input_files.contains(output) {
            return Err(StateStoreError::NewReferenceSameAsOldReference {
                filename: output.clone(),
            });
        }
        if state.contains_file(output) || !outputs.insert(output.as_str()) {
            return Err(StateStoreError::FileAlreadyExists {
                filename: output.clone(),
            });
        }
    }
    Ok(())
}

fn validate_split_references(
    state: &StateStoreFiles,
    requests: &[SplitFileReferenceRequest],
) -> Result<()> {
    let mut removed = BTreeSet::new();
    let mut added = BTreeSet::new();
    for request in requests {
        if request.new_references.is_empty() {
            return Err(StateStoreError::invalid_request(format!(
                "split of {} has no new references",
                request.filename
            )));
        }
        if !removed.insert((request.filename.as_str(), request.from_partition_id.as_str())) {
            return Err(StateStoreError::invalid_request(format!(
                "reference to {} in partition {} split twice",
                request.filename, request.from_partition_id
            )));
        }
        let file = state
            .file(&request.filename)
            .ok_or_else(|| StateStoreError::FileNotFound {
                filename: request.filename.clone(),
            })?;
        let old = file.reference_in(&request.from_partition_id).ok_or_else(|| {
            StateStoreError::FileReferenceNotFound {
                filename: request.filename.clone(),
                partition_id: request.from_partition_id.clone(),
            }
        })?;
        if let Some(job_id) = &old.job_id {
            return Err(StateStoreError::FileReferenceAssignedToJob {
                filename: request.filename.clone(),
                partition_id: request.from_partition_id.clone(),
                job_id: job_id.clone(),
            });
        }
        for new in &request.new_references {
            if new.filename != request.filename {
                return Err(StateStoreError::invalid_request(format!(
                    "split of {} produced a reference to {}",
                    request.filename, new.filename
                )));
            }
            if new.partition_id == request.from_partition_id
                || !added.insert((new.filename.as_str(), new.partition_id.as_str()))
            {
                return Err(StateStoreError::invalid_request(format!(
                    "split of {} repeats partition {}",
                    request.filename, new.partition_id
                )));
            }
            if file.reference_in(&new.partition_id).is_some() {
                return Err(StateStoreError::FileReferenceAlreadyExists {
                    filename: new.filename.clone(),
                    partition_id: new.partition_id.clone(),
                });
            }
        }
    }
    Ok(())
}

fn validate_delete_files(state: &StateStoreFiles, filenames: &[String]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for filename in filenames {
        if !seen.insert(filename.as_str()) {
            return Err(StateStoreError::invalid_request(format!(
                "file {filename} listed twice for deletion"
            )));
        }
        let file = state
            .file(filename)
            .ok_or_else(|| StateStoreError::FileNotFound {
                filename: filename.clone(),
            })?;
        if !file.is_unreferenced() {
            return Err(StateStoreError::FileHasReferences {
                filename: filename.clone(),
                reference_count: file.total_reference_count(),
            });
        }
    }
    Ok(())
}

impl LogTransaction for PartitionTransaction {
    type State = StateStorePartitions;

    fn kind(&self) -> &'static str {
        match self {
            Self::InitialisePartitions { .. } => "initialise_partitions",
            Self::SplitPartition { .. } => "split_partition",
        }
    }

    fn validate(&self, state: &StateStorePartitions) -> Result<()> {
        match self {
            Self::InitialisePartitions { partitions } => validate_tree(partitions),
            Self::SplitPartition {
                parent,
                new_children,
            } => validate_split_partition(state, parent, new_children),
        }
    }

    fn apply(&self, state: &mut StateStorePartitions, _update_time: DateTime<Utc>) {
        match self {
            Self::InitialisePartitions { partitions } => {
                state.clear();
                for partition in partitions {
                    state.put(partition.clone());
                }
            }
            Self::SplitPartition {
                parent,
                new_children,
            } => {
                state.put(parent.clone());
                for child in new_children {
                    state.put(child.clone());
                }
            }
        }
    }
}

fn validate_split_partition(
    state: &StateStorePartitions,
    parent: &Partition,
    new_children: &[Partition],
) -> Result<()> {
    let existing = state
        .partition(&parent.id)
        .ok_or_else(|| StateStoreError::PartitionNotFound {
            partition_id: parent.id.clone(),
        })?;
    if !existing.is_leaf {
        return Err(StateStoreError::PartitionNotLeaf {
            partition_id: parent.id.clone(),
        });
    }
    if parent.is_leaf || parent.dimension.is_none() {
        return Err(StateStoreError::invalid_tree(format!(
            "split partition {} must become internal with a dimension",
            parent.id
        )));
    }
    if parent.parent_id != existing.parent_id {
        return Err(StateStoreError::invalid_tree(format!(
            "split partition {} cannot change its parent",
            parent.id
        )));
    }
    if new_children.len() < 2 {
        return Err(StateStoreError::invalid_tree(format!(
            "split of {} needs at least two children",
            parent.id
        )));
    }

    let listed: BTreeSet<&str> = parent.child_ids.iter().map(String::as_str).collect();
    let given: BTreeSet<&str> = new_children.iter().map(|c| c.id.as_str()).collect();
    if listed != given || given.len() != new_children.len() {
        return Err(StateStoreError::invalid_tree(format!(
            "children of {} do not match the new partitions",
            parent.id
        )));
    }

    for child in new_children {
        if state.contains(&child.id) {
            return Err(StateStoreError::PartitionAlreadyExists {
                partition_id: child.id.clone(),
            });
        }
        if !child.is_leaf || !child.child_ids.is_empty() {
            return Err(StateStoreError::invalid_tree(format!(
                "new partition {} must be a leaf",
                child.id
            )));
        }
        if child.parent_id.as_deref() != Some(parent.id.as_str()) {
            return Err(StateStoreError::invalid_tree(format!(
                "new partition {} does not name parent {}",
                child.id, parent.id
            )));
        }
    }
    Ok(())
}
