//! Basic compaction job creation.
//!
//! For each leaf partition, unassigned references are taken in filename
//! order and cut into full batches. Each batch becomes a job whose id is
//! assigned to its references in one transaction covering every batch, so
//! either all jobs of a pass are created or none are.

use std::collections::BTreeMap;

use lakelog_core::JobId;
use lakelog_statestore::{AssignJobIdRequest, FileReference, StateStore};
use tracing::{debug, info};

use crate::error::Result;
use crate::message::CompactionJob;

/// Creates compaction jobs from unassigned references.
#[derive(Debug, Clone)]
pub struct CompactionJobCreator {
    batch_size: usize,
}

impl CompactionJobCreator {
    /// Creates a job creator that puts `batch_size` files in each job.
    #[must_use]
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Creates and assigns jobs for every full batch in every leaf partition.
    ///
    /// Partial batches are left for a later pass.
    ///
    /// # Errors
    ///
    /// Returns the state store error if reading state or assigning fails. A
    /// concurrent creator that assigned some of the same references first
    /// surfaces as [`lakelog_statestore::StateStoreError::FileReferenceAssignedToJob`].
    pub async fn create_jobs(&self, store: &StateStore) -> Result<Vec<CompactionJob>> {
        let leaves = store.leaf_partitions().await?;
        let mut unassigned: BTreeMap<String, Vec<FileReference>> = BTreeMap::new();
        for reference in store.file_references_with_no_job_id().await? {
            unassigned
                .entry(reference.partition_id.clone())
                .or_default()
                .push(reference);
        }

        let mut jobs = Vec::new();
        for leaf in leaves {
            let Some(references) = unassigned.get_mut(&leaf.id) else {
                continue;
            };
            references.sort_by(|a, b| a.filename.cmp(&b.filename));
            for batch in references.chunks_exact(self.batch_size) {
                let job_id = JobId::generate();
                jobs.push(CompactionJob {
                    output_file: format!("{}/{job_id}.parquet", leaf.id),
                    job_id,
                    table_id: store.table_id().clone(),
                    partition_id: leaf.id.clone(),
                    input_files: batch.iter().map(|r| r.filename.clone()).collect(),
                });
            }
        }

        if jobs.is_empty() {
            debug!(table_id = %store.table_id(), "no full batches to compact");
            return Ok(jobs);
        }

        let requests = jobs
            .iter()
            .map(|job| AssignJobIdRequest {
                job_id: job.job_id.clone(),
                partition_id: job.partition_id.clone(),
                filenames: job.input_files.clone(),
            })
            .collect();
        store.assign_job_ids(requests).await?;
        info!(
            table_id = %store.table_id(),
            jobs = jobs.len(),
            batch_size = self.batch_size,
            "created compaction jobs"
        );
        Ok(jobs)
    }
}
