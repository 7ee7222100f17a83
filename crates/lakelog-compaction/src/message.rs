//! The commit request a compaction worker sends when a job finishes.

use chrono::{DateTime, Utc};
use lakelog_core::{JobId, TableId};
use lakelog_statestore::{FileReference, ReplaceFileReferencesRequest};
use serde::{Deserialize, Serialize};

use crate::error::{CommitError, Result};

/// A compaction job: merge `input_files` in one partition into `output_file`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionJob {
    /// Job id, assigned to the input references before the job runs.
    pub job_id: JobId,
    /// Table the job belongs to.
    pub table_id: TableId,
    /// Partition whose references are compacted.
    pub partition_id: String,
    /// Input files.
    pub input_files: Vec<String>,
    /// Output file the job writes.
    pub output_file: String,
}

/// Row counts and timing reported by the worker that ran a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordsProcessedSummary {
    /// Rows read from the inputs.
    pub records_read: u64,
    /// Rows written to the output.
    pub records_written: u64,
    /// When the job started.
    pub start_time: DateTime<Utc>,
    /// When the job finished.
    pub finish_time: DateTime<Utc>,
}

/// Request to commit a finished job to the state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionJobCommitRequest {
    /// The finished job.
    pub job: CompactionJob,
    /// Id of the task run that executed the job.
    pub task_id: String,
    /// What the run processed.
    pub summary: RecordsProcessedSummary,
}

impl CompactionJobCommitRequest {
    /// Decodes a request from a JSON message body.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError::InvalidMessage`] for malformed JSON or a job
    /// with no inputs.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        let request: Self = serde_json::from_slice(body).map_err(|e| CommitError::InvalidMessage {
            message: e.to_string(),
        })?;
        if request.job.input_files.is_empty() {
            return Err(CommitError::InvalidMessage {
                message: format!("job {} has no input files", request.job.job_id),
            });
        }
        Ok(request)
    }

    /// Encodes the request as a JSON message body.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError::InvalidMessage`] if encoding fails.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CommitError::InvalidMessage {
            message: e.to_string(),
        })
    }

    /// The replace transaction request this commit applies.
    ///
    /// The output's record count is the number of records the job wrote.
    #[must_use]
    pub fn to_replace_request(&self) -> ReplaceFileReferencesRequest {
        ReplaceFileReferencesRequest {
            job_id: self.job.job_id.clone(),
            partition_id: self.job.partition_id.clone(),
            input_files: self.job.input_files.clone(),
            new_reference: FileReference::new(
                self.job.output_file.clone(),
                self.job.partition_id.clone(),
                self.summary.records_written,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CompactionJobCommitRequest {
        CompactionJobCommitRequest {
            job: CompactionJob {
                job_id: JobId::new("job-1"),
                table_id: TableId::new("orders").unwrap(),
                partition_id: "root".into(),
                input_files: vec!["a".into(), "b".into()],
                output_file: "c".into(),
            },
            task_id: "task-1".into(),
            summary: RecordsProcessedSummary {
                records_read: 30,
                records_written: 25,
                start_time: DateTime::from_timestamp(0, 0).unwrap(),
                finish_time: DateTime::from_timestamp(5, 0).unwrap(),
            },
        }
    }

    #[test]
    fn replace_request_uses_records_written() {
        let replace = request().to_replace_request();
        assert_eq!(replace.new_reference.filename, "c");
        assert_eq!(replace.new_reference.partition_id, "root");
        assert_eq!(replace.new_reference.number_of_records, 25);
        assert!(replace.new_reference.job_id.is_none());
    }

    #[test]
    fn rejects_malformed_messages() {
        assert!(matches!(
            CompactionJobCommitRequest::from_json(b"{not json"),
            Err(CommitError::InvalidMessage { .. })
        ));

        let mut empty = request();
        empty.job.input_files.clear();
        let body = serde_json::to_vec(&empty).unwrap();
        assert!(matches!(
            CompactionJobCommitRequest::from_json(&body),
            Err(CommitError::InvalidMessage { .. })
        ));

        let body = request().to_json().unwrap();
        let text = String::from_utf8(body.clone()).unwrap();
        assert!(text.contains("\"recordsWritten\":25"));
        assert_eq!(CompactionJobCommitRequest::from_json(&body).unwrap(), request());
    }
}
