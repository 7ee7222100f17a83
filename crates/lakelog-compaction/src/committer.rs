//! Commits finished compaction jobs.
//!
//! A job's input references are assigned to it by an earlier transaction. A
//! worker can finish and report before a given reader sees that assignment,
//! so a commit that fails with
//! [`StateStoreError::FileReferenceNotAssignedToJob`] backs off and retries.
//! Every other rejection fails immediately.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use lakelog_core::observability::worker_span;
use lakelog_core::{JitterFn, JobId, TableId};
use lakelog_statestore::{StateStore, StateStoreCache, StateStoreError};
use tracing::{Instrument, debug, info, warn};

use crate::config::CommitterConfig;
use crate::error::{CommitError, Result};
use crate::message::CompactionJobCommitRequest;
use crate::metrics;

/// What a message consumer should do with a commit message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Committed (or already committed); remove the message.
    Ack,
    /// Transient failure; redeliver later.
    Retry,
    /// The message can never succeed; park it.
    DeadLetter,
}

/// Result of one request in a [`CompactionJobCommitter::commit_all`] batch.
#[derive(Debug)]
pub struct CommitOutcome {
    /// The job's table.
    pub table_id: TableId,
    /// The job.
    pub job_id: JobId,
    /// Whether it committed.
    pub result: Result<()>,
}

/// Applies finished jobs as replace transactions.
#[derive(Clone)]
pub struct CompactionJobCommitter {
    config: CommitterConfig,
    jitter: Option<JitterFn>,
}

impl CompactionJobCommitter {
    /// Creates a committer.
    #[must_use]
    pub fn new(config: CommitterConfig) -> Self {
        Self {
            config,
            jitter: None,
        }
    }

    /// Replaces the backoff jitter source.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterFn) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Commits one job to `store`.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError::TimedOutWaitingForFileAssignments`] if the
    /// inputs are still not assigned to the job after the last attempt, and
    /// [`CommitError::StateStore`] for any other rejection.
    pub async fn commit(&self, store: &StateStore, request: &CompactionJobCommitRequest) -> Result<()> {
        let job = &request.job;
        let mut policy = self.config.retry_policy();
        if let Some(jitter) = &self.jitter {
            policy = policy.with_jitter(jitter.clone());
        }
        let mut retry = policy.start();

        loop {
            let attempt = retry.begin_attempt();
            let result = store
                .atomically_replace_file_references_with_new_one(request.to_replace_request())
                .await;
            match result {
                Ok(()) => {
                    metrics::record_commit("committed");
                    info!(
                        table_id = %job.table_id,
                        job_id = %job.job_id,
                        partition_id = %job.partition_id,
                        inputs = job.input_files.len(),
                        output = %job.output_file,
                        records_written = request.summary.records_written,
                        attempt,
                        "committed compaction job"
                    );
                    return Ok(());
                }
                Err(e @ StateStoreError::FileReferenceNotAssignedToJob { .. }) => {
                    if !retry.can_retry() {
                        metrics::record_commit("timed_out");
                        warn!(
                            table_id = %job.table_id,
                            job_id = %job.job_id,
                            attempts = attempt,
                            error = %e,
                            "gave up waiting for file assignments"
                        );
                        return Err(CommitError::TimedOutWaitingForFileAssignments {
                            table_id: job.table_id.clone(),
                            job_id: job.job_id.clone(),
                            attempts: attempt,
                            last_error: e,
                        });
                    }
                    metrics::record_commit_retry();
                    let waited = retry.backoff().await;
                    debug!(
                        table_id = %job.table_id,
                        job_id = %job.job_id,
                        attempt,
                        waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                        "files not yet assigned to job, retrying"
                    );
                }
                Err(e) => {
                    if inputs_already_retired(&e) && already_committed(store, request).await? {
                        metrics::record_commit("committed");
                        info!(
                            table_id = %job.table_id,
                            job_id = %job.job_id,
                            "compaction job already committed"
                        );
                        return Ok(());
                    }
                    metrics::record_commit("failed");
                    warn!(
                        table_id = %job.table_id,
                        job_id = %job.job_id,
                        error = %e,
                        "compaction commit failed"
                    );
                    return Err(e.into());
                }
            }
        }
    }

    /// Commits a batch spanning any number of tables.
    ///
    /// Requests are grouped by table. Tables commit concurrently; requests
    /// for the same table commit one after another in their original order.
    pub async fn commit_all(
        &self,
        cache: &mut StateStoreCache,
        requests: Vec<CompactionJobCommitRequest>,
    ) -> Vec<CommitOutcome> {
        let mut by_table: BTreeMap<TableId, Vec<CompactionJobCommitRequest>> = BTreeMap::new();
        for request in requests {
            by_table
                .entry(request.job.table_id.clone())
                .or_default()
                .push(request);
        }

        let mut tables = Vec::with_capacity(by_table.len());
        for (table_id, requests) in by_table {
            let store = cache
                .get(&table_id)
                .await
                .map(|cached| cached.state_store.clone())
                .map_err(|e| e.to_string());
            tables.push((table_id, store, requests));
        }

        let per_table = tables.into_iter().map(|(table_id, store, requests)| {
            let span = worker_span("commit", table_id.as_str());
            self.commit_table(table_id, store, requests).instrument(span)
        });
        join_all(per_table).await.into_iter().flatten().collect()
    }

    async fn commit_table(
        &self,
        table_id: TableId,
        store: std::result::Result<Arc<StateStore>, String>,
        requests: Vec<CompactionJobCommitRequest>,
    ) -> Vec<CommitOutcome> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            let result = match &store {
                Ok(store) => self.commit(store, &request).await,
                Err(message) => Err(CommitError::TableUnavailable {
                    table_id: table_id.clone(),
                    message: message.clone(),
                }),
            };
            outcomes.push(CommitOutcome {
                table_id: table_id.clone(),
                job_id: request.job.job_id,
                result,
            });
        }
        outcomes
    }

    /// Handles one commit message from a queue.
    pub async fn handle_commit_message(&self, cache: &mut StateStoreCache, body: &[u8]) -> MessageOutcome {
        let request = match CompactionJobCommitRequest::from_json(body) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dead-lettering undecodable commit message");
                return MessageOutcome::DeadLetter;
            }
        };
        let store = match cache.get(&request.job.table_id).await {
            Ok(cached) => cached.state_store.clone(),
            Err(e) => {
                let outcome = outcome_for(&CommitError::StateStore(e));
                warn!(
                    table_id = %request.job.table_id,
                    job_id = %request.job.job_id,
                    ?outcome,
                    "could not load table for commit"
                );
                return outcome;
            }
        };
        match self.commit(&store, &request).await {
            Ok(()) => MessageOutcome::Ack,
            Err(e) => outcome_for(&e),
        }
    }
}

/// Maps a commit failure to what a queue consumer should do with the message.
#[must_use]
pub fn outcome_for(error: &CommitError) -> MessageOutcome {
    use lakelog_statestore::ErrorKind;

    match error {
        CommitError::TimedOutWaitingForFileAssignments { .. } | CommitError::TableUnavailable { .. } => {
            MessageOutcome::Retry
        }
        CommitError::InvalidMessage { .. } => MessageOutcome::DeadLetter,
        CommitError::StateStore(e) => match e.kind() {
            ErrorKind::Infrastructure | ErrorKind::Race => MessageOutcome::Retry,
            ErrorKind::NotFound | ErrorKind::InvariantViolation => MessageOutcome::DeadLetter,
        },
    }
}

/// Errors a redelivered, already applied commit fails with.
fn inputs_already_retired(error: &StateStoreError) -> bool {
    matches!(
        error,
        StateStoreError::FileReferenceNotFound { .. } | StateStoreError::FileNotFound { .. }
    )
}

/// True if the output is already referenced in the job's partition and no
/// input reference there is still assigned to the job.
async fn already_committed(store: &StateStore, request: &CompactionJobCommitRequest) -> Result<bool> {
    let job = &request.job;
    let files = store.files_state().await?;
    if files.reference(&job.output_file, &job.partition_id).is_none() {
        return Ok(false);
    }
    Ok(job.input_files.iter().all(|input| {
        files
            .reference(input, &job.partition_id)
            .is_none_or(|r| r.job_id.as_ref() != Some(&job.job_id))
    }))
}
