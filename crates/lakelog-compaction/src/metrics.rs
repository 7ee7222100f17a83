//! Compaction metrics.

use metrics::{counter, describe_counter};

/// Commits by outcome (`committed`, `timed_out`, `failed`).
pub const COMMITS: &str = "lakelog_compaction_commits_total";

/// Retries while waiting for file assignment.
pub const COMMIT_RETRIES: &str = "lakelog_compaction_commit_retries_total";

/// Registers compaction metric descriptions.
pub fn register_metrics() {
    describe_counter!(COMMITS, "Total compaction commits by outcome");
    describe_counter!(
        COMMIT_RETRIES,
        "Total commit retries waiting for file assignments"
    );
}

/// Records the outcome of one commit.
pub fn record_commit(outcome: &'static str) {
    counter!(COMMITS, "outcome" => outcome).increment(1);
}

/// Records one retry.
pub fn record_commit_retry() {
    counter!(COMMIT_RETRIES).increment(1);
}
