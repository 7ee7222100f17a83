//! State store metrics.
//!
//! Complements structured logging with counters for appends, conflicts and
//! snapshot lifecycle.

use lakelog_core::EntityType;
use metrics::{counter, describe_counter};

/// Transactions appended, by entity type and transaction kind.
pub const TRANSACTIONS_APPENDED: &str = "lakelog_transactions_appended_total";

/// Append conflicts, by entity type.
pub const TRANSACTION_CONFLICTS: &str = "lakelog_transaction_conflicts_total";

/// Snapshots written, by entity type.
pub const SNAPSHOTS_CREATED: &str = "lakelog_snapshots_created_total";

/// Snapshots pruned, by entity type.
pub const SNAPSHOTS_DELETED: &str = "lakelog_snapshots_deleted_total";

/// Registers all state store metric descriptions.
///
/// Call this once at application startup after initializing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(TRANSACTIONS_APPENDED, "Total transactions appended to logs");
    describe_counter!(TRANSACTION_CONFLICTS, "Total append conflicts observed");
    describe_counter!(SNAPSHOTS_CREATED, "Total snapshots written");
    describe_counter!(SNAPSHOTS_DELETED, "Total snapshots pruned");
}

/// Records a successful append.
pub fn record_transaction_appended(entity: EntityType, kind: &'static str) {
    counter!(TRANSACTIONS_APPENDED, "entity" => entity.as_str(), "kind" => kind).increment(1);
}

/// Records an append conflict.
pub fn record_transaction_conflict(entity: EntityType) {
    counter!(TRANSACTION_CONFLICTS, "entity" => entity.as_str()).increment(1);
}

/// Records a snapshot write.
pub fn record_snapshot_created(entity: EntityType) {
    counter!(SNAPSHOTS_CREATED, "entity" => entity.as_str()).increment(1);
}

/// Records pruned snapshots.
pub fn record_snapshots_deleted(entity: EntityType, count: u64) {
    counter!(SNAPSHOTS_DELETED, "entity" => entity.as_str()).increment(count);
}
