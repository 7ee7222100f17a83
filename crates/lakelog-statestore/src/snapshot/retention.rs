//! Snapshot retention and log truncation.

use std::sync::Arc;

use lakelog_core::{Clock, EntityType};
use tracing::{debug, info};

use crate::config::TableProperties;
use crate::error::Result;
use crate::log_store::TransactionLogStore;
use crate::metrics;
use crate::snapshot::store::SnapshotStore;

/// Outcome of one prune pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneResult {
    /// Transaction numbers of the snapshots deleted.
    pub deleted: Vec<u64>,
    /// Snapshots kept.
    pub retained: usize,
    /// Log entries removed below the oldest retained snapshot.
    pub transactions_deleted: u64,
}

/// Prunes snapshots beyond the retention count once they are old enough.
pub struct SnapshotRetention {
    snapshots: SnapshotStore,
    clock: Arc<dyn Clock>,
    properties: TableProperties,
}

impl SnapshotRetention {
    /// Creates a retention job for the table behind `snapshots`.
    #[must_use]
    pub fn new(snapshots: SnapshotStore, clock: Arc<dyn Clock>, properties: TableProperties) -> Self {
        Self {
            snapshots,
            clock,
            properties,
        }
    }

    /// Deletes old snapshots of `entity`, then truncates `log` below the
    /// oldest snapshot still present when the table allows it.
    ///
    /// The newest `snapshot_retention_count` snapshots are always kept. Older
    /// ones are deleted only once their age reaches `snapshot_min_age_secs`.
    ///
    /// # Errors
    ///
    /// Returns an error if listing, deleting, or truncating fails.
    pub async fn prune(
        &self,
        entity: EntityType,
        log: &dyn TransactionLogStore,
    ) -> Result<PruneResult> {
        let all = self.snapshots.list(entity).await?;
        let keep = self.properties.snapshot_retention_count.max(1);
        let cutoff = self.clock.now() - self.properties.snapshot_min_age();
        let candidates = all.len().saturating_sub(keep);

        let mut result = PruneResult::default();
        let mut oldest_retained = None;
        for (index, metadata) in all.iter().enumerate() {
            if index < candidates && metadata.created_at <= cutoff {
                self.snapshots.delete(metadata).await?;
                result.deleted.push(metadata.transaction_number);
            } else {
                result.retained += 1;
                oldest_retained.get_or_insert(metadata.transaction_number);
            }
        }

        if !result.deleted.is_empty() {
            metrics::record_snapshots_deleted(entity, result.deleted.len() as u64);
        }

        if self.properties.delete_transactions_before_retained_snapshot {
            if let Some(number) = oldest_retained {
                result.transactions_deleted = log.delete_transactions_before(number).await?;
            }
        }

        if result.deleted.is_empty() && result.transactions_deleted == 0 {
            debug!(
                table_id = %self.snapshots.table_id(),
                entity = %entity,
                retained = result.retained,
                "nothing to prune"
            );
        } else {
            info!(
                table_id = %self.snapshots.table_id(),
                entity = %entity,
                deleted = result.deleted.len(),
                retained = result.retained,
                transactions_deleted = result.transactions_deleted,
                "pruned snapshots"
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_reference::FileReference;
    use crate::log_store::InMemoryTransactionLogStore;
    use crate::state::StateStoreFiles;
    use crate::transaction::{FileTransaction, LogTransaction, TransactionLogEntry};
    use chrono::{DateTime, TimeDelta, Utc};
    use lakelog_core::{FixedClock, MemoryBackend, TableId};

    fn table() -> TableId {
        TableId::new("orders").unwrap()
    }

    fn day(n: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(0, 0).unwrap() + TimeDelta::days(n)
    }

    /// Log with entries 1..=count and a snapshot at each number created on day n.
    async fn seeded(count: u64) -> (InMemoryTransactionLogStore, SnapshotStore) {
        let log = InMemoryTransactionLogStore::new(table(), EntityType::Files);
        let snapshots = SnapshotStore::new(Arc::new(MemoryBackend::new()), table());
        let mut state = StateStoreFiles::default();
        for n in 1..=count {
            let transaction = FileTransaction::AddFiles {
                files: vec![FileReference::new(format!("f{n}"), "root", 1)],
            };
            let created = day(i64::try_from(n).unwrap());
            transaction.apply(&mut state, created);
            let entry = TransactionLogEntry {
                transaction_number: n,
                update_time: created,
                transaction,
            };
            log.append(n, entry.to_bytes().unwrap()).await.unwrap();
            snapshots.save(&state, n, created).await.unwrap();
        }
        (log, snapshots)
    }

    fn retention(snapshots: &SnapshotStore, now: DateTime<Utc>, props: TableProperties) -> SnapshotRetention {
        SnapshotRetention::new(snapshots.clone(), Arc::new(FixedClock(now)), props)
    }

    #[tokio::test]
    async fn keeps_newest_and_truncates_log() {
        let (log, snapshots) = seeded(5).await;
        let result = retention(&snapshots, day(30), TableProperties::default())
            .prune(EntityType::Files, &log)
            .await
            .unwrap();

        assert_eq!(result.deleted, vec![1, 2]);
        assert_eq!(result.retained, 3);
        assert_eq!(result.transactions_deleted, 2);
        let left: Vec<u64> = snapshots
            .list(EntityType::Files)
            .await
            .unwrap()
            .iter()
            .map(|m| m.transaction_number)
            .collect();
        assert_eq!(left, vec![3, 4, 5]);
        assert!(log.read_entry(2).await.unwrap().is_none());
        assert!(log.read_entry(3).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn young_snapshots_survive_and_hold_back_truncation() {
        let (log, snapshots) = seeded(5).await;
        // Snapshot 1 is 1.5 days old, snapshot 2 is only half a day old.
        let now = day(2) + TimeDelta::hours(12);
        let result = retention(&snapshots, now, TableProperties::default())
            .prune(EntityType::Files, &log)
            .await
            .unwrap();

        assert_eq!(result.deleted, vec![1]);
        assert_eq!(result.retained, 4);
        assert_eq!(result.transactions_deleted, 1);
    }

    #[tokio::test]
    async fn truncation_can_be_disabled() {
        let (log, snapshots) = seeded(4).await;
        let props = TableProperties {
            snapshot_retention_count: 1,
            delete_transactions_before_retained_snapshot: false,
            ..TableProperties::default()
        };
        let result = retention(&snapshots, day(30), props)
            .prune(EntityType::Files, &log)
            .await
            .unwrap();

        assert_eq!(result.deleted, vec![1, 2, 3]);
        assert_eq!(result.transactions_deleted, 0);
        assert_eq!(log.latest_transaction_number().await.unwrap(), 4);
        assert!(log.read_entry(1).await.unwrap().is_some());
    }
}
