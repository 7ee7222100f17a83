//! Snapshot creation.

use std::marker::PhantomData;
use std::sync::Arc;

use lakelog_core::{Clock, TableId};
use tracing::{debug, info};

use crate::error::{Result, StateStoreError};
use crate::head::replay_into;
use crate::log_store::TransactionLogStore;
use crate::metrics;
use crate::snapshot::store::{SnapshotMetadata, SnapshotStore};
use crate::state::EntityState;

/// Writes snapshots of one entity type for one table.
///
/// A creator starts from the latest snapshot (or empty state if there is
/// none), replays every later log entry, and writes the result only if the
/// log has moved past the latest snapshot.
pub struct SnapshotCreator<T: EntityState> {
    table_id: TableId,
    log: Arc<dyn TransactionLogStore>,
    snapshots: SnapshotStore,
    clock: Arc<dyn Clock>,
    _state: PhantomData<fn() -> T>,
}

impl<T: EntityState> SnapshotCreator<T> {
    /// Creates a snapshot creator.
    #[must_use]
    pub fn new(
        log: Arc<dyn TransactionLogStore>,
        snapshots: SnapshotStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            table_id: snapshots.table_id().clone(),
            log,
            snapshots,
            clock,
            _state: PhantomData,
        }
    }

    /// Writes a snapshot at the latest transaction, if there is anything new.
    ///
    /// Returns the new snapshot, or `None` if the latest snapshot is already
    /// current.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError::DuplicateSnapshot`] if a snapshot already
    /// exists at the resulting number, either from a concurrent creator or
    /// one whose pointer update failed. Returns
    /// [`StateStoreError::MissingTransaction`] if the log has been truncated
    /// past the latest snapshot. Storage and encoding failures propagate.
    pub async fn create(&self) -> Result<Option<SnapshotMetadata>> {
        let (mut state, base) = match self.snapshots.load_latest::<T>().await? {
            Some(loaded) => loaded,
            None => (T::default(), 0),
        };

        let (last, applied) = replay_into(self.log.as_ref(), &mut state, base + 1).await?;
        if applied == 0 {
            let latest = self.log.latest_transaction_number().await?;
            if latest > base {
                return Err(StateStoreError::MissingTransaction {
                    table_id: self.table_id.clone(),
                    entity: T::ENTITY,
                    transaction_number: base + 1,
                });
            }
            debug!(
                table_id = %self.table_id,
                entity = %T::ENTITY,
                transaction_number = base,
                "snapshot already current"
            );
            return Ok(None);
        }

        let metadata = self.snapshots.save(&state, last, self.clock.now()).await?;
        metrics::record_snapshot_created(T::ENTITY);
        info!(
            table_id = %self.table_id,
            entity = %T::ENTITY,
            from = base,
            transaction_number = last,
            "created snapshot"
        );
        Ok(Some(metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_reference::FileReference;
    use crate::log_store::ObjectStoreTransactionLogStore;
    use crate::state::{StateStoreFiles, StateStorePartitions};
    use crate::transaction::{FileTransaction, TransactionLogEntry};
    use chrono::{DateTime, Utc};
    use crate::error::ErrorKind;
    use lakelog_core::{EntityType, FixedClock, MemoryBackend, StorageBackend, TablePaths};
    use lakelog_test_utils::FailingBackend;

    fn table() -> TableId {
        TableId::new("orders").unwrap()
    }

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap()
    }

    async fn append_add(log: &dyn TransactionLogStore, number: u64, name: &str) {
        let entry = TransactionLogEntry {
            transaction_number: number,
            update_time: at(1_000 * i64::try_from(number).unwrap()),
            transaction: FileTransaction::AddFiles {
                files: vec![FileReference::new(name, "root", 1)],
            },
        };
        log.append(number, entry.to_bytes().unwrap()).await.unwrap();
    }

    fn setup() -> (Arc<dyn TransactionLogStore>, SnapshotStore, SnapshotCreator<StateStoreFiles>) {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let log: Arc<dyn TransactionLogStore> = Arc::new(ObjectStoreTransactionLogStore::new(
            backend.clone(),
            table(),
            EntityType::Files,
        ));
        let snapshots = SnapshotStore::new(backend, table());
        let creator = SnapshotCreator::new(log.clone(), snapshots.clone(), Arc::new(FixedClock(at(0))));
        (log, snapshots, creator)
    }

    #[tokio::test]
    async fn empty_log_creates_nothing() {
        let (_, snapshots, creator) = setup();
        assert!(creator.create().await.unwrap().is_none());
        assert!(snapshots.list(EntityType::Files).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshot_equals_replay_and_builds_on_previous() {
        let (log, snapshots, creator) = setup();
        append_add(log.as_ref(), 1, "a").await;
        append_add(log.as_ref(), 2, "b").await;

        let first = creator.create().await.unwrap().unwrap();
        assert_eq!(first.transaction_number, 2);
        assert!(creator.create().await.unwrap().is_none());

        append_add(log.as_ref(), 3, "c").await;
        let second = creator.create().await.unwrap().unwrap();
        assert_eq!(second.transaction_number, 3);

        let mut replayed = StateStoreFiles::default();
        replay_into(log.as_ref(), &mut replayed, 1).await.unwrap();
        let loaded: StateStoreFiles = snapshots.load(&second).await.unwrap();
        assert_eq!(loaded, replayed);
    }

    #[tokio::test]
    async fn truncated_log_without_snapshot_is_missing_transaction() {
        let (log, _, creator) = setup();
        append_add(log.as_ref(), 1, "a").await;
        append_add(log.as_ref(), 2, "b").await;
        log.delete_transactions_before(2).await.unwrap();

        let err = creator.create().await.unwrap_err();
        assert!(matches!(
            err,
            StateStoreError::MissingTransaction {
                transaction_number: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn partitions_snapshot_of_empty_log_is_skipped() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let log: Arc<dyn TransactionLogStore> = Arc::new(ObjectStoreTransactionLogStore::new(
            backend.clone(),
            table(),
            EntityType::Partitions,
        ));
        let creator = SnapshotCreator::<StateStorePartitions>::new(
            log,
            SnapshotStore::new(backend, table()),
            Arc::new(FixedClock(at(0))),
        );
        assert!(creator.create().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lagging_pointer_surfaces_duplicate_then_heals() {
        let backend = Arc::new(FailingBackend::new());
        let storage: Arc<dyn StorageBackend> = backend.clone();
        let log: Arc<dyn TransactionLogStore> = Arc::new(ObjectStoreTransactionLogStore::new(
            storage.clone(),
            table(),
            EntityType::Files,
        ));
        let snapshots = SnapshotStore::new(storage, table());
        let creator = SnapshotCreator::<StateStoreFiles>::new(
            log.clone(),
            snapshots.clone(),
            Arc::new(FixedClock(at(0))),
        );
        append_add(log.as_ref(), 1, "a").await;
        append_add(log.as_ref(), 2, "b").await;

        // The metadata row lands but the pointer does not.
        backend.fail_on_write(&TablePaths::latest_snapshot(&table(), EntityType::Files));
        assert!(creator.create().await.is_err());
        assert_eq!(snapshots.list(EntityType::Files).await.unwrap().len(), 1);
        assert!(snapshots.latest(EntityType::Files).await.unwrap().is_none());

        let err = creator.create().await.unwrap_err();
        assert!(matches!(
            err,
            StateStoreError::DuplicateSnapshot {
                transaction_number: 2,
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);

        let latest = snapshots.latest(EntityType::Files).await.unwrap().unwrap();
        assert_eq!(latest.transaction_number, 2);
        assert!(creator.create().await.unwrap().is_none());
    }
}
