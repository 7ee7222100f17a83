//! The cached head of one transaction log.
//!
//! A [`TransactionLogHead`] holds materialized state for one (table, entity
//! type) and the transaction number it reflects. Reads bring it up to date by
//! loading a newer snapshot when one is far enough ahead and replaying the
//! log tail. Writes follow validate, append, apply; on an append conflict the
//! head backs off, catches up, and re-validates against the new state.

use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use lakelog_core::{Clock, EntityType, RetryPolicy, TableId, truncate_to_millis};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::StateStoreConfig;
use crate::error::{Result, StateStoreError};
use crate::log_store::TransactionLogStore;
use crate::metrics;
use crate::snapshot::SnapshotStore;
use crate::state::EntityState;
use crate::transaction::{LogTransaction, TransactionLogEntry};

/// Replays entries from `from` onto `state`.
///
/// Returns the number of the last applied entry (or `from - 1` if none) and
/// how many entries were applied.
pub(crate) async fn replay_into<T: EntityState>(
    log: &dyn TransactionLogStore,
    state: &mut T,
    from: u64,
) -> Result<(u64, u64)> {
    let mut last = from.saturating_sub(1);
    let mut applied = 0;
    let mut entries = log.read_from(from);
    while let Some((number, body)) = entries.try_next().await? {
        let entry = TransactionLogEntry::<T::Transaction>::from_bytes(&body)?;
        if entry.transaction_number != number {
            return Err(lakelog_core::Error::serialization(
                format!("transaction log entry {number}"),
                format!("body claims number {}", entry.transaction_number),
            )
            .into());
        }
        entry.transaction.apply(state, entry.update_time);
        last = number;
        applied += 1;
    }
    Ok((last, applied))
}

/// Materialized state for one log, kept current on demand.
pub struct TransactionLogHead<T: EntityState> {
    table_id: TableId,
    log: Arc<dyn TransactionLogStore>,
    snapshots: Option<SnapshotStore>,
    config: StateStoreConfig,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    state: T,
    transaction_number: u64,
    last_snapshot_check: Option<Instant>,
    last_log_check: Option<Instant>,
}

impl<T: EntityState> TransactionLogHead<T> {
    /// Creates an empty head at transaction 0.
    #[must_use]
    pub fn new(
        table_id: TableId,
        log: Arc<dyn TransactionLogStore>,
        snapshots: Option<SnapshotStore>,
        config: StateStoreConfig,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            table_id,
            log,
            snapshots,
            config,
            retry,
            clock,
            state: T::default(),
            transaction_number: 0,
            last_snapshot_check: None,
            last_log_check: None,
        }
    }

    /// The log's entity type.
    #[must_use]
    pub const fn entity(&self) -> EntityType {
        T::ENTITY
    }

    /// The cached state, as of the last update.
    #[must_use]
    pub fn state(&self) -> &T {
        &self.state
    }

    /// The transaction number the cached state reflects.
    #[must_use]
    pub const fn transaction_number(&self) -> u64 {
        self.transaction_number
    }

    /// Brings the head up to date, honouring the check intervals.
    ///
    /// # Errors
    ///
    /// Returns an error if the log or snapshot store cannot be read, or
    /// [`StateStoreError::MissingTransaction`] if the next entry was truncated
    /// and no snapshot covers the gap.
    pub async fn update(&mut self) -> Result<()> {
        self.update_inner(false).await
    }

    /// Brings the head up to date regardless of check intervals.
    ///
    /// # Errors
    ///
    /// Returns an error if the log or snapshot store cannot be read.
    pub async fn force_update(&mut self) -> Result<()> {
        self.update_inner(true).await
    }

    async fn update_inner(&mut self, force: bool) -> Result<()> {
        if force || due(self.last_snapshot_check, self.config.min_snapshot_check_interval) {
            self.last_snapshot_check = Some(Instant::now());
            let min_ahead = if self.transaction_number == 0 {
                1
            } else {
                self.config.min_transactions_ahead_to_load_snapshot.max(1)
            };
            self.load_snapshot_if_ahead(min_ahead).await?;
        }

        if !force && !due(self.last_log_check, self.config.min_transaction_check_interval) {
            return Ok(());
        }
        self.last_log_check = Some(Instant::now());

        let (last, applied) =
            replay_into(self.log.as_ref(), &mut self.state, self.transaction_number + 1).await?;
        if applied > 0 {
            debug!(
                table_id = %self.table_id,
                entity = %T::ENTITY,
                from = self.transaction_number,
                to = last,
                "replayed transaction log tail"
            );
            self.transaction_number = last;
            return Ok(());
        }
        // Nothing followed our number: either we are current or the next
        // entry was truncated away behind a snapshot.
        self.catch_up_past_truncation().await
    }

    async fn load_snapshot_if_ahead(&mut self, min_ahead: u64) -> Result<bool> {
        let Some(snapshots) = &self.snapshots else {
            return Ok(false);
        };
        let Some(metadata) = snapshots.latest(T::ENTITY).await? else {
            return Ok(false);
        };
        if metadata.transaction_number < self.transaction_number.saturating_add(min_ahead) {
            return Ok(false);
        }
        let state = snapshots.load::<T>(&metadata).await?;
        info!(
            table_id = %self.table_id,
            entity = %T::ENTITY,
            from = self.transaction_number,
            to = metadata.transaction_number,
            "loaded snapshot"
        );
        self.state = state;
        self.transaction_number = metadata.transaction_number;
        Ok(true)
    }

    /// Recovers a head that fell behind a truncated part of the log.
    async fn catch_up_past_truncation(&mut self) -> Result<()> {
        let latest = self.log.latest_transaction_number().await?;
        if latest <= self.transaction_number {
            return Ok(());
        }
        warn!(
            table_id = %self.table_id,
            entity = %T::ENTITY,
            transaction_number = self.transaction_number,
            latest,
            "next log entry is gone, recovering through snapshot"
        );
        self.load_snapshot_if_ahead(1).await?;
        let (last, applied) =
            replay_into(self.log.as_ref(), &mut self.state, self.transaction_number + 1).await?;
        if applied > 0 {
            self.transaction_number = last;
        }
        if self.transaction_number < latest {
            return Err(StateStoreError::MissingTransaction {
                table_id: self.table_id.clone(),
                entity: T::ENTITY,
                transaction_number: self.transaction_number + 1,
            });
        }
        Ok(())
    }

    /// Validates, appends and applies a transaction.
    ///
    /// Validation failures return immediately without appending. Append
    /// conflicts are retried under the retry policy, re-validating against
    /// the caught-up state each time.
    ///
    /// Returns the transaction number the transaction was appended at.
    ///
    /// # Errors
    ///
    /// Returns the validation error, [`StateStoreError::TooManyConflicts`]
    /// once retries are exhausted, or a storage error.
    pub async fn add_transaction(&mut self, mut transaction: T::Transaction) -> Result<u64> {
        let policy = self.retry.clone();
        let mut retry = policy.start();
        self.update_inner(false).await?;

        loop {
            let attempt = retry.begin_attempt();
            transaction.validate(&self.state)?;

            let number = self.transaction_number + 1;
            let entry = TransactionLogEntry {
                transaction_number: number,
                update_time: truncate_to_millis(self.clock.now()),
                transaction,
            };
            let body = entry.to_bytes()?;

            match self.log.append(number, body).await {
                Ok(()) => {
                    entry.transaction.apply(&mut self.state, entry.update_time);
                    self.transaction_number = number;
                    metrics::record_transaction_appended(T::ENTITY, entry.transaction.kind());
                    debug!(
                        table_id = %self.table_id,
                        entity = %T::ENTITY,
                        transaction_number = number,
                        kind = entry.transaction.kind(),
                        attempt,
                        "appended transaction"
                    );
                    return Ok(number);
                }
                Err(e) if e.is_conflict() => {
                    metrics::record_transaction_conflict(T::ENTITY);
                    if !retry.can_retry() {
                        warn!(
                            table_id = %self.table_id,
                            entity = %T::ENTITY,
                            attempts = attempt,
                            "giving up after repeated append conflicts"
                        );
                        return Err(StateStoreError::TooManyConflicts {
                            table_id: self.table_id.clone(),
                            entity: T::ENTITY,
                            attempts: attempt,
                        });
                    }
                    let waited = retry.backoff().await;
                    debug!(
                        table_id = %self.table_id,
                        entity = %T::ENTITY,
                        transaction_number = number,
                        attempt,
                        waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                        "append conflict, catching up"
                    );
                    self.update_inner(true).await?;
                }
                Err(e) => return Err(e),
            }
            transaction = entry.transaction;
        }
    }
}

fn due(last: Option<Instant>, interval: Duration) -> bool {
    last.is_none_or(|at| at.elapsed() >= interval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_reference::FileReference;
    use crate::log_store::{InMemoryTransactionLogStore, ObjectStoreTransactionLogStore};
    use crate::state::StateStoreFiles;
    use crate::transaction::FileTransaction;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{DateTime, Utc};
    use lakelog_core::{FixedClock, MemoryBackend, StorageBackend};

    fn table() -> TableId {
        TableId::new("orders").unwrap()
    }

    fn fast_config() -> StateStoreConfig {
        StateStoreConfig {
            add_transaction_max_attempts: 3,
            add_transaction_first_retry_wait: Duration::from_millis(1),
            add_transaction_max_retry_wait: Duration::from_millis(4),
            min_snapshot_check_interval: Duration::ZERO,
            min_transactions_ahead_to_load_snapshot: 1,
            min_transaction_check_interval: Duration::ZERO,
        }
    }

    fn head(
        log: Arc<dyn TransactionLogStore>,
        snapshots: Option<SnapshotStore>,
    ) -> TransactionLogHead<StateStoreFiles> {
        head_with(log, snapshots, fast_config())
    }

    fn head_with(
        log: Arc<dyn TransactionLogStore>,
        snapshots: Option<SnapshotStore>,
        config: StateStoreConfig,
    ) -> TransactionLogHead<StateStoreFiles> {
        let retry = config.retry_policy().with_fixed_jitter(1.0);
        let clock = Arc::new(FixedClock(
            DateTime::from_timestamp_millis(1_700_000_000_123).unwrap(),
        ));
        TransactionLogHead::new(table(), log, snapshots, config, retry, clock)
    }

    fn add(name: &str) -> FileTransaction {
        FileTransaction::AddFiles {
            files: vec![FileReference::new(name, "root", 10)],
        }
    }

    #[tokio::test]
    async fn appends_and_applies_in_order() {
        let log: Arc<dyn TransactionLogStore> =
            Arc::new(InMemoryTransactionLogStore::new(table(), EntityType::Files));
        let mut head = head(log.clone(), None);

        assert_eq!(head.add_transaction(add("a")).await.unwrap(), 1);
        assert_eq!(head.add_transaction(add("b")).await.unwrap(), 2);
        assert_eq!(head.state().len(), 2);
        assert_eq!(log.latest_transaction_number().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn validation_failure_appends_nothing() {
        let log: Arc<dyn TransactionLogStore> =
            Arc::new(InMemoryTransactionLogStore::new(table(), EntityType::Files));
        let mut head = head(log.clone(), None);
        head.add_transaction(add("a")).await.unwrap();

        let err = head.add_transaction(add("a")).await.unwrap_err();
        assert!(matches!(err, StateStoreError::FileAlreadyExists { .. }));
        assert_eq!(log.latest_transaction_number().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn conflict_catches_up_and_revalidates() {
        let log: Arc<dyn TransactionLogStore> =
            Arc::new(InMemoryTransactionLogStore::new(table(), EntityType::Files));
        let lazy = StateStoreConfig {
            min_transaction_check_interval: Duration::from_secs(3600),
            ..fast_config()
        };
        let mut first = head(log.clone(), None);
        let mut second = head_with(log.clone(), None, lazy.clone());
        second.update().await.unwrap();

        first.add_transaction(add("a")).await.unwrap();

        // second is stale at 0; its append at 1 conflicts, then lands at 2.
        assert_eq!(second.add_transaction(add("b")).await.unwrap(), 2);
        assert!(second.state().contains_file("a"));

        // A stale writer re-validates after catching up.
        let mut third = head_with(log.clone(), None, lazy);
        third.update().await.unwrap();
        first.add_transaction(add("c")).await.unwrap();
        let err = third.add_transaction(add("c")).await.unwrap_err();
        assert!(matches!(err, StateStoreError::FileAlreadyExists { .. }));
    }

    struct AlwaysConflicts;

    #[async_trait]
    impl TransactionLogStore for AlwaysConflicts {
        async fn append(&self, transaction_number: u64, _body: Bytes) -> Result<()> {
            Err(StateStoreError::TransactionConflict {
                table_id: table(),
                entity: EntityType::Files,
                transaction_number,
            })
        }

        async fn read_entry(&self, _transaction_number: u64) -> Result<Option<Bytes>> {
            Ok(None)
        }

        async fn latest_transaction_number(&self) -> Result<u64> {
            Ok(0)
        }

        async fn delete_transactions_before(&self, _transaction_number: u64) -> Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let mut head = head(Arc::new(AlwaysConflicts), None);
        let err = head.add_transaction(add("a")).await.unwrap_err();
        assert!(matches!(
            err,
            StateStoreError::TooManyConflicts { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn fresh_head_starts_from_latest_snapshot() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let log: Arc<dyn TransactionLogStore> = Arc::new(ObjectStoreTransactionLogStore::new(
            backend.clone(),
            table(),
            EntityType::Files,
        ));
        let snapshots = SnapshotStore::new(backend.clone(), table());

        let mut writer = head(log.clone(), Some(snapshots.clone()));
        for name in ["a", "b", "c"] {
            writer.add_transaction(add(name)).await.unwrap();
        }
        snapshots
            .save(writer.state(), writer.transaction_number(), Utc::now())
            .await
            .unwrap();
        log.delete_transactions_before(3).await.unwrap();

        let mut reader = head(log, Some(snapshots));
        reader.update().await.unwrap();
        assert_eq!(reader.transaction_number(), 3);
        assert_eq!(reader.state(), writer.state());
    }

    #[tokio::test]
    async fn stale_head_behind_truncation_recovers_through_snapshot() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let log: Arc<dyn TransactionLogStore> = Arc::new(ObjectStoreTransactionLogStore::new(
            backend.clone(),
            table(),
            EntityType::Files,
        ));
        let snapshots = SnapshotStore::new(backend.clone(), table());

        // Far enough behind that a routine update would not load the snapshot.
        let config = StateStoreConfig {
            min_transactions_ahead_to_load_snapshot: 100,
            ..fast_config()
        };
        let mut stale = head_with(log.clone(), Some(snapshots.clone()), config);
        stale.add_transaction(add("a")).await.unwrap();

        let mut writer = head(log.clone(), Some(snapshots.clone()));
        for name in ["b", "c", "d"] {
            writer.add_transaction(add(name)).await.unwrap();
        }
        snapshots
            .save(writer.state(), writer.transaction_number(), Utc::now())
            .await
            .unwrap();
        log.delete_transactions_before(4).await.unwrap();

        assert_eq!(stale.add_transaction(add("e")).await.unwrap(), 5);
        assert_eq!(stale.state().len(), 5);
    }

    #[tokio::test]
    async fn read_behind_truncation_loads_snapshot() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let log: Arc<dyn TransactionLogStore> = Arc::new(ObjectStoreTransactionLogStore::new(
            backend.clone(),
            table(),
            EntityType::Files,
        ));
        let snapshots = SnapshotStore::new(backend.clone(), table());
        let config = StateStoreConfig {
            min_transactions_ahead_to_load_snapshot: 100,
            ..fast_config()
        };
        let mut reader = head_with(log.clone(), Some(snapshots.clone()), config);
        reader.add_transaction(add("a")).await.unwrap();

        let mut writer = head(log.clone(), Some(snapshots.clone()));
        for name in ["b", "c", "d"] {
            writer.add_transaction(add(name)).await.unwrap();
        }
        snapshots
            .save(writer.state(), writer.transaction_number(), Utc::now())
            .await
            .unwrap();
        log.delete_transactions_before(4).await.unwrap();

        reader.update().await.unwrap();
        assert_eq!(reader.transaction_number(), 4);
        assert_eq!(reader.state(), writer.state());
    }

    #[tokio::test]
    async fn read_behind_truncation_without_snapshot_fails() {
        let log: Arc<dyn TransactionLogStore> =
            Arc::new(InMemoryTransactionLogStore::new(table(), EntityType::Files));
        let mut reader = head(log.clone(), None);
        reader.add_transaction(add("a")).await.unwrap();

        let mut writer = head(log.clone(), None);
        for name in ["b", "c"] {
            writer.add_transaction(add(name)).await.unwrap();
        }
        log.delete_transactions_before(3).await.unwrap();

        let err = reader.update().await.unwrap_err();
        assert!(matches!(
            err,
            StateStoreError::MissingTransaction {
                transaction_number: 2,
                ..
            }
        ));
        assert_eq!(reader.transaction_number(), 1);
    }
}
