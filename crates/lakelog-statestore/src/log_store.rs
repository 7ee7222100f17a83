//! Append-only transaction logs with compare-and-append.
//!
//! One log exists per (table, entity type). `append(n, ..)` succeeds only
//! when `n` is exactly one past the current latest entry; anything else is a
//! [`StateStoreError::TransactionConflict`] and writes nothing. This is the
//! only concurrency control in the system.
//!
//! Reading is a lazy forward stream that stops at the first missing number.
//! Callers cancel by dropping the stream.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use lakelog_core::{EntityType, StorageBackend, TableId, TablePaths, WritePrecondition, WriteResult};

use crate::error::{Result, StateStoreError};

/// An ordered, gapless, append-only log of serialized transactions.
#[async_trait]
pub trait TransactionLogStore: Send + Sync + 'static {
    /// Appends `body` at `transaction_number`.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError::TransactionConflict`] if `transaction_number`
    /// is not exactly one past the latest entry. Storage failures propagate.
    async fn append(&self, transaction_number: u64, body: Bytes) -> Result<()>;

    /// Reads one entry, `None` if absent.
    async fn read_entry(&self, transaction_number: u64) -> Result<Option<Bytes>>;

    /// Returns the number of the latest entry, 0 for an empty log.
    async fn latest_transaction_number(&self) -> Result<u64>;

    /// Deletes entries numbered below `transaction_number`, never the latest.
    ///
    /// Returns how many entries were deleted.
    async fn delete_transactions_before(&self, transaction_number: u64) -> Result<u64>;

    /// Streams entries in order from `transaction_number`, stopping at the
    /// first missing number.
    fn read_from(&self, transaction_number: u64) -> BoxStream<'_, Result<(u64, Bytes)>> {
        futures::stream::unfold(Some(transaction_number.max(1)), move |next| async move {
            let number = next?;
            match self.read_entry(number).await {
                Ok(Some(body)) => Some((Ok((number, body)), Some(number + 1))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }
}

/// Log stored as one object per entry in a [`StorageBackend`].
///
/// Entries are written with `DoesNotExist`, and an entry is only written once
/// its predecessor exists, so the log stays gapless. The first entry is only
/// written into an empty log.
pub struct ObjectStoreTransactionLogStore {
    storage: Arc<dyn StorageBackend>,
    table_id: TableId,
    entity: EntityType,
}

impl ObjectStoreTransactionLogStore {
    /// Creates a log over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, table_id: TableId, entity: EntityType) -> Self {
        Self {
            storage,
            table_id,
            entity,
        }
    }

    fn path(&self, number: u64) -> String {
        TablePaths::transaction(&self.table_id, self.entity, number)
    }

    fn conflict(&self, transaction_number: u64) -> StateStoreError {
        StateStoreError::TransactionConflict {
            table_id: self.table_id.clone(),
            entity: self.entity,
            transaction_number,
        }
    }

    async fn entry_numbers(&self) -> Result<Vec<u64>> {
        let prefix = TablePaths::transactions_dir(&self.table_id, self.entity);
        let mut numbers: Vec<u64> = self
            .storage
            .list(&prefix)
            .await?
            .iter()
            .filter_map(|meta| TablePaths::parse_transaction_number(&meta.path))
            .collect();
        numbers.sort_unstable();
        Ok(numbers)
    }
}

#[async_trait]
impl TransactionLogStore for ObjectStoreTransactionLogStore {
    async fn append(&self, transaction_number: u64, body: Bytes) -> Result<()> {
        if transaction_number == 0 {
            return Err(StateStoreError::invalid_request(
                "transaction numbers start at 1",
            ));
        }
        if transaction_number == 1 {
            if self.latest_transaction_number().await? != 0 {
                return Err(self.conflict(transaction_number));
            }
        } else if self
            .storage
            .head(&self.path(transaction_number - 1))
            .await?
            .is_none()
        {
            return Err(self.conflict(transaction_number));
        }

        match self
            .storage
            .put(
                &self.path(transaction_number),
                body,
                WritePrecondition::DoesNotExist,
            )
            .await?
        {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { .. } => Err(self.conflict(transaction_number)),
        }
    }

    async fn read_entry(&self, transaction_number: u64) -> Result<Option<Bytes>> {
        match self.storage.get(&self.path(transaction_number)).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn latest_transaction_number(&self) -> Result<u64> {
        Ok(self.entry_numbers().await?.last().copied().unwrap_or(0))
    }

    async fn delete_transactions_before(&self, transaction_number: u64) -> Result<u64> {
        let numbers = self.entry_numbers().await?;
        let latest = numbers.last().copied().unwrap_or(0);
        let mut deleted = 0;
        for number in numbers
            .into_iter()
            .filter(|n| *n < transaction_number && *n < latest)
        {
            self.storage.delete(&self.path(number)).await?;
            deleted += 1;
        }
        Ok(deleted)
    }
}

/// Log held in process memory, for tests and single-process tools.
pub struct InMemoryTransactionLogStore {
    table_id: TableId,
    entity: EntityType,
    entries: Mutex<BTreeMap<u64, Bytes>>,
}

impl InMemoryTransactionLogStore {
    /// Creates an empty log.
    #[must_use]
    pub fn new(table_id: TableId, entity: EntityType) -> Self {
        Self {
            table_id,
            entity,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<u64, Bytes>>> {
        self.entries.lock().map_err(|_| {
            lakelog_core::Error::Internal {
                message: "transaction log lock poisoned".into(),
            }
            .into()
        })
    }
}

#[async_trait]
impl TransactionLogStore for InMemoryTransactionLogStore {
    async fn append(&self, transaction_number: u64, body: Bytes) -> Result<()> {
        let mut entries = self.lock()?;
        let latest = entries.keys().next_back().copied().unwrap_or(0);
        if transaction_number != latest + 1 {
            return Err(StateStoreError::TransactionConflict {
                table_id: self.table_id.clone(),
                entity: self.entity,
                transaction_number,
            });
        }
        entries.insert(transaction_number, body);
        Ok(())
    }

    async fn read_entry(&self, transaction_number: u64) -> Result<Option<Bytes>> {
        Ok(self.lock()?.get(&transaction_number).cloned())
    }

    async fn latest_transaction_number(&self) -> Result<u64> {
        Ok(self.lock()?.keys().next_back().copied().unwrap_or(0))
    }

    async fn delete_transactions_before(&self, transaction_number: u64) -> Result<u64> {
        let mut entries = self.lock()?;
        let latest = entries.keys().next_back().copied().unwrap_or(0);
        let cutoff = transaction_number.min(latest);
        let retained = entries.split_off(&cutoff);
        let deleted = entries.len() as u64;
        *entries = retained;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use lakelog_core::MemoryBackend;

    fn table() -> TableId {
        TableId::new("orders").unwrap()
    }

    fn stores() -> Vec<Box<dyn TransactionLogStore>> {
        vec![
            Box::new(InMemoryTransactionLogStore::new(table(), EntityType::Files)),
            Box::new(ObjectStoreTransactionLogStore::new(
                Arc::new(MemoryBackend::new()),
                table(),
                EntityType::Files,
            )),
        ]
    }

    #[tokio::test]
    async fn append_is_compare_and_append() {
        for log in stores() {
            log.append(1, Bytes::from("a")).await.unwrap();
            log.append(2, Bytes::from("b")).await.unwrap();

            let err = log.append(2, Bytes::from("other")).await.unwrap_err();
            assert!(err.is_conflict());
            let err = log.append(4, Bytes::from("gap")).await.unwrap_err();
            assert!(err.is_conflict());

            assert_eq!(log.read_entry(2).await.unwrap(), Some(Bytes::from("b")));
            assert_eq!(log.latest_transaction_number().await.unwrap(), 2);
        }
    }

    #[tokio::test]
    async fn read_from_is_ordered_and_restartable() {
        for log in stores() {
            for n in 1..=5 {
                log.append(n, Bytes::from(n.to_string())).await.unwrap();
            }
            let all: Vec<(u64, Bytes)> = log.read_from(1).try_collect().await.unwrap();
            assert_eq!(all.iter().map(|(n, _)| *n).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);

            let tail: Vec<(u64, Bytes)> = log.read_from(4).try_collect().await.unwrap();
            assert_eq!(tail.len(), 2);
            assert_eq!(tail[0].1, Bytes::from("4"));

            let none: Vec<(u64, Bytes)> = log.read_from(6).try_collect().await.unwrap();
            assert!(none.is_empty());
        }
    }

    #[tokio::test]
    async fn abandoning_the_stream_stops_reading() {
        let log = InMemoryTransactionLogStore::new(table(), EntityType::Files);
        for n in 1..=3 {
            log.append(n, Bytes::from("x")).await.unwrap();
        }
        let mut stream = log.read_from(1);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.0, 1);
        drop(stream);
        log.append(4, Bytes::from("y")).await.unwrap();
    }

    #[tokio::test]
    async fn truncation_keeps_latest_entry() {
        for log in stores() {
            for n in 1..=4 {
                log.append(n, Bytes::from("x")).await.unwrap();
            }
            assert_eq!(log.delete_transactions_before(3).await.unwrap(), 2);
            assert_eq!(log.read_entry(2).await.unwrap(), None);
            assert!(log.read_entry(3).await.unwrap().is_some());

            assert_eq!(log.delete_transactions_before(100).await.unwrap(), 1);
            assert_eq!(log.latest_transaction_number().await.unwrap(), 4);
            log.append(5, Bytes::from("z")).await.unwrap();
        }
    }

    #[tokio::test]
    async fn object_store_refuses_to_restart_a_truncated_log() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let log = ObjectStoreTransactionLogStore::new(storage, table(), EntityType::Files);
        for n in 1..=3 {
            log.append(n, Bytes::from("x")).await.unwrap();
        }
        log.delete_transactions_before(3).await.unwrap();

        assert!(log.append(1, Bytes::from("again")).await.unwrap_err().is_conflict());
        assert!(log.append(2, Bytes::from("again")).await.unwrap_err().is_conflict());
    }
}
