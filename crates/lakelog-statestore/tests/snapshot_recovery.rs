//! Integration tests for snapshots, pruning and log truncation.

use std::sync::Arc;
use std::time::Duration;

use lakelog_core::{EntityType, MemoryBackend, StorageBackend, TableId};
use lakelog_statestore::{
    FileReference, KeyType, RowKeyField, SnapshotStore, StateStore, StateStoreConfig,
    TableProperties, TransactionLogStore,
};
use lakelog_statestore::ObjectStoreTransactionLogStore;
use lakelog_test_utils::SimulatedClock;

fn table() -> TableId {
    TableId::new("orders").unwrap()
}

/// A reader built after pruning and truncation still sees the full state.
#[tokio::test]
async fn test_reader_recovers_after_prune_and_truncation() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let clock = Arc::new(SimulatedClock::deterministic());
    let writer = StateStore::builder(table())
        .storage(storage.clone())
        .clock(clock.clone())
        .build();
    writer
        .initialise_with_single_root(&[RowKeyField::new("id", KeyType::Long)])
        .await
        .unwrap();

    for i in 0..10 {
        writer
            .add_file(FileReference::new(format!("f{i}"), "root", 1))
            .await
            .unwrap();
        if i % 4 == 3 {
            writer.create_snapshots().await.unwrap();
        }
        clock.advance(Duration::from_secs(3600));
    }

    let properties = TableProperties {
        snapshot_retention_count: 1,
        snapshot_min_age_secs: 0,
        ..TableProperties::default()
    };
    let pruned = writer.prune_snapshots(&properties).await.unwrap();
    let (entity, files) = &pruned[0];
    assert_eq!(*entity, EntityType::Files);
    assert_eq!(files.deleted, vec![4]);
    assert_eq!(files.transactions_deleted, 7);

    let log = ObjectStoreTransactionLogStore::new(storage.clone(), table(), EntityType::Files);
    assert!(log.read_entry(7).await.unwrap().is_none());
    assert_eq!(log.latest_transaction_number().await.unwrap(), 10);

    let reader = StateStore::builder(table()).storage(storage.clone()).build();
    assert_eq!(
        reader.files_state().await.unwrap(),
        writer.files_state().await.unwrap()
    );
    let snapshots = SnapshotStore::new(storage, table());
    assert_eq!(snapshots.list(EntityType::Files).await.unwrap().len(), 1);
}

/// A head whose snapshot check is throttled still reaches the truth after
/// the log below it is truncated.
#[tokio::test]
async fn test_lagging_writer_catches_up_after_truncation() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let lagging = StateStore::builder(table())
        .storage(storage.clone())
        .config(StateStoreConfig {
            min_snapshot_check_interval: Duration::from_secs(3600),
            add_transaction_first_retry_wait: Duration::from_millis(1),
            ..StateStoreConfig::default()
        })
        .build();
    lagging
        .initialise_with_single_root(&[RowKeyField::new("id", KeyType::Long)])
        .await
        .unwrap();
    lagging
        .add_file(FileReference::new("first", "root", 1))
        .await
        .unwrap();

    let busy = StateStore::builder(table()).storage(storage.clone()).build();
    for i in 0..5 {
        busy.add_file(FileReference::new(format!("f{i}"), "root", 1))
            .await
            .unwrap();
    }
    busy.create_snapshots().await.unwrap();
    let log = ObjectStoreTransactionLogStore::new(storage, table(), EntityType::Files);
    assert_eq!(log.delete_transactions_before(6).await.unwrap(), 5);

    lagging
        .add_file(FileReference::new("last", "root", 1))
        .await
        .unwrap();
    let state = lagging.files_state().await.unwrap();
    assert_eq!(state.len(), 7);
    assert_eq!(lagging.files_transaction_number().await.unwrap(), 7);
}

/// A reader whose next log entry was truncated serves the snapshot state
/// rather than its stale cache.
#[tokio::test]
async fn test_stale_reader_recovers_after_truncation() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let reader = StateStore::builder(table())
        .storage(storage.clone())
        .config(StateStoreConfig {
            min_snapshot_check_interval: Duration::ZERO,
            ..StateStoreConfig::default()
        })
        .build();
    reader
        .add_file(FileReference::new("first", "root", 1))
        .await
        .unwrap();
    assert_eq!(reader.files_state().await.unwrap().len(), 1);

    let writer = StateStore::builder(table()).storage(storage.clone()).build();
    for name in ["b", "c", "d"] {
        writer
            .add_file(FileReference::new(name, "root", 1))
            .await
            .unwrap();
    }
    writer.create_snapshots().await.unwrap();
    let log = ObjectStoreTransactionLogStore::new(storage, table(), EntityType::Files);
    log.delete_transactions_before(4).await.unwrap();

    assert_eq!(
        reader.files_state().await.unwrap(),
        writer.files_state().await.unwrap()
    );
    assert_eq!(reader.files_transaction_number().await.unwrap(), 4);
}
