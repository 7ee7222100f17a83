//! Integration tests for concurrent writers sharing one table.
//!
//! Each writer is a separate `StateStore` over the same backend, the way
//! separate processes would share an object store. Only compare-and-append
//! serializes them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use lakelog_core::{JobId, MemoryBackend, StorageBackend, TableId};
use lakelog_statestore::{
    AssignJobIdRequest, FileReference, KeyType, RowKeyField, StateStore, StateStoreConfig,
    StateStoreError,
};
use lakelog_test_utils::seeded_jitter;

fn contended_config() -> StateStoreConfig {
    StateStoreConfig {
        add_transaction_max_attempts: 100,
        add_transaction_first_retry_wait: Duration::from_millis(1),
        add_transaction_max_retry_wait: Duration::from_millis(10),
        ..StateStoreConfig::default()
    }
}

fn writer(backend: &Arc<dyn StorageBackend>, seed: u64) -> StateStore {
    StateStore::builder(TableId::new("orders").unwrap())
        .storage(backend.clone())
        .config(contended_config())
        .jitter(seeded_jitter(seed))
        .build()
}

async fn initialised_backend() -> Arc<dyn StorageBackend> {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    writer(&backend, 0)
        .initialise_with_single_root(&[RowKeyField::new("id", KeyType::Long)])
        .await
        .unwrap();
    backend
}

/// Every add from every writer lands exactly once, in a gapless log.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_adds_all_land() {
    let backend = initialised_backend().await;

    let handles: Vec<_> = (0..8u64)
        .map(|w| {
            let store = writer(&backend, w);
            tokio::spawn(async move {
                for i in 0..5 {
                    store
                        .add_file(FileReference::new(format!("w{w}-f{i}"), "root", 10))
                        .await
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let reader = writer(&backend, 99);
    let files = reader.files_state().await.unwrap();
    assert_eq!(files.len(), 40);
    assert_eq!(reader.files_transaction_number().await.unwrap(), 40);
}

/// Two jobs race for the same references: exactly one assignment wins.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_job_assignment_race_has_one_winner() {
    let backend = initialised_backend().await;
    writer(&backend, 0)
        .add_files(vec![
            FileReference::new("a", "root", 10),
            FileReference::new("b", "root", 10),
        ])
        .await
        .unwrap();

    let wins = Arc::new(AtomicU32::new(0));
    let losses = Arc::new(AtomicU32::new(0));
    let handles: Vec<_> = (0..4u64)
        .map(|w| {
            let store = writer(&backend, w);
            let wins = wins.clone();
            let losses = losses.clone();
            tokio::spawn(async move {
                let result = store
                    .assign_job_ids(vec![AssignJobIdRequest {
                        job_id: JobId::new(format!("job-{w}")),
                        partition_id: "root".into(),
                        filenames: vec!["a".into(), "b".into()],
                    }])
                    .await;
                match result {
                    Ok(()) => wins.fetch_add(1, Ordering::SeqCst),
                    Err(StateStoreError::FileReferenceAssignedToJob { .. }) => {
                        losses.fetch_add(1, Ordering::SeqCst)
                    }
                    Err(other) => panic!("unexpected error: {other}"),
                };
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(wins.load(Ordering::SeqCst), 1);
    assert_eq!(losses.load(Ordering::SeqCst), 3);

    let references = writer(&backend, 99).file_references().await.unwrap();
    let job = references[0].job_id.clone();
    assert!(job.is_some());
    assert!(references.iter().all(|r| r.job_id == job));
}
