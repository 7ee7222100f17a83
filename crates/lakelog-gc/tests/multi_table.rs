//! Garbage collection across several tables through the state store cache.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lakelog_core::{JobId, MemoryBackend, StorageBackend, TableId, WritePrecondition};
use lakelog_gc::GarbageCollector;
use lakelog_statestore::{
    AssignJobIdRequest, FileReference, KeyType, ReplaceFileReferencesRequest, RowKeyField,
    StateStoreCache, StateStoreConfig, StateStoreFactory, TableProperties,
};
use lakelog_test_utils::{SimulatedClock, init_test_logging};

async fn register(factory: &StateStoreFactory, name: &str) -> TableId {
    let table_id = TableId::new(name).unwrap();
    let properties = TableProperties {
        gc_delay_secs: 60,
        ..TableProperties::default()
    };
    factory
        .properties_store()
        .create(&table_id, &properties)
        .await
        .unwrap();
    let store = factory.state_store(table_id.clone());
    store
        .initialise_with_single_root(&[RowKeyField::new("id", KeyType::Long)])
        .await
        .unwrap();
    table_id
}

async fn compact_one(
    factory: &StateStoreFactory,
    storage: &dyn StorageBackend,
    table_id: &TableId,
    input: &str,
    output: &str,
) {
    storage
        .put(input, Bytes::from_static(b"PAR1"), WritePrecondition::None)
        .await
        .unwrap();
    let store = factory.state_store(table_id.clone());
    store.add_file(FileReference::new(input, "root", 5)).await.unwrap();
    let job_id = JobId::generate();
    store
        .assign_job_ids(vec![AssignJobIdRequest {
            job_id: job_id.clone(),
            partition_id: "root".into(),
            filenames: vec![input.into()],
        }])
        .await
        .unwrap();
    store
        .atomically_replace_file_references_with_new_one(ReplaceFileReferencesRequest {
            job_id,
            partition_id: "root".into(),
            input_files: vec![input.into()],
            new_reference: FileReference::new(output, "root", 5),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn one_missing_table_does_not_stop_the_others() {
    init_test_logging();
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let clock = Arc::new(SimulatedClock::deterministic());
    let factory = StateStoreFactory::new(storage.clone(), StateStoreConfig::default(), clock.clone());

    let orders = register(&factory, "orders").await;
    let events = register(&factory, "events").await;
    compact_one(&factory, storage.as_ref(), &orders, "data/orders/a.parquet", "data/orders/c1.parquet").await;
    compact_one(&factory, storage.as_ref(), &events, "data/events/a.parquet", "data/events/c1.parquet").await;
    clock.advance(Duration::from_secs(61));

    let mut cache = StateStoreCache::new(factory, Duration::from_secs(300));
    let tables = vec![orders.clone(), TableId::new("ghost").unwrap(), events.clone()];
    let result = GarbageCollector::new(storage.clone()).run(&mut cache, &tables).await;

    assert_eq!(result.tables_processed, 2);
    assert_eq!(result.files_deleted, 2);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("ghost"));
    assert!(storage.head("data/orders/a.parquet").await.unwrap().is_none());
    assert!(storage.head("data/events/a.parquet").await.unwrap().is_none());

    let store = cache.get(&orders).await.unwrap().state_store.clone();
    let remaining: Vec<String> = store
        .file_references()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.filename)
        .collect();
    assert_eq!(remaining, vec!["data/orders/c1.parquet"]);
}
