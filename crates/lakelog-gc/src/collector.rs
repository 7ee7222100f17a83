//! Deletes data files that no partition references any more.
//!
//! A file becomes a candidate once its reference count reaches zero and it
//! has not been touched for the table's GC delay. Candidates are processed in
//! batches: each object is removed from storage, then one `DeleteFiles`
//! transaction drops the batch's successfully processed filenames from the
//! files log. A file whose object could not be deleted stays in the log and
//! is retried on the next run.

use std::sync::Arc;
use std::time::Instant;

use lakelog_core::{StorageBackend, TableId};
use lakelog_core::observability::worker_span;
use lakelog_statestore::{StateStore, StateStoreCache, TableProperties};
use tracing::{Instrument, debug, info, warn};

use crate::metrics;

/// Result of a garbage collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcResult {
    /// Tables fully processed.
    pub tables_processed: u64,
    /// Files removed from storage and from the files log.
    pub files_deleted: u64,
    /// Candidates whose object was already gone; removed from the log anyway.
    pub files_already_absent: u64,
    /// Errors encountered (GC continues past them).
    pub errors: Vec<String>,
}

impl GcResult {
    /// Merges another result into this one.
    pub fn merge(&mut self, other: Self) {
        self.tables_processed += other.tables_processed;
        self.files_deleted += other.files_deleted;
        self.files_already_absent += other.files_already_absent;
        self.errors.extend(other.errors);
    }

    /// Returns true if any errors were encountered.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Garbage collector for unreferenced data files.
///
/// Data file names are object paths relative to the collector's storage.
///
/// # Example
///
/// ```rust,ignore
/// let collector = GarbageCollector::new(storage);
/// let result = collector.run(&mut cache, &tables).await;
/// if result.has_errors() {
///     tracing::warn!(errors = ?result.errors, "gc finished with errors");
/// }
/// ```
pub struct GarbageCollector {
    storage: Arc<dyn StorageBackend>,
}

impl GarbageCollector {
    /// Creates a collector that deletes data objects from `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Collects every table in `tables`.
    ///
    /// A table that cannot be loaded or collected is recorded in
    /// [`GcResult::errors`]; the remaining tables still run.
    pub async fn run(&self, cache: &mut StateStoreCache, tables: &[TableId]) -> GcResult {
        let started = Instant::now();
        let mut result = GcResult::default();

        for table_id in tables {
            let (properties, store) = match cache.get(table_id).await {
                Ok(cached) => (cached.properties.clone(), cached.state_store.clone()),
                Err(e) => {
                    warn!(table_id = %table_id, error = %e, "skipping table: failed to load");
                    metrics::record_error("load");
                    result.errors.push(format!("load {table_id}: {e}"));
                    continue;
                }
            };

            let span = worker_span("gc", table_id.as_str());
            match self.collect_table(&store, &properties).instrument(span).await {
                Ok(table_result) => result.merge(table_result),
                Err(e) => {
                    warn!(table_id = %table_id, error = %e, "garbage collection failed for table");
                    metrics::record_error("table");
                    result.errors.push(format!("collect {table_id}: {e}"));
                }
            }
        }

        metrics::record_run_duration(started.elapsed().as_secs_f64());
        info!(
            tables = tables.len(),
            tables_processed = result.tables_processed,
            files_deleted = result.files_deleted,
            errors = result.errors.len(),
            "garbage collection run complete"
        );
        result
    }

    /// Collects one table.
    ///
    /// Per-file delete failures are recorded in the result and leave those
    /// files in the log.
    ///
    /// # Errors
    ///
    /// Returns the state store error if the files log cannot be read or a
    /// `DeleteFiles` transaction fails. Batches committed before the failure
    /// stay committed.
    pub async fn collect_table(
        &self,
        store: &StateStore,
        properties: &TableProperties,
    ) -> lakelog_statestore::Result<GcResult> {
        let cutoff = store.clock().now() - properties.gc_delay();
        let candidates = store.ready_for_gc_filenames_before(cutoff).await?;
        let mut result = GcResult {
            tables_processed: 1,
            ..GcResult::default()
        };
        if candidates.is_empty() {
            debug!(table_id = %store.table_id(), %cutoff, "no files ready for gc");
            return Ok(result);
        }

        for batch in candidates.chunks(properties.gc_batch_size.max(1)) {
            let mut processed = Vec::with_capacity(batch.len());
            for filename in batch {
                match self.delete_object(filename).await {
                    Ok(existed) => {
                        if !existed {
                            result.files_already_absent += 1;
                        }
                        processed.push(filename.clone());
                    }
                    Err(e) => {
                        warn!(file = %filename, error = %e, "failed to delete data file");
                        metrics::record_error("delete");
                        result.errors.push(format!("delete {filename}: {e}"));
                    }
                }
            }
            if processed.is_empty() {
                continue;
            }

            let count = processed.len() as u64;
            store.delete_garbage_collected_files(processed).await?;
            result.files_deleted += count;
            metrics::record_files_deleted(count);
        }

        info!(
            table_id = %store.table_id(),
            candidates = candidates.len(),
            files_deleted = result.files_deleted,
            already_absent = result.files_already_absent,
            "garbage collected table"
        );
        Ok(result)
    }

    /// Deletes one object, returning whether it existed.
    async fn delete_object(&self, path: &str) -> lakelog_core::Result<bool> {
        if self.storage.head(path).await?.is_none() {
            debug!(file = %path, "data file already deleted");
            return Ok(false);
        }
        self.storage.delete(path).await?;
        Ok(true)
    }
}
