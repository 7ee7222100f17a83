//! Per-table maintenance passes: `snapshot`, `prune-snapshots`, `gc` and `create-jobs`.
//!
//! A pass visits every selected table. A failing table is logged and
//! reported; the other tables still run.

use anyhow::{Result, bail};
use lakelog_compaction::{CompactionJob, CompactionJobCreator};
use lakelog_core::observability::worker_span;
use lakelog_gc::GarbageCollector;
use tracing::{Instrument, info, warn};

use super::Context;

/// Outcome of one pass over the selected tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Tables the pass ran on without error.
    pub tables_succeeded: usize,
    /// Snapshots written, snapshots pruned, files deleted or jobs created.
    pub items: u64,
    /// One message per failed table or file.
    pub failures: Vec<String>,
}

impl PassReport {
    /// Fails if any table or file failed.
    ///
    /// # Errors
    ///
    /// Returns an error listing the failures.
    pub fn into_result(self) -> Result<Self> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            bail!("{} failure(s): {}", self.failures.len(), self.failures.join("; "))
        }
    }
}

/// Writes snapshots of both logs for every table with new transactions.
///
/// # Errors
///
/// Returns an error if the tables cannot be listed or any table fails.
pub async fn snapshot(ctx: &mut Context) -> Result<PassReport> {
    let mut report = PassReport::default();
    for table_id in ctx.tables().await? {
        let result = async {
            let store = ctx.cache().get(&table_id).await?.state_store.clone();
            store.create_snapshots().await
        }
        .instrument(worker_span("snapshot", table_id.as_str()))
        .await;
        match result {
            Ok(created) => {
                report.tables_succeeded += 1;
                report.items += created.len() as u64;
                for snapshot in created {
                    info!(
                        table_id = %table_id,
                        entity = %snapshot.entity,
                        transaction_number = snapshot.transaction_number,
                        "created snapshot"
                    );
                }
            }
            Err(e) => {
                warn!(table_id = %table_id, error = %e, "snapshot failed");
                report.failures.push(format!("snapshot {table_id}: {e}"));
            }
        }
    }
    report.into_result()
}

/// Applies each table's snapshot retention.
///
/// # Errors
///
/// Returns an error if the tables cannot be listed or any table fails.
pub async fn prune_snapshots(ctx: &mut Context) -> Result<PassReport> {
    let mut report = PassReport::default();
    for table_id in ctx.tables().await? {
        let result = async {
            let cached = ctx.cache().get(&table_id).await?;
            let (properties, store) = (cached.properties.clone(), cached.state_store.clone());
            store.prune_snapshots(&properties).await
        }
        .instrument(worker_span("prune_snapshots", table_id.as_str()))
        .await;
        match result {
            Ok(pruned) => {
                report.tables_succeeded += 1;
                report.items += pruned
                    .iter()
                    .map(|(_, result)| result.deleted.len() as u64)
                    .sum::<u64>();
            }
            Err(e) => {
                warn!(table_id = %table_id, error = %e, "snapshot pruning failed");
                report.failures.push(format!("prune {table_id}: {e}"));
            }
        }
    }
    report.into_result()
}

/// Deletes unreferenced data files past each table's GC delay.
///
/// # Errors
///
/// Returns an error if the tables cannot be listed or any table or file fails.
pub async fn gc(ctx: &mut Context) -> Result<PassReport> {
    let tables = ctx.tables().await?;
    let collector = GarbageCollector::new(ctx.storage().clone());
    let result = collector.run(ctx.cache(), &tables).await;
    PassReport {
        tables_succeeded: usize::try_from(result.tables_processed).unwrap_or(usize::MAX),
        items: result.files_deleted,
        failures: result.errors,
    }
    .into_result()
}

/// Creates compaction jobs for every table.
///
/// # Errors
///
/// Returns an error if the tables cannot be listed or any table fails. Jobs
/// created for other tables before the failure stay assigned.
pub async fn create_jobs(ctx: &mut Context) -> Result<Vec<CompactionJob>> {
    let mut report = PassReport::default();
    let mut created = Vec::new();
    for table_id in ctx.tables().await? {
        let result = async {
            let cached = ctx.cache().get(&table_id).await?;
            let creator = CompactionJobCreator::new(cached.properties.compaction_files_batch_size);
            let store = cached.state_store.clone();
            creator.create_jobs(&store).await
        }
        .instrument(worker_span("create_jobs", table_id.as_str()))
        .await;
        match result {
            Ok(jobs) => {
                report.tables_succeeded += 1;
                report.items += jobs.len() as u64;
                created.extend(jobs);
            }
            Err(e) => {
                warn!(table_id = %table_id, error = %e, "job creation failed");
                report.failures.push(format!("create-jobs {table_id}: {e}"));
            }
        }
    }
    report.into_result()?;
    Ok(created)
}
