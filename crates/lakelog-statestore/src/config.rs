//! State store tuning and per-table properties.

use std::time::Duration;

use chrono::TimeDelta;
use lakelog_core::config::{ConfigSource, read_bool, read_millis, read_secs, read_u32, read_u64};
use lakelog_core::{Error, RetryPolicy};
use serde::{Deserialize, Serialize};

/// Process-wide state store settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateStoreConfig {
    /// Attempts for one logical write before giving up on conflicts.
    pub add_transaction_max_attempts: u32,
    /// Backoff before the first retry after a conflict.
    pub add_transaction_first_retry_wait: Duration,
    /// Cap on any single conflict backoff.
    pub add_transaction_max_retry_wait: Duration,
    /// How often a head looks for a newer snapshot.
    pub min_snapshot_check_interval: Duration,
    /// A snapshot must be at least this far ahead of the head to be loaded.
    pub min_transactions_ahead_to_load_snapshot: u64,
    /// How often a head reads the log tail before serving a query.
    pub min_transaction_check_interval: Duration,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            add_transaction_max_attempts: 10,
            add_transaction_first_retry_wait: Duration::from_millis(200),
            add_transaction_max_retry_wait: Duration::from_secs(30),
            min_snapshot_check_interval: Duration::from_secs(60),
            min_transactions_ahead_to_load_snapshot: 10,
            min_transaction_check_interval: Duration::ZERO,
        }
    }
}

impl StateStoreConfig {
    /// Loads settings from `source`, keeping defaults for unset variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] naming the variable if a value does
    /// not parse, or if max attempts is zero.
    pub fn from_source(source: &impl ConfigSource) -> Result<Self, Error> {
        let defaults = Self::default();
        let config = Self {
            add_transaction_max_attempts: read_u32(source, "LAKELOG_ADD_TRANSACTION_MAX_ATTEMPTS")?
                .unwrap_or(defaults.add_transaction_max_attempts),
            add_transaction_first_retry_wait: read_millis(
                source,
                "LAKELOG_ADD_TRANSACTION_FIRST_RETRY_WAIT_MS",
            )?
            .unwrap_or(defaults.add_transaction_first_retry_wait),
            add_transaction_max_retry_wait: read_millis(
                source,
                "LAKELOG_ADD_TRANSACTION_MAX_RETRY_WAIT_MS",
            )?
            .unwrap_or(defaults.add_transaction_max_retry_wait),
            min_snapshot_check_interval: read_secs(
                source,
                "LAKELOG_MIN_SNAPSHOT_CHECK_INTERVAL_SECS",
            )?
            .unwrap_or(defaults.min_snapshot_check_interval),
            min_transactions_ahead_to_load_snapshot: read_u64(
                source,
                "LAKELOG_MIN_TRANSACTIONS_AHEAD_TO_LOAD_SNAPSHOT",
            )?
            .unwrap_or(defaults.min_transactions_ahead_to_load_snapshot),
            min_transaction_check_interval: read_millis(
                source,
                "LAKELOG_MIN_TRANSACTION_CHECK_INTERVAL_MS",
            )?
            .unwrap_or(defaults.min_transaction_check_interval),
        };
        if config.add_transaction_max_attempts == 0 {
            return Err(Error::InvalidInput(
                "LAKELOG_ADD_TRANSACTION_MAX_ATTEMPTS must be at least 1".into(),
            ));
        }
        Ok(config)
    }

    /// Backoff policy for append conflicts.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_attempts(
            self.add_transaction_first_retry_wait,
            self.add_transaction_max_retry_wait,
            self.add_transaction_max_attempts,
        )
    }
}

/// Per-table settings, stored as JSON next to the table's logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TableProperties {
    /// Seconds an unreferenced file must stay untouched before deletion.
    pub gc_delay_secs: u64,
    /// Files deleted per `DeleteFiles` transaction.
    pub gc_batch_size: usize,
    /// Snapshots kept per entity type.
    pub snapshot_retention_count: usize,
    /// Snapshots younger than this are never pruned.
    pub snapshot_min_age_secs: u64,
    /// Truncate the log below the oldest retained snapshot after pruning.
    pub delete_transactions_before_retained_snapshot: bool,
    /// References per compaction job.
    pub compaction_files_batch_size: usize,
}

impl Default for TableProperties {
    fn default() -> Self {
        Self {
            gc_delay_secs: 600,
            gc_batch_size: 2000,
            snapshot_retention_count: 3,
            snapshot_min_age_secs: 86_400,
            delete_transactions_before_retained_snapshot: true,
            compaction_files_batch_size: 11,
        }
    }
}

impl TableProperties {
    /// Rejects settings that would stall workers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for zero batch sizes or zero retention.
    pub fn validate(&self) -> Result<(), Error> {
        if self.gc_batch_size == 0 {
            return Err(Error::InvalidInput("gcBatchSize must be at least 1".into()));
        }
        if self.compaction_files_batch_size == 0 {
            return Err(Error::InvalidInput(
                "compactionFilesBatchSize must be at least 1".into(),
            ));
        }
        if self.snapshot_retention_count == 0 {
            return Err(Error::InvalidInput(
                "snapshotRetentionCount must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Garbage collection delay.
    #[must_use]
    pub fn gc_delay(&self) -> TimeDelta {
        TimeDelta::seconds(i64::try_from(self.gc_delay_secs).unwrap_or(i64::MAX))
    }

    /// Minimum snapshot age before pruning.
    #[must_use]
    pub fn snapshot_min_age(&self) -> TimeDelta {
        TimeDelta::seconds(i64::try_from(self.snapshot_min_age_secs).unwrap_or(i64::MAX))
    }

    /// Applies overrides from a config source (`LAKELOG_GC_DELAY_SECS`,
    /// `LAKELOG_GC_BATCH_SIZE`, `LAKELOG_SNAPSHOT_RETENTION_COUNT`,
    /// `LAKELOG_SNAPSHOT_MIN_AGE_SECS`,
    /// `LAKELOG_DELETE_TRANSACTIONS_BEFORE_RETAINED_SNAPSHOT`,
    /// `LAKELOG_COMPACTION_FILES_BATCH_SIZE`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if a value does not parse or the result
    /// fails [`TableProperties::validate`].
    pub fn with_overrides(mut self, source: &impl ConfigSource) -> Result<Self, Error> {
        use lakelog_core::config::read_usize;

        if let Some(v) = read_u64(source, "LAKELOG_GC_DELAY_SECS")? {
            self.gc_delay_secs = v;
        }
        if let Some(v) = read_usize(source, "LAKELOG_GC_BATCH_SIZE")? {
            self.gc_batch_size = v;
        }
        if let Some(v) = read_usize(source, "LAKELOG_SNAPSHOT_RETENTION_COUNT")? {
            self.snapshot_retention_count = v;
        }
        if let Some(v) = read_u64(source, "LAKELOG_SNAPSHOT_MIN_AGE_SECS")? {
            self.snapshot_min_age_secs = v;
        }
        if let Some(v) = read_bool(source, "LAKELOG_DELETE_TRANSACTIONS_BEFORE_RETAINED_SNAPSHOT")? {
            self.delete_transactions_before_retained_snapshot = v;
        }
        if let Some(v) = read_usize(source, "LAKELOG_COMPACTION_FILES_BATCH_SIZE")? {
            self.compaction_files_batch_size = v;
        }
        self.validate()?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn config_defaults_when_unset() {
        let config = StateStoreConfig::from_source(&HashMap::new()).unwrap();
        assert_eq!(config, StateStoreConfig::default());
    }

    #[test]
    fn config_reads_overrides() {
        let source: HashMap<String, String> = [
            ("LAKELOG_ADD_TRANSACTION_MAX_ATTEMPTS", "3"),
            ("LAKELOG_ADD_TRANSACTION_FIRST_RETRY_WAIT_MS", "5"),
            ("LAKELOG_MIN_TRANSACTIONS_AHEAD_TO_LOAD_SNAPSHOT", "1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let config = StateStoreConfig::from_source(&source).unwrap();
        assert_eq!(config.add_transaction_max_attempts, 3);
        assert_eq!(config.add_transaction_first_retry_wait, Duration::from_millis(5));
        assert_eq!(config.min_transactions_ahead_to_load_snapshot, 1);
    }

    #[test]
    fn config_rejects_zero_attempts() {
        let source: HashMap<String, String> =
            HashMap::from([("LAKELOG_ADD_TRANSACTION_MAX_ATTEMPTS".into(), "0".into())]);
        assert!(StateStoreConfig::from_source(&source).is_err());
    }

    #[test]
    fn properties_fill_defaults_from_partial_json() {
        let props: TableProperties = serde_json::from_str(r#"{"gcDelaySecs": 5}"#).unwrap();
        assert_eq!(props.gc_delay_secs, 5);
        assert_eq!(props.gc_batch_size, 2000);
        assert_eq!(props.gc_delay(), TimeDelta::seconds(5));
        props.validate().unwrap();
    }

    #[test]
    fn properties_reject_zero_batches() {
        let props = TableProperties {
            gc_batch_size: 0,
            ..TableProperties::default()
        };
        assert!(props.validate().is_err());

        let source: HashMap<String, String> =
            HashMap::from([("LAKELOG_SNAPSHOT_RETENTION_COUNT".into(), "0".into())]);
        assert!(TableProperties::default().with_overrides(&source).is_err());
    }
}
