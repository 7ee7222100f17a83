//! Canonical storage paths for lakelog tables.
//!
//! This module is the single source of truth for every metadata path. Writers
//! and readers must build keys through [`TablePaths`]; no other module
//! formats path strings.
//!
//! # Path Layout
//!
//! ```text
//! tables/{table_id}/
//! ├── properties.json
//! ├── transactions/
//! │   ├── files/{number:020}.json
//! │   └── partitions/{number:020}.json
//! └── snapshots/
//!     └── {entity}/
//!         ├── latest.json
//!         ├── metadata/{number:020}.json
//!         └── {number:020}-{ulid}.parquet
//! ```
//!
//! Transaction numbers are zero-padded so lexicographic listing order equals
//! numeric order.

use crate::id::TableId;

/// The two independently serialized entity types of a table.
///
/// Each entity type has its own transaction log, snapshots and head, so
/// file updates never contend with partition updates.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// File references and reference counts.
    Files,
    /// The partition tree.
    Partitions,
}

impl EntityType {
    /// Returns the string name for this entity type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Files => "files",
            Self::Partitions => "partitions",
        }
    }

    /// Returns all entity types.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Files, Self::Partitions]
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Width of zero-padded transaction numbers in object keys.
const NUMBER_WIDTH: usize = 20;

/// Canonical path generator for table metadata.
///
/// # Example
///
/// ```
/// use lakelog_core::{EntityType, TableId, TablePaths};
///
/// let table = TableId::new("orders").unwrap();
/// assert_eq!(
///     TablePaths::transaction(&table, EntityType::Files, 7),
///     "tables/orders/transactions/files/00000000000000000007.json"
/// );
/// ```
pub struct TablePaths;

impl TablePaths {
    /// Prefix under which every table lives.
    pub const TABLES_PREFIX: &'static str = "tables/";

    /// Returns the directory of a table.
    #[must_use]
    pub fn table_dir(table_id: &TableId) -> String {
        format!("tables/{table_id}/")
    }

    /// Returns the table properties document path.
    #[must_use]
    pub fn properties(table_id: &TableId) -> String {
        format!("tables/{table_id}/properties.json")
    }

    // =========================================================================
    // Transaction Log Paths
    // =========================================================================

    /// Returns the transaction log directory for an entity type.
    #[must_use]
    pub fn transactions_dir(table_id: &TableId, entity: EntityType) -> String {
        format!("tables/{table_id}/transactions/{}/", entity.as_str())
    }

    /// Returns the path of one transaction log entry.
    #[must_use]
    pub fn transaction(table_id: &TableId, entity: EntityType, number: u64) -> String {
        format!(
            "tables/{table_id}/transactions/{}/{number:0width$}.json",
            entity.as_str(),
            width = NUMBER_WIDTH
        )
    }

    /// Parses the transaction number out of a transaction entry path.
    #[must_use]
    pub fn parse_transaction_number(path: &str) -> Option<u64> {
        let name = path.rsplit('/').next()?;
        name.strip_suffix(".json")?.parse().ok()
    }

    // =========================================================================
    // Snapshot Paths
    // =========================================================================

    /// Returns the snapshot directory for an entity type.
    #[must_use]
    pub fn snapshots_dir(table_id: &TableId, entity: EntityType) -> String {
        format!("tables/{table_id}/snapshots/{}/", entity.as_str())
    }

    /// Returns the path of a snapshot data object.
    ///
    /// The ULID suffix keeps a retried write from clobbering an object another
    /// creator produced for the same transaction number.
    #[must_use]
    pub fn snapshot_data(table_id: &TableId, entity: EntityType, number: u64, ulid: &str) -> String {
        format!(
            "tables/{table_id}/snapshots/{}/{number:0width$}-{ulid}.parquet",
            entity.as_str(),
            width = NUMBER_WIDTH
        )
    }

    /// Returns the directory holding snapshot metadata rows.
    #[must_use]
    pub fn snapshot_metadata_dir(table_id: &TableId, entity: EntityType) -> String {
        format!("tables/{table_id}/snapshots/{}/metadata/", entity.as_str())
    }

    /// Returns the metadata row path for a snapshot at a transaction number.
    #[must_use]
    pub fn snapshot_metadata(table_id: &TableId, entity: EntityType, number: u64) -> String {
        format!(
            "tables/{table_id}/snapshots/{}/metadata/{number:0width$}.json",
            entity.as_str(),
            width = NUMBER_WIDTH
        )
    }

    /// Returns the latest-snapshot pointer path.
    #[must_use]
    pub fn latest_snapshot(table_id: &TableId, entity: EntityType) -> String {
        format!("tables/{table_id}/snapshots/{}/latest.json", entity.as_str())
    }

    /// Extracts the table ID from a properties document path.
    #[must_use]
    pub fn table_id_from_properties_path(path: &str) -> Option<TableId> {
        let rest = path.strip_prefix(Self::TABLES_PREFIX)?;
        let id = rest.strip_suffix("/properties.json")?;
        TableId::new(id).ok()
    }
}
