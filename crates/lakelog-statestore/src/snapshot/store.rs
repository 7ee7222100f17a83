//! Snapshot objects, their metadata rows, and the latest-snapshot pointer.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use lakelog_core::{EntityType, StorageBackend, TableId, TablePaths, WritePrecondition, WriteResult};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::{Result, StateStoreError};
use crate::state::EntityState;

/// Maximum CAS attempts when advancing the latest-snapshot pointer.
const POINTER_CAS_MAX_RETRIES: u32 = 10;

/// Pointer to one stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    /// Object path of the encoded state.
    pub path: String,
    /// Entity type of the state.
    pub entity: EntityType,
    /// Transaction number the state reflects.
    pub transaction_number: u64,
    /// When the snapshot was written.
    pub created_at: DateTime<Utc>,
}

/// Snapshot storage for one table.
#[derive(Clone)]
pub struct SnapshotStore {
    storage: Arc<dyn StorageBackend>,
    table_id: TableId,
}

impl SnapshotStore {
    /// Creates a snapshot store for `table_id`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, table_id: TableId) -> Self {
        Self { storage, table_id }
    }

    /// Returns the table.
    #[must_use]
    pub fn table_id(&self) -> &TableId {
        &self.table_id
    }

    /// Writes `state` as the snapshot at `transaction_number`.
    ///
    /// The object goes first, then the metadata row (create-only), then the
    /// latest pointer is advanced if this snapshot is newer.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError::DuplicateSnapshot`] if a snapshot already
    /// exists at this number, after moving the latest pointer up to it.
    /// Storage and encoding failures propagate.
    pub async fn save<T: EntityState>(
        &self,
        state: &T,
        transaction_number: u64,
        created_at: DateTime<Utc>,
    ) -> Result<SnapshotMetadata> {
        let entity = T::ENTITY;
        let metadata_path = TablePaths::snapshot_metadata(&self.table_id, entity, transaction_number);
        if self.storage.head(&metadata_path).await?.is_some() {
            // The row may have been written without its pointer.
            let existing: SnapshotMetadata = self.read_json(&metadata_path).await?;
            self.advance_latest(&existing).await?;
            return Err(self.duplicate(entity, transaction_number));
        }

        let body = state.encode_snapshot(transaction_number)?;
        let path = TablePaths::snapshot_data(
            &self.table_id,
            entity,
            transaction_number,
            &ulid::Ulid::new().to_string(),
        );
        self.storage
            .put(&path, body, WritePrecondition::DoesNotExist)
            .await?;

        let metadata = SnapshotMetadata {
            path,
            entity,
            transaction_number,
            created_at,
        };
        match self
            .storage
            .put(&metadata_path, json_bytes(&metadata)?, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => {}
            WriteResult::PreconditionFailed { .. } => {
                // Another creator won the race; our object is unreferenced.
                self.storage.delete(&metadata.path).await?;
                return Err(self.duplicate(entity, transaction_number));
            }
        }

        self.advance_latest(&metadata).await?;
        info!(
            table_id = %self.table_id,
            entity = %entity,
            transaction_number,
            path = %metadata.path,
            "wrote snapshot"
        );
        Ok(metadata)
    }

    async fn advance_latest(&self, metadata: &SnapshotMetadata) -> Result<()> {
        let pointer = TablePaths::latest_snapshot(&self.table_id, metadata.entity);
        for attempt in 1..=POINTER_CAS_MAX_RETRIES {
            let precondition = match self.storage.head(&pointer).await? {
                None => WritePrecondition::DoesNotExist,
                Some(meta) => {
                    let current: SnapshotMetadata = self.read_json(&pointer).await?;
                    if current.transaction_number >= metadata.transaction_number {
                        debug!(
                            current = current.transaction_number,
                            new = metadata.transaction_number,
                            "latest snapshot pointer already ahead"
                        );
                        return Ok(());
                    }
                    WritePrecondition::MatchesVersion(meta.version)
                }
            };
            match self
                .storage
                .put(&pointer, json_bytes(metadata)?, precondition)
                .await?
            {
                WriteResult::Success { .. } => return Ok(()),
                WriteResult::PreconditionFailed { .. } => {
                    debug!(attempt, "latest snapshot pointer CAS lost, retrying");
                }
            }
        }
        Err(lakelog_core::Error::PreconditionFailed {
            message: format!("latest snapshot pointer {pointer} lost CAS race after max retries"),
        }
        .into())
    }

    /// Returns the newest snapshot of an entity type.
    ///
    /// # Errors
    ///
    /// Returns an error if the pointer cannot be read or decoded.
    pub async fn latest(&self, entity: EntityType) -> Result<Option<SnapshotMetadata>> {
        let pointer = TablePaths::latest_snapshot(&self.table_id, entity);
        match self.storage.get(&pointer).await {
            Ok(bytes) => Ok(Some(parse_json(&bytes, &pointer)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists all snapshots of an entity type, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if listing or reading a metadata row fails.
    pub async fn list(&self, entity: EntityType) -> Result<Vec<SnapshotMetadata>> {
        let prefix = TablePaths::snapshot_metadata_dir(&self.table_id, entity);
        let mut rows = Vec::new();
        for meta in self.storage.list(&prefix).await? {
            match self.storage.get(&meta.path).await {
                Ok(bytes) => rows.push(parse_json::<SnapshotMetadata>(&bytes, &meta.path)?),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        rows.sort_by_key(|m| m.transaction_number);
        Ok(rows)
    }

    /// Loads the state a snapshot points to.
    ///
    /// # Errors
    ///
    /// Returns an error if the object is missing, undecodable, or tagged with a
    /// different transaction number than its metadata.
    pub async fn load<T: EntityState>(&self, metadata: &SnapshotMetadata) -> Result<T> {
        let bytes = self.storage.get(&metadata.path).await?;
        let (state, number) = T::decode_snapshot(&bytes)?;
        if number != metadata.transaction_number {
            return Err(lakelog_core::Error::serialization(
                format!("snapshot {}", metadata.path),
                format!(
                    "object reflects transaction {number}, metadata says {}",
                    metadata.transaction_number
                ),
            )
            .into());
        }
        Ok(state)
    }

    /// Loads the newest snapshot of `T`, with its transaction number.
    ///
    /// # Errors
    ///
    /// Returns an error if the pointer or object cannot be read.
    pub async fn load_latest<T: EntityState>(&self) -> Result<Option<(T, u64)>> {
        let Some(metadata) = self.latest(T::ENTITY).await? else {
            return Ok(None);
        };
        let state = self.load(&metadata).await?;
        Ok(Some((state, metadata.transaction_number)))
    }

    /// Deletes a snapshot object and then its metadata row.
    ///
    /// An object that is already gone is logged, not treated as an error.
    /// Returns whether the object was present.
    ///
    /// # Errors
    ///
    /// Returns an error if a delete fails.
    pub async fn delete(&self, metadata: &SnapshotMetadata) -> Result<bool> {
        let existed = self.storage.head(&metadata.path).await?.is_some();
        if existed {
            self.storage.delete(&metadata.path).await?;
        } else {
            warn!(
                table_id = %self.table_id,
                entity = %metadata.entity,
                transaction_number = metadata.transaction_number,
                path = %metadata.path,
                "snapshot object already absent, removing metadata only"
            );
        }
        let row = TablePaths::snapshot_metadata(
            &self.table_id,
            metadata.entity,
            metadata.transaction_number,
        );
        self.storage.delete(&row).await?;
        Ok(existed)
    }

    fn duplicate(&self, entity: EntityType, transaction_number: u64) -> StateStoreError {
        StateStoreError::DuplicateSnapshot {
            table_id: self.table_id.clone(),
            entity,
            transaction_number,
        }
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let bytes = self.storage.get(path).await?;
        parse_json(&bytes, path)
    }
}

fn json_bytes<T: Serialize>(value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| lakelog_core::Error::serialization("encode snapshot metadata", e).into())
}

fn parse_json<T: DeserializeOwned>(bytes: &[u8], path: &str) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| lakelog_core::Error::serialization(format!("decode {path}"), e).into())
}
