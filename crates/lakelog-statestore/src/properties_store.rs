//! Persistence of per-table properties.

use std::sync::Arc;

use bytes::Bytes;
use lakelog_core::{StorageBackend, TableId, TablePaths, WritePrecondition, WriteResult};
use tracing::info;

use crate::config::TableProperties;
use crate::error::{Result, StateStoreError};

/// Reads and writes `tables/{table}/properties.json`.
///
/// A table exists exactly when its properties document exists.
#[derive(Clone)]
pub struct TablePropertiesStore {
    storage: Arc<dyn StorageBackend>,
}

impl TablePropertiesStore {
    /// Creates a store over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Registers a new table.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError::TableAlreadyExists`] if the table is already
    /// registered, or an invalid-input error if `properties` fail validation.
    pub async fn create(&self, table_id: &TableId, properties: &TableProperties) -> Result<()> {
        properties.validate()?;
        let path = TablePaths::properties(table_id);
        match self
            .storage
            .put(&path, encode(properties)?, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => {
                info!(table_id = %table_id, "created table");
                Ok(())
            }
            WriteResult::PreconditionFailed { .. } => Err(StateStoreError::TableAlreadyExists {
                table_id: table_id.clone(),
            }),
        }
    }

    /// Loads a table's properties.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError::TableNotFound`] if the table is not
    /// registered, or a serialization error for a malformed document.
    pub async fn load(&self, table_id: &TableId) -> Result<TableProperties> {
        let path = TablePaths::properties(table_id);
        let bytes = match self.storage.get(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                return Err(StateStoreError::TableNotFound {
                    table_id: table_id.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let properties: TableProperties = serde_json::from_slice(&bytes)
            .map_err(|e| lakelog_core::Error::serialization(format!("decode {path}"), e))?;
        properties.validate()?;
        Ok(properties)
    }

    /// Overwrites an existing table's properties.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError::TableNotFound`] if the table is not
    /// registered.
    pub async fn save(&self, table_id: &TableId, properties: &TableProperties) -> Result<()> {
        properties.validate()?;
        let path = TablePaths::properties(table_id);
        let Some(current) = self.storage.head(&path).await? else {
            return Err(StateStoreError::TableNotFound {
                table_id: table_id.clone(),
            });
        };
        match self
            .storage
            .put(
                &path,
                encode(properties)?,
                WritePrecondition::MatchesVersion(current.version),
            )
            .await?
        {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { .. } => Err(lakelog_core::Error::PreconditionFailed {
                message: format!("properties of table {table_id} changed concurrently"),
            }
            .into()),
        }
    }

    /// Lists registered tables in id order.
    ///
    /// # Errors
    ///
    /// Returns an error if listing fails.
    pub async fn list_tables(&self) -> Result<Vec<TableId>> {
        let mut tables: Vec<TableId> = self
            .storage
            .list(TablePaths::TABLES_PREFIX)
            .await?
            .iter()
            .filter_map(|meta| TablePaths::table_id_from_properties_path(&meta.path))
            .collect();
        tables.sort();
        Ok(tables)
    }
}

fn encode(properties: &TableProperties) -> Result<Bytes> {
    serde_json::to_vec_pretty(properties)
        .map(Bytes::from)
        .map_err(|e| lakelog_core::Error::serialization("encode table properties", e).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lakelog_core::MemoryBackend;

    fn store() -> TablePropertiesStore {
        TablePropertiesStore::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn create_load_and_list() {
        let store = store();
        let orders = TableId::new("orders").unwrap();
        let users = TableId::new("users").unwrap();
        let props = TableProperties {
            gc_delay_secs: 30,
            ..TableProperties::default()
        };

        store.create(&users, &TableProperties::default()).await.unwrap();
        store.create(&orders, &props).await.unwrap();

        assert_eq!(store.load(&orders).await.unwrap(), props);
        assert_eq!(store.list_tables().await.unwrap(), vec![orders, users]);
    }

    #[tokio::test]
    async fn create_twice_is_already_exists() {
        let store = store();
        let orders = TableId::new("orders").unwrap();
        store.create(&orders, &TableProperties::default()).await.unwrap();
        let err = store
            .create(&orders, &TableProperties::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StateStoreError::TableAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn missing_table_is_not_found() {
        let store = store();
        let ghost = TableId::new("ghost").unwrap();
        assert!(matches!(
            store.load(&ghost).await.unwrap_err(),
            StateStoreError::TableNotFound { .. }
        ));
        assert!(matches!(
            store.save(&ghost, &TableProperties::default()).await.unwrap_err(),
            StateStoreError::TableNotFound { .. }
        ));
    }
}
