//! Command implementations.

pub mod commit;
pub mod create_table;
pub mod maintenance;
pub mod serve;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use lakelog_core::config::read_secs;
use lakelog_core::{Clock, EnvSource, LocalFsBackend, StorageBackend, SystemClock, TableId};
use lakelog_statestore::{StateStoreCache, StateStoreConfig, StateStoreFactory};

/// Default lifetime of cached table state.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Everything a command needs: storage, the table cache and the table selection.
pub struct Context {
    storage: Arc<dyn StorageBackend>,
    cache: StateStoreCache,
    tables: Vec<TableId>,
}

impl Context {
    /// Opens the table store rooted at `data_dir`.
    ///
    /// Reads state store settings and `LAKELOG_CACHE_TTL_SECS` from the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or a setting is invalid.
    pub async fn open(data_dir: &Path, tables: Vec<TableId>) -> Result<Self> {
        let storage: Arc<dyn StorageBackend> = Arc::new(
            LocalFsBackend::new(data_dir)
                .await
                .with_context(|| format!("opening data dir {}", data_dir.display()))?,
        );
        let config = StateStoreConfig::from_source(&EnvSource)?;
        let ttl = read_secs(&EnvSource, "LAKELOG_CACHE_TTL_SECS")?.unwrap_or(DEFAULT_CACHE_TTL);
        Ok(Self::with_storage(storage, config, Arc::new(SystemClock), ttl, tables))
    }

    /// Builds a context over an existing backend.
    #[must_use]
    pub fn with_storage(
        storage: Arc<dyn StorageBackend>,
        config: StateStoreConfig,
        clock: Arc<dyn Clock>,
        cache_ttl: Duration,
        tables: Vec<TableId>,
    ) -> Self {
        let factory = StateStoreFactory::new(storage.clone(), config, clock);
        Self {
            storage,
            cache: StateStoreCache::new(factory, cache_ttl),
            tables,
        }
    }

    /// The backend holding table metadata and data files.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// The table cache.
    pub fn cache(&mut self) -> &mut StateStoreCache {
        &mut self.cache
    }

    /// Tables this run maintains: the explicit selection, or every registered table.
    ///
    /// # Errors
    ///
    /// Returns an error if the registered tables cannot be listed.
    pub async fn tables(&self) -> Result<Vec<TableId>> {
        if !self.tables.is_empty() {
            return Ok(self.tables.clone());
        }
        Ok(self.cache.factory().properties_store().list_tables().await?)
    }
}
