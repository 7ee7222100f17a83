//! Per-process cache of table state stores.
//!
//! Workers that touch many tables keep one [`StateStoreCache`] and pass it by
//! `&mut` to each pass. Entries expire on the cache's clock, after which the
//! table's properties are re-read and a fresh state store is built.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use lakelog_core::{Clock, JitterFn, StorageBackend, TableId};
use tracing::debug;

use crate::config::{StateStoreConfig, TableProperties};
use crate::error::{Result, StateStoreError};
use crate::properties_store::TablePropertiesStore;
use crate::statestore::StateStore;

/// Builds state stores for registered tables.
#[derive(Clone)]
pub struct StateStoreFactory {
    storage: Arc<dyn StorageBackend>,
    properties: TablePropertiesStore,
    config: StateStoreConfig,
    clock: Arc<dyn Clock>,
    jitter: Option<JitterFn>,
}

impl StateStoreFactory {
    /// Creates a factory over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, config: StateStoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            properties: TablePropertiesStore::new(storage.clone()),
            storage,
            config,
            clock,
            jitter: None,
        }
    }

    /// Uses `jitter` for every state store's conflict backoff.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterFn) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// The properties store the factory reads from.
    #[must_use]
    pub fn properties_store(&self) -> &TablePropertiesStore {
        &self.properties
    }

    /// The factory's clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Builds a state store for `table_id` without checking registration.
    #[must_use]
    pub fn state_store(&self, table_id: TableId) -> StateStore {
        let mut builder = StateStore::builder(table_id)
            .storage(self.storage.clone())
            .config(self.config.clone())
            .clock(self.clock.clone());
        if let Some(jitter) = &self.jitter {
            builder = builder.jitter(jitter.clone());
        }
        builder.build()
    }

    /// Loads a registered table's properties and builds its state store.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError::TableNotFound`] for an unregistered table.
    pub async fn load(&self, table_id: &TableId) -> Result<(TableProperties, StateStore)> {
        let properties = self.properties.load(table_id).await?;
        Ok((properties, self.state_store(table_id.clone())))
    }
}

/// A cached table.
#[derive(Clone)]
pub struct CachedTable {
    /// The table's properties as of loading.
    pub properties: TableProperties,
    /// The table's state store.
    pub state_store: Arc<StateStore>,
    /// When this entry must be reloaded.
    pub expires_at: DateTime<Utc>,
}

/// Table id to state store, with time-based expiry.
pub struct StateStoreCache {
    factory: StateStoreFactory,
    ttl: TimeDelta,
    entries: HashMap<TableId, CachedTable>,
}

impl StateStoreCache {
    /// Creates an empty cache whose entries live for `ttl`.
    #[must_use]
    pub fn new(factory: StateStoreFactory, ttl: Duration) -> Self {
        Self {
            factory,
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
            entries: HashMap::new(),
        }
    }

    /// The factory behind the cache.
    #[must_use]
    pub fn factory(&self) -> &StateStoreFactory {
        &self.factory
    }

    /// Returns the cached table, loading it on a miss or after expiry.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError::TableNotFound`] for an unregistered table,
    /// or a storage error from loading its properties.
    pub async fn get(&mut self, table_id: &TableId) -> Result<&CachedTable> {
        let now = self.factory.clock().now();
        let fresh = self
            .entries
            .get(table_id)
            .is_some_and(|entry| entry.expires_at > now);
        if !fresh {
            let (properties, state_store) = self.factory.load(table_id).await?;
            debug!(table_id = %table_id, "loaded table into state store cache");
            self.entries.insert(
                table_id.clone(),
                CachedTable {
                    properties,
                    state_store: Arc::new(state_store),
                    expires_at: now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
                },
            );
        }
        self.entries
            .get(table_id)
            .ok_or_else(|| StateStoreError::TableNotFound {
                table_id: table_id.clone(),
            })
    }

    /// Drops one table so the next `get` reloads it.
    pub fn invalidate(&mut self, table_id: &TableId) -> bool {
        self.entries.remove(table_id).is_some()
    }

    /// Drops every expired entry, returning how many were dropped.
    pub fn evict_expired(&mut self) -> usize {
        let now = self.factory.clock().now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    /// Number of cached tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
