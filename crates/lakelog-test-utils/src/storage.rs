//! Fault-injecting storage for crash and atomicity tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use lakelog_core::error::{Error as CoreError, Result as CoreResult};
use lakelog_core::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

/// Backend wrapper that injects failures at configurable paths.
///
/// Exact-path failures are single-shot; prefix failures persist until
/// [`FailingBackend::reset`] is called.
pub struct FailingBackend {
    inner: Arc<dyn StorageBackend>,
    /// Paths that should fail on next write (exact match).
    fail_on_write: RwLock<HashSet<String>>,
    /// Paths that should fail on next read (exact match).
    fail_on_read: RwLock<HashSet<String>>,
    /// Paths that should fail on next delete (exact match).
    fail_on_delete: RwLock<HashSet<String>>,
    /// Every write under one of these prefixes fails.
    fail_write_prefixes: RwLock<Vec<String>>,
    /// If true, fail all operations (simulates total backend failure).
    fail_all: AtomicBool,
    writes: AtomicU64,
}

impl std::fmt::Debug for FailingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailingBackend")
            .field("fail_all", &self.fail_all.load(Ordering::SeqCst))
            .field("writes", &self.writes.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl FailingBackend {
    /// Creates a new `FailingBackend` wrapping an empty `MemoryBackend`.
    pub fn new() -> Self {
        Self::wrapping(Arc::new(MemoryBackend::new()))
    }

    /// Wraps an existing backend.
    pub fn wrapping(inner: Arc<dyn StorageBackend>) -> Self {
        Self {
            inner,
            fail_on_write: RwLock::new(HashSet::new()),
            fail_on_read: RwLock::new(HashSet::new()),
            fail_on_delete: RwLock::new(HashSet::new()),
            fail_write_prefixes: RwLock::new(Vec::new()),
            fail_all: AtomicBool::new(false),
            writes: AtomicU64::new(0),
        }
    }

    /// Fail the next write to the specified path.
    pub fn fail_on_write(&self, path: &str) {
        self.fail_on_write.write().unwrap().insert(path.to_string());
    }

    /// Fail the next read from the specified path.
    pub fn fail_on_read(&self, path: &str) {
        self.fail_on_read.write().unwrap().insert(path.to_string());
    }

    /// Fail the next delete of the specified path.
    pub fn fail_on_delete(&self, path: &str) {
        self.fail_on_delete.write().unwrap().insert(path.to_string());
    }

    /// Fail every write whose path starts with `prefix`.
    pub fn fail_writes_with_prefix(&self, prefix: &str) {
        self.fail_write_prefixes
            .write()
            .unwrap()
            .push(prefix.to_string());
    }

    /// Configure the backend to fail all operations.
    pub fn fail_all(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    /// Clears every injected failure.
    pub fn reset(&self) {
        self.fail_all.store(false, Ordering::SeqCst);
        self.fail_on_write.write().unwrap().clear();
        self.fail_on_read.write().unwrap().clear();
        self.fail_on_delete.write().unwrap().clear();
        self.fail_write_prefixes.write().unwrap().clear();
    }

    /// Number of writes that reached the inner backend.
    pub fn successful_writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn should_fail_write(&self, path: &str) -> bool {
        if self.fail_all.load(Ordering::SeqCst) {
            return true;
        }
        if self
            .fail_write_prefixes
            .read()
            .unwrap()
            .iter()
            .any(|p| path.starts_with(p.as_str()))
        {
            return true;
        }
        self.fail_on_write.write().unwrap().remove(path)
    }

    fn should_fail_read(&self, path: &str) -> bool {
        self.fail_all.load(Ordering::SeqCst) || self.fail_on_read.write().unwrap().remove(path)
    }

    fn should_fail_delete(&self, path: &str) -> bool {
        self.fail_all.load(Ordering::SeqCst) || self.fail_on_delete.write().unwrap().remove(path)
    }
}

impl Default for FailingBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn injected(kind: &str, path: &str) -> CoreError {
    CoreError::storage(format!("Injected {kind} failure: {path}"))
}

#[async_trait]
impl StorageBackend for FailingBackend {
    async fn get(&self, path: &str) -> CoreResult<Bytes> {
        if self.should_fail_read(path) {
            return Err(injected("read", path));
        }
        self.inner.get(path).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> CoreResult<WriteResult> {
        if self.should_fail_write(path) {
            return Err(injected("write", path));
        }
        let result = self.inner.put(path, data, precondition).await?;
        if result.is_success() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(result)
    }

    async fn delete(&self, path: &str) -> CoreResult<()> {
        if self.should_fail_delete(path) {
            return Err(injected("delete", path));
        }
        self.inner.delete(path).await
    }

    async fn list(&self, prefix: &str) -> CoreResult<Vec<ObjectMeta>> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(injected("list", prefix));
        }
        self.inner.list(prefix).await
    }

    async fn head(&self, path: &str) -> CoreResult<Option<ObjectMeta>> {
        if self.should_fail_read(path) {
            return Err(injected("head", path));
        }
        self.inner.head(path).await
    }
}
