//! Storage backend abstraction for object storage (S3, GCS, local disk).
//!
//! Every durable byte lakelog owns goes through [`StorageBackend`]: transaction
//! log entries, snapshots, snapshot metadata, table properties and, for the
//! garbage collector, the data files themselves.
//!
//! The contract requires conditional writes. `DoesNotExist` is the
//! compare-and-append primitive behind the transaction log; `MatchesVersion`
//! is the compare-and-swap primitive behind mutable pointers such as the
//! latest-snapshot document.
//!
//! The version token is an opaque `String` so backends can use their native
//! notion (S3 `ETag`, GCS generation, file metadata on local disk).

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutMode, PutPayload, PutResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Precondition for conditional writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if object does not exist.
    DoesNotExist,
    /// Write only if object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Write succeeded, returns new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns current version token.
    PreconditionFailed {
        /// The current version that caused the precondition to fail.
        current_version: String,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object path (key).
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Object version token for CAS operations.
    pub version: String,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Storage backend trait for object storage.
///
/// All storage backends implement this trait. The contract is designed for
/// cloud object storage semantics: whole-object reads and writes, prefix
/// listing, and conditional puts.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads an entire object.
    ///
    /// Returns `Error::NotFound` if the object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes with optional precondition.
    ///
    /// Returns `WriteResult::PreconditionFailed` if the precondition is not met.
    /// Never returns an error for precondition failure; that is a normal result.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes an object.
    ///
    /// Succeeds even if the object doesn't exist (idempotent).
    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists objects with the given prefix.
    ///
    /// Results are in arbitrary order. Callers requiring deterministic order
    /// must sort them.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if the object doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;
}

/// In-memory storage backend for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production.
/// Uses numeric versions internally (stored as strings).
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
    last_modified: DateTime<Utc>,
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn object_count(&self) -> Result<usize> {
        Ok(self.objects.read().map_err(|_| poisoned())?.len())
    }
}

fn poisoned() -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| poisoned())?;

        objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;

        let current = objects.get(path);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected_num: i64 = expected.parse().unwrap_or(-1);
                match current {
                    Some(obj) if obj.version != expected_num => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: obj.version.to_string(),
                        });
                    }
                    None => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: "0".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            WritePrecondition::None => {}
        }

        let new_version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version: new_version,
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects.write().map_err(|_| poisoned())?.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;

        Ok(objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(path, obj)| ObjectMeta {
                path: path.clone(),
                size: obj.data.len() as u64,
                version: obj.version.to_string(),
                last_modified: Some(obj.last_modified),
            })
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;

        Ok(objects.get(path).map(|obj| ObjectMeta {
            path: path.to_string(),
            size: obj.data.len() as u64,
            version: obj.version.to_string(),
            last_modified: Some(obj.last_modified),
        }))
    }
}

/// Local filesystem backend rooted at a directory, on [`LocalFileSystem`].
///
/// `DoesNotExist` writes use `PutMode::Create`, which is atomic across
/// processes. `MatchesVersion` writes are serialized within the process only;
/// run one writer process per data directory. Versions are the store's
/// `ETag`, derived from file metadata, so `head` never reads the object.
#[derive(Debug)]
pub struct LocalFsBackend {
    root: PathBuf,
    store: LocalFileSystem,
    swap_lock: tokio::sync::Mutex<()>,
}

impl LocalFsBackend {
    /// Creates a backend rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the directory cannot be created or opened.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::storage_with_source(format!("create {}", root.display()), e))?;
        let store = LocalFileSystem::new_with_prefix(&root)
            .map_err(|e| Error::storage_with_source(format!("open {}", root.display()), e))?;
        Ok(Self {
            root,
            store,
            swap_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn overwrite(&self, path: &str, location: &ObjectPath, data: Bytes) -> Result<WriteResult> {
        let result = self
            .store
            .put_opts(location, PutPayload::from(data), PutMode::Overwrite.into())
            .await
            .map_err(|e| store_error("put", path, e))?;
        Ok(WriteResult::Success {
            version: put_version(result),
        })
    }
}

fn object_path(path: &str) -> Result<ObjectPath> {
    validate_relative_path(path)?;
    ObjectPath::parse(path)
        .map_err(|e| Error::InvalidInput(format!("invalid object path {path:?}: {e}")))
}

fn validate_relative_path(path: &str) -> Result<()> {
    if path.is_empty() || path.starts_with('/') || path.contains('\\') {
        return Err(Error::InvalidInput(format!("invalid object path: {path:?}")));
    }
    if path.split('/').any(|segment| segment == "." || segment == "..") {
        return Err(Error::InvalidInput(format!(
            "path traversal not allowed: {path}"
        )));
    }
    Ok(())
}

fn store_error(op: &str, path: &str, e: object_store::Error) -> Error {
    match e {
        object_store::Error::NotFound { .. } => {
            Error::NotFound(format!("object not found: {path}"))
        }
        e => Error::storage_with_source(format!("{op} {path}"), e),
    }
}

fn put_version(result: PutResult) -> String {
    result.e_tag.or(result.version).unwrap_or_default()
}

fn to_meta(meta: object_store::ObjectMeta) -> ObjectMeta {
    let size = u64::try_from(meta.size).unwrap_or(u64::MAX);
    let version = meta
        .e_tag
        .unwrap_or_else(|| format!("{:x}-{size:x}", meta.last_modified.timestamp_micros()));
    ObjectMeta {
        path: meta.location.to_string(),
        size,
        version,
        last_modified: Some(meta.last_modified),
    }
}

#[async_trait]
impl StorageBackend for LocalFsBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let location = object_path(path)?;
        let result = self
            .store
            .get(&location)
            .await
            .map_err(|e| store_error("read", path, e))?;
        result.bytes().await.map_err(|e| store_error("read", path, e))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let location = object_path(path)?;
        match precondition {
            WritePrecondition::DoesNotExist => {
                match self
                    .store
                    .put_opts(&location, PutPayload::from(data), PutMode::Create.into())
                    .await
                {
                    Ok(result) => Ok(WriteResult::Success {
                        version: put_version(result),
                    }),
                    Err(object_store::Error::AlreadyExists { .. }) => {
                        let current = self.head(path).await?;
                        Ok(WriteResult::PreconditionFailed {
                            current_version: current.map(|m| m.version).unwrap_or_default(),
                        })
                    }
                    Err(e) => Err(store_error("put", path, e)),
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let _guard = self.swap_lock.lock().await;
                match self.head(path).await? {
                    Some(current) if current.version == expected => {}
                    Some(current) => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: current.version,
                        });
                    }
                    None => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: String::new(),
                        });
                    }
                }
                self.overwrite(path, &location, data).await
            }
            WritePrecondition::None => self.overwrite(path, &location, data).await,
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let location = object_path(path)?;
        match self.store.delete(&location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(store_error("delete", path, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        // Walk only the directory holding the prefix, then match the rest
        // of it as a plain string.
        let dir = match prefix.rfind('/') {
            Some(end) => Some(object_path(&prefix[..end])?),
            None => None,
        };
        let mut entries = self.store.list(dir.as_ref());
        let mut out = Vec::new();
        while let Some(meta) = entries
            .try_next()
            .await
            .map_err(|e| store_error("list", prefix, e))?
        {
            let meta = to_meta(meta);
            if meta.path.starts_with(prefix) {
                out.push(meta);
            }
        }
        Ok(out)
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let location = object_path(path)?;
        match self.store.head(&location).await {
            Ok(meta) => Ok(Some(to_meta(meta))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(store_error("head", path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_roundtrip() {
        let backend = MemoryBackend::new();
        let data = Bytes::from("hello world");

        let result = backend
            .put("test/file.txt", data.clone(), WritePrecondition::None)
            .await
            .expect("put should succeed");

        assert!(matches!(result, WriteResult::Success { ref version } if version == "1"));

        let retrieved = backend
            .get("test/file.txt")
            .await
            .expect("get should succeed");
        assert_eq!(retrieved, data);
    }

    #[tokio::test]
    async fn test_memory_precondition_does_not_exist() {
        let backend = MemoryBackend::new();

        let result = backend
            .put("new.txt", Bytes::from("data"), WritePrecondition::DoesNotExist)
            .await
            .expect("should succeed");
        assert!(result.is_success());

        let result = backend
            .put("new.txt", Bytes::from("data2"), WritePrecondition::DoesNotExist)
            .await
            .expect("should succeed");
        assert!(matches!(result, WriteResult::PreconditionFailed { .. }));
        assert_eq!(backend.get("new.txt").await.unwrap(), Bytes::from("data"));
    }

    #[tokio::test]
    async fn test_memory_precondition_matches_version() {
        let backend = MemoryBackend::new();

        let WriteResult::Success { version: first } = backend
            .put("gen.txt", Bytes::from("v1"), WritePrecondition::None)
            .await
            .unwrap()
        else {
            panic!("expected success");
        };

        let result = backend
            .put(
                "gen.txt",
                Bytes::from("v2"),
                WritePrecondition::MatchesVersion(first.clone()),
            )
            .await
            .unwrap();
        assert!(result.is_success());

        let result = backend
            .put(
                "gen.txt",
                Bytes::from("v3"),
                WritePrecondition::MatchesVersion(first),
            )
            .await
            .unwrap();
        assert!(matches!(result, WriteResult::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_memory_list_and_delete() {
        let backend = MemoryBackend::new();
        for path in ["a/1.txt", "a/2.txt", "b/1.txt"] {
            backend
                .put(path, Bytes::from("x"), WritePrecondition::None)
                .await
                .unwrap();
        }

        assert_eq!(backend.list("a/").await.unwrap().len(), 2);
        backend.delete("a/1.txt").await.unwrap();
        backend.delete("a/1.txt").await.expect("delete is idempotent");
        assert_eq!(backend.list("a/").await.unwrap().len(), 1);
        assert!(backend.head("a/1.txt").await.unwrap().is_none());
        assert_eq!(backend.object_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_local_fs_conditional_writes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path()).await.unwrap();

        let first = backend
            .put("t/log/1.json", Bytes::from("one"), WritePrecondition::DoesNotExist)
            .await
            .unwrap();
        assert!(first.is_success());

        let second = backend
            .put("t/log/1.json", Bytes::from("uno"), WritePrecondition::DoesNotExist)
            .await
            .unwrap();
        assert!(matches!(second, WriteResult::PreconditionFailed { .. }));
        assert_eq!(backend.get("t/log/1.json").await.unwrap(), Bytes::from("one"));

        let meta = backend.head("t/log/1.json").await.unwrap().unwrap();
        let swapped = backend
            .put(
                "t/log/1.json",
                Bytes::from("two"),
                WritePrecondition::MatchesVersion(meta.version.clone()),
            )
            .await
            .unwrap();
        assert!(swapped.is_success());

        let stale = backend
            .put(
                "t/log/1.json",
                Bytes::from("three"),
                WritePrecondition::MatchesVersion(meta.version),
            )
            .await
            .unwrap();
        assert!(matches!(stale, WriteResult::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_local_fs_list_delete_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path()).await.unwrap();
        backend
            .put("a/b/c.json", Bytes::from("c"), WritePrecondition::None)
            .await
            .unwrap();
        backend
            .put("a/d.json", Bytes::from("d"), WritePrecondition::None)
            .await
            .unwrap();

        let mut listed: Vec<_> = backend
            .list("a/")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.path)
            .collect();
        listed.sort();
        assert_eq!(listed, vec!["a/b/c.json".to_string(), "a/d.json".to_string()]);

        backend.delete("a/d.json").await.unwrap();
        backend.delete("a/d.json").await.unwrap();
        assert!(backend.get("a/d.json").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_local_fs_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path()).await.unwrap();
        assert!(backend.get("../etc/passwd").await.is_err());
        assert!(backend.get("/abs").await.is_err());
    }

    #[tokio::test]
    async fn test_local_fs_versions_track_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path()).await.unwrap();

        let WriteResult::Success { version: written } = backend
            .put("p/latest.json", Bytes::from("one"), WritePrecondition::None)
            .await
            .unwrap()
        else {
            panic!("expected success");
        };
        let first = backend.head("p/latest.json").await.unwrap().unwrap();
        assert_eq!(first.version, written);
        assert_eq!(first.size, 3);

        // Same content, new object: the version still moves.
        backend
            .put("p/latest.json", Bytes::from("one"), WritePrecondition::None)
            .await
            .unwrap();
        let second = backend.head("p/latest.json").await.unwrap().unwrap();
        assert_ne!(second.version, first.version);
        assert!(backend.head("p/missing.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_fs_list_matches_partial_names() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path()).await.unwrap();
        for path in ["t/log/0001.json", "t/log/0002.json", "t/logs/x.json", "u/0001.json"] {
            backend
                .put(path, Bytes::from("x"), WritePrecondition::None)
                .await
                .unwrap();
        }

        let mut listed: Vec<_> = backend
            .list("t/log/000")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.path)
            .collect();
        listed.sort();
        assert_eq!(listed, vec!["t/log/0001.json".to_string(), "t/log/0002.json".to_string()]);
        assert!(backend.list("nowhere/").await.unwrap().is_empty());
        assert_eq!(backend.list("").await.unwrap().len(), 4);
    }
}
