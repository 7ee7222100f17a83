//! # lakelog-core
//!
//! Core primitives for the lakelog table engine.
//!
//! This crate provides the foundational types used by every other lakelog crate:
//!
//! - **Identifiers**: validated table IDs and opaque compaction job IDs
//! - **Storage**: the conditional-put object storage contract and its backends
//! - **Paths**: canonical object keys for transaction logs and snapshots
//! - **Retry**: bounded exponential backoff with injectable jitter
//! - **Configuration**: typed readers over environment-like sources
//! - **Error Types**: shared infrastructure errors and result types
//!
//! ## Example
//!
//! ```rust
//! use lakelog_core::prelude::*;
//!
//! let table = TableId::new("orders").unwrap();
//! let path = TablePaths::transaction(&table, EntityType::Files, 1);
//! assert!(path.starts_with("tables/orders/"));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod config;
pub mod error;
pub mod id;
pub mod observability;
pub mod retry;
pub mod storage;
pub mod table_paths;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::error::{Error, Result};
    pub use crate::id::{JobId, TableId};
    pub use crate::retry::{RetryLimit, RetryPolicy};
    pub use crate::storage::{
        LocalFsBackend, MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
    pub use crate::table_paths::{EntityType, TablePaths};
}

pub use clock::{Clock, FixedClock, SystemClock, truncate_to_millis};
pub use config::{ConfigSource, EnvSource};
pub use error::{Error, Result};
pub use id::{JobId, TableId};
pub use observability::{LogFormat, init_logging};
pub use retry::{JitterFn, RetryLimit, RetryPolicy, RetryState};
pub use storage::{
    LocalFsBackend, MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
};
pub use table_paths::{EntityType, TablePaths};
