//! Periodic snapshots of materialized state.
//!
//! - [`codec`]: Parquet encoding of each entity type's state
//! - [`store`]: snapshot objects, metadata rows and the latest pointer
//! - [`creator`]: builds a snapshot from the latest snapshot plus the log tail
//! - [`retention`]: prunes old snapshots and truncates the log below them

pub mod codec;
pub mod creator;
pub mod retention;
pub mod store;

pub use creator::SnapshotCreator;
pub use retention::{PruneResult, SnapshotRetention};
pub use store::{SnapshotMetadata, SnapshotStore};
