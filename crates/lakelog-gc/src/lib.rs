//! # lakelog-gc
//!
//! Garbage collection of data files for lakelog tables.
//!
//! Compaction and splitting leave behind files that no partition references.
//! After the table's GC delay has passed, [`GarbageCollector`] deletes their
//! objects and removes them from the files log.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod collector;
pub mod metrics;

pub use collector::{GarbageCollector, GcResult};
