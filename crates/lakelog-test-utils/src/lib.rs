//! Shared test utilities for lakelog integration tests.
//!
//! This crate provides:
//! - [`SimulatedClock`]: a manually advanced [`lakelog_core::Clock`]
//! - [`FailingBackend`]: storage with injected read, write and delete failures
//! - [`seeded_jitter`]: deterministic backoff jitter
//! - [`init_test_logging`]: tracing output captured by the test harness

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod simulation;
pub mod storage;

pub use simulation::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("lakelog=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
