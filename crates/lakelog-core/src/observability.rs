//! Observability infrastructure for lakelog.
//!
//! Structured logging with consistent spans. Every state store operation runs
//! inside a span carrying the table and entity type, so log lines from
//! concurrent tables can be told apart.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `lakelog_statestore=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for state store operations with standard fields.
///
/// # Example
///
/// ```rust
/// use lakelog_core::observability::statestore_span;
///
/// let span = statestore_span("add_files", "orders", "files");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn statestore_span(operation: &str, table_id: &str, entity: &str) -> Span {
    tracing::info_span!(
        "statestore",
        op = operation,
        table_id = table_id,
        entity = entity,
    )
}

/// Creates a span for background worker passes (snapshot, gc, commit).
#[must_use]
pub fn worker_span(operation: &str, table_id: &str) -> Span {
    tracing::info_span!("worker", op = operation, table_id = table_id)
}
