//! Garbage collection metrics.

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Data files deleted.
pub const FILES_DELETED: &str = "lakelog_gc_files_deleted_total";

/// Per-file or per-table failures during a run.
pub const ERRORS: &str = "lakelog_gc_errors_total";

/// Wall-clock duration of one run over all tables.
pub const RUN_DURATION: &str = "lakelog_gc_run_duration_seconds";

/// Registers GC metric descriptions.
pub fn register_metrics() {
    describe_counter!(FILES_DELETED, "Total unreferenced data files deleted");
    describe_counter!(ERRORS, "Total garbage collection errors");
    describe_histogram!(RUN_DURATION, "Garbage collection run duration in seconds");
}

/// Records deleted files.
pub fn record_files_deleted(count: u64) {
    counter!(FILES_DELETED).increment(count);
}

/// Records one failure.
pub fn record_error(phase: &'static str) {
    counter!(ERRORS, "phase" => phase).increment(1);
}

/// Records a run's duration.
pub fn record_run_duration(seconds: f64) {
    histogram!(RUN_DURATION).record(seconds);
}
