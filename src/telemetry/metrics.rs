//! Metric instrument factories for forage.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"forage"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for forage instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("forage")
}

/// Counter: number of tasks submitted.
/// Labels: `kind`, `result` ("ok" | "duplicate" | "cached").
pub fn tasks_submitted() -> Counter<u64> {
    meter()
        .u64_counter("forage.tasks.submitted")
        .with_description("Number of tasks submitted")
        .build()
}

/// Counter: task status transitions.
/// Labels: `from`, `to`.
pub fn status_transitions() -> Counter<u64> {
    meter()
        .u64_counter("forage.tasks.status_transitions")
        .with_description("Number of task status transitions")
        .build()
}

/// Counter: submissions rejected by a full class queue.
/// Labels: `class`.
pub fn queue_rejections() -> Counter<u64> {
    meter()
        .u64_counter("forage.queue.rejections")
        .with_description("Submissions rejected with QueueFull")
        .build()
}

/// Counter: ephemeral cache operations.
/// Labels: `operation` ("hit" | "miss" | "put").
pub fn cache_operations() -> Counter<u64> {
    meter()
        .u64_counter("forage.cache.operations")
        .with_description("Ephemeral result cache operations")
        .build()
}

/// Histogram: task execution duration in milliseconds.
/// Labels: `kind`, `result` ("success" | "retryable" | "fatal").
pub fn execution_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("forage.execution.duration_ms")
        .with_description("Task execution duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: tasks with no registered executor for their kind.
/// Labels: `kind`.
pub fn tasks_unroutable() -> Counter<u64> {
    meter()
        .u64_counter("forage.tasks.unroutable")
        .with_description("Tasks with no registered executor")
        .build()
}
