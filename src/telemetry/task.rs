//! Task execution span helpers.
//!
//! Provides span creation and status-transition recording for tasks
//! flowing through the engine.

use tracing::Span;

use crate::model::{TaskId, TaskKind};

/// Start a span for task execution.
///
/// The `task.status` field is declared empty and can be updated via
/// [`record_status_transition`].
pub fn start_task_span(kind: TaskKind, task_id: TaskId) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.kind" = %kind,
        "task.id" = %task_id,
        "task.status" = tracing::field::Empty,
    )
}

/// Record a status transition event on the given span.
pub fn record_status_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "status_transition");
    });
}
