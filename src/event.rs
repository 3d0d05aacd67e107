//! Structured events emitted on every task status transition.
//!
//! Consumers read the event stream to build dashboards, alerting, or
//! audit trails. Events are the engine's voice; executor output lives in
//! task outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{TaskId, TaskKind, TaskStatus};

/// A structured event recorded by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated {
        id: TaskId,
        kind: TaskKind,
        class: crate::model::PriorityClass,
        cache_key: Option<String>,
    },
    /// A submission matched an open task's cache key; no row was created.
    TaskDeduplicated {
        canonical_id: TaskId,
        kind: TaskKind,
        cache_key: String,
    },
    /// One event per status transition.
    StatusChanged {
        id: TaskId,
        kind: TaskKind,
        from: TaskStatus,
        to: TaskStatus,
        attempt_count: u32,
    },
    /// A failed attempt was scheduled for retry.
    RetryScheduled {
        id: TaskId,
        kind: TaskKind,
        attempt_count: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// Retries exhausted or fatal error; the task is terminally failed.
    TaskExhausted {
        id: TaskId,
        kind: TaskKind,
        attempt_count: u32,
        reason: String,
    },
    /// Fallback for events written by a newer version of the engine.
    Unknown { raw: String },
}
