//! Error types for forage.

use thiserror::Error;

use crate::model::{TaskId, TaskKind, TaskStatus};

#[derive(Debug, Error)]
pub enum Error {
    /// An open task of the same kind already holds this cache key.
    /// Expected under concurrent submission — callers should reuse the
    /// referenced task instead of creating a new one.
    #[error("duplicate cache key {cache_key}: held by task {existing}")]
    DuplicateCacheKey { existing: TaskId, cache_key: String },

    /// The cache key is held by an open task of a *different* kind.
    /// Kinds are hashed into their keys, so this is a programming error,
    /// not a transient condition.
    #[error("cache key {cache_key} reserved by kind {held_by}, requested for {requested}")]
    KeyConflict {
        cache_key: String,
        held_by: TaskKind,
        requested: TaskKind,
    },

    /// Compare-and-swap transition lost a race: the task's current status
    /// did not match the expected one. Callers must re-read and decide.
    #[error("stale status on task {id}: expected {expected}, found {actual}")]
    StaleStatus {
        id: TaskId,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    /// The class queue is at capacity. Backpressure — shed or delay.
    #[error("queue full for class {class}")]
    QueueFull { class: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
