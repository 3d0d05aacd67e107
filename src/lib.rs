//! # forage
//!
//! Task dispatch and content-dedup core for an asynchronous content
//! aggregation pipeline: priority-classed worker pools over an embedded
//! durable task store, content-addressed dedup with an ephemeral TTL
//! fast path, per-kind retry/backoff, and periodic maintenance triggers.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event;
pub mod key;
pub mod model;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod worker;
