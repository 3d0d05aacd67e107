//! Core data model.
//!
//! A task is a unit of pipeline work. It has identity (kind + cache key),
//! a priority class, an opaque payload, and lifecycle state. Sources,
//! queries, content and results are the domain records the pipeline
//! produces around tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::key::CacheKey;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work tracked by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: TaskId,

    /// What kind of work this is. Determines which executor handles it,
    /// which class queue it rides, and which retry policy applies.
    pub kind: TaskKind,

    /// Priority class. Defaults from the kind's routing; callers may
    /// override at submission.
    pub class: PriorityClass,

    /// Arbitrary parameters for the executor. The engine doesn't
    /// interpret these.
    pub payload: serde_json::Value,

    /// Content fingerprint. Tasks with the same key are candidates for
    /// dedup while open. None means no dedup.
    pub cache_key: Option<CacheKey>,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// Number of execution attempts so far.
    pub attempt_count: u32,

    /// Attempts allowed before the task fails terminally.
    pub max_attempts: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// When a retry becomes eligible for dispatch. Set only while a
    /// failed attempt waits out its backoff.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Result of the last settled attempt, if any.
    pub outcome: Option<Outcome>,
}

/// Newtype for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

/// The kinds of work the pipeline performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Scrape,
    Extract,
    Process,
    AdjustSentiment,
    GenerateResponse,
    Maintenance,
}

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        TaskKind::Scrape,
        TaskKind::Extract,
        TaskKind::Process,
        TaskKind::AdjustSentiment,
        TaskKind::GenerateResponse,
        TaskKind::Maintenance,
    ];

    /// Default queue routing for this kind.
    pub fn default_class(self) -> PriorityClass {
        match self {
            TaskKind::GenerateResponse | TaskKind::Maintenance => PriorityClass::HighPriority,
            TaskKind::Scrape | TaskKind::Extract => PriorityClass::Scraping,
            TaskKind::Process | TaskKind::AdjustSentiment => PriorityClass::Processing,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Scrape => "scrape",
            TaskKind::Extract => "extract",
            TaskKind::Process => "process",
            TaskKind::AdjustSentiment => "adjust_sentiment",
            TaskKind::GenerateResponse => "generate_response",
            TaskKind::Maintenance => "maintenance",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scrape" => Ok(TaskKind::Scrape),
            "extract" => Ok(TaskKind::Extract),
            "process" => Ok(TaskKind::Process),
            "adjust_sentiment" => Ok(TaskKind::AdjustSentiment),
            "generate_response" => Ok(TaskKind::GenerateResponse),
            "maintenance" => Ok(TaskKind::Maintenance),
            _ => Err(Error::Other(format!("unknown task kind: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Priority class
// ---------------------------------------------------------------------------

/// A named bucket of work with its own queue and worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    HighPriority,
    Scraping,
    Processing,
}

impl PriorityClass {
    pub const ALL: [PriorityClass; 3] = [
        PriorityClass::HighPriority,
        PriorityClass::Scraping,
        PriorityClass::Processing,
    ];

    /// Numeric rank for ordering. Higher = more urgent.
    pub fn rank(self) -> i32 {
        match self {
            PriorityClass::HighPriority => 2,
            PriorityClass::Scraping => 1,
            PriorityClass::Processing => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PriorityClass::HighPriority => "high_priority",
            PriorityClass::Scraping => "scraping",
            PriorityClass::Processing => "processing",
        }
    }
}

impl std::fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PriorityClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high_priority" => Ok(PriorityClass::HighPriority),
            "scraping" => Ok(PriorityClass::Scraping),
            "processing" => Ok(PriorityClass::Processing),
            _ => Err(Error::Other(format!("unknown priority class: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dispatch (freshly submitted or between retry attempts).
    Pending,
    /// A worker owns it and is executing.
    InProgress,
    /// Done successfully. Terminal.
    Completed,
    /// Fatal failure or exhausted retries. Terminal.
    Failed,
    /// Cancelled between attempts. Terminal; releases the cache key.
    Abandoned,
}

impl TaskStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (Pending, Abandoned)   // cancellation, between attempts only
                | (InProgress, Completed)
                | (InProgress, Pending)  // retryable failure, backoff scheduled
                | (InProgress, Failed)
        )
    }

    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Abandoned
        )
    }

    /// Is the task still holding its cache key? Open tasks block duplicate
    /// submissions; terminal tasks release the claim.
    pub fn is_open(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "abandoned" => Ok(TaskStatus::Abandoned),
            _ => Err(Error::Other(format!("unknown task status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// What an executor reports back for one attempt.
#[derive(Debug, Clone)]
pub enum Execution {
    /// The work succeeded; the value is cached and stored with the task.
    Success(serde_json::Value),
    /// Transient failure. The retry controller decides re-enqueue vs
    /// terminal failure; the submitter never sees this.
    Retryable(String),
    /// Permanent failure. The task fails terminally regardless of budget.
    Fatal(String),
}

/// Result of a settled attempt, stored with the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    /// Arbitrary result data. Opaque to the engine.
    pub data: Option<serde_json::Value>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Execution duration.
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for submitting new tasks. The engine's public submission API.
pub struct NewTask {
    pub(crate) kind: TaskKind,
    pub(crate) class: PriorityClass,
    pub(crate) payload: serde_json::Value,
    pub(crate) cache_key: Option<CacheKey>,
    pub(crate) max_attempts: Option<u32>,
}

impl NewTask {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            class: kind.default_class(),
            payload: serde_json::Value::Null,
            cache_key: None,
            max_attempts: None,
        }
    }

    pub fn class(mut self, class: PriorityClass) -> Self {
        self.class = class;
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn cache_key(mut self, key: CacheKey) -> Self {
        self.cache_key = Some(key);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }
}

// ---------------------------------------------------------------------------
// Domain records
// ---------------------------------------------------------------------------

/// A scrapeable origin. Read by the scheduler to decide due re-scans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    /// Globally unique.
    pub url: String,
    pub domain: String,
    pub last_scraped_at: Option<DateTime<Utc>>,
    /// Seconds between eligible re-scans.
    pub scrape_interval_secs: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId(pub Uuid);

impl SourceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A user-initiated unit of demand. Owns derived content and results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub id: Uuid,
    pub subject: String,
    pub cache_key: CacheKey,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
}

/// A scraped artifact derived from a query against a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub id: Uuid,
    pub query_id: Uuid,
    pub source_id: Uuid,
    pub cache_key: CacheKey,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
}

/// A processed output owned by a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: Uuid,
    pub query_id: Uuid,
    pub source_id: Option<Uuid>,
    pub cache_key: CacheKey,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of a domain record (query, content, result).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Processed,
    Archived,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Processed => "processed",
            RecordStatus::Archived => "archived",
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "processed" => Ok(RecordStatus::Processed),
            "archived" => Ok(RecordStatus::Archived),
            _ => Err(Error::Other(format!("unknown record status: {s}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_machine_allows_only_documented_transitions() {
        use TaskStatus::*;

        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Abandoned));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Pending));
        assert!(InProgress.can_transition_to(Failed));

        // No resurrection, no in-flight cancellation
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Abandoned.can_transition_to(InProgress));
        assert!(!InProgress.can_transition_to(Abandoned));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn open_and_terminal_partition_the_statuses() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Abandoned,
        ] {
            assert_ne!(status.is_open(), status.is_terminal());
        }
    }

    #[test]
    fn kinds_route_to_their_classes() {
        assert_eq!(
            TaskKind::GenerateResponse.default_class(),
            PriorityClass::HighPriority
        );
        assert_eq!(TaskKind::Scrape.default_class(), PriorityClass::Scraping);
        assert_eq!(TaskKind::Extract.default_class(), PriorityClass::Scraping);
        assert_eq!(TaskKind::Process.default_class(), PriorityClass::Processing);
        assert_eq!(
            TaskKind::AdjustSentiment.default_class(),
            PriorityClass::Processing
        );
    }

    #[test]
    fn kind_and_status_round_trip_through_strings() {
        for kind in TaskKind::ALL {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
        }
        for class in PriorityClass::ALL {
            assert_eq!(class.as_str().parse::<PriorityClass>().unwrap(), class);
        }
    }
}
