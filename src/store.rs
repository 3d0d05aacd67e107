//! SQLite storage layer.
//!
//! Single source of truth for task state, domain records, and events.
//! WAL mode for concurrent read access. Uniqueness is enforced by the
//! schema's unique indexes — the race window of check-then-insert never
//! opens. All status changes go through the compare-and-swap
//! [`Store::transition`] family.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::key::CacheKey;
use crate::model::*;
use crate::telemetry::metrics;

/// Outcome of inserting a keyed domain record.
#[derive(Debug)]
pub enum Reservation<T> {
    /// The key was free; the record was created.
    Created(T),
    /// The key was already claimed; here is the existing record.
    Existing(T),
}

impl<T> Reservation<T> {
    pub fn into_inner(self) -> T {
        match self {
            Reservation::Created(v) | Reservation::Existing(v) => v,
        }
    }
}

/// Storage backend. Owns the SQLite connection.
///
/// The connection sits behind a mutex so the store can be shared across
/// worker tasks; no lock is ever held across an await point.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        let conn = self.lock();

        // WAL mode for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tasks (
                id              TEXT PRIMARY KEY,
                kind            TEXT NOT NULL,
                class           TEXT NOT NULL,
                payload         TEXT NOT NULL DEFAULT 'null',
                cache_key       TEXT,
                status          TEXT NOT NULL DEFAULT 'pending',
                attempt_count   INTEGER NOT NULL DEFAULT 0,
                max_attempts    INTEGER NOT NULL,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL,
                next_retry_at   TEXT,
                outcome_data    TEXT,
                outcome_error   TEXT,
                outcome_ms      INTEGER
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_open_key ON tasks(cache_key)
                WHERE cache_key IS NOT NULL AND status IN ('pending', 'in_progress');
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_retry ON tasks(next_retry_at)
                WHERE status = 'pending' AND next_retry_at IS NOT NULL;

            CREATE TABLE IF NOT EXISTS sources (
                id                   TEXT PRIMARY KEY,
                url                  TEXT NOT NULL UNIQUE,
                domain               TEXT NOT NULL,
                last_scraped_at      TEXT,
                scrape_interval_secs INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sources_domain ON sources(domain);

            CREATE TABLE IF NOT EXISTS queries (
                id          TEXT PRIMARY KEY,
                subject     TEXT NOT NULL,
                cache_key   TEXT NOT NULL UNIQUE,
                status      TEXT NOT NULL DEFAULT 'pending',
                created_at  TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_queries_subject ON queries(subject);

            CREATE TABLE IF NOT EXISTS content (
                id          TEXT PRIMARY KEY,
                query_id    TEXT NOT NULL REFERENCES queries(id),
                source_id   TEXT NOT NULL REFERENCES sources(id),
                cache_key   TEXT NOT NULL UNIQUE,
                status      TEXT NOT NULL DEFAULT 'pending',
                created_at  TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_content_query ON content(query_id);
            CREATE INDEX IF NOT EXISTS idx_content_status ON content(status);

            CREATE TABLE IF NOT EXISTS results (
                id          TEXT PRIMARY KEY,
                query_id    TEXT NOT NULL REFERENCES queries(id),
                source_id   TEXT REFERENCES sources(id),
                cache_key   TEXT NOT NULL UNIQUE,
                status      TEXT NOT NULL DEFAULT 'pending',
                created_at  TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_results_query ON results(query_id);

            CREATE TABLE IF NOT EXISTS events (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp   TEXT NOT NULL,
                kind        TEXT NOT NULL
            );
            ",
        )?;

        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Poisoning only happens if a panic escaped while holding the
        // lock; the connection itself is still consistent.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Insert a new task. The unique partial index on open tasks'
    /// cache keys makes concurrent duplicate submissions lose the race
    /// here, atomically.
    ///
    /// Errors with [`Error::DuplicateCacheKey`] when an open task of the
    /// same kind holds the key, [`Error::KeyConflict`] when a different
    /// kind does.
    pub fn insert_task(&self, task: &Task) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT INTO tasks (
                id, kind, class, payload, cache_key, status, attempt_count,
                max_attempts, created_at, updated_at, next_retry_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                task.id.0.to_string(),
                task.kind.as_str(),
                task.class.as_str(),
                serde_json::to_string(&task.payload).unwrap_or_default(),
                task.cache_key.as_ref().map(|k| k.as_str().to_string()),
                task.status.as_str(),
                task.attempt_count,
                task.max_attempts,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
                task.next_retry_at.map(|t| t.to_rfc3339()),
            ],
        );

        match inserted {
            Ok(_) => {
                record_event_on(
                    &tx,
                    EventKind::TaskCreated {
                        id: task.id,
                        kind: task.kind,
                        class: task.class,
                        cache_key: task.cache_key.as_ref().map(|k| k.as_str().to_string()),
                    },
                )?;
                tx.commit()?;
                Ok(())
            }
            Err(e) if is_unique_violation(&e) && task.cache_key.is_some() => {
                let key = task.cache_key.as_ref().unwrap();
                let holder = find_open_by_key_on(&tx, key)?
                    .ok_or_else(|| Error::Storage(e))?;

                if holder.kind == task.kind {
                    record_event_on(
                        &tx,
                        EventKind::TaskDeduplicated {
                            canonical_id: holder.id,
                            kind: holder.kind,
                            cache_key: key.as_str().to_string(),
                        },
                    )?;
                    tx.commit()?;
                    Err(Error::DuplicateCacheKey {
                        existing: holder.id,
                        cache_key: key.as_str().to_string(),
                    })
                } else {
                    Err(Error::KeyConflict {
                        cache_key: key.as_str().to_string(),
                        held_by: holder.kind,
                        requested: task.kind,
                    })
                }
            }
            Err(e) => Err(Error::Storage(e)),
        }
    }

    /// Get a task by ID.
    pub fn get_task(&self, id: TaskId) -> Result<Task> {
        get_task_on(&self.lock(), id)
    }

    /// Find the open (pending or in-progress) task holding a cache key.
    pub fn find_open_by_key(&self, key: &CacheKey) -> Result<Option<Task>> {
        find_open_by_key_on(&self.lock(), key)
    }

    /// Compare-and-swap status transition. Fails with
    /// [`Error::StaleStatus`] if the task's current status does not match
    /// `expected` — the losing side of a race must re-read and decide.
    ///
    /// Entering in_progress increments `attempt_count` and clears
    /// `next_retry_at`. Every successful transition records an event.
    pub fn transition(&self, id: TaskId, expected: TaskStatus, new: TaskStatus) -> Result<Task> {
        if !expected.can_transition_to(new) {
            return Err(Error::InvalidTransition {
                from: expected,
                to: new,
            });
        }

        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let now = Utc::now();
        let attempt_increment = if new == TaskStatus::InProgress { 1 } else { 0 };

        let rows = tx.execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2,
                attempt_count = attempt_count + ?3,
                next_retry_at = CASE WHEN ?1 = 'in_progress' THEN NULL ELSE next_retry_at END
             WHERE id = ?4 AND status = ?5",
            params![
                new.as_str(),
                now.to_rfc3339(),
                attempt_increment,
                id.0.to_string(),
                expected.as_str(),
            ],
        )?;

        if rows == 0 {
            let actual = get_task_on(&tx, id)?.status;
            return Err(Error::StaleStatus {
                id,
                expected,
                actual,
            });
        }

        let task = get_task_on(&tx, id)?;
        record_event_on(
            &tx,
            EventKind::StatusChanged {
                id,
                kind: task.kind,
                from: expected,
                to: new,
                attempt_count: task.attempt_count,
            },
        )?;
        tx.commit()?;
        record_transition_metric(expected, new);
        Ok(task)
    }

    /// Settle a successful attempt: in_progress → completed with outcome.
    pub fn settle_success(&self, id: TaskId, outcome: &Outcome) -> Result<Task> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = Utc::now();

        let rows = tx.execute(
            "UPDATE tasks SET status = 'completed', updated_at = ?1,
                outcome_data = ?2, outcome_error = NULL, outcome_ms = ?3
             WHERE id = ?4 AND status = 'in_progress'",
            params![
                now.to_rfc3339(),
                outcome
                    .data
                    .as_ref()
                    .map(|d| serde_json::to_string(d).unwrap_or_default()),
                outcome.duration_ms as i64,
                id.0.to_string(),
            ],
        )?;

        if rows == 0 {
            let actual = get_task_on(&tx, id)?.status;
            return Err(Error::StaleStatus {
                id,
                expected: TaskStatus::InProgress,
                actual,
            });
        }

        let task = get_task_on(&tx, id)?;
        record_event_on(
            &tx,
            EventKind::StatusChanged {
                id,
                kind: task.kind,
                from: TaskStatus::InProgress,
                to: TaskStatus::Completed,
                attempt_count: task.attempt_count,
            },
        )?;
        tx.commit()?;
        record_transition_metric(TaskStatus::InProgress, TaskStatus::Completed);
        Ok(task)
    }

    /// Schedule a retry: in_progress → pending with a backoff deadline.
    pub fn schedule_retry(
        &self,
        id: TaskId,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<Task> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = Utc::now();

        let rows = tx.execute(
            "UPDATE tasks SET status = 'pending', updated_at = ?1,
                next_retry_at = ?2, outcome_error = ?3
             WHERE id = ?4 AND status = 'in_progress'",
            params![
                now.to_rfc3339(),
                next_retry_at.to_rfc3339(),
                error,
                id.0.to_string(),
            ],
        )?;

        if rows == 0 {
            let actual = get_task_on(&tx, id)?.status;
            return Err(Error::StaleStatus {
                id,
                expected: TaskStatus::InProgress,
                actual,
            });
        }

        let task = get_task_on(&tx, id)?;
        record_event_on(
            &tx,
            EventKind::StatusChanged {
                id,
                kind: task.kind,
                from: TaskStatus::InProgress,
                to: TaskStatus::Pending,
                attempt_count: task.attempt_count,
            },
        )?;
        record_event_on(
            &tx,
            EventKind::RetryScheduled {
                id,
                kind: task.kind,
                attempt_count: task.attempt_count,
                next_retry_at,
            },
        )?;
        tx.commit()?;
        record_transition_metric(TaskStatus::InProgress, TaskStatus::Pending);
        Ok(task)
    }

    /// Terminal failure: in_progress → failed. Exactly-once — a second
    /// caller loses the CAS and sees StaleStatus, never a double event.
    pub fn settle_failure(&self, id: TaskId, reason: &str, duration_ms: u64) -> Result<Task> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = Utc::now();

        let rows = tx.execute(
            "UPDATE tasks SET status = 'failed', updated_at = ?1,
                outcome_error = ?2, outcome_ms = ?3
             WHERE id = ?4 AND status = 'in_progress'",
            params![
                now.to_rfc3339(),
                reason,
                duration_ms as i64,
                id.0.to_string(),
            ],
        )?;

        if rows == 0 {
            let actual = get_task_on(&tx, id)?.status;
            return Err(Error::StaleStatus {
                id,
                expected: TaskStatus::InProgress,
                actual,
            });
        }

        let task = get_task_on(&tx, id)?;
        record_event_on(
            &tx,
            EventKind::StatusChanged {
                id,
                kind: task.kind,
                from: TaskStatus::InProgress,
                to: TaskStatus::Failed,
                attempt_count: task.attempt_count,
            },
        )?;
        record_event_on(
            &tx,
            EventKind::TaskExhausted {
                id,
                kind: task.kind,
                attempt_count: task.attempt_count,
                reason: reason.to_string(),
            },
        )?;
        tx.commit()?;
        record_transition_metric(TaskStatus::InProgress, TaskStatus::Failed);
        Ok(task)
    }

    /// Most recent completed outcome for a cache key, if any. The
    /// miss-path recovery behind the ephemeral cache.
    pub fn latest_completed_outcome(&self, key: &CacheKey) -> Result<Option<serde_json::Value>> {
        let conn = self.lock();
        let data: Option<Option<String>> = conn
            .query_row(
                "SELECT outcome_data FROM tasks
                 WHERE cache_key = ?1 AND status = 'completed'
                 ORDER BY updated_at DESC
                 LIMIT 1",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(data
            .flatten()
            .and_then(|d| serde_json::from_str(&d).ok()))
    }

    /// Tasks whose retry deadline has passed, ordered by deadline then
    /// class rank (most urgent class first among equal deadlines).
    pub fn find_due_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, kind, class, payload, cache_key, status, attempt_count,
                    max_attempts, created_at, updated_at, next_retry_at,
                    outcome_data, outcome_error, outcome_ms
             FROM tasks
             WHERE status = 'pending' AND next_retry_at IS NOT NULL AND next_retry_at <= ?1
             ORDER BY next_retry_at ASC,
                      CASE class
                          WHEN 'high_priority' THEN 2
                          WHEN 'scraping' THEN 1
                          ELSE 0
                      END DESC",
        )?;
        collect_tasks(&mut stmt, params![now.to_rfc3339()])
    }

    /// Pending tasks eligible for dispatch right now: never scheduled for
    /// retry, or past their deadline. Used for startup recovery.
    pub fn list_dispatchable(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, kind, class, payload, cache_key, status, attempt_count,
                    max_attempts, created_at, updated_at, next_retry_at,
                    outcome_data, outcome_error, outcome_ms
             FROM tasks
             WHERE status = 'pending'
               AND (next_retry_at IS NULL OR next_retry_at <= ?1)
             ORDER BY created_at ASC",
        )?;
        collect_tasks(&mut stmt, params![now.to_rfc3339()])
    }

    /// Return tasks orphaned in_progress (e.g. by a crash) to pending.
    /// Attempt counts are preserved.
    pub fn recover_orphans(&self) -> Result<Vec<TaskId>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = Utc::now();

        let ids: Vec<TaskId> = {
            let mut stmt =
                tx.prepare("SELECT id FROM tasks WHERE status = 'in_progress'")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                let raw = row?;
                let uuid = raw
                    .parse()
                    .map_err(|e: uuid::Error| Error::Other(format!("bad task id: {e}")))?;
                ids.push(TaskId(uuid));
            }
            ids
        };

        for &id in &ids {
            tx.execute(
                "UPDATE tasks SET status = 'pending', updated_at = ?1 WHERE id = ?2",
                params![now.to_rfc3339(), id.0.to_string()],
            )?;
            let task = get_task_on(&tx, id)?;
            record_event_on(
                &tx,
                EventKind::StatusChanged {
                    id,
                    kind: task.kind,
                    from: TaskStatus::InProgress,
                    to: TaskStatus::Pending,
                    attempt_count: task.attempt_count,
                },
            )?;
        }

        tx.commit()?;
        Ok(ids)
    }

    /// List tasks, optionally filtered, newest first.
    pub fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        kind: Option<TaskKind>,
        limit: i64,
    ) -> Result<Vec<Task>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, kind, class, payload, cache_key, status, attempt_count,
                    max_attempts, created_at, updated_at, next_retry_at,
                    outcome_data, outcome_error, outcome_ms
             FROM tasks
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR kind = ?2)
             ORDER BY created_at DESC
             LIMIT ?3",
        )?;
        collect_tasks(
            &mut stmt,
            params![
                status.map(|s| s.as_str().to_string()),
                kind.map(|k| k.as_str().to_string()),
                limit,
            ],
        )
    }

    // -----------------------------------------------------------------------
    // Sources
    // -----------------------------------------------------------------------

    /// Register a source, or update its scrape interval if the URL is
    /// already known. URL uniqueness is schema-enforced.
    pub fn upsert_source(&self, url: &str, domain: &str, interval_secs: i64) -> Result<Source> {
        let conn = self.lock();
        let id = SourceId::new();
        conn.execute(
            "INSERT INTO sources (id, url, domain, scrape_interval_secs)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(url) DO UPDATE SET scrape_interval_secs = excluded.scrape_interval_secs",
            params![id.0.to_string(), url, domain, interval_secs],
        )?;
        get_source_by_url_on(&conn, url)?
            .ok_or_else(|| Error::NotFound(format!("source {url}")))
    }

    /// Stamp a source after a successful fetch.
    pub fn mark_source_scraped(&self, id: SourceId, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock();
        let rows = conn.execute(
            "UPDATE sources SET last_scraped_at = ?1 WHERE id = ?2",
            params![at.to_rfc3339(), id.0.to_string()],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("source {id}")));
        }
        Ok(())
    }

    /// Sources due for a re-scan: never scraped, or past their interval.
    pub fn sources_due(&self, now: DateTime<Utc>) -> Result<Vec<Source>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, url, domain, last_scraped_at, scrape_interval_secs
             FROM sources
             WHERE last_scraped_at IS NULL
                OR unixepoch(last_scraped_at) + scrape_interval_secs <= unixepoch(?1)
             ORDER BY last_scraped_at ASC",
        )?;
        let rows = stmt.query_map(params![now.to_rfc3339()], row_to_source)?;
        let mut sources = Vec::new();
        for row in rows {
            sources.push(row.map_err(Error::Storage)?);
        }
        Ok(sources)
    }

    pub fn list_sources(&self) -> Result<Vec<Source>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, url, domain, last_scraped_at, scrape_interval_secs
             FROM sources ORDER BY domain ASC, url ASC",
        )?;
        let rows = stmt.query_map([], row_to_source)?;
        let mut sources = Vec::new();
        for row in rows {
            sources.push(row.map_err(Error::Storage)?);
        }
        Ok(sources)
    }

    // -----------------------------------------------------------------------
    // Queries / content / results
    // -----------------------------------------------------------------------

    /// Insert a query, or return the existing one holding the key.
    pub fn insert_query(&self, subject: &str, key: &CacheKey) -> Result<Reservation<Query>> {
        let conn = self.lock();
        let id = uuid::Uuid::new_v4();
        let now = Utc::now();

        let inserted = conn.execute(
            "INSERT INTO queries (id, subject, cache_key, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![id.to_string(), subject, key.as_str(), now.to_rfc3339()],
        );

        match inserted {
            Ok(_) => Ok(Reservation::Created(get_query_by_key_on(&conn, key)?)),
            Err(e) if is_unique_violation(&e) => {
                Ok(Reservation::Existing(get_query_by_key_on(&conn, key)?))
            }
            Err(e) => Err(Error::Storage(e)),
        }
    }

    /// Insert a content record, or return the existing artifact for the
    /// key — at most one stored artifact per fingerprint.
    pub fn insert_content(
        &self,
        query_id: uuid::Uuid,
        source_id: uuid::Uuid,
        key: &CacheKey,
    ) -> Result<Reservation<Content>> {
        let conn = self.lock();
        let id = uuid::Uuid::new_v4();
        let now = Utc::now();

        let inserted = conn.execute(
            "INSERT INTO content (id, query_id, source_id, cache_key, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![
                id.to_string(),
                query_id.to_string(),
                source_id.to_string(),
                key.as_str(),
                now.to_rfc3339(),
            ],
        );

        match inserted {
            Ok(_) => Ok(Reservation::Created(get_content_by_key_on(&conn, key)?)),
            Err(e) if is_unique_violation(&e) => {
                Ok(Reservation::Existing(get_content_by_key_on(&conn, key)?))
            }
            Err(e) => Err(Error::Storage(e)),
        }
    }

    /// Insert a result record, or return the existing one for the key.
    pub fn insert_result(
        &self,
        query_id: uuid::Uuid,
        source_id: Option<uuid::Uuid>,
        key: &CacheKey,
    ) -> Result<Reservation<ResultRecord>> {
        let conn = self.lock();
        let id = uuid::Uuid::new_v4();
        let now = Utc::now();

        let inserted = conn.execute(
            "INSERT INTO results (id, query_id, source_id, cache_key, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![
                id.to_string(),
                query_id.to_string(),
                source_id.map(|s| s.to_string()),
                key.as_str(),
                now.to_rfc3339(),
            ],
        );

        match inserted {
            Ok(_) => Ok(Reservation::Created(get_result_by_key_on(&conn, key)?)),
            Err(e) if is_unique_violation(&e) => {
                Ok(Reservation::Existing(get_result_by_key_on(&conn, key)?))
            }
            Err(e) => Err(Error::Storage(e)),
        }
    }

    /// Content records still pending since before `cutoff` — work the
    /// sweep re-submits processing for.
    pub fn stuck_content(&self, cutoff: DateTime<Utc>) -> Result<Vec<Content>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, query_id, source_id, cache_key, status, created_at
             FROM content
             WHERE status = 'pending' AND created_at <= ?1
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![cutoff.to_rfc3339()], row_to_content)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(Error::Storage)?);
        }
        Ok(records)
    }

    /// Reverse lookup: content owned by a query.
    pub fn content_for_query(&self, query_id: uuid::Uuid) -> Result<Vec<Content>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, query_id, source_id, cache_key, status, created_at
             FROM content WHERE query_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![query_id.to_string()], row_to_content)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(Error::Storage)?);
        }
        Ok(records)
    }

    pub fn set_content_status(&self, id: uuid::Uuid, status: RecordStatus) -> Result<()> {
        let conn = self.lock();
        let rows = conn.execute(
            "UPDATE content SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id.to_string()],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("content {id}")));
        }
        Ok(())
    }

    pub fn set_query_status(&self, id: uuid::Uuid, status: RecordStatus) -> Result<()> {
        let conn = self.lock();
        let rows = conn.execute(
            "UPDATE queries SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id.to_string()],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("query {id}")));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Get events since a sequence number.
    pub fn events_since(&self, since_seq: u64) -> Result<Vec<Event>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT seq, timestamp, kind FROM events WHERE seq > ?1 ORDER BY seq ASC")?;

        let events = stmt
            .query_map(params![since_seq as i64], |row| {
                let kind_str: String = row.get(2)?;
                Ok(Event {
                    seq: row.get::<_, i64>(0)? as u64,
                    timestamp: row
                        .get::<_, String>(1)?
                        .parse()
                        .unwrap_or_else(|_| Utc::now()),
                    kind: serde_json::from_str(&kind_str)
                        .unwrap_or(EventKind::Unknown { raw: kind_str }),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }
}

// ---------------------------------------------------------------------------
// Inner functions — accept &Connection so they work with both
// Connection (auto-commit) and Transaction (deref to Connection).
// ---------------------------------------------------------------------------

fn record_transition_metric(from: TaskStatus, to: TaskStatus) {
    metrics::status_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn get_task_on(conn: &Connection, id: TaskId) -> Result<Task> {
    conn.query_row(
        "SELECT id, kind, class, payload, cache_key, status, attempt_count,
                max_attempts, created_at, updated_at, next_retry_at,
                outcome_data, outcome_error, outcome_ms
         FROM tasks WHERE id = ?1",
        params![id.0.to_string()],
        |row| Ok(row_to_task(row)),
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("task {id}")))?
    .map_err(|e| Error::Other(format!("failed to parse task: {e}")))
}

fn find_open_by_key_on(conn: &Connection, key: &CacheKey) -> Result<Option<Task>> {
    conn.query_row(
        "SELECT id, kind, class, payload, cache_key, status, attempt_count,
                max_attempts, created_at, updated_at, next_retry_at,
                outcome_data, outcome_error, outcome_ms
         FROM tasks
         WHERE cache_key = ?1 AND status IN ('pending', 'in_progress')
         LIMIT 1",
        params![key.as_str()],
        |row| Ok(row_to_task(row)),
    )
    .optional()?
    .transpose()
    .map_err(|e| Error::Other(format!("failed to parse task: {e}")))
}

fn record_event_on(conn: &Connection, kind: EventKind) -> Result<Event> {
    let now = Utc::now();

    conn.execute(
        "INSERT INTO events (timestamp, kind) VALUES (?1, ?2)",
        params![
            now.to_rfc3339(),
            serde_json::to_string(&kind).unwrap_or_default(),
        ],
    )?;

    let seq = conn.last_insert_rowid();

    Ok(Event {
        seq: seq as u64,
        timestamp: now,
        kind,
    })
}

fn collect_tasks<P: rusqlite::Params>(
    stmt: &mut rusqlite::Statement<'_>,
    params: P,
) -> Result<Vec<Task>> {
    let rows = stmt.query_map(params, |row| Ok(row_to_task(row)))?;
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row?.map_err(|e| Error::Other(format!("failed to parse task: {e}")))?);
    }
    Ok(tasks)
}

// ---------------------------------------------------------------------------
// Row parsing helpers
// ---------------------------------------------------------------------------

fn row_to_task(row: &rusqlite::Row) -> std::result::Result<Task, String> {
    let id_str: String = row.get(0).map_err(|e| e.to_string())?;
    let kind_str: String = row.get(1).map_err(|e| e.to_string())?;
    let class_str: String = row.get(2).map_err(|e| e.to_string())?;
    let payload_str: String = row.get(3).map_err(|e| e.to_string())?;
    let key_str: Option<String> = row.get(4).map_err(|e| e.to_string())?;
    let status_str: String = row.get(5).map_err(|e| e.to_string())?;
    let created_str: String = row.get(8).map_err(|e| e.to_string())?;
    let updated_str: String = row.get(9).map_err(|e| e.to_string())?;
    let retry_str: Option<String> = row.get(10).map_err(|e| e.to_string())?;
    let outcome_data: Option<String> = row.get(11).map_err(|e| e.to_string())?;
    let outcome_error: Option<String> = row.get(12).map_err(|e| e.to_string())?;
    let outcome_ms: Option<i64> = row.get(13).map_err(|e| e.to_string())?;

    let outcome = if outcome_data.is_some() || outcome_error.is_some() {
        Some(Outcome {
            success: outcome_error.is_none(),
            data: outcome_data.and_then(|d| serde_json::from_str(&d).ok()),
            error: outcome_error,
            duration_ms: outcome_ms.unwrap_or(0) as u64,
        })
    } else {
        None
    };

    Ok(Task {
        id: TaskId(id_str.parse().map_err(|e: uuid::Error| e.to_string())?),
        kind: kind_str.parse().map_err(|e: Error| e.to_string())?,
        class: class_str.parse().map_err(|e: Error| e.to_string())?,
        payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
        cache_key: key_str.map(CacheKey::from_raw),
        status: status_str.parse().map_err(|e: Error| e.to_string())?,
        attempt_count: row.get(6).map_err(|e| e.to_string())?,
        max_attempts: row.get(7).map_err(|e| e.to_string())?,
        created_at: created_str
            .parse()
            .map_err(|_| "invalid created_at".to_string())?,
        updated_at: updated_str
            .parse()
            .map_err(|_| "invalid updated_at".to_string())?,
        next_retry_at: retry_str.and_then(|s| s.parse().ok()),
        outcome,
    })
}

fn row_to_source(row: &rusqlite::Row) -> std::result::Result<Source, rusqlite::Error> {
    let id_str: String = row.get(0)?;
    let scraped_str: Option<String> = row.get(3)?;
    Ok(Source {
        id: SourceId(id_str.parse().unwrap_or_default()),
        url: row.get(1)?,
        domain: row.get(2)?,
        last_scraped_at: scraped_str.and_then(|s| s.parse::<DateTime<Utc>>().ok()),
        scrape_interval_secs: row.get(4)?,
    })
}

fn get_source_by_url_on(conn: &Connection, url: &str) -> Result<Option<Source>> {
    conn.query_row(
        "SELECT id, url, domain, last_scraped_at, scrape_interval_secs
         FROM sources WHERE url = ?1",
        params![url],
        row_to_source,
    )
    .optional()
    .map_err(Error::Storage)
}

fn row_to_query(row: &rusqlite::Row) -> std::result::Result<Query, rusqlite::Error> {
    let id_str: String = row.get(0)?;
    let created_str: String = row.get(4)?;
    let status_str: String = row.get(3)?;
    Ok(Query {
        id: id_str.parse().unwrap_or_default(),
        subject: row.get(1)?,
        cache_key: CacheKey::from_raw(row.get::<_, String>(2)?),
        status: status_str.parse().unwrap_or(RecordStatus::Pending),
        created_at: created_str.parse().unwrap_or_else(|_| Utc::now()),
    })
}

fn get_query_by_key_on(conn: &Connection, key: &CacheKey) -> Result<Query> {
    conn.query_row(
        "SELECT id, subject, cache_key, status, created_at FROM queries WHERE cache_key = ?1",
        params![key.as_str()],
        row_to_query,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("query for key {key}")))
}

fn row_to_content(row: &rusqlite::Row) -> std::result::Result<Content, rusqlite::Error> {
    let id_str: String = row.get(0)?;
    let query_str: String = row.get(1)?;
    let source_str: String = row.get(2)?;
    let status_str: String = row.get(4)?;
    let created_str: String = row.get(5)?;
    Ok(Content {
        id: id_str.parse().unwrap_or_default(),
        query_id: query_str.parse().unwrap_or_default(),
        source_id: source_str.parse().unwrap_or_default(),
        cache_key: CacheKey::from_raw(row.get::<_, String>(3)?),
        status: status_str.parse().unwrap_or(RecordStatus::Pending),
        created_at: created_str.parse().unwrap_or_else(|_| Utc::now()),
    })
}

fn get_content_by_key_on(conn: &Connection, key: &CacheKey) -> Result<Content> {
    conn.query_row(
        "SELECT id, query_id, source_id, cache_key, status, created_at
         FROM content WHERE cache_key = ?1",
        params![key.as_str()],
        row_to_content,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("content for key {key}")))
}

fn row_to_result(row: &rusqlite::Row) -> std::result::Result<ResultRecord, rusqlite::Error> {
    let id_str: String = row.get(0)?;
    let query_str: String = row.get(1)?;
    let source_str: Option<String> = row.get(2)?;
    let status_str: String = row.get(4)?;
    let created_str: String = row.get(5)?;
    Ok(ResultRecord {
        id: id_str.parse().unwrap_or_default(),
        query_id: query_str.parse().unwrap_or_default(),
        source_id: source_str.and_then(|s| s.parse().ok()),
        cache_key: CacheKey::from_raw(row.get::<_, String>(3)?),
        status: status_str.parse().unwrap_or(RecordStatus::Pending),
        created_at: created_str.parse().unwrap_or_else(|_| Utc::now()),
    })
}

fn get_result_by_key_on(conn: &Connection, key: &CacheKey) -> Result<ResultRecord> {
    conn.query_row(
        "SELECT id, query_id, source_id, cache_key, status, created_at
         FROM results WHERE cache_key = ?1",
        params![key.as_str()],
        row_to_result,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("result for key {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_event_json_returns_unknown_variant() {
        let store = Store::in_memory().unwrap();

        store
            .lock()
            .execute(
                "INSERT INTO events (timestamp, kind) VALUES (?1, ?2)",
                params![Utc::now().to_rfc3339(), "this is not valid json {{{"],
            )
            .unwrap();

        let events = store.events_since(0).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0].kind {
            EventKind::Unknown { raw } => {
                assert_eq!(raw, "this is not valid json {{{");
            }
            other => panic!("expected Unknown, got {:?}", other),
        }
    }

    #[test]
    fn unrecognized_event_type_returns_unknown_variant() {
        let store = Store::in_memory().unwrap();

        let future_event = r#"{"type":"quantum_entangled","qubit_id":"q42"}"#;
        store
            .lock()
            .execute(
                "INSERT INTO events (timestamp, kind) VALUES (?1, ?2)",
                params![Utc::now().to_rfc3339(), future_event],
            )
            .unwrap();

        let events = store.events_since(0).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0].kind {
            EventKind::Unknown { raw } => {
                assert_eq!(raw, future_event);
            }
            other => panic!("expected Unknown, got {:?}", other),
        }
    }
}
