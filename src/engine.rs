//! Core engine. The public API for submitting and running work.
//!
//! The engine owns the store, the ephemeral cache, the dispatcher, and
//! the executor registry. It is an explicitly constructed instance with
//! a start/shutdown lifecycle — share it by `Arc`, never through a
//! process-wide singleton.
//!
//! Locking discipline: a worker claims a task with one compare-and-swap,
//! releases the store, runs the executor, and re-acquires the store only
//! to settle. A slow or hung executor never blocks unrelated tasks.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::cache::ResultCache;
use crate::config::EngineConfig;
use crate::dispatch::{Dispatcher, Envelope};
use crate::error::{Error, Result};
use crate::key::CacheKey;
use crate::model::*;
use crate::retry::{self, RetryPolicies};
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::telemetry::metrics;
use crate::telemetry::task::{record_status_transition, start_task_span};
use crate::worker::ExecutorRegistry;

/// What happened when work was submitted.
#[derive(Debug)]
pub enum Submission {
    /// New task created and queued.
    Created(Task),
    /// An open task of the same kind already holds the cache key. The
    /// caller gets the canonical task's identity — no second row exists.
    Duplicate {
        task_id: TaskId,
        cache_key: CacheKey,
    },
    /// The ephemeral cache had a live value for the key; nothing was
    /// enqueued.
    Cached {
        cache_key: CacheKey,
        value: serde_json::Value,
    },
}

/// The task engine. Owns all state and enforces all invariants.
pub struct Engine {
    store: Arc<Store>,
    cache: Arc<ResultCache>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ExecutorRegistry>,
    policies: RetryPolicies,
    config: EngineConfig,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Create an engine over an already-open store.
    pub fn new(
        store: Store,
        registry: ExecutorRegistry,
        config: EngineConfig,
    ) -> Result<Arc<Self>> {
        let policies = config.retry_policies()?;
        let dispatcher = Dispatcher::new(&config.class_configs());
        let cache = ResultCache::new(config.cache_ttl());

        Ok(Arc::new(Self {
            store: Arc::new(store),
            cache: Arc::new(cache),
            dispatcher: Arc::new(dispatcher),
            registry: Arc::new(registry),
            policies,
            config,
            handles: Mutex::new(Vec::new()),
        }))
    }

    /// Create an engine with in-memory storage (for testing).
    pub fn in_memory(registry: ExecutorRegistry, config: EngineConfig) -> Result<Arc<Self>> {
        Self::new(Store::in_memory()?, registry, config)
    }

    /// Create an engine backed by a database file.
    pub fn open(
        path: impl AsRef<std::path::Path>,
        registry: ExecutorRegistry,
        config: EngineConfig,
    ) -> Result<Arc<Self>> {
        Self::new(Store::open(path)?, registry, config)
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Submit new work.
    ///
    /// Probes the ephemeral cache first; a hit returns the cached value
    /// without enqueueing anything. On a miss the task is recorded in the
    /// durable store (where the unique index settles concurrent duplicate
    /// submissions) and offered to its class queue.
    ///
    /// The caller always gets a definitive answer: a new task, the
    /// canonical duplicate's identity, a cached value, or an error.
    /// On `QueueFull` the just-created task is abandoned — its key is
    /// released, so shedding load never poisons later resubmission.
    pub fn submit(&self, new: NewTask) -> Result<Submission> {
        if let Some(ref key) = new.cache_key {
            if let Some(value) = self.cache.get(key) {
                metrics::cache_operations().add(1, &[KeyValue::new("operation", "hit")]);
                metrics::tasks_submitted().add(
                    1,
                    &[
                        KeyValue::new("kind", new.kind.as_str()),
                        KeyValue::new("result", "cached"),
                    ],
                );
                return Ok(Submission::Cached {
                    cache_key: key.clone(),
                    value,
                });
            }
            metrics::cache_operations().add(1, &[KeyValue::new("operation", "miss")]);
        }

        let now = Utc::now();
        let task = Task {
            id: TaskId::new(),
            kind: new.kind,
            class: new.class,
            payload: new.payload,
            cache_key: new.cache_key,
            status: TaskStatus::Pending,
            attempt_count: 0,
            max_attempts: new
                .max_attempts
                .unwrap_or(self.policies.for_kind(new.kind).max_attempts),
            created_at: now,
            updated_at: now,
            next_retry_at: None,
            outcome: None,
        };

        match self.store.insert_task(&task) {
            Ok(()) => {}
            Err(Error::DuplicateCacheKey {
                existing,
                cache_key,
            }) => {
                metrics::tasks_submitted().add(
                    1,
                    &[
                        KeyValue::new("kind", task.kind.as_str()),
                        KeyValue::new("result", "duplicate"),
                    ],
                );
                return Ok(Submission::Duplicate {
                    task_id: existing,
                    cache_key: CacheKey::from_raw(cache_key),
                });
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = self.dispatcher.submit(Envelope {
            task_id: task.id,
            kind: task.kind,
            class: task.class,
        }) {
            // Backpressure: undo the reservation so the caller can shed
            // load and resubmit later without tripping dedup.
            self.store
                .transition(task.id, TaskStatus::Pending, TaskStatus::Abandoned)?;
            return Err(e);
        }

        metrics::tasks_submitted().add(
            1,
            &[
                KeyValue::new("kind", task.kind.as_str()),
                KeyValue::new("result", "ok"),
            ],
        );

        self.store.get_task(task.id).map(Submission::Created)
    }

    /// Cancel a task between attempts. Only pending tasks can be
    /// abandoned; an in-progress attempt always runs to settlement.
    pub fn cancel(&self, id: TaskId) -> Result<Task> {
        self.store
            .transition(id, TaskStatus::Pending, TaskStatus::Abandoned)
    }

    /// Get a task by ID.
    pub fn get(&self, id: TaskId) -> Result<Task> {
        self.store.get_task(id)
    }

    /// Fast-path result lookup: ephemeral cache first, then the durable
    /// store's completed outcomes. A store hit re-warms the cache. A
    /// cache miss is never an error — at worst the caller resubmits and
    /// recomputes.
    pub fn lookup_result(&self, key: &CacheKey) -> Result<Option<serde_json::Value>> {
        if let Some(value) = self.cache.get(key) {
            metrics::cache_operations().add(1, &[KeyValue::new("operation", "hit")]);
            return Ok(Some(value));
        }
        metrics::cache_operations().add(1, &[KeyValue::new("operation", "miss")]);

        match self.store.latest_completed_outcome(key)? {
            Some(value) => {
                self.cache.put(key.clone(), value.clone());
                metrics::cache_operations().add(1, &[KeyValue::new("operation", "put")]);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the engine: recover state, then spawn the per-class worker
    /// pools, the retry pump, and the periodic trigger scheduler.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let orphans = self.store.recover_orphans()?;
        if !orphans.is_empty() {
            warn!(count = orphans.len(), "recovered orphaned in-progress tasks");
        }

        let now = Utc::now();
        let mut requeued = 0usize;
        for task in self.store.list_dispatchable(now)? {
            match self.dispatcher.submit(Envelope {
                task_id: task.id,
                kind: task.kind,
                class: task.class,
            }) {
                Ok(_) => requeued += 1,
                Err(Error::QueueFull { ref class }) => {
                    // The pump re-offers once workers drain the queue.
                    warn!(class = %class, "queue full during startup requeue");
                }
                Err(e) => return Err(e),
            }
        }
        if requeued > 0 {
            info!(count = requeued, "requeued pending tasks");
        }

        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());

        for class in PriorityClass::ALL {
            for i in 0..self.dispatcher.workers(class) {
                let engine = Arc::clone(self);
                let worker_id = format!("{class}-{i}");
                handles.push(tokio::spawn(async move {
                    engine.worker_loop(class, &worker_id).await;
                }));
            }
        }

        let engine = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            engine.pump_loop().await;
        }));

        let scheduler = Scheduler::new(Arc::clone(self), self.config.scheduler);
        handles.push(tokio::spawn(async move {
            scheduler.run().await;
        }));

        info!("engine started");
        Ok(())
    }

    /// Stop handing out work and wait for in-flight attempts to settle.
    /// Queued tasks stay pending in the store and are re-offered on the
    /// next start.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown();
        let handles: Vec<_> = {
            let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("engine stopped");
    }

    // -----------------------------------------------------------------------
    // Worker loops
    // -----------------------------------------------------------------------

    async fn worker_loop(&self, class: PriorityClass, worker_id: &str) {
        debug!(worker_id, "worker started");
        while let Some(envelope) = self.dispatcher.next(class).await {
            match self.process(envelope, worker_id).await {
                Ok(()) => {}
                Err(Error::StaleStatus { id, actual, .. }) => {
                    // Another worker (or a cancellation) won the claim.
                    debug!(worker_id, id = %id, status = %actual, "lost claim race");
                }
                Err(e) => error!(worker_id, "worker error: {e}"),
            }
        }
        debug!(worker_id, "worker stopped");
    }

    /// Claim, execute, settle one envelope — a single dispatch cycle.
    /// Exposed so embedders and tests can drive it deterministically.
    pub async fn process(&self, envelope: Envelope, worker_id: &str) -> Result<()> {
        // Claim. Losing this CAS means another worker or a cancellation
        // got there first; the caller skips the envelope.
        let task =
            self.store
                .transition(envelope.task_id, TaskStatus::Pending, TaskStatus::InProgress)?;

        let span = start_task_span(task.kind, task.id);
        record_status_transition(&span, "pending", "in_progress");

        async {
            let started = std::time::Instant::now();
            let execution = self.execute(&task).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match execution {
                Execution::Success(value) => {
                    let outcome = Outcome {
                        success: true,
                        data: Some(value.clone()),
                        error: None,
                        duration_ms,
                    };
                    self.store.settle_success(task.id, &outcome)?;
                    record_status_transition(&span, "in_progress", "completed");

                    if let Some(ref key) = task.cache_key {
                        self.cache.put(key.clone(), value);
                        metrics::cache_operations()
                            .add(1, &[KeyValue::new("operation", "put")]);
                    }

                    metrics::execution_duration_ms().record(
                        duration_ms as f64,
                        &[
                            KeyValue::new("kind", task.kind.as_str()),
                            KeyValue::new("result", "success"),
                        ],
                    );
                    info!(worker_id, id = %task.id, duration_ms, "task completed");
                }
                Execution::Retryable(reason) => {
                    metrics::execution_duration_ms().record(
                        duration_ms as f64,
                        &[
                            KeyValue::new("kind", task.kind.as_str()),
                            KeyValue::new("result", "retryable"),
                        ],
                    );

                    if retry::should_retry(&task) {
                        let delay = self.policies.for_kind(task.kind).delay(task.attempt_count);
                        let next_retry_at = Utc::now()
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::seconds(60));
                        self.store
                            .schedule_retry(task.id, &reason, next_retry_at)?;
                        record_status_transition(&span, "in_progress", "pending");
                        info!(
                            worker_id,
                            id = %task.id,
                            attempt = task.attempt_count,
                            delay_secs = delay.as_secs(),
                            %reason,
                            "retry scheduled"
                        );
                    } else {
                        let reason = format!(
                            "exhausted {}/{} attempts: {reason}",
                            task.attempt_count, task.max_attempts
                        );
                        self.store.settle_failure(task.id, &reason, duration_ms)?;
                        record_status_transition(&span, "in_progress", "failed");
                        error!(worker_id, id = %task.id, %reason, "task failed");
                    }
                }
                Execution::Fatal(reason) => {
                    metrics::execution_duration_ms().record(
                        duration_ms as f64,
                        &[
                            KeyValue::new("kind", task.kind.as_str()),
                            KeyValue::new("result", "fatal"),
                        ],
                    );
                    let reason = format!("fatal: {reason}");
                    self.store.settle_failure(task.id, &reason, duration_ms)?;
                    record_status_transition(&span, "in_progress", "failed");
                    error!(worker_id, id = %task.id, %reason, "task failed");
                }
            }

            Ok(())
        }
        .instrument(span.clone())
        .await
    }

    /// Run the task's unit of work: built-in handling for maintenance,
    /// the registered executor for everything else.
    async fn execute(&self, task: &Task) -> Execution {
        if task.kind == TaskKind::Maintenance {
            return self.run_maintenance(task).await;
        }

        match self.registry.get(task.kind) {
            Some(executor) => executor.execute(task).await,
            None => {
                metrics::tasks_unroutable()
                    .add(1, &[KeyValue::new("kind", task.kind.as_str())]);
                warn!(kind = %task.kind, "no executor registered for kind");
                Execution::Fatal(format!("no executor registered for kind {}", task.kind))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Maintenance operations (submitted by the periodic scheduler)
    // -----------------------------------------------------------------------

    async fn run_maintenance(&self, task: &Task) -> Execution {
        let op = task
            .payload
            .get("op")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let result = match op.as_str() {
            "scan_sources" => self.scan_due_sources(),
            "sweep_pending" => self.sweep_stuck_content(),
            _ => return Execution::Fatal(format!("unknown maintenance op: {op:?}")),
        };

        match result {
            Ok(submitted) => Execution::Success(serde_json::json!({
                "op": op,
                "submitted": submitted,
            })),
            Err(e) => Execution::Retryable(format!("{op}: {e}")),
        }
    }

    /// Submit a scrape task for every source past its re-scan interval.
    /// Sources with an open scrape task dedup away; a full scraping
    /// queue stops the scan early (the sources stay due).
    pub fn scan_due_sources(&self) -> Result<usize> {
        let now = Utc::now();
        let mut submitted = 0usize;

        for source in self.store.sources_due(now)? {
            let url = match url::Url::parse(&source.url) {
                Ok(url) => url,
                Err(e) => {
                    warn!(url = %source.url, "skipping unparseable source url: {e}");
                    continue;
                }
            };

            let new = NewTask::new(TaskKind::Scrape)
                .payload(serde_json::json!({
                    "url": source.url,
                    "domain": source.domain,
                    "source_id": source.id.0,
                }))
                .cache_key(CacheKey::for_scrape(&url));

            match self.submit(new) {
                Ok(Submission::Created(_)) => submitted += 1,
                Ok(Submission::Duplicate { task_id, .. }) => {
                    debug!(url = %source.url, canonical = %task_id, "scrape already queued");
                }
                Ok(Submission::Cached { .. }) => {
                    debug!(url = %source.url, "scrape result still cached");
                }
                Err(Error::QueueFull { .. }) => {
                    warn!("scraping queue full, stopping source scan early");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(submitted)
    }

    /// Submit a process task for every content record stuck pending
    /// since before the configured threshold.
    pub fn sweep_stuck_content(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::seconds(self.config.scheduler.stuck_after_secs as i64);
        let mut submitted = 0usize;

        for content in self.store.stuck_content(cutoff)? {
            let new = NewTask::new(TaskKind::Process)
                .payload(serde_json::json!({
                    "content_id": content.id,
                    "query_id": content.query_id,
                    "content_key": content.cache_key.as_str(),
                }))
                .cache_key(CacheKey::for_process(&content.cache_key));

            match self.submit(new) {
                Ok(Submission::Created(_)) => submitted += 1,
                Ok(Submission::Duplicate { task_id, .. }) => {
                    debug!(content = %content.id, canonical = %task_id, "process already queued");
                }
                Ok(Submission::Cached { .. }) => {}
                Err(Error::QueueFull { .. }) => {
                    warn!("processing queue full, stopping pending sweep early");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(submitted)
    }

    // -----------------------------------------------------------------------
    // Retry pump
    // -----------------------------------------------------------------------

    async fn pump_loop(&self) {
        let mut interval = tokio::time::interval(self.config.pump_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown = self.dispatcher.shutdown_signal();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.pump_once() {
                        error!("retry pump error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Promote retry-due tasks into their class queues and sweep the
    /// cache. Re-offering an already-queued id is a no-op, so running
    /// this again before a worker claims is harmless.
    pub fn pump_once(&self) -> Result<usize> {
        let now = Utc::now();
        let mut promoted = 0usize;

        for task in self.store.find_due_for_retry(now)? {
            match self.dispatcher.submit(Envelope {
                task_id: task.id,
                kind: task.kind,
                class: task.class,
            }) {
                Ok(_) => promoted += 1,
                Err(Error::QueueFull { ref class }) => {
                    // Still pending and due; the next pump picks it up.
                    debug!(class = %class, "queue full, deferring retry promotion");
                }
                Err(e) => return Err(e),
            }
        }

        let evicted = self.cache.sweep();
        if evicted > 0 {
            debug!(evicted, "swept expired cache entries");
        }

        Ok(promoted)
    }

    pub(crate) fn shutdown_signal(&self) -> tokio::sync::watch::Receiver<bool> {
        self.dispatcher.shutdown_signal()
    }
}
