//! Periodic trigger scheduler.
//!
//! Two independent cadences: a scan that submits a source re-scan
//! maintenance task, and a slightly longer sweep that submits a
//! stuck-pending-content maintenance task. Both ride the normal submit
//! path and execute on the high-priority pool — there is no side door.
//!
//! Missed ticks are skipped, not backfilled: after downtime only the
//! currently-due items are actioned (at-least-once triggering).

use std::sync::Arc;

use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::engine::{Engine, Submission};
use crate::error::{Error, Result};
use crate::key::CacheKey;
use crate::model::{NewTask, TaskKind};

pub struct Scheduler {
    engine: Arc<Engine>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>, config: SchedulerConfig) -> Self {
        Self { engine, config }
    }

    /// Run until the engine shuts down.
    pub async fn run(self) {
        let mut scan = interval(std::time::Duration::from_secs(self.config.source_scan_secs));
        scan.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut sweep = interval(std::time::Duration::from_secs(self.config.pending_sweep_secs));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut shutdown = self.engine.shutdown_signal();

        loop {
            tokio::select! {
                _ = scan.tick() => {
                    if let Err(e) = self.trigger("scan_sources") {
                        warn!("source scan trigger error: {e}");
                    }
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.trigger("sweep_pending") {
                        warn!("pending sweep trigger error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("scheduler stopped");
                        return;
                    }
                }
            }
        }
    }

    /// Submit one maintenance task. The op name is the cache key, so an
    /// unfinished previous cycle dedups the new trigger away instead of
    /// piling up.
    fn trigger(&self, op: &str) -> Result<()> {
        let new = NewTask::new(TaskKind::Maintenance)
            .payload(serde_json::json!({ "op": op }))
            .cache_key(CacheKey::compute(TaskKind::Maintenance, &[op]));

        match self.engine.submit(new) {
            Ok(Submission::Created(task)) => {
                debug!(op, id = %task.id, "maintenance task submitted");
                Ok(())
            }
            Ok(Submission::Duplicate { task_id, .. }) => {
                debug!(op, canonical = %task_id, "previous cycle still open");
                Ok(())
            }
            Ok(Submission::Cached { .. }) => Ok(()),
            Err(Error::QueueFull { ref class }) => {
                warn!(op, class = %class, "maintenance queue full, skipping cycle");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
