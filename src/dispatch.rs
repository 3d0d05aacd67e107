//! Priority dispatcher: bounded per-class queues feeding worker pools.
//!
//! Each priority class owns a FIFO queue with a capacity bound and a
//! fixed-size worker pool. Cross-class fairness is structural — a flood
//! of low-priority work fills its own queue and pool, never the workers
//! of another class — which is weighted round-robin with weights equal
//! to the configured concurrency.
//!
//! Queues carry envelopes (task id + routing), not task state. The
//! durable store remains the source of truth; a worker re-reads and
//! claims the task when it picks an envelope up.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::{Notify, watch};

use crate::error::{Error, Result};
use crate::model::{PriorityClass, TaskId, TaskKind};
use crate::telemetry::metrics;

/// What travels through a class queue.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub class: PriorityClass,
}

/// Per-class pool sizing.
#[derive(Debug, Clone, Copy)]
pub struct ClassConfig {
    /// Fixed worker pool size for this class.
    pub workers: usize,
    /// Queue capacity bound. Submission past this is QueueFull.
    pub capacity: usize,
}

struct ClassQueue {
    deque: VecDeque<Envelope>,
    /// Ids currently queued, so re-offers (from the retry pump) are
    /// idempotent instead of duplicating entries.
    queued: HashSet<TaskId>,
    capacity: usize,
}

struct ClassState {
    queue: Mutex<ClassQueue>,
    notify: Notify,
    workers: usize,
}

/// Routes envelopes to bounded class queues and hands them to workers.
pub struct Dispatcher {
    classes: HashMap<PriorityClass, ClassState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Outcome of an offer to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// The task id was already waiting in its class queue.
    AlreadyQueued,
}

impl Dispatcher {
    pub fn new(configs: &HashMap<PriorityClass, ClassConfig>) -> Self {
        let mut classes = HashMap::new();
        for class in PriorityClass::ALL {
            let config = configs.get(&class).copied().unwrap_or(ClassConfig {
                workers: 1,
                capacity: 64,
            });
            classes.insert(
                class,
                ClassState {
                    queue: Mutex::new(ClassQueue {
                        deque: VecDeque::new(),
                        queued: HashSet::new(),
                        capacity: config.capacity,
                    }),
                    notify: Notify::new(),
                    workers: config.workers.max(1),
                },
            );
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            classes,
            shutdown_tx,
            shutdown_rx,
        }
    }

    fn class(&self, class: PriorityClass) -> &ClassState {
        // All classes are populated at construction.
        &self.classes[&class]
    }

    /// Enqueue an envelope into its class queue. Fails with QueueFull at
    /// the capacity bound — backpressure, not unbounded growth.
    pub fn submit(&self, envelope: Envelope) -> Result<Offer> {
        let state = self.class(envelope.class);
        {
            let mut queue = state.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.queued.contains(&envelope.task_id) {
                return Ok(Offer::AlreadyQueued);
            }
            if queue.deque.len() >= queue.capacity {
                metrics::queue_rejections().add(
                    1,
                    &[opentelemetry::KeyValue::new(
                        "class",
                        envelope.class.as_str(),
                    )],
                );
                return Err(Error::QueueFull {
                    class: envelope.class.to_string(),
                });
            }
            queue.queued.insert(envelope.task_id);
            queue.deque.push_back(envelope);
        }
        // Notify outside the lock
        state.notify.notify_one();
        Ok(Offer::Queued)
    }

    /// Hand the next envelope for a class to a worker. Blocks until work
    /// arrives or shutdown is signaled; None means stop.
    pub async fn next(&self, class: PriorityClass) -> Option<Envelope> {
        let state = self.class(class);
        let mut shutdown = self.shutdown_rx.clone();

        loop {
            if *shutdown.borrow() {
                return None;
            }

            {
                let mut queue = state.queue.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(envelope) = queue.deque.pop_front() {
                    queue.queued.remove(&envelope.task_id);
                    return Some(envelope);
                }
            }

            // notify_one stores a permit when nobody is waiting, so an
            // offer landing between the check above and this await is
            // not lost.
            tokio::select! {
                _ = state.notify.notified() => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Current depth of a class queue.
    pub fn depth(&self, class: PriorityClass) -> usize {
        self.class(class)
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .deque
            .len()
    }

    /// Configured worker pool size for a class.
    pub fn workers(&self, class: PriorityClass) -> usize {
        self.class(class).workers
    }

    /// Stop handing out work. Blocked `next` calls return None; queued
    /// envelopes stay in the store as pending tasks and are re-offered
    /// on the next start.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// A receiver that flips to true on shutdown, for loops that need to
    /// select against it.
    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}
