//! Executor seam and registry.
//!
//! The actual scraping/extraction/NLP work lives outside this crate.
//! Executors are registered per task kind; the engine claims a task,
//! calls the executor with no locks held, and settles the task from the
//! reported [`Execution`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::model::{Execution, Task, TaskKind};

/// An opaque unit of work. Implementations may block or await as long
/// as they like — the engine holds no store lock while this runs.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, task: &Task) -> Execution;
}

/// Registry of executors, indexed by task kind.
pub struct ExecutorRegistry {
    executors: HashMap<TaskKind, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    /// Create an empty registry with no executors.
    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor for a kind, replacing any previous one.
    pub fn register(mut self, kind: TaskKind, executor: Arc<dyn Executor>) -> Self {
        self.executors.insert(kind, executor);
        self
    }

    /// Look up the executor for a kind. Tasks of an unregistered kind
    /// are failed terminally rather than executed.
    pub fn get(&self, kind: TaskKind) -> Option<&Arc<dyn Executor>> {
        self.executors.get(&kind)
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::empty()
    }
}
