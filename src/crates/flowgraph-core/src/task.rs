//! Concurrent node execution
//!
//! Each dispatched node runs on its own tokio task inside a [`JoinSet`]. A
//! semaphore caps how many bodies run at once when `max_parallelism > 0`.
//!
//! Completion is collected in one of two modes:
//!
//! - **eager**: return as soon as one task finished, together with any others
//!   that already finished, so successors can start early;
//! - **all**: return once every submitted task finished (one superstep).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};

use crate::error::{GraphError, Result};
use crate::payload::Payload;

/// Result of one node execution
#[derive(Debug)]
pub struct TaskOutcome {
    pub node: String,
    pub result: Result<Payload>,
    /// Copy of the input the body received, kept for rerun checkpoints
    pub input: Option<Payload>,
}

impl TaskOutcome {
    fn failed(node: String, error: GraphError) -> Self {
        Self {
            node,
            result: Err(error),
            input: None,
        }
    }
}

/// Runs node tasks and collects their outcomes
pub struct TaskManager {
    tasks: JoinSet<TaskOutcome>,
    running: HashMap<Id, String>,
    semaphore: Option<Arc<Semaphore>>,
    eager: bool,
}

impl TaskManager {
    /// `max_parallelism == 0` means unbounded
    pub fn new(max_parallelism: usize, eager: bool) -> Self {
        Self {
            tasks: JoinSet::new(),
            running: HashMap::new(),
            semaphore: (max_parallelism > 0).then(|| Arc::new(Semaphore::new(max_parallelism))),
            eager,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    pub fn is_idle(&self) -> bool {
        self.running.is_empty()
    }

    /// Spawn one node task
    pub fn submit<F>(&mut self, node: String, task: F)
    where
        F: Future<Output = TaskOutcome> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let key = node.clone();
        let handle = self.tasks.spawn(async move {
            let _permit = match semaphore {
                Some(sem) => match sem.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        return TaskOutcome::failed(key, GraphError::Internal("task semaphore closed".into()))
                    }
                },
                None => None,
            };
            task.await
        });
        tracing::debug!(node = %node, "task submitted");
        self.running.insert(handle.id(), node);
    }

    /// Wait according to the completion mode
    pub async fn wait(&mut self) -> Vec<TaskOutcome> {
        if self.eager {
            self.wait_any().await
        } else {
            self.wait_all().await
        }
    }

    /// At least one outcome (if anything is running) plus every other finished one
    pub async fn wait_any(&mut self) -> Vec<TaskOutcome> {
        let mut done = Vec::new();
        if let Some(joined) = self.tasks.join_next_with_id().await {
            done.push(self.finish(joined));
        }
        while let Some(joined) = self.tasks.try_join_next_with_id() {
            done.push(self.finish(joined));
        }
        done
    }

    /// Every outstanding outcome, in completion order
    pub async fn wait_all(&mut self) -> Vec<TaskOutcome> {
        let mut done = Vec::new();
        while let Some(joined) = self.tasks.join_next_with_id().await {
            done.push(self.finish(joined));
        }
        done
    }

    fn finish(&mut self, joined: std::result::Result<(Id, TaskOutcome), tokio::task::JoinError>) -> TaskOutcome {
        match joined {
            Ok((id, outcome)) => {
                self.running.remove(&id);
                outcome
            }
            Err(err) => {
                let node = self
                    .running
                    .remove(&err.id())
                    .unwrap_or_else(|| "<unknown>".to_string());
                tracing::error!(node = %node, error = %err, "node task panicked");
                TaskOutcome::failed(node.clone(), GraphError::node_execution(node, format!("task failed: {err}")))
            }
        }
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("running", &self.running.values().collect::<Vec<_>>())
            .field("eager", &self.eager)
            .finish()
    }
}
