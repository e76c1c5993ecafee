//! The per-worker dispatch router.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use super::error::DispatchError;
use super::registry::RouteTable;
use crate::bus::{decode_task, BusError, MessageHandler};
use crate::coordination::{AdmissionGate, CompletionAggregator};
use crate::metrics;
use crate::task::{StoreError, Task, TaskError, TaskPatch, TaskStatus, TaskStore};

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Dropped before touching the store (terminal status, missing id).
    Rejected,
    /// The stored task is already terminal; stale redelivery.
    Stale,
    /// The handler returned successfully.
    Handled,
    /// The task was marked failed.
    Failed,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Rejected => "rejected",
            DispatchOutcome::Stale => "stale",
            DispatchOutcome::Handled => "handled",
            DispatchOutcome::Failed => "failed",
        }
    }
}

/// Routes tasks of one worker to their handlers.
///
/// For every delivery: reject terminal or anonymous tasks, enter the
/// aggregator and the admission gate where configured, mark the task
/// `InProgress`, run the typed handler and record any error as `Failed`.
pub struct Router {
    routes: RouteTable,
    store: Arc<dyn TaskStore>,
    aggregator: Option<Arc<CompletionAggregator>>,
    gates: HashMap<String, Arc<AdmissionGate>>,
    locks: TaskLocks,
}

impl Router {
    pub fn new(routes: RouteTable, store: Arc<dyn TaskStore>) -> Self {
        Self {
            routes,
            store,
            aggregator: None,
            gates: HashMap::new(),
            locks: TaskLocks::default(),
        }
    }

    /// Attach the completion aggregator consulted for tracked topics.
    pub fn with_aggregator(mut self, aggregator: Arc<CompletionAggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    /// Gate a topic: its tasks wait for a slot under their parent.
    pub fn with_gate(mut self, topic: impl Into<String>, gate: Arc<AdmissionGate>) -> Self {
        self.gates.insert(topic.into(), gate);
        self
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Dispatch one task.
    pub async fn dispatch(&self, task: Task) -> DispatchOutcome {
        if task.id.is_empty() {
            warn!("Rejecting {} message without a task id", task.topic);
            return self.record(&task, DispatchOutcome::Rejected);
        }
        if task.status.is_terminal() {
            warn!(
                "Rejecting task {} on {}: already {}",
                task.id, task.topic, task.status
            );
            return self.record(&task, DispatchOutcome::Rejected);
        }

        let _serial = self.locks.acquire(&task.id).await;

        let tracked = self
            .aggregator
            .as_ref()
            .map(|a| a.enter(&task))
            .unwrap_or(false);

        let permit = match self.gates.get(&task.topic) {
            Some(gate) => {
                let group = task.parent_task_id.as_deref().unwrap_or(&task.id);
                Some(gate.admit(group, &task.id).await)
            }
            None => None,
        };

        let outcome = self.run(&task).await;
        drop(permit);

        if tracked {
            if let Some(aggregator) = &self.aggregator {
                if let Err(e) = aggregator.settle(&task).await {
                    error!(
                        "Failed to evaluate completion for parent of task {}: {}",
                        task.id, e
                    );
                }
            }
        }

        self.record(&task, outcome)
    }

    async fn run(&self, task: &Task) -> DispatchOutcome {
        let current = match self
            .store
            .update(&task.id, TaskPatch::status(TaskStatus::InProgress))
            .await
        {
            Ok(current) => current,
            Err(StoreError::InvalidTransition { from, .. }) if from.is_terminal() => {
                debug!("Dropping stale delivery of task {}: already {}", task.id, from);
                return DispatchOutcome::Stale;
            }
            Err(e) => return self.fail(task, e.into()).await,
        };

        info!("Handling task {} on {}", current.id, current.topic);
        match self.routes.call(current).await {
            Ok(()) => {
                debug!("Task {} handled", task.id);
                DispatchOutcome::Handled
            }
            Err(e) => self.fail(task, e).await,
        }
    }

    async fn fail(&self, task: &Task, err: DispatchError) -> DispatchOutcome {
        warn!("Task {} on {} failed: {}", task.id, task.topic, err);
        let patch = TaskPatch::failed(TaskError::from_error(&err));
        if let Err(e) = self.store.update(&task.id, patch).await {
            error!("Failed to record failure of task {}: {}", task.id, e);
        }
        DispatchOutcome::Failed
    }

    fn record(&self, task: &Task, outcome: DispatchOutcome) -> DispatchOutcome {
        metrics::DISPATCH_OUTCOMES
            .with_label_values(&[task.topic.as_str(), outcome.as_str()])
            .inc();
        outcome
    }
}

#[async_trait]
impl MessageHandler for Router {
    async fn handle(&self, topic: &str, message: Value) -> Result<Value, BusError> {
        let task = decode_task(message).map_err(|e| {
            warn!("Undecodable message on {}: {}", topic, e);
            e
        })?;
        let outcome = self.dispatch(task).await;
        Ok(Value::String(outcome.as_str().to_string()))
    }
}

/// One async lock per task id, so duplicate deliveries run one after the
/// other. Entries are removed once nobody holds or waits on them.
#[derive(Default)]
struct TaskLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TaskLocks {
    async fn acquire(&self, id: &str) -> TaskLock<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.entry(id.to_string()).or_default().clone()
        };
        TaskLock {
            owner: self,
            id: id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }
}

struct TaskLock<'a> {
    owner: &'a TaskLocks,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TaskLock<'_> {
    fn drop(&mut self) {
        let mut locks = self.owner.locks.lock().unwrap_or_else(|p| p.into_inner());
        self.guard.take();
        if locks
            .get(&self.id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.id);
        }
    }
}
