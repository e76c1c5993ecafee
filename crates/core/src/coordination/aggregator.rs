//! Completion aggregation for fan-out children.
//!
//! Every dispatch of a tracked child enters its parent's group before the
//! handler runs and leaves it once the handler settles. The removal that
//! empties a group evaluates the parent against the Store: the membership
//! only decides *when* to look, the Store decides *whether* to advance.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::state::{InMemoryMembership, MembershipState};
use crate::bus::{task_message, MessageBus};
use crate::dispatch::DispatchError;
use crate::metrics;
use crate::task::{StoreError, Task, TaskError, TaskFilter, TaskPatch, TaskStatus, TaskStore};

/// How a tracked topic reports completion to its parent.
#[derive(Debug, Clone)]
pub struct TrackedTopic {
    /// Payload path of the parent's phase-complete flag (e.g. `downloads.done`).
    pub flag_path: String,
    /// Bus topic the parent is re-emitted on.
    pub process_topic: String,
}

/// Outcome of settling one child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanIn {
    /// Topic not tracked or task has no parent.
    Untracked,
    /// Other children of the group are still being handled here.
    Outstanding,
    /// Group is empty but the Store still has unfinished children.
    NotReady,
    /// This call flipped the flag and emitted the parent.
    Fired,
    /// The flag was already set by someone else.
    AlreadyFired,
    /// A child failed; the parent was marked failed.
    ParentFailed,
}

impl FanIn {
    fn as_str(&self) -> &'static str {
        match self {
            FanIn::Untracked => "untracked",
            FanIn::Outstanding => "outstanding",
            FanIn::NotReady => "not_ready",
            FanIn::Fired => "fired",
            FanIn::AlreadyFired => "already_fired",
            FanIn::ParentFailed => "parent_failed",
        }
    }
}

/// Watches tracked child topics and advances parents exactly once.
pub struct CompletionAggregator {
    store: Arc<dyn TaskStore>,
    bus: Arc<dyn MessageBus>,
    membership: Arc<dyn MembershipState>,
    tracked: HashMap<String, TrackedTopic>,
}

impl CompletionAggregator {
    pub fn new(store: Arc<dyn TaskStore>, bus: Arc<dyn MessageBus>) -> Self {
        Self::with_membership(store, bus, Arc::new(InMemoryMembership::new()))
    }

    pub fn with_membership(
        store: Arc<dyn TaskStore>,
        bus: Arc<dyn MessageBus>,
        membership: Arc<dyn MembershipState>,
    ) -> Self {
        Self {
            store,
            bus,
            membership,
            tracked: HashMap::new(),
        }
    }

    /// Track a child topic.
    pub fn track(
        mut self,
        topic: impl Into<String>,
        flag_path: impl Into<String>,
        process_topic: impl Into<String>,
    ) -> Self {
        self.tracked.insert(
            topic.into(),
            TrackedTopic {
                flag_path: flag_path.into(),
                process_topic: process_topic.into(),
            },
        );
        self
    }

    pub fn is_tracked(&self, topic: &str) -> bool {
        self.tracked.contains_key(topic)
    }

    pub fn membership(&self) -> &Arc<dyn MembershipState> {
        &self.membership
    }

    /// Record a child as outstanding before its handler runs.
    /// Returns whether the child is tracked.
    pub fn enter(&self, task: &Task) -> bool {
        match (&task.parent_task_id, self.is_tracked(&task.topic)) {
            (Some(parent_id), true) => {
                self.membership.add(&task.topic, parent_id, &task.id);
                true
            }
            _ => false,
        }
    }

    /// Record a child as settled and, if that emptied its group, evaluate
    /// the parent.
    pub async fn settle(&self, task: &Task) -> Result<FanIn, DispatchError> {
        let (Some(parent_id), Some(tracked)) =
            (&task.parent_task_id, self.tracked.get(&task.topic))
        else {
            return Ok(FanIn::Untracked);
        };

        if !self.membership.remove(&task.topic, parent_id, &task.id) {
            return Ok(FanIn::Outstanding);
        }

        let outcome = self.evaluate(&task.topic, parent_id, tracked).await?;
        metrics::AGGREGATOR_FAN_IN
            .with_label_values(&[task.topic.as_str(), outcome.as_str()])
            .inc();
        Ok(outcome)
    }

    async fn evaluate(
        &self,
        topic: &str,
        parent_id: &str,
        tracked: &TrackedTopic,
    ) -> Result<FanIn, DispatchError> {
        // Every topic sharing the flag belongs to the same phase.
        let mut filter = TaskFilter::new().with_parent(parent_id);
        for (sibling, other) in &self.tracked {
            if other.flag_path == tracked.flag_path {
                filter = filter.with_topic(sibling.as_str());
            }
        }
        let children = self.store.find_all(&filter).await?;

        if let Some(failed) = children.iter().find(|c| c.status == TaskStatus::Failed) {
            return self.fail_parent(parent_id, failed).await;
        }

        if children.is_empty() || children.iter().any(|c| !c.status.is_terminal()) {
            debug!(
                "Group {} of task {} emptied with unfinished children",
                topic, parent_id
            );
            return Ok(FanIn::NotReady);
        }

        let patch = TaskPatch::new()
            .set(tracked.flag_path.as_str(), Value::Bool(true))
            .only_if(tracked.flag_path.as_str(), Value::Bool(false));

        match self.store.update(parent_id, patch).await {
            Ok(_) => {
                let parent = self.store.get(parent_id).await?;
                info!(
                    "All {} children of task {} completed, resuming parent",
                    topic, parent_id
                );
                self.bus
                    .emit(&tracked.process_topic, task_message(&parent)?)
                    .await?;
                Ok(FanIn::Fired)
            }
            Err(StoreError::PreconditionFailed { .. }) => {
                debug!("Flag {} of task {} already set", tracked.flag_path, parent_id);
                Ok(FanIn::AlreadyFired)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fail_parent(&self, parent_id: &str, child: &Task) -> Result<FanIn, DispatchError> {
        let reason = child
            .error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "unknown error".to_string());
        let error = TaskError::new(format!("child task {} failed: {}", child.id, reason));

        match self.store.update(parent_id, TaskPatch::failed(error)).await {
            Ok(_) => {
                warn!("Task {} failed because child {} failed", parent_id, child.id);
                Ok(FanIn::ParentFailed)
            }
            Err(StoreError::InvalidTransition { from, .. }) if from.is_terminal() => {
                debug!("Task {} already {}, not failing again", parent_id, from);
                Ok(FanIn::ParentFailed)
            }
            Err(e) => Err(e.into()),
        }
    }
}
