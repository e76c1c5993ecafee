//! Task storage trait and types.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::patch::{get_path, TaskPatch};
use super::types::{NewTask, Task, TaskStatus};

/// Error type for task store operations.
///
/// Serializable so the kind survives a request/reply over the bus.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StoreError {
    /// Malformed request (missing id, empty filter, bad payload path...).
    #[error("validation error: {0}")]
    Validation(String),

    /// No task matches the given id.
    #[error("task not found: {0}")]
    NotFound(String),

    /// The requested status change would leave a terminal state or move backwards.
    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// An `only_if` guard did not hold; nothing was written.
    #[error("precondition on payload.{path} failed for task {task_id}")]
    PreconditionFailed { task_id: String, path: String },

    /// Backend failure.
    #[error("database error: {0}")]
    Database(String),
}

/// Filter for querying tasks. All set fields must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Any of these topics.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
    /// Any of these statuses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    /// Payload values by dotted path.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub payload: BTreeMap<String, Value>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self::new().with_id(id)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_task_id = Some(parent_id.into());
        self
    }

    pub fn with_payload(mut self, path: impl Into<String>, value: Value) -> Self {
        self.payload.insert(path.into(), value);
        self
    }

    /// Whether the filter would match every task.
    pub fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.topics.is_empty()
            && self.statuses.is_empty()
            && self.parent_task_id.is_none()
            && self.payload.is_empty()
    }

    /// Evaluates the filter against a task.
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(ref id) = self.id {
            if &task.id != id {
                return false;
            }
        }
        if !self.topics.is_empty() && !self.topics.iter().any(|t| t == &task.topic) {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&task.status) {
            return false;
        }
        if let Some(ref parent) = self.parent_task_id {
            if task.parent_task_id.as_ref() != Some(parent) {
                return false;
            }
        }
        self.payload
            .iter()
            .all(|(path, expected)| get_path(&task.payload, path) == Some(expected))
    }
}

/// Durable keyed task store: the sole source of truth for task existence and status.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create one task.
    async fn create(&self, task: NewTask) -> Result<Task, StoreError>;

    /// Create several tasks in one transaction. Fails on empty input.
    async fn create_many(&self, tasks: Vec<NewTask>) -> Result<Vec<Task>, StoreError>;

    /// First task matching the filter, in creation order.
    async fn find_one(&self, filter: &TaskFilter) -> Result<Option<Task>, StoreError>;

    /// All tasks matching the filter, in creation order.
    async fn find_all(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;

    /// Apply a patch atomically and return the updated task.
    async fn update(&self, id: &str, patch: TaskPatch) -> Result<Task, StoreError>;

    /// Delete one task, returning it if it existed.
    async fn remove(&self, id: &str) -> Result<Option<Task>, StoreError>;

    /// Delete all tasks matching a non-empty filter. Returns the number deleted.
    async fn remove_many(&self, filter: &TaskFilter) -> Result<usize, StoreError>;

    /// Convenience: fetch by id or fail with `NotFound`.
    async fn get(&self, id: &str) -> Result<Task, StoreError> {
        self.find_one(&TaskFilter::by_id(id))
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

/// Shared validation for creation requests.
pub(crate) fn validate_new_task(task: &NewTask) -> Result<(), StoreError> {
    if task.topic.trim().is_empty() {
        return Err(StoreError::Validation(
            "task topic must be provided".to_string(),
        ));
    }
    Ok(())
}
