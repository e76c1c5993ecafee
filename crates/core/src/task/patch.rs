//! Partial updates applied atomically by a task store.
//!
//! A [`TaskPatch`] combines a status change, field replacement (`set`),
//! numeric increments (`inc`) and equality guards (`only_if`) on dotted
//! payload paths. Stores apply the whole patch under one lock/transaction so
//! concurrent children never need a client-side read-modify-write.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::store::StoreError;
use super::types::{Task, TaskError, TaskStatus};

/// A partial update of one task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Payload paths to replace.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, Value>,
    /// Payload paths to increment. Missing paths start at zero.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inc: BTreeMap<String, i64>,
    /// Payload paths that must equal the given value for the patch to apply.
    /// A missing path compares as `null`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub only_if: BTreeMap<String, Value>,
    /// Manual replay: the only way out of `Failed`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replay: bool,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Patch that only changes the status.
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Marks the task completed now.
    pub fn completed() -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            completed_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Marks the task failed with the given error.
    pub fn failed(error: TaskError) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            error: Some(error),
            ..Self::default()
        }
    }

    /// Resets a task to `Pending` and clears its error, for manual replay.
    pub fn replay() -> Self {
        Self {
            status: Some(TaskStatus::Pending),
            replay: true,
            ..Self::default()
        }
    }

    pub fn set(mut self, path: impl Into<String>, value: Value) -> Self {
        self.set.insert(path.into(), value);
        self
    }

    pub fn inc(mut self, path: impl Into<String>, by: i64) -> Self {
        self.inc.insert(path.into(), by);
        self
    }

    pub fn only_if(mut self, path: impl Into<String>, expected: Value) -> Self {
        self.only_if.insert(path.into(), expected);
        self
    }

    /// Applies the patch to `task` in place.
    ///
    /// On error `task` may be partially modified; callers apply patches to a
    /// scratch copy and only persist on success.
    pub fn apply(&self, task: &mut Task, now: DateTime<Utc>) -> Result<(), StoreError> {
        for (path, expected) in &self.only_if {
            let actual = get_path(&task.payload, path).unwrap_or(&Value::Null);
            if actual != expected {
                return Err(StoreError::PreconditionFailed {
                    task_id: task.id.clone(),
                    path: path.clone(),
                });
            }
        }

        if let Some(next) = self.status {
            let allowed = if self.replay {
                next == TaskStatus::Pending && task.status == TaskStatus::Failed
            } else {
                task.status.can_transition_to(next)
            };
            if !allowed {
                return Err(StoreError::InvalidTransition {
                    task_id: task.id.clone(),
                    from: task.status,
                    to: next,
                });
            }
        }

        for (path, value) in &self.set {
            set_path(&mut task.payload, path, value.clone())?;
        }

        for (path, by) in &self.inc {
            let current = match get_path(&task.payload, path) {
                None | Some(Value::Null) => 0,
                Some(Value::Number(n)) => n.as_i64().ok_or_else(|| {
                    StoreError::Validation(format!("payload.{} is not an integer", path))
                })?,
                Some(_) => {
                    return Err(StoreError::Validation(format!(
                        "cannot increment non-numeric payload.{}",
                        path
                    )))
                }
            };
            set_path(&mut task.payload, path, Value::from(current + by))?;
        }

        if let Some(next) = self.status {
            task.status = next;
            if next == TaskStatus::Completed && task.completed_at.is_none() {
                task.completed_at = Some(self.completed_at.unwrap_or(now));
            }
        }
        if self.completed_at.is_some() {
            task.completed_at = self.completed_at;
        }
        if let Some(error) = &self.error {
            task.error = Some(error.clone());
        }
        if self.replay {
            task.error = None;
            task.completed_at = None;
        }

        task.updated_at = now;
        Ok(())
    }
}

/// Reads a value by dotted path.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, key| current.as_object()?.get(key))
}

/// Writes a value by dotted path, creating intermediate objects.
pub fn set_path(root: &mut Value, path: &str, value: Value) -> Result<(), StoreError> {
    if path.is_empty() {
        return Err(StoreError::Validation("payload path must not be empty".to_string()));
    }
    if root.is_null() {
        *root = Value::Object(Map::new());
    }

    let mut keys = path.split('.').peekable();
    let mut current = root;
    while let Some(key) = keys.next() {
        let object = current.as_object_mut().ok_or_else(|| {
            StoreError::Validation(format!("payload.{} crosses a non-object value", path))
        })?;
        if keys.peek().is_none() {
            object.insert(key.to_string(), value);
            return Ok(());
        }
        current = object
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Ok(())
}
