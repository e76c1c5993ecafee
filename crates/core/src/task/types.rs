//! Core task data types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of a task.
///
/// Status only moves forward:
/// `Pending -> InProgress -> (ChildPending -> InProgress)* -> Completed | Failed`;
/// a `Pending` task may also fail before it starts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting for a worker.
    Pending,
    /// A worker is executing the task.
    InProgress,
    /// The task fanned out and waits for its children.
    ChildPending,
    /// Finished successfully. Terminal.
    Completed,
    /// Finished with an error. Terminal.
    Failed,
}

impl TaskStatus {
    /// Returns the status as stored and filtered on.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::ChildPending => "child_pending",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Parses a stored status string.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "child_pending" => Some(TaskStatus::ChildPending),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// Whether no transition may leave this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether moving from `self` to `next` respects the forward-only state machine.
    ///
    /// Re-applying the current status is allowed and is a no-op.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            TaskStatus::Completed | TaskStatus::Failed => false,
            TaskStatus::Pending => matches!(next, TaskStatus::InProgress | TaskStatus::Failed),
            TaskStatus::InProgress | TaskStatus::ChildPending => next != TaskStatus::Pending,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error recorded on a task that terminated in `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskError {
    pub message: String,
    /// Source chain of the error, outermost first.
    #[serde(default)]
    pub stack: String,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: String::new(),
        }
    }

    /// Builds a task error from any error, walking its `source()` chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut stack = vec![format!("{:?}", err)];
        let mut source = err.source();
        while let Some(cause) = source {
            stack.push(format!("caused by: {}", cause));
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            stack: stack.join("\n"),
        }
    }
}

/// The durable unit of work and coordination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub topic: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Reads a value from the payload by dotted path (`"downloads.done"`).
    pub fn payload_at(&self, path: &str) -> Option<&Value> {
        super::patch::get_path(&self.payload, path)
    }
}

/// Request to create a task. The store assigns id and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTask {
    pub topic: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
}

impl NewTask {
    /// A pending task with the given topic and payload.
    pub fn pending(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            status: TaskStatus::Pending,
            payload,
            parent_task_id: None,
        }
    }

    /// Sets the parent task.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_task_id = Some(parent_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_states_never_move() {
        for terminal in [TaskStatus::Completed, TaskStatus::Failed] {
            for next in [
                TaskStatus::Pending,
                TaskStatus::InProgress,
                TaskStatus::ChildPending,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
            assert!(terminal.can_transition_to(terminal));
        }
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn test_forward_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::ChildPending));
        assert!(TaskStatus::ChildPending.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::ChildPending.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::InProgress.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::ChildPending.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn test_pending_must_start_before_finishing() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::ChildPending));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::ChildPending).unwrap();
        assert_eq!(json, "\"child_pending\"");
        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::ChildPending,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("cancelled"), None);
    }

    #[test]
    fn test_task_error_from_error_keeps_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = TaskError::from_error(&io);
        assert_eq!(err.message, "disk full");
        assert!(!err.stack.is_empty());
    }

    #[test]
    fn test_new_task_requires_status_on_the_wire() {
        let missing = json!({ "topic": "odm.downloads", "payload": {} });
        assert!(serde_json::from_value::<NewTask>(missing).is_err());

        let ok = json!({ "topic": "odm.downloads", "status": "pending" });
        let task: NewTask = serde_json::from_value(ok).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.payload, Value::Null);
    }
}
