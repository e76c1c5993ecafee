//! Errors raised while dispatching a task.

use thiserror::Error;

use crate::bus::BusError;
use crate::task::StoreError;

/// Failure reported by an external collaborator (network, transcoder...).
///
/// Displays its message verbatim so it lands unchanged in the failed task's
/// `error.message`; the optional source becomes `error.stack`.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ExternalError {
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl ExternalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Errors that fail a dispatched task.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no handler for topic {0}")]
    UnknownTopic(String),

    #[error("invalid payload for {topic}: {reason}")]
    InvalidPayload { topic: String, reason: String },

    #[error("child task {child_id} failed: {message}")]
    ChildFailed { child_id: String, message: String },

    #[error(transparent)]
    External(#[from] ExternalError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskError;

    #[test]
    fn test_external_error_message_is_verbatim() {
        let err = DispatchError::from(ExternalError::new("disk full"));
        assert_eq!(err.to_string(), "disk full");
    }

    #[test]
    fn test_task_error_carries_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "No space left on device");
        let err = DispatchError::from(ExternalError::with_source("disk full", io));
        let task_error = TaskError::from_error(&err);

        assert_eq!(task_error.message, "disk full");
        assert!(task_error.stack.contains("No space left on device"));
    }

    #[test]
    fn test_store_error_converts() {
        let err: DispatchError = StoreError::NotFound("t1".to_string()).into();
        assert!(matches!(err, DispatchError::Store(StoreError::NotFound(_))));
    }
}
