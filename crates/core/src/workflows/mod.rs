//! The two workers of the pipeline, expressed as typed route tables.
//!
//! Each worker listens on one process topic. [`downloader`] turns an ODM
//! order into downloaded parts and hands them to [`encoder`], which remuxes
//! and tags every part.

pub mod downloader;
pub mod encoder;

use std::path::Path;

use serde::Serialize;
use serde_json::Value;

use crate::dispatch::DispatchError;

/// Serialize a follow-up payload for `topic`.
fn encode_payload<T: Serialize>(topic: &str, payload: &T) -> Result<Value, DispatchError> {
    serde_json::to_value(payload).map_err(|e| DispatchError::InvalidPayload {
        topic: topic.to_string(),
        reason: e.to_string(),
    })
}

/// Payload value of a path produced by a collaborator.
fn path_value(path: &Path) -> Value {
    Value::String(path.to_string_lossy().into_owned())
}


/// Process topic of the worker that handles `task_topic`, by topic prefix.
pub fn process_topic_for(task_topic: &str) -> Option<&'static str> {
    if task_topic.starts_with("odm.") {
        Some(downloader::PROCESS_TOPIC)
    } else if task_topic.starts_with("encoder.") {
        Some(encoder::PROCESS_TOPIC)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_topic_by_prefix() {
        assert_eq!(process_topic_for("odm.download.file"), Some("odm.process"));
        assert_eq!(process_topic_for("encoder.book"), Some("encoder.process"));
        assert_eq!(process_topic_for("odmx.thing"), None);
        assert_eq!(process_topic_for("task.create"), None);
    }
}
