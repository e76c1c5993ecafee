//! Bus traits and message helpers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::task::Task;

/// Errors raised by a bus transport.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum BusError {
    /// Nobody is subscribed to the topic.
    #[error("no subscriber for topic {0}")]
    NoSubscriber(String),

    /// A message could not be encoded or decoded.
    #[error("message codec error: {0}")]
    Codec(String),

    /// The subscriber failed to produce a reply.
    #[error("handler error: {0}")]
    Handler(String),
}

/// Client side of the bus.
///
/// `emit` is fire-and-forget with no ordering guarantee between messages;
/// `send` is a request expecting a single reply.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn emit(&self, topic: &str, message: Value) -> Result<(), BusError>;

    async fn send(&self, topic: &str, message: Value) -> Result<Value, BusError>;
}

/// Subscriber side of the bus.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one message. The returned value is the reply for `send`;
    /// it is discarded for `emit`.
    async fn handle(&self, topic: &str, message: Value) -> Result<Value, BusError>;
}

/// Encodes a task as a process message.
pub fn task_message(task: &Task) -> Result<Value, BusError> {
    serde_json::to_value(task).map_err(|e| BusError::Codec(e.to_string()))
}

/// Decodes a process message back into a task.
pub fn decode_task(message: Value) -> Result<Task, BusError> {
    serde_json::from_value(message).map_err(|e| BusError::Codec(e.to_string()))
}
