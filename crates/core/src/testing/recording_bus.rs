//! Bus that records messages instead of delivering them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::bus::{BusError, MessageBus};
use crate::task::{TaskStatus, TaskStore};

/// One recorded emit.
#[derive(Debug, Clone)]
pub struct RecordedMessage {
    pub topic: String,
    pub message: Value,
    /// Status of the message's parent task at emit time, when the bus was
    /// given a store and the message names a parent.
    pub parent_status: Option<TaskStatus>,
}

/// A [`MessageBus`] for unit tests.
///
/// `emit` only records. `send` answers with a canned reply per topic, or
/// `NoSubscriber` when none was configured.
#[derive(Default)]
pub struct RecordingBus {
    messages: Arc<RwLock<Vec<RecordedMessage>>>,
    replies: Arc<RwLock<HashMap<String, Value>>>,
    next_error: Arc<RwLock<Option<BusError>>>,
    store: Option<Arc<dyn TaskStore>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the parent's status for every recorded message.
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// All recorded emits, in order.
    pub async fn recorded(&self) -> Vec<RecordedMessage> {
        self.messages.read().await.clone()
    }

    /// Messages emitted on one topic, in order.
    pub async fn emitted_on(&self, topic: &str) -> Vec<Value> {
        self.messages
            .read()
            .await
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.message.clone())
            .collect()
    }

    pub async fn clear(&self) {
        self.messages.write().await.clear();
    }

    /// Reply to `send` on `topic` with `reply`.
    pub async fn set_reply(&self, topic: impl Into<String>, reply: Value) {
        self.replies.write().await.insert(topic.into(), reply);
    }

    /// Make the next emit or send fail.
    pub async fn set_next_error(&self, error: BusError) {
        *self.next_error.write().await = Some(error);
    }

    async fn take_error(&self) -> Option<BusError> {
        self.next_error.write().await.take()
    }

    async fn parent_status(&self, message: &Value) -> Option<TaskStatus> {
        let store = self.store.as_ref()?;
        let parent_id = message.get("parent_task_id")?.as_str()?;
        store.get(parent_id).await.ok().map(|parent| parent.status)
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn emit(&self, topic: &str, message: Value) -> Result<(), BusError> {
        if let Some(error) = self.take_error().await {
            return Err(error);
        }
        let parent_status = self.parent_status(&message).await;
        self.messages.write().await.push(RecordedMessage {
            topic: topic.to_string(),
            message,
            parent_status,
        });
        Ok(())
    }

    async fn send(&self, topic: &str, _message: Value) -> Result<Value, BusError> {
        if let Some(error) = self.take_error().await {
            return Err(error);
        }
        self.replies
            .read()
            .await
            .get(topic)
            .cloned()
            .ok_or_else(|| BusError::NoSubscriber(topic.to_string()))
    }
}
