//! Topic to handler registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::error::DispatchError;
use crate::task::Task;

/// Semantic checks on a decoded payload, beyond what serde enforces.
pub trait Validate {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Handler for one task topic with a strongly-typed payload.
#[async_trait]
pub trait TopicHandler: Send + Sync + 'static {
    type Payload: DeserializeOwned + Validate + Send + 'static;

    /// Runs the work for `task`. The task is already `InProgress` in the
    /// store; returning an error marks it `Failed`.
    async fn handle(&self, task: Task, payload: Self::Payload) -> Result<(), DispatchError>;
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn call(&self, task: Task) -> Result<(), DispatchError>;
}

struct Typed<H>(H);

#[async_trait]
impl<H: TopicHandler> ErasedHandler for Typed<H> {
    async fn call(&self, task: Task) -> Result<(), DispatchError> {
        let invalid = |reason: String| DispatchError::InvalidPayload {
            topic: task.topic.clone(),
            reason,
        };
        let payload: H::Payload =
            serde_json::from_value(task.payload.clone()).map_err(|e| invalid(e.to_string()))?;
        payload.validate().map_err(invalid)?;
        self.0.handle(task, payload).await
    }
}

/// Topic → handler table, built once at worker startup.
#[derive(Default, Clone)]
pub struct RouteTable {
    routes: HashMap<String, Arc<dyn ErasedHandler>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a topic, replacing any previous one.
    pub fn route<H: TopicHandler>(mut self, topic: impl Into<String>, handler: H) -> Self {
        self.routes.insert(topic.into(), Arc::new(Typed(handler)));
        self
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.routes.contains_key(topic)
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.routes.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Decode, validate and run the handler for the task's topic.
    pub(crate) async fn call(&self, task: Task) -> Result<(), DispatchError> {
        let handler = self
            .routes
            .get(&task.topic)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownTopic(task.topic.clone()))?;
        handler.call(task).await
    }
}
