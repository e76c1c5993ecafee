//! Task store served over the bus.
//!
//! [`StoreService`] answers the `task.*` request topics against any local
//! store; [`RemoteTaskStore`] is the client used by workers that do not own
//! the database. Replies carry a serialized `Result` so the error kind
//! (validation, not found, transition...) survives the round trip.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::patch::TaskPatch;
use super::store::{StoreError, TaskFilter, TaskStore};
use super::types::{NewTask, Task};
use crate::bus::{BusError, LocalBus, MessageBus, MessageHandler};

/// Request topics of the store vocabulary.
pub mod topics {
    pub const CREATE: &str = "task.create";
    pub const CREATE_MANY: &str = "task.create.many";
    pub const FIND_ONE: &str = "task.find.one";
    pub const FIND_ALL: &str = "task.find.all";
    pub const UPDATE: &str = "task.update";
    pub const REMOVE: &str = "task.remove";
    pub const REMOVE_MANY: &str = "task.remove.many";

    pub const ALL: [&str; 7] = [
        CREATE,
        CREATE_MANY,
        FIND_ONE,
        FIND_ALL,
        UPDATE,
        REMOVE,
        REMOVE_MANY,
    ];
}

#[derive(Debug, Serialize, Deserialize)]
struct UpdateRequest {
    id: String,
    patch: TaskPatch,
}

#[derive(Debug, Serialize, Deserialize)]
struct RemoveRequest {
    id: String,
}

/// Serves the store vocabulary against a local store.
pub struct StoreService {
    store: Arc<dyn TaskStore>,
}

impl StoreService {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Subscribe one service instance to every store topic.
    pub fn subscribe_all(self: Arc<Self>, bus: &LocalBus) {
        for topic in topics::ALL {
            bus.subscribe(topic, self.clone());
        }
    }

    async fn dispatch(&self, topic: &str, message: Value) -> Result<Value, BusError> {
        match topic {
            topics::CREATE => {
                let result = match decode::<NewTask>(message) {
                    Ok(task) => self.store.create(task).await,
                    Err(e) => Err(e),
                };
                reply(result)
            }
            topics::CREATE_MANY => {
                let result = match decode::<Vec<NewTask>>(message) {
                    Ok(tasks) => self.store.create_many(tasks).await,
                    Err(e) => Err(e),
                };
                reply(result)
            }
            topics::FIND_ONE => {
                let result = match decode::<TaskFilter>(message) {
                    Ok(filter) => self.store.find_one(&filter).await,
                    Err(e) => Err(e),
                };
                reply(result)
            }
            topics::FIND_ALL => {
                let result = match decode::<TaskFilter>(message) {
                    Ok(filter) => self.store.find_all(&filter).await,
                    Err(e) => Err(e),
                };
                reply(result)
            }
            topics::UPDATE => {
                let result = match decode::<UpdateRequest>(message) {
                    Ok(req) => self.store.update(&req.id, req.patch).await,
                    Err(e) => Err(e),
                };
                reply(result)
            }
            topics::REMOVE => {
                let result = match decode::<RemoveRequest>(message) {
                    Ok(req) => self.store.remove(&req.id).await,
                    Err(e) => Err(e),
                };
                reply(result)
            }
            topics::REMOVE_MANY => {
                let result = match decode::<TaskFilter>(message) {
                    Ok(filter) => self.store.remove_many(&filter).await,
                    Err(e) => Err(e),
                };
                reply(result)
            }
            other => Err(BusError::NoSubscriber(other.to_string())),
        }
    }
}

#[async_trait]
impl MessageHandler for StoreService {
    async fn handle(&self, topic: &str, message: Value) -> Result<Value, BusError> {
        debug!("Store request on {}", topic);
        self.dispatch(topic, message).await
    }
}

fn decode<T: DeserializeOwned>(message: Value) -> Result<T, StoreError> {
    serde_json::from_value(message).map_err(|e| StoreError::Validation(e.to_string()))
}

fn reply<T: Serialize>(result: Result<T, StoreError>) -> Result<Value, BusError> {
    serde_json::to_value(result).map_err(|e| BusError::Codec(e.to_string()))
}

/// Task store client speaking the store vocabulary over a bus.
pub struct RemoteTaskStore {
    bus: Arc<dyn MessageBus>,
}

impl RemoteTaskStore {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    async fn call<Req, Resp>(&self, topic: &str, request: &Req) -> Result<Resp, StoreError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let message =
            serde_json::to_value(request).map_err(|e| StoreError::Validation(e.to_string()))?;
        let reply = self
            .bus
            .send(topic, message)
            .await
            .map_err(|e| StoreError::Database(format!("store request {} failed: {}", topic, e)))?;
        serde_json::from_value::<Result<Resp, StoreError>>(reply)
            .map_err(|e| StoreError::Database(format!("bad reply on {}: {}", topic, e)))?
    }
}

#[async_trait]
impl TaskStore for RemoteTaskStore {
    async fn create(&self, task: NewTask) -> Result<Task, StoreError> {
        self.call(topics::CREATE, &task).await
    }

    async fn create_many(&self, tasks: Vec<NewTask>) -> Result<Vec<Task>, StoreError> {
        self.call(topics::CREATE_MANY, &tasks).await
    }

    async fn find_one(&self, filter: &TaskFilter) -> Result<Option<Task>, StoreError> {
        self.call(topics::FIND_ONE, filter).await
    }

    async fn find_all(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        self.call(topics::FIND_ALL, filter).await
    }

    async fn update(&self, id: &str, patch: TaskPatch) -> Result<Task, StoreError> {
        let request = UpdateRequest {
            id: id.to_string(),
            patch,
        };
        self.call(topics::UPDATE, &request).await
    }

    async fn remove(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let request = RemoveRequest { id: id.to_string() };
        self.call(topics::REMOVE, &request).await
    }

    async fn remove_many(&self, filter: &TaskFilter) -> Result<usize, StoreError> {
        self.call(topics::REMOVE_MANY, filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{SqliteTaskStore, TaskStatus};
    use serde_json::json;

    fn remote() -> RemoteTaskStore {
        let bus = Arc::new(LocalBus::new());
        let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::in_memory().unwrap());
        Arc::new(StoreService::new(store)).subscribe_all(&bus);
        RemoteTaskStore::new(bus)
    }

    #[tokio::test]
    async fn test_create_and_find_over_the_bus() {
        let store = remote();
        let created = store
            .create(NewTask::pending("odm.license.download", json!({ "title": "Book" })))
            .await
            .unwrap();

        let found = store.get(&created.id).await.unwrap();
        assert_eq!(found.payload["title"], json!("Book"));
        assert_eq!(found.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_error_kinds_survive_the_trip() {
        let store = remote();

        assert!(matches!(
            store.update("missing", TaskPatch::completed()).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.remove_many(&TaskFilter::new()).await,
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            store.create_many(vec![]).await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_create_over_the_wire_requires_status() {
        let bus = Arc::new(LocalBus::new());
        let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::in_memory().unwrap());
        Arc::new(StoreService::new(store)).subscribe_all(&bus);

        let reply = bus
            .send(topics::CREATE, json!({ "topic": "odm.downloads" }))
            .await
            .unwrap();
        let result: Result<Task, StoreError> = serde_json::from_value(reply).unwrap();
        assert!(matches!(result, Err(StoreError::Validation(_))));
    }

    #[tokio::test]
    async fn test_update_and_remove_over_the_bus() {
        let store = remote();
        let task = store
            .create(NewTask::pending("encoder.book", json!({})))
            .await
            .unwrap();

        let updated = store
            .update(&task.id, TaskPatch::status(TaskStatus::InProgress).inc("remux.completed", 1))
            .await
            .unwrap();
        assert_eq!(updated.payload["remux"]["completed"], json!(1));

        let removed = store.remove(&task.id).await.unwrap();
        assert!(removed.is_some());
        assert!(store.find_one(&TaskFilter::by_id(&task.id)).await.unwrap().is_none());
    }
}
