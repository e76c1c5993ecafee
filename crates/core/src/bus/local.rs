//! In-process bus: one subscriber per topic, one tokio task per emitted message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::types::{BusError, MessageBus, MessageHandler};

/// In-process message bus.
///
/// Emitting to a topic without a subscriber drops the message, as an unbound
/// broker topic would.
#[derive(Default)]
pub struct LocalBus {
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    deliveries: Arc<Deliveries>,
}

#[derive(Default)]
struct Deliveries {
    in_flight: AtomicUsize,
    settled: Notify,
}

/// Counts one delivery in flight until dropped, including on handler panic.
struct InFlight(Arc<Deliveries>);

impl InFlight {
    fn start(deliveries: &Arc<Deliveries>) -> Self {
        deliveries.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(deliveries))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.0.settled.notify_waiters();
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler to a topic, replacing any previous subscriber.
    pub fn subscribe(&self, topic: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let topic = topic.into();
        debug!("Subscribing handler to topic {}", topic);
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(topic, handler);
    }

    /// Remove the subscriber of a topic. Returns whether one existed.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(topic)
            .is_some()
    }

    /// Number of emitted messages whose handler has not returned yet.
    pub fn in_flight(&self) -> usize {
        self.deliveries.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no emitted message is being handled.
    pub async fn wait_idle(&self) {
        loop {
            let settled = self.deliveries.settled.notified();
            if self.in_flight() == 0 {
                return;
            }
            settled.await;
        }
    }

    fn handler(&self, topic: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(topic)
            .cloned()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn emit(&self, topic: &str, message: Value) -> Result<(), BusError> {
        let Some(handler) = self.handler(topic) else {
            warn!("Dropping message for topic {} with no subscriber", topic);
            return Ok(());
        };

        let in_flight = InFlight::start(&self.deliveries);
        let topic = topic.to_string();
        tokio::spawn(async move {
            let _in_flight = in_flight;
            if let Err(e) = handler.handle(&topic, message).await {
                warn!("Handler for topic {} failed: {}", topic, e);
            }
        });
        Ok(())
    }

    async fn send(&self, topic: &str, message: Value) -> Result<Value, BusError> {
        let handler = self
            .handler(topic)
            .ok_or_else(|| BusError::NoSubscriber(topic.to_string()))?;
        handler.handle(topic, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Echo {
        seen: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, topic: &str, message: Value) -> Result<Value, BusError> {
            self.seen
                .lock()
                .await
                .push((topic.to_string(), message.clone()));
            Ok(json!({ "echo": message }))
        }
    }

    #[tokio::test]
    async fn test_send_returns_reply() {
        let bus = LocalBus::new();
        bus.subscribe("task.find.one", Arc::new(Echo::default()));

        let reply = bus.send("task.find.one", json!({ "id": "a" })).await.unwrap();
        assert_eq!(reply, json!({ "echo": { "id": "a" } }));
    }

    #[tokio::test]
    async fn test_send_without_subscriber_fails() {
        let bus = LocalBus::new();
        let result = bus.send("nobody", json!({})).await;
        assert_eq!(result, Err(BusError::NoSubscriber("nobody".to_string())));
    }

    #[tokio::test]
    async fn test_emit_delivers_in_background() {
        let bus = LocalBus::new();
        let echo = Arc::new(Echo::default());
        bus.subscribe("odm.process", echo.clone());

        bus.emit("odm.process", json!(1)).await.unwrap();
        bus.emit("odm.process", json!(2)).await.unwrap();
        bus.wait_idle().await;

        let seen = echo.seen.lock().await;
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(topic, _)| topic == "odm.process"));
    }

    #[tokio::test]
    async fn test_emit_without_subscriber_is_dropped() {
        let bus = LocalBus::new();
        assert!(bus.emit("nobody", json!({})).await.is_ok());
        assert_eq!(bus.in_flight(), 0);
    }

    struct Panicking;

    #[async_trait]
    impl MessageHandler for Panicking {
        async fn handle(&self, _topic: &str, _message: Value) -> Result<Value, BusError> {
            panic!("handler blew up");
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_still_settles() {
        let bus = LocalBus::new();
        bus.subscribe("odm.process", Arc::new(Panicking));

        bus.emit("odm.process", json!({})).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), bus.wait_idle())
            .await
            .expect("wait_idle hung after a handler panic");
        assert_eq!(bus.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = LocalBus::new();
        bus.subscribe("a", Arc::new(Echo::default()));
        assert!(bus.unsubscribe("a"));
        assert!(!bus.unsubscribe("a"));
    }
}
