//! In-process bus that records traffic and lets callers inject messages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{BusClient, Message, MessageHandler, QoS};
use crate::types::{Error, Result};

/// A publish recorded by [`MemoryBus`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Default)]
pub struct MemoryBus {
    handler: Mutex<Option<MessageHandler>>,
    published: Mutex<Vec<Published>>,
    subscriptions: Mutex<Vec<String>>,
    unsubscriptions: Mutex<Vec<String>>,
    fail_subscribe: AtomicBool,
    fail_publish: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a message as if it came from the broker
    ///
    /// Dropped when no handler is connected.
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(Message::new(topic, payload));
        }
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().clone()
    }

    /// Publishes recorded for one topic
    pub fn published_to(&self, topic: &str) -> Vec<Published> {
        self.published
            .lock()
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    /// Patterns passed to `subscribe`, in call order
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        self.unsubscriptions.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.handler.lock().is_some()
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Wait until at least `count` publishes to `topic` were recorded
    pub async fn wait_for_publishes(&self, topic: &str, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.published_to(topic).len() >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl BusClient for MemoryBus {
    async fn connect(&self, handler: MessageHandler) -> Result<()> {
        *self.handler.lock() = Some(handler);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.handler.lock().take();
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(Error::Bus(format!("publish to {} refused", topic)));
        }
        self.published.lock().push(Published {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    fn subscribe(&self, pattern: &str, _qos: QoS) -> Result<()> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(Error::Bus(format!("subscribe to {} refused", pattern)));
        }
        self.subscriptions.lock().push(pattern.to_string());
        Ok(())
    }

    fn unsubscribe(&self, pattern: &str) -> Result<()> {
        self.unsubscriptions.lock().push(pattern.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_inject_reaches_handler() {
        let bus = MemoryBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        // Not connected yet: dropped
        bus.inject("a/status", "1");

        let sink = seen.clone();
        bus.connect(Arc::new(move |msg: Message| sink.lock().push(msg)))
            .await
            .unwrap();
        bus.inject("a/status", "2");

        assert_eq!(*seen.lock(), vec![Message::new("a/status", "2")]);

        bus.disconnect().await.unwrap();
        assert!(!bus.is_connected());
    }

    #[test]
    fn test_records_traffic() {
        let bus = MemoryBus::new();
        bus.subscribe("a/#", QoS::AtLeastOnce).unwrap();
        bus.publish("a/get", Bytes::new(), QoS::AtMostOnce, false).unwrap();

        assert_eq!(bus.subscriptions(), vec!["a/#"]);
        assert_eq!(bus.published_to("a/get").len(), 1);

        bus.set_fail_publish(true);
        assert!(bus.publish("a/get", Bytes::new(), QoS::AtMostOnce, false).is_err());
        assert_eq!(bus.published().len(), 1);
    }
}
