//! Message Bus
//!
//! The bridge reaches the publish/subscribe bus only through [`BusClient`].
//! [`MqttBus`] talks to a real broker, [`MemoryBus`] is an in-process
//! loopback that records traffic.

mod memory;
pub mod mqtt;

pub use memory::{MemoryBus, Published};
pub use mqtt::MqttBus;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::types::Result;

/// Delivery guarantee requested for a publish or subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// An inbound bus message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Single entry point the bus client calls for every inbound message
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Publish/subscribe primitives consumed by the bridge
///
/// `publish`, `subscribe` and `unsubscribe` only hand the request to the
/// client; they do not wait for the broker to acknowledge it. An `Err` means
/// the request could not be queued at all.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Connect and start delivering inbound messages to `handler`
    async fn connect(&self, handler: MessageHandler) -> Result<()>;

    /// Stop delivering messages and close the connection
    async fn disconnect(&self) -> Result<()>;

    fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<()>;

    fn subscribe(&self, pattern: &str, qos: QoS) -> Result<()>;

    fn unsubscribe(&self, pattern: &str) -> Result<()>;
}
