//! MQTT Bus
//!
//! [`BusClient`] over an `rumqttc` connection. The event loop runs on a Tokio
//! task and feeds every inbound publish to the bridge's message handler.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{BusClient, Message, MessageHandler, QoS};
use crate::config::MqttConfig;
use crate::types::{Error, Result};

const DEFAULT_PORT: u16 = 1883;
const REQUEST_CAPACITY: usize = 256;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// Parse a broker address of the form `tcp://host:port`, `mqtt://host` or `host:port`
pub fn parse_server(server: &str) -> Result<(String, u16)> {
    let rest = server
        .strip_prefix("tcp://")
        .or_else(|| server.strip_prefix("mqtt://"))
        .unwrap_or(server)
        .trim_end_matches('/');

    if rest.is_empty() {
        return Err(Error::Config(format!("invalid MQTT server '{}'", server)));
    }

    match rest.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse()
                .map_err(|_| Error::Config(format!("invalid port in MQTT server '{}'", server)))?;
            Ok((host.to_string(), port))
        }
        Some(_) => Err(Error::Config(format!("invalid MQTT server '{}'", server))),
        None => Ok((rest.to_string(), DEFAULT_PORT)),
    }
}

/// MQTT broker connection
pub struct MqttBus {
    client: AsyncClient,
    /// Taken by the event loop task on connect
    eventloop: Mutex<Option<EventLoop>>,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Patterns to restore after the broker drops the session
    patterns: std::sync::Arc<Mutex<BTreeSet<String>>>,
}

impl MqttBus {
    /// Create a client for the first configured server (not connected yet)
    pub fn new(config: &MqttConfig) -> Result<Self> {
        let server = config
            .servers
            .first()
            .ok_or_else(|| Error::Config("no MQTT servers configured".to_string()))?;
        if config.servers.len() > 1 {
            warn!("Only the first MQTT server is used ({})", server);
        }
        let (host, port) = parse_server(server)?;

        let mut options = MqttOptions::new(config.client_id(), host, port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.as_deref().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        Ok(Self {
            client,
            eventloop: Mutex::new(Some(eventloop)),
            task: Mutex::new(None),
            patterns: Default::default(),
        })
    }

    async fn run(
        mut eventloop: EventLoop,
        client: AsyncClient,
        patterns: std::sync::Arc<Mutex<BTreeSet<String>>>,
        handler: MessageHandler,
        ready: oneshot::Sender<Result<()>>,
    ) {
        let mut ready = Some(ready);
        let mut connected_once = false;

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("Connected to MQTT broker ({:?})", ack.code);
                    if connected_once && !ack.session_present {
                        let restore: Vec<String> = patterns.lock().iter().cloned().collect();
                        for pattern in restore {
                            debug!("Restoring subscription to {}", pattern);
                            if let Err(e) = client.try_subscribe(pattern.as_str(), rumqttc::QoS::AtLeastOnce) {
                                warn!("Failed to restore subscription to {}: {}", pattern, e);
                            }
                        }
                    }
                    connected_once = true;
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Ok(()));
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    trace!("MQTT message on {}", publish.topic);
                    handler(Message {
                        topic: publish.topic,
                        payload: publish.payload,
                    });
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    info!("MQTT broker closed the connection");
                }
                Ok(_) => {}
                Err(e) => {
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(Error::Bus(format!("MQTT connection failed: {}", e))));
                        return;
                    }
                    warn!("MQTT connection error: {} (retrying)", e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}

#[async_trait]
impl BusClient for MqttBus {
    async fn connect(&self, handler: MessageHandler) -> Result<()> {
        let eventloop = self
            .eventloop
            .lock()
            .take()
            .ok_or_else(|| Error::Bus("MQTT client already connected".to_string()))?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(Self::run(
            eventloop,
            self.client.clone(),
            self.patterns.clone(),
            handler,
            ready_tx,
        ));
        *self.task.lock() = Some(task);

        ready_rx
            .await
            .map_err(|_| Error::Bus("MQTT event loop stopped".to_string()))?
    }

    async fn disconnect(&self) -> Result<()> {
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect request failed: {}", e);
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<()> {
        self.client
            .try_publish(topic, qos.into(), retain, payload.to_vec())
            .map_err(|e| Error::Bus(format!("publish to {} failed: {}", topic, e)))
    }

    fn subscribe(&self, pattern: &str, qos: QoS) -> Result<()> {
        self.client
            .try_subscribe(pattern, qos.into())
            .map_err(|e| Error::Bus(format!("subscribe to {} failed: {}", pattern, e)))?;
        self.patterns.lock().insert(pattern.to_string());
        Ok(())
    }

    fn unsubscribe(&self, pattern: &str) -> Result<()> {
        self.patterns.lock().remove(pattern);
        self.client
            .try_unsubscribe(pattern)
            .map_err(|e| Error::Bus(format!("unsubscribe from {} failed: {}", pattern, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server() {
        assert_eq!(parse_server("tcp://localhost:1883").unwrap(), ("localhost".to_string(), 1883));
        assert_eq!(parse_server("mqtt://broker.lan").unwrap(), ("broker.lan".to_string(), 1883));
        assert_eq!(parse_server("10.0.0.2:8883").unwrap(), ("10.0.0.2".to_string(), 8883));
        assert!(parse_server("tcp://").is_err());
        assert!(parse_server("tcp://host:notaport").is_err());
        assert!(parse_server(":1883").is_err());
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(rumqttc::QoS::from(QoS::AtMostOnce), rumqttc::QoS::AtMostOnce);
        assert_eq!(rumqttc::QoS::from(QoS::AtLeastOnce), rumqttc::QoS::AtLeastOnce);
        assert_eq!(rumqttc::QoS::from(QoS::ExactlyOnce), rumqttc::QoS::ExactlyOnce);
    }
}
