//! Bridge Context
//!
//! [`Bridge`] owns everything one bridge instance needs: the bus client, the
//! state cache, the dispatcher, the sandbox and the devices built from
//! configuration. Nothing is process global, so several bridges can run side
//! by side.

pub mod dispatch;
pub mod fetch;

pub use dispatch::{Dispatcher, Listener, ListenerId};
pub use fetch::Fetcher;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Weak};
use std::thread;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

use crate::accessory::{AccessoryBridge, AccessoryInfo, Transport, TransportConfig};
use crate::bus::{BusClient, Message, MessageHandler, QoS};
use crate::cache::StateCache;
use crate::config::BridgeConfig;
use crate::device::Device;
use crate::js::{Sandbox, ScriptHost};
use crate::topic::{self, Suffix};
use crate::types::{Error, Result};

/// The host side of the snippet built-ins
struct BridgeCore {
    bus: Arc<dyn BusClient>,
    cache: StateCache,
    fetcher: Arc<Fetcher>,
}

impl ScriptHost for BridgeCore {
    fn peek(&self, key: &str) -> Option<Value> {
        self.cache.get(key)
    }

    fn get(&self, key: &str) -> Result<Value> {
        self.fetcher.fetch(key)
    }

    fn set(&self, key: &str, value: Value) {
        let payload = match serde_json::to_vec(&value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Cannot encode value for {}: {}", key, e);
                return;
            }
        };
        self.cache.insert(key, value);

        let topic = topic::topic_for(key, Suffix::Set);
        if let Err(e) = self.bus.publish(&topic, Bytes::from(payload), QoS::AtLeastOnce, false) {
            warn!(topic = %topic, "Set publish failed: {}", e);
        }
    }
}

struct BridgeInner {
    bus: Arc<dyn BusClient>,
    cache: StateCache,
    dispatcher: Arc<Dispatcher>,
    fetcher: Arc<Fetcher>,
    sandbox: Arc<Sandbox>,
    devices: Vec<Device>,
    accessories: Arc<AccessoryBridge>,
    transport: Arc<dyn Transport>,
    transport_config: TransportConfig,
    /// Set once shutdown begins; inbound messages are dropped from then on
    closed: AtomicBool,
    /// Holds at most one pending resync request
    resync_tx: SyncSender<()>,
    /// Taken by the resync worker when the bridge starts
    resync_rx: Mutex<Option<Receiver<()>>>,
}

impl BridgeInner {
    fn handle_message(&self, message: Message) {
        if self.closed.load(Ordering::SeqCst) {
            trace!("Dropping {} after shutdown", message.topic);
            return;
        }
        self.dispatcher.dispatch(message);
        self.schedule_resync();
    }

    /// Mark the devices dirty
    ///
    /// A request made while a pass runs leaves exactly one more pass queued;
    /// further requests fold into it.
    fn schedule_resync(&self) {
        match self.resync_tx.try_send(()) {
            Ok(()) => trace!("Resync queued"),
            Err(TrySendError::Full(())) => trace!("Resync already queued"),
            Err(TrySendError::Disconnected(())) => debug!("Resync worker gone"),
        }
    }

    fn sync(&self) -> Result<()> {
        let mut last = Ok(());
        for device in &self.devices {
            if let Err(e) = device.sync() {
                last = Err(e);
            }
        }
        last
    }
}

/// Run resync passes one at a time until the bridge closes or is dropped
fn resync_worker(inner: Weak<BridgeInner>, requests: Receiver<()>) {
    while requests.recv().is_ok() {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        if let Err(e) = inner.sync() {
            debug!("Resync finished with errors: {}", e);
        }
    }
    debug!("Resync worker stopped");
}

#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    /// Build the sandbox, the devices and the accessory bridge
    ///
    /// Must be called within a Tokio runtime. Fails on configuration errors,
    /// including snippets that do not parse.
    pub fn new(
        config: &BridgeConfig,
        bus: Arc<dyn BusClient>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| Error::Runtime(e.to_string()))?;

        let cache = StateCache::new();
        let dispatcher = Arc::new(Dispatcher::new(bus.clone(), cache.clone(), runtime.clone()));
        let fetcher = Arc::new(Fetcher::new(dispatcher.clone(), config.fetch_timeout()));
        let core = Arc::new(BridgeCore {
            bus: bus.clone(),
            cache: cache.clone(),
            fetcher: fetcher.clone(),
        });
        let sandbox = Arc::new(Sandbox::new(core)?);

        let mut accessories = AccessoryBridge::new(AccessoryInfo::new(config.name.clone()));
        let mut devices = Vec::with_capacity(config.accessories.len());
        for accessory_config in &config.accessories {
            let device = Device::build(accessory_config, sandbox.clone(), runtime.clone())?;
            debug!("Device {} ready", device.name());
            accessories.add_accessory(device.accessory().clone());
            devices.push(device);
        }

        info!("Bridge {} built with {} devices", config.name, devices.len());

        let (resync_tx, resync_rx) = mpsc::sync_channel(1);

        Ok(Self {
            inner: Arc::new(BridgeInner {
                bus,
                cache,
                dispatcher,
                fetcher,
                sandbox,
                devices,
                accessories: Arc::new(accessories),
                transport,
                transport_config: TransportConfig {
                    pin: config.pin.clone(),
                    port: config.port,
                    storage_path: config.storage_path.clone(),
                },
                closed: AtomicBool::new(false),
                resync_tx,
                resync_rx: Mutex::new(Some(resync_rx)),
            }),
        })
    }

    /// Connect the bus, run the first sync and start the transport
    pub async fn start(&self) -> Result<()> {
        let requests = self
            .inner
            .resync_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Runtime("bridge already started".to_string()))?;
        let worker = Arc::downgrade(&self.inner);
        thread::Builder::new()
            .name("hkbridge-resync".to_string())
            .spawn(move || resync_worker(worker, requests))?;

        let weak: Weak<BridgeInner> = Arc::downgrade(&self.inner);
        let handler: MessageHandler = Arc::new(move |message: Message| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_message(message);
            }
        });
        self.inner.bus.connect(handler).await?;
        info!("Bus connected");

        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.sync())
            .await
            .map_err(|e| Error::Runtime(e.to_string()))??;
        info!("Initial sync complete");

        self.inner
            .transport
            .start(self.inner.accessories.clone(), &self.inner.transport_config)
            .await?;
        info!("Bridge started");
        Ok(())
    }

    /// Stop taking messages, disconnect the bus, then stop the transport
    ///
    /// Gets still waiting for a status message fail with a runtime error, so
    /// no resync or set snippet outlives the shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down bridge");
        self.inner.fetcher.close();
        // Wake the resync worker so it sees the closed flag
        self.inner.schedule_resync();

        let disconnected = self.inner.bus.disconnect().await;
        if let Err(e) = &disconnected {
            warn!("Bus disconnect failed: {}", e);
        }
        let stopped = self.inner.transport.stop().await;

        disconnected.and(stopped)
    }

    /// Resync every device, returning the last error
    ///
    /// Blocks, so call it from a blocking context.
    pub fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    /// Single entry point for inbound bus messages
    pub fn handle_message(&self, message: Message) {
        self.inner.handle_message(message);
    }

    pub fn cache(&self) -> &StateCache {
        &self.inner.cache
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.inner.sandbox
    }

    pub fn accessories(&self) -> &Arc<AccessoryBridge> {
        &self.inner.accessories
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessory::{CharacteristicKind, LogTransport};
    use crate::bus::MemoryBus;
    use crate::js::Scope;
    use serde_json::json;
    use std::time::{Duration, Instant};

    const SWITCH: &str = r#"
        pin = "00102003"

        [mqtt]
        servers = ["localhost"]

        [[accessory]]
        type = "switch"
        name = "Kitchen"

          [[accessory.service]]
          type = "switch"

            [[accessory.service.characteristic]]
            type = "on"
            get = 'get("kitchen/light")'
            set = 'set("kitchen/light", value)'
    "#;

    fn bridge(config: &str) -> (Arc<MemoryBus>, Arc<LogTransport>, Bridge) {
        let config = BridgeConfig::parse(config).unwrap();
        let bus = Arc::new(MemoryBus::new());
        let transport = Arc::new(LogTransport::new());
        let bridge = Bridge::new(&config, bus.clone(), transport.clone()).unwrap();
        (bus, transport, bridge)
    }

    async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while !condition() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_switch_end_to_end() {
        let (bus, transport, bridge) = bridge(SWITCH);

        let starting = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.start().await })
        };

        // The first sync asks for the light's state
        assert!(bus.wait_for_publishes("kitchen/light/get", 1, Duration::from_secs(2)).await);
        assert!(bus.subscriptions().contains(&"kitchen/light/status".to_string()));
        bus.inject("kitchen/light/status", "true");

        starting.await.unwrap().unwrap();
        assert!(transport.is_running());

        let on = bridge.accessories().characteristic(2, 2).unwrap().clone();
        assert_eq!(on.kind(), CharacteristicKind::On);
        assert_eq!(on.value(), json!(true));

        on.write_from_controller(&json!(false)).unwrap();
        assert!(bus.wait_for_publishes("kitchen/light/set", 1, Duration::from_secs(2)).await);

        let published = bus.published_to("kitchen/light/set");
        assert_eq!(published[0].payload, Bytes::from("false"));
        assert_eq!(published[0].qos, QoS::AtLeastOnce);
        assert!(!published[0].retain);
        assert_eq!(bridge.cache().get("kitchen/light"), Some(json!(false)));

        // A later status update reaches the accessory through a resync
        bus.inject("kitchen/light/status", "true");
        assert!(wait_until(Duration::from_secs(2), || on.value() == json!(true)).await);

        bridge.shutdown().await.unwrap();
        assert!(!bus.is_connected());
        assert!(!transport.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cached_status_needs_no_request() {
        let (bus, _transport, bridge) = bridge(SWITCH);
        bus.connect(Arc::new({
            let bridge = bridge.clone();
            move |message: Message| bridge.handle_message(message)
        }))
        .await
        .unwrap();

        bus.inject("sensor/temp/status", "42");
        assert_eq!(bridge.cache().get("sensor/temp"), Some(json!(42)));

        let sandbox = bridge.sandbox().clone();
        let value = tokio::task::spawn_blocking(move || {
            sandbox.execute(r#"get("sensor/temp")"#, &Scope::new())
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(value, json!(42));
        assert!(bus.published_to("sensor/temp/get").is_empty());

        bridge.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_releases_pending_get() {
        let (bus, _transport, bridge) = bridge(SWITCH);
        bridge.cache().insert("kitchen/light", json!(true));
        bridge.start().await.unwrap();

        // An undecodable status evicts the key, so the resync has to ask
        bus.inject("kitchen/light/status", "garbage");
        assert!(bus.wait_for_publishes("kitchen/light/get", 1, Duration::from_secs(2)).await);

        let sandbox = bridge.sandbox().clone();
        let pending = tokio::task::spawn_blocking(move || {
            sandbox.execute(r#"get("kitchen/light")"#, &Scope::new())
        });
        assert!(bus.wait_for_publishes("kitchen/light/get", 2, Duration::from_secs(2)).await);

        tokio::time::timeout(Duration::from_secs(2), bridge.shutdown())
            .await
            .unwrap()
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resyncs_coalesce_while_get_pending() {
        let (bus, _transport, bridge) = bridge(SWITCH);
        bridge.cache().insert("kitchen/light", json!(true));
        bridge.start().await.unwrap();

        bus.inject("kitchen/light/status", "garbage");
        assert!(bus.wait_for_publishes("kitchen/light/get", 1, Duration::from_secs(2)).await);

        for i in 0..20 {
            bus.inject("hall/motion/status", i.to_string());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(bus.published_to("kitchen/light/get").len(), 1);

        // Controller writes still go out while the resync waits
        let on = bridge.accessories().characteristic(2, 2).unwrap().clone();
        on.write_from_controller(&json!(false)).unwrap();
        assert!(bus.wait_for_publishes("kitchen/light/set", 1, Duration::from_secs(2)).await);

        // Releasing the wait runs the one queued pass from the cache
        bus.inject("kitchen/light/status", "true");
        assert!(wait_until(Duration::from_secs(2), || on.value() == json!(true)).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bus.published_to("kitchen/light/get").len(), 1);

        bridge.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_partial_sync_failure() {
        let config = format!(
            "{}{}",
            SWITCH,
            r#"
        [[accessory]]
        type = "sensor"
        name = "Kitchen Climate"

          [[accessory.service]]
          type = "temperature_sensor"

            [[accessory.service.characteristic]]
            type = "current_temperature"
            get = 'throw new Error("sensor offline")'

          [[accessory.service]]
          type = "humidity_sensor"

            [[accessory.service.characteristic]]
            type = "current_relative_humidity"
            get = 'get("kitchen/humidity")'
        "#
        );
        let (_bus, _transport, bridge) = bridge(&config);
        bridge.cache().insert("kitchen/light", json!(true));
        bridge.cache().insert("kitchen/humidity", json!(55.5));

        let syncing = bridge.clone();
        let result = tokio::task::spawn_blocking(move || syncing.sync()).await.unwrap();
        assert!(matches!(result, Err(Error::Script(msg)) if msg.contains("sensor offline")));

        let humidity = bridge.accessories().characteristic(3, 3).unwrap();
        assert_eq!(humidity.kind(), CharacteristicKind::CurrentRelativeHumidity);
        assert_eq!(humidity.value(), json!(55.5));
        assert_eq!(bridge.accessories().characteristic(2, 2).unwrap().value(), json!(true));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_messages_dropped_after_shutdown() {
        let (bus, _transport, bridge) = bridge(SWITCH);
        bridge.cache().insert("kitchen/light", json!(false));
        bridge.start().await.unwrap();

        bridge.shutdown().await.unwrap();
        assert!(bridge.is_closed());

        bridge.handle_message(Message::new("kitchen/light/status", "true"));
        assert_eq!(bridge.cache().get("kitchen/light"), Some(json!(false)));
        assert!(bus.published_to("kitchen/light/get").is_empty());
    }

    #[tokio::test]
    async fn test_bad_snippet_fails_build() {
        let config = SWITCH.replace(r#"get("kitchen/light")"#, r#"get("kitchen/light""#);
        let config = BridgeConfig::parse(&config).unwrap();

        let result = Bridge::new(
            &config,
            Arc::new(MemoryBus::new()),
            Arc::new(LogTransport::new()),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
