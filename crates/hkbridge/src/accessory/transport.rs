//! Transport seam
//!
//! A transport advertises the assembled bridge on the local network and
//! serves controller reads and writes against it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use super::AccessoryBridge;
use crate::types::{Error, Result};

/// Settings handed to a transport at start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Pairing PIN, 8 digits
    pub pin: String,
    /// Fixed listening port, random when absent
    pub port: Option<u16>,
    /// Directory for pairing state
    pub storage_path: PathBuf,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self, bridge: Arc<AccessoryBridge>, config: &TransportConfig) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

/// Transport that only logs
///
/// Prints the accessory database at start and logs every value change while
/// running. Change loggers are attached once per bridge and stay silent
/// between a stop and the next start.
#[derive(Default)]
pub struct LogTransport {
    bridge: Mutex<Option<Arc<AccessoryBridge>>>,
    hooked: Mutex<Option<Arc<AccessoryBridge>>>,
    active: Arc<AtomicBool>,
}

impl LogTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.bridge.lock().is_some()
    }

    fn hook(&self, bridge: &Arc<AccessoryBridge>) {
        let mut hooked = self.hooked.lock();
        if hooked.as_ref().is_some_and(|h| Arc::ptr_eq(h, bridge)) {
            return;
        }

        for accessory in bridge.accessories() {
            let aid = accessory.aid();
            let name = accessory.info().name.clone();
            for characteristic in accessory.characteristics() {
                let iid = characteristic.iid();
                let kind = characteristic.kind().name();
                let name = name.clone();
                let active = self.active.clone();
                characteristic.on_update(Arc::new(move |new: &Value, old: &Value| {
                    if active.load(Ordering::SeqCst) {
                        debug!(aid, iid, "{} {} changed {} -> {}", name, kind, old, new);
                    }
                }));
            }
        }
        *hooked = Some(bridge.clone());
    }
}

#[async_trait]
impl Transport for LogTransport {
    async fn start(&self, bridge: Arc<AccessoryBridge>, config: &TransportConfig) -> Result<()> {
        let mut running = self.bridge.lock();
        if running.is_some() {
            return Err(Error::Transport("transport already started".to_string()));
        }

        self.hook(&bridge);
        self.active.store(true, Ordering::SeqCst);

        info!(
            "Serving {} accessories (pin {}, port {}, storage {})",
            bridge.accessories().len(),
            config.pin,
            config
                .port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "auto".to_string()),
            config.storage_path.display()
        );
        debug!("Accessory database: {}", bridge.describe());

        *running = Some(bridge);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        if self.bridge.lock().take().is_some() {
            info!("Transport stopped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessory::{
        Accessory, AccessoryInfo, AccessoryKind, Characteristic, CharacteristicKind, Service,
        ServiceKind,
    };

    fn config() -> TransportConfig {
        TransportConfig {
            pin: "00102003".to_string(),
            port: None,
            storage_path: PathBuf::from("./db"),
        }
    }

    #[tokio::test]
    async fn test_start_stop() {
        let transport = LogTransport::new();
        let bridge = Arc::new(AccessoryBridge::new(AccessoryInfo::new("Bridge")));

        transport.start(bridge.clone(), &config()).await.unwrap();
        assert!(transport.is_running());
        assert!(transport.start(bridge, &config()).await.is_err());

        transport.stop().await.unwrap();
        assert!(!transport.is_running());
        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_keeps_one_logger() {
        let mut service = Service::new(ServiceKind::Switch);
        service.add_characteristic(Arc::new(Characteristic::new(CharacteristicKind::On)));
        let mut accessory = Accessory::new(AccessoryInfo::new("Kitchen"), AccessoryKind::Switch);
        accessory.add_service(service);

        let mut bridge = AccessoryBridge::new(AccessoryInfo::new("Bridge"));
        bridge.add_accessory(Arc::new(accessory));
        let bridge = Arc::new(bridge);
        let on = bridge.characteristic(2, 2).unwrap().clone();

        let transport = LogTransport::new();
        for _ in 0..3 {
            transport.start(bridge.clone(), &config()).await.unwrap();
            transport.stop().await.unwrap();
        }
        assert_eq!(on.update_callback_count(), 1);

        transport.start(bridge, &config()).await.unwrap();
        assert!(on.update_value(&serde_json::json!(true)).unwrap());
        assert_eq!(on.update_callback_count(), 1);
    }
}
