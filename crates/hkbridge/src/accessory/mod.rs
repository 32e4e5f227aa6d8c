//! Accessory Model
//!
//! In-process model of the accessory protocol: accessories own services,
//! services own characteristics, and an [`AccessoryBridge`] groups every
//! configured accessory behind one bridge accessory. A [`Transport`] serves
//! the assembled bridge to controllers on the network.

mod characteristic;
mod transport;

pub use characteristic::{
    Characteristic, CharacteristicKind, Format, KindSpec, Unit, ValueCallback,
};
pub use transport::{LogTransport, Transport, TransportConfig};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Identity metadata of an accessory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessoryInfo {
    pub name: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub firmware: String,
}

impl AccessoryInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Accessory category advertised to controllers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessoryKind {
    Other,
    Bridge,
    Fan,
    GarageDoorOpener,
    Lightbulb,
    Outlet,
    Switch,
    Thermostat,
    Sensor,
    WindowCovering,
}

impl AccessoryKind {
    /// HomeKit category number
    pub fn category(&self) -> u8 {
        match self {
            AccessoryKind::Other => 1,
            AccessoryKind::Bridge => 2,
            AccessoryKind::Fan => 3,
            AccessoryKind::GarageDoorOpener => 4,
            AccessoryKind::Lightbulb => 5,
            AccessoryKind::Outlet => 7,
            AccessoryKind::Switch => 8,
            AccessoryKind::Thermostat => 9,
            AccessoryKind::Sensor => 10,
            AccessoryKind::WindowCovering => 14,
        }
    }
}

/// Service types the bridge can expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Lightbulb,
    Switch,
    Outlet,
    Fan,
    GarageDoorOpener,
    ContactSensor,
    TemperatureSensor,
    HumiditySensor,
    CarbonDioxideSensor,
    AirQualitySensor,
    WindowCovering,
}

impl ServiceKind {
    /// Short HomeKit type code
    pub fn type_code(&self) -> &'static str {
        match self {
            ServiceKind::Lightbulb => "43",
            ServiceKind::Switch => "49",
            ServiceKind::Outlet => "47",
            ServiceKind::Fan => "40",
            ServiceKind::GarageDoorOpener => "41",
            ServiceKind::ContactSensor => "80",
            ServiceKind::TemperatureSensor => "8A",
            ServiceKind::HumiditySensor => "82",
            ServiceKind::CarbonDioxideSensor => "97",
            ServiceKind::AirQualitySensor => "8D",
            ServiceKind::WindowCovering => "8C",
        }
    }
}

/// A group of related characteristics
#[derive(Debug)]
pub struct Service {
    kind: ServiceKind,
    characteristics: Vec<Arc<Characteristic>>,
}

impl Service {
    pub fn new(kind: ServiceKind) -> Self {
        Self {
            kind,
            characteristics: Vec::new(),
        }
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn add_characteristic(&mut self, characteristic: Arc<Characteristic>) {
        self.characteristics.push(characteristic);
    }

    pub fn characteristics(&self) -> &[Arc<Characteristic>] {
        &self.characteristics
    }
}

/// A controllable device
#[derive(Debug)]
pub struct Accessory {
    /// Accessory id, assigned by the bridge
    aid: AtomicU64,
    info: AccessoryInfo,
    kind: AccessoryKind,
    services: Vec<Service>,
}

impl Accessory {
    pub fn new(info: AccessoryInfo, kind: AccessoryKind) -> Self {
        Self {
            aid: AtomicU64::new(0),
            info,
            kind,
            services: Vec::new(),
        }
    }

    /// Add a service, numbering its characteristics after the existing ones
    pub fn add_service(&mut self, service: Service) {
        let mut next = self.characteristics().map(|c| c.iid()).max().unwrap_or(1) + 1;
        for characteristic in service.characteristics() {
            characteristic.set_iid(next);
            next += 1;
        }
        self.services.push(service);
    }

    pub fn aid(&self) -> u64 {
        self.aid.load(Ordering::Relaxed)
    }

    fn set_aid(&self, aid: u64) {
        self.aid.store(aid, Ordering::Relaxed);
    }

    pub fn info(&self) -> &AccessoryInfo {
        &self.info
    }

    pub fn kind(&self) -> AccessoryKind {
        self.kind
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Every characteristic across all services
    pub fn characteristics(&self) -> impl Iterator<Item = &Arc<Characteristic>> {
        self.services.iter().flat_map(|s| s.characteristics().iter())
    }

    pub fn describe(&self) -> Value {
        json!({
            "aid": self.aid(),
            "category": self.kind.category(),
            "info": self.info,
            "services": self.services.iter().map(|s| json!({
                "type": s.kind().type_code(),
                "characteristics": s.characteristics().iter().map(|c| c.describe()).collect::<Vec<_>>(),
            })).collect::<Vec<_>>(),
        })
    }
}

/// Bridge accessory plus the accessories it exposes
///
/// The bridge takes accessory id 1; added accessories are numbered from 2
/// in insertion order.
#[derive(Debug)]
pub struct AccessoryBridge {
    bridge: Accessory,
    accessories: Vec<Arc<Accessory>>,
}

impl AccessoryBridge {
    pub fn new(info: AccessoryInfo) -> Self {
        let bridge = Accessory::new(info, AccessoryKind::Bridge);
        bridge.set_aid(1);
        Self {
            bridge,
            accessories: Vec::new(),
        }
    }

    pub fn add_accessory(&mut self, accessory: Arc<Accessory>) {
        accessory.set_aid(self.accessories.len() as u64 + 2);
        self.accessories.push(accessory);
    }

    pub fn bridge(&self) -> &Accessory {
        &self.bridge
    }

    pub fn accessories(&self) -> &[Arc<Accessory>] {
        &self.accessories
    }

    /// Find an accessory by id, the bridge included
    pub fn accessory(&self, aid: u64) -> Option<&Accessory> {
        if aid == self.bridge.aid() {
            return Some(&self.bridge);
        }
        self.accessories
            .iter()
            .find(|a| a.aid() == aid)
            .map(|a| a.as_ref())
    }

    /// Find a characteristic by accessory and instance id
    pub fn characteristic(&self, aid: u64, iid: u64) -> Option<&Arc<Characteristic>> {
        self.accessory(aid)?.characteristics().find(|c| c.iid() == iid)
    }

    /// Accessory database as served to controllers
    pub fn describe(&self) -> Value {
        let mut accessories = vec![self.bridge.describe()];
        accessories.extend(self.accessories.iter().map(|a| a.describe()));
        json!({ "accessories": accessories })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lamp() -> Accessory {
        let mut accessory = Accessory::new(AccessoryInfo::new("Lamp"), AccessoryKind::Lightbulb);
        let mut service = Service::new(ServiceKind::Lightbulb);
        service.add_characteristic(Arc::new(Characteristic::new(CharacteristicKind::On)));
        service.add_characteristic(Arc::new(Characteristic::new(CharacteristicKind::Brightness)));
        accessory.add_service(service);
        accessory
    }

    #[test]
    fn test_ids_are_assigned() {
        let mut bridge = AccessoryBridge::new(AccessoryInfo::new("Bridge"));
        bridge.add_accessory(Arc::new(lamp()));
        bridge.add_accessory(Arc::new(lamp()));

        assert_eq!(bridge.bridge().aid(), 1);
        let aids: Vec<u64> = bridge.accessories().iter().map(|a| a.aid()).collect();
        assert_eq!(aids, vec![2, 3]);

        let iids: Vec<u64> = bridge.accessories()[0].characteristics().map(|c| c.iid()).collect();
        assert_eq!(iids, vec![2, 3]);

        let on = bridge.characteristic(3, 2).unwrap();
        assert_eq!(on.kind(), CharacteristicKind::On);
        assert!(bridge.characteristic(9, 2).is_none());
    }

    #[test]
    fn test_describe() {
        let mut bridge = AccessoryBridge::new(AccessoryInfo::new("Bridge"));
        bridge.add_accessory(Arc::new(lamp()));

        let db = bridge.describe();
        let accessories = db["accessories"].as_array().unwrap();
        assert_eq!(accessories.len(), 2);
        assert_eq!(accessories[0]["category"], json!(2));
        assert_eq!(accessories[1]["info"]["name"], json!("Lamp"));
        assert_eq!(accessories[1]["services"][0]["type"], json!("43"));
        assert_eq!(
            accessories[1]["services"][0]["characteristics"][1]["format"],
            json!("int32")
        );
    }

    #[test]
    fn test_kinds_parse_from_config_names() {
        let kind: AccessoryKind = serde_json::from_value(json!("garage_door_opener")).unwrap();
        assert_eq!(kind, AccessoryKind::GarageDoorOpener);
        let kind: ServiceKind = serde_json::from_value(json!("contact_sensor")).unwrap();
        assert_eq!(kind, ServiceKind::ContactSensor);
        assert!(serde_json::from_value::<ServiceKind>(json!("toaster")).is_err());
    }
}
