//! Characteristics
//!
//! A characteristic is one controllable or observable property of a service,
//! holding a value of a fixed format.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::types::{Error, Result};

/// Value format of a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Bool,
    UInt8,
    Int32,
    UInt32,
    Float,
}

/// Unit attached to a numeric characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Percentage,
    ArcDegrees,
    Celsius,
}

/// Static description of a characteristic kind
#[derive(Debug, Clone, Copy)]
pub struct KindSpec {
    /// Short HomeKit type code
    pub type_code: &'static str,
    pub format: Format,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub step: Option<f64>,
    pub unit: Option<Unit>,
    pub writable: bool,
}

const fn spec(
    type_code: &'static str,
    format: Format,
    range: Option<(f64, f64, f64)>,
    unit: Option<Unit>,
    writable: bool,
) -> KindSpec {
    let (min, max, step) = match range {
        Some((min, max, step)) => (Some(min), Some(max), Some(step)),
        None => (None, None, None),
    };
    KindSpec {
        type_code,
        format,
        min,
        max,
        step,
        unit,
        writable,
    }
}

/// Characteristic types the bridge can expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacteristicKind {
    On,
    Brightness,
    Hue,
    Saturation,
    ColorTemperature,
    CurrentTemperature,
    CurrentRelativeHumidity,
    ContactSensorState,
    CarbonDioxideLevel,
    AirParticulateDensity,
    CurrentVerticalTiltAngle,
    CurrentDoorState,
    TargetDoorState,
    ObstructionDetected,
    CurrentPosition,
    TargetPosition,
}

impl CharacteristicKind {
    pub fn spec(&self) -> KindSpec {
        use CharacteristicKind::*;
        use Format::*;

        match self {
            On => spec("25", Bool, None, None, true),
            Brightness => spec("8", Int32, Some((0.0, 100.0, 1.0)), Some(Unit::Percentage), true),
            Hue => spec("13", Float, Some((0.0, 360.0, 1.0)), Some(Unit::ArcDegrees), true),
            Saturation => spec("2F", Float, Some((0.0, 100.0, 1.0)), Some(Unit::Percentage), true),
            ColorTemperature => spec("CE", UInt32, Some((140.0, 500.0, 1.0)), None, true),
            CurrentTemperature => {
                spec("11", Float, Some((0.0, 100.0, 0.1)), Some(Unit::Celsius), false)
            }
            CurrentRelativeHumidity => {
                spec("10", Float, Some((0.0, 100.0, 1.0)), Some(Unit::Percentage), false)
            }
            ContactSensorState => spec("6A", UInt8, Some((0.0, 1.0, 1.0)), None, false),
            CarbonDioxideLevel => spec("93", Float, Some((0.0, 100000.0, 100.0)), None, false),
            AirParticulateDensity => spec("64", Float, Some((0.0, 1000.0, 1.0)), None, false),
            CurrentVerticalTiltAngle => {
                spec("6E", Int32, Some((-90.0, 90.0, 1.0)), Some(Unit::ArcDegrees), false)
            }
            CurrentDoorState => spec("E", UInt8, Some((0.0, 4.0, 1.0)), None, false),
            TargetDoorState => spec("32", UInt8, Some((0.0, 1.0, 1.0)), None, true),
            ObstructionDetected => spec("24", Bool, None, None, false),
            CurrentPosition => spec("6D", UInt8, Some((0.0, 100.0, 1.0)), Some(Unit::Percentage), false),
            TargetPosition => spec("7C", UInt8, Some((0.0, 100.0, 1.0)), Some(Unit::Percentage), true),
        }
    }

    /// Value a characteristic holds before its first update
    pub fn default_value(&self) -> Value {
        let spec = self.spec();
        match spec.format {
            Format::Bool => Value::Bool(false),
            Format::Float => json!(spec.min.unwrap_or(0.0)),
            _ => json!(spec.min.unwrap_or(0.0) as i64),
        }
    }

    /// Coerce a dynamically typed value into this kind's format and range
    pub fn coerce(&self, value: &Value) -> Result<Value> {
        let spec = self.spec();

        if spec.format == Format::Bool {
            return coerce_bool(value).map(Value::Bool).ok_or_else(|| self.mismatch(value));
        }

        let number = coerce_number(value).ok_or_else(|| self.mismatch(value))?;
        let number = clamp(number, spec.min, spec.max);

        match spec.format {
            Format::Float => Ok(json!(number)),
            _ => Ok(json!(number.round() as i64)),
        }
    }

    fn mismatch(&self, value: &Value) -> Error {
        Error::Value(format!(
            "{} cannot hold {} ({:?} expected)",
            self.name(),
            value,
            self.spec().format
        ))
    }

    pub fn name(&self) -> String {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{:?}", self))
    }
}

fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "on" | "1" => Some(true),
            "false" | "off" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn coerce_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    number.filter(|f| f.is_finite())
}

fn clamp(value: f64, min: Option<f64>, max: Option<f64>) -> f64 {
    let value = min.map_or(value, |min| value.max(min));
    max.map_or(value, |max| value.min(max))
}

/// Called with `(new, old)` after a value change
pub type ValueCallback = Arc<dyn Fn(&Value, &Value) + Send + Sync>;

pub struct Characteristic {
    /// Instance id, assigned when the accessory is built
    iid: AtomicU64,
    kind: CharacteristicKind,
    description: Option<String>,
    value: RwLock<Value>,
    /// Notified on local controller writes
    write_callbacks: RwLock<Vec<ValueCallback>>,
    /// Notified on every stored change, whatever its origin
    update_callbacks: RwLock<Vec<ValueCallback>>,
}

impl Characteristic {
    pub fn new(kind: CharacteristicKind) -> Self {
        Self {
            iid: AtomicU64::new(0),
            kind,
            description: None,
            value: RwLock::new(kind.default_value()),
            write_callbacks: RwLock::new(Vec::new()),
            update_callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn kind(&self) -> CharacteristicKind {
        self.kind
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn iid(&self) -> u64 {
        self.iid.load(Ordering::Relaxed)
    }

    pub(crate) fn set_iid(&self, iid: u64) {
        self.iid.store(iid, Ordering::Relaxed);
    }

    pub fn value(&self) -> Value {
        self.value.read().clone()
    }

    /// Register a callback for writes made by a controller
    pub fn on_write(&self, callback: ValueCallback) {
        self.write_callbacks.write().push(callback);
    }

    /// Register a callback for every value change
    pub fn on_update(&self, callback: ValueCallback) {
        self.update_callbacks.write().push(callback);
    }

    #[cfg(test)]
    pub(crate) fn update_callback_count(&self) -> usize {
        self.update_callbacks.read().len()
    }

    /// Push a value from the bridge side
    ///
    /// Returns whether the stored value changed.
    pub fn update_value(&self, value: &Value) -> Result<bool> {
        let new = self.kind.coerce(value)?;
        Ok(self.store(new).is_some())
    }

    /// Apply a write coming from a local controller
    ///
    /// Write callbacks run with the coerced value even when it equals the
    /// current one.
    pub fn write_from_controller(&self, value: &Value) -> Result<()> {
        if !self.kind.spec().writable {
            return Err(Error::Value(format!("{} is read-only", self.kind.name())));
        }
        let new = self.kind.coerce(value)?;
        let old = self.store(new.clone()).unwrap_or_else(|| new.clone());

        let callbacks = self.write_callbacks.read().clone();
        for callback in callbacks {
            callback(&new, &old);
        }
        Ok(())
    }

    /// Store a coerced value, returning the previous one if it changed
    fn store(&self, new: Value) -> Option<Value> {
        let old = {
            let mut value = self.value.write();
            if *value == new {
                return None;
            }
            std::mem::replace(&mut *value, new.clone())
        };

        let callbacks = self.update_callbacks.read().clone();
        for callback in callbacks {
            callback(&new, &old);
        }
        Some(old)
    }

    /// JSON description for the accessory database
    pub fn describe(&self) -> Value {
        let spec = self.kind.spec();
        let mut perms = vec!["pr", "ev"];
        if spec.writable {
            perms.push("pw");
        }
        json!({
            "iid": self.iid(),
            "type": spec.type_code,
            "kind": self.kind.name(),
            "format": spec.format,
            "unit": spec.unit,
            "minValue": spec.min,
            "maxValue": spec.max,
            "minStep": spec.step,
            "perms": perms,
            "description": self.description,
            "value": self.value(),
        })
    }
}

impl std::fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Characteristic")
            .field("iid", &self.iid())
            .field("kind", &self.kind)
            .field("value", &self.value())
            .finish()
    }
}
