//! Bridge Configuration
//!
//! Defines the structure of the bridge's TOML configuration file and loads it
//! from disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::accessory::{AccessoryInfo, AccessoryKind, CharacteristicKind, ServiceKind};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file does not exist: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Bridge configuration (the file passed on the command line)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Name of the bridge accessory
    #[serde(default = "default_name")]
    pub name: String,
    /// Pairing PIN, 8 digits
    #[serde(default)]
    pub pin: String,
    /// Fixed transport port
    pub port: Option<u16>,
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    /// Upper bound for a blocking get, 0 or absent waits forever
    #[serde(default)]
    pub fetch_timeout_ms: u64,
    pub mqtt: MqttConfig,
    #[serde(default, rename = "accessory")]
    pub accessories: Vec<AccessoryConfig>,
}

fn default_name() -> String {
    "MQTT Bridge".to_string()
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./db")
}

/// Broker connection settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub servers: Vec<String>,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_keep_alive() -> u64 {
    30
}

impl MqttConfig {
    pub fn client_id(&self) -> String {
        self.client_id.clone().unwrap_or_else(|| "hkbridge".to_string())
    }
}

/// One accessory exposed through the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessoryConfig {
    #[serde(rename = "type")]
    pub kind: AccessoryKind,
    #[serde(flatten)]
    pub info: AccessoryInfo,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceConfig>,
}

/// One service of an accessory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    #[serde(default, rename = "characteristic")]
    pub characteristics: Vec<CharacteristicConfig>,
}

/// One characteristic and the snippets backing it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacteristicConfig {
    #[serde(rename = "type")]
    pub kind: CharacteristicKind,
    pub description: Option<String>,
    /// Snippet producing the current value
    pub get: Option<String>,
    /// Snippet run with `value` when a controller writes
    pub set: Option<String>,
}

impl BridgeConfig {
    /// Load, apply environment overrides and validate
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        info!("Loading configuration from: {}", path.display());
        let content = fs::read_to_string(path).await?;

        let mut config: BridgeConfig = toml::from_str(&content)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;

        info!(
            "Loaded {} accessories, {} characteristics",
            config.accessories.len(),
            config.characteristic_count()
        );
        Ok(config)
    }

    /// Parse and validate without touching the environment
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Replace fields with `HKBRIDGE_*` variables found through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(servers) = lookup("HKBRIDGE_MQTT_SERVERS") {
            debug!("Overriding MQTT servers from environment");
            self.mqtt.servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(username) = lookup("HKBRIDGE_MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = lookup("HKBRIDGE_MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(pin) = lookup("HKBRIDGE_PIN") {
            self.pin = pin;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accessories.is_empty() {
            return Err(ConfigError::Invalid("no accessories configured".to_string()));
        }
        if self.mqtt.servers.is_empty() {
            return Err(ConfigError::Invalid("no MQTT servers configured".to_string()));
        }
        if self.pin.len() != 8 || !self.pin.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::Invalid(format!(
                "pin must be 8 digits, got {:?}",
                self.pin
            )));
        }
        for accessory in &self.accessories {
            if accessory.info.name.trim().is_empty() {
                return Err(ConfigError::Invalid("accessory without a name".to_string()));
            }
        }
        Ok(())
    }

    /// `None` when gets may wait forever
    pub fn fetch_timeout(&self) -> Option<Duration> {
        (self.fetch_timeout_ms > 0).then(|| Duration::from_millis(self.fetch_timeout_ms))
    }

    fn characteristic_count(&self) -> usize {
        self.accessories
            .iter()
            .flat_map(|a| &a.services)
            .map(|s| s.characteristics.len())
            .sum()
    }
}
