//! hkbridge - MQTT to HomeKit bridge
//!
//! This crate provides the bridging core:
//! - Topic conventions and a cached view of bus state
//! - A dispatcher fanning inbound messages out to listeners
//! - A blocking get built on the get/status round trip
//! - A shared QuickJS sandbox running per characteristic snippets
//! - Device bindings wiring snippets to accessory characteristics

// Topic naming and range mapping
pub mod topic;

// Last known value per key
pub mod cache;

// Message bus seam, loopback and MQTT clients
pub mod bus;

// Dispatcher, blocking get and the bridge context
pub mod bridge;

// Snippet sandbox
pub mod js;

// Accessories, services, characteristics and the transport seam
pub mod accessory;

// Snippet bindings per configured accessory
pub mod device;

// TOML configuration
pub mod config;

pub mod types;

pub use bridge::Bridge;
pub use types::*;
