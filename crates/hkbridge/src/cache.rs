//! State Cache
//!
//! Last known value per logical key, fed by status messages and `set` calls.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::trace;

/// Shared mapping from logical key to last decoded value
///
/// Cloning is cheap and every clone sees the same entries. Entries never
/// expire.
#[derive(Debug, Clone, Default)]
pub struct StateCache {
    values: Arc<DashMap<String, Value>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the cached value for a key
    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|entry| entry.value().clone())
    }

    /// Overwrite the value for a key
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        trace!("cache {} = {}", key, value);
        self.values.insert(key, value);
    }

    /// Drop the value for a key, leaving it absent
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.remove(key).map(|(_, value)| value)
    }

    /// Decode a status payload and store it under `key`
    ///
    /// A payload that is not valid JSON removes the entry instead. Returns
    /// whether a value was stored.
    pub fn apply_status(&self, key: &str, payload: &[u8]) -> bool {
        match serde_json::from_slice::<Value>(payload) {
            Ok(value) => {
                self.insert(key, value);
                true
            }
            Err(e) => {
                trace!("undecodable status for {}: {}", key, e);
                self.remove(key);
                false
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
