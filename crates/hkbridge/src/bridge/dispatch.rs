//! Dispatch Engine
//!
//! Owns the subscription table (pattern -> listeners), applies status
//! messages to the state cache and fans inbound messages out to listeners.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::bus::{BusClient, Message, QoS};
use crate::cache::StateCache;
use crate::topic;
use crate::types::Result;

/// Identifies one listener within a [`Dispatcher`]
pub type ListenerId = u64;

/// Callback invoked for every message matching its pattern
///
/// Listeners run detached on the runtime; their completion is not observed.
pub type Listener = Arc<dyn Fn(&Message) + Send + Sync>;

#[derive(Default)]
struct SubscriptionTable {
    next_id: ListenerId,
    patterns: HashMap<String, HashMap<ListenerId, Listener>>,
}

pub struct Dispatcher {
    bus: Arc<dyn BusClient>,
    cache: StateCache,
    table: Mutex<SubscriptionTable>,
    runtime: Handle,
}

impl Dispatcher {
    pub fn new(bus: Arc<dyn BusClient>, cache: StateCache, runtime: Handle) -> Self {
        Self {
            bus,
            cache,
            table: Mutex::new(SubscriptionTable::default()),
            runtime,
        }
    }

    /// Register a listener on a topic pattern
    ///
    /// The first listener on a pattern subscribes it on the bus; the table
    /// lock is held across that call so concurrent first subscribers result
    /// in a single bus subscription. A bus failure is returned and nothing is
    /// registered.
    pub fn subscribe(&self, pattern: &str, listener: Listener) -> Result<ListenerId> {
        let mut table = self.table.lock();

        if !table.patterns.contains_key(pattern) {
            self.bus.subscribe(pattern, QoS::AtLeastOnce)?;
            debug!("Subscribed to bus pattern '{}'", pattern);
            table.patterns.insert(pattern.to_string(), HashMap::new());
        }

        let id = table.next_id;
        table.next_id += 1;

        if let Some(listeners) = table.patterns.get_mut(pattern) {
            listeners.insert(id, listener);
        }

        Ok(id)
    }

    /// Remove one listener, leaving others on the same pattern in place
    ///
    /// The bus subscription is kept even when the last listener leaves.
    pub fn unsubscribe(&self, pattern: &str, id: ListenerId) -> bool {
        let mut table = self.table.lock();
        match table.patterns.get_mut(pattern) {
            Some(listeners) => {
                let removed = listeners.remove(&id).is_some();
                if listeners.is_empty() {
                    // TODO: release the bus subscription once idle patterns can be told apart from ones about to be reused
                    trace!("No listeners left on '{}'", pattern);
                }
                removed
            }
            None => false,
        }
    }

    /// Handle one inbound message
    ///
    /// Status messages update the cache first. Every listener whose pattern
    /// matches then runs on its own task. Returns the number of listeners
    /// notified.
    pub fn dispatch(&self, message: Message) -> usize {
        if let Some(key) = topic::status_key(&message.topic) {
            self.cache.apply_status(key, &message.payload);
        }

        let matching: Vec<Listener> = {
            let table = self.table.lock();
            table
                .patterns
                .iter()
                .filter(|(pattern, _)| topic::topic_matches(pattern, &message.topic))
                .flat_map(|(_, listeners)| listeners.values().cloned())
                .collect()
        };

        trace!("Dispatching {} to {} listeners", message.topic, matching.len());

        let message = Arc::new(message);
        for listener in &matching {
            let listener = listener.clone();
            let message = message.clone();
            self.runtime.spawn(async move {
                listener(&message);
            });
        }

        matching.len()
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    pub fn bus(&self) -> &Arc<dyn BusClient> {
        &self.bus
    }

    /// Number of listeners registered on a pattern
    pub fn listener_count(&self, pattern: &str) -> usize {
        self.table
            .lock()
            .patterns
            .get(pattern)
            .map(|listeners| listeners.len())
            .unwrap_or(0)
    }

    /// Patterns currently in the table
    pub fn patterns(&self) -> Vec<String> {
        self.table.lock().patterns.keys().cloned().collect()
    }
}
