//! Blocking Get
//!
//! Turns the asynchronous get/status round trip into a blocking call:
//! serve from the cache when possible, otherwise listen on the key's status
//! topic, publish a get request and wait for any status message to arrive.

use std::collections::HashMap;
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use super::dispatch::{Dispatcher, Listener, ListenerId};
use crate::bus::{Message, QoS};
use crate::topic::{self, Suffix};
use crate::types::{Error, Result};

/// Removes a listener when dropped, however the wait ends
struct ListenerGuard<'a> {
    dispatcher: &'a Dispatcher,
    pattern: &'a str,
    id: ListenerId,
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        self.dispatcher.unsubscribe(self.pattern, self.id);
    }
}

/// Wake-up handles of every wait in progress
#[derive(Default)]
struct Waiters {
    closed: bool,
    next_id: u64,
    signals: HashMap<u64, SyncSender<()>>,
}

/// Deregisters a wait when dropped
struct WaiterGuard<'a> {
    waiters: &'a Mutex<Waiters>,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiters.lock().signals.remove(&self.id);
    }
}

pub struct Fetcher {
    dispatcher: Arc<Dispatcher>,
    /// `None` waits forever
    timeout: Option<Duration>,
    waiters: Mutex<Waiters>,
}

impl Fetcher {
    pub fn new(dispatcher: Arc<Dispatcher>, timeout: Option<Duration>) -> Self {
        Self {
            dispatcher,
            timeout,
            waiters: Mutex::new(Waiters::default()),
        }
    }

    /// Fail every current and future fetch that would have to wait
    ///
    /// Cached values are still served.
    pub fn close(&self) {
        let mut waiters = self.waiters.lock();
        waiters.closed = true;
        for signal in waiters.signals.values() {
            let _ = signal.try_send(());
        }
        debug!("Fetcher closed, {} waits released", waiters.signals.len());
    }

    pub fn is_closed(&self) -> bool {
        self.waiters.lock().closed
    }

    /// Get the value for a key, blocking until one is known
    ///
    /// Must not be called from inside an async task. Without a timeout a key
    /// nobody publishes blocks until [`Fetcher::close`]. Any status message
    /// for the key wakes the wait, not only the reply to our own request; if
    /// the cache is still empty afterwards the whole sequence starts over.
    pub fn fetch(&self, key: &str) -> Result<Value> {
        loop {
            if let Some(value) = self.dispatcher.cache().get(key) {
                return Ok(value);
            }
            self.wait_for_status(key)?;
        }
    }

    fn wait_for_status(&self, key: &str) -> Result<()> {
        let status_topic = topic::topic_for(key, Suffix::Status);

        let (tx, rx) = mpsc::sync_channel::<()>(1);

        // Registered under the same lock `close` takes, so no wait can miss it
        let _waiter = {
            let mut waiters = self.waiters.lock();
            if waiters.closed {
                return Err(closed_error(key));
            }
            let id = waiters.next_id;
            waiters.next_id += 1;
            waiters.signals.insert(id, tx.clone());
            WaiterGuard {
                waiters: &self.waiters,
                id,
            }
        };

        let tx = Mutex::new(tx);
        let listener: Listener = Arc::new(move |_: &Message| {
            // A pending signal is enough
            let _ = tx.lock().try_send(());
        });

        let id = self.dispatcher.subscribe(&status_topic, listener)?;
        let _guard = ListenerGuard {
            dispatcher: &self.dispatcher,
            pattern: &status_topic,
            id,
        };

        // A status may have landed between the cache check and subscribing
        if self.dispatcher.cache().contains(key) {
            return Ok(());
        }

        let get_topic = topic::topic_for(key, Suffix::Get);
        debug!("Requesting {} via {}", key, get_topic);
        if let Err(e) = self
            .dispatcher
            .bus()
            .publish(&get_topic, Bytes::new(), QoS::AtMostOnce, false)
        {
            warn!("Get request for {} not sent: {}", key, e);
        }

        match self.timeout {
            None => rx
                .recv()
                .map_err(|_| Error::Runtime(format!("status listener for {} dropped", key)))?,
            Some(timeout) => rx.recv_timeout(timeout).map_err(|e| match e {
                mpsc::RecvTimeoutError::Timeout => Error::Timeout(key.to_string()),
                mpsc::RecvTimeoutError::Disconnected => {
                    Error::Runtime(format!("status listener for {} dropped", key))
                }
            })?,
        }

        if self.is_closed() {
            return Err(closed_error(key));
        }
        Ok(())
    }
}

fn closed_error(key: &str) -> Error {
    Error::Runtime(format!("bridge closed while waiting for {}", key))
}
