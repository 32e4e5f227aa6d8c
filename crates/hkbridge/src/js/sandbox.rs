//! Shared snippet sandbox.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace};

use super::globals::register_host_globals;
use super::runtime::{JsError, JsRuntime};
use crate::topic;
use crate::types::Result;

/// Extra variables visible to one snippet execution
pub type Scope = serde_json::Map<String, Value>;

/// The operations a snippet can call back into
pub trait ScriptHost: Send + Sync {
    /// Cached value for a key, without waiting
    fn peek(&self, key: &str) -> Option<Value>;

    /// Value for a key, blocking until one is known
    fn get(&self, key: &str) -> Result<Value>;

    /// Record a value and publish it, best effort
    fn set(&self, key: &str, value: Value);

    fn to_range(&self, value: f64, input: &[f64], output: &[f64]) -> Result<f64> {
        topic::to_range(value, input, output)
    }
}

/// Key a `get` call could not serve from the cache during the current attempt
#[derive(Clone, Default)]
pub(crate) struct PendingGet(Arc<Mutex<Option<String>>>);

impl PendingGet {
    pub(crate) fn set(&self, key: String) {
        *self.0.lock() = Some(key);
    }

    fn take(&self) -> Option<String> {
        self.0.lock().take()
    }
}

/// One scripting environment shared by every characteristic
///
/// Only one snippet body runs at a time. When a snippet calls `get` for a key
/// that is not cached, the attempt is abandoned, the lock is released while
/// the host fetches the key and the snippet runs again from the start.
pub struct Sandbox {
    host: Arc<dyn ScriptHost>,
    runtime: Mutex<JsRuntime>,
    pending: PendingGet,
}

impl Sandbox {
    pub fn new(host: Arc<dyn ScriptHost>) -> Result<Self> {
        let runtime = JsRuntime::new()?;
        let pending = PendingGet::default();

        runtime
            .context()
            .with(|ctx| register_host_globals(&ctx, host.clone(), pending.clone()))
            .map_err(JsError::from)?;

        Ok(Self {
            host,
            runtime: Mutex::new(runtime),
            pending,
        })
    }

    /// Run a snippet with `scope` merged into its lexical scope
    ///
    /// Returns the snippet's completion value. Blocks while another snippet
    /// runs and while a key it reads is being fetched, so it must not be
    /// called from inside an async task.
    pub fn execute(&self, snippet: &str, scope: &Scope) -> Result<Value> {
        let script = wrap(snippet, scope)?;

        loop {
            let (result, missing) = {
                let runtime = self.runtime.lock();
                self.pending.take();
                let result = runtime.eval(&script);
                (result, self.pending.take())
            };

            match missing {
                Some(key) => {
                    debug!("Snippet waits for {}", key);
                    self.host.get(&key)?;
                    trace!("Re-running snippet after fetching {}", key);
                }
                None => return result.map_err(Into::into),
            }
        }
    }

    /// Check that a snippet parses, without running it
    pub fn validate(&self, snippet: &str) -> Result<()> {
        let script = wrap(snippet, &Scope::new())?;
        self.runtime.lock().check_syntax(&script)?;
        Ok(())
    }
}

/// Evaluate `snippet` inside `with (<scope>) { ... }`
///
/// The scope object lives only in this script's source, so nothing carries
/// over to later executions.
fn wrap(snippet: &str, scope: &Scope) -> Result<String> {
    let scope = serde_json::to_string(scope).map_err(|e| JsError::Conversion(e.to_string()))?;
    Ok(format!("with ({}) {{\n{}\n}}", scope, snippet))
}
