//! Device Bindings
//!
//! A [`Device`] wires one configured accessory to the sandbox: each
//! characteristic with a get snippet gets a sync closure, each one with a
//! set snippet gets a write callback.

use std::sync::Arc;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::accessory::{Accessory, Characteristic, Service};
use crate::config::{AccessoryConfig, CharacteristicConfig};
use crate::js::{Sandbox, Scope};
use crate::types::{Error, Result};

type SyncFn = Box<dyn Fn() -> Result<()> + Send + Sync>;

pub struct Device {
    accessory: Arc<Accessory>,
    syncs: Vec<SyncFn>,
}

impl Device {
    /// Build the accessory and its bindings from configuration
    ///
    /// Every snippet is compiled once here, so a syntax error fails the
    /// build instead of the first sync.
    pub fn build(config: &AccessoryConfig, sandbox: Arc<Sandbox>, runtime: Handle) -> Result<Self> {
        let mut accessory = Accessory::new(config.info.clone(), config.kind);
        let mut syncs = Vec::new();

        for service_config in &config.services {
            let mut service = Service::new(service_config.kind);

            for char_config in &service_config.characteristics {
                let characteristic = Arc::new(new_characteristic(char_config));
                let label = format!("{}.{}", config.info.name, char_config.kind.name());

                if let Some(snippet) = &char_config.get {
                    validate(&sandbox, snippet, &label, "get")?;
                    syncs.push(sync_fn(
                        label.clone(),
                        snippet.clone(),
                        characteristic.clone(),
                        sandbox.clone(),
                    ));
                }

                if let Some(snippet) = &char_config.set {
                    validate(&sandbox, snippet, &label, "set")?;
                    bind_set(
                        label,
                        snippet.clone(),
                        &characteristic,
                        sandbox.clone(),
                        runtime.clone(),
                    );
                }

                service.add_characteristic(characteristic);
            }

            accessory.add_service(service);
        }

        debug!(
            "Built device {} with {} synced characteristics",
            config.info.name,
            syncs.len()
        );

        Ok(Self {
            accessory: Arc::new(accessory),
            syncs,
        })
    }

    pub fn name(&self) -> &str {
        &self.accessory.info().name
    }

    pub fn accessory(&self) -> &Arc<Accessory> {
        &self.accessory
    }

    /// Run every get snippet and push the results into the accessory
    ///
    /// A failing characteristic does not stop the others; the last error is
    /// returned. Blocks, so call it from a blocking context.
    pub fn sync(&self) -> Result<()> {
        let mut last = Ok(());
        for sync in &self.syncs {
            if let Err(e) = sync() {
                last = Err(e);
            }
        }
        last
    }
}

fn new_characteristic(config: &CharacteristicConfig) -> Characteristic {
    let characteristic = Characteristic::new(config.kind);
    match &config.description {
        Some(description) => characteristic.with_description(description.clone()),
        None => characteristic,
    }
}

fn validate(sandbox: &Sandbox, snippet: &str, label: &str, which: &str) -> Result<()> {
    sandbox
        .validate(snippet)
        .map_err(|e| Error::Config(format!("{} {} snippet: {}", label, which, e)))
}

fn sync_fn(
    label: String,
    snippet: String,
    characteristic: Arc<Characteristic>,
    sandbox: Arc<Sandbox>,
) -> SyncFn {
    Box::new(move || {
        let result = sandbox
            .execute(&snippet, &Scope::new())
            .and_then(|value| characteristic.update_value(&value));

        match result {
            Ok(changed) => {
                if changed {
                    debug!("{} = {}", label, characteristic.value());
                }
                Ok(())
            }
            Err(e) => {
                warn!("Sync of {} failed: {}", label, e);
                Err(e)
            }
        }
    })
}

/// Run the set snippet with `{value}` on every controller write
///
/// Writes queue on one worker per characteristic, so snippets run and publish
/// in the order the controller wrote. The snippet's result and error never
/// reach the controller.
fn bind_set(
    label: String,
    snippet: String,
    characteristic: &Characteristic,
    sandbox: Arc<Sandbox>,
    runtime: Handle,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    characteristic.on_write(Arc::new(move |new: &Value, _old: &Value| {
        if tx.send(new.clone()).is_err() {
            debug!("Set worker gone, dropping write");
        }
    }));

    let snippet: Arc<str> = snippet.into();
    let label: Arc<str> = label.into();
    runtime.spawn(async move {
        while let Some(value) = rx.recv().await {
            let mut scope = Scope::new();
            scope.insert("value".to_string(), value);

            let sandbox = sandbox.clone();
            let snippet = snippet.clone();
            let result = tokio::task::spawn_blocking(move || sandbox.execute(&snippet, &scope)).await;
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("Set snippet of {} failed: {}", label, e),
                Err(e) => warn!("Set snippet of {} aborted: {}", label, e),
            }
        }
    });
}
