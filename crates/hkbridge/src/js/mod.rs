//! Expression Sandbox
//!
//! Snippets are short JavaScript sources evaluated by QuickJS in one shared
//! context. Besides `console.*`, three host functions are in scope:
//!
//! - `get(key)` - last known value of a key, fetched over the bus if needed
//! - `set(key, value)` - record a value and publish it to `<key>/set`
//! - `toRange(value, [a, b], [c, d])` - linear rescale between intervals
//!
//! # Example
//!
//! ```javascript
//! // get snippet for a brightness characteristic
//! toRange(get("living/lamp/level"), [0, 255], [0, 100])
//!
//! // set snippet, `value` is the new characteristic value
//! set("living/lamp/level", toRange(value, [0, 100], [0, 255]))
//! ```

mod globals;
mod runtime;
mod sandbox;

pub use runtime::{JsError, JsResult, JsRuntime};
pub use sandbox::{Sandbox, Scope, ScriptHost};
