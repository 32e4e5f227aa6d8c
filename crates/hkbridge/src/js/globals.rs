//! JavaScript Global Objects
//!
//! Registers `console` and the host functions snippets use to reach the bus.

use std::sync::Arc;

use rquickjs::function::Rest;
use rquickjs::convert::Coerced;
use rquickjs::{Ctx, Exception, Function, Object, Result as JsResult, Value as JsValue};

use super::runtime::{js_to_json, json_to_js};
use super::sandbox::{PendingGet, ScriptHost};

/// Register `get`, `set` and `toRange` as globals backed by `host`
///
/// `get` never blocks: a key missing from the cache is recorded in `pending`
/// and reported to the snippet as an exception, leaving the fetch to the
/// caller of the evaluation.
pub(crate) fn register_host_globals<'js>(
    ctx: &Ctx<'js>,
    host: Arc<dyn ScriptHost>,
    pending: PendingGet,
) -> JsResult<()> {
    let globals = ctx.globals();

    let get_host = host.clone();
    globals.set(
        "get",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, key: String| -> JsResult<JsValue<'js>> {
                match get_host.peek(&key) {
                    Some(value) => json_to_js(&ctx, &value),
                    None => {
                        let message = format!("{} is not available yet", key);
                        pending.set(key);
                        Err(Exception::throw_message(&ctx, &message))
                    }
                }
            },
        )?,
    )?;

    let set_host = host.clone();
    globals.set(
        "set",
        Function::new(
            ctx.clone(),
            move |key: String, value: JsValue<'js>| -> JsResult<()> {
                let value = js_to_json(value)?;
                set_host.set(&key, value);
                Ok(())
            },
        )?,
    )?;

    let range_host = host;
    globals.set(
        "toRange",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, value: f64, input: Vec<f64>, output: Vec<f64>| -> JsResult<f64> {
                range_host
                    .to_range(value, &input, &output)
                    .map_err(|e| Exception::throw_message(&ctx, &e.to_string()))
            },
        )?,
    )?;

    Ok(())
}

/// Register the console object with log, warn, error methods
pub(crate) fn register_console(ctx: &Ctx<'_>) -> JsResult<()> {
    let globals = ctx.globals();

    // Check if console already exists
    if globals.get::<_, Object>("console").is_ok() {
        return Ok(());
    }

    let console = Object::new(ctx.clone())?;

    console.set("log", Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
        let msg = join_args(args);
        tracing::info!(target: "hkbridge.js", "{}", msg);
    })?)?;

    console.set("info", Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
        let msg = join_args(args);
        tracing::info!(target: "hkbridge.js", "{}", msg);
    })?)?;

    console.set("warn", Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
        let msg = join_args(args);
        tracing::warn!(target: "hkbridge.js", "{}", msg);
    })?)?;

    console.set("error", Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
        let msg = join_args(args);
        tracing::error!(target: "hkbridge.js", "{}", msg);
    })?)?;

    console.set("debug", Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
        let msg = join_args(args);
        tracing::debug!(target: "hkbridge.js", "{}", msg);
    })?)?;

    globals.set("console", console)?;

    Ok(())
}

fn join_args(args: Rest<Coerced<String>>) -> String {
    args.0
        .into_iter()
        .map(|arg| arg.0)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    #[test]
    fn test_console_log() {
        let runtime = Runtime::new().unwrap();
        let ctx = Context::full(&runtime).unwrap();

        ctx.with(|ctx| {
            register_console(&ctx).unwrap();

            let console: Object = ctx.globals().get("console").unwrap();
            let _log: Function = console.get("log").unwrap();

            // This should not panic
            let _: () = ctx.eval("console.log('Hello from JS', 1)").unwrap();
        });
    }
}
