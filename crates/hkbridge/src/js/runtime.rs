//! QuickJS Runtime Wrapper
//!
//! Provides a safe wrapper around the QuickJS JavaScript engine.

use rquickjs::context::EvalOptions;
use rquickjs::{Context, Ctx, Runtime, Value as JsValue};
use serde_json::Value;

use super::globals::register_console;

// ─────────────────────────────────────────────────────────────────────────────
// JS Runtime Error
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can occur in the JavaScript runtime
#[derive(Debug, thiserror::Error)]
pub enum JsError {
    #[error("Failed to create runtime: {0}")]
    RuntimeCreation(String),

    #[error("Failed to evaluate script: {0}")]
    Eval(String),

    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Type conversion error: {0}")]
    Conversion(String),

    #[error("Runtime error: {0}")]
    Runtime(#[from] rquickjs::Error),
}

pub type JsResult<T> = Result<T, JsError>;

// ─────────────────────────────────────────────────────────────────────────────
// JS Runtime
// ─────────────────────────────────────────────────────────────────────────────

/// A JavaScript runtime instance
///
/// Wraps a single full context, which keeps its QuickJS runtime alive.
/// Callers serialize access themselves.
pub struct JsRuntime {
    context: Context,
}

impl JsRuntime {
    /// Create a new JavaScript runtime with `console` installed
    pub fn new() -> JsResult<Self> {
        let runtime = Runtime::new().map_err(|e| JsError::RuntimeCreation(e.to_string()))?;
        let context = Context::full(&runtime).map_err(|e| JsError::RuntimeCreation(e.to_string()))?;

        let js_runtime = Self { context };

        js_runtime
            .context
            .with(|ctx| register_console(&ctx))
            .map_err(|e| JsError::RuntimeCreation(e.to_string()))?;

        Ok(js_runtime)
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Evaluate a script and return its completion value
    ///
    /// Scripts run as sloppy-mode global code so snippets can use `with`.
    pub fn eval(&self, script: &str) -> JsResult<Value> {
        self.context.with(|ctx| {
            let result: JsValue = match ctx.eval_with_options(script, eval_options()) {
                Ok(value) => value,
                Err(e) => return Err(JsError::Eval(describe_error(&ctx, e))),
            };
            js_to_json(result).map_err(|e| JsError::Conversion(e.to_string()))
        })
    }

    /// Parse a script without running it
    ///
    /// The script is placed in a block that is never entered, so it parses
    /// under the same rules as `eval` while none of it executes.
    pub fn check_syntax(&self, script: &str) -> JsResult<()> {
        let guarded = format!("if (false) {{\n{}\n}}", script);
        self.context
            .with(|ctx| match ctx.eval_with_options::<JsValue, _>(guarded, eval_options()) {
                Ok(_) => Ok(()),
                Err(e) => Err(JsError::Syntax(describe_error(&ctx, e))),
            })
    }
}

fn eval_options() -> EvalOptions {
    let mut options = EvalOptions::default();
    options.global = true;
    options.strict = false;
    options.backtrace_barrier = true;
    options
}

/// Turn an evaluation error into a readable message, clearing any pending exception
fn describe_error(ctx: &Ctx<'_>, err: rquickjs::Error) -> String {
    if !matches!(err, rquickjs::Error::Exception) {
        return err.to_string();
    }

    let thrown = ctx.catch();
    if let Some(exception) = thrown.as_exception() {
        return exception
            .message()
            .unwrap_or_else(|| "uncaught exception".to_string());
    }
    match thrown.as_string().map(|s| s.to_string()) {
        Some(Ok(message)) => message,
        _ => format!("uncaught {:?}", thrown),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Value Conversion
// ─────────────────────────────────────────────────────────────────────────────

/// Convert a JavaScript value to JSON
///
/// Functions, symbols and other non-data values become `null`.
pub(crate) fn js_to_json(js: JsValue<'_>) -> rquickjs::Result<Value> {
    match js.type_of() {
        rquickjs::Type::Undefined | rquickjs::Type::Null => Ok(Value::Null),
        rquickjs::Type::Bool => Ok(Value::Bool(js.get()?)),
        rquickjs::Type::Int => {
            let i: i32 = js.get()?;
            Ok(Value::from(i))
        }
        rquickjs::Type::Float => {
            let f: f64 = js.get()?;
            Ok(serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null))
        }
        rquickjs::Type::String => Ok(Value::String(js.get()?)),
        rquickjs::Type::Array => {
            let arr: rquickjs::Array = js.get()?;
            let mut values = Vec::with_capacity(arr.len());
            for i in 0..arr.len() {
                let item: JsValue = arr.get(i)?;
                values.push(js_to_json(item)?);
            }
            Ok(Value::Array(values))
        }
        rquickjs::Type::Object => {
            let obj: rquickjs::Object = js.get()?;
            let mut fields = serde_json::Map::new();
            for prop in obj.props::<String, JsValue>() {
                let (key, val) = prop?;
                fields.insert(key, js_to_json(val)?);
            }
            Ok(Value::Object(fields))
        }
        _ => Ok(Value::Null),
    }
}

/// Convert JSON to a JavaScript value
pub(crate) fn json_to_js<'js>(ctx: &Ctx<'js>, json: &Value) -> rquickjs::Result<JsValue<'js>> {
    use rquickjs::IntoJs;

    match json {
        Value::Null => Ok(JsValue::new_null(ctx.clone())),
        Value::Bool(b) => Ok(JsValue::new_bool(ctx.clone(), *b)),
        Value::Number(n) => match n.as_i64().and_then(|i| i32::try_from(i).ok()) {
            Some(i) => Ok(JsValue::new_int(ctx.clone(), i)),
            None => Ok(JsValue::new_float(ctx.clone(), n.as_f64().unwrap_or(f64::NAN))),
        },
        Value::String(s) => s.as_str().into_js(ctx),
        Value::Array(arr) => {
            let js_arr = rquickjs::Array::new(ctx.clone())?;
            for (i, item) in arr.iter().enumerate() {
                js_arr.set(i, json_to_js(ctx, item)?)?;
            }
            Ok(js_arr.into_value())
        }
        Value::Object(obj) => {
            let js_obj = rquickjs::Object::new(ctx.clone())?;
            for (key, val) in obj {
                js_obj.set(key.as_str(), json_to_js(ctx, val)?)?;
            }
            Ok(js_obj.into_value())
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_eval_primitives() {
        let runtime = JsRuntime::new().unwrap();

        assert_eq!(runtime.eval("42").unwrap(), json!(42));
        assert_eq!(runtime.eval("'hello'").unwrap(), json!("hello"));
        assert_eq!(runtime.eval("true").unwrap(), json!(true));
        assert_eq!(runtime.eval("1.5").unwrap(), json!(1.5));
        assert_eq!(runtime.eval("undefined").unwrap(), Value::Null);
    }

    #[test]
    fn test_eval_structured() {
        let runtime = JsRuntime::new().unwrap();

        let result = runtime.eval("({ name: 'test', values: [1, 2.5, null] })").unwrap();
        assert_eq!(result, json!({"name": "test", "values": [1, 2.5, null]}));
    }

    #[test]
    fn test_state_persists_between_evals() {
        let runtime = JsRuntime::new().unwrap();

        runtime.eval("var counter = 1").unwrap();
        runtime.eval("counter += 1").unwrap();
        assert_eq!(runtime.eval("counter").unwrap(), json!(2));
    }

    #[test]
    fn test_eval_error_message() {
        let runtime = JsRuntime::new().unwrap();

        let err = runtime.eval("throw new Error('boom')").unwrap_err();
        assert!(err.to_string().contains("boom"), "{}", err);

        let err = runtime.eval("missingFn()").unwrap_err();
        assert!(err.to_string().contains("missingFn"), "{}", err);

        // Runtime still usable after an exception
        assert_eq!(runtime.eval("1 + 1").unwrap(), json!(2));
    }

    #[test]
    fn test_check_syntax() {
        let runtime = JsRuntime::new().unwrap();

        assert!(runtime.check_syntax("get('a')").is_ok());
        assert!(runtime.check_syntax("with ({ value: 1 }) { value }").is_ok());
        assert!(matches!(runtime.check_syntax("get('a'"), Err(JsError::Syntax(_))));

        // Rejected at eval time too, so it must not pass the check
        assert!(runtime.check_syntax("return 1").is_err());
        assert!(runtime.eval("return 1").is_err());

        // Checking does not run anything
        runtime.check_syntax("globalThis.touched = true").unwrap();
        assert_eq!(runtime.eval("typeof touched").unwrap(), json!("undefined"));
    }

    #[test]
    fn test_eval_allows_with() {
        let runtime = JsRuntime::new().unwrap();

        let result = runtime.eval("with ({ value: 20 }) {\n value + 1\n}").unwrap();
        assert_eq!(result, json!(21));
    }

    #[test]
    fn test_json_round_trip_through_js() {
        let runtime = JsRuntime::new().unwrap();
        let input = json!({"on": true, "level": 3_000_000_000i64, "tags": ["a"]});

        let output = runtime.context().with(|ctx| {
            let js = json_to_js(&ctx, &input).unwrap();
            js_to_json(js).unwrap()
        });

        assert_eq!(output["on"], json!(true));
        assert_eq!(output["level"].as_f64(), Some(3_000_000_000.0));
        assert_eq!(output["tags"], json!(["a"]));
    }
}
