//! Value Conversion
//!
//! Moves values between QuickJS and `serde_json`, and renders thrown values
//! into error details.

use rquickjs::function::This;
use rquickjs::{Array, CaughtError, Ctx, Function, IntoJs, Object, Type, Value as JsValue};
use serde_json::{Map, Number, Value};

use flowscript_types::ErrorDetail;

/// Nesting limit for acyclic script values, bounding recursion
const MAX_DEPTH: usize = 1024;

/// Largest float that still converts to an exact integer
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

// ─────────────────────────────────────────────────────────────────────────────
// JS -> JSON
// ─────────────────────────────────────────────────────────────────────────────

/// Convert a JavaScript value to JSON
///
/// Follows `JSON.stringify`: `undefined`, functions and symbols become `null`
/// at the top level and are skipped inside objects, and `toJSON` is honoured.
pub fn js_to_json<'js>(ctx: &Ctx<'js>, js: JsValue<'js>) -> rquickjs::Result<Value> {
    to_json(ctx, js, &mut Vec::new())
}

/// `path` holds the arrays and objects currently being converted
fn to_json<'js>(ctx: &Ctx<'js>, js: JsValue<'js>, path: &mut Vec<JsValue<'js>>) -> rquickjs::Result<Value> {
    match js.type_of() {
        Type::Bool => Ok(Value::Bool(js.get()?)),
        Type::Int => {
            let i: i32 = js.get()?;
            Ok(Value::from(i64::from(i)))
        }
        Type::Float => {
            let f: f64 = js.get()?;
            Ok(float_to_json(f))
        }
        Type::String => Ok(Value::String(js.get()?)),
        Type::Array => {
            enter(path, &js)?;
            let arr: Array = js.get()?;
            let mut values = Vec::with_capacity(arr.len());
            for i in 0..arr.len() {
                let item: JsValue = arr.get(i)?;
                values.push(to_json(ctx, item, path)?);
            }
            path.pop();
            Ok(Value::Array(values))
        }
        Type::Object | Type::Exception => {
            enter(path, &js)?;
            let obj: Object = js.get()?;

            let converted = if let Ok(to_json_fn) = obj.get::<_, Function>("toJSON") {
                let replaced: JsValue = to_json_fn.call((This(obj.clone()),))?;
                to_json(ctx, replaced, path)?
            } else {
                let mut fields = Map::new();
                for prop in obj.props::<String, JsValue>() {
                    let (key, val) = prop?;
                    if is_skipped(&val) {
                        continue;
                    }
                    fields.insert(key, to_json(ctx, val, path)?);
                }
                Value::Object(fields)
            };
            path.pop();
            Ok(converted)
        }
        _ => Ok(Value::Null),
    }
}

fn enter<'js>(path: &mut Vec<JsValue<'js>>, js: &JsValue<'js>) -> rquickjs::Result<()> {
    if path.contains(js) {
        return Err(rquickjs::Error::new_from_js_message("object", "json", "value contains a cycle"));
    }
    if path.len() >= MAX_DEPTH {
        return Err(rquickjs::Error::new_from_js_message(
            "object",
            "json",
            "value is nested too deeply",
        ));
    }
    path.push(js.clone());
    Ok(())
}

fn is_skipped(val: &JsValue<'_>) -> bool {
    matches!(
        val.type_of(),
        Type::Undefined | Type::Function | Type::Constructor | Type::Symbol
    )
}

/// Integral floats within the safe range become JSON integers
fn float_to_json(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER {
        Value::from(f as i64)
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON -> JS
// ─────────────────────────────────────────────────────────────────────────────

/// Convert a `serde_json::Value` to a JavaScript value
pub fn json_to_js<'js>(ctx: &Ctx<'js>, json: &Value) -> rquickjs::Result<JsValue<'js>> {
    match json {
        Value::Null => Ok(JsValue::new_null(ctx.clone())),
        Value::Bool(b) => Ok(JsValue::new_bool(ctx.clone(), *b)),
        Value::Number(n) => match n.as_i64().and_then(|i| i32::try_from(i).ok()) {
            Some(i) => Ok(JsValue::new_int(ctx.clone(), i)),
            None => Ok(JsValue::new_float(ctx.clone(), n.as_f64().unwrap_or(f64::NAN))),
        },
        Value::String(s) => s.as_str().into_js(ctx),
        Value::Array(arr) => {
            let js_arr = Array::new(ctx.clone())?;
            for (i, item) in arr.iter().enumerate() {
                js_arr.set(i, json_to_js(ctx, item)?)?;
            }
            Ok(js_arr.into_value())
        }
        Value::Object(obj) => {
            let js_obj = Object::new(ctx.clone())?;
            for (key, val) in obj {
                js_obj.set(key.as_str(), json_to_js(ctx, val)?)?;
            }
            Ok(js_obj.into_value())
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Display
// ─────────────────────────────────────────────────────────────────────────────

/// Render a value the way `console.log` shows it
pub fn display_value<'js>(ctx: &Ctx<'js>, js: &JsValue<'js>) -> String {
    match js.type_of() {
        Type::Undefined | Type::Uninitialized => "undefined".into(),
        Type::Null => "null".into(),
        Type::String => js.get::<String>().unwrap_or_default(),
        Type::Function | Type::Constructor => "[Function]".into(),
        Type::Symbol => "Symbol()".into(),
        Type::Exception => {
            let obj = js.as_object();
            let name: Option<String> = obj.and_then(|o| o.get("name").ok());
            let message: Option<String> = obj.and_then(|o| o.get("message").ok());
            format!("{}: {}", name.unwrap_or_else(|| "Error".into()), message.unwrap_or_default())
        }
        _ => match js_to_json(ctx, js.clone()) {
            Ok(Value::String(s)) => s,
            Ok(json) => json.to_string(),
            Err(_) => "[object]".into(),
        },
    }
}

/// `util.format`-style rendering: `%s %d %i %f %j %o %O %%` placeholders in
/// the first string argument, remaining arguments joined with spaces
pub fn format_values<'js>(ctx: &Ctx<'js>, args: &[JsValue<'js>]) -> String {
    let Some(first) = args.first() else {
        return String::new();
    };
    if !first.is_string() {
        return join_display(ctx, args);
    }

    let template: String = first.get().unwrap_or_default();
    let mut rest = args[1..].iter();
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('%') => {
                chars.next();
                out.push('%');
            }
            Some(spec @ ('s' | 'd' | 'i' | 'f' | 'j' | 'o' | 'O')) => {
                chars.next();
                match rest.next() {
                    Some(arg) => out.push_str(&format_placeholder(ctx, spec, arg)),
                    None => {
                        out.push('%');
                        out.push(spec);
                    }
                }
            }
            _ => out.push('%'),
        }
    }

    for arg in rest {
        out.push(' ');
        out.push_str(&display_value(ctx, arg));
    }
    out
}

fn format_placeholder<'js>(ctx: &Ctx<'js>, spec: char, arg: &JsValue<'js>) -> String {
    match spec {
        'd' | 'i' | 'f' => {
            let n = arg
                .as_number()
                .or_else(|| arg.as_string().and_then(|s| s.to_string().ok()?.trim().parse().ok()))
                .unwrap_or(f64::NAN);
            let n = if spec == 'i' { n.trunc() } else { n };
            if n.is_nan() { "NaN".into() } else { n.to_string() }
        }
        'j' | 'o' | 'O' => js_to_json(ctx, arg.clone())
            .map(|v| v.to_string())
            .unwrap_or_else(|_| "[Circular]".into()),
        _ => display_value(ctx, arg),
    }
}

fn join_display<'js>(ctx: &Ctx<'js>, args: &[JsValue<'js>]) -> String {
    args.iter()
        .map(|a| display_value(ctx, a))
        .collect::<Vec<_>>()
        .join(" ")
}

// ─────────────────────────────────────────────────────────────────────────────
// Thrown Values
// ─────────────────────────────────────────────────────────────────────────────

/// Capture message, stack and enumerable properties of a thrown value
pub fn caught_detail<'js>(ctx: &Ctx<'js>, caught: CaughtError<'js>) -> ErrorDetail {
    match caught {
        CaughtError::Exception(exception) => {
            let message = exception.message().unwrap_or_else(|| "Unknown error".into());
            let mut detail = ErrorDetail::new(message);
            if let Some(stack) = exception.stack() {
                detail = detail.with_stack(stack);
            }
            for prop in exception.as_object().props::<String, JsValue>().flatten() {
                let (key, val) = prop;
                if is_skipped(&val) {
                    continue;
                }
                if let Ok(json) = js_to_json(ctx, val) {
                    detail = detail.with_property(key, json);
                }
            }
            detail
        }
        CaughtError::Value(value) => {
            let detail = ErrorDetail::new(display_value(ctx, &value));
            match js_to_json(ctx, value) {
                Ok(json) if !json.is_null() => detail.with_property("thrown", json),
                _ => detail,
            }
        }
        CaughtError::Error(error) => ErrorDetail::new(error.to_string()),
    }
}

/// Capture a raw engine error
pub fn error_detail<'js>(ctx: &Ctx<'js>, error: rquickjs::Error) -> ErrorDetail {
    caught_detail(ctx, CaughtError::from_error(ctx, error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};
    use serde_json::json;

    fn with_ctx<F: FnOnce(&Ctx<'_>)>(f: F) {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| f(&ctx));
    }

    #[test]
    fn test_primitives() {
        with_ctx(|ctx| {
            let v: JsValue = ctx.eval("42").unwrap();
            assert_eq!(js_to_json(ctx, v).unwrap(), json!(42));

            let v: JsValue = ctx.eval("2 ** 40").unwrap();
            assert_eq!(js_to_json(ctx, v).unwrap(), json!(1_099_511_627_776_i64));

            let v: JsValue = ctx.eval("1.5").unwrap();
            assert_eq!(js_to_json(ctx, v).unwrap(), json!(1.5));

            let v: JsValue = ctx.eval("undefined").unwrap();
            assert_eq!(js_to_json(ctx, v).unwrap(), Value::Null);
        });
    }

    #[test]
    fn test_objects_follow_json_rules() {
        with_ctx(|ctx| {
            let v: JsValue = ctx
                .eval("({ name: 'test', skip: undefined, f() {}, list: [1, undefined], when: { toJSON() { return 'now'; } } })")
                .unwrap();
            assert_eq!(
                js_to_json(ctx, v).unwrap(),
                json!({ "name": "test", "list": [1, null], "when": "now" })
            );
        });
    }

    #[test]
    fn test_cycle_is_an_error() {
        with_ctx(|ctx| {
            let v: JsValue = ctx.eval("const a = {}; a.self = a; a").unwrap();
            let err = js_to_json(ctx, v).unwrap_err();
            assert!(err.to_string().contains("cycle"));
        });
    }

    #[test]
    fn test_shared_reference_is_not_a_cycle() {
        with_ctx(|ctx| {
            let v: JsValue = ctx.eval("const p = { n: 1 }; ({ a: p, b: [p, p] })").unwrap();
            assert_eq!(
                js_to_json(ctx, v).unwrap(),
                json!({ "a": { "n": 1 }, "b": [{ "n": 1 }, { "n": 1 }] })
            );
        });
    }

    #[test]
    fn test_deep_acyclic_value_converts() {
        with_ctx(|ctx| {
            let mut input = json!({ "leaf": true });
            for _ in 0..200 {
                input = json!({ "next": input });
            }
            let js = json_to_js(ctx, &input).unwrap();
            assert_eq!(js_to_json(ctx, js).unwrap(), input);
        });
    }

    #[test]
    fn test_json_round_trip_through_js() {
        with_ctx(|ctx| {
            let input = json!({ "payload": { "n": 5, "big": 5_000_000_000_i64, "s": "x", "a": [true, null] } });
            let js = json_to_js(ctx, &input).unwrap();
            assert_eq!(js_to_json(ctx, js).unwrap(), input);
        });
    }

    #[test]
    fn test_format_values() {
        with_ctx(|ctx| {
            let args: Vec<JsValue> = vec![
                ctx.eval("'%s is %d years, %j'").unwrap(),
                ctx.eval("'Ada'").unwrap(),
                ctx.eval("36.9").unwrap(),
                ctx.eval("({ a: 1 })").unwrap(),
                ctx.eval("'extra'").unwrap(),
            ];
            assert_eq!(format_values(ctx, &args), "Ada is 36.9 years, {\"a\":1} extra");

            let args: Vec<JsValue> = vec![ctx.eval("1").unwrap(), ctx.eval("undefined").unwrap()];
            assert_eq!(format_values(ctx, &args), "1 undefined");
        });
    }

    #[test]
    fn test_caught_detail() {
        use rquickjs::CatchResultExt;

        with_ctx(|ctx| {
            let err = ctx
                .eval::<(), _>("const e = new TypeError('bad input'); e.code = 'E_BAD'; throw e;")
                .catch(ctx)
                .unwrap_err();
            let detail = caught_detail(ctx, err);
            assert_eq!(detail.message, "bad input");
            assert_eq!(detail.properties["code"], "E_BAD");

            let err = ctx.eval::<(), _>("throw 'plain'").catch(ctx).unwrap_err();
            assert_eq!(caught_detail(ctx, err).message, "plain");
        });
    }
}
