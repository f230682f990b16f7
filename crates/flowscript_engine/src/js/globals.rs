//! JavaScript Bindings
//!
//! Turns a sandbox's bindings into JavaScript values on a target object: the
//! realm's globals for isolated scripts, a plain bindings object for direct
//! ones.

use std::sync::Arc;
use std::time::Duration;

use rquickjs::function::{Async, Opt, Rest};
use rquickjs::{CatchResultExt, CaughtError, Ctx, Function, Object, Promise, Value as JsValue};
use serde_json::{Value, json};

use flowscript_types::{ErrorDetail, Outputs};

use super::convert::{caught_detail, display_value, format_values, js_to_json, json_to_js};
use super::runtime::eval_script;
use crate::ENGINE_VERSION;
use crate::error::{ScriptError, ScriptResult};
use crate::fetch::{FetchClient, FetchRequest};
use crate::host::{ContextStore, ModuleExport, NodeHost};
use crate::sandbox::{
    Binding, CallScope, Capability, FLOW_CONTEXT, GLOBAL_CONTEXT, MESSAGE, NODE_CONTEXT,
    SandboxContext,
};
use crate::timers::{TimerId, TimerKind, TimerRegistry, fire_guarded, fire_once, report_callback_error};

/// Install every binding of `sandbox` onto `target`
///
/// Per-call bindings start out `undefined`; [`bind_call`] fills them in.
pub fn install<'js>(ctx: &Ctx<'js>, target: &Object<'js>, sandbox: &SandboxContext) -> ScriptResult<()> {
    let url_classes = url_classes(ctx).map_err(|e| setup_error(ctx, e))?;

    for entry in sandbox.entries() {
        let value = match &entry.binding {
            Binding::Fixed(capability) => {
                fixed_value(ctx, *capability, sandbox, &url_classes).map_err(|e| setup_error(ctx, e))?
            }
            Binding::Module { module, export } => {
                module_value(ctx, export).map_err(|e| ScriptError::ModuleLoad {
                    module: module.clone(),
                    message: caught_detail(ctx, e).message,
                })?
            }
        };
        target
            .set(entry.name.as_str(), value)
            .catch(ctx)
            .map_err(|e| setup_error(ctx, e))?;
    }
    Ok(())
}

/// Re-bind the message and store handles before a call
pub fn bind_call<'js>(ctx: &Ctx<'js>, target: &Object<'js>, scope: &CallScope) -> rquickjs::Result<()> {
    let msg = match &scope.msg {
        Some(msg) => json_to_js(ctx, msg)?,
        None => JsValue::new_undefined(ctx.clone()),
    };
    target.set(MESSAGE, msg)?;

    let flow = store_handle(ctx, scope.stores.flow.clone())?;
    let global = store_handle(ctx, scope.stores.global.clone())?;
    let context = store_handle(ctx, scope.stores.node.clone())?;
    context.set(FLOW_CONTEXT, flow.clone())?;
    context.set(GLOBAL_CONTEXT, global.clone())?;

    target.set(NODE_CONTEXT, context)?;
    target.set(FLOW_CONTEXT, flow)?;
    target.set(GLOBAL_CONTEXT, global)?;
    Ok(())
}

fn setup_error<'js>(ctx: &Ctx<'js>, caught: rquickjs::CaughtError<'js>) -> ScriptError {
    ScriptError::Runtime(format!("Failed to set up sandbox: {}", caught_detail(ctx, caught)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Fixed Capabilities
// ─────────────────────────────────────────────────────────────────────────────

fn fixed_value<'js>(
    ctx: &Ctx<'js>,
    capability: Capability,
    sandbox: &SandboxContext,
    url_classes: &Object<'js>,
) -> rquickjs::CaughtResult<'js, JsValue<'js>> {
    let host = sandbox.host();
    let value = match capability {
        Capability::Message
        | Capability::NodeContext
        | Capability::FlowContext
        | Capability::GlobalContext => JsValue::new_undefined(ctx.clone()),
        Capability::Node => node_handle(ctx, host).catch(ctx)?.into_value(),
        Capability::Host => host_api(ctx, host).catch(ctx)?.into_value(),
        Capability::Console => console(ctx, host.id()).catch(ctx)?.into_value(),
        Capability::Util => util(ctx).catch(ctx)?.into_value(),
        Capability::Buffer => buffer(ctx).catch(ctx)?.into_value(),
        Capability::Url => url_classes.get("URL").catch(ctx)?,
        Capability::UrlSearchParams => url_classes.get("URLSearchParams").catch(ctx)?,
        Capability::Date => ctx.globals().get("Date").catch(ctx)?,
        Capability::Env => env(ctx, host).catch(ctx)?.into_value(),
        Capability::Fetch => fetch(ctx, sandbox.fetch().clone())?.into_value(),
        Capability::SetTimeout => set_timer(ctx, TimerKind::Timeout, sandbox).catch(ctx)?.into_value(),
        Capability::SetInterval => set_timer(ctx, TimerKind::Interval, sandbox).catch(ctx)?.into_value(),
        Capability::ClearTimeout | Capability::ClearInterval => {
            clear_timer(ctx, sandbox.timers().clone()).catch(ctx)?.into_value()
        }
    };
    Ok(value)
}

/// `node`: identity, reporting and `send`
fn node_handle<'js>(ctx: &Ctx<'js>, host: &Arc<dyn NodeHost>) -> rquickjs::Result<Object<'js>> {
    let node = Object::new(ctx.clone())?;
    node.set("id", host.id())?;
    node.set("name", host.name())?;

    let h = host.clone();
    node.set("log", Function::new(ctx.clone(), move |ctx: Ctx<'js>, args: Rest<JsValue<'js>>| {
        h.log(&format_values(&ctx, &args.0));
    })?)?;

    let h = host.clone();
    node.set("warn", Function::new(ctx.clone(), move |ctx: Ctx<'js>, args: Rest<JsValue<'js>>| {
        h.warn(&format_values(&ctx, &args.0));
    })?)?;

    let h = host.clone();
    node.set("error", Function::new(ctx.clone(), move |ctx: Ctx<'js>, args: Rest<JsValue<'js>>| {
        h.error(&format_values(&ctx, &args.0));
    })?)?;

    let h = host.clone();
    node.set(
        "send",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, value: JsValue<'js>| -> rquickjs::Result<()> {
            let outputs = Outputs::from_value(js_to_json(&ctx, value)?);
            if !outputs.is_empty() {
                h.send(outputs);
            }
            Ok(())
        })?,
    )?;

    Ok(node)
}

/// `host`: engine version and setting lookup
fn host_api<'js>(ctx: &Ctx<'js>, host: &Arc<dyn NodeHost>) -> rquickjs::Result<Object<'js>> {
    let api = Object::new(ctx.clone())?;
    api.set("version", ENGINE_VERSION)?;

    let h = host.clone();
    api.set("getSetting", Function::new(ctx.clone(), move |key: String| h.get_setting(&key))?)?;
    Ok(api)
}

/// `env.get(name)`, scoped through the host's setting lookup
fn env<'js>(ctx: &Ctx<'js>, host: &Arc<dyn NodeHost>) -> rquickjs::Result<Object<'js>> {
    let env = Object::new(ctx.clone())?;
    let h = host.clone();
    env.set("get", Function::new(ctx.clone(), move |name: String| h.get_setting(&name))?)?;
    Ok(env)
}

/// `console`, routed to tracing
fn console<'js>(ctx: &Ctx<'js>, node_id: &str) -> rquickjs::Result<Object<'js>> {
    let console = Object::new(ctx.clone())?;

    let id = node_id.to_string();
    console.set("log", Function::new(ctx.clone(), move |ctx: Ctx<'js>, args: Rest<JsValue<'js>>| {
        tracing::info!(target: "flowscript.script", node = %id, "{}", format_values(&ctx, &args.0));
    })?)?;

    let id = node_id.to_string();
    console.set("info", Function::new(ctx.clone(), move |ctx: Ctx<'js>, args: Rest<JsValue<'js>>| {
        tracing::info!(target: "flowscript.script", node = %id, "{}", format_values(&ctx, &args.0));
    })?)?;

    let id = node_id.to_string();
    console.set("debug", Function::new(ctx.clone(), move |ctx: Ctx<'js>, args: Rest<JsValue<'js>>| {
        tracing::debug!(target: "flowscript.script", node = %id, "{}", format_values(&ctx, &args.0));
    })?)?;

    let id = node_id.to_string();
    console.set("warn", Function::new(ctx.clone(), move |ctx: Ctx<'js>, args: Rest<JsValue<'js>>| {
        tracing::warn!(target: "flowscript.script", node = %id, "{}", format_values(&ctx, &args.0));
    })?)?;

    let id = node_id.to_string();
    console.set("error", Function::new(ctx.clone(), move |ctx: Ctx<'js>, args: Rest<JsValue<'js>>| {
        tracing::error!(target: "flowscript.script", node = %id, "{}", format_values(&ctx, &args.0));
    })?)?;

    Ok(console)
}

/// `util.format` and `util.inspect`
fn util<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
    let util = Object::new(ctx.clone())?;
    util.set("format", Function::new(ctx.clone(), |ctx: Ctx<'js>, args: Rest<JsValue<'js>>| {
        format_values(&ctx, &args.0)
    })?)?;
    util.set("inspect", Function::new(ctx.clone(), |ctx: Ctx<'js>, value: JsValue<'js>| {
        match value.type_of() {
            rquickjs::Type::String => format!("'{}'", display_value(&ctx, &value)),
            _ => match js_to_json(&ctx, value.clone()) {
                Ok(json) if value.is_object() => {
                    serde_json::to_string_pretty(&json).unwrap_or_else(|_| json.to_string())
                }
                _ => display_value(&ctx, &value),
            },
        }
    })?)?;
    Ok(util)
}

/// `Buffer`: UTF-8 encoding helpers over plain byte arrays
fn buffer<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
    let buffer = Object::new(ctx.clone())?;
    buffer.set("from", Function::new(ctx.clone(), |text: String| -> Vec<i32> {
        text.into_bytes().into_iter().map(i32::from).collect()
    })?)?;
    buffer.set("toString", Function::new(ctx.clone(), |bytes: Vec<i32>| -> String {
        let bytes: Vec<u8> = bytes.into_iter().map(|b| b.clamp(0, 255) as u8).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    })?)?;
    buffer.set("byteLength", Function::new(ctx.clone(), |text: String| text.len() as f64)?)?;
    buffer.set("isBuffer", Function::new(ctx.clone(), |value: JsValue<'js>| value.is_array())?)?;
    Ok(buffer)
}

// ─────────────────────────────────────────────────────────────────────────────
// Stores
// ─────────────────────────────────────────────────────────────────────────────

/// `get`/`set`/`keys` over one host store
fn store_handle<'js>(ctx: &Ctx<'js>, store: Arc<dyn ContextStore>) -> rquickjs::Result<Object<'js>> {
    let handle = Object::new(ctx.clone())?;

    let s = store.clone();
    handle.set(
        "get",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, key: String| -> rquickjs::Result<JsValue<'js>> {
            match s.get(&key) {
                Some(value) => json_to_js(&ctx, &value),
                None => Ok(JsValue::new_undefined(ctx.clone())),
            }
        })?,
    )?;

    let s = store.clone();
    handle.set(
        "set",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, key: String, value: Opt<JsValue<'js>>| -> rquickjs::Result<()> {
            let value = match value.0 {
                Some(v) => js_to_json(&ctx, v)?,
                None => Value::Null,
            };
            s.set(&key, value);
            Ok(())
        })?,
    )?;

    let s = store;
    handle.set("keys", Function::new(ctx.clone(), move || s.keys())?)?;

    Ok(handle)
}

// ─────────────────────────────────────────────────────────────────────────────
// Timers
// ─────────────────────────────────────────────────────────────────────────────

/// `setTimeout`/`setInterval` wrappers that register with the node's timer registry
fn set_timer<'js>(ctx: &Ctx<'js>, kind: TimerKind, sandbox: &SandboxContext) -> rquickjs::Result<Function<'js>> {
    let registry = sandbox.timers().clone();
    let host = sandbox.host().clone();
    let generation = sandbox.generation();

    Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, callback: Function<'js>, delay: Opt<JsValue<'js>>, args: Rest<JsValue<'js>>| -> f64 {
            let millis = delay
                .0
                .and_then(|d| d.as_number())
                .filter(|d| d.is_finite() && *d > 0.0)
                .unwrap_or(0.0);
            let delay = Duration::from_millis(millis as u64);
            let (id, cancel) = registry.register(kind, generation);

            let registry = registry.clone();
            let host = host.clone();
            let args = args.0;
            let task_ctx = ctx.clone();
            ctx.spawn(async move {
                // A callback that returns a promise is watched until it settles
                let fire = |pending: &mut Option<Promise<'js>>| -> Result<(), ErrorDetail> {
                    let returned: JsValue = callback
                        .call((Rest(args.clone()),))
                        .catch(&task_ctx)
                        .map_err(|e| caught_detail(&task_ctx, e))?;
                    *pending = returned.into_promise();
                    Ok(())
                };

                match kind {
                    TimerKind::Timeout => {
                        tokio::select! {
                            _ = cancel.notified() => {}
                            _ = tokio::time::sleep(delay) => {
                                let mut pending = None;
                                fire_once(&registry, id, host.as_ref(), || fire(&mut pending));
                                if let Some(promise) = pending {
                                    watch_settlement(&task_ctx, id, host.clone(), promise);
                                }
                            }
                        }
                    }
                    TimerKind::Interval => {
                        let period = delay.max(Duration::from_millis(1));
                        loop {
                            tokio::select! {
                                _ = cancel.notified() => break,
                                _ = tokio::time::sleep(period) => {
                                    let mut pending = None;
                                    if !fire_guarded(&registry, id, host.as_ref(), || fire(&mut pending)) {
                                        break;
                                    }
                                    if let Some(promise) = pending {
                                        watch_settlement(&task_ctx, id, host.clone(), promise);
                                    }
                                }
                            }
                        }
                    }
                }
            });

            f64::from(id)
        },
    )
}

/// Report the rejection of an async timer callback
fn watch_settlement<'js>(ctx: &Ctx<'js>, id: TimerId, host: Arc<dyn NodeHost>, promise: Promise<'js>) {
    let task_ctx = ctx.clone();
    ctx.spawn(async move {
        if let Err(e) = promise.into_future::<JsValue>().await {
            let detail = caught_detail(&task_ctx, CaughtError::from_error(&task_ctx, e));
            report_callback_error(id, host.as_ref(), &detail);
        }
    });
}

/// `clearTimeout`/`clearInterval`; unknown ids are ignored
fn clear_timer<'js>(ctx: &Ctx<'js>, registry: Arc<TimerRegistry>) -> rquickjs::Result<Function<'js>> {
    Function::new(ctx.clone(), move |id: Opt<JsValue<'js>>| {
        if let Some(id) = id.0.and_then(|v| v.as_number()) {
            if id >= 0.0 && id <= f64::from(u32::MAX) {
                registry.cancel(id as u32);
            }
        }
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// URL
// ─────────────────────────────────────────────────────────────────────────────

const URL_SHIM: &str = r#"
(function (parse) {
  const decode = (s) => decodeURIComponent(s.replace(/\+/g, ' '));
  const encode = (s) => encodeURIComponent(s).replace(/%20/g, '+');

  class URLSearchParams {
    constructor(init) {
      this._entries = [];
      if (typeof init === 'string') {
        const query = init.charAt(0) === '?' ? init.slice(1) : init;
        for (const part of query.split('&')) {
          if (!part) continue;
          const i = part.indexOf('=');
          this._entries.push(i < 0 ? [decode(part), ''] : [decode(part.slice(0, i)), decode(part.slice(i + 1))]);
        }
      } else if (Array.isArray(init)) {
        for (const [k, v] of init) this._entries.push([String(k), String(v)]);
      } else if (init && typeof init === 'object') {
        for (const k of Object.keys(init)) this._entries.push([k, String(init[k])]);
      }
    }
    get(name) { const e = this._entries.find((e) => e[0] === name); return e ? e[1] : null; }
    getAll(name) { return this._entries.filter((e) => e[0] === name).map((e) => e[1]); }
    has(name) { return this._entries.some((e) => e[0] === name); }
    append(name, value) { this._entries.push([String(name), String(value)]); }
    delete(name) { this._entries = this._entries.filter((e) => e[0] !== name); }
    set(name, value) {
      let found = false;
      this._entries = this._entries.filter((e) => {
        if (e[0] !== name) return true;
        if (found) return false;
        found = true;
        e[1] = String(value);
        return true;
      });
      if (!found) this._entries.push([String(name), String(value)]);
    }
    forEach(fn, thisArg) { for (const [k, v] of this._entries) fn.call(thisArg, v, k, this); }
    keys() { return this._entries.map((e) => e[0])[Symbol.iterator](); }
    values() { return this._entries.map((e) => e[1])[Symbol.iterator](); }
    entries() { return this._entries.map((e) => [e[0], e[1]])[Symbol.iterator](); }
    [Symbol.iterator]() { return this.entries(); }
    toString() { return this._entries.map((e) => encode(e[0]) + '=' + encode(e[1])).join('&'); }
  }

  class URL {
    constructor(input, base) {
      Object.assign(this, parse(String(input), base === undefined ? undefined : String(base)));
      this.searchParams = new URLSearchParams(this.search);
    }
    toString() { return this.href; }
    toJSON() { return this.href; }
  }

  return { URL, URLSearchParams };
})
"#;

/// Evaluate the URL classes in this realm, backed by the `url` crate parser
fn url_classes<'js>(ctx: &Ctx<'js>) -> rquickjs::CaughtResult<'js, Object<'js>> {
    let factory: Function = eval_script(ctx, URL_SHIM).catch(ctx)?;
    let parse = Function::new(
        ctx.clone(),
        |ctx: Ctx<'js>, input: String, base: Opt<String>| -> rquickjs::Result<JsValue<'js>> {
            match parse_url(&input, base.0.as_deref()) {
                Ok(parts) => json_to_js(&ctx, &parts),
                Err(e) => Err(rquickjs::Exception::throw_type(&ctx, &format!("Invalid URL: {}", e))),
            }
        },
    )
    .catch(ctx)?;
    factory.call((parse,)).catch(ctx)
}

/// Split a URL into the components a WHATWG `URL` object exposes
pub fn parse_url(input: &str, base: Option<&str>) -> Result<Value, url::ParseError> {
    let url = match base {
        Some(base) => url::Url::parse(base)?.join(input)?,
        None => url::Url::parse(input)?,
    };

    let hostname = url.host_str().unwrap_or_default().to_string();
    let port = url.port().map(|p| p.to_string()).unwrap_or_default();
    let host = if port.is_empty() { hostname.clone() } else { format!("{}:{}", hostname, port) };

    Ok(json!({
        "href": url.as_str(),
        "protocol": format!("{}:", url.scheme()),
        "username": url.username(),
        "password": url.password().unwrap_or_default(),
        "host": host,
        "hostname": hostname,
        "port": port,
        "pathname": url.path(),
        "search": url.query().filter(|q| !q.is_empty()).map(|q| format!("?{}", q)).unwrap_or_default(),
        "hash": url.fragment().filter(|f| !f.is_empty()).map(|f| format!("#{}", f)).unwrap_or_default(),
        "origin": url.origin().ascii_serialization(),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Fetch
// ─────────────────────────────────────────────────────────────────────────────

const FETCH_SHIM: &str = r#"
(function (send) {
  class Headers {
    constructor(init) {
      this._map = {};
      if (!init) return;
      const list = init instanceof Headers || Array.isArray(init) ? Array.from(init) : Object.entries(init);
      for (const [k, v] of list) this.append(k, v);
    }
    append(name, value) {
      const key = String(name).toLowerCase();
      this._map[key] = key in this._map ? this._map[key] + ', ' + String(value) : String(value);
    }
    set(name, value) { this._map[String(name).toLowerCase()] = String(value); }
    get(name) { const v = this._map[String(name).toLowerCase()]; return v === undefined ? null : v; }
    has(name) { return String(name).toLowerCase() in this._map; }
    delete(name) { delete this._map[String(name).toLowerCase()]; }
    forEach(fn, thisArg) { for (const [k, v] of this) fn.call(thisArg, v, k, this); }
    [Symbol.iterator]() { return Object.entries(this._map)[Symbol.iterator](); }
  }

  class Response {
    constructor(raw) {
      this.url = raw.url;
      this.status = raw.status;
      this.statusText = raw.statusText;
      this.ok = raw.status >= 200 && raw.status < 300;
      this.headers = new Headers(raw.headers);
      this.bodyUsed = false;
      this._body = raw.body;
    }
    text() {
      if (this.bodyUsed) return Promise.reject(new TypeError('Body has already been consumed'));
      this.bodyUsed = true;
      return Promise.resolve(this._body);
    }
    json() { return this.text().then((text) => JSON.parse(text)); }
  }

  return async function fetch(input, init) {
    const options = init || {};
    const url = typeof input === 'string' ? input : String(input && input.href !== undefined ? input.href : input);
    const headers = new Headers(options.headers);
    let body = options.body;
    if (body !== undefined && body !== null && typeof body !== 'string') {
      body = JSON.stringify(body);
      if (!headers.has('content-type')) headers.set('content-type', 'application/json');
    }
    const method = String(options.method || 'GET').toUpperCase();
    return new Response(await send(url, method, Array.from(headers), body == null ? undefined : body));
  };
})
"#;

/// `fetch`, backed by the artifact's HTTP client
///
/// Requests run on the runtime thread; network failures reject with a
/// `TypeError`. Non-string bodies are sent as JSON.
fn fetch<'js>(ctx: &Ctx<'js>, client: FetchClient) -> rquickjs::CaughtResult<'js, Function<'js>> {
    let factory: Function = eval_script(ctx, FETCH_SHIM).catch(ctx)?;
    let send = Function::new(
        ctx.clone(),
        Async(
            move |ctx: Ctx<'js>, url: String, method: String, headers: Vec<Vec<String>>, body: Opt<String>| {
                let client = client.clone();
                async move {
                    let request = FetchRequest {
                        url,
                        method,
                        headers: headers
                            .into_iter()
                            .filter_map(|pair| match pair.as_slice() {
                                [name, value] => Some((name.clone(), value.clone())),
                                _ => None,
                            })
                            .collect(),
                        body: body.0,
                    };
                    match client.send(request).await {
                        Ok(response) => json_to_js(&ctx, &response.to_json()),
                        Err(e) => Err(rquickjs::Exception::throw_type(&ctx, &format!("fetch failed: {}", e))),
                    }
                }
            },
        ),
    )
    .catch(ctx)?;
    factory.call((send,)).catch(ctx)
}

// ─────────────────────────────────────────────────────────────────────────────
// Modules
// ─────────────────────────────────────────────────────────────────────────────

/// Materialize a resolved module in this realm
///
/// Script modules run CommonJS-style with `module` and `exports`, and their
/// `default` export is bound when present.
fn module_value<'js>(ctx: &Ctx<'js>, export: &ModuleExport) -> rquickjs::CaughtResult<'js, JsValue<'js>> {
    match export {
        ModuleExport::Json(value) => json_to_js(ctx, value).catch(ctx),
        ModuleExport::Script(source) => {
            let factory: Function =
                eval_script(ctx, format!("(function (module, exports) {{\n{}\n}})", source)).catch(ctx)?;
            let module = Object::new(ctx.clone()).catch(ctx)?;
            let exports = Object::new(ctx.clone()).catch(ctx)?;
            module.set("exports", exports.clone()).catch(ctx)?;
            factory.call::<_, ()>((module.clone(), exports)).catch(ctx)?;

            let exported: JsValue = module.get("exports").catch(ctx)?;
            if let Some(obj) = exported.as_object() {
                if obj.contains_key("default").catch(ctx)? {
                    return obj.get("default").catch(ctx);
                }
            }
            Ok(exported)
        }
    }
}
