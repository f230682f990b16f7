//! JavaScript Runtime Integration
//!
//! QuickJS glue for the engine: value conversion, the bindings a sandbox
//! materializes into a realm, and the per-artifact runtime thread.
//!
//! # Bindings
//!
//! Every script sees the following names, whichever strategy runs it:
//!
//! - `msg` - The current message (`undefined` in lifecycle hooks)
//! - `node.id`, `node.name`, `node.log/warn/error(...)`, `node.send(outputs)`
//! - `host.version`, `host.getSetting(key)`
//! - `console.log/info/debug/warn/error(...)` - Routed to tracing
//! - `util.format(...)`, `util.inspect(value)`
//! - `Buffer.from(string)`, `Buffer.toString(bytes)`, `Buffer.byteLength(string)`
//! - `URL`, `URLSearchParams`, `Date`
//! - `env.get(name)`
//! - `fetch(url, init)` - HTTP requests; responses expose `status`, `ok`, `headers`, `text()`, `json()`
//! - `context`, `flow`, `global` - Stores with `get(key)`, `set(key, value)`, `keys()`
//! - `setTimeout`, `clearTimeout`, `setInterval`, `clearInterval`
//!
//! followed by the node's injected modules.

mod convert;
mod globals;
mod runtime;

pub use convert::{caught_detail, display_value, error_detail, format_values, js_to_json, json_to_js};
pub use globals::{bind_call, install, parse_url};
pub use runtime::{Deadline, RuntimeLimits, ScriptRuntime, eval_script};
