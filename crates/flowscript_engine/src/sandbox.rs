//! Sandbox Context
//!
//! The ordered set of names a script can see. Fixed capabilities are declared
//! statically; injected modules are appended after them. Every insertion
//! checks the name against what is already bound, so a sandbox can never hold
//! two values under one name or shadow a capability.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use flowscript_types::ModuleBinding;

use crate::error::{ScriptError, ScriptResult};
use crate::fetch::FetchClient;
use crate::host::{ContextHandles, ModuleExport, ModuleResolver, NodeHost};
use crate::modules::ModuleInjector;
use crate::timers::TimerRegistry;

/// Name of the host node handle
pub const NODE_HANDLE: &str = "node";
/// Name of the per-call message
pub const MESSAGE: &str = "msg";
pub const NODE_CONTEXT: &str = "context";
pub const FLOW_CONTEXT: &str = "flow";
pub const GLOBAL_CONTEXT: &str = "global";

// ─────────────────────────────────────────────────────────────────────────────
// Capabilities
// ─────────────────────────────────────────────────────────────────────────────

/// A fixed binding every sandbox provides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Message,
    Node,
    Host,
    Console,
    Util,
    Buffer,
    Url,
    UrlSearchParams,
    Date,
    Env,
    Fetch,
    NodeContext,
    FlowContext,
    GlobalContext,
    SetTimeout,
    ClearTimeout,
    SetInterval,
    ClearInterval,
}

impl Capability {
    /// Whether the value is re-bound on every call instead of at build time
    pub fn is_per_call(&self) -> bool {
        matches!(
            self,
            Capability::Message
                | Capability::NodeContext
                | Capability::FlowContext
                | Capability::GlobalContext
        )
    }
}

/// Fixed bindings, in the order they are declared to scripts
pub const FIXED_BINDINGS: &[(&str, Capability)] = &[
    (MESSAGE, Capability::Message),
    (NODE_HANDLE, Capability::Node),
    ("host", Capability::Host),
    ("console", Capability::Console),
    ("util", Capability::Util),
    ("Buffer", Capability::Buffer),
    ("URL", Capability::Url),
    ("URLSearchParams", Capability::UrlSearchParams),
    ("Date", Capability::Date),
    ("env", Capability::Env),
    ("fetch", Capability::Fetch),
    (NODE_CONTEXT, Capability::NodeContext),
    (FLOW_CONTEXT, Capability::FlowContext),
    (GLOBAL_CONTEXT, Capability::GlobalContext),
    ("setTimeout", Capability::SetTimeout),
    ("clearTimeout", Capability::ClearTimeout),
    ("setInterval", Capability::SetInterval),
    ("clearInterval", Capability::ClearInterval),
];

/// Whether a module may not be bound under `name`
pub fn is_reserved(name: &str) -> bool {
    name == NODE_HANDLE || FIXED_BINDINGS.iter().any(|(fixed, _)| *fixed == name)
}

// ─────────────────────────────────────────────────────────────────────────────
// Sandbox Context
// ─────────────────────────────────────────────────────────────────────────────

/// What a name is bound to
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Fixed(Capability),
    Module { module: String, export: ModuleExport },
}

#[derive(Debug, Clone)]
pub struct SandboxEntry {
    pub name: String,
    pub binding: Binding,
}

/// Bindings for one compiled artifact
///
/// Built fresh for every artifact and never reused across recompilation.
#[derive(Clone)]
pub struct SandboxContext {
    entries: Vec<SandboxEntry>,
    host: Arc<dyn NodeHost>,
    timers: Arc<TimerRegistry>,
    fetch: FetchClient,
    generation: u64,
}

impl SandboxContext {
    /// A sandbox holding only the fixed capabilities
    pub fn new(host: Arc<dyn NodeHost>, timers: Arc<TimerRegistry>, generation: u64) -> Self {
        let entries = FIXED_BINDINGS
            .iter()
            .map(|(name, capability)| SandboxEntry {
                name: (*name).to_string(),
                binding: Binding::Fixed(*capability),
            })
            .collect();

        Self {
            entries,
            host,
            timers,
            fetch: FetchClient::default(),
            generation,
        }
    }

    /// Use `client` for the `fetch` capability
    pub fn with_fetch(mut self, client: FetchClient) -> Self {
        self.fetch = client;
        self
    }

    /// Bind a resolved module
    pub fn insert_module(
        &mut self,
        name: &str,
        module: impl Into<String>,
        export: ModuleExport,
    ) -> ScriptResult<()> {
        if is_reserved(name) {
            return Err(ScriptError::ReservedName { name: name.to_string() });
        }
        if self.contains(name) {
            return Err(ScriptError::DuplicateBinding { name: name.to_string() });
        }
        self.entries.push(SandboxEntry {
            name: name.to_string(),
            binding: Binding::Module {
                module: module.into(),
                export: export.unwrap_default(),
            },
        });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.entries.iter().find(|e| e.name == name).map(|e| &e.binding)
    }

    /// Binding names in declaration order
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    pub fn entries(&self) -> &[SandboxEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn host(&self) -> &Arc<dyn NodeHost> {
        &self.host
    }

    pub fn timers(&self) -> &Arc<TimerRegistry> {
        &self.timers
    }

    pub fn fetch(&self) -> &FetchClient {
        &self.fetch
    }

    /// Generation of the artifact the sandbox belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for SandboxContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxContext")
            .field("names", &self.names())
            .field("generation", &self.generation)
            .finish()
    }
}

/// Values re-bound on every call
#[derive(Debug, Clone)]
pub struct CallScope {
    /// `None` for lifecycle hooks, which run without a message
    pub msg: Option<Value>,
    pub stores: ContextHandles,
}

impl CallScope {
    pub fn message(msg: Value, stores: ContextHandles) -> Self {
        Self { msg: Some(msg), stores }
    }

    pub fn hook(stores: ContextHandles) -> Self {
        Self { msg: None, stores }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Context Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Assembles a sandbox for one artifact
pub struct ContextBuilder {
    host: Arc<dyn NodeHost>,
    timers: Arc<TimerRegistry>,
    fetch: FetchClient,
}

impl ContextBuilder {
    pub fn new(host: Arc<dyn NodeHost>, timers: Arc<TimerRegistry>) -> Self {
        Self {
            host,
            timers,
            fetch: FetchClient::default(),
        }
    }

    /// Set the HTTP client behind `fetch`
    pub fn with_fetch(mut self, client: FetchClient) -> Self {
        self.fetch = client;
        self
    }

    /// Build the sandbox, resolving and injecting the declared modules
    ///
    /// Fails without returning a partial sandbox if any binding is invalid or
    /// any module fails to load.
    pub async fn build(
        &self,
        resolver: &dyn ModuleResolver,
        modules: &[ModuleBinding],
        generation: u64,
    ) -> ScriptResult<SandboxContext> {
        let mut sandbox = SandboxContext::new(self.host.clone(), self.timers.clone(), generation)
            .with_fetch(self.fetch.clone());

        ModuleInjector::new(self.host.clone())
            .inject(&mut sandbox, modules, resolver)
            .await?;

        debug!(
            node = %self.host.id(),
            generation,
            "Built sandbox with {} bindings ({} modules)",
            sandbox.len(),
            modules.len()
        );
        Ok(sandbox)
    }
}
