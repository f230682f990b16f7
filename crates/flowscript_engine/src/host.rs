//! Host Interfaces
//!
//! The engine is a library driven by a host pipeline runtime. These traits are
//! the hooks it needs from that runtime: node identity, key/value stores,
//! output sending, reporting and module resolution.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use flowscript_types::Outputs;

// ─────────────────────────────────────────────────────────────────────────────
// Context Stores
// ─────────────────────────────────────────────────────────────────────────────

/// A key/value store a script reads through `context`, `flow` or `global`
pub trait ContextStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    /// Store a value; `null` removes the key
    fn set(&self, key: &str, value: Value);

    fn keys(&self) -> Vec<String>;
}

/// In-memory store backed by a concurrent map
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: DashMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new store wrapped in an Arc
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl ContextStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|v| v.value().clone())
    }

    fn set(&self, key: &str, value: Value) {
        if value.is_null() {
            self.values.remove(key);
        } else {
            self.values.insert(key.to_string(), value);
        }
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

/// The three store scopes visible to one call
///
/// Fetched from the host on every call; the handles may change identity
/// between calls.
#[derive(Clone)]
pub struct ContextHandles {
    pub node: Arc<dyn ContextStore>,
    pub flow: Arc<dyn ContextStore>,
    pub global: Arc<dyn ContextStore>,
}

impl ContextHandles {
    pub fn new(
        node: Arc<dyn ContextStore>,
        flow: Arc<dyn ContextStore>,
        global: Arc<dyn ContextStore>,
    ) -> Self {
        Self { node, flow, global }
    }

    /// Fresh, unshared in-memory stores for all three scopes
    pub fn in_memory() -> Self {
        Self::new(
            MemoryStore::new_shared(),
            MemoryStore::new_shared(),
            MemoryStore::new_shared(),
        )
    }
}

impl std::fmt::Debug for ContextHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandles").finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Node Host
// ─────────────────────────────────────────────────────────────────────────────

/// The host runtime's view of one node instance
pub trait NodeHost: Send + Sync {
    /// Node instance identifier
    fn id(&self) -> &str;

    /// Human-readable node name
    fn name(&self) -> &str;

    /// Current store handles
    fn context(&self) -> ContextHandles;

    /// Deliver outputs downstream
    fn send(&self, outputs: Outputs);

    fn log(&self, message: &str);

    fn warn(&self, message: &str);

    /// Report an error on the node's error channel
    fn error(&self, message: &str);

    /// Look up a host setting or environment value
    fn get_setting(&self, key: &str) -> Option<String>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Module Resolution
// ─────────────────────────────────────────────────────────────────────────────

/// A resolved module, ready to be bound into a sandbox
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleExport {
    /// Plain data
    Json(Value),
    /// CommonJS-style source evaluated in the script's realm
    Script(String),
}

impl ModuleExport {
    /// Apply the default-export convention to data exports
    ///
    /// Script exports are unwrapped after evaluation, once `module.exports`
    /// exists.
    pub fn unwrap_default(self) -> Self {
        match self {
            ModuleExport::Json(Value::Object(mut map)) if map.contains_key("default") => {
                ModuleExport::Json(map.remove("default").unwrap_or(Value::Null))
            }
            other => other,
        }
    }
}

/// Resolves module identifiers to values
#[async_trait]
pub trait ModuleResolver: Send + Sync {
    async fn resolve(&self, identifier: &str) -> Result<ModuleExport, String>;
}

/// Resolver over a fixed table of modules
#[derive(Debug, Default)]
pub struct StaticModuleResolver {
    modules: DashMap<String, ModuleExport>,
    resolved: AtomicUsize,
}

impl StaticModuleResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module
    pub fn with_module(self, identifier: impl Into<String>, export: ModuleExport) -> Self {
        self.modules.insert(identifier.into(), export);
        self
    }

    pub fn insert(&self, identifier: impl Into<String>, export: ModuleExport) {
        self.modules.insert(identifier.into(), export);
    }

    /// Number of resolve calls served so far
    pub fn resolve_count(&self) -> usize {
        self.resolved.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModuleResolver for StaticModuleResolver {
    async fn resolve(&self, identifier: &str) -> Result<ModuleExport, String> {
        self.resolved.fetch_add(1, Ordering::SeqCst);
        self.modules
            .get(identifier)
            .map(|m| m.value().clone())
            .ok_or_else(|| format!("Cannot find module '{}'", identifier))
    }
}
