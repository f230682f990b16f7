//! Shared test doubles for the engine integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use flowscript_engine::{
    ContextHandles, EngineConfig, MemoryStore, ModuleResolver, NodeHost, Outputs, ScriptNode,
    StaticModuleResolver,
};

/// Host that records everything the engine hands it
pub struct RecordingHost {
    id: String,
    stores: ContextHandles,
    settings: HashMap<String, String>,
    pub sent: Mutex<Vec<Outputs>>,
    pub logs: Mutex<Vec<String>>,
    pub warnings: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<String>>,
}

impl RecordingHost {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            stores: ContextHandles::new(
                MemoryStore::new_shared(),
                MemoryStore::new_shared(),
                MemoryStore::new_shared(),
            ),
            settings: HashMap::new(),
            sent: Mutex::new(Vec::new()),
            logs: Mutex::new(Vec::new()),
            warnings: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        }
    }

    pub fn with_setting(mut self, key: &str, value: &str) -> Self {
        self.settings.insert(key.to_string(), value.to_string());
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn stores(&self) -> &ContextHandles {
        &self.stores
    }

    pub fn logs(&self) -> Vec<String> {
        self.logs.lock().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }

    pub fn sent(&self) -> Vec<Outputs> {
        self.sent.lock().clone()
    }
}

impl NodeHost for RecordingHost {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "test script"
    }

    fn context(&self) -> ContextHandles {
        self.stores.clone()
    }

    fn send(&self, outputs: Outputs) {
        self.sent.lock().push(outputs);
    }

    fn log(&self, message: &str) {
        self.logs.lock().push(message.to_string());
    }

    fn warn(&self, message: &str) {
        self.warnings.lock().push(message.to_string());
    }

    fn error(&self, message: &str) {
        self.errors.lock().push(message.to_string());
    }

    fn get_setting(&self, key: &str) -> Option<String> {
        self.settings.get(key).cloned()
    }
}

/// A lazily compiling node over `host`
pub fn node_for(host: Arc<RecordingHost>) -> ScriptNode {
    node_with(host, Arc::new(StaticModuleResolver::new()))
}

/// A lazily compiling node with a custom resolver
pub fn node_with(host: Arc<RecordingHost>, resolver: Arc<dyn ModuleResolver>) -> ScriptNode {
    ScriptNode::new(host, resolver, EngineConfig::new().precompile(false))
}

/// Poll `check` until it holds or `limit` elapses
pub async fn eventually<F>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
