//! Flow Node Host
//!
//! The runner's implementation of the engine's [`NodeHost`]: node identity,
//! in-memory stores, settings lookup and an outbox the runner routes from.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use flowscript_engine::{ContextHandles, ContextStore, MemoryStore, NodeHost};
use flowscript_types::Outputs;

/// A message a node sent on one of its ports
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub from: String,
    pub port: usize,
    pub msg: Value,
}

/// Stores shared by every node of a flow
#[derive(Clone)]
pub struct SharedStores {
    pub flow: Arc<dyn ContextStore>,
    pub global: Arc<dyn ContextStore>,
}

impl SharedStores {
    pub fn in_memory() -> Self {
        Self {
            flow: MemoryStore::new_shared(),
            global: MemoryStore::new_shared(),
        }
    }
}

/// Host for one node of a running flow
pub struct FlowNodeHost {
    id: String,
    name: String,
    stores: ContextHandles,
    settings: Arc<HashMap<String, String>>,
    outbox: mpsc::UnboundedSender<Delivery>,
}

impl FlowNodeHost {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        shared: &SharedStores,
        settings: Arc<HashMap<String, String>>,
        outbox: mpsc::UnboundedSender<Delivery>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            stores: ContextHandles::new(MemoryStore::new_shared(), shared.flow.clone(), shared.global.clone()),
            settings,
            outbox,
        }
    }
}

impl NodeHost for FlowNodeHost {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn context(&self) -> ContextHandles {
        self.stores.clone()
    }

    fn send(&self, outputs: Outputs) {
        for (port, msg) in outputs.into_messages() {
            let delivery = Delivery {
                from: self.id.clone(),
                port,
                msg,
            };
            if self.outbox.send(delivery).is_err() {
                warn!(node = %self.id, "Dropping output on port {}: runner stopped", port);
            }
        }
    }

    fn log(&self, message: &str) {
        info!(target: "flowscript.node", node = %self.id, "{}", message);
    }

    fn warn(&self, message: &str) {
        warn!(target: "flowscript.node", node = %self.id, "{}", message);
    }

    fn error(&self, message: &str) {
        error!(target: "flowscript.node", node = %self.id, "{}", message);
    }

    /// Configured settings first, then the process environment
    fn get_setting(&self, key: &str) -> Option<String> {
        self.settings
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
    }
}
