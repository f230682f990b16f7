//! Flow Runner
//!
//! Drives a flow: one script node per flow entry, inputs delivered through
//! [`FlowRunner::inject`], outputs routed along wires. Outputs on unwired
//! ports leave the flow as [`Emitted`] records.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use flowscript_engine::{ModuleResolver, ScriptNode, ScriptNodeRegistry};
use flowscript_types::ScriptDefinition;

use crate::config::HostConfig;
use crate::flow::{Flow, FlowNode};
use crate::host::{Delivery, FlowNodeHost, SharedStores};

/// Error type for runner operations
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Flow has no entry node")]
    NoEntry,

    #[error("Invalid input line: {0}")]
    InvalidInput(#[from] serde_json::Error),
}

/// A message that left the flow on an unwired port
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Emitted {
    pub node: String,
    pub port: usize,
    pub msg: Value,
    pub time: DateTime<Utc>,
}

/// What changed when a flow was reloaded
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

/// One input line: an addressed message or a bare one for the entry node
#[derive(Debug, Clone, PartialEq)]
pub struct Input {
    pub node: Option<String>,
    pub msg: Value,
}

impl Input {
    /// Parse `{"node": "<id>", "msg": {...}}` or a bare message
    pub fn parse(line: &str) -> Result<Self, HostError> {
        let value: Value = serde_json::from_str(line)?;
        if let Value::Object(map) = &value {
            if let (Some(Value::String(node)), Some(msg), 2) = (map.get("node"), map.get("msg"), map.len()) {
                return Ok(Self {
                    node: Some(node.clone()),
                    msg: msg.clone(),
                });
            }
        }
        Ok(Self { node: None, msg: value })
    }
}

/// Give a message an object shape and a `_msgid`
pub fn prepare_message(msg: Value) -> Value {
    let mut map = match msg {
        Value::Object(map) => map,
        payload => {
            let mut map = Map::new();
            map.insert("payload".into(), payload);
            map
        }
    };
    map.entry("_msgid")
        .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
    Value::Object(map)
}

struct NodeEntry {
    node: Arc<ScriptNode>,
    definition: ScriptDefinition,
    wires: Vec<Vec<String>>,
}

/// A running flow
pub struct FlowRunner {
    registry: ScriptNodeRegistry,
    nodes: RwLock<HashMap<String, NodeEntry>>,
    entry: RwLock<Option<String>>,
    stores: SharedStores,
    settings: Arc<HashMap<String, String>>,
    outbox: mpsc::UnboundedSender<Delivery>,
}

impl FlowRunner {
    /// Create the flow's nodes, returning the runner and its delivery queue
    ///
    /// Nodes compile eagerly when the engine config asks for it; failures are
    /// logged through each node's host and retried on the next edit.
    pub async fn start(
        flow: &Flow,
        config: &HostConfig,
        resolver: Arc<dyn ModuleResolver>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Delivery>) {
        let (outbox, deliveries) = mpsc::unbounded_channel();
        let runner = Arc::new(Self {
            registry: ScriptNodeRegistry::new(resolver, config.engine.clone()),
            nodes: RwLock::new(HashMap::new()),
            entry: RwLock::new(flow.entry_node().map(str::to_string)),
            stores: SharedStores::in_memory(),
            settings: Arc::new(config.settings.clone()),
            outbox,
        });

        for node in &flow.nodes {
            runner.add_node(node).await;
        }
        info!("Flow started with {} nodes", runner.registry.len());
        (runner, deliveries)
    }

    async fn add_node(&self, spec: &FlowNode) {
        let host = Arc::new(FlowNodeHost::new(
            spec.id.as_str(),
            spec.display_name(),
            &self.stores,
            self.settings.clone(),
            self.outbox.clone(),
        ));
        let node = self.registry.get_or_create(host);
        if self.registry.config().precompile {
            let _ = node.precompile(&spec.script).await;
        }
        self.nodes.write().insert(
            spec.id.clone(),
            NodeEntry {
                node,
                definition: spec.script.clone(),
                wires: spec.wires.clone(),
            },
        );
    }

    /// Node ids, sorted
    pub fn node_ids(&self) -> Vec<String> {
        self.registry.ids()
    }

    pub fn node(&self, id: &str) -> Option<Arc<ScriptNode>> {
        self.registry.get(id)
    }

    /// Deliver an inbound message to `node`, or to the entry node
    pub async fn inject(&self, node: Option<&str>, msg: Value) -> Result<(), HostError> {
        let target = match node {
            Some(id) => id.to_string(),
            None => self.entry.read().clone().ok_or(HostError::NoEntry)?,
        };
        self.dispatch(&target, prepare_message(msg)).await
    }

    /// Run one node's script for `msg`
    pub async fn dispatch(&self, id: &str, msg: Value) -> Result<(), HostError> {
        let (node, definition) = {
            let nodes = self.nodes.read();
            let entry = nodes.get(id).ok_or_else(|| HostError::UnknownNode(id.to_string()))?;
            (entry.node.clone(), entry.definition.clone())
        };
        node.handle_input(&definition, msg).await;
        Ok(())
    }

    /// Targets wired to a node's port
    pub fn targets(&self, id: &str, port: usize) -> Vec<String> {
        self.nodes
            .read()
            .get(id)
            .and_then(|e| e.wires.get(port).cloned())
            .unwrap_or_default()
    }

    /// Forward a delivery along its wires, or emit it when the port is unwired
    pub fn route(self: &Arc<Self>, delivery: Delivery) -> Option<Emitted> {
        let targets = self.targets(&delivery.from, delivery.port);
        if targets.is_empty() {
            return Some(Emitted {
                node: delivery.from,
                port: delivery.port,
                msg: delivery.msg,
                time: Utc::now(),
            });
        }

        for target in targets {
            debug!("Routing {}:{} -> {}", delivery.from, delivery.port, target);
            let runner = self.clone();
            let msg = delivery.msg.clone();
            tokio::spawn(async move {
                if let Err(e) = runner.dispatch(&target, msg).await {
                    warn!("Dropped message for {}: {}", target, e);
                }
            });
        }
        None
    }

    /// Route deliveries until the queue closes, forwarding emitted records
    pub async fn pump(
        self: Arc<Self>,
        mut deliveries: mpsc::UnboundedReceiver<Delivery>,
        emitted: mpsc::UnboundedSender<Emitted>,
    ) {
        while let Some(delivery) = deliveries.recv().await {
            if let Some(record) = self.route(delivery) {
                if emitted.send(record).is_err() {
                    break;
                }
            }
        }
        debug!("Delivery pump stopped");
    }

    /// Apply an edited flow
    ///
    /// Changed definitions take effect on the node's next input, or right
    /// away when precompiling. Removed nodes are closed.
    pub async fn reload(&self, flow: &Flow) -> ReloadSummary {
        let mut summary = ReloadSummary::default();

        let removed: Vec<String> = {
            let nodes = self.nodes.read();
            nodes.keys().filter(|id| flow.node(id).is_none()).cloned().collect()
        };
        for id in removed {
            self.nodes.write().remove(&id);
            self.registry.close(&id).await;
            summary.removed.push(id);
        }

        for spec in &flow.nodes {
            let existing = self.nodes.write().get_mut(&spec.id).map(|entry| {
                entry.wires = spec.wires.clone();
                let changed = entry.definition != spec.script;
                if changed {
                    entry.definition = spec.script.clone();
                }
                (entry.node.clone(), changed)
            });

            match existing {
                None => {
                    self.add_node(spec).await;
                    summary.added.push(spec.id.clone());
                }
                Some((node, true)) => {
                    if self.registry.config().precompile {
                        let _ = node.precompile(&spec.script).await;
                    }
                    summary.updated.push(spec.id.clone());
                }
                Some((_, false)) => {}
            }
        }

        *self.entry.write() = flow.entry_node().map(str::to_string);
        summary.added.sort();
        summary.updated.sort();
        summary.removed.sort();
        info!(
            "Flow reloaded: {} added, {} updated, {} removed",
            summary.added.len(),
            summary.updated.len(),
            summary.removed.len()
        );
        summary
    }

    /// Close every node
    pub async fn shutdown(&self) {
        self.nodes.write().clear();
        self.registry.close_all().await;
    }
}
