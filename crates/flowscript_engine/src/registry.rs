//! Script Node Registry
//!
//! Instance-keyed store of script nodes. All mutable per-node state (current
//! artifact, timers, lifecycle) lives in the [`ScriptNode`]; the registry only
//! maps node ids to them.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::host::{ModuleResolver, NodeHost};
use crate::lifecycle::ScriptNode;

/// Script nodes of one host, keyed by node id
pub struct ScriptNodeRegistry {
    nodes: DashMap<String, Arc<ScriptNode>>,
    resolver: Arc<dyn ModuleResolver>,
    config: EngineConfig,
}

impl ScriptNodeRegistry {
    pub fn new(resolver: Arc<dyn ModuleResolver>, config: EngineConfig) -> Self {
        Self {
            nodes: DashMap::new(),
            resolver,
            config,
        }
    }

    /// Create a new registry wrapped in an Arc
    pub fn new_shared(resolver: Arc<dyn ModuleResolver>, config: EngineConfig) -> Arc<Self> {
        Arc::new(Self::new(resolver, config))
    }

    /// The node for `host`, created on first use
    pub fn get_or_create(&self, host: Arc<dyn NodeHost>) -> Arc<ScriptNode> {
        self.nodes
            .entry(host.id().to_string())
            .or_insert_with(|| {
                debug!(node = %host.id(), "Creating script node");
                Arc::new(ScriptNode::new(host.clone(), self.resolver.clone(), self.config.clone()))
            })
            .clone()
    }

    /// Register an already constructed node, returning the one it replaces
    pub fn insert(&self, node: Arc<ScriptNode>) -> Option<Arc<ScriptNode>> {
        self.nodes.insert(node.id().to_string(), node)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ScriptNode>> {
        self.nodes.get(id).map(|n| n.value().clone())
    }

    /// Remove and close one node
    pub async fn close(&self, id: &str) -> bool {
        let Some((_, node)) = self.nodes.remove(id) else {
            return false;
        };
        node.close().await;
        true
    }

    /// Remove and close every node, concurrently
    pub async fn close_all(&self) {
        let ids = self.ids();
        let nodes: Vec<Arc<ScriptNode>> = ids
            .iter()
            .filter_map(|id| self.nodes.remove(id).map(|(_, node)| node))
            .collect();

        let count = nodes.len();
        join_all(nodes.iter().map(|node| node.close())).await;
        info!("Closed {} script nodes", count);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<dyn ModuleResolver> {
        &self.resolver
    }
}
