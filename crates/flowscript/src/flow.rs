//! Flow Files
//!
//! A flow file lists script nodes and the wires between their output ports.
//! Both TOML and JSON are accepted, chosen by file extension.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use flowscript_types::ScriptDefinition;

/// Error type for flow loading
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Flow file does not exist: {0}")]
    PathNotFound(PathBuf),

    #[error("Unsupported flow file format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParseError(#[from] serde_json::Error),

    #[error("Flow has no nodes")]
    Empty,

    #[error("Node '{0}' is defined more than once")]
    DuplicateNode(String),

    #[error("Node '{from}' is wired to unknown node '{to}'")]
    UnknownWire { from: String, to: String },

    #[error("Entry node '{0}' is not defined")]
    UnknownEntry(String),
}

/// One script node of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    pub script: ScriptDefinition,

    /// Target node ids, one list per output port
    #[serde(default)]
    pub wires: Vec<Vec<String>>,
}

impl FlowNode {
    /// Display name, falling back to the id
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Targets wired to `port`
    pub fn targets(&self, port: usize) -> &[String] {
        self.wires.get(port).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// A loaded flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    #[serde(default)]
    pub name: Option<String>,

    /// Node that receives bare input messages; the first node when unset
    #[serde(default)]
    pub entry: Option<String>,

    #[serde(default, rename = "node", alias = "nodes")]
    pub nodes: Vec<FlowNode>,
}

impl Flow {
    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Id of the node bare messages are delivered to
    pub fn entry_node(&self) -> Option<&str> {
        self.entry
            .as_deref()
            .or_else(|| self.nodes.first().map(|n| n.id.as_str()))
    }

    /// Check ids are unique and every wire and the entry point at a node
    pub fn validate(&self) -> Result<(), LoadError> {
        if self.nodes.is_empty() {
            return Err(LoadError::Empty);
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(LoadError::DuplicateNode(node.id.clone()));
            }
        }

        for node in &self.nodes {
            for target in node.wires.iter().flatten() {
                if !ids.contains(target.as_str()) {
                    return Err(LoadError::UnknownWire {
                        from: node.id.clone(),
                        to: target.clone(),
                    });
                }
            }
        }

        if let Some(entry) = &self.entry {
            if !ids.contains(entry.as_str()) {
                return Err(LoadError::UnknownEntry(entry.clone()));
            }
        }
        Ok(())
    }
}

/// Flow file loader
pub struct FlowLoader;

impl FlowLoader {
    /// Load and validate a flow file
    pub async fn load(path: impl AsRef<Path>) -> Result<Flow, LoadError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LoadError::PathNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).await?;
        let flow = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::parse_toml(&content)?,
            Some("json") => Self::parse_json(&content)?,
            _ => return Err(LoadError::UnsupportedFormat(path.to_path_buf())),
        };

        info!(
            "Loaded flow {} from {} ({} nodes)",
            flow.name.as_deref().unwrap_or("<unnamed>"),
            path.display(),
            flow.nodes.len()
        );
        Ok(flow)
    }

    pub fn parse_toml(content: &str) -> Result<Flow, LoadError> {
        let flow: Flow = toml::from_str(content)?;
        flow.validate()?;
        debug!("Parsed TOML flow with {} nodes", flow.nodes.len());
        Ok(flow)
    }

    pub fn parse_json(content: &str) -> Result<Flow, LoadError> {
        let flow: Flow = serde_json::from_str(content)?;
        flow.validate()?;
        debug!("Parsed JSON flow with {} nodes", flow.nodes.len());
        Ok(flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowscript_types::Strategy;

    const FLOW_TOML: &str = r#"
name = "enrich"

[[node]]
id = "parse"
wires = [["double"], []]

[node.script]
body = "return [msg, null];"

[[node]]
id = "double"
name = "Double it"

[node.script]
body = "return { payload: msg.payload * 2 };"
strategy = "isolated"
timeout_ms = 100
"#;

    #[test]
    fn test_parse_toml() {
        let flow = FlowLoader::parse_toml(FLOW_TOML).unwrap();

        assert_eq!(flow.name.as_deref(), Some("enrich"));
        assert_eq!(flow.entry_node(), Some("parse"));
        assert_eq!(flow.nodes.len(), 2);

        let parse = flow.node("parse").unwrap();
        assert_eq!(parse.targets(0), ["double".to_string()]);
        assert!(parse.targets(1).is_empty());
        assert!(parse.targets(5).is_empty());
        assert_eq!(parse.display_name(), "parse");

        let double = flow.node("double").unwrap();
        assert_eq!(double.display_name(), "Double it");
        assert_eq!(double.script.strategy, Strategy::Isolated);
        assert_eq!(double.script.timeout_ms, Some(100));
    }

    #[test]
    fn test_parse_json() {
        let flow = FlowLoader::parse_json(
            r#"{
                "entry": "b",
                "nodes": [
                    { "id": "a", "script": { "body": "return msg;" } },
                    { "id": "b", "script": { "body": "return msg;" }, "wires": [["a"]] }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(flow.entry_node(), Some("b"));
    }

    #[test]
    fn test_rejects_bad_wiring() {
        let err = FlowLoader::parse_json(
            r#"{ "nodes": [{ "id": "a", "script": { "body": "return msg;" }, "wires": [["ghost"]] }] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, LoadError::UnknownWire { ref to, .. } if to == "ghost"));

        let err = FlowLoader::parse_json(
            r#"{ "nodes": [
                { "id": "a", "script": { "body": "1" } },
                { "id": "a", "script": { "body": "2" } }
            ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, LoadError::DuplicateNode(ref id) if id == "a"));

        let err = FlowLoader::parse_json(r#"{ "nodes": [] }"#).unwrap_err();
        assert!(matches!(err, LoadError::Empty));
    }

    #[tokio::test]
    async fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.toml");
        std::fs::write(&path, FLOW_TOML).unwrap();

        let flow = FlowLoader::load(&path).await.unwrap();
        assert_eq!(flow.nodes.len(), 2);

        let yaml = dir.path().join("flow.yaml");
        std::fs::write(&yaml, "nodes: []").unwrap();
        assert!(matches!(
            FlowLoader::load(&yaml).await,
            Err(LoadError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            FlowLoader::load(dir.path().join("missing.toml")).await,
            Err(LoadError::PathNotFound(_))
        ));
    }
}
