//! Flow Checks
//!
//! Compile-only validation of every script in a flow: transpile the body and
//! hooks and check module binding names, without starting any runtime.

use std::collections::HashSet;

use flowscript_engine::modules::is_valid_binding_name;
use flowscript_engine::sandbox::is_reserved;
use flowscript_engine::{ScriptError, Transpiler};

use crate::flow::{Flow, FlowNode};

/// Result of checking one node
#[derive(Debug)]
pub struct NodeReport {
    pub node: String,
    pub diagnostics: Vec<String>,
    pub errors: Vec<ScriptError>,
}

impl NodeReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Check every node of `flow`, in file order
pub fn check_flow(flow: &Flow) -> Vec<NodeReport> {
    flow.nodes.iter().map(check_node).collect()
}

pub fn check_node(node: &FlowNode) -> NodeReport {
    let transpiler = Transpiler::new(node.id.as_str());
    let script = &node.script;
    let mut report = NodeReport {
        node: node.id.clone(),
        diagnostics: Vec::new(),
        errors: Vec::new(),
    };

    let lowered = [
        transpiler.transpile(&script.body).map(Some),
        transpiler.transpile_hook("initialize", script.initialize_source()),
        transpiler.transpile_hook("finalize", script.finalize_source()),
    ];
    for result in lowered {
        match result {
            Ok(Some(body)) => report.diagnostics.extend(body.diagnostics),
            Ok(None) => {}
            Err(err) => report.errors.push(err),
        }
    }

    let mut seen = HashSet::new();
    for binding in &script.modules {
        let name = binding.binding_name.as_str();
        if is_reserved(name) {
            report.errors.push(ScriptError::ReservedName { name: name.to_string() });
        } else if !is_valid_binding_name(name) {
            report.errors.push(ScriptError::InvalidBindingName { name: name.to_string() });
        } else if !seen.insert(name) {
            report.errors.push(ScriptError::DuplicateBinding { name: name.to_string() });
        }
    }
    report
}
