//! Module Injection
//!
//! Resolves a node's declared module bindings and binds the results into its
//! sandbox. The whole list is validated before anything is resolved, then all
//! modules are resolved concurrently. One failure aborts the injection.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error};

use flowscript_types::ModuleBinding;

use crate::error::{ScriptError, ScriptResult};
use crate::host::{ModuleResolver, NodeHost};
use crate::sandbox::{SandboxContext, is_reserved};

/// Words that cannot name a binding: they are not valid parameter names
const JS_KEYWORDS: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default",
    "delete", "do", "else", "enum", "export", "extends", "false", "finally", "for", "function",
    "if", "implements", "import", "in", "instanceof", "interface", "let", "new", "null",
    "package", "private", "protected", "public", "return", "static", "super", "switch", "this",
    "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield", "arguments",
    "eval",
];

/// Whether `name` can be used as a binding name
pub fn is_valid_binding_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_alphabetic() || first == '_' || first == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
        && !JS_KEYWORDS.contains(&name)
}

/// Binds resolved modules into a sandbox
pub struct ModuleInjector {
    host: Arc<dyn NodeHost>,
}

impl ModuleInjector {
    pub fn new(host: Arc<dyn NodeHost>) -> Self {
        Self { host }
    }

    /// Check names without resolving anything
    pub fn validate(sandbox: &SandboxContext, bindings: &[ModuleBinding]) -> ScriptResult<()> {
        let mut seen = HashSet::new();
        for binding in bindings {
            let name = binding.binding_name.as_str();
            if is_reserved(name) || sandbox.contains(name) {
                return Err(ScriptError::ReservedName { name: name.to_string() });
            }
            if !is_valid_binding_name(name) {
                return Err(ScriptError::InvalidBindingName { name: name.to_string() });
            }
            if !seen.insert(name) {
                return Err(ScriptError::DuplicateBinding { name: name.to_string() });
            }
        }
        Ok(())
    }

    /// Validate, resolve and bind every declared module
    pub async fn inject(
        &self,
        sandbox: &mut SandboxContext,
        bindings: &[ModuleBinding],
        resolver: &dyn ModuleResolver,
    ) -> ScriptResult<()> {
        Self::validate(sandbox, bindings)?;
        if bindings.is_empty() {
            return Ok(());
        }

        let resolved = join_all(bindings.iter().map(|b| resolver.resolve(&b.module))).await;

        let mut first_failure = None;
        let mut exports = Vec::with_capacity(bindings.len());
        for (binding, result) in bindings.iter().zip(resolved) {
            match result {
                Ok(export) => exports.push((binding, export)),
                Err(message) => {
                    error!(node = %self.host.id(), module = %binding.module, "Failed to load module: {}", message);
                    self.host
                        .error(&format!("Failed to load module '{}': {}", binding.module, message));
                    first_failure.get_or_insert(ScriptError::ModuleLoad {
                        module: binding.module.clone(),
                        message,
                    });
                }
            }
        }
        if let Some(err) = first_failure {
            return Err(err);
        }

        for (binding, export) in exports {
            sandbox.insert_module(&binding.binding_name, binding.module.clone(), export)?;
            debug!(node = %self.host.id(), "Injected module '{}' as {}", binding.module, binding.binding_name);
        }
        Ok(())
    }
}
