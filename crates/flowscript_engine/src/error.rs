//! Script Errors
//!
//! One error type for every boundary of the engine: compile, inject,
//! initialize, execute, finalize and timer callbacks.

use std::time::Duration;

use flowscript_types::ErrorDetail;
use serde_json::{Value, json};

// ─────────────────────────────────────────────────────────────────────────────
// Script Error
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can occur while compiling or running a script
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScriptError {
    #[error("Script body is empty")]
    EmptyScript,

    #[error("Compilation failed: {0}")]
    Compilation(ErrorDetail),

    #[error("Invalid module binding name: '{name}'")]
    InvalidBindingName { name: String },

    #[error("Module binding '{name}' uses a reserved name")]
    ReservedName { name: String },

    #[error("Module binding '{name}' is declared more than once")]
    DuplicateBinding { name: String },

    #[error("Failed to load module '{module}': {message}")]
    ModuleLoad { module: String, message: String },

    #[error("Script timed out after {}ms", .limit.as_millis())]
    Timeout { limit: Duration },

    #[error("Initialize failed: {0}")]
    Initialize(ErrorDetail),

    #[error("Finalize failed: {0}")]
    Finalize(ErrorDetail),

    #[error("Execution failed: {0}")]
    Execution(ErrorDetail),

    #[error("Script runtime error: {0}")]
    Runtime(String),

    #[error("Script node is closed")]
    Closed,
}

/// Result type for engine operations
pub type ScriptResult<T> = Result<T, ScriptError>;

impl ScriptError {
    /// Stable name of the error kind, used in host-facing payloads
    pub fn kind(&self) -> &'static str {
        match self {
            ScriptError::EmptyScript => "EmptyScriptError",
            ScriptError::Compilation(_) => "CompilationError",
            ScriptError::InvalidBindingName { .. } => "InvalidBindingNameError",
            ScriptError::ReservedName { .. } => "ReservedNameError",
            ScriptError::DuplicateBinding { .. } => "DuplicateBindingError",
            ScriptError::ModuleLoad { .. } => "ModuleLoadError",
            ScriptError::Timeout { .. } => "TimeoutError",
            ScriptError::Initialize(_) => "InitializeError",
            ScriptError::Finalize(_) => "FinalizeError",
            ScriptError::Execution(_) => "ExecutionError",
            ScriptError::Runtime(_) => "RuntimeError",
            ScriptError::Closed => "ClosedError",
        }
    }

    /// Whether the error happened while building an artifact
    pub fn is_build_error(&self) -> bool {
        matches!(
            self,
            ScriptError::EmptyScript
                | ScriptError::Compilation(_)
                | ScriptError::InvalidBindingName { .. }
                | ScriptError::ReservedName { .. }
                | ScriptError::DuplicateBinding { .. }
                | ScriptError::ModuleLoad { .. }
                | ScriptError::Runtime(_)
        )
    }

    /// Structured payload captured from the script, if any
    pub fn detail(&self) -> Option<&ErrorDetail> {
        match self {
            ScriptError::Compilation(d)
            | ScriptError::Initialize(d)
            | ScriptError::Finalize(d)
            | ScriptError::Execution(d) => Some(d),
            _ => None,
        }
    }

    /// JSON rendering for hosts that forward errors as messages
    pub fn to_json(&self) -> Value {
        let mut out = json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        if let Some(detail) = self.detail() {
            out["detail"] = detail.to_json();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = ScriptError::Timeout { limit: Duration::from_millis(50) };
        assert_eq!(err.to_string(), "Script timed out after 50ms");
        assert_eq!(err.kind(), "TimeoutError");
        assert!(!err.is_build_error());

        let err = ScriptError::ModuleLoad { module: "left-pad".into(), message: "not found".into() };
        assert_eq!(err.to_string(), "Failed to load module 'left-pad': not found");
        assert!(err.is_build_error());
    }

    #[test]
    fn test_to_json_includes_detail() {
        let err = ScriptError::Execution(ErrorDetail::new("x").with_stack("at <eval>"));
        let json = err.to_json();
        assert_eq!(json["kind"], "ExecutionError");
        assert_eq!(json["message"], "Execution failed: x");
        assert_eq!(json["detail"]["stack"], "at <eval>");
    }
}
