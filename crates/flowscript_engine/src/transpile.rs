//! TypeScript Transpiler
//!
//! Lowers script text to JavaScript. The text is wrapped in an anonymous async
//! function first so top-level `return` and `await` are legal. Types are
//! stripped, never checked: the only hard failure is unparsable syntax.

use std::sync::Arc;

use deno_ast::{
    EmitOptions, MediaType, ModuleSpecifier, ParseParams, SourceMapOption, TranspileOptions,
};
use tracing::debug;

use flowscript_types::ErrorDetail;

use crate::error::{ScriptError, ScriptResult};

/// Lines added in front of the author's text by the async wrapper
pub const WRAPPER_LINE_OFFSET: u32 = 1;

/// Transpiled script, ready to hand to an execution strategy
///
/// `code` is a single expression that evaluates to a promise of the script's
/// return value.
#[derive(Debug, Clone, PartialEq)]
pub struct LoweredBody {
    pub code: String,

    /// Non-fatal parser diagnostics
    pub diagnostics: Vec<String>,
}

/// Transpiles the scripts of one node
#[derive(Debug, Clone)]
pub struct Transpiler {
    node_id: String,
}

impl Transpiler {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self { node_id: node_id.into() }
    }

    /// Transpile a required script
    pub fn transpile(&self, source: &str) -> ScriptResult<LoweredBody> {
        if source.trim().is_empty() {
            return Err(ScriptError::EmptyScript);
        }
        self.lower("body", source)
    }

    /// Transpile an optional lifecycle hook; blank text means no hook
    pub fn transpile_hook(&self, phase: &str, source: Option<&str>) -> ScriptResult<Option<LoweredBody>> {
        match source {
            Some(text) if !text.trim().is_empty() => self.lower(phase, text).map(Some),
            _ => Ok(None),
        }
    }

    fn lower(&self, phase: &str, source: &str) -> ScriptResult<LoweredBody> {
        debug!(node = %self.node_id, phase, "Compiling TypeScript ({} chars)", source.len());

        let wrapped = format!("(async function() {{\n{}\n}})()", source);
        let specifier = ModuleSpecifier::parse(&format!("file:///flowscript/{}/{}.ts", self.node_id, phase))
            .or_else(|_| ModuleSpecifier::parse(&format!("file:///flowscript/{}.ts", phase)))
            .map_err(|e| ScriptError::Runtime(e.to_string()))?;

        let parsed = deno_ast::parse_script(ParseParams {
            specifier,
            text: Arc::from(wrapped),
            media_type: MediaType::TypeScript,
            capture_tokens: false,
            scope_analysis: false,
            maybe_syntax: None,
        })
        .map_err(|e| {
            ScriptError::Compilation(
                ErrorDetail::new(e.to_string())
                    .with_property("phase", phase)
                    .with_property("stage", "parse")
                    .with_property("lineOffset", WRAPPER_LINE_OFFSET),
            )
        })?;

        let diagnostics = parsed.diagnostics().iter().map(|d| d.to_string()).collect();

        let emitted = parsed
            .transpile(
                &TranspileOptions::default(),
                &EmitOptions {
                    source_map: SourceMapOption::None,
                    ..Default::default()
                },
            )
            .map_err(|e| {
                ScriptError::Compilation(
                    ErrorDetail::new(e.to_string())
                        .with_property("phase", phase)
                        .with_property("stage", "transpile"),
                )
            })?
            .into_source();

        let text = String::from_utf8(emitted.source).map_err(|e| {
            ScriptError::Compilation(
                ErrorDetail::new(format!("Transpiled output is not UTF-8: {}", e))
                    .with_property("phase", phase)
                    .with_property("stage", "transpile"),
            )
        })?;
        let code = text.trim_end().trim_end_matches(';').to_string();

        Ok(LoweredBody { code, diagnostics })
    }
}
