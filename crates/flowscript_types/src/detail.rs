//! Error Details
//!
//! Structured payload attached to script errors so hosts can render a useful
//! diagnostic without knowing which JavaScript error type was thrown.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message, stack and enumerable properties captured from a failure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// Enumerable own properties of the thrown value
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
}

impl ErrorDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Attach a stack trace
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        let stack = stack.into();
        if !stack.trim().is_empty() {
            self.stack = Some(stack);
        }
        self
    }

    /// Attach a named property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Names of the captured properties
    pub fn keys(&self) -> Vec<&str> {
        self.properties.keys().map(String::as_str).collect()
    }

    /// JSON rendering, including the property names as `errorKeys`
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        out.insert("message".into(), Value::String(self.message.clone()));
        if let Some(stack) = &self.stack {
            out.insert("stack".into(), Value::String(stack.clone()));
        }
        out.insert(
            "errorKeys".into(),
            Value::Array(self.keys().into_iter().map(|k| Value::String(k.into())).collect()),
        );
        if !self.properties.is_empty() {
            out.insert("properties".into(), Value::Object(self.properties.clone()));
        }
        Value::Object(out)
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<&str> for ErrorDetail {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for ErrorDetail {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_json() {
        let detail = ErrorDetail::new("Unexpected token")
            .with_stack("at body.ts:1:5")
            .with_property("code", "E_SYNTAX");

        assert_eq!(
            detail.to_json(),
            json!({
                "message": "Unexpected token",
                "stack": "at body.ts:1:5",
                "errorKeys": ["code"],
                "properties": { "code": "E_SYNTAX" }
            })
        );
        assert_eq!(detail.to_string(), "Unexpected token");
    }

    #[test]
    fn test_blank_stack_dropped() {
        let detail = ErrorDetail::new("boom").with_stack("  ");
        assert!(detail.stack.is_none());
        assert_eq!(detail.to_json(), json!({ "message": "boom", "errorKeys": [] }));
    }
}
