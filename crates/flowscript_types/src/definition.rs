//! Script Definitions
//!
//! The per-node input the engine compiles: script texts, execution strategy,
//! module bindings and the version stamp used to detect edits.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Version Stamp
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque version of a script definition, bumped by the editor on every save
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionStamp(pub u64);

impl VersionStamp {
    /// Whether the host never assigned a stamp
    pub fn is_unset(&self) -> bool {
        self.0 == 0
    }

    /// The next stamp in sequence
    pub fn next(&self) -> Self {
        Self(self.0.wrapping_add(1).max(1))
    }
}

impl fmt::Display for VersionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for VersionStamp {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Strategy
// ─────────────────────────────────────────────────────────────────────────────

/// How a compiled script is run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Compiled once into a closure over the sandbox bindings
    #[default]
    Direct,
    /// Evaluated inside a separate realm whose globals are the sandbox bindings
    Isolated,
}

impl Strategy {
    /// Map the editor's boolean isolation flag onto a strategy
    pub fn from_isolated(isolated: bool) -> Self {
        if isolated { Self::Isolated } else { Self::Direct }
    }

    pub fn is_isolated(&self) -> bool {
        *self == Self::Isolated
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Direct => write!(f, "direct"),
            Strategy::Isolated => write!(f, "isolated"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module Binding
// ─────────────────────────────────────────────────────────────────────────────

/// A module the script expects to find bound under `binding_name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleBinding {
    /// Name the module is visible under inside the script
    #[serde(rename = "var")]
    pub binding_name: String,

    /// Identifier handed to the host's module resolver
    pub module: String,
}

impl ModuleBinding {
    pub fn new(binding_name: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            binding_name: binding_name.into(),
            module: module.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Script Definition
// ─────────────────────────────────────────────────────────────────────────────

/// Everything the engine needs to build one compiled artifact
///
/// Owned by the host's node configuration and treated as read-only by the
/// engine. A new artifact is built whenever the stamp or strategy changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptDefinition {
    /// Function-scope body run for every input
    pub body: String,

    /// Run once after a new artifact is installed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialize: Option<String>,

    /// Run once before an artifact is superseded or the node closes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize: Option<String>,

    #[serde(default)]
    pub strategy: Strategy,

    /// Wall-clock limit for each isolated call, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Declared module bindings, in injection order
    #[serde(default)]
    pub modules: Vec<ModuleBinding>,

    #[serde(default)]
    pub version: VersionStamp,
}

impl ScriptDefinition {
    /// Create a direct-strategy definition with just a body
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// Set the initialize script
    pub fn with_initialize(mut self, source: impl Into<String>) -> Self {
        self.initialize = Some(source.into());
        self
    }

    /// Set the finalize script
    pub fn with_finalize(mut self, source: impl Into<String>) -> Self {
        self.finalize = Some(source.into());
        self
    }

    /// Switch to the isolated strategy with an optional per-call timeout
    pub fn isolated(mut self, timeout: Option<Duration>) -> Self {
        self.strategy = Strategy::Isolated;
        self.timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    /// Declare a module binding
    pub fn with_module(mut self, binding_name: impl Into<String>, module: impl Into<String>) -> Self {
        self.modules.push(ModuleBinding::new(binding_name, module));
        self
    }

    /// Set the version stamp
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = VersionStamp(version);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Initialize text, treating blank text as absent
    pub fn initialize_source(&self) -> Option<&str> {
        non_blank(self.initialize.as_deref())
    }

    /// Finalize text, treating blank text as absent
    pub fn finalize_source(&self) -> Option<&str> {
        non_blank(self.finalize.as_deref())
    }

    /// Stamp derived from the script texts, timeout and module list
    pub fn content_stamp(&self) -> VersionStamp {
        let mut hasher = DefaultHasher::new();
        self.body.hash(&mut hasher);
        self.initialize_source().hash(&mut hasher);
        self.finalize_source().hash(&mut hasher);
        self.timeout_ms.hash(&mut hasher);
        self.modules.hash(&mut hasher);
        // Zero is reserved for "unset"
        VersionStamp(hasher.finish().max(1))
    }

    /// The explicit stamp when the host assigned one, the content stamp otherwise
    pub fn effective_version(&self) -> VersionStamp {
        if self.version.is_unset() {
            self.content_stamp()
        } else {
            self.version
        }
    }
}

fn non_blank(text: Option<&str>) -> Option<&str> {
    text.filter(|t| !t.trim().is_empty())
}
