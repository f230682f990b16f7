//! Engine Configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings shared by every script node a host creates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout for isolated calls whose definition does not set one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,

    /// QuickJS heap limit per compiled artifact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<usize>,

    /// QuickJS stack limit per compiled artifact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_stack_size_bytes: Option<usize>,

    /// How long a finalize hook may run before its runtime is interrupted
    #[serde(default = "default_finalize_timeout_ms")]
    pub finalize_timeout_ms: u64,

    /// Overall limit for one `fetch` request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_timeout_ms: Option<u64>,

    /// Let `fetch` use the proxy settings from the environment
    #[serde(default = "default_true")]
    pub fetch_system_proxy: bool,

    /// Build the artifact when a node is constructed rather than on first input
    #[serde(default = "default_true")]
    pub precompile: bool,

    /// Forward non-fatal transpiler diagnostics to the node's warn hook
    #[serde(default = "default_true")]
    pub report_diagnostics: bool,
}

fn default_true() -> bool {
    true
}

fn default_finalize_timeout_ms() -> u64 {
    5000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: None,
            memory_limit_bytes: None,
            max_stack_size_bytes: None,
            finalize_timeout_ms: default_finalize_timeout_ms(),
            fetch_timeout_ms: None,
            fetch_system_proxy: true,
            precompile: true,
            report_diagnostics: true,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fallback isolated timeout
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set the heap limit
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }

    /// Set the stack limit
    pub fn with_max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size_bytes = Some(bytes);
        self
    }

    /// Set the finalize limit
    pub fn with_finalize_timeout(mut self, timeout: Duration) -> Self {
        self.finalize_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the `fetch` request limit
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Enable or disable environment proxies for `fetch`
    pub fn fetch_system_proxy(mut self, enabled: bool) -> Self {
        self.fetch_system_proxy = enabled;
        self
    }

    /// Enable or disable eager compilation
    pub fn precompile(mut self, precompile: bool) -> Self {
        self.precompile = precompile;
        self
    }

    /// Enable or disable diagnostic forwarding
    pub fn report_diagnostics(mut self, report: bool) -> Self {
        self.report_diagnostics = report;
        self
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }

    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_millis(self.finalize_timeout_ms)
    }
}
