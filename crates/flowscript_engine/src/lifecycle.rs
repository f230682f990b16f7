//! Lifecycle Controller
//!
//! [`ScriptNode`] owns everything one node instance needs to run its script:
//! the current artifact, the timer registry and the lifecycle state. Every
//! input carries the node's definition; the controller compares it with the
//! cached artifact and rebuilds when the version stamp or strategy changed.
//!
//! # States
//!
//! ```text
//! Empty -> Compiling -> Ready -> Compiling -> Finalizing -> Ready -> ... -> Closed
//! ```
//!
//! A replacement artifact is built before the outgoing one is finalized, so
//! a definition that fails to compile leaves the previous artifact current.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use flowscript_types::{ErrorDetail, Outputs, ScriptDefinition};

use crate::artifact::{CacheKey, CompiledArtifact};
use crate::cache::{CompilationCache, Lookup};
use crate::config::EngineConfig;
use crate::error::{ScriptError, ScriptResult};
use crate::host::{ModuleResolver, NodeHost};
use crate::sandbox::CallScope;
use crate::timers::TimerRegistry;

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle State
// ─────────────────────────────────────────────────────────────────────────────

/// Where a node instance is in its artifact lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    /// No artifact built yet
    Empty = 0,
    /// A build is in progress; callers wait for it
    Compiling = 1,
    /// An artifact is installed and serving calls
    Ready = 2,
    /// The outgoing artifact's finalize hook is running
    Finalizing = 3,
    /// Terminal
    Closed = 4,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Empty,
            1 => LifecycleState::Compiling,
            2 => LifecycleState::Ready,
            3 => LifecycleState::Finalizing,
            _ => LifecycleState::Closed,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Empty => write!(f, "empty"),
            LifecycleState::Compiling => write!(f, "compiling"),
            LifecycleState::Ready => write!(f, "ready"),
            LifecycleState::Finalizing => write!(f, "finalizing"),
            LifecycleState::Closed => write!(f, "closed"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Script Node
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle controller for one node instance
///
/// Compilation is single-flight: the artifact slot is guarded by an async
/// mutex held across build, finalize and initialize, so concurrent callers
/// wait for the in-flight build instead of starting another one.
///
/// Execution is not serialized. Each `execute` clones the current artifact
/// and runs outside the lock, so a second input to the same instance can
/// start before the first one finishes. Direct scripts interleave at their
/// await points; isolated calls of one artifact run one at a time. Hosts
/// that need strict per-node ordering must queue inputs themselves.
pub struct ScriptNode {
    host: Arc<dyn NodeHost>,
    resolver: Arc<dyn ModuleResolver>,
    config: EngineConfig,
    timers: Arc<TimerRegistry>,
    slot: Mutex<CompilationCache>,
    state: AtomicU8,
}

impl ScriptNode {
    pub fn new(host: Arc<dyn NodeHost>, resolver: Arc<dyn ModuleResolver>, config: EngineConfig) -> Self {
        let timers = TimerRegistry::new_shared(host.id());
        Self {
            host,
            resolver,
            config,
            timers,
            slot: Mutex::new(CompilationCache::new()),
            state: AtomicU8::new(LifecycleState::Empty as u8),
        }
    }

    /// Create a node and, when configured, build its artifact right away
    ///
    /// Build errors are reported through the host, not returned; the next
    /// input retries only if the definition changed.
    pub async fn with_definition(
        host: Arc<dyn NodeHost>,
        resolver: Arc<dyn ModuleResolver>,
        config: EngineConfig,
        definition: &ScriptDefinition,
    ) -> Self {
        let node = Self::new(host, resolver, config);
        if node.config.precompile {
            let _ = node.precompile(definition).await;
        }
        node
    }

    pub fn id(&self) -> &str {
        self.host.id()
    }

    pub fn host(&self) -> &Arc<dyn NodeHost> {
        &self.host
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = LifecycleState::from_u8(self.state.swap(state as u8, Ordering::SeqCst));
        if previous != state {
            debug!(node = %self.id(), "Lifecycle {} -> {}", previous, state);
        }
    }

    /// The node's timer registry
    pub fn timers(&self) -> &Arc<TimerRegistry> {
        &self.timers
    }

    /// The installed artifact, waiting for any in-flight build
    pub async fn current(&self) -> Option<Arc<CompiledArtifact>> {
        self.slot.lock().await.current()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Compilation
    // ─────────────────────────────────────────────────────────────────────────

    /// The artifact for `definition`, building it if the cached one is stale
    ///
    /// On a rebuild the outgoing artifact is finalized, its timers are
    /// cancelled and its runtime stopped before the new artifact is
    /// installed and initialized. Initialize runs exactly once per artifact,
    /// before any execute is served against it.
    pub async fn get_compilation(&self, definition: &ScriptDefinition) -> ScriptResult<Arc<CompiledArtifact>> {
        let key = CacheKey::of(definition);
        let mut slot = self.slot.lock().await;
        if self.state() == LifecycleState::Closed {
            return Err(ScriptError::Closed);
        }

        match slot.lookup(&key) {
            Lookup::Hit(artifact) => return Ok(artifact),
            Lookup::Failed(err) => return Err(err),
            Lookup::Miss => {}
        }

        self.set_state(LifecycleState::Compiling);
        self.host.log(&format!("Compiling TypeScript ({} chars)", definition.body.len()));
        let generation = slot.next_generation();
        let built = CompiledArtifact::build(
            definition,
            self.host.clone(),
            self.resolver.as_ref(),
            self.timers.clone(),
            generation,
            &self.config,
        )
        .await;

        let artifact = match built {
            Ok(artifact) => Arc::new(artifact),
            Err(err) => {
                warn!(node = %self.id(), key = %key, "Compilation failed: {}", err);
                slot.remember_failure(key, err.clone());
                self.set_state(if slot.current().is_some() {
                    LifecycleState::Ready
                } else {
                    LifecycleState::Empty
                });
                return Err(err);
            }
        };

        if let Some(previous) = slot.current() {
            self.set_state(LifecycleState::Finalizing);
            self.retire(&previous).await;
        }
        slot.install(artifact.clone());

        if self.config.report_diagnostics {
            for diagnostic in artifact.diagnostics() {
                warn!(node = %self.id(), "Script diagnostic: {}", diagnostic);
                self.host.warn(diagnostic);
            }
        }

        if let Err(err) = artifact.initialize(self.hook_scope()).await {
            self.report(&err);
        }

        self.set_state(LifecycleState::Ready);
        info!(node = %self.id(), key = %key, generation, strategy = %artifact.strategy(), "Script compiled");
        self.host.log("Script compiled and cached");
        Ok(artifact)
    }

    /// Build eagerly, reporting any failure through the host
    pub async fn precompile(&self, definition: &ScriptDefinition) -> ScriptResult<()> {
        match self.get_compilation(definition).await {
            Ok(_) => Ok(()),
            Err(err) => {
                self.report(&err);
                Err(err)
            }
        }
    }

    /// Finalize an outgoing artifact and release its resources
    ///
    /// A finalize hook that outlives the configured limit, or that cannot
    /// start because the runtime is stuck in a call, is reported and its
    /// runtime interrupted.
    async fn retire(&self, artifact: &CompiledArtifact) {
        self.host.log("Cleaning up");
        let limit = self.config.finalize_timeout();
        match tokio::time::timeout(limit, artifact.finalize(self.hook_scope())).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.report(&err),
            Err(_) => {
                self.report(&ScriptError::Finalize(ErrorDetail::new(format!(
                    "Finalize did not complete within {}ms",
                    limit.as_millis()
                ))));
                artifact.interrupt();
            }
        }
        let cancelled = self.timers.drain_generation(artifact.generation());
        artifact.shutdown().await;
        debug!(
            node = %self.id(),
            generation = artifact.generation(),
            "Retired artifact ({} timers cancelled)",
            cancelled
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────────

    /// Run the script for one message and decode its outputs
    pub async fn execute(&self, definition: &ScriptDefinition, msg: Value) -> ScriptResult<Outputs> {
        let artifact = self.get_compilation(definition).await?;
        let value = artifact
            .execute(CallScope::message(msg, self.host.context()))
            .await?;
        Ok(Outputs::from_value(value))
    }

    /// Input boundary for hosts
    ///
    /// Sends the outputs downstream and reports every error through the
    /// host. Nothing escapes to the caller.
    pub async fn handle_input(&self, definition: &ScriptDefinition, msg: Value) {
        match self.execute(definition, msg).await {
            Ok(outputs) => {
                if !outputs.is_empty() {
                    self.host.send(outputs);
                }
            }
            Err(err) => self.report(&err),
        }
    }

    /// Finalize the current artifact, cancel every timer and stop accepting calls
    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;
        if self.state() == LifecycleState::Closed {
            return;
        }

        if let Some(artifact) = slot.take() {
            self.set_state(LifecycleState::Finalizing);
            self.retire(&artifact).await;
        }
        let swept = self.timers.drain_all();
        self.set_state(LifecycleState::Closed);
        info!(node = %self.id(), "Script node closed ({} stray timers cancelled)", swept);
    }

    fn hook_scope(&self) -> CallScope {
        CallScope::hook(self.host.context())
    }

    fn report(&self, err: &ScriptError) {
        error!(node = %self.id(), kind = err.kind(), "{}", err);
        self.host.error(&err.to_string());
    }
}

impl std::fmt::Debug for ScriptNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptNode")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("timers", &self.timers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_u8() {
        for state in [
            LifecycleState::Empty,
            LifecycleState::Compiling,
            LifecycleState::Ready,
            LifecycleState::Finalizing,
            LifecycleState::Closed,
        ] {
            assert_eq!(LifecycleState::from_u8(state as u8), state);
        }
        assert_eq!(LifecycleState::Finalizing.to_string(), "finalizing");
    }
}
