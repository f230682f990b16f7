//! Compiled Artifacts
//!
//! A compiled artifact is one definition, transpiled and loaded into its own
//! script runtime together with the sandbox built for it. The two always
//! share a lifetime: a new definition gets a new sandbox and a new runtime.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use flowscript_types::{ScriptDefinition, Strategy, VersionStamp};

use crate::config::EngineConfig;
use crate::error::ScriptResult;
use crate::fetch::FetchClient;
use crate::host::{ModuleResolver, NodeHost};
use crate::js::{RuntimeLimits, ScriptRuntime};
use crate::sandbox::{CallScope, ContextBuilder};
use crate::strategy::{Phase, StrategyPlan};
use crate::timers::TimerRegistry;
use crate::transpile::Transpiler;

/// What an artifact was built from
///
/// Two definitions with the same key share an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub version: VersionStamp,
    pub strategy: Strategy,
}

impl CacheKey {
    pub fn of(definition: &ScriptDefinition) -> Self {
        Self {
            version: definition.effective_version(),
            strategy: definition.strategy,
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.version, self.strategy)
    }
}

/// A definition ready to run
#[derive(Debug)]
pub struct CompiledArtifact {
    key: CacheKey,
    generation: u64,
    runtime: ScriptRuntime,
    diagnostics: Vec<String>,
    has_initialize: bool,
    has_finalize: bool,
}

impl CompiledArtifact {
    /// Transpile, build the sandbox and load everything into a new runtime
    pub async fn build(
        definition: &ScriptDefinition,
        host: Arc<dyn NodeHost>,
        resolver: &dyn ModuleResolver,
        timers: Arc<TimerRegistry>,
        generation: u64,
        config: &EngineConfig,
    ) -> ScriptResult<Self> {
        let key = CacheKey::of(definition);
        let node_id = host.id().to_string();
        debug!(node = %node_id, key = %key, generation, "Building artifact");

        let transpiler = Transpiler::new(node_id.as_str());
        let body = transpiler.transpile(&definition.body)?;
        let initialize = transpiler.transpile_hook("initialize", definition.initialize_source())?;
        let finalize = transpiler.transpile_hook("finalize", definition.finalize_source())?;

        let mut diagnostics = body.diagnostics;
        for hook in [&initialize, &finalize].into_iter().flatten() {
            diagnostics.extend(hook.diagnostics.iter().cloned());
        }

        let sandbox = ContextBuilder::new(host, timers)
            .with_fetch(FetchClient::new(config))
            .build(resolver, &definition.modules, generation)
            .await?;

        let has_initialize = initialize.is_some();
        let has_finalize = finalize.is_some();
        let timeout = match definition.strategy {
            Strategy::Isolated => definition.timeout().or_else(|| config.default_timeout()),
            Strategy::Direct => None,
        };

        let plan = StrategyPlan {
            kind: definition.strategy,
            body: body.code,
            initialize: initialize.map(|hook| hook.code),
            finalize: finalize.map(|hook| hook.code),
            timeout,
            sandbox,
        };
        let runtime = ScriptRuntime::spawn(
            format!("{}#{}", node_id, generation),
            plan,
            RuntimeLimits::from(config),
        )
        .await?;

        Ok(Self {
            key,
            generation,
            runtime,
            diagnostics,
            has_initialize,
            has_finalize,
        })
    }

    pub fn key(&self) -> CacheKey {
        self.key
    }

    pub fn strategy(&self) -> Strategy {
        self.key.strategy
    }

    pub fn version(&self) -> VersionStamp {
        self.key.version
    }

    /// Generation tag carried by the artifact's timers
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Non-fatal transpiler diagnostics
    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    pub fn has_initialize(&self) -> bool {
        self.has_initialize
    }

    pub fn has_finalize(&self) -> bool {
        self.has_finalize
    }

    /// Run the body against one message
    pub async fn execute(&self, scope: CallScope) -> ScriptResult<Value> {
        self.runtime.invoke(Phase::Execute, scope).await
    }

    /// Run the initialize hook; a no-op without one
    pub async fn initialize(&self, scope: CallScope) -> ScriptResult<()> {
        if !self.has_initialize {
            return Ok(());
        }
        self.runtime.invoke(Phase::Initialize, scope).await.map(|_| ())
    }

    /// Run the finalize hook; a no-op without one
    pub async fn finalize(&self, scope: CallScope) -> ScriptResult<()> {
        if !self.has_finalize {
            return Ok(());
        }
        self.runtime.invoke(Phase::Finalize, scope).await.map(|_| ())
    }

    /// Abort script code stuck on the artifact's runtime thread
    pub fn interrupt(&self) {
        self.runtime.interrupt();
    }

    /// Stop the artifact's runtime thread
    pub async fn shutdown(&self) {
        self.runtime.shutdown().await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.runtime.is_terminated()
    }
}
