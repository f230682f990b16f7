//! Execution Strategies
//!
//! The two ways a lowered script can run against its sandbox. A strategy is
//! chosen once, when the artifact is built, and lives on the artifact's
//! runtime thread for the artifact's whole lifetime.

mod direct;
mod isolated;

pub use direct::DirectStrategy;
pub use isolated::IsolatedStrategy;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rquickjs::AsyncRuntime;
use serde_json::Value;

use flowscript_types::{ErrorDetail, Strategy};

use crate::error::{ScriptError, ScriptResult};
use crate::js::Deadline;
use crate::sandbox::{CallScope, SandboxContext};

/// Which of the artifact's scripts a call runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initialize,
    Execute,
    Finalize,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initialize => "initialize",
            Phase::Execute => "execute",
            Phase::Finalize => "finalize",
        }
    }

    /// Error for a script that threw while running this phase
    pub fn failure(&self, detail: ErrorDetail) -> ScriptError {
        match self {
            Phase::Initialize => ScriptError::Initialize(detail),
            Phase::Execute => ScriptError::Execution(detail),
            Phase::Finalize => ScriptError::Finalize(detail),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything a strategy needs to build itself on the runtime thread
#[derive(Debug)]
pub struct StrategyPlan {
    pub kind: Strategy,
    /// Lowered body
    pub body: String,
    /// Lowered initialize hook
    pub initialize: Option<String>,
    /// Lowered finalize hook
    pub finalize: Option<String>,
    /// Wall-clock limit per call; only honoured by the isolated strategy
    pub timeout: Option<Duration>,
    pub sandbox: SandboxContext,
}

impl StrategyPlan {
    /// Source of the script that runs for `phase`, if any
    pub fn script(&self, phase: Phase) -> Option<&str> {
        match phase {
            Phase::Initialize => self.initialize.as_deref(),
            Phase::Execute => Some(self.body.as_str()),
            Phase::Finalize => self.finalize.as_deref(),
        }
    }
}

/// A compiled script, ready to be invoked
///
/// Implementations hold QuickJS values and never leave the runtime thread.
#[async_trait(?Send)]
pub trait ExecutionStrategy {
    fn kind(&self) -> Strategy;

    /// Run one phase and return the script's result as JSON
    ///
    /// A phase without a script resolves to `null`.
    async fn invoke(&self, phase: Phase, scope: CallScope) -> ScriptResult<Value>;
}

/// Build the strategy a plan asks for
pub async fn build(
    runtime: &AsyncRuntime,
    plan: StrategyPlan,
    deadline: Arc<Deadline>,
) -> ScriptResult<Box<dyn ExecutionStrategy>> {
    match plan.kind {
        Strategy::Direct => Ok(Box::new(DirectStrategy::build(runtime, plan).await?)),
        Strategy::Isolated => Ok(Box::new(IsolatedStrategy::build(runtime, plan, deadline).await?)),
    }
}

/// Compilation failure raised while loading a lowered script into a realm
pub(crate) fn compile_error(phase: Phase, detail: ErrorDetail) -> ScriptError {
    ScriptError::Compilation(
        detail
            .with_property("phase", phase.as_str())
            .with_property("stage", "load"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_failures() {
        let detail = ErrorDetail::new("x");
        assert_eq!(Phase::Initialize.failure(detail.clone()).kind(), "InitializeError");
        assert_eq!(Phase::Execute.failure(detail.clone()).kind(), "ExecutionError");
        assert_eq!(Phase::Finalize.failure(detail).kind(), "FinalizeError");
    }

    #[test]
    fn test_compile_error_tags_phase() {
        let err = compile_error(Phase::Finalize, ErrorDetail::new("unexpected token"));
        match err {
            ScriptError::Compilation(detail) => {
                assert_eq!(detail.properties.get("phase"), Some(&Value::from("finalize")));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
