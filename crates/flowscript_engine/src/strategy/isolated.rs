//! Isolated Strategy
//!
//! Scripts run in a realm of their own whose globals are the sandbox
//! bindings. Each call re-binds the message and store globals and evaluates
//! the lowered text directly, under an optional wall-clock limit.
//!
//! The realm separates namespaces only. Host-backed handles such as `node`
//! and the stores still reach the host by reference.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rquickjs::{
    AsyncContext, AsyncRuntime, CatchResultExt, CaughtError, Function, Promise,
    Value as JsValue, async_with,
};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use flowscript_types::Strategy;

use super::{ExecutionStrategy, Phase, StrategyPlan, compile_error};
use crate::error::{ScriptError, ScriptResult};
use crate::js::{Deadline, bind_call, caught_detail, eval_script, install, js_to_json};
use crate::sandbox::CallScope;

/// Untrusted-ish, separate-realm execution
pub struct IsolatedStrategy {
    node_id: String,
    body: String,
    initialize: Option<String>,
    finalize: Option<String>,
    timeout: Option<Duration>,
    deadline: Arc<Deadline>,
    /// One call at a time, so each call owns the deadline while it runs
    gate: Mutex<()>,
    context: AsyncContext,
}

impl IsolatedStrategy {
    pub async fn build(runtime: &AsyncRuntime, plan: StrategyPlan, deadline: Arc<Deadline>) -> ScriptResult<Self> {
        let context = AsyncContext::full(runtime)
            .await
            .map_err(|e| ScriptError::Runtime(format!("Failed to create script realm: {}", e)))?;

        let plan_ref = &plan;
        async_with!(context => |ctx| {
            install(&ctx, &ctx.globals(), &plan_ref.sandbox)?;

            // Syntax check without running anything
            for phase in [Phase::Execute, Phase::Initialize, Phase::Finalize] {
                if let Some(code) = plan_ref.script(phase) {
                    eval_script::<Function>(&ctx, format!("(function() {{\n return {}\n}})", code))
                        .catch(&ctx)
                        .map_err(|e| compile_error(phase, caught_detail(&ctx, e)))?;
                }
            }
            Ok::<_, ScriptError>(())
        })
        .await?;

        let node_id = plan.sandbox.host().id().to_string();
        debug!(node = %node_id, timeout = ?plan.timeout, "Built isolated realm");

        Ok(Self {
            node_id,
            body: plan.body,
            initialize: plan.initialize,
            finalize: plan.finalize,
            timeout: plan.timeout,
            deadline,
            gate: Mutex::new(()),
            context,
        })
    }

    fn script(&self, phase: Phase) -> Option<&str> {
        match phase {
            Phase::Initialize => self.initialize.as_deref(),
            Phase::Execute => Some(self.body.as_str()),
            Phase::Finalize => self.finalize.as_deref(),
        }
    }
}

#[async_trait(?Send)]
impl ExecutionStrategy for IsolatedStrategy {
    fn kind(&self) -> Strategy {
        Strategy::Isolated
    }

    async fn invoke(&self, phase: Phase, scope: CallScope) -> ScriptResult<Value> {
        let Some(code) = self.script(phase) else {
            return Ok(Value::Null);
        };
        let _gate = self.gate.lock().await;
        let limit = self.timeout;
        let deadline = &self.deadline;

        let result = async_with!(self.context => |ctx| {
            bind_call(&ctx, &ctx.globals(), &scope)
                .catch(&ctx)
                .map_err(|e| phase.failure(caught_detail(&ctx, e)))?;

            if let Some(limit) = limit {
                deadline.arm(limit);
            }
            let run = async {
                let promise: Promise = eval_script(&ctx, code)?;
                promise.into_future::<JsValue>().await
            };
            let outcome = match limit {
                Some(limit) => tokio::select! {
                    result = run => Some(result),
                    _ = tokio::time::sleep(limit) => None,
                },
                None => Some(run.await),
            };
            // The interrupt handler only trips while the deadline is armed
            let interrupted = deadline.disarm();

            match (outcome, limit) {
                (None, Some(limit)) => Err(ScriptError::Timeout { limit }),
                (Some(_), Some(limit)) if interrupted => Err(ScriptError::Timeout { limit }),
                (Some(Ok(value)), _) => js_to_json(&ctx, value)
                    .catch(&ctx)
                    .map_err(|e| phase.failure(caught_detail(&ctx, e))),
                (Some(Err(e)), _) => Err(phase.failure(caught_detail(&ctx, CaughtError::from_error(&ctx, e)))),
                (None, None) => Err(ScriptError::Runtime("Script call ended without a result".into())),
            }
        })
        .await;

        if let Err(ScriptError::Timeout { limit }) = &result {
            warn!(node = %self.node_id, phase = %phase, "Isolated script exceeded {}ms", limit.as_millis());
        }
        result
    }
}
