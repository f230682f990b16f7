//! Direct Strategy
//!
//! Each script is compiled once into a function whose parameters are the
//! sandbox's binding names, in order. A call refreshes the per-call bindings
//! and applies the function positionally. Nothing limits how long it runs.

use async_trait::async_trait;
use rquickjs::function::Rest;
use rquickjs::{
    AsyncContext, AsyncRuntime, CatchResultExt, Function, Object, Persistent, Promise,
    Value as JsValue, async_with,
};
use serde_json::Value;
use tracing::debug;

use flowscript_types::Strategy;

use super::{ExecutionStrategy, Phase, StrategyPlan, compile_error};
use crate::error::{ScriptError, ScriptResult};
use crate::js::{bind_call, caught_detail, eval_script, install, js_to_json};
use crate::sandbox::CallScope;

/// Trusted, in-realm execution
pub struct DirectStrategy {
    /// Binding values in the sandbox's declaration order
    bindings: Persistent<Object<'static>>,
    names: Vec<String>,
    body: Persistent<Function<'static>>,
    initialize: Option<Persistent<Function<'static>>>,
    finalize: Option<Persistent<Function<'static>>>,
    /// Declared last so the saved values above are released first
    context: AsyncContext,
}

impl DirectStrategy {
    pub async fn build(runtime: &AsyncRuntime, plan: StrategyPlan) -> ScriptResult<Self> {
        let context = AsyncContext::full(runtime)
            .await
            .map_err(|e| ScriptError::Runtime(format!("Failed to create script context: {}", e)))?;
        let names = plan.sandbox.names();
        let params = names.join(", ");
        let plan = &plan;
        let params = params.as_str();

        let (bindings, body, initialize, finalize) = async_with!(context => |ctx| {
            let bindings = Object::new(ctx.clone())
                .map_err(|e| ScriptError::Runtime(e.to_string()))?;
            install(&ctx, &bindings, &plan.sandbox)?;

            let compile = |phase: Phase| -> ScriptResult<Option<Persistent<Function<'static>>>> {
                let Some(code) = plan.script(phase) else {
                    return Ok(None);
                };
                let func: Function = eval_script(&ctx, format!("(function({}) {{\n return {}\n}})", params, code))
                    .catch(&ctx)
                    .map_err(|e| compile_error(phase, caught_detail(&ctx, e)))?;
                Ok(Some(Persistent::save(&ctx, func)))
            };

            let body = compile(Phase::Execute)?
                .ok_or(ScriptError::EmptyScript)?;
            let initialize = compile(Phase::Initialize)?;
            let finalize = compile(Phase::Finalize)?;

            Ok::<_, ScriptError>((Persistent::save(&ctx, bindings), body, initialize, finalize))
        })
        .await?;

        debug!(node = %plan.sandbox.host().id(), "Compiled direct script with {} parameters", names.len());

        Ok(Self {
            bindings,
            names,
            body,
            initialize,
            finalize,
            context,
        })
    }

    fn function(&self, phase: Phase) -> Option<&Persistent<Function<'static>>> {
        match phase {
            Phase::Initialize => self.initialize.as_ref(),
            Phase::Execute => Some(&self.body),
            Phase::Finalize => self.finalize.as_ref(),
        }
    }
}

#[async_trait(?Send)]
impl ExecutionStrategy for DirectStrategy {
    fn kind(&self) -> Strategy {
        Strategy::Direct
    }

    async fn invoke(&self, phase: Phase, scope: CallScope) -> ScriptResult<Value> {
        let Some(func) = self.function(phase).cloned() else {
            return Ok(Value::Null);
        };
        let bindings = self.bindings.clone();
        let names = &self.names;

        async_with!(self.context => |ctx| {
            let run = async {
                let bindings = bindings.restore(&ctx)?;
                bind_call(&ctx, &bindings, &scope)?;

                let args = names
                    .iter()
                    .map(|name| bindings.get::<_, JsValue>(name.as_str()))
                    .collect::<rquickjs::Result<Vec<_>>>()?;

                let promise: Promise = func.restore(&ctx)?.call((Rest(args),))?;
                let result = promise.into_future::<JsValue>().await?;
                js_to_json(&ctx, result)
            };

            run.await
                .catch(&ctx)
                .map_err(|e| phase.failure(caught_detail(&ctx, e)))
        })
        .await
    }
}
