//! Script Runtime Thread
//!
//! Each compiled artifact owns one QuickJS runtime. It lives on a dedicated
//! OS thread with a single-threaded tokio runtime and a `LocalSet`, so script
//! values never cross threads. The host side holds a [`ScriptRuntime`]
//! handle and talks to the thread over a command channel.

use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rquickjs::context::EvalOptions;
use rquickjs::{AsyncRuntime, Ctx, FromJs};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinSet, LocalSet};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{ScriptError, ScriptResult};
use crate::sandbox::CallScope;
use crate::strategy::{self, ExecutionStrategy, Phase, StrategyPlan};

const THREAD_STACK_SIZE: usize = 4 * 1024 * 1024;

/// How long the thread waits for in-flight calls and timer tasks on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// How long the host waits for the thread before interrupting it
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────────────────
// Deadline
// ─────────────────────────────────────────────────────────────────────────────

/// Interrupt flag shared with the QuickJS interrupt handler
///
/// Armed for the length of one time-limited call. QuickJS polls
/// [`Deadline::should_interrupt`] while running script code and aborts with
/// an uncatchable error once it returns true.
#[derive(Debug, Default)]
pub struct Deadline {
    at: Mutex<Option<Instant>>,
    tripped: AtomicBool,
    terminated: AtomicBool,
}

impl Deadline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a limit for the current call
    pub fn arm(&self, limit: Duration) {
        self.tripped.store(false, Ordering::SeqCst);
        *self.at.lock() = Some(Instant::now() + limit);
    }

    /// Clear the limit, returning whether it interrupted anything
    pub fn disarm(&self) -> bool {
        *self.at.lock() = None;
        self.tripped.swap(false, Ordering::SeqCst)
    }

    pub fn should_interrupt(&self) -> bool {
        if self.terminated.load(Ordering::SeqCst) {
            return true;
        }
        match *self.at.lock() {
            Some(at) if Instant::now() >= at => {
                self.tripped.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    /// Interrupt all script code from now on
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Evaluation
// ─────────────────────────────────────────────────────────────────────────────

/// Evaluate global code without forcing strict mode
///
/// `Ctx::eval` always compiles strict. Script text here is evaluated the
/// way a plain function body is, so undeclared assignment and `with` work.
pub fn eval_script<'js, V: FromJs<'js>>(ctx: &Ctx<'js>, source: impl Into<Vec<u8>>) -> rquickjs::Result<V> {
    let mut options = EvalOptions::default();
    options.strict = false;
    ctx.eval_with_options(source, options)
}

// ─────────────────────────────────────────────────────────────────────────────
// Runtime Handle
// ─────────────────────────────────────────────────────────────────────────────

/// QuickJS resource limits for one runtime
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeLimits {
    pub memory_limit: Option<usize>,
    pub max_stack_size: Option<usize>,
}

impl From<&EngineConfig> for RuntimeLimits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            memory_limit: config.memory_limit_bytes,
            max_stack_size: config.max_stack_size_bytes,
        }
    }
}

/// Messages sent to the runtime thread
enum RuntimeCommand {
    Invoke {
        phase: Phase,
        scope: CallScope,
        reply: oneshot::Sender<ScriptResult<Value>>,
    },
    Shutdown {
        done: Option<oneshot::Sender<()>>,
    },
}

/// Handle to an artifact's runtime thread
pub struct ScriptRuntime {
    name: String,
    cmd_tx: mpsc::UnboundedSender<RuntimeCommand>,
    terminated: Arc<AtomicBool>,
    deadline: Arc<Deadline>,
    thread_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ScriptRuntime {
    /// Start a runtime thread and build the planned strategy on it
    ///
    /// Resolves once the strategy is built. Build failures such as a script
    /// that does not load are returned here and the thread exits.
    pub async fn spawn(name: impl Into<String>, plan: StrategyPlan, limits: RuntimeLimits) -> ScriptResult<Self> {
        let name = name.into();
        debug!("[script_runtime:{}] Starting", name);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<RuntimeCommand>();
        let (ready_tx, ready_rx) = oneshot::channel::<ScriptResult<()>>();

        let terminated = Arc::new(AtomicBool::new(false));
        let deadline = Arc::new(Deadline::new());

        let worker_name = name.clone();
        let worker_terminated = terminated.clone();
        let worker_deadline = deadline.clone();
        let thread_handle = thread::Builder::new()
            .name(format!("flowscript-{}", name))
            .stack_size(THREAD_STACK_SIZE)
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(ScriptError::Runtime(format!(
                            "Failed to start script runtime: {}",
                            e
                        ))));
                        return;
                    }
                };

                // LocalSet keeps every script task on this thread
                let local = LocalSet::new();
                local.block_on(
                    &rt,
                    run_worker(worker_name, plan, limits, worker_deadline, ready_tx, cmd_rx),
                );
                worker_terminated.store(true, Ordering::SeqCst);
            })
            .map_err(|e| ScriptError::Runtime(format!("Failed to spawn script runtime thread: {}", e)))?;

        ready_rx
            .await
            .map_err(|_| ScriptError::Runtime("Script runtime exited during startup".into()))??;

        debug!("[script_runtime:{}] Ready", name);
        Ok(Self {
            name,
            cmd_tx,
            terminated,
            deadline,
            thread_handle: Mutex::new(Some(thread_handle)),
        })
    }

    /// Run one phase on the runtime thread and wait for its result
    pub async fn invoke(&self, phase: Phase, scope: CallScope) -> ScriptResult<Value> {
        if self.is_terminated() {
            return Err(ScriptError::Runtime("Script runtime has terminated".into()));
        }

        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCommand::Invoke { phase, scope, reply })
            .map_err(|_| ScriptError::Runtime("Script runtime channel closed".into()))?;

        reply_rx
            .await
            .map_err(|_| ScriptError::Runtime("Script runtime dropped the call".into()))?
    }

    /// Stop the thread and free the runtime
    ///
    /// In-flight calls get a short grace period. A thread that does not stop
    /// in time is interrupted and left to exit on its own.
    pub async fn shutdown(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        let (done_tx, done_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RuntimeCommand::Shutdown { done: Some(done_tx) })
            .is_err()
        {
            return;
        }

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, done_rx).await {
            Ok(_) => {
                let handle = self.thread_handle.lock().take();
                if let Some(handle) = handle {
                    let _ = tokio::task::spawn_blocking(move || handle.join()).await;
                }
                debug!("[script_runtime:{}] Shut down", self.name);
            }
            Err(_) => {
                warn!("[script_runtime:{}] Did not stop within {:?}, interrupting", self.name, SHUTDOWN_TIMEOUT);
                self.deadline.terminate();
            }
        }
    }

    /// Abort whatever script code the thread is running, now and from now on
    pub fn interrupt(&self) {
        warn!("[script_runtime:{}] Interrupting script code", self.name);
        self.deadline.terminate();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ScriptRuntime {
    fn drop(&mut self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.deadline.terminate();
        let _ = self.cmd_tx.send(RuntimeCommand::Shutdown { done: None });
    }
}

impl std::fmt::Debug for ScriptRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRuntime")
            .field("name", &self.name)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker
// ─────────────────────────────────────────────────────────────────────────────

async fn run_worker(
    name: String,
    plan: StrategyPlan,
    limits: RuntimeLimits,
    deadline: Arc<Deadline>,
    ready_tx: oneshot::Sender<ScriptResult<()>>,
    mut cmd_rx: mpsc::UnboundedReceiver<RuntimeCommand>,
) {
    let timers = plan.sandbox.timers().clone();
    let generation = plan.sandbox.generation();

    let runtime = match AsyncRuntime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready_tx.send(Err(ScriptError::Runtime(format!("Failed to create QuickJS runtime: {}", e))));
            return;
        }
    };
    if let Some(limit) = limits.memory_limit {
        runtime.set_memory_limit(limit).await;
    }
    if let Some(limit) = limits.max_stack_size {
        runtime.set_max_stack_size(limit).await;
    }
    let interrupt = deadline.clone();
    runtime
        .set_interrupt_handler(Some(Box::new(move || interrupt.should_interrupt())))
        .await;

    let strategy: Rc<Box<dyn ExecutionStrategy>> = match strategy::build(&runtime, plan, deadline).await {
        Ok(strategy) => Rc::new(strategy),
        Err(e) => {
            // Module scripts may have scheduled timers while loading
            timers.drain_generation(generation);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    // Drives timer callbacks between calls
    let mut driver = tokio::task::spawn_local(runtime.drive());
    let _ = ready_tx.send(Ok(()));

    let mut calls = JoinSet::new();
    let mut done = None;
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(RuntimeCommand::Invoke { phase, scope, reply }) => {
                    let strategy = strategy.clone();
                    calls.spawn_local(async move {
                        let _ = reply.send(strategy.invoke(phase, scope).await);
                    });
                }
                Some(RuntimeCommand::Shutdown { done: signal }) => {
                    debug!("[script_runtime:{}] Shutdown command received", name);
                    done = signal;
                    break;
                }
                None => break,
            },
            Some(_) = calls.join_next(), if !calls.is_empty() => {
                // A finished call may have been the last task to poll spawned
                // timer work; hand those wakeups back to a fresh driver
                driver.abort();
                driver = tokio::task::spawn_local(runtime.drive());
            }
        }
    }

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while calls.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("[script_runtime:{}] Abandoning {} in-flight calls", name, calls.len());
        calls.abort_all();
        while calls.join_next().await.is_some() {}
    }

    timers.drain_generation(generation);
    if tokio::time::timeout(SHUTDOWN_GRACE, runtime.idle()).await.is_err() {
        warn!("[script_runtime:{}] Spawned script work still pending at shutdown", name);
    }
    driver.abort();

    // Script values must go before the runtime that owns them
    drop(strategy);
    runtime.run_gc().await;
    drop(runtime);

    debug!("[script_runtime:{}] Command loop exited", name);
    if let Some(done) = done {
        let _ = done.send(());
    }
}
