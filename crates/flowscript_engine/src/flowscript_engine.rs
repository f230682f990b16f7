//! Flowscript Engine - Script compilation and execution for pipeline nodes
//!
//! Turns the TypeScript attached to a pipeline node into a cached, runnable
//! artifact and runs it per message, with an explicit lifecycle
//! (initialize once, execute per input, finalize on teardown).
//!
//! ## Architecture
//!
//! ```text
//! ScriptDefinition
//!       │
//!       ▼
//! ┌─────────────┐   ┌────────────────┐   ┌─────────────────┐
//! │ Transpiler  │──▶│ ContextBuilder │──▶│ Strategy        │
//! │ (deno_ast)  │   │ + modules      │   │ Direct/Isolated │
//! └─────────────┘   │ + timers       │   │ (runtime thread)│
//!                   └────────────────┘   └────────┬────────┘
//!                                                 │
//!                                                 ▼
//!                                   ┌──────────────────────────┐
//!                                   │ ScriptNode               │
//!                                   │ lifecycle + single-slot  │
//!                                   │ compilation cache        │
//!                                   └──────────────────────────┘
//! ```
//!
//! The engine is a library. The host runtime supplies node identity, stores,
//! output delivery, reporting and module resolution through the traits in
//! [`host`].

pub mod artifact;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod host;
pub mod js;
pub mod lifecycle;
pub mod modules;
pub mod registry;
pub mod sandbox;
pub mod strategy;
pub mod timers;
pub mod transpile;

pub use artifact::{CacheKey, CompiledArtifact};
pub use cache::{CompilationCache, Lookup};
pub use config::EngineConfig;
pub use error::{ScriptError, ScriptResult};
pub use fetch::{FetchClient, FetchError, FetchRequest, FetchResponse};
pub use host::{
    ContextHandles, ContextStore, MemoryStore, ModuleExport, ModuleResolver, NodeHost,
    StaticModuleResolver,
};
pub use lifecycle::{LifecycleState, ScriptNode};
pub use modules::ModuleInjector;
pub use registry::ScriptNodeRegistry;
pub use sandbox::{CallScope, ContextBuilder, SandboxContext};
pub use strategy::{ExecutionStrategy, Phase};
pub use timers::{TimerId, TimerKind, TimerRegistry};
pub use transpile::{LoweredBody, Transpiler};

pub use flowscript_types::{
    ErrorDetail, ModuleBinding, Outputs, PortOutput, ScriptDefinition, Strategy, VersionStamp,
};

/// Version reported to scripts as `host.version`
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
