//! Flowscript - Run pipelines of script nodes from a flow file
//!
//! A small host runtime for the script engine: it loads a flow of script
//! nodes, feeds them JSON messages and routes their outputs along wires.

pub mod check;
pub mod config;
pub mod flow;
pub mod host;
pub mod resolver;
pub mod runner;
pub mod watcher;

pub use config::HostConfig;
pub use flow::{Flow, FlowLoader, FlowNode, LoadError};
pub use host::{Delivery, FlowNodeHost, SharedStores};
pub use resolver::FsModuleResolver;
pub use runner::{Emitted, FlowRunner, HostError, Input, ReloadSummary};
pub use watcher::FlowWatcher;
