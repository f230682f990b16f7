//! Flowscript Types - Plain data shared by the script engine and its hosts
//!
//! Everything in this crate is serializable so hosts can persist script
//! definitions in their own configuration store and exchange outputs as JSON.

mod definition;
mod detail;
mod outputs;

pub use definition::*;
pub use detail::*;
pub use outputs::*;
