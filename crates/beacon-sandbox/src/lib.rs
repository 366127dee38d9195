//! `beacon-sandbox`: isolated execution of widget scripts.
//!
//! [`ScriptRunner`] is the seam the scheduler depends on; [`BoaRunner`] is
//! the production implementation backed by the boa JavaScript engine.

pub mod context;
pub mod error;
pub mod runner;

pub use context::ScriptContext;
pub use error::{Result, SandboxError};
pub use runner::{BoaRunner, ScriptRunner};
