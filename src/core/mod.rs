//! Language-agnostic execution core.
//!
//! Core owns the process model: compile and run stages both go through the
//! same launcher. Language-specific commands and envelopes live in judge
//! adapters.

pub mod compiler;
pub mod launcher;
pub mod runner;
pub mod types;

pub use compiler::SourceCompiler;
pub use runner::{ExecutionBackend, IsolatedRunner, ProcessBackend, RunOutput};
pub use types::{Artifact, ExecutionProfile};
