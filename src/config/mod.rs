//! Configuration and shared types
//!
//! Runner configuration loading/validation and the closed type set shared by
//! every stage of the pipeline.

pub mod loader;
pub mod types;

pub use loader::{LimitOverrides, OutputConfig, RunnerConfig};
