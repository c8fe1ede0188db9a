//! mazebox: compile and run untrusted maze agents in isolation
//! Turns submitted source into a separate, resource-bounded process and its
//! output into a result the server can trust.
//!
//! # Architecture
//!
//! ## Execution Core ([`core`])
//! - [`core::compiler`]: Screens, wraps and compiles submissions into artifacts
//! - [`core::runner`]: Runs an artifact against one maze over the stdin envelope
//! - [`core::launcher`]: Spawn, deadline, process-group kill, output capture
//! - [`core::types`]: Execution profiles and artifacts
//!
//! ## Execution Control ([`exec`])
//! - [`exec::preexec`]: Type-state ordered child setup (session, network, rlimits, credentials)
//!
//! ## Harness ([`harness`])
//! - [`harness::escape`]: Line-safe escape codec shared with every template
//! - [`harness::envelope`]: Stdin envelope and nonce-bound result marker
//!
//! ## Language Adapters ([`judge`])
//! - [`judge::adapter`]: The fixed adapter interface
//! - [`judge::languages`]: Rust and Java harness templates and profiles
//! - [`judge::registry`]: Name to adapter lookup
//! - [`judge::screen`]: Compile-time escape hatch denylist
//!
//! ## Mazes and Attempts
//! - [`maze`]: Layout parsing and the server-side state machine
//! - [`verdict::evaluator`]: Output to outcome, with path replay
//! - [`attempt`]: Attempt records, phases, collaborators and the pipeline
//!
//! ## Safety ([`safety`])
//! - [`safety::workspace`]: Per-invocation UUID workspaces
//! - [`safety::admission`]: Bounded concurrent executions
//! - [`safety::cancel`]: Cooperative cancellation
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: Structured attempt events
//! - [`observability::metrics`]: Prometheus metrics export
//!
//! ## Configuration ([`config`])
//! - [`config::loader`]: JSON runner configuration
//! - [`config::types`]: Shared result and error types
//!
//! # Design Principles
//!
//! 1. **Never in-process** - Submitted code only ever runs in a child process
//! 2. **Bounded everything** - Wall deadline, rlimits, output caps, admission
//! 3. **Verify, don't trust** - The reported path is replayed server-side
//! 4. **Nothing shared** - Every invocation gets its own workspace and nonce

// Execution Control
pub mod exec;

// Execution core
pub mod core;

// Harness templates and wire formats
pub mod harness;

// Language adapters
pub mod judge;

// Maze model
pub mod maze;

// Evaluation
pub mod verdict;

// Attempts and the submission pipeline
pub mod attempt;

// Safety
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// CLI entrypoint wiring for the mazebox binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use attempt::{
    AttemptOutcome, AttemptPhase, AttemptPipeline, AttemptReport, MazeAttempt, Submission,
};
pub use config::types::*;
pub use config::RunnerConfig;
pub use maze::{MazeLayout, MazeState, Move};
pub use safety::cancel::CancellationToken;
