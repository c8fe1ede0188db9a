//! Safety
//!
//! Per-invocation workspaces, admission control and cancellation.

pub mod admission;
pub mod cancel;
pub mod workspace;
