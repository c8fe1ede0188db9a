//! Utilities
//!
//! Bounded output collection shared by the launcher and the evaluator.

pub mod output;
