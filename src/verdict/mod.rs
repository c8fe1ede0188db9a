//! Attempt evaluation
//!
//! Turns captured runner output into an attempt outcome.

pub mod evaluator;

pub use evaluator::{AttemptEvaluator, Evaluation};
