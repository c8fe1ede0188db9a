//! Execution control
//!
//! The fixed pre-exec chain every child runs between fork and exec.

pub mod preexec;
