/// Core types and structures for the mazebox pipeline
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a maze owned by the maze-storage collaborator
pub type MazeId = i64;

/// Identifier of a user resolved from a session token
pub type UserId = i64;

/// Execution result from an isolated process
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Exit code of the process
    pub exit_code: Option<i32>,
    /// Execution status
    pub status: ExecutionStatus,
    /// Standard output, up to the stdout limit
    pub stdout: String,
    /// Last stdout bytes past the limit; empty unless stdout was truncated
    #[serde(default)]
    pub stdout_tail: String,
    /// Standard error
    pub stderr: String,
    /// Output integrity state from runtime collector
    pub output_integrity: OutputIntegrity,
    /// Wall clock time used (in seconds)
    pub wall_time: f64,
    /// Signal that terminated the process (if any)
    pub signal: Option<i32>,
    /// Success flag
    pub success: bool,
    /// Additional error message
    pub error_message: Option<String>,
}

impl ExecutionResult {
    /// Wall time in whole milliseconds
    pub fn wall_time_ms(&self) -> u64 {
        (self.wall_time * 1000.0).round() as u64
    }
}

/// Status of process execution
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Process exited with code 0
    #[serde(rename = "OK")]
    Ok,
    /// Wall-clock deadline fired and the process group was killed
    #[serde(rename = "TLE")]
    TimeLimit,
    /// Non-zero exit
    #[serde(rename = "RE")]
    RuntimeError,
    /// Terminated by a signal the launcher did not send
    #[serde(rename = "SIG")]
    Signaled,
    /// Cancellation token tripped and the process group was killed
    #[serde(rename = "CANCELLED")]
    Cancelled,
    /// Launcher failure after spawn (wait error, lost pipes)
    #[serde(rename = "IE")]
    InternalError,
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        ExecutionStatus::Ok
    }
}

/// Output integrity classification
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutputIntegrity {
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "truncated_by_limit")]
    TruncatedByLimit,
    #[serde(rename = "truncated_by_program_close")]
    TruncatedByProgramClose,
    #[serde(rename = "read_error")]
    ReadError,
}

impl std::fmt::Display for OutputIntegrity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputIntegrity::Complete => write!(f, "complete"),
            OutputIntegrity::TruncatedByLimit => write!(f, "truncated_by_limit"),
            OutputIntegrity::TruncatedByProgramClose => write!(f, "truncated_by_program_close"),
            OutputIntegrity::ReadError => write!(f, "read_error"),
        }
    }
}

impl Default for OutputIntegrity {
    fn default() -> Self {
        OutputIntegrity::Complete
    }
}

/// Custom error types for mazebox
#[derive(Error, Debug)]
pub enum MazeboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Privilege error: {0}")]
    Privilege(String),

    #[error("Compilation failed")]
    Compilation { diagnostics: String },

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Invalid maze layout: {0}")]
    InvalidLayout(String),

    #[error("Maze {0} not found")]
    MazeNotFound(MazeId),

    #[error("No logged-in user for session token {0}")]
    Unauthorized(String),

    #[error("Execution capacity exhausted: {0}")]
    Busy(String),

    #[error("Submission cancelled before execution")]
    Cancelled,

    #[error("Attempt store error: {0}")]
    Store(String),

    #[error("No attempt exists for user {user_id} on maze {maze_id}")]
    NoAttempts { user_id: UserId, maze_id: MazeId },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<nix::errno::Errno> for MazeboxError {
    fn from(err: nix::errno::Errno) -> Self {
        MazeboxError::Process(err.to_string())
    }
}

/// Result type alias for mazebox operations
pub type Result<T> = std::result::Result<T, MazeboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_string(&ExecutionStatus::TimeLimit).unwrap(), "\"TLE\"");
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::Cancelled).unwrap(),
            "\"CANCELLED\""
        );
    }

    #[test]
    fn test_wall_time_ms_rounds() {
        let result = ExecutionResult {
            wall_time: 1.2345,
            ..Default::default()
        };
        assert_eq!(result.wall_time_ms(), 1235);
    }

    #[test]
    fn test_errno_conversion() {
        let err: MazeboxError = nix::errno::Errno::EPERM.into();
        assert!(matches!(err, MazeboxError::Process(_)));
    }
}
