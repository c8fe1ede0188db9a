//! Maze attempts
//!
//! The record a submission produces, the phase machine an invocation walks
//! through, and the pipeline that drives compile, run and evaluation.

pub mod collaborators;
pub mod pipeline;

use crate::config::types::{MazeId, MazeboxError, Result, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use collaborators::{
    AttemptStore, InMemoryAttemptStore, InMemoryMazeRepository, InMemorySessions, MazeRepository,
    SessionResolver,
};
pub use pipeline::AttemptPipeline;

/// Inbound request: run `code` against maze `maze_id` for the session's user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub maze_id: MazeId,
    pub session_token: String,
    pub language: String,
    pub code: String,
    /// Durable attempts are saved; test attempts never touch the store
    pub persist: bool,
}

/// How one attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Completed { success: bool },
    TimedOut,
    Crashed,
    Cancelled,
    CompilationFailed,
}

impl AttemptOutcome {
    pub fn label(self) -> &'static str {
        match self {
            AttemptOutcome::Completed { success: true } => "solved",
            AttemptOutcome::Completed { success: false } => "failed",
            AttemptOutcome::TimedOut => "timed_out",
            AttemptOutcome::Crashed => "crashed",
            AttemptOutcome::Cancelled => "cancelled",
            AttemptOutcome::CompilationFailed => "compilation_failed",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, AttemptOutcome::Completed { success: true })
    }

    /// Phase an invocation enters once this outcome is known
    pub fn phase(self) -> AttemptPhase {
        match self {
            AttemptOutcome::Completed { .. } => AttemptPhase::Completed,
            AttemptOutcome::TimedOut => AttemptPhase::TimedOut,
            AttemptOutcome::Crashed => AttemptPhase::Crashed,
            AttemptOutcome::Cancelled => AttemptPhase::Cancelled,
            AttemptOutcome::CompilationFailed => AttemptPhase::CompilationFailed,
        }
    }
}

/// One execution outcome. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MazeAttempt {
    id: Uuid,
    maze_id: MazeId,
    user_id: UserId,
    success: bool,
    move_count: usize,
    outcome: AttemptOutcome,
    diagnostic: String,
    created_at: DateTime<Utc>,
}

impl MazeAttempt {
    pub fn new(
        maze_id: MazeId,
        user_id: UserId,
        outcome: AttemptOutcome,
        move_count: usize,
        diagnostic: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            maze_id,
            user_id,
            success: outcome.is_success(),
            move_count,
            outcome,
            diagnostic,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn maze_id(&self) -> MazeId {
        self.maze_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn move_count(&self) -> usize {
        self.move_count
    }

    pub fn outcome(&self) -> AttemptOutcome {
        self.outcome
    }

    pub fn diagnostic(&self) -> &str {
        &self.diagnostic
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Lifecycle of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptPhase {
    Submitted,
    Compiling,
    CompilationFailed,
    Compiled,
    Running,
    TimedOut,
    Crashed,
    Cancelled,
    Completed,
    Persisted,
    Discarded,
}

impl AttemptPhase {
    pub fn can_transition_to(self, next: AttemptPhase) -> bool {
        use AttemptPhase::*;
        matches!(
            (self, next),
            (Submitted, Compiling)
                | (Compiling, CompilationFailed)
                | (Compiling, Compiled)
                | (Compiled, Running)
                | (Running, TimedOut)
                | (Running, Crashed)
                | (Running, Cancelled)
                | (Running, Completed)
                | (CompilationFailed, Persisted)
                | (CompilationFailed, Discarded)
                | (TimedOut, Persisted)
                | (TimedOut, Discarded)
                | (Crashed, Persisted)
                | (Crashed, Discarded)
                | (Cancelled, Persisted)
                | (Cancelled, Discarded)
                | (Completed, Persisted)
                | (Completed, Discarded)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AttemptPhase::Persisted | AttemptPhase::Discarded)
    }
}

/// Validated walk through [`AttemptPhase`]
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    invocation: String,
    history: Vec<AttemptPhase>,
}

impl PhaseTracker {
    pub fn new(invocation: impl Into<String>) -> Self {
        Self {
            invocation: invocation.into(),
            history: vec![AttemptPhase::Submitted],
        }
    }

    pub fn current(&self) -> AttemptPhase {
        self.history
            .last()
            .copied()
            .unwrap_or(AttemptPhase::Submitted)
    }

    pub fn advance(&mut self, next: AttemptPhase) -> Result<()> {
        let current = self.current();
        if !current.can_transition_to(next) {
            log::error!(
                "Invocation {}: illegal phase transition {:?} -> {:?}",
                self.invocation,
                current,
                next
            );
            return Err(MazeboxError::Process(format!(
                "illegal phase transition {:?} -> {:?}",
                current, next
            )));
        }
        log::debug!("Invocation {}: {:?} -> {:?}", self.invocation, current, next);
        self.history.push(next);
        Ok(())
    }

    pub fn history(&self) -> &[AttemptPhase] {
        &self.history
    }

    pub fn into_history(self) -> Vec<AttemptPhase> {
        self.history
    }
}

/// What a submission returns to the caller
#[derive(Debug, Clone, Serialize)]
pub struct AttemptReport {
    pub invocation_id: String,
    pub attempt: MazeAttempt,
    pub persisted: bool,
    pub phases: Vec<AttemptPhase>,
    /// SHA-256 of the wrapped source; absent when screening rejected it
    pub source_digest: Option<String>,
    /// Path the harness reported and the server replayed
    pub path: Option<String>,
    pub wall_time_ms: Option<u64>,
    pub total_time_ms: u64,
}
