//! Isolated runner.
//!
//! Executes a compiled artifact against one maze layout. The layout travels
//! on stdin inside the escaped envelope together with a fresh nonce; the
//! nonce comes back in the harness's result marker.

use crate::config::types::{ExecutionResult, Result};
use crate::config::RunnerConfig;
use crate::core::launcher;
use crate::core::types::{Artifact, ExecutionProfile};
use crate::harness::envelope::Envelope;
use crate::maze::MazeLayout;
use crate::safety::cancel::CancellationToken;
use crate::utils::output::OutputLimits;
use std::sync::Arc;

/// Seam between the runner and the OS; tests swap in recording backends.
pub trait ExecutionBackend: Send + Sync {
    fn execute(&self, profile: &ExecutionProfile, cancel: &CancellationToken) -> Result<ExecutionResult>;
}

/// Real child processes through the launcher
#[derive(Debug, Clone, Default)]
pub struct ProcessBackend {
    output: OutputLimits,
}

impl ProcessBackend {
    pub fn new(output: OutputLimits) -> Self {
        Self { output }
    }
}

impl ExecutionBackend for ProcessBackend {
    fn execute(&self, profile: &ExecutionProfile, cancel: &CancellationToken) -> Result<ExecutionResult> {
        let outcome = launcher::launch(profile, &self.output, cancel)?;
        if let Some(report) = &outcome.kill_report {
            log::debug!(
                "pid {} terminated: term={} kill={} waited={}ms notes={:?}",
                outcome.pid,
                report.term_sent,
                report.kill_sent,
                report.waited_ms,
                report.notes
            );
        }
        Ok(outcome.result)
    }
}

/// Raw result of one run plus the nonce the marker must carry
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub result: ExecutionResult,
    pub nonce: String,
}

#[derive(Clone)]
pub struct IsolatedRunner {
    backend: Arc<dyn ExecutionBackend>,
}

impl IsolatedRunner {
    pub fn new(config: &RunnerConfig) -> Self {
        Self::with_backend(Arc::new(ProcessBackend::new(OutputLimits::from(&config.output))))
    }

    pub fn with_backend(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self { backend }
    }

    /// Blocks until the child exits, the deadline fires or `cancel` trips
    pub fn run(
        &self,
        artifact: &Artifact,
        layout: &MazeLayout,
        step_limit: u64,
        cancel: &CancellationToken,
    ) -> Result<RunOutput> {
        let envelope = Envelope::new(layout, step_limit);
        let mut profile = artifact.run_profile.clone();
        profile.stdin_data = Some(envelope.encode());

        log::info!(
            "Running {} artifact {} ({}x{} maze, step limit {})",
            artifact.language,
            artifact.invocation_id(),
            layout.size(),
            layout.size(),
            step_limit
        );

        let result = self.backend.execute(&profile, cancel)?;
        Ok(RunOutput {
            result,
            nonce: envelope.nonce,
        })
    }
}
