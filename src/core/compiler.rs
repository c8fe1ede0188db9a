//! Source compiler.
//!
//! Turns user text into an [`Artifact`]: screen, wrap in the harness,
//! write into a fresh workspace, run the toolchain out of process. The
//! workspace is released on every failure path before returning and on
//! success when the artifact is dropped.

use crate::config::types::{ExecutionStatus, MazeboxError, Result};
use crate::config::RunnerConfig;
use crate::core::launcher;
use crate::core::types::{Artifact, ExecutionProfile};
use crate::harness::WrappedSource;
use crate::judge::LanguageAdapter;
use crate::safety::cancel::CancellationToken;
use crate::safety::workspace::Workspace;
use crate::utils::output::{tail_excerpt, OutputLimits};

/// Diagnostics longer than this keep only their tail
const DIAGNOSTIC_LIMIT: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct SourceCompiler {
    config: RunnerConfig,
    output: OutputLimits,
}

fn compilation_failed(diagnostics: impl Into<String>) -> MazeboxError {
    MazeboxError::Compilation {
        diagnostics: diagnostics.into(),
    }
}

impl SourceCompiler {
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            config: config.clone(),
            output: OutputLimits::from(&config.output),
        }
    }

    /// Screen, wrap and compile raw user text
    pub fn compile(
        &self,
        adapter: &dyn LanguageAdapter,
        user_code: &str,
        cancel: &CancellationToken,
    ) -> Result<Artifact> {
        if let Some(construct) = adapter.screen(user_code) {
            log::info!("Rejected {} submission using `{}`", adapter.language(), construct);
            return Err(compilation_failed(format!(
                "forbidden construct `{}` in submitted code",
                construct
            )));
        }
        let wrapped = adapter.template().wrap(user_code);
        self.compile_wrapped(adapter, &wrapped, cancel)
    }

    /// Compile already wrapped source into a fresh workspace
    pub fn compile_wrapped(
        &self,
        adapter: &dyn LanguageAdapter,
        source: &WrappedSource,
        cancel: &CancellationToken,
    ) -> Result<Artifact> {
        if cancel.is_cancelled() {
            return Err(MazeboxError::Cancelled);
        }

        let workspace = Workspace::create(&self.config.workspace_root)?;
        workspace.write_file(adapter.source_file_name(), source.text().as_bytes())?;

        let mut profile = ExecutionProfile {
            command: adapter.compile_command(&workspace),
            workdir: workspace.dir().to_path_buf(),
            strict_mode: self.config.strict_mode,
            ..adapter.compile_profile()
        }
        .with_overrides(&self.config.compile_limits);
        profile
            .environment
            .push(("TMPDIR".to_string(), workspace.dir().to_string_lossy().to_string()));

        log::info!(
            "Compiling {} source {} in workspace {}",
            adapter.language(),
            &source.digest()[..12],
            workspace.id()
        );

        // On any early return the workspace drops and is removed.
        let outcome = launcher::launch(&profile, &self.output, cancel)?;
        let result = outcome.result;

        match result.status {
            ExecutionStatus::Ok => {}
            ExecutionStatus::TimeLimit => {
                return Err(compilation_failed(format!(
                    "compiler exceeded its time limit ({}ms wall)",
                    result.wall_time_ms()
                )))
            }
            ExecutionStatus::Cancelled => {
                return Err(compilation_failed("compilation cancelled"));
            }
            _ => {
                let mut diagnostics = result.stderr;
                if !result.stdout.trim().is_empty() {
                    diagnostics.push_str(&result.stdout);
                }
                if diagnostics.trim().is_empty() {
                    diagnostics = match (result.exit_code, result.signal) {
                        (_, Some(sig)) => format!("compiler terminated by signal {}", sig),
                        (Some(code), None) => format!("compiler exited with code {}", code),
                        (None, None) => "compiler failed".to_string(),
                    };
                }
                return Err(compilation_failed(
                    tail_excerpt(&diagnostics, DIAGNOSTIC_LIMIT).to_string(),
                ));
            }
        }

        let run_profile = ExecutionProfile {
            command: adapter.run_command(&workspace),
            workdir: workspace.dir().to_path_buf(),
            strict_mode: self.config.strict_mode,
            ..adapter.run_profile()
        }
        .with_overrides(&self.config.run_limits);

        if let Some(uid) = run_profile.uid {
            if nix::unistd::geteuid().is_root() {
                workspace.hand_over(uid, run_profile.gid.unwrap_or(uid))?;
            }
        }

        log::debug!(
            "Compiled {} in {}ms",
            workspace.id(),
            result.wall_time_ms()
        );

        Ok(Artifact {
            language: adapter.language(),
            run_profile,
            source_digest: source.digest().to_string(),
            workspace,
        })
    }
}
