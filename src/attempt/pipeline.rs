//! Submission pipeline.
//!
//! `submit` resolves the session, takes an admission slot, compiles, runs,
//! evaluates and (in durable mode) persists. Every invocation gets its own
//! id, workspace and nonce; nothing is shared between concurrent submissions
//! except the collaborators behind their traits.

use crate::attempt::collaborators::{AttemptStore, MazeRepository, SessionResolver};
use crate::attempt::{AttemptOutcome, AttemptPhase, AttemptReport, MazeAttempt, PhaseTracker, Submission};
use crate::config::types::{MazeId, MazeboxError, Result, UserId};
use crate::config::RunnerConfig;
use crate::core::compiler::SourceCompiler;
use crate::core::runner::{ExecutionBackend, IsolatedRunner};
use crate::core::types::Artifact;
use crate::judge::adapter_for;
use crate::maze::MazeLayout;
use crate::observability::audit::{log_attempt_event, AttemptEvent, AttemptEventType, CorrelationIds};
use crate::observability::metrics::{get_metrics, GaugeGuard};
use crate::safety::admission::AdmissionLimiter;
use crate::safety::cancel::CancellationToken;
use crate::verdict::{AttemptEvaluator, Evaluation};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct AttemptPipeline {
    config: RunnerConfig,
    compiler: SourceCompiler,
    runner: IsolatedRunner,
    evaluator: AttemptEvaluator,
    admission: AdmissionLimiter,
    mazes: Arc<dyn MazeRepository>,
    sessions: Arc<dyn SessionResolver>,
    store: Arc<dyn AttemptStore>,
}

/// Short stable tag for a session token, safe to put in errors and logs
fn token_fingerprint(token: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(token.as_bytes()));
    format!("sha256:{}", &digest[..12])
}

impl AttemptPipeline {
    pub fn new(
        config: RunnerConfig,
        mazes: Arc<dyn MazeRepository>,
        sessions: Arc<dyn SessionResolver>,
        store: Arc<dyn AttemptStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            compiler: SourceCompiler::new(&config),
            runner: IsolatedRunner::new(&config),
            evaluator: AttemptEvaluator::new(&config.output),
            admission: AdmissionLimiter::new(config.max_concurrent_runs),
            config,
            mazes,
            sessions,
            store,
        })
    }

    /// Run artifacts through `backend` instead of real child processes
    pub fn with_backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.runner = IsolatedRunner::with_backend(backend);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn resolve_user(&self, token: &str) -> Result<UserId> {
        self.sessions
            .resolve(token)?
            .ok_or_else(|| MazeboxError::Unauthorized(token_fingerprint(token)))
    }

    /// Compile and run one submission. Blocks the calling thread.
    pub fn submit(&self, submission: &Submission, cancel: &CancellationToken) -> Result<AttemptReport> {
        let started = Instant::now();
        let invocation_id = uuid::Uuid::new_v4().simple().to_string();
        let metrics = get_metrics();

        let user_id = self.resolve_user(&submission.session_token)?;
        let adapter = adapter_for(&submission.language)?;
        let layout = self
            .mazes
            .layout(submission.maze_id)?
            .ok_or(MazeboxError::MazeNotFound(submission.maze_id))?;

        let mut ids = CorrelationIds::new(invocation_id.clone())
            .with_maze(submission.maze_id)
            .with_user(user_id);
        log_attempt_event(
            AttemptEvent::new(
                AttemptEventType::SubmissionReceived,
                format!(
                    "{} bytes of {} ({})",
                    submission.code.len(),
                    adapter.language(),
                    if submission.persist { "durable" } else { "test" }
                ),
            )
            .with_correlation(ids.clone())
            .with_language(adapter.language()),
        );

        let admission_timeout = Duration::from_millis(self.config.admission_timeout_ms);
        let _permit = match self.admission.acquire(admission_timeout, cancel) {
            Ok(permit) => permit,
            Err(err) => {
                let event_type = match err {
                    MazeboxError::Busy(_) => {
                        metrics.busy_rejections.inc();
                        AttemptEventType::AdmissionRejected
                    }
                    _ => AttemptEventType::Cancelled,
                };
                log_attempt_event(
                    AttemptEvent::new(event_type, err.to_string()).with_correlation(ids),
                );
                return Err(err);
            }
        };
        let _in_flight = GaugeGuard::new(&metrics.in_flight);

        let mut tracker = PhaseTracker::new(invocation_id.clone());
        tracker.advance(AttemptPhase::Compiling)?;

        let mut source_digest = None;
        let mut wall_time_ms = None;
        let evaluation = match self.compiler.compile(adapter.as_ref(), &submission.code, cancel) {
            Err(MazeboxError::Compilation { diagnostics }) => {
                tracker.advance(AttemptPhase::CompilationFailed)?;
                log_attempt_event(
                    AttemptEvent::new(
                        AttemptEventType::CompilationFailed,
                        diagnostics.lines().next().unwrap_or("compiler rejected source"),
                    )
                    .with_correlation(ids.clone())
                    .with_language(adapter.language()),
                );
                self.evaluator.compilation_failed(&diagnostics)
            }
            Err(err) => {
                if matches!(err, MazeboxError::Cancelled) {
                    log_attempt_event(
                        AttemptEvent::new(AttemptEventType::Cancelled, "cancelled before compilation")
                            .with_correlation(ids),
                    );
                }
                return Err(err);
            }
            Ok(artifact) => {
                tracker.advance(AttemptPhase::Compiled)?;
                source_digest = Some(artifact.source_digest.clone());
                ids = ids.with_source_digest(artifact.source_digest.clone());
                let (evaluation, wall) = self.execute(&artifact, &layout, cancel, &mut tracker, &ids)?;
                wall_time_ms = wall;
                evaluation
            }
        };

        let attempt = self
            .evaluator
            .build_attempt(submission.maze_id, user_id, &evaluation);
        let persisted = self
            .evaluator
            .record(&attempt, submission.persist, self.store.as_ref())?;
        if persisted {
            metrics.attempts_persisted.inc();
            tracker.advance(AttemptPhase::Persisted)?;
        } else {
            tracker.advance(AttemptPhase::Discarded)?;
        }

        let elapsed = started.elapsed();
        metrics.record_outcome(evaluation.outcome, elapsed);
        log_attempt_event(
            AttemptEvent::new(
                if persisted {
                    AttemptEventType::AttemptPersisted
                } else {
                    AttemptEventType::AttemptDiscarded
                },
                format!("attempt {} ({} moves)", attempt.id(), attempt.move_count()),
            )
            .with_correlation(ids)
            .with_outcome(evaluation.outcome.label()),
        );

        Ok(AttemptReport {
            invocation_id,
            attempt,
            persisted,
            phases: tracker.into_history(),
            source_digest,
            path: evaluation.path,
            wall_time_ms,
            total_time_ms: elapsed.as_millis() as u64,
        })
    }

    /// Running phase. The artifact (and its workspace) is released by the caller.
    fn execute(
        &self,
        artifact: &Artifact,
        layout: &MazeLayout,
        cancel: &CancellationToken,
        tracker: &mut PhaseTracker,
        ids: &CorrelationIds,
    ) -> Result<(Evaluation, Option<u64>)> {
        let metrics = get_metrics();
        tracker.advance(AttemptPhase::Running)?;
        log_attempt_event(
            AttemptEvent::new(
                AttemptEventType::ExecutionStart,
                format!("step limit {}", self.config.step_limit),
            )
            .with_correlation(ids.clone())
            .with_language(artifact.language),
        );

        let (evaluation, wall_time_ms) =
            match self.runner.run(artifact, layout, self.config.step_limit, cancel) {
                Ok(run) => (
                    self.evaluator.evaluate(&run, layout),
                    Some(run.result.wall_time_ms()),
                ),
                // Token tripped after compilation but before the child started
                Err(MazeboxError::Cancelled) => (
                    Evaluation {
                        outcome: AttemptOutcome::Cancelled,
                        move_count: 0,
                        diagnostic: "cancelled before execution".to_string(),
                        path: None,
                    },
                    None,
                ),
                Err(err) => return Err(err),
            };
        tracker.advance(evaluation.outcome.phase())?;

        let event_type = match tracker.current() {
            AttemptPhase::TimedOut => AttemptEventType::WallTimeLimitViolation,
            AttemptPhase::Cancelled => AttemptEventType::Cancelled,
            _ if evaluation.is_inconsistent() => {
                metrics.inconsistent_results.inc();
                AttemptEventType::InconsistentResult
            }
            _ => AttemptEventType::ExecutionEnd,
        };
        let mut event = AttemptEvent::new(
            event_type,
            evaluation.diagnostic.lines().next().unwrap_or_default(),
        )
        .with_correlation(ids.clone())
        .with_outcome(evaluation.outcome.label());
        if let Some(ms) = wall_time_ms {
            event = event.with_wall_time_ms(ms);
        }
        log_attempt_event(event);

        Ok((evaluation, wall_time_ms))
    }

    /// Every stored attempt of the session's user
    pub fn attempts_for(&self, session_token: &str) -> Result<Vec<MazeAttempt>> {
        let user_id = self.resolve_user(session_token)?;
        self.store.attempts_for(user_id)
    }

    fn attempts_on(&self, session_token: &str, maze_id: MazeId) -> Result<(UserId, Vec<MazeAttempt>)> {
        let user_id = self.resolve_user(session_token)?;
        let attempts = self
            .store
            .attempts_for(user_id)?
            .into_iter()
            .filter(|a| a.maze_id() == maze_id)
            .collect();
        Ok((user_id, attempts))
    }

    pub fn most_recent_attempt(&self, session_token: &str, maze_id: MazeId) -> Result<MazeAttempt> {
        let (user_id, attempts) = self.attempts_on(session_token, maze_id)?;
        most_recent(&attempts)
            .cloned()
            .ok_or(MazeboxError::NoAttempts { user_id, maze_id })
    }

    /// Fewest-move success, else the most recent attempt
    pub fn best_attempt(&self, session_token: &str, maze_id: MazeId) -> Result<MazeAttempt> {
        let (user_id, attempts) = self.attempts_on(session_token, maze_id)?;
        best(&attempts)
            .cloned()
            .ok_or(MazeboxError::NoAttempts { user_id, maze_id })
    }
}

/// Newest by creation time; later insertion wins ties
pub fn most_recent(attempts: &[MazeAttempt]) -> Option<&MazeAttempt> {
    attempts.iter().max_by_key(|a| a.created_at())
}

/// Successful attempt with the fewest moves (newest on ties), falling back
/// to [`most_recent`] when nothing succeeded
pub fn best(attempts: &[MazeAttempt]) -> Option<&MazeAttempt> {
    attempts
        .iter()
        .rev()
        .filter(|a| a.success())
        .min_by(|a, b| {
            a.move_count()
                .cmp(&b.move_count())
                .then_with(|| b.created_at().cmp(&a.created_at()))
        })
        .or_else(|| most_recent(attempts))
}
