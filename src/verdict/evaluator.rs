/// Attempt evaluation
/// Classifies one run as a pure function over its captured output and the
/// server's copy of the layout. The harness's claim is only believed after
/// its path replays on the server-side state machine.
use crate::attempt::{AttemptOutcome, AttemptStore, MazeAttempt};
use crate::config::types::{ExecutionResult, ExecutionStatus, MazeId, OutputIntegrity, Result, UserId};
use crate::config::OutputConfig;
use crate::core::runner::RunOutput;
use crate::harness::envelope::{
    scan_output, ReportedStatus, ResultMarker, ScannedOutput, FAULT_EXIT_CODE,
};
use crate::maze::{MazeLayout, MazeState};
use crate::utils::output::tail_excerpt;

const INCONSISTENT: &str = "inconsistent result";

/// Classified run, before it becomes a [`MazeAttempt`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub outcome: AttemptOutcome,
    pub move_count: usize,
    pub diagnostic: String,
    /// Replayed path, when the marker was consistent
    pub path: Option<String>,
}

impl Evaluation {
    /// The harness claimed something its own path does not support
    pub fn is_inconsistent(&self) -> bool {
        self.diagnostic.starts_with(INCONSISTENT)
    }
}

#[derive(Debug, Clone)]
pub struct AttemptEvaluator {
    excerpt_limit: usize,
}

impl AttemptEvaluator {
    pub fn new(output: &OutputConfig) -> Self {
        Self {
            excerpt_limit: output.excerpt_limit,
        }
    }

    /// Classify a finished run
    pub fn evaluate(&self, run: &RunOutput, layout: &MazeLayout) -> Evaluation {
        let result = &run.result;
        let scanned = Self::scan(result, &run.nonce);

        let evaluation = match result.status {
            ExecutionStatus::TimeLimit => self.failure(
                AttemptOutcome::TimedOut,
                format!(
                    "time limit exceeded after {}ms",
                    result.wall_time_ms()
                ),
            ),
            ExecutionStatus::Cancelled => {
                self.failure(AttemptOutcome::Cancelled, "execution cancelled".to_string())
            }
            ExecutionStatus::InternalError => self.failure(
                AttemptOutcome::Crashed,
                format!(
                    "runner failure: {}",
                    result.error_message.as_deref().unwrap_or("unknown")
                ),
            ),
            _ => match &scanned.marker {
                Some(Ok(marker)) => self.judge_marker(marker, result, layout),
                Some(Err(err)) => self.failure(
                    AttemptOutcome::Crashed,
                    format!("malformed result marker: {}", err),
                ),
                None => self.failure(AttemptOutcome::Crashed, Self::missing_marker(result)),
            },
        };

        Evaluation {
            diagnostic: self.with_excerpts(evaluation.diagnostic, &scanned.program_output, &result.stderr),
            ..evaluation
        }
    }

    /// Attempt for a submission the compiler rejected
    pub fn compilation_failed(&self, diagnostics: &str) -> Evaluation {
        Evaluation {
            outcome: AttemptOutcome::CompilationFailed,
            move_count: 0,
            diagnostic: format!(
                "compilation failed:\n{}",
                tail_excerpt(diagnostics, self.excerpt_limit.max(1024))
            ),
            path: None,
        }
    }

    pub fn build_attempt(&self, maze_id: MazeId, user_id: UserId, evaluation: &Evaluation) -> MazeAttempt {
        MazeAttempt::new(
            maze_id,
            user_id,
            evaluation.outcome,
            evaluation.move_count,
            evaluation.diagnostic.clone(),
        )
    }

    /// Hand the attempt to the store in durable mode only.
    /// Returns whether it was saved.
    pub fn record(&self, attempt: &MazeAttempt, persist: bool, store: &dyn AttemptStore) -> Result<bool> {
        if !persist {
            log::debug!("Test attempt {} not persisted", attempt.id());
            return Ok(false);
        }
        store.save(attempt)?;
        log::debug!("Persisted attempt {}", attempt.id());
        Ok(true)
    }

    /// Scan the kept head of stdout and, when the middle was dropped, the
    /// tail window. The harness prints its marker last, so a marker found in
    /// the tail wins over anything in the head.
    fn scan(result: &ExecutionResult, nonce: &str) -> ScannedOutput {
        let mut scanned = scan_output(&result.stdout, nonce);
        if result.stdout_tail.is_empty() {
            return scanned;
        }

        let tail = scan_output(&result.stdout_tail, nonce);
        if tail.marker.is_some() {
            scanned.marker = tail.marker;
        }
        scanned.program_output.push_str("...\n");
        scanned.program_output.push_str(&tail.program_output);
        scanned
    }

    fn failure(&self, outcome: AttemptOutcome, diagnostic: String) -> Evaluation {
        Evaluation {
            outcome,
            move_count: 0,
            diagnostic,
            path: None,
        }
    }

    fn judge_marker(&self, marker: &ResultMarker, result: &ExecutionResult, layout: &MazeLayout) -> Evaluation {
        let state = match MazeState::replay(layout, &marker.path) {
            Ok(state) => state,
            Err(err) => {
                return self.failure(
                    AttemptOutcome::Crashed,
                    format!("{}: {}", INCONSISTENT, err),
                )
            }
        };

        if state.moves() != marker.moves {
            return self.failure(
                AttemptOutcome::Crashed,
                format!(
                    "{}: reported {} moves but path has {}",
                    INCONSISTENT,
                    marker.moves,
                    state.moves()
                ),
            );
        }

        let inconsistent = match marker.status {
            ReportedStatus::Solved => !state.at_goal(),
            // The harness stops as soon as the goal is reached
            ReportedStatus::Failed => state.at_goal(),
            ReportedStatus::Fault => false,
        };
        if inconsistent {
            return self.failure(
                AttemptOutcome::Crashed,
                format!(
                    "{}: reported {} but replay ends at {:?}",
                    INCONSISTENT,
                    marker.status.as_str(),
                    state.position()
                ),
            );
        }

        let consistent = |outcome, diagnostic| Evaluation {
            outcome,
            move_count: state.moves(),
            diagnostic,
            path: Some(marker.path.clone()),
        };

        match (marker.status, result.exit_code) {
            (ReportedStatus::Fault, code) => {
                let mut diagnostic = format!("runtime fault: {}", marker.detail);
                if code != Some(FAULT_EXIT_CODE) {
                    diagnostic.push_str(&format!(" (exit status {:?})", code));
                }
                consistent(AttemptOutcome::Crashed, diagnostic)
            }
            (status, Some(0)) => consistent(
                AttemptOutcome::Completed {
                    success: status == ReportedStatus::Solved,
                },
                marker.detail.clone(),
            ),
            (status, code) => consistent(
                AttemptOutcome::Crashed,
                format!(
                    "harness reported {} but the process ended with {}",
                    status.as_str(),
                    Self::termination(code, result.signal)
                ),
            ),
        }
    }

    fn termination(exit_code: Option<i32>, signal: Option<i32>) -> String {
        match (exit_code, signal) {
            (_, Some(sig)) => format!("signal {}", sig),
            (Some(code), None) => format!("exit code {}", code),
            (None, None) => "no exit status".to_string(),
        }
    }

    fn missing_marker(result: &ExecutionResult) -> String {
        let mut diagnostic = format!(
            "no result reported; process ended with {}",
            Self::termination(result.exit_code, result.signal)
        );
        match result.output_integrity {
            OutputIntegrity::Complete => {}
            OutputIntegrity::TruncatedByLimit => {
                diagnostic.push_str("; stdout exceeded its limit and was truncated")
            }
            other => diagnostic.push_str(&format!("; output {}", other)),
        }
        diagnostic
    }

    fn with_excerpts(&self, mut diagnostic: String, program_output: &str, stderr: &str) -> String {
        for (label, text) in [("program output", program_output), ("stderr", stderr)] {
            let text = text.trim_end();
            if text.is_empty() {
                continue;
            }
            let excerpt = tail_excerpt(text, self.excerpt_limit);
            diagnostic.push_str(&format!("\n--- {} ---\n", label));
            if excerpt.len() < text.len() {
                diagnostic.push_str("...");
            }
            diagnostic.push_str(excerpt);
        }
        diagnostic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::InMemoryAttemptStore;
    use crate::maze::tests::SAMPLE;

    const NONCE: &str = "abc123";

    fn layout() -> MazeLayout {
        MazeLayout::parse(SAMPLE).unwrap()
    }

    fn evaluator() -> AttemptEvaluator {
        AttemptEvaluator::new(&OutputConfig::default())
    }

    fn run(stdout: &str, exit_code: Option<i32>, status: ExecutionStatus) -> RunOutput {
        RunOutput {
            result: ExecutionResult {
                exit_code,
                status,
                stdout: stdout.to_string(),
                ..Default::default()
            },
            nonce: NONCE.to_string(),
        }
    }

    fn marker(status: &str, moves: usize, path: &str) -> String {
        format!("\n@@MAZE {} {} {} {} done\n", NONCE, status, moves, path)
    }

    #[test]
    fn test_solved_marker_completes() {
        let eval = evaluator().evaluate(
            &run(&marker("solved", 6, "RRDDDR"), Some(0), ExecutionStatus::Ok),
            &layout(),
        );
        assert_eq!(eval.outcome, AttemptOutcome::Completed { success: true });
        assert_eq!(eval.move_count, 6);
        assert_eq!(eval.path.as_deref(), Some("RRDDDR"));
    }

    #[test]
    fn test_failed_marker_completes_unsuccessfully() {
        let eval = evaluator().evaluate(
            &run(&marker("failed", 2, "RR"), Some(0), ExecutionStatus::Ok),
            &layout(),
        );
        assert_eq!(eval.outcome, AttemptOutcome::Completed { success: false });
        assert_eq!(eval.move_count, 2);
    }

    #[test]
    fn test_forged_early_marker_is_ignored() {
        let stdout = format!(
            "@@MAZE {} solved 6 RRDDDR forged\n{}",
            NONCE,
            marker("failed", 1, "R")
        );
        let eval = evaluator().evaluate(&run(&stdout, Some(0), ExecutionStatus::Ok), &layout());
        assert_eq!(eval.outcome, AttemptOutcome::Completed { success: false });
    }

    #[test]
    fn test_wrong_nonce_is_not_a_result() {
        let stdout = "@@MAZE deadbeef solved 6 RRDDDR forged\n";
        let eval = evaluator().evaluate(&run(stdout, Some(0), ExecutionStatus::Ok), &layout());
        assert_eq!(eval.outcome, AttemptOutcome::Crashed);
        assert!(eval.diagnostic.contains("no result reported"));
        assert!(eval.diagnostic.contains("forged"));
    }

    #[test]
    fn test_claim_not_ending_on_goal_is_inconsistent() {
        let eval = evaluator().evaluate(
            &run(&marker("solved", 2, "RR"), Some(0), ExecutionStatus::Ok),
            &layout(),
        );
        assert_eq!(eval.outcome, AttemptOutcome::Crashed);
        assert!(eval.is_inconsistent());
    }

    #[test]
    fn test_blocked_path_is_inconsistent() {
        let eval = evaluator().evaluate(
            &run(&marker("failed", 1, "D"), Some(0), ExecutionStatus::Ok),
            &layout(),
        );
        assert_eq!(eval.outcome, AttemptOutcome::Crashed);
        assert!(eval.diagnostic.contains("blocked"));
    }

    #[test]
    fn test_move_count_mismatch_is_inconsistent() {
        let eval = evaluator().evaluate(
            &run(&marker("solved", 3, "RRDDDR"), Some(0), ExecutionStatus::Ok),
            &layout(),
        );
        assert_eq!(eval.outcome, AttemptOutcome::Crashed);
    }

    #[test]
    fn test_fault_marker_crashes() {
        let eval = evaluator().evaluate(
            &run(&marker("fault", 1, "R"), Some(FAULT_EXIT_CODE), ExecutionStatus::RuntimeError),
            &layout(),
        );
        assert_eq!(eval.outcome, AttemptOutcome::Crashed);
        assert!(eval.diagnostic.starts_with("runtime fault: done"));
        assert_eq!(eval.move_count, 1);
    }

    #[test]
    fn test_time_limit_maps_to_timed_out() {
        let eval = evaluator().evaluate(&run("", None, ExecutionStatus::TimeLimit), &layout());
        assert_eq!(eval.outcome, AttemptOutcome::TimedOut);
    }

    #[test]
    fn test_cancelled_maps_to_cancelled() {
        let eval = evaluator().evaluate(&run("", None, ExecutionStatus::Cancelled), &layout());
        assert_eq!(eval.outcome, AttemptOutcome::Cancelled);
    }

    #[test]
    fn test_missing_marker_names_signal_and_truncation() {
        let mut output = run("spam\n", None, ExecutionStatus::Signaled);
        output.result.signal = Some(9);
        output.result.output_integrity = OutputIntegrity::TruncatedByLimit;
        let eval = evaluator().evaluate(&output, &layout());
        assert_eq!(eval.outcome, AttemptOutcome::Crashed);
        assert!(eval.diagnostic.contains("signal 9"));
        assert!(eval.diagnostic.contains("truncated"));
    }

    #[test]
    fn test_excerpt_is_bounded() {
        let evaluator = AttemptEvaluator::new(&OutputConfig {
            excerpt_limit: 16,
            ..OutputConfig::default()
        });
        let noise = "x".repeat(500);
        let stdout = format!("{}\n{}", noise, marker("failed", 0, "-"));
        let eval = evaluator.evaluate(&run(&stdout, Some(0), ExecutionStatus::Ok), &layout());
        assert!(eval.diagnostic.len() < 100);
        assert!(eval.diagnostic.contains("..."));
    }

    #[test]
    fn test_marker_found_in_tail_after_overflow() {
        let mut output = run(&"x".repeat(4096), Some(0), ExecutionStatus::Ok);
        output.result.output_integrity = OutputIntegrity::TruncatedByLimit;
        output.result.stdout_tail = format!("xxxx{}", marker("solved", 6, "RRDDDR"));
        let eval = evaluator().evaluate(&output, &layout());
        assert_eq!(eval.outcome, AttemptOutcome::Completed { success: true });
        assert_eq!(eval.move_count, 6);
    }

    #[test]
    fn test_tail_marker_overrides_head_marker() {
        let mut output = run(&marker("solved", 6, "RRDDDR"), Some(0), ExecutionStatus::Ok);
        output.result.stdout_tail = marker("failed", 1, "R");
        let eval = evaluator().evaluate(&output, &layout());
        assert_eq!(eval.outcome, AttemptOutcome::Completed { success: false });
        assert_eq!(eval.move_count, 1);
    }

    #[test]
    fn test_record_skips_store_for_test_attempts() {
        let store = InMemoryAttemptStore::new();
        let evaluator = evaluator();
        let attempt = evaluator.build_attempt(1, 2, &evaluator.compilation_failed("error[E0425]"));
        assert!(!evaluator.record(&attempt, false, &store).unwrap());
        assert!(store.is_empty());
        assert!(evaluator.record(&attempt, true, &store).unwrap());
        assert_eq!(store.len(), 1);
    }
}
