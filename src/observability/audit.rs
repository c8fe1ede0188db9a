/// Attempt audit trail
/// Structured events for every submission: what ran, under which ids, and
/// how it ended. Events always go through `log`; when an audit file is
/// configured they are also appended to it as JSON lines.
use crate::config::types::{MazeId, MazeboxError, Result, UserId};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditSeverity {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptEventType {
    SubmissionReceived,
    SubmissionRejected,
    AdmissionRejected,
    CompilationFailed,
    ExecutionStart,
    ExecutionEnd,
    WallTimeLimitViolation,
    InconsistentResult,
    Cancelled,
    AttemptPersisted,
    AttemptDiscarded,
}

impl AttemptEventType {
    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            AttemptEventType::SubmissionReceived => AuditSeverity::Low,
            AttemptEventType::SubmissionRejected => AuditSeverity::Medium,
            AttemptEventType::AdmissionRejected => AuditSeverity::Medium,
            AttemptEventType::CompilationFailed => AuditSeverity::Low,
            AttemptEventType::ExecutionStart => AuditSeverity::Low,
            AttemptEventType::ExecutionEnd => AuditSeverity::Low,
            AttemptEventType::WallTimeLimitViolation => AuditSeverity::Medium,
            AttemptEventType::InconsistentResult => AuditSeverity::High,
            AttemptEventType::Cancelled => AuditSeverity::Medium,
            AttemptEventType::AttemptPersisted => AuditSeverity::Low,
            AttemptEventType::AttemptDiscarded => AuditSeverity::Low,
        }
    }
}

/// Ids tying an event to one invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationIds {
    pub invocation_id: String,
    pub maze_id: Option<MazeId>,
    pub user_id: Option<UserId>,
    pub source_digest: Option<String>,
}

impl CorrelationIds {
    pub fn new(invocation_id: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            ..Default::default()
        }
    }

    pub fn with_maze(mut self, maze_id: MazeId) -> Self {
        self.maze_id = Some(maze_id);
        self
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_source_digest(mut self, digest: impl Into<String>) -> Self {
        self.source_digest = Some(digest.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptEvent {
    pub event_type: AttemptEventType,
    pub severity: AuditSeverity,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub details: String,
    pub correlation: Option<CorrelationIds>,
    pub language: Option<String>,
    pub outcome: Option<String>,
    pub wall_time_ms: Option<u64>,
}

impl AttemptEvent {
    pub fn new(event_type: AttemptEventType, details: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: chrono::Utc::now(),
            details: details.into(),
            correlation: None,
            language: None,
            outcome: None,
            wall_time_ms: None,
        }
    }

    pub fn with_correlation(mut self, correlation: CorrelationIds) -> Self {
        self.correlation = Some(correlation);
        self
    }

    pub fn with_language(mut self, language: &str) -> Self {
        self.language = Some(language.to_string());
        self
    }

    pub fn with_outcome(mut self, outcome: &str) -> Self {
        self.outcome = Some(outcome.to_string());
        self
    }

    pub fn with_wall_time_ms(mut self, wall_time_ms: u64) -> Self {
        self.wall_time_ms = Some(wall_time_ms);
        self
    }

    pub fn with_severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    fn to_json_line(&self) -> serde_json::Value {
        let mut entry = serde_json::json!({
            "timestamp": self.timestamp.to_rfc3339(),
            "event_type": self.event_type,
            "severity": self.severity,
            "details": self.details,
            "process_id": std::process::id(),
        });
        if let Some(correlation) = &self.correlation {
            entry["correlation"] = serde_json::json!({
                "invocation_id": correlation.invocation_id,
                "maze_id": correlation.maze_id,
                "user_id": correlation.user_id,
                "source_digest": correlation.source_digest,
            });
        }
        if let Some(language) = &self.language {
            entry["language"] = serde_json::json!(language);
        }
        if let Some(outcome) = &self.outcome {
            entry["outcome"] = serde_json::json!(outcome);
        }
        if let Some(wall_time_ms) = self.wall_time_ms {
            entry["wall_time_ms"] = serde_json::json!(wall_time_ms);
        }
        entry
    }
}

fn log_to_facade(event: &AttemptEvent) {
    let invocation = event
        .correlation
        .as_ref()
        .map(|c| c.invocation_id.as_str())
        .unwrap_or("-");
    match event.severity {
        AuditSeverity::High => error!("AUDIT {:?} [{}] {}", event.event_type, invocation, event.details),
        AuditSeverity::Medium => warn!("AUDIT {:?} [{}] {}", event.event_type, invocation, event.details),
        AuditSeverity::Low => info!("AUDIT {:?} [{}] {}", event.event_type, invocation, event.details),
    }
}

/// JSON-lines audit file writer
pub struct AuditLogger {
    audit_file: Arc<Mutex<File>>,
    audit_path: PathBuf,
}

impl AuditLogger {
    pub fn new(audit_path: &Path) -> Result<Self> {
        if let Some(parent) = audit_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                MazeboxError::Config(format!("Failed to create audit log directory: {}", e))
            })?;
        }

        let audit_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(audit_path)
            .map_err(|e| MazeboxError::Config(format!("Failed to open audit log: {}", e)))?;

        Ok(Self {
            audit_file: Arc::new(Mutex::new(audit_file)),
            audit_path: audit_path.to_path_buf(),
        })
    }

    pub fn log_event(&self, event: &AttemptEvent) {
        log_to_facade(event);

        let line = event.to_json_line();
        if let Ok(mut file) = self.audit_file.lock() {
            if let Err(e) = writeln!(file, "{}", line) {
                error!("Failed to write to audit log: {}", e);
            }
            if let Err(e) = file.flush() {
                error!("Failed to flush audit log: {}", e);
            }
        } else {
            error!("Failed to acquire lock on audit file");
        }
    }

    pub fn audit_path(&self) -> &Path {
        &self.audit_path
    }
}

static AUDIT_LOGGER: OnceLock<AuditLogger> = OnceLock::new();

/// Install the process-wide audit file. A second call is ignored with an error log.
pub fn init_audit_logger(audit_path: &Path) -> Result<()> {
    let logger = AuditLogger::new(audit_path)?;
    if AUDIT_LOGGER.set(logger).is_err() {
        error!("Audit logger already initialized");
    } else {
        info!("Audit trail at {}", audit_path.display());
    }
    Ok(())
}

/// Log through the global audit file when installed, else through `log` only
pub fn log_attempt_event(event: AttemptEvent) {
    match AUDIT_LOGGER.get() {
        Some(logger) => logger.log_event(&event),
        None => log_to_facade(&event),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_severity() {
        assert_eq!(
            AttemptEventType::InconsistentResult.default_severity(),
            AuditSeverity::High
        );
        assert_eq!(
            AttemptEventType::ExecutionEnd.default_severity(),
            AuditSeverity::Low
        );
    }

    #[test]
    fn test_logger_appends_json_lines() {
        let path = std::env::temp_dir()
            .join(format!("mazebox_audit_{}", uuid::Uuid::new_v4()))
            .join("audit.log");
        let logger = AuditLogger::new(&path).unwrap();

        let ids = CorrelationIds::new("inv-1").with_maze(3).with_user(9);
        logger.log_event(
            &AttemptEvent::new(AttemptEventType::ExecutionStart, "running")
                .with_correlation(ids.clone())
                .with_language("rust"),
        );
        logger.log_event(
            &AttemptEvent::new(AttemptEventType::ExecutionEnd, "done")
                .with_correlation(ids)
                .with_outcome("solved")
                .with_wall_time_ms(42),
        );

        let content = std::fs::read_to_string(logger.audit_path()).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event_type"], "ExecutionStart");
        assert_eq!(lines[0]["correlation"]["maze_id"], 3);
        assert_eq!(lines[1]["outcome"], "solved");
        assert_eq!(lines[1]["wall_time_ms"], 42);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
