use crate::config::LimitOverrides;
use crate::safety::workspace::Workspace;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unprivileged identity a root server drops to before exec
pub const NOBODY: u32 = 65534;

/// Runtime execution profile consumed by the launcher.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionProfile {
    pub command: Vec<String>,
    pub stdin_data: Option<String>,
    /// Variables set explicitly; everything else is cleared
    pub environment: Vec<(String, String)>,
    /// Server variables copied through by name when present
    pub preserve_env: Vec<String>,
    pub workdir: PathBuf,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub strict_mode: bool,
    pub isolate_network: bool,
    /// Own pid and mount namespaces with a private /proc
    pub isolate_processes: bool,
    pub memory_limit: Option<u64>,
    pub file_size_limit: Option<u64>,
    pub stack_limit: Option<u64>,
    pub process_limit: Option<u32>,
    pub cpu_time_limit_ms: Option<u64>,
    pub wall_time_limit_ms: Option<u64>,
    pub fd_limit: Option<u64>,
}

impl Default for ExecutionProfile {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            stdin_data: None,
            environment: Vec::new(),
            preserve_env: Vec::new(),
            workdir: PathBuf::from("."),
            uid: None,
            gid: None,
            strict_mode: false,
            isolate_network: true,
            isolate_processes: true,
            memory_limit: None,
            file_size_limit: None,
            stack_limit: None,
            process_limit: None,
            cpu_time_limit_ms: None,
            wall_time_limit_ms: Some(10_000),
            fd_limit: None,
        }
    }
}

impl ExecutionProfile {
    /// Apply configured overrides on top of the adapter envelope
    pub fn with_overrides(mut self, overrides: &LimitOverrides) -> Self {
        if let Some(ms) = overrides.wall_time_ms {
            self.wall_time_limit_ms = Some(ms);
        }
        if let Some(ms) = overrides.cpu_time_ms {
            self.cpu_time_limit_ms = Some(ms);
        }
        if let Some(mb) = overrides.memory_mb {
            self.memory_limit = Some(mb * 1024 * 1024);
        }
        if let Some(n) = overrides.process_limit {
            self.process_limit = Some(n);
        }
        self
    }

    /// Resolved child environment: explicit entries win over preserved ones.
    /// Loader variables (`LD_*`) never pass through from the server.
    pub fn resolved_environment(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .preserve_env
            .iter()
            .filter(|key| !key.starts_with("LD_"))
            .filter(|key| !self.environment.iter().any(|(k, _)| k == *key))
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.clone(), value)))
            .collect();
        env.extend(self.environment.iter().cloned());
        env
    }
}

/// Signal escalation report for timeout/forced termination paths.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

/// Compiled harness + user code for exactly one invocation.
///
/// Owns its workspace: dropping the artifact removes every file the
/// compiler produced.
#[derive(Debug)]
pub struct Artifact {
    pub language: &'static str,
    /// Profile with command and workdir filled in; stdin is set per run
    pub run_profile: ExecutionProfile,
    /// SHA-256 of the wrapped source that produced this artifact
    pub source_digest: String,
    pub(crate) workspace: Workspace,
}

impl Artifact {
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn invocation_id(&self) -> &str {
        self.workspace.id()
    }
}
