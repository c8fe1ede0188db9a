/// Configuration loading from a JSON config file
use crate::config::types::{MazeboxError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming a config file when no explicit path is given
pub const CONFIG_ENV_VAR: &str = "MAZEBOX_CONFIG";

/// Optional overrides applied on top of a language adapter's envelope
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitOverrides {
    pub wall_time_ms: Option<u64>,
    pub cpu_time_ms: Option<u64>,
    pub memory_mb: Option<u64>,
    pub process_limit: Option<u32>,
}

/// Byte budgets for captured output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    /// Bytes of stdout kept from the child
    pub stdout_limit: usize,
    /// Bytes of stderr kept from the child
    pub stderr_limit: usize,
    /// Trailing stdout bytes kept past `stdout_limit`; the result marker is
    /// looked for there when stdout overflowed
    pub tail_limit: usize,
    /// Bytes of program output copied into an attempt diagnostic
    pub excerpt_limit: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            stdout_limit: 1024 * 1024,
            stderr_limit: 256 * 1024,
            tail_limit: 64 * 1024,
            excerpt_limit: 2048,
        }
    }
}

/// Full runner configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Parent directory of per-invocation workspaces
    pub workspace_root: PathBuf,
    /// Strict mode: fail the spawn when an isolation control cannot be applied
    pub strict_mode: bool,
    /// Upper bound on concurrently compiling/running submissions
    pub max_concurrent_runs: usize,
    /// How long a submission waits for an execution slot
    pub admission_timeout_ms: u64,
    /// Maximum number of moves the harness will drive
    pub step_limit: u64,
    pub output: OutputConfig,
    pub run_limits: LimitOverrides,
    pub compile_limits: LimitOverrides,
    /// JSON-lines audit trail (disabled when absent)
    pub audit_log: Option<PathBuf>,
}

impl RunnerConfig {
    /// Workspace root scoped by effective UID.
    /// Prevents root and non-root servers from colliding on a shared temp dir.
    pub fn default_workspace_root() -> PathBuf {
        let euid = nix::unistd::geteuid();
        std::env::temp_dir().join(format!("mazebox-uid-{}", euid))
    }

    /// Load configuration from `path`, else from `$MAZEBOX_CONFIG`, else defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let resolved = match path {
            Some(p) => Some(p.to_path_buf()),
            None => std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from),
        };

        let config = match resolved {
            Some(p) => {
                log::info!("Loading runner configuration from {}", p.display());
                Self::from_file(&p)?
            }
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MazeboxError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| MazeboxError::Config(format!("Invalid config JSON: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.workspace_root.as_os_str().is_empty() {
            return Err(MazeboxError::Config(
                "workspace_root must not be empty".to_string(),
            ));
        }
        if self.max_concurrent_runs == 0 {
            return Err(MazeboxError::Config(
                "max_concurrent_runs must be at least 1".to_string(),
            ));
        }
        if self.output.tail_limit < 1024 {
            return Err(MazeboxError::Config(
                "output.tail_limit must be at least 1024 bytes".to_string(),
            ));
        }
        if self.step_limit == 0 {
            return Err(MazeboxError::Config(
                "step_limit must be at least 1".to_string(),
            ));
        }
        for (name, limits) in [("run_limits", &self.run_limits), ("compile_limits", &self.compile_limits)] {
            if limits.wall_time_ms == Some(0) {
                return Err(MazeboxError::Config(format!(
                    "{}.wall_time_ms must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workspace_root: Self::default_workspace_root(),
            strict_mode: false,
            max_concurrent_runs: 4,
            admission_timeout_ms: 30_000,
            step_limit: 10_000,
            output: OutputConfig::default(),
            run_limits: LimitOverrides::default(),
            compile_limits: LimitOverrides::default(),
            audit_log: None,
        }
    }
}
