use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::attempt::{
    AttemptPipeline, InMemoryAttemptStore, InMemoryMazeRepository, InMemorySessions, Submission,
};
use crate::config::RunnerConfig;
use crate::judge::{adapter_for, registry::SUPPORTED_LANGUAGES};
use crate::maze::MazeLayout;
use crate::safety::cancel::CancellationToken;

/// Maze id and session the one-shot CLI registers with the in-memory collaborators
const CLI_MAZE_ID: i64 = 1;
const CLI_SESSION: &str = "cli";
const CLI_USER: i64 = 0;

#[derive(Parser)]
#[command(author, version, about = "Compile and run untrusted maze agents in isolation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one agent against one maze and print the attempt report as JSON
    Attempt {
        /// Maze digits (0 open, 1 wall, 2 start, 3 goal), or @path to read them from a file
        #[arg(long)]
        maze: String,
        /// File containing the agent source
        #[arg(long)]
        code: PathBuf,
        /// Agent language (rust, java)
        #[arg(long, default_value = "rust")]
        language: String,
        /// Maximum number of moves the harness drives
        #[arg(long)]
        step_limit: Option<u64>,
        /// Wall clock limit for the run in milliseconds
        #[arg(long)]
        wall_time_ms: Option<u64>,
        /// JSON config file (defaults to $MAZEBOX_CONFIG, then built-in defaults)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Print Prometheus metrics to stderr after the attempt
        #[arg(long)]
        metrics: bool,
    },
    /// Check if all language toolchains are installed
    CheckDeps {
        /// Verbose output showing detailed version information
        #[arg(long)]
        verbose: bool,
    },
    /// Remove workspaces left behind by crashed runs
    Sweep {
        /// Only remove workspaces older than this
        #[arg(long, default_value_t = 3600)]
        max_age_secs: u64,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(sig: i32) {
    // Async-signal-safe only: atomics, write(2), _exit(2).
    if SIGNALLED.swap(true, Ordering::SeqCst) {
        unsafe { libc::_exit(128 + sig) };
    }
    let msg = b"mazebox: signal received, cancelling\n";
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
    }
}

/// First SIGINT/SIGTERM trips `token`; a second one exits immediately
fn setup_signal_handlers(token: CancellationToken) {
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as usize);
        libc::signal(libc::SIGINT, signal_handler as usize);
    }
    std::thread::spawn(move || loop {
        if SIGNALLED.load(Ordering::SeqCst) {
            token.cancel();
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    });
}

pub fn run() -> Result<()> {
    env_logger::init();

    if !cfg!(unix) {
        eprintln!("Error: mazebox requires a Unix-like system for process isolation");
        std::process::exit(1);
    }

    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    setup_signal_handlers(cancel.clone());

    match cli.command {
        Commands::Attempt {
            maze,
            code,
            language,
            step_limit,
            wall_time_ms,
            config,
            metrics,
        } => {
            let mut config = RunnerConfig::load(config.as_deref())?;
            if let Some(step_limit) = step_limit {
                config.step_limit = step_limit;
            }
            if let Some(wall_time_ms) = wall_time_ms {
                config.run_limits.wall_time_ms = Some(wall_time_ms);
            }
            config.validate()?;
            if let Some(audit_log) = &config.audit_log {
                crate::observability::audit::init_audit_logger(audit_log)?;
            }

            let layout = MazeLayout::parse(&read_maze_arg(&maze)?)?;
            let source = std::fs::read_to_string(&code)
                .with_context(|| format!("reading agent source {}", code.display()))?;

            let succeeded = run_attempt(config, layout, language, source, &cancel)?;

            if metrics {
                eprint!("{}", crate::observability::metrics::get_metrics().export_prometheus());
            }
            if !succeeded {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::CheckDeps { verbose } => check_language_dependencies(verbose),
        Commands::Sweep {
            max_age_secs,
            config,
        } => {
            let config = RunnerConfig::load(config.as_deref())?;
            let removed = crate::safety::workspace::sweep_stale_workspaces(
                &config.workspace_root,
                Duration::from_secs(max_age_secs),
            )?;
            eprintln!(
                "Removed {} stale workspace(s) under {}",
                removed,
                config.workspace_root.display()
            );
            Ok(())
        }
    }
}

fn read_maze_arg(arg: &str) -> Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => Ok(std::fs::read_to_string(Path::new(path))
            .with_context(|| format!("reading maze file {}", path))?
            .split_whitespace()
            .collect()),
        None => Ok(arg.to_string()),
    }
}

/// Returns whether the agent solved the maze
fn run_attempt(
    config: RunnerConfig,
    layout: MazeLayout,
    language: String,
    code: String,
    cancel: &CancellationToken,
) -> Result<bool> {
    let mazes = InMemoryMazeRepository::new();
    mazes.insert(CLI_MAZE_ID, layout)?;
    let sessions = InMemorySessions::new();
    sessions.login(CLI_SESSION, CLI_USER)?;

    let pipeline = AttemptPipeline::new(
        config,
        Arc::new(mazes),
        Arc::new(sessions),
        Arc::new(InMemoryAttemptStore::new()),
    )?;

    let submission = Submission {
        maze_id: CLI_MAZE_ID,
        session_token: CLI_SESSION.to_string(),
        language,
        code,
        persist: false,
    };
    let report = pipeline.submit(&submission, cancel)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(report.attempt.success())
}

/// Check if all required language toolchains are installed
fn check_language_dependencies(verbose: bool) -> Result<()> {
    use std::process::Command;

    println!("Checking language toolchains...");
    println!();

    let mut missing_languages = Vec::new();

    for language in SUPPORTED_LANGUAGES {
        let adapter = adapter_for(language)?;
        let check = adapter.version_command();
        let Some((program, args)) = check.split_first() else {
            continue;
        };

        let version = match Command::new(program).args(args).output() {
            Ok(output) if output.status.success() => {
                let text = if !output.stdout.is_empty() {
                    String::from_utf8_lossy(&output.stdout)
                } else {
                    String::from_utf8_lossy(&output.stderr)
                };
                Some(text.lines().next().unwrap_or("").trim().to_string())
            }
            Ok(_) | Err(_) => None,
        };

        match version {
            Some(version) => {
                println!("✅ {} - OK", language);
                if verbose {
                    println!("  {} -> {}", program, version);
                }
            }
            None => {
                println!("❌ {} - MISSING", language);
                if verbose {
                    println!("  {} -> NOT FOUND", program);
                }
                missing_languages.push(*language);
            }
        }
    }

    println!();
    if missing_languages.is_empty() {
        println!("All language toolchains are installed");
        if verbose {
            println!();
            println!("Usage example:");
            println!("  mazebox attempt --maze 2001110100010103 --code agent.rs --language rust");
        }
        Ok(())
    } else {
        println!(
            "Missing language toolchains: {}",
            missing_languages.join(", ")
        );
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_attempt_arguments_parse() {
        let cli = Cli::try_parse_from([
            "mazebox",
            "attempt",
            "--maze",
            "2003",
            "--code",
            "agent.rs",
            "--step-limit",
            "50",
        ])
        .unwrap();
        match cli.command {
            Commands::Attempt {
                language,
                step_limit,
                ..
            } => {
                assert_eq!(language, "rust");
                assert_eq!(step_limit, Some(50));
            }
            _ => panic!("expected attempt"),
        }
    }

    #[test]
    fn test_maze_arg_from_file_ignores_whitespace() {
        let path = std::env::temp_dir().join(format!("mazebox_maze_{}.txt", uuid::Uuid::new_v4()));
        std::fs::write(&path, "2001\n1101\n0001\n0103\n").unwrap();
        let digits = read_maze_arg(&format!("@{}", path.display())).unwrap();
        assert_eq!(digits, "2001110100010103");
        let _ = std::fs::remove_file(&path);
        assert_eq!(read_maze_arg("2003").unwrap(), "2003");
    }
}
