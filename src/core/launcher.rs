//! Single-child launcher.
//!
//! Spawns one process with the pre-exec chain applied, feeds stdin on a
//! writer thread, drains stdout/stderr on collector threads and polls the
//! child until it exits, the wall deadline fires or the cancellation token
//! trips. On deadline or cancellation the child's whole process group is
//! terminated: SIGTERM, a short grace period, then SIGKILL. A child that
//! exits on its own is first observed without reaping, so its group can
//! still be SIGKILLed before the pid is released.

use crate::config::types::{ExecutionResult, ExecutionStatus, MazeboxError, OutputIntegrity, Result};
use crate::core::types::{ExecutionProfile, KillReport};
use crate::exec::preexec::PreExecPlan;
use crate::safety::cancel::CancellationToken;
use crate::utils::output::{combine_integrity, spawn_collector, CollectedStream, OutputLimits};
use crossbeam_channel::Receiver;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const TERM_GRACE: Duration = Duration::from_millis(200);
const DEFAULT_WALL_LIMIT: Duration = Duration::from_secs(30);

/// Launch output
#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    pub pid: i32,
    pub result: ExecutionResult,
    pub kill_report: Option<KillReport>,
}

fn to_process_error(prefix: &str, err: impl std::fmt::Display) -> MazeboxError {
    MazeboxError::Process(format!("{}: {}", prefix, err))
}

/// Terminate the child's process group, falling back to the child alone
/// when the group is gone (setsid skipped in permissive mode).
pub fn terminate_group(pid: Pid) -> KillReport {
    let mut report = KillReport::default();
    let start = Instant::now();

    report.term_sent = true;
    if let Err(e) = killpg(pid, Signal::SIGTERM) {
        let _ = kill(pid, Signal::SIGTERM);
        report
            .notes
            .push(format!("group SIGTERM fallback used: {}", e));
    }

    thread::sleep(TERM_GRACE);

    report.kill_sent = true;
    if let Err(e) = killpg(pid, Signal::SIGKILL) {
        let _ = kill(pid, Signal::SIGKILL);
        report
            .notes
            .push(format!("group SIGKILL fallback used: {}", e));
    }

    report.waited_ms = start.elapsed().as_millis() as u64;
    report
}

/// Map raw wait results onto an execution status
pub fn classify(
    exit_code: Option<i32>,
    signal: Option<i32>,
    timed_out: bool,
    cancelled: bool,
) -> ExecutionStatus {
    if cancelled {
        ExecutionStatus::Cancelled
    } else if timed_out || signal == Some(libc::SIGXCPU) {
        ExecutionStatus::TimeLimit
    } else if signal.is_some() {
        ExecutionStatus::Signaled
    } else if exit_code == Some(0) {
        ExecutionStatus::Ok
    } else {
        ExecutionStatus::RuntimeError
    }
}

/// Peek for exit without reaping; a zombie child keeps its process group id
fn exited_unreaped(pid: Pid) -> nix::Result<bool> {
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    let rc = unsafe {
        libc::waitid(
            libc::P_PID,
            pid.as_raw() as libc::id_t,
            &mut info,
            libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
        )
    };
    if rc < 0 {
        return Err(nix::errno::Errno::last());
    }
    Ok(unsafe { info.si_pid() } != 0)
}

/// Blocking reap of an exited child: (exit code, signal)
fn reap(pid: Pid) -> std::result::Result<(Option<i32>, Option<i32>), String> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok((Some(code), None)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok((None, Some(sig as i32))),
            Ok(_) | Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(format!("waitpid: {}", e)),
        }
    }
}

fn receive(rx: &Receiver<CollectedStream>, deadline: Instant) -> CollectedStream {
    rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
        .unwrap_or(CollectedStream {
            integrity: OutputIntegrity::ReadError,
            ..Default::default()
        })
}

/// Run `profile.command` to completion under the profile's limits.
///
/// Errors only when no child could be started. Once a child exists the
/// outcome is always an [`ExecutionResult`], with failures encoded in it.
pub fn launch(
    profile: &ExecutionProfile,
    limits: &OutputLimits,
    cancel: &CancellationToken,
) -> Result<LaunchOutcome> {
    let program = profile
        .command
        .first()
        .ok_or_else(|| MazeboxError::Config("empty command".to_string()))?;

    if cancel.is_cancelled() {
        return Err(MazeboxError::Cancelled);
    }

    let plan = PreExecPlan::for_profile(profile)?;

    let mut cmd = Command::new(program);
    cmd.args(&profile.command[1..])
        .current_dir(&profile.workdir)
        .env_clear()
        .envs(profile.resolved_environment())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if profile.stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

    // The chain only issues raw syscalls on data prepared above.
    unsafe {
        cmd.pre_exec(move || plan.apply());
    }

    let started = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| to_process_error(&format!("spawn {}", program), e))?;
    let pid = Pid::from_raw(child.id() as i32);
    log::debug!("Spawned {} as pid {}", program, pid);

    let stdout_rx = child
        .stdout
        .take()
        .map(|s| spawn_collector(s, limits.stdout_limit, limits.tail_limit));
    let stderr_rx = child
        .stderr
        .take()
        .map(|s| spawn_collector(s, limits.stderr_limit, 0));

    if let (Some(data), Some(mut stdin)) = (profile.stdin_data.clone(), child.stdin.take()) {
        // The child may exit without reading; a broken pipe is expected then.
        thread::spawn(move || {
            let _ = stdin.write_all(data.as_bytes());
        });
    }

    let wall_limit = profile
        .wall_time_limit_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_WALL_LIMIT);

    let mut timed_out = false;
    let mut cancelled = false;
    let mut kill_report: Option<KillReport> = None;
    let mut exit_code = None;
    let mut signal = None;
    let mut internal_error = None;

    loop {
        match exited_unreaped(pid) {
            Ok(false) => {
                if kill_report.is_none() {
                    if started.elapsed() > wall_limit {
                        timed_out = true;
                        log::info!("Wall time limit of {:?} exceeded by pid {}", wall_limit, pid);
                        kill_report = Some(terminate_group(pid));
                        continue;
                    }
                    if cancel.is_cancelled() {
                        cancelled = true;
                        log::info!("Cancelling pid {}", pid);
                        kill_report = Some(terminate_group(pid));
                        continue;
                    }
                }
                thread::sleep(POLL_INTERVAL);
            }
            Ok(true) => {
                // Whatever the child left running in its group goes with it.
                let _ = killpg(pid, Signal::SIGKILL);
                match reap(pid) {
                    Ok((code, sig)) => {
                        exit_code = code;
                        signal = sig;
                    }
                    Err(e) => internal_error = Some(e),
                }
                break;
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                internal_error = Some(format!("waitid: {}", e));
                let _ = terminate_group(pid);
                let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
                break;
            }
        }
    }
    let wall_time = started.elapsed();

    // Stragglers that escaped the group kill may still hold the pipes.
    let collect_deadline = Instant::now() + Duration::from_millis(limits.collection_timeout_ms);
    let stdout = stdout_rx
        .map(|rx| receive(&rx, collect_deadline))
        .unwrap_or_default();
    let stderr = stderr_rx
        .map(|rx| receive(&rx, collect_deadline))
        .unwrap_or_default();

    let status = if internal_error.is_some() {
        ExecutionStatus::InternalError
    } else {
        classify(exit_code, signal, timed_out, cancelled)
    };

    let error_message = internal_error.or_else(|| match status {
        ExecutionStatus::TimeLimit if !timed_out => Some("cpu time limit exceeded".to_string()),
        ExecutionStatus::TimeLimit => Some(format!(
            "wall time limit of {}ms exceeded",
            wall_limit.as_millis()
        )),
        ExecutionStatus::Cancelled => Some("cancelled".to_string()),
        _ => None,
    });

    let result = ExecutionResult {
        exit_code,
        status,
        stdout: stdout.lossy(),
        stdout_tail: stdout.tail_lossy(),
        stderr: stderr.lossy(),
        output_integrity: combine_integrity(stdout.integrity, stderr.integrity),
        wall_time: wall_time.as_secs_f64(),
        signal,
        success: status == ExecutionStatus::Ok,
        error_message,
    };

    log::debug!(
        "pid {} finished: status={:?} exit={:?} signal={:?} wall={}ms",
        pid,
        result.status,
        result.exit_code,
        result.signal,
        result.wall_time_ms()
    );

    Ok(LaunchOutcome {
        pid: pid.as_raw(),
        result,
        kill_report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> ExecutionProfile {
        ExecutionProfile {
            command: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            isolate_network: false,
            preserve_env: vec!["PATH".to_string()],
            wall_time_limit_ms: Some(5_000),
            ..Default::default()
        }
    }

    fn have_sh() -> bool {
        std::path::Path::new("/bin/sh").exists()
    }

    /// Some live process runs `sleep <tag>`; zombies have an empty cmdline
    fn sleeper_alive(tag: &str) -> bool {
        let needle = format!("sleep\0{}\0", tag);
        std::fs::read_dir("/proc")
            .map(|entries| {
                entries.flatten().any(|entry| {
                    std::fs::read(entry.path().join("cmdline"))
                        .map(|cmdline| String::from_utf8_lossy(&cmdline).ends_with(needle.as_str()))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    fn sleeper_gone(tag: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if !sleeper_alive(tag) {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(Some(0), None, false, false), ExecutionStatus::Ok);
        assert_eq!(classify(Some(70), None, false, false), ExecutionStatus::RuntimeError);
        assert_eq!(classify(None, Some(libc::SIGSEGV), false, false), ExecutionStatus::Signaled);
        assert_eq!(classify(None, Some(libc::SIGXCPU), false, false), ExecutionStatus::TimeLimit);
        assert_eq!(classify(None, Some(libc::SIGKILL), true, false), ExecutionStatus::TimeLimit);
        assert_eq!(classify(None, Some(libc::SIGKILL), true, true), ExecutionStatus::Cancelled);
    }

    #[test]
    fn test_empty_command_is_config_error() {
        let err = launch(
            &ExecutionProfile::default(),
            &OutputLimits::default(),
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, MazeboxError::Config(_)));
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let profile = ExecutionProfile {
            command: vec!["/nonexistent/mazebox-binary".to_string()],
            isolate_network: false,
            ..Default::default()
        };
        let err = launch(&profile, &OutputLimits::default(), &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, MazeboxError::Process(_)));
    }

    #[test]
    fn test_stdin_round_trip_and_exit_code() {
        if !have_sh() {
            return;
        }
        let mut profile = shell("cat; echo oops >&2; exit 3");
        profile.stdin_data = Some("nonce abc\nend\n".to_string());
        let outcome = launch(&profile, &OutputLimits::default(), &CancellationToken::new()).unwrap();
        assert_eq!(outcome.result.stdout, "nonce abc\nend\n");
        assert_eq!(outcome.result.stderr, "oops\n");
        assert_eq!(outcome.result.exit_code, Some(3));
        assert_eq!(outcome.result.status, ExecutionStatus::RuntimeError);
        assert!(outcome.kill_report.is_none());
    }

    #[test]
    fn test_environment_is_cleared() {
        if !have_sh() {
            return;
        }
        std::env::set_var("MAZEBOX_LAUNCHER_SECRET", "leak");
        let outcome = launch(
            &shell("echo \"[$MAZEBOX_LAUNCHER_SECRET]\""),
            &OutputLimits::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(outcome.result.stdout, "[]\n");
        assert!(outcome.result.success);
    }

    #[test]
    fn test_wall_deadline_kills_group() {
        if !have_sh() {
            return;
        }
        let mut profile = shell("sleep 30 & sleep 30; wait");
        profile.wall_time_limit_ms = Some(300);
        let started = Instant::now();
        let outcome = launch(&profile, &OutputLimits::default(), &CancellationToken::new()).unwrap();
        assert_eq!(outcome.result.status, ExecutionStatus::TimeLimit);
        assert!(outcome.kill_report.as_ref().unwrap().kill_sent);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_background_child_dies_with_parent() {
        if !have_sh() {
            return;
        }
        let outcome = launch(
            &shell("sleep 713 </dev/null >/dev/null 2>&1 & exit 0"),
            &OutputLimits::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert!(outcome.result.success);
        assert!(outcome.kill_report.is_none());
        assert!(sleeper_gone("713"));
    }

    #[test]
    fn test_background_child_dies_without_pid_namespace() {
        if !have_sh() {
            return;
        }
        let mut profile = shell("sleep 714 </dev/null >/dev/null 2>&1 & exit 0");
        profile.isolate_processes = false;
        let outcome = launch(&profile, &OutputLimits::default(), &CancellationToken::new()).unwrap();
        assert!(outcome.result.success);
        assert!(sleeper_gone("714"));
    }

    #[test]
    fn test_new_session_cannot_escape_pid_namespace() {
        let setsid = ["/usr/bin/setsid", "/bin/setsid"]
            .into_iter()
            .find(|p| std::path::Path::new(p).exists());
        let Some(setsid) = setsid else {
            return;
        };
        if !have_sh() {
            return;
        }
        let script = format!(
            "echo $$; {} sleep 715 </dev/null >/dev/null 2>&1 & exit 0",
            setsid
        );
        let outcome = launch(&shell(&script), &OutputLimits::default(), &CancellationToken::new()).unwrap();
        if outcome.result.stdout.trim() != "1" {
            // Host refused the pid namespace; nothing contains a new session then.
            let _ = std::process::Command::new("pkill").args(["-f", "sleep 715"]).status();
            return;
        }
        assert!(sleeper_gone("715"));
    }

    #[test]
    fn test_private_proc_hides_host_processes() {
        if !have_sh() {
            return;
        }
        let outcome = launch(
            &shell("echo $$; readlink /proc/self; ls /proc | grep -c '^[0-9]'"),
            &OutputLimits::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        let lines: Vec<&str> = outcome.result.stdout.lines().collect();
        let own_proc = lines.get(1).and_then(|pid| pid.trim().parse::<u32>().ok()).is_some_and(|pid| pid < 16);
        if lines.first() != Some(&"1") || !own_proc {
            // No pid namespace or the host refused the proc mount
            return;
        }
        let visible: u32 = lines[2].trim().parse().unwrap();
        // sh plus readlink, ls and grep at most
        assert!(visible <= 4, "saw {} pids:\n{}", visible, outcome.result.stdout);
    }

    #[test]
    fn test_cancellation_kills_child() {
        if !have_sh() {
            return;
        }
        let token = CancellationToken::new();
        let remote = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            remote.cancel();
        });
        let started = Instant::now();
        let outcome = launch(&shell("sleep 30"), &OutputLimits::default(), &token).unwrap();
        assert_eq!(outcome.result.status, ExecutionStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_already_cancelled_never_spawns() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            launch(&shell("true"), &OutputLimits::default(), &token),
            Err(MazeboxError::Cancelled)
        ));
    }

    #[test]
    fn test_output_limit_marks_truncation() {
        if !have_sh() {
            return;
        }
        let limits = OutputLimits {
            stdout_limit: 16,
            tail_limit: 32,
            ..Default::default()
        };
        let outcome = launch(
            &shell("i=0; while [ $i -lt 200 ]; do echo line-$i; i=$((i+1)); done"),
            &limits,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(outcome.result.stdout.len(), 16);
        assert_eq!(outcome.result.stdout_tail.len(), 32);
        assert!(outcome.result.stdout_tail.ends_with("line-199\n"));
        assert_eq!(outcome.result.output_integrity, OutputIntegrity::TruncatedByLimit);
        assert!(outcome.result.success);
    }
}
