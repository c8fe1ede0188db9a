//! Pre-exec isolation chain.
//!
//! The setup sequence runs in the forked child between `fork` and `exec`
//! and is fixed:
//! 1. setsid() so the whole tree shares one process group
//! 2. prctl(PR_SET_PDEATHSIG, SIGKILL)
//! 3. namespaces: network, pid and mount (directly as root, inside a user
//!    namespace otherwise)
//! 4. with a pid namespace: fork an init. The forked-off side stays
//!    behind as a relay that mirrors the init's exit; the init re-arms
//!    PDEATHSIG, makes mounts private and mounts its own /proc
//! 5. rlimit set
//! 6. setgroups, setgid, setuid (root only)
//! 7. exec
//!
//! When the init exits the kernel kills everything left in its pid
//! namespace, including descendants that called setsid().
//!
//! Everything the child needs is computed in the parent by
//! [`PreExecPlan::for_profile`]. The child side only issues raw syscalls:
//! no allocation, no locks, no logging.
use crate::config::types::{MazeboxError, Result};
use crate::core::types::ExecutionProfile;
use nix::sched::{unshare, CloneFlags};
use std::ffi::CString;
use std::io;
use std::marker::PhantomData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitSetting {
    pub name: &'static str,
    pub resource: libc::__rlimit_resource_t,
    pub soft: u64,
    pub hard: u64,
}

/// Which namespaces the child leaves and how
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespacePlan {
    Shared,
    /// unshare(flags) directly; requires CAP_SYS_ADMIN
    Direct { flags: CloneFlags },
    /// unshare(CLONE_NEWUSER | flags) and map the caller's ids
    UserNamespace {
        flags: CloneFlags,
        uid_map: Vec<u8>,
        gid_map: Vec<u8>,
    },
}

impl NamespacePlan {
    pub fn flags(&self) -> CloneFlags {
        match self {
            NamespacePlan::Shared => CloneFlags::empty(),
            NamespacePlan::Direct { flags } | NamespacePlan::UserNamespace { flags, .. } => *flags,
        }
    }
}

const PROCESS_FLAGS: CloneFlags = CloneFlags::CLONE_NEWPID.union(CloneFlags::CLONE_NEWNS);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreExecPlan {
    pub strict_mode: bool,
    pub namespaces: NamespacePlan,
    pub limits: Vec<RlimitSetting>,
    pub credentials: Option<(u32, u32)>,
    setgroups_path: CString,
    uid_map_path: CString,
    gid_map_path: CString,
    root_path: CString,
    proc_path: CString,
    proc_fstype: CString,
}

fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Unprivileged user namespaces look usable on this host
fn user_namespaces_available() -> bool {
    let max = std::fs::read_to_string("/proc/sys/user/max_user_namespaces")
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    let debian_toggle = std::fs::read_to_string("/proc/sys/kernel/unprivileged_userns_clone")
        .map(|s| s.trim() != "0")
        .unwrap_or(true);
    max > 0 && debian_toggle
}

fn c_path(path: &str) -> Result<CString> {
    CString::new(path).map_err(|e| MazeboxError::Process(format!("bad path {}: {}", path, e)))
}

/// rlimit set derived from a profile. Core dumps and locked memory are
/// always zero.
pub fn rlimits_for(profile: &ExecutionProfile) -> Vec<RlimitSetting> {
    let mut limits = Vec::new();

    if let Some(bytes) = profile.memory_limit {
        limits.push(RlimitSetting {
            name: "RLIMIT_AS",
            resource: libc::RLIMIT_AS,
            soft: bytes,
            hard: bytes,
        });
    }
    if let Some(ms) = profile.cpu_time_limit_ms {
        let secs = ms.div_ceil(1000).max(1);
        limits.push(RlimitSetting {
            name: "RLIMIT_CPU",
            resource: libc::RLIMIT_CPU,
            soft: secs,
            hard: secs + 1,
        });
    }
    if let Some(n) = profile.process_limit {
        limits.push(RlimitSetting {
            name: "RLIMIT_NPROC",
            resource: libc::RLIMIT_NPROC,
            soft: n as u64,
            hard: n as u64,
        });
    }
    if let Some(bytes) = profile.file_size_limit {
        limits.push(RlimitSetting {
            name: "RLIMIT_FSIZE",
            resource: libc::RLIMIT_FSIZE,
            soft: bytes,
            hard: bytes,
        });
    }
    if let Some(bytes) = profile.stack_limit {
        limits.push(RlimitSetting {
            name: "RLIMIT_STACK",
            resource: libc::RLIMIT_STACK,
            soft: bytes,
            hard: bytes,
        });
    }
    if let Some(n) = profile.fd_limit {
        limits.push(RlimitSetting {
            name: "RLIMIT_NOFILE",
            resource: libc::RLIMIT_NOFILE,
            soft: n,
            hard: n,
        });
    }
    limits.push(RlimitSetting {
        name: "RLIMIT_CORE",
        resource: libc::RLIMIT_CORE,
        soft: 0,
        hard: 0,
    });
    limits.push(RlimitSetting {
        name: "RLIMIT_MEMLOCK",
        resource: libc::RLIMIT_MEMLOCK,
        soft: 0,
        hard: 0,
    });

    limits
}

impl PreExecPlan {
    /// Decide, in the parent, what the child will do before exec
    pub fn for_profile(profile: &ExecutionProfile) -> Result<Self> {
        let root = running_as_root();

        let mut flags = CloneFlags::empty();
        if profile.isolate_network {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if profile.isolate_processes {
            flags |= PROCESS_FLAGS;
        }

        let namespaces = if flags.is_empty() {
            NamespacePlan::Shared
        } else if root {
            NamespacePlan::Direct { flags }
        } else if user_namespaces_available() {
            let uid = nix::unistd::getuid().as_raw();
            let gid = nix::unistd::getgid().as_raw();
            NamespacePlan::UserNamespace {
                flags,
                uid_map: format!("{} {} 1\n", uid, uid).into_bytes(),
                gid_map: format!("{} {} 1\n", gid, gid).into_bytes(),
            }
        } else if profile.strict_mode {
            return Err(MazeboxError::Privilege(format!(
                "namespace isolation ({:?}) needs root or unprivileged user namespaces",
                flags
            )));
        } else {
            log::warn!(
                "Namespace isolation unavailable in permissive mode; child shares host network and pid space"
            );
            NamespacePlan::Shared
        };

        let credentials = match profile.uid {
            Some(uid) if root => Some((uid, profile.gid.unwrap_or(uid))),
            Some(uid) => {
                log::debug!(
                    "Not running as root; child keeps the server identity instead of uid {}",
                    uid
                );
                None
            }
            None => None,
        };

        Ok(Self {
            strict_mode: profile.strict_mode,
            namespaces,
            limits: rlimits_for(profile),
            credentials,
            setgroups_path: c_path("/proc/self/setgroups")?,
            uid_map_path: c_path("/proc/self/uid_map")?,
            gid_map_path: c_path("/proc/self/gid_map")?,
            root_path: c_path("/")?,
            proc_path: c_path("/proc")?,
            proc_fstype: c_path("proc")?,
        })
    }

    /// Child-side entry point, called from `Command::pre_exec`
    pub fn apply(&self) -> io::Result<()> {
        ChildSetup::new(self)
            .new_session()?
            .isolate_namespaces()?
            .contain_processes()?
            .apply_limits()?
            .drop_credentials()?;
        Ok(())
    }

    fn tolerate(&self, result: io::Result<()>) -> io::Result<()> {
        match result {
            Err(e) if self.strict_mode => Err(e),
            _ => Ok(()),
        }
    }

    /// Leave the namespaces in `flags`, writing id maps when a user
    /// namespace is part of the plan
    fn enter(&self, flags: CloneFlags) -> io::Result<()> {
        match &self.namespaces {
            NamespacePlan::Shared => Ok(()),
            NamespacePlan::Direct { .. } => unshare(flags).map_err(errno_to_io),
            NamespacePlan::UserNamespace { uid_map, gid_map, .. } => {
                unshare(CloneFlags::CLONE_NEWUSER | flags)
                    .map_err(errno_to_io)
                    .and_then(|()| write_proc_file(&self.setgroups_path, b"deny"))
                    .and_then(|()| write_proc_file(&self.uid_map_path, uid_map))
                    .and_then(|()| write_proc_file(&self.gid_map_path, gid_map))
            }
        }
    }
}

fn errno_to_io(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

// ============================================================================
// Type-state chain
// ============================================================================
//
// Fresh -> SessionReady -> NamespacesReady -> Contained -> Limited -> ExecReady
//
// Each step consumes the prior state, so the order above cannot drift.

pub struct Fresh;
pub struct SessionReady;
pub struct NamespacesReady;
pub struct Contained;
pub struct Limited;
pub struct ExecReady;

pub struct ChildSetup<'a, S> {
    plan: &'a PreExecPlan,
    /// Set once unshare(CLONE_NEWPID) actually succeeded
    pid_namespace: bool,
    _state: PhantomData<S>,
}

impl<'a, S> ChildSetup<'a, S> {
    fn advance<T>(self) -> ChildSetup<'a, T> {
        ChildSetup {
            plan: self.plan,
            pid_namespace: self.pid_namespace,
            _state: PhantomData,
        }
    }
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn arm_parent_death_signal() -> io::Result<()> {
    check(unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0) })
}

impl<'a> ChildSetup<'a, Fresh> {
    pub fn new(plan: &'a PreExecPlan) -> Self {
        Self {
            plan,
            pid_namespace: false,
            _state: PhantomData,
        }
    }

    pub fn new_session(self) -> io::Result<ChildSetup<'a, SessionReady>> {
        self.plan.tolerate(check(unsafe { libc::setsid() }))?;
        self.plan.tolerate(arm_parent_death_signal())?;
        Ok(self.advance())
    }
}

impl<'a> ChildSetup<'a, SessionReady> {
    /// Permissive mode falls back to network-only isolation when the pid
    /// and mount namespaces are refused.
    pub fn isolate_namespaces(mut self) -> io::Result<ChildSetup<'a, NamespacesReady>> {
        let flags = self.plan.namespaces.flags();
        if flags.is_empty() {
            return Ok(self.advance());
        }

        match self.plan.enter(flags) {
            Ok(()) => {
                self.pid_namespace = flags.contains(CloneFlags::CLONE_NEWPID);
            }
            Err(e) if self.plan.strict_mode => return Err(e),
            Err(_) => {
                let network_only = flags.difference(PROCESS_FLAGS);
                if !network_only.is_empty() {
                    let _ = self.plan.enter(network_only);
                }
            }
        }
        Ok(self.advance())
    }
}

impl<'a> ChildSetup<'a, NamespacesReady> {
    /// Fork the pid namespace init. Only the init returns from here; the
    /// calling process becomes its relay and never returns.
    pub fn contain_processes(self) -> io::Result<ChildSetup<'a, Contained>> {
        if !self.pid_namespace {
            return Ok(self.advance());
        }

        let init = unsafe { libc::fork() };
        if init < 0 {
            return Err(io::Error::last_os_error());
        }
        if init > 0 {
            relay_exit(init);
        }

        // fork() cleared the death signal; the relay is the parent now
        arm_parent_death_signal()?;

        let private = check(unsafe {
            libc::mount(
                std::ptr::null(),
                self.plan.root_path.as_ptr(),
                std::ptr::null(),
                libc::MS_REC | libc::MS_PRIVATE,
                std::ptr::null(),
            )
        });
        // Never mount over /proc while propagation could still reach the host
        if private.is_ok() {
            self.plan.tolerate(check(unsafe {
                libc::mount(
                    self.plan.proc_fstype.as_ptr(),
                    self.plan.proc_path.as_ptr(),
                    self.plan.proc_fstype.as_ptr(),
                    libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
                    std::ptr::null(),
                )
            }))?;
        } else {
            self.plan.tolerate(private)?;
        }
        Ok(self.advance())
    }
}

/// Relay side of the pid namespace: drop every descriptor past stdio so
/// the spawn error pipe only stays open in the init, wait for the init,
/// then leave the same way it did.
fn relay_exit(init: libc::pid_t) -> ! {
    close_descriptors_from(3);

    let mut status: libc::c_int = 0;
    loop {
        let rc = unsafe { libc::waitpid(init, &mut status, 0) };
        if rc == init {
            break;
        }
        if rc < 0 && io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            unsafe { libc::_exit(127) };
        }
    }

    unsafe {
        if libc::WIFEXITED(status) {
            libc::_exit(libc::WEXITSTATUS(status));
        }
        if libc::WIFSIGNALED(status) {
            let sig = libc::WTERMSIG(status);
            let no_core = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            libc::setrlimit(libc::RLIMIT_CORE, &no_core);
            libc::signal(sig, libc::SIG_DFL);
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, sig);
            libc::sigprocmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
            libc::kill(libc::getpid(), sig);
            libc::_exit(128 + sig);
        }
        libc::_exit(127)
    }
}

/// close_range(2) with a plain loop for kernels older than 5.9
fn close_descriptors_from(first: libc::c_uint) {
    let rc = unsafe { libc::syscall(libc::SYS_close_range, first, libc::c_uint::MAX, 0 as libc::c_uint) };
    if rc == 0 {
        return;
    }
    let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let max = if max <= 0 { 1024 } else { max.min(65536) as libc::c_int };
    for fd in first as libc::c_int..max {
        unsafe { libc::close(fd) };
    }
}

impl<'a> ChildSetup<'a, Contained> {
    pub fn apply_limits(self) -> io::Result<ChildSetup<'a, Limited>> {
        for limit in &self.plan.limits {
            self.plan.tolerate(apply_rlimit_value(limit))?;
        }
        Ok(self.advance())
    }
}

impl<'a> ChildSetup<'a, Limited> {
    /// Supplementary groups first, then gid, then uid. Not tolerated:
    /// a root child that cannot shed root never reaches exec.
    pub fn drop_credentials(self) -> io::Result<ChildSetup<'a, ExecReady>> {
        if let Some((uid, gid)) = self.plan.credentials {
            check(unsafe { libc::setgroups(0, std::ptr::null()) })?;
            check(unsafe { libc::setgid(gid) })?;
            check(unsafe { libc::setuid(uid) })?;
        }
        Ok(self.advance())
    }
}

fn apply_rlimit_value(setting: &RlimitSetting) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: setting.soft as libc::rlim_t,
        rlim_max: setting.hard as libc::rlim_t,
    };
    check(unsafe { libc::setrlimit(setting.resource, &limit) })
}

fn write_proc_file(path: &CString, content: &[u8]) -> io::Result<()> {
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let written = unsafe { libc::write(fd, content.as_ptr().cast(), content.len()) };
    let result = if written < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    };
    unsafe { libc::close(fd) };
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ExecutionProfile {
        ExecutionProfile {
            command: vec!["/bin/true".to_string()],
            memory_limit: Some(256 * 1024 * 1024),
            cpu_time_limit_ms: Some(1500),
            process_limit: Some(1),
            fd_limit: Some(64),
            ..Default::default()
        }
    }

    fn find<'a>(limits: &'a [RlimitSetting], name: &str) -> Option<&'a RlimitSetting> {
        limits.iter().find(|l| l.name == name)
    }

    #[test]
    fn test_cpu_limit_rounds_up_with_hard_margin() {
        let limits = rlimits_for(&profile());
        let cpu = find(&limits, "RLIMIT_CPU").unwrap();
        assert_eq!(cpu.soft, 2);
        assert_eq!(cpu.hard, 3);
    }

    #[test]
    fn test_core_and_memlock_always_zero() {
        let limits = rlimits_for(&ExecutionProfile::default());
        assert_eq!(find(&limits, "RLIMIT_CORE").unwrap().hard, 0);
        assert_eq!(find(&limits, "RLIMIT_MEMLOCK").unwrap().hard, 0);
        assert!(find(&limits, "RLIMIT_AS").is_none());
    }

    #[test]
    fn test_configured_limits_present() {
        let limits = rlimits_for(&profile());
        assert_eq!(find(&limits, "RLIMIT_AS").unwrap().soft, 256 * 1024 * 1024);
        assert_eq!(find(&limits, "RLIMIT_NPROC").unwrap().soft, 1);
        assert_eq!(find(&limits, "RLIMIT_NOFILE").unwrap().hard, 64);
    }

    #[test]
    fn test_plan_without_isolation_shares_everything() {
        let plan = PreExecPlan::for_profile(&ExecutionProfile {
            isolate_network: false,
            isolate_processes: false,
            ..profile()
        })
        .unwrap();
        assert_eq!(plan.namespaces, NamespacePlan::Shared);
    }

    #[test]
    fn test_process_isolation_adds_pid_and_mount_namespaces() {
        let plan = PreExecPlan::for_profile(&ExecutionProfile {
            isolate_network: false,
            isolate_processes: true,
            ..profile()
        })
        .unwrap();
        match plan.namespaces {
            NamespacePlan::Shared => {}
            other => {
                let flags = other.flags();
                assert!(flags.contains(CloneFlags::CLONE_NEWPID));
                assert!(flags.contains(CloneFlags::CLONE_NEWNS));
                assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
            }
        }
    }

    #[test]
    fn test_network_and_process_flags_combine() {
        let plan = PreExecPlan::for_profile(&ExecutionProfile {
            isolate_network: true,
            isolate_processes: true,
            ..profile()
        })
        .unwrap();
        if let NamespacePlan::UserNamespace { flags, uid_map, .. } = &plan.namespaces {
            assert_eq!(*flags, CloneFlags::CLONE_NEWNET | PROCESS_FLAGS);
            assert!(uid_map.ends_with(b" 1\n"));
        }
        if running_as_root() {
            assert_eq!(
                plan.namespaces,
                NamespacePlan::Direct {
                    flags: CloneFlags::CLONE_NEWNET | PROCESS_FLAGS
                }
            );
        }
    }

    #[test]
    fn test_credentials_only_dropped_as_root() {
        let plan = PreExecPlan::for_profile(&ExecutionProfile {
            uid: Some(65534),
            gid: Some(65534),
            isolate_network: false,
            ..profile()
        })
        .unwrap();
        if running_as_root() {
            assert_eq!(plan.credentials, Some((65534, 65534)));
        } else {
            assert_eq!(plan.credentials, None);
        }
    }

    #[test]
    fn test_permissive_plan_always_builds() {
        let plan = PreExecPlan::for_profile(&profile()).unwrap();
        assert!(!plan.strict_mode);
    }
}
