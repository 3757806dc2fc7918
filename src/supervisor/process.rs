//! Worker process primitives: fork sequence, termination, reaping.

use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use super::error::SupervisorError;
use super::Application;
use crate::env::AppEnv;
use crate::ipc::{WorkerChannel, WorkerEndpoint};
use crate::title::{ProcessTitle, ProcessTitleUpdater};

/// How a reaped worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// `exit(0)`: the worker chose to stop and should be replaced at once.
    Clean,
    Failed(i32),
    Signaled(Signal),
}

impl WorkerExit {
    pub fn from_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, 0) => Some(Self::Clean),
            WaitStatus::Exited(_, code) => Some(Self::Failed(code)),
            WaitStatus::Signaled(_, sig, _) => Some(Self::Signaled(sig)),
            _ => None,
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clean => write!(f, "exit status 0"),
            Self::Failed(code) => write!(f, "exit status {}", code),
            Self::Signaled(sig) => write!(f, "signal {}", sig),
        }
    }
}

/// Everything the forked worker needs to set itself up.
pub struct WorkerSpec<'a> {
    pub env_name: &'a str,
    pub app_env: &'a AppEnv,
    pub env_vars: &'a [String],
    pub application: &'a Arc<dyn Application>,
    pub preload: bool,
}

/// Fork a worker bound to a fresh channel pair. The parent gets the worker's
/// pid and its end of the channel; the child never returns.
///
/// The caller is usually multi-threaded. Whatever the child needs is built
/// here, before forking, so the child only closes descriptors, resets signal
/// dispositions and runs the application. Residual risk: setting the
/// environment, spawning the title thread and logging still take process-wide
/// locks in the child, and a lock another parent thread held at fork time stays
/// held there. A worker stuck that way never acknowledges; `stop` still kills
/// it because it needs no lock.
pub fn fork_worker(spec: &WorkerSpec<'_>) -> Result<(Pid, WorkerChannel), SupervisorError> {
    let (channel, endpoint) = WorkerChannel::pair()?;
    let boot = WorkerBoot {
        env: spec.env_vars.iter().map(|var| (var.clone(), spec.env_name.to_string())).collect(),
        title: ProcessTitle::locate(),
        app_name: spec.app_env.app_name().to_string(),
        env_name: spec.env_name.to_string(),
        application: Arc::clone(spec.application),
        preload: spec.preload,
    };

    // SAFETY: see above. The child never returns into the caller.
    match unsafe { fork() }.map_err(SupervisorError::Fork)? {
        ForkResult::Parent { child } => {
            drop(endpoint);
            Ok((child, channel))
        }
        ForkResult::Child => {
            // Closed wholesale below, so its destructor must not run.
            std::mem::forget(channel);
            enter_worker(boot, endpoint)
        }
    }
}

/// Child-side state, prepared in the parent.
struct WorkerBoot {
    env: Vec<(String, String)>,
    title: ProcessTitle,
    app_name: String,
    env_name: String,
    application: Arc<dyn Application>,
    preload: bool,
}

fn enter_worker(boot: WorkerBoot, endpoint: WorkerEndpoint) -> ! {
    close_inherited_fds(endpoint.as_raw_fd());
    reset_signal_handlers();

    for (key, value) in &boot.env {
        std::env::set_var(key, value);
    }

    let WorkerBoot { app_name, env_name, title, application, preload, .. } = boot;
    let _ = ProcessTitleUpdater::spawn(title, move |distance| {
        format!("prewarm app | {} | started {} ago | {} mode", app_name, distance, env_name)
    });

    let result = (|| {
        if preload {
            application.preload()?;
        }
        application.serve(endpoint)
    })();

    let code = match result {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("worker {} failed: {:#}", std::process::id(), e);
            1
        }
    };
    std::process::exit(code)
}

/// Close every descriptor except stdin/stdout/stderr and `keep`.
pub fn close_inherited_fds(keep: RawFd) {
    let open: Vec<RawFd> = match std::fs::read_dir("/dev/fd") {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().and_then(|name| name.parse().ok()))
            .collect(),
        Err(_) => (3..max_fd()).collect(),
    };

    for fd in open {
        if fd > 2 && fd != keep {
            // EBADF for the directory handle we just released; ignore.
            let _ = nix::unistd::close(fd);
        }
    }
}

fn max_fd() -> RawFd {
    // SAFETY: sysconf has no preconditions.
    let limit = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if limit <= 0 {
        1024
    } else {
        limit.min(65_536) as RawFd
    }
}

/// The parent may have installed handlers (Ctrl-C, child reaping) that make
/// no sense in a worker.
fn reset_signal_handlers() {
    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGCHLD] {
        // SAFETY: restoring the default disposition is always sound.
        if let Err(e) = unsafe { signal::signal(sig, SigHandler::SigDfl) } {
            tracing::debug!("failed to reset {}: {}", sig, e);
        }
    }
}

/// Send SIGTERM to a worker. Does not wait for it to exit.
pub fn terminate(pid: Pid) -> Result<(), SupervisorError> {
    match signal::kill(pid, Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(SupervisorError::Signal { pid: pid.as_raw(), source }),
    }
}

/// Block until `pid` terminates.
pub fn wait_for_exit(pid: Pid) -> nix::Result<WorkerExit> {
    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                if let Some(exit) = WorkerExit::from_status(status) {
                    return Ok(exit);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    #[test]
    fn test_exit_classification() {
        let pid = Pid::from_raw(4242);
        assert_eq!(WorkerExit::from_status(WaitStatus::Exited(pid, 0)), Some(WorkerExit::Clean));
        assert_eq!(WorkerExit::from_status(WaitStatus::Exited(pid, 3)), Some(WorkerExit::Failed(3)));
        assert_eq!(
            WorkerExit::from_status(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            Some(WorkerExit::Signaled(Signal::SIGKILL))
        );
        assert_eq!(WorkerExit::from_status(WaitStatus::StillAlive), None);
        assert!(WorkerExit::Clean.is_clean());
        assert!(!WorkerExit::Failed(1).is_clean());
    }

    #[test]
    fn test_wait_for_exit_reports_status() {
        let child = Command::new("sh").args(["-c", "exit 7"]).spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        assert_eq!(wait_for_exit(pid).unwrap(), WorkerExit::Failed(7));
    }

    #[test]
    fn test_terminate_is_seen_as_signal() {
        let child = Command::new("sleep").arg("30").process_group(0).spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        terminate(pid).unwrap();
        assert_eq!(wait_for_exit(pid).unwrap(), WorkerExit::Signaled(Signal::SIGTERM));
    }
}
