//! Background reaper for the manager's worker.
//!
//! One thread per manager, started with the first worker. It sleeps while no
//! worker exists, otherwise blocks in `waitpid`. A clean exit is replaced
//! immediately; a crash is left for the next request to restart lazily.
//! Any failure here aborts the process.
//!
//! Workers replaced before the watcher got to them are reaped by short-lived
//! threads of their own.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use nix::unistd::Pid;

use super::error::SupervisorError;
use super::process::{self, WorkerExit};
use super::{Inner, State};

pub(super) fn spawn(inner: Arc<Inner>) -> Result<JoinHandle<()>, SupervisorError> {
    let handle = thread::Builder::new()
        .name(format!("watcher-{}", inner.env_name))
        .spawn(move || {
            if let Err(e) = watch(&inner) {
                tracing::error!(env = %inner.env_name, "watcher failed, aborting: {}", e);
                inner.log(&format!("watcher failed: {}", e));
                std::process::abort();
            }
        })
        .map_err(SupervisorError::Io)?;
    Ok(handle)
}

fn watch(inner: &Inner) -> Result<(), SupervisorError> {
    loop {
        let pid = next_worker(inner)?;
        let exit = process::wait_for_exit(pid).map_err(|errno| SupervisorError::Io(errno.into()))?;

        let mut state = inner.lock_state()?;
        reap_locked(inner, &mut state, pid, exit)?;
    }
}

/// Sleep until a worker exists and return its pid.
fn next_worker(inner: &Inner) -> Result<Pid, SupervisorError> {
    let mut state = inner.lock_state()?;
    loop {
        if let Some(pid) = state.worker.as_ref().map(|w| w.pid) {
            state.watching = Some(pid);
            return Ok(pid);
        }
        state = inner
            .worker_started
            .wait(state)
            .map_err(|_| SupervisorError::LockPoisoned)?;
    }
}

/// Record the death of `pid` and decide whether to replace it.
fn reap_locked(inner: &Inner, state: &mut State, pid: Pid, exit: WorkerExit) -> Result<(), SupervisorError> {
    inner.log(&format!("worker {} exited with {}", pid, exit));
    state.watching = None;

    // with_child may already have replaced a dead worker; leave that one be.
    if state.worker.as_ref().map(|w| w.pid) == Some(pid) {
        state.worker = None;
        inner.current_pid.store(0, std::sync::atomic::Ordering::SeqCst);
    }

    if state.worker.is_none() && exit.is_clean() {
        inner.spawn_locked(state, true)?;
    }
    Ok(())
}

/// Wait for a worker that is no longer current.
pub(super) fn reap_retired(env_name: &str, pid: Pid) -> std::io::Result<()> {
    let env_name = env_name.to_string();
    thread::Builder::new().name(format!("reaper-{}", pid)).spawn(move || {
        match process::wait_for_exit(pid) {
            Ok(exit) => tracing::debug!(env = %env_name, "retired worker {} exited with {}", pid, exit),
            Err(e) => tracing::warn!(env = %env_name, "failed to reap retired worker {}: {}", pid, e),
        }
    })?;
    Ok(())
}
