//! Application manager: supervises the single preloaded worker of one
//! application environment.
//!
//! All worker-identity transitions go through `Inner::state`. The pid is
//! mirrored in an atomic so that `is_alive`/`pid`/`stop` never wait behind a
//! caller that is blocked on worker I/O.

pub mod error;
pub mod process;
mod watcher;

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use nix::unistd::Pid;

use crate::env::AppEnv;
use crate::ipc::{self, WorkerChannel, WorkerEndpoint};
use error::SupervisorError;
use process::WorkerSpec;

/// Code that runs inside the forked worker.
pub trait Application: Send + Sync {
    /// Load expensive state up front. Called before `serve` on restarts.
    fn preload(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Serve clients until the endpoint closes. Returning `Ok` exits the
    /// worker with status 0, which makes the supervisor replace it at once.
    fn serve(&self, endpoint: WorkerEndpoint) -> anyhow::Result<()>;
}

/// What the manager needs from the server that owns it.
pub trait ServerHooks: Send + Sync {
    fn log(&self, message: &str);

    /// Called once per fork, before forking.
    fn application_starting(&self);
}

/// Worker-side settings fixed for the manager's lifetime.
#[derive(Clone)]
pub struct WorkerSettings {
    pub app_env: AppEnv,
    /// Environment variables set to the environment name in the worker.
    pub env_vars: Vec<String>,
    pub application: Arc<dyn Application>,
}

/// The live worker: its pid and the channel paired with it.
pub struct Worker {
    pid: Pid,
    channel: Arc<WorkerChannel>,
}

impl Worker {
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    pub fn channel(&self) -> &Arc<WorkerChannel> {
        &self.channel
    }
}

#[derive(Default)]
struct State {
    worker: Option<Worker>,
    watcher: Option<JoinHandle<()>>,
    /// Pid the watcher is blocked on, if any.
    watching: Option<Pid>,
}

struct Inner {
    env_name: String,
    settings: WorkerSettings,
    hooks: Arc<dyn ServerHooks>,
    state: Mutex<State>,
    worker_started: Condvar,
    /// Mirror of `state.worker`'s pid, 0 when absent. Written under `state`.
    current_pid: AtomicI32,
}

/// Supervisor for one application environment. Cheap to clone.
#[derive(Clone)]
pub struct ApplicationManager {
    inner: Arc<Inner>,
}

impl ApplicationManager {
    pub fn new(hooks: Arc<dyn ServerHooks>, env_name: impl Into<String>, settings: WorkerSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                env_name: env_name.into(),
                settings,
                hooks,
                state: Mutex::new(State::default()),
                worker_started: Condvar::new(),
                current_pid: AtomicI32::new(0),
            }),
        }
    }

    pub fn env_name(&self) -> &str {
        &self.inner.env_name
    }

    /// Pid of the current worker, if one is believed alive.
    pub fn pid(&self) -> Option<u32> {
        match self.inner.current_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid as u32),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.pid().is_some()
    }

    /// Fork a worker and make sure the watcher is running.
    pub fn start(&self) -> Result<u32, SupervisorError> {
        let mut state = self.inner.lock_state()?;
        self.inner.start_locked(&mut state).map(Worker::pid)
    }

    /// Fork a replacement worker that preloads before serving.
    pub fn restart(&self) -> Result<u32, SupervisorError> {
        let mut state = self.inner.lock_state()?;
        self.inner.spawn_locked(&mut state, true).map(Worker::pid)
    }

    /// Send SIGTERM to the worker, if any. The watcher does the cleanup.
    pub fn stop(&self) -> Result<(), SupervisorError> {
        match self.pid() {
            Some(pid) => {
                self.inner.log(&format!("stopping worker {}", pid));
                process::terminate(Pid::from_raw(pid as i32))
            }
            None => Ok(()),
        }
    }

    /// Run `block` against a live worker, holding the manager lock.
    ///
    /// Starts a worker first if none is alive. If `block` fails because the
    /// worker died and has not been reaped yet, a new worker is started and
    /// `block` is retried once. A second failure is returned as is.
    pub fn with_child<T, F>(&self, mut block: F) -> Result<T, SupervisorError>
    where
        F: FnMut(&Worker) -> Result<T, SupervisorError>,
    {
        let mut state = self.inner.lock_state()?;

        if let Some(worker) = state.worker.as_ref() {
            match block(worker) {
                Err(e) if e.is_disconnect() => {
                    self.inner.log(&format!("child dead ({}); starting", e));
                }
                other => return other,
            }
        } else {
            self.inner.log("child not running; starting");
        }

        let worker = self.inner.start_locked(&mut state)?;
        block(worker)
    }

    /// Hand `client` to the worker and return the pid of the process that
    /// serves it.
    ///
    /// `client` is consumed and closed before returning, whatever happens.
    /// Worker connectivity failures yield `Ok(None)`; only failures to manage
    /// the worker itself (fork, poisoned lock) are returned as errors.
    pub fn run<C: Into<OwnedFd>>(&self, client: C) -> Result<Option<u32>, SupervisorError> {
        let client: OwnedFd = client.into();
        let result = self.hand_off(client.as_fd());
        drop(client);

        match result {
            Err(e) if e.is_disconnect() => {
                self.inner.log(&format!("{} while reading from child; returning no pid", e));
                Ok(None)
            }
            other => other,
        }
    }

    fn hand_off(&self, client: BorrowedFd<'_>) -> Result<Option<u32>, SupervisorError> {
        let exchange = self.with_child(|worker| {
            let exchange = worker.channel().begin()?;
            exchange.send_client(client)?;
            exchange.read_line()?;
            Ok(exchange)
        })?;

        let line = exchange.read_line()?;
        let pid = ipc::parse_pid(&line);
        match pid {
            Some(pid) => self.inner.log(&format!("got worker pid {}", pid)),
            None => self.inner.log(&format!("unparseable worker pid {:?}", line)),
        }
        Ok(pid)
    }
}

impl Inner {
    fn lock_state(&self) -> Result<MutexGuard<'_, State>, SupervisorError> {
        self.state.lock().map_err(|e| {
            tracing::error!("ApplicationManager lock poisoned: {}", e);
            SupervisorError::LockPoisoned
        })
    }

    fn log(&self, message: &str) {
        self.hooks.log(&format!("[{}] {}", self.env_name, message));
    }

    fn start_locked<'a>(self: &Arc<Self>, state: &'a mut State) -> Result<&'a Worker, SupervisorError> {
        if state.watcher.is_none() {
            state.watcher = Some(watcher::spawn(Arc::clone(self))?);
        }
        self.spawn_locked(state, false)
    }

    /// Fork a worker and install it as the current one. A worker it replaces
    /// is retired.
    fn spawn_locked<'a>(&self, state: &'a mut State, preload: bool) -> Result<&'a Worker, SupervisorError> {
        self.hooks.application_starting();

        let spec = WorkerSpec {
            env_name: &self.env_name,
            app_env: &self.settings.app_env,
            env_vars: &self.settings.env_vars,
            application: &self.settings.application,
            preload,
        };
        let (pid, channel) = process::fork_worker(&spec)?;

        if let Some(old) = state.worker.take() {
            self.retire(state, old);
        }
        let worker = state.worker.insert(Worker {
            pid,
            channel: Arc::new(channel),
        });
        self.current_pid.store(pid.as_raw(), Ordering::SeqCst);
        self.worker_started.notify_all();
        self.log(&format!("forked worker {}", pid));
        Ok(worker)
    }

    /// Drop a superseded worker's channel, which makes a live worker exit,
    /// and make sure someone reaps it.
    fn retire(&self, state: &State, old: Worker) {
        let pid = old.pid;
        drop(old);
        if state.watching == Some(pid) {
            return;
        }
        if let Err(e) = watcher::reap_retired(&self.env_name, pid) {
            tracing::error!(env = %self.env_name, "cannot reap retired worker {}: {}", pid, e);
        }
    }
}
