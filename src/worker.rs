//! The daemon's worker application: runs catalog commands for clients.
//!
//! Per client the worker forks a command process, reports its pid back to
//! the supervisor and reaps it on a separate thread. The reaper sends
//! `exit:<code>` to the client once the command is done.

use std::io::{BufReader, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use nix::unistd::{dup2, fork, ForkResult, Pid};

use crate::commands::{CommandRegistry, ExecHost};
use crate::ipc::{Request, WorkerEndpoint};
use crate::supervisor::process::{self, WorkerExit};
use crate::supervisor::Application;

/// Prefix of the final line the client receives.
pub const EXIT_PREFIX: &str = "exit:";

pub struct CommandWorker {
    registry: Arc<CommandRegistry>,
    interpreter: String,
    root: PathBuf,
}

impl CommandWorker {
    pub fn new(registry: Arc<CommandRegistry>, interpreter: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            interpreter: interpreter.into(),
            root: root.into(),
        }
    }

    fn host(&self) -> ExecHost {
        ExecHost::new(&self.interpreter, &self.root)
    }

    /// Runs in the forked command process. Only returns on failure.
    fn exec_command(&self, client: &UnixStream, request: &Request) -> anyhow::Result<()> {
        for stdio in 0..=2 {
            dup2(client.as_raw_fd(), stdio).context("redirecting stdio to client")?;
        }
        for (key, value) in &request.env {
            std::env::set_var(key, value);
        }

        let name = request.command().context("empty request")?;
        let command = self
            .registry
            .get(name)
            .with_context(|| format!("unknown command '{}'", name))?;

        let mut host = self.host();
        command.setup(&mut host)?;
        command.call(request.tail(), &mut host)?;
        Err(host.exec())
    }
}

impl Application for CommandWorker {
    fn preload(&self) -> anyhow::Result<()> {
        for command in self.registry.distinct() {
            command.setup(&mut self.host())?;
        }
        tracing::info!("worker {} preloaded", std::process::id());
        Ok(())
    }

    fn serve(&self, endpoint: WorkerEndpoint) -> anyhow::Result<()> {
        while let Some(client) = endpoint.recv_client()? {
            endpoint.acknowledge()?;
            let client = UnixStream::from(client);

            let request = match Request::read_from(&mut BufReader::new(&client)) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!("dropping client: {:#}", e);
                    endpoint.decline()?;
                    continue;
                }
            };

            // SAFETY: the child only redirects stdio and execs.
            match unsafe { fork() }.context("forking command process")? {
                ForkResult::Child => {
                    let err = match self.exec_command(&client, &request) {
                        Ok(()) => anyhow::anyhow!("command returned without exec"),
                        Err(e) => e,
                    };
                    eprintln!("{:#}", err);
                    std::process::exit(1);
                }
                ForkResult::Parent { child } => {
                    endpoint.report_pid(child.as_raw() as u32)?;
                    spawn_reaper(child, client)?;
                }
            }
        }
        // Supervisor dropped our channel.
        Ok(())
    }
}

fn spawn_reaper(child: Pid, mut client: UnixStream) -> anyhow::Result<()> {
    thread::Builder::new()
        .name(format!("reaper-{}", child))
        .spawn(move || {
            let code = match process::wait_for_exit(child) {
                Ok(exit) => exit_code(exit),
                Err(e) => {
                    tracing::warn!("failed to reap command {}: {}", child, e);
                    1
                }
            };
            let _ = writeln!(client, "{}{}", EXIT_PREFIX, code);
        })
        .context("spawning reaper thread")?;
    Ok(())
}

/// Shell-style exit code.
pub fn exit_code(exit: WorkerExit) -> i32 {
    match exit {
        WorkerExit::Clean => 0,
        WorkerExit::Failed(code) => code,
        WorkerExit::Signaled(sig) => 128 + sig as i32,
    }
}
