//! Control server: routes client requests to the manager of the right
//! environment.
//!
//! Control protocol, per connection:
//! 1. the client passes its application connection (`SCM_RIGHTS`) and writes
//!    one [`Request`] line;
//! 2. unknown commands get the connection closed without a reply;
//! 3. otherwise the server answers with an empty line, then the pid of the
//!    process serving the command (empty when no worker could take it).

use std::collections::HashMap;
use std::io::{BufReader, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;

use crate::commands::{Command, CommandRegistry};
use crate::config::DaemonConfig;
use crate::env::AppEnv;
use crate::ipc::{self, Request};
use crate::supervisor::{Application, ApplicationManager, ServerHooks, WorkerSettings};

// ─── Hooks ───────────────────────────────────────────────────

/// Server-side sink for manager logs and start notifications.
#[derive(Debug, Default)]
pub struct ServerEvents {
    starts: AtomicU64,
}

impl ServerEvents {
    /// Number of workers forked so far.
    pub fn starts(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }
}

impl ServerHooks for ServerEvents {
    fn log(&self, message: &str) {
        tracing::info!("{}", message);
    }

    fn application_starting(&self) {
        let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!("application starting (#{})", n);
    }
}

// ─── Server ──────────────────────────────────────────────────

pub struct Server {
    config: DaemonConfig,
    app_env: AppEnv,
    registry: Arc<CommandRegistry>,
    application: Arc<dyn Application>,
    events: Arc<ServerEvents>,
    applications: Mutex<HashMap<String, ApplicationManager>>,
}

impl Server {
    pub fn new(
        config: DaemonConfig,
        app_env: AppEnv,
        registry: Arc<CommandRegistry>,
        application: Arc<dyn Application>,
    ) -> Self {
        Self {
            config,
            app_env,
            registry,
            application,
            events: Arc::new(ServerEvents::default()),
            applications: Mutex::new(HashMap::new()),
        }
    }

    pub fn events(&self) -> &ServerEvents {
        &self.events
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Manager for `env_name`, created on first use.
    pub fn manager(&self, env_name: &str) -> ApplicationManager {
        let mut applications = self.applications.lock().unwrap_or_else(|e| e.into_inner());
        applications
            .entry(env_name.to_string())
            .or_insert_with(|| {
                tracing::info!("Creating application manager for '{}'", env_name);
                let settings = WorkerSettings {
                    app_env: self.app_env.clone(),
                    env_vars: self.config.env_vars.clone(),
                    application: Arc::clone(&self.application),
                };
                ApplicationManager::new(self.events.clone(), env_name, settings)
            })
            .clone()
    }

    /// Pick the environment: the command's own choice, then the client's
    /// environment variables, then the configured default.
    pub fn resolve_env(&self, command: &dyn Command, request: &Request) -> String {
        command
            .env(request.tail())
            .or_else(|| {
                self.config
                    .env_vars
                    .iter()
                    .find_map(|var| request.env.get(var).filter(|v| !v.is_empty()).cloned())
            })
            .unwrap_or_else(|| self.config.default_env.clone())
    }

    /// Serve one control connection. Blocking.
    pub fn serve(&self, mut control: UnixStream) -> anyhow::Result<()> {
        let app_client = ipc::fd::recv_fd(&control)?
            .context("client hung up before sending its connection")?;
        let request = Request::read_from(&mut BufReader::new(&control))?;

        let Some(command) = request.command().and_then(|name| self.registry.get(name)) else {
            tracing::warn!("Unknown command {:?}; closing client", request.command());
            return Ok(());
        };

        let env_name = self.resolve_env(command.as_ref(), &request);
        writeln!(control)?;

        let pid = self.manager(&env_name).run(app_client).map_err(|e| {
            tracing::error!(env = %env_name, code = e.error_code(), "Cannot run {:?}: {}", request.args, e);
            e
        })?;
        writeln!(control, "{}", pid.map(|p| p.to_string()).unwrap_or_default())?;
        Ok(())
    }

    /// Accept control connections until the listener fails.
    pub async fn listen(self: Arc<Self>, listener: tokio::net::UnixListener) -> anyhow::Result<()> {
        loop {
            let (stream, _) = listener.accept().await?;
            let stream = stream.into_std()?;
            stream.set_nonblocking(false)?;

            let server = Arc::clone(&self);
            // manager I/O and fork are blocking; keep them off the runtime threads
            tokio::task::spawn_blocking(move || {
                if let Err(e) = server.serve(stream) {
                    tracing::warn!("Client error: {:#}", e);
                }
            });
        }
    }

    /// Send SIGTERM to every worker.
    pub fn stop_all(&self) {
        let applications = self.applications.lock().unwrap_or_else(|e| e.into_inner());
        for (env_name, manager) in applications.iter() {
            if let Err(e) = manager.stop() {
                tracing::warn!("Failed to stop '{}' worker: {}", env_name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::builtin;
    use crate::ipc::WorkerEndpoint;

    struct Unused;

    impl Application for Unused {
        fn serve(&self, _endpoint: WorkerEndpoint) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn server(config: DaemonConfig) -> Server {
        Server::new(
            config,
            AppEnv::new("/tmp/prewarm-server"),
            Arc::new(builtin::registry(&HashMap::new())),
            Arc::new(Unused),
        )
    }

    fn request(args: &[&str], env: &[(&str, &str)]) -> Request {
        Request {
            args: args.iter().map(|s| s.to_string()).collect(),
            env: env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn test_resolve_env_prefers_command() {
        let server = server(DaemonConfig::default());
        let req = request(&["test", "test/unit"], &[("RAILS_ENV", "production")]);
        let command = server.registry().get("test").unwrap();
        assert_eq!(server.resolve_env(command.as_ref(), &req), "test");
    }

    #[test]
    fn test_resolve_env_falls_back_to_client_then_default() {
        let server = server(DaemonConfig::default());
        let rake = server.registry().get("rake").unwrap();

        let req = request(&["rake", "db:migrate"], &[("RACK_ENV", "staging")]);
        assert_eq!(server.resolve_env(rake.as_ref(), &req), "staging");

        let req = request(&["rake", "db:migrate"], &[("RAILS_ENV", "")]);
        assert_eq!(server.resolve_env(rake.as_ref(), &req), "development");
    }

    #[test]
    fn test_manager_is_created_once_per_env() {
        let server = server(DaemonConfig::default());
        let a = server.manager("test");
        let b = server.manager("test");
        let c = server.manager("development");
        assert_eq!(a.env_name(), "test");
        assert_eq!(b.env_name(), "test");
        assert_eq!(c.env_name(), "development");
        assert_eq!(server.applications.lock().unwrap().len(), 2);
        assert_eq!(server.events().starts(), 0, "managers start lazily");
    }
}
