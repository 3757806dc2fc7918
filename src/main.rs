use std::sync::Arc;

use prewarm::client::{self, Outcome};
use prewarm::commands::builtin;
use prewarm::config::DaemonConfig;
use prewarm::env::AppEnv;
use prewarm::ipc::Request;
use prewarm::server::Server;
use prewarm::worker::CommandWorker;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cfg = DaemonConfig::load()?;
    let app_env = match &cfg.root {
        Some(root) => AppEnv::new(root),
        None => AppEnv::current()?,
    };
    let socket = app_env.resolve(&cfg.socket_path);

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("server") {
        return run_server(cfg, app_env, socket).await;
    }

    let mut request = Request::new(args);
    request.env = std::env::vars().collect();
    let outcome = tokio::task::spawn_blocking(move || {
        client::run(&socket, &request, &mut std::io::stdout().lock())
    })
    .await??;

    match outcome {
        Outcome::Finished { code, .. } => std::process::exit(code),
        Outcome::UnknownCommand => {
            eprintln!("Unknown command. Available: {}", builtin::registry(&cfg.preload_overrides()).names().join(", "));
            std::process::exit(1);
        }
    }
}

async fn run_server(cfg: DaemonConfig, app_env: AppEnv, socket: std::path::PathBuf) -> anyhow::Result<()> {
    tracing::info!("prewarm server starting for {}", app_env.app_name());

    let registry = Arc::new(builtin::registry(&cfg.preload_overrides()));
    let worker = Arc::new(CommandWorker::new(
        Arc::clone(&registry),
        cfg.interpreter.clone(),
        app_env.root(),
    ));
    let server = Arc::new(Server::new(cfg, app_env, registry, worker));

    if socket.exists() {
        tracing::warn!("Removing stale socket {}", socket.display());
        std::fs::remove_file(&socket)?;
    }
    if let Some(dir) = socket.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let listener = tokio::net::UnixListener::bind(&socket)?;
    tracing::info!("Listening on {}", socket.display());

    // Graceful shutdown: stop every worker and remove the socket
    let server_shutdown = Arc::clone(&server);
    let socket_shutdown = socket.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received, cleaning up...");
        server_shutdown.stop_all();
        let _ = std::fs::remove_file(&socket_shutdown);
        tracing::info!("Cleanup complete, exiting");
        std::process::exit(0);
    });

    if let Err(e) = server.listen(listener).await {
        tracing::error!("Server error: {}", e);
    }
    let _ = std::fs::remove_file(&socket);
    Ok(())
}
