/// End-to-end tests: client → control socket → server → manager → worker.
/// The worker is a fake that speaks the command protocol without exec'ing.

use std::collections::HashMap;
use std::io::{BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use prewarm::client::{self, Outcome};
use prewarm::commands::builtin;
use prewarm::config::DaemonConfig;
use prewarm::env::AppEnv;
use prewarm::ipc::{Request, WorkerEndpoint};
use prewarm::server::Server;
use prewarm::supervisor::Application;
use prewarm::worker::EXIT_PREFIX;

/// Prints the request and the environment it ran in, then exits 3 for
/// `rake fail` and 0 otherwise.
struct FakeCommands;

impl Application for FakeCommands {
    fn serve(&self, endpoint: WorkerEndpoint) -> anyhow::Result<()> {
        while let Some(client) = endpoint.recv_client()? {
            endpoint.acknowledge()?;
            let mut client = UnixStream::from(client);
            let request = Request::read_from(&mut BufReader::new(&client))?;

            let env = std::env::var("RAILS_ENV").unwrap_or_default();
            writeln!(client, "ran {}", request.args.join(" "))?;
            writeln!(client, "env={}", env)?;
            endpoint.report_pid(std::process::id())?;

            let code = if request.tail().first().map(String::as_str) == Some("fail") { 3 } else { 0 };
            writeln!(client, "{}{}", EXIT_PREFIX, code)?;
        }
        Ok(())
    }
}

async fn start_server(dir: &Path) -> (Arc<Server>, PathBuf) {
    let socket = dir.join("prewarm.sock");
    let server = Arc::new(Server::new(
        DaemonConfig::default(),
        AppEnv::new(dir),
        Arc::new(builtin::registry(&HashMap::new())),
        Arc::new(FakeCommands),
    ));
    let listener = tokio::net::UnixListener::bind(&socket).unwrap();
    tokio::spawn(Arc::clone(&server).listen(listener));
    (server, socket)
}

async fn send(socket: &Path, args: &[&str], env: &[(&str, &str)]) -> (Outcome, String) {
    let socket = socket.to_path_buf();
    let mut request = Request::new(args.iter().map(|s| s.to_string()).collect());
    request.env = env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();

    tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        let outcome = client::run(&socket, &request, &mut out).unwrap();
        (outcome, String::from_utf8(out).unwrap())
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_command_runs_in_its_environment() {
    let dir = tempfile::tempdir().unwrap();
    let (server, socket) = start_server(dir.path()).await;

    let (outcome, output) = send(&socket, &["test", "test/unit"], &[]).await;
    let pid = server.manager("test").pid();
    assert!(pid.is_some());
    assert_eq!(outcome, Outcome::Finished { pid, code: 0 });
    assert_eq!(output, "ran test test/unit\nenv=test\n");

    println!("✓ test command ran in the 'test' worker");
    server.stop_all();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_environment_and_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let (server, socket) = start_server(dir.path()).await;

    let (outcome, output) = send(&socket, &["rake", "fail"], &[("RAILS_ENV", "staging")]).await;
    assert!(matches!(outcome, Outcome::Finished { pid: Some(_), code: 3 }));
    assert_eq!(output, "ran rake fail\nenv=staging\n");

    let (_, output) = send(&socket, &["rake", "db:migrate"], &[]).await;
    assert!(output.ends_with("env=development\n"));

    assert_eq!(server.events().starts(), 2, "one worker per environment");
    server.stop_all();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_command_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (server, socket) = start_server(dir.path()).await;

    let (outcome, output) = send(&socket, &["deploy"], &[]).await;
    assert_eq!(outcome, Outcome::UnknownCommand);
    assert!(output.is_empty());
    assert_eq!(server.events().starts(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_all_terminates_workers() {
    let dir = tempfile::tempdir().unwrap();
    let (server, socket) = start_server(dir.path()).await;

    send(&socket, &["console", "production"], &[]).await;
    let manager = server.manager("production");
    assert!(manager.is_alive());

    server.stop_all();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while manager.is_alive() && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!manager.is_alive());
}
