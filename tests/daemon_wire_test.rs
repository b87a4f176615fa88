//! Wire-level daemon tests against an in-process server: auth, exec,
//! file transfer, shutdown, and the idle timer.

use panpan::CancelHandle;
use panpan::remote::protocol::ExecRequest;
use panpan::remote::{Daemon, DaemonClient, DaemonSettings};
use std::time::Duration;
use tokio::task::JoinHandle;

const TOKEN: &str = "test-token";

async fn spawn_daemon(settings: DaemonSettings) -> (u16, CancelHandle, JoinHandle<()>) {
    let daemon = Daemon::bind(settings).await.expect("bind");
    let port = daemon.info().expect("info").port;
    let shutdown = daemon.shutdown_handle();
    let handle = tokio::spawn(async move {
        daemon.serve().await.expect("serve");
    });
    (port, shutdown, handle)
}

async fn default_daemon() -> (u16, CancelHandle, JoinHandle<()>) {
    spawn_daemon(DaemonSettings::default().with_token(TOKEN)).await
}

#[tokio::test]
async fn health_requires_bearer_token() {
    let (port, shutdown, _handle) = default_daemon().await;
    let http = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{}", port);

    // Missing header.
    let response = http.get(format!("{}/health", base)).send().await.unwrap();
    assert_eq!(response.status(), 401);

    // Wrong token.
    let response = http
        .get(format!("{}/health", base))
        .header("Authorization", "Bearer wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Valid token.
    let response = http
        .get(format!("{}/health", base))
        .header("Authorization", format!("Bearer {}", TOKEN))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["pid"].as_u64().unwrap() > 0);

    shutdown.cancel();
}

#[tokio::test]
async fn unknown_path_is_404_with_valid_token() {
    let (port, shutdown, _handle) = default_daemon().await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("http://127.0.0.1:{}/nope", port))
        .header("Authorization", format!("Bearer {}", TOKEN))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // Without the token the gate answers first.
    let response = http
        .post(format!("http://127.0.0.1:{}/nope", port))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    shutdown.cancel();
}

#[tokio::test]
async fn exec_captures_output_and_exit_code() {
    let (port, shutdown, _handle) = default_daemon().await;
    let client = DaemonClient::new("127.0.0.1", port, TOKEN).unwrap();

    let response = client.exec(&ExecRequest::new("echo hi")).await.unwrap();
    assert_eq!(response.stdout, "hi\n");
    assert_eq!(response.stderr, "");
    assert_eq!(response.exit_code, 0);

    // Non-zero exit is still a 200-level protocol success.
    let response = client
        .exec(&ExecRequest::new("echo oops >&2; exit 3"))
        .await
        .unwrap();
    assert_eq!(response.stdout, "");
    assert_eq!(response.stderr, "oops\n");
    assert_eq!(response.exit_code, 3);

    shutdown.cancel();
}

#[tokio::test]
async fn exec_merges_caller_env_and_cwd() {
    let (port, shutdown, _handle) = default_daemon().await;
    let client = DaemonClient::new("127.0.0.1", port, TOKEN).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut request = ExecRequest::new("echo \"$PANPAN_TEST_VAR in $(pwd)\"");
    request.cwd = Some(dir.path().to_string_lossy().into_owned());
    request.env = Some(
        [("PANPAN_TEST_VAR".to_string(), "overlay".to_string())]
            .into_iter()
            .collect(),
    );

    let response = client.exec(&request).await.unwrap();
    assert!(response.stdout.starts_with("overlay in "));
    assert!(response.stdout.contains(&*dir.path().to_string_lossy()));

    shutdown.cancel();
}

#[tokio::test]
async fn exec_timeout_kills_the_command() {
    let (port, shutdown, _handle) = default_daemon().await;
    let client = DaemonClient::new("127.0.0.1", port, TOKEN).unwrap();

    let mut request = ExecRequest::new("sleep 30");
    request.timeout = Some(1);

    let err = client.exec(&request).await.unwrap_err();
    assert!(matches!(err, panpan::Error::Daemon(_)));
    assert!(err.to_string().contains("timed out after 1s"));

    shutdown.cancel();
}

#[tokio::test]
async fn file_write_then_read_roundtrip() {
    let (port, shutdown, _handle) = default_daemon().await;
    let client = DaemonClient::new("127.0.0.1", port, TOKEN).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt").to_string_lossy().into_owned();

    client.write_file(&path, "remote contents").await.unwrap();
    let content = client.read_file(&path).await.unwrap();
    assert_eq!(content, "remote contents");

    shutdown.cancel();
}

#[tokio::test]
async fn file_read_missing_is_daemon_error() {
    let (port, shutdown, _handle) = default_daemon().await;
    let client = DaemonClient::new("127.0.0.1", port, TOKEN).unwrap();

    let err = client.read_file("/nonexistent/definitely/missing").await.unwrap_err();
    assert!(matches!(err, panpan::Error::Daemon(_)));
    assert!(err.to_string().contains("500"));

    shutdown.cancel();
}

#[tokio::test]
async fn shutdown_replies_then_exits() {
    let (port, _shutdown, handle) = default_daemon().await;
    let client = DaemonClient::new("127.0.0.1", port, TOKEN).unwrap();

    let message = client.shutdown().await.unwrap();
    assert_eq!(message, "Shutting down");

    // The serve task winds down shortly after the reply.
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("daemon should exit after /shutdown")
        .unwrap();
}

#[tokio::test]
async fn idle_timeout_shuts_the_daemon_down() {
    let settings = DaemonSettings::default()
        .with_token(TOKEN)
        .with_idle_timeout(Duration::from_millis(200))
        .with_poll_interval(Duration::from_millis(50));
    let (_port, _shutdown, handle) = spawn_daemon(settings).await;

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("daemon should exit after idling past the timeout")
        .unwrap();
}

#[tokio::test]
async fn requests_reset_the_idle_timer() {
    let settings = DaemonSettings::default()
        .with_token(TOKEN)
        .with_idle_timeout(Duration::from_millis(400))
        .with_poll_interval(Duration::from_millis(50));
    let (port, shutdown, handle) = spawn_daemon(settings).await;
    let client = DaemonClient::new("127.0.0.1", port, TOKEN).unwrap();

    // Keep it busy past several idle windows.
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        client.health().await.expect("daemon should still be alive");
    }

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}
