//! The remote execution daemon: an authenticated HTTP server exposing
//! shell execution and file transfer on the host it runs on.
//!
//! The daemon is deliberately small: five routes, bearer-token auth on all
//! of them, fully-captured (not streamed) command output, and a
//! self-destruct timer. Every request resets `last_activity`; a polling
//! loop shuts the daemon down once it has been idle longer than the
//! configured timeout, so orphaned daemons don't outlive their caller by
//! more than that window.
//!
//! On startup the daemon prints the marker line
//! `DAEMON_STARTED:{"port":P,"token":T,"pid":K}` to stdout. Nothing else
//! may be written to stdout; the bootstrap treats the first line with that
//! prefix as the handshake. Logs go to stderr.
//!
//! Run in-process (tests, local use):
//!
//! ```rust,no_run
//! use panpan::remote::{Daemon, DaemonSettings};
//!
//! # async fn example() -> panpan::Result<()> {
//! let daemon = Daemon::bind(DaemonSettings::default()).await?;
//! println!("{}", daemon.startup_marker()?);
//! daemon.serve().await?;
//! # Ok(())
//! # }
//! ```

use crate::cancel::CancelHandle;
use crate::remote::protocol::{
    DEFAULT_EXEC_TIMEOUT_SECS, DEFAULT_IDLE_TIMEOUT_SECS, DaemonInfo, ErrorResponse, ExecRequest,
    ExecResponse, FileReadRequest, FileReadResponse, FileWriteRequest, FileWriteResponse,
    HealthResponse, ShutdownResponse, format_startup_marker,
};
use crate::{Error, Result};
use axum::{
    Json, Router,
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Daemon launch settings.
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    /// TCP port to bind; 0 picks an ephemeral port.
    pub port: u16,

    /// Bearer token every request must present.
    pub token: String,

    /// Idle period after which the daemon exits.
    pub idle_timeout: Duration,

    /// How often the idle watcher checks. The wire contract says one
    /// minute; tests shrink it.
    pub poll_interval: Duration,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            port: 0,
            token: uuid::Uuid::new_v4().to_string(),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(60),
        }
    }
}

impl DaemonSettings {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[derive(Clone)]
struct AppState {
    token: String,
    started_at: Instant,
    last_activity: Arc<Mutex<Instant>>,
    shutdown: CancelHandle,
}

impl AppState {
    fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }
}

/// A bound, not-yet-serving daemon. Binding is separate from serving so
/// callers can learn the ephemeral port (and print the startup marker)
/// before the accept loop starts.
pub struct Daemon {
    settings: DaemonSettings,
    listener: tokio::net::TcpListener,
    shutdown: CancelHandle,
}

impl Daemon {
    /// Binds the listener. Port 0 resolves to an ephemeral port,
    /// observable through [`info`](Self::info).
    pub async fn bind(settings: DaemonSettings) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", settings.port))
            .await
            .map_err(Error::Io)?;
        Ok(Self {
            settings,
            listener,
            shutdown: CancelHandle::new(),
        })
    }

    /// Connection facts for the startup marker.
    pub fn info(&self) -> Result<DaemonInfo> {
        let addr = self.listener.local_addr().map_err(Error::Io)?;
        Ok(DaemonInfo {
            port: addr.port(),
            token: self.settings.token.clone(),
            pid: std::process::id(),
        })
    }

    /// The `DAEMON_STARTED:` line for this daemon.
    pub fn startup_marker(&self) -> Result<String> {
        Ok(format_startup_marker(&self.info()?))
    }

    /// Handle that stops the daemon from outside (tests, embedding).
    pub fn shutdown_handle(&self) -> CancelHandle {
        self.shutdown.clone()
    }

    /// Serves until shut down by `/shutdown`, the idle watcher, or the
    /// shutdown handle.
    pub async fn serve(self) -> Result<()> {
        let state = AppState {
            token: self.settings.token.clone(),
            started_at: Instant::now(),
            last_activity: Arc::new(Mutex::new(Instant::now())),
            shutdown: self.shutdown.clone(),
        };

        let app = Router::new()
            .route("/health", get(handle_health))
            .route("/exec", post(handle_exec))
            .route("/file/read", post(handle_file_read))
            .route("/file/write", post(handle_file_write))
            .route("/shutdown", post(handle_shutdown))
            .fallback(handle_not_found)
            .layer(middleware::from_fn_with_state(state.clone(), auth))
            .with_state(state.clone());

        let idle_timeout = self.settings.idle_timeout;
        let poll_interval = self.settings.poll_interval;
        let watcher_state = state.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = watcher_state.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {
                        if watcher_state.idle_for() > idle_timeout {
                            tracing::info!(
                                idle_secs = watcher_state.idle_for().as_secs(),
                                "idle timeout reached, shutting down"
                            );
                            watcher_state.shutdown.cancel();
                            break;
                        }
                    }
                }
            }
        });

        tracing::info!(port = self.listener.local_addr().map(|a| a.port()).unwrap_or(0), "daemon serving");
        let shutdown = self.shutdown.clone();
        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(Error::Io)?;
        Ok(())
    }
}

/// Bearer-token gate in front of every route, the fallback included.
/// Also resets the idle timer: any request, even a failing one, counts as
/// activity.
async fn auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    state.touch();

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token == state.token)
        .unwrap_or(false);

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "Unauthorized".to_string(),
                exit_code: None,
            }),
        )
            .into_response();
    }

    next.run(request).await
}

fn server_error(message: String, exit_code: Option<i32>) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: message,
            exit_code,
        }),
    )
        .into_response()
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        pid: std::process::id(),
        uptime: state.started_at.elapsed().as_secs(),
    })
}

async fn handle_exec(Json(request): Json<ExecRequest>) -> Response {
    let timeout_secs = request.timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT_SECS);

    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(&request.command)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Dropping the output future on timeout must take the child with it.
        .kill_on_drop(true);
    if let Some(cwd) = &request.cwd {
        command.current_dir(cwd);
    }
    if let Some(env) = &request.env {
        command.envs(env);
    }

    tracing::debug!(command = %request.command, timeout_secs, "exec");
    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return server_error(format!("Failed to spawn command: {}", e), Some(-1));
        }
    };

    match tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await {
        Ok(Ok(output)) => Json(ExecResponse {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
        .into_response(),
        Ok(Err(e)) => server_error(format!("Failed to read command output: {}", e), Some(-1)),
        Err(_) => server_error(
            format!("Command timed out after {}s", timeout_secs),
            Some(-1),
        ),
    }
}

async fn handle_file_read(Json(request): Json<FileReadRequest>) -> Response {
    match tokio::fs::read_to_string(&request.path).await {
        Ok(content) => Json(FileReadResponse { content }).into_response(),
        Err(e) => server_error(format!("Failed to read {}: {}", request.path, e), None),
    }
}

async fn handle_file_write(Json(request): Json<FileWriteRequest>) -> Response {
    match tokio::fs::write(&request.path, &request.content).await {
        Ok(()) => Json(FileWriteResponse { success: true }).into_response(),
        Err(e) => server_error(format!("Failed to write {}: {}", request.path, e), None),
    }
}

async fn handle_shutdown(State(state): State<AppState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested");
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        // Let the reply flush before the accept loop stops.
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
    });
    Json(ShutdownResponse {
        message: "Shutting down".to_string(),
    })
}

async fn handle_not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = DaemonSettings::default();
        assert_eq!(settings.port, 0);
        assert!(!settings.token.is_empty());
        assert_eq!(settings.idle_timeout, Duration::from_secs(1800));
    }

    #[tokio::test]
    async fn test_bind_resolves_ephemeral_port() {
        let daemon = Daemon::bind(DaemonSettings::default()).await.unwrap();
        let info = daemon.info().unwrap();
        assert_ne!(info.port, 0);
        assert_eq!(info.pid, std::process::id());
        assert!(daemon.startup_marker().unwrap().starts_with("DAEMON_STARTED:"));
    }
}
