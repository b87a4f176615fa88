//! SSH bootstrap: probe, install, and launch the daemon on a remote host.
//!
//! The bootstrap drives the system `ssh` binary through `tokio::process`
//! rather than an in-process SSH stack; it needs exactly three remote
//! commands and inherits the operator's existing host keys and agent.
//!
//! 1. **Probe**: `which panpan-daemon`, falling back to
//!    `~/.local/bin/panpan-daemon`. A miss triggers the documented
//!    one-line installer (`curl -fsSL <url> | sh`) and a re-probe; a
//!    second miss is fatal.
//! 2. **Launch**: start the daemon detached under `nohup` with
//!    `<port> <token> <idle_timeout>`, redirect stdout to a launch log,
//!    and poll that log for the first `DAEMON_STARTED:` line, which is
//!    echoed back and parsed. Anything else is a bootstrap failure.
//!
//! Failures are reported, never retried silently: a flaky link is the
//! caller's decision to re-attempt through the pool's `reconnect`.

use crate::remote::protocol::{DEFAULT_IDLE_TIMEOUT_SECS, DaemonInfo, parse_startup_marker};
use crate::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Documented installer endpoint for hosts without the daemon.
pub const INSTALL_SCRIPT_URL: &str = "https://panpan.dev/install-daemon.sh";

/// Binary name probed for on the remote PATH.
pub const DAEMON_BINARY: &str = "panpan-daemon";

/// How the SSH session authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Private-key file.
    Key { key_path: String },

    /// Password via `sshpass` (which must be installed locally).
    Password { password: String },

    /// Whatever the running ssh-agent offers.
    Agent,
}

/// A remote host the pool can connect to.
#[derive(Debug, Clone)]
pub struct RemoteHost {
    /// Explicit connection id; defaults to `user@host:port`.
    pub id: Option<String>,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
}

impl RemoteHost {
    /// The pool key for this host.
    pub fn connection_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}@{}:{}", self.username, self.hostname, self.port))
    }
}

/// Knobs for one bootstrap attempt.
#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    /// Daemon binary name or path on the remote host.
    pub daemon_binary: String,

    /// Port passed to the daemon; 0 lets it pick.
    pub preferred_port: u16,

    /// Idle timeout passed to the daemon, seconds.
    pub idle_timeout_secs: u64,

    /// Installer used when the probe misses.
    pub install_script_url: String,

    /// Cap on each SSH command round-trip.
    pub ssh_timeout: Duration,

    /// How long the launch command polls for the startup marker.
    pub startup_timeout: Duration,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            daemon_binary: DAEMON_BINARY.to_string(),
            preferred_port: 0,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            install_script_url: INSTALL_SCRIPT_URL.to_string(),
            ssh_timeout: Duration::from_secs(120),
            startup_timeout: Duration::from_secs(15),
        }
    }
}

/// Deploys a daemon for a host. The pool depends on this seam rather than
/// on SSH directly so sessions against an in-process daemon (tests, local
/// mode) can skip the network entirely.
#[async_trait]
pub trait Bootstrapper: Send + Sync {
    async fn bootstrap(&self, host: &RemoteHost, options: &BootstrapOptions) -> Result<DaemonInfo>;
}

/// The production bootstrapper: drives `ssh` per the module docs.
#[derive(Debug, Clone, Default)]
pub struct SshBootstrapper;

#[async_trait]
impl Bootstrapper for SshBootstrapper {
    async fn bootstrap(&self, host: &RemoteHost, options: &BootstrapOptions) -> Result<DaemonInfo> {
        let daemon_path = ensure_daemon_installed(host, options).await?;
        launch_daemon(host, options, &daemon_path).await
    }
}

fn ssh_command(host: &RemoteHost) -> Command {
    let destination = format!("{}@{}", host.username, host.hostname);

    let mut command = match &host.auth {
        AuthMethod::Password { password } => {
            let mut c = Command::new("sshpass");
            c.arg("-p").arg(password).arg("ssh");
            c
        }
        _ => Command::new("ssh"),
    };

    match &host.auth {
        AuthMethod::Key { key_path } => {
            command.arg("-i").arg(key_path).arg("-o").arg("BatchMode=yes");
        }
        AuthMethod::Agent => {
            command.arg("-o").arg("BatchMode=yes");
        }
        AuthMethod::Password { .. } => {}
    }

    command
        .arg("-p")
        .arg(host.port.to_string())
        .arg("-o")
        .arg("ConnectTimeout=10")
        .arg("-o")
        .arg("StrictHostKeyChecking=accept-new")
        .arg(destination)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

/// Runs one remote command, returning its stdout. Non-zero exit is a
/// bootstrap error carrying the remote stderr.
async fn run_ssh(host: &RemoteHost, remote_command: &str, timeout: Duration) -> Result<String> {
    let mut command = ssh_command(host);
    command.arg(remote_command);

    tracing::debug!(host = %host.hostname, command = %remote_command, "ssh");
    let child = command.spawn().map_err(|e| {
        Error::bootstrap(format!("failed to spawn ssh for {}: {}", host.hostname, e))
    })?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| {
            Error::bootstrap(format!(
                "ssh to {} timed out after {}s",
                host.hostname,
                timeout.as_secs()
            ))
        })?
        .map_err(|e| Error::bootstrap(format!("ssh to {} failed: {}", host.hostname, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::bootstrap(format!(
            "ssh to {} exited with {}: {}",
            host.hostname,
            output.status.code().unwrap_or(-1),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn probe_command(binary: &str) -> String {
    format!(
        "which {bin} || {{ [ -x \"$HOME/.local/bin/{bin}\" ] && echo \"$HOME/.local/bin/{bin}\"; }} || echo NOT_FOUND",
        bin = binary
    )
}

/// Probes for the daemon, running the installer on a miss. Returns the
/// resolved remote path.
async fn ensure_daemon_installed(
    host: &RemoteHost,
    options: &BootstrapOptions,
) -> Result<String> {
    let probe = probe_command(&options.daemon_binary);

    let found = run_ssh(host, &probe, options.ssh_timeout).await?;
    let path = first_line(&found);
    if path != "NOT_FOUND" && !path.is_empty() {
        return Ok(path.to_string());
    }

    tracing::info!(host = %host.hostname, "daemon not found, running installer");
    let install = format!("curl -fsSL {} | sh", options.install_script_url);
    run_ssh(host, &install, options.ssh_timeout)
        .await
        .map_err(|e| Error::bootstrap(format!("daemon install failed: {}", e)))?;

    let found = run_ssh(host, &probe, options.ssh_timeout).await?;
    let path = first_line(&found);
    if path == "NOT_FOUND" || path.is_empty() {
        return Err(Error::bootstrap(format!(
            "daemon binary '{}' still missing on {} after install",
            options.daemon_binary, host.hostname
        )));
    }
    Ok(path.to_string())
}

/// Launches the daemon detached and captures its startup marker.
async fn launch_daemon(
    host: &RemoteHost,
    options: &BootstrapOptions,
    daemon_path: &str,
) -> Result<DaemonInfo> {
    let token = uuid::Uuid::new_v4().to_string();
    // Token-suffixed log path: a stale log from an earlier launch must
    // never satisfy the marker poll.
    let log_path = format!("/tmp/panpan-daemon-{}.out", &token[..8]);
    let poll_attempts = (options.startup_timeout.as_millis() / 200).max(1);

    let launch = format!(
        "nohup {daemon} {port} {token} {idle} > {log} 2>&1 & \
         for i in $(seq 1 {attempts}); do \
           if grep -m1 '^DAEMON_STARTED:' {log} 2>/dev/null; then exit 0; fi; \
           sleep 0.2; \
         done; echo BOOTSTRAP_TIMEOUT",
        daemon = daemon_path,
        port = options.preferred_port,
        token = token,
        idle = options.idle_timeout_secs,
        log = log_path,
        attempts = poll_attempts,
    );

    let ssh_budget = options.ssh_timeout + options.startup_timeout;
    let stdout = run_ssh(host, &launch, ssh_budget).await?;

    let marker_line = stdout
        .lines()
        .find(|line| line.trim_start().starts_with("DAEMON_STARTED:"));

    match marker_line.and_then(parse_startup_marker) {
        Some(info) => {
            tracing::info!(
                host = %host.hostname,
                port = info.port,
                pid = info.pid,
                "daemon started"
            );
            Ok(info)
        }
        None => Err(Error::bootstrap(format!(
            "daemon on {} did not print a startup marker (got: {})",
            host.hostname,
            first_line(&stdout)
        ))),
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("").trim()
}
