//! Remote execution daemon launcher.
//!
//! Usage: `panpan-daemon [port] [token] [idle_timeout_secs]`
//!
//! - `port` defaults to 0 (ephemeral)
//! - `token` defaults to a fresh UUID
//! - `idle_timeout_secs` defaults to 1800
//!
//! Prints exactly one `DAEMON_STARTED:` marker line to stdout once bound;
//! everything else (logs) goes to stderr so the bootstrap's marker parse
//! stays unambiguous.

use anyhow::{Context, Result};
use panpan::remote::{Daemon, DaemonSettings};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut settings = DaemonSettings::default();
    if let Some(port) = args.first() {
        settings.port = port.parse().context("invalid port argument")?;
    }
    if let Some(token) = args.get(1) {
        settings.token = token.clone();
    }
    if let Some(idle) = args.get(2) {
        let secs: u64 = idle.parse().context("invalid idle timeout argument")?;
        settings.idle_timeout = Duration::from_secs(secs);
    }

    let daemon = Daemon::bind(settings).await.context("failed to bind")?;

    // The handshake line the bootstrap greps for. Must hit stdout before
    // anything else does.
    println!("{}", daemon.startup_marker()?);

    daemon.serve().await.context("daemon failed")?;
    Ok(())
}
