//! Process-wide pool of daemon connections, one entry per remote host.
//!
//! Entries are keyed by `connection_id` (the host's explicit id, or
//! `user@host:port`) and live from the first `connect` until an explicit
//! `disconnect` or process shutdown. The pool checks liveness lazily: an
//! existing `ready` entry is health-probed during `connect` and replaced
//! if the probe fails. It never pings proactively and never retries an
//! `execute` on the caller's behalf; after a detected failure the caller
//! decides whether to `reconnect`.
//!
//! All entry mutations go through the pool's methods behind one async
//! mutex. Fan-out is expected to be small (a handful of hosts), so a
//! per-pool lock keeps status transitions race-free without per-entry
//! machinery.

use crate::remote::bootstrap::{BootstrapOptions, Bootstrapper, RemoteHost, SshBootstrapper};
use crate::remote::client::DaemonClient;
use crate::remote::protocol::{DaemonInfo, ExecRequest, ExecResponse};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;

/// Lifecycle state of one connection entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Bootstrapping,
    Ready,
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Bootstrapping => "bootstrapping",
            ConnectionStatus::Ready => "ready",
            ConnectionStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

struct ConnectionEntry {
    host: RemoteHost,
    options: BootstrapOptions,
    status: ConnectionStatus,
    daemon_port: Option<u16>,
    daemon_pid: Option<u32>,
    token: Option<String>,
    client: Option<DaemonClient>,
    connected_at: Option<SystemTime>,
    last_activity: Option<SystemTime>,
    error: Option<String>,
}

impl ConnectionEntry {
    fn new(host: RemoteHost, options: BootstrapOptions) -> Self {
        Self {
            host,
            options,
            status: ConnectionStatus::Connecting,
            daemon_port: None,
            daemon_pid: None,
            token: None,
            client: None,
            connected_at: None,
            last_activity: None,
            error: None,
        }
    }

    fn mark_ready(&mut self, info: &DaemonInfo, client: DaemonClient) {
        let now = SystemTime::now();
        self.status = ConnectionStatus::Ready;
        self.daemon_port = Some(info.port);
        self.daemon_pid = Some(info.pid);
        self.token = Some(info.token.clone());
        self.client = Some(client);
        self.connected_at = Some(now);
        self.last_activity = Some(now);
        self.error = None;
    }

    fn mark_error(&mut self, message: String) {
        self.status = ConnectionStatus::Error;
        // Leaving ready invalidates the client; nothing may keep using
        // the old (port, token) pair through the pool.
        self.client = None;
        self.error = Some(message);
    }
}

/// Public snapshot of one entry.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub hostname: String,
    pub status: ConnectionStatus,
    pub daemon_port: Option<u16>,
    pub daemon_pid: Option<u32>,
    pub connected_at: Option<SystemTime>,
    pub last_activity: Option<SystemTime>,
    pub error: Option<String>,
}

/// The connection pool. One per process; share via `Arc`.
pub struct ConnectionPool {
    entries: Mutex<HashMap<String, ConnectionEntry>>,
    bootstrapper: Arc<dyn Bootstrapper>,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionPool {
    /// Pool using the SSH bootstrapper.
    pub fn new() -> Self {
        Self::with_bootstrapper(Arc::new(SshBootstrapper))
    }

    /// Pool over a custom deployment seam (tests, local mode).
    pub fn with_bootstrapper(bootstrapper: Arc<dyn Bootstrapper>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            bootstrapper,
        }
    }

    /// Connects to `host`, reusing a live entry when one exists.
    ///
    /// Returns the connection id. On any failure the entry is left in
    /// `error` state with the message recorded, and the error propagates.
    pub async fn connect(&self, host: RemoteHost, options: BootstrapOptions) -> Result<String> {
        let id = host.connection_id();
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get(&id) {
            if entry.status == ConnectionStatus::Ready {
                if let Some(client) = entry.client.clone() {
                    if client.health().await.is_ok() {
                        if let Some(entry) = entries.get_mut(&id) {
                            entry.last_activity = Some(SystemTime::now());
                        }
                        tracing::debug!(id = %id, "reusing live connection");
                        return Ok(id);
                    }
                    tracing::warn!(id = %id, "ready entry failed health probe, replacing");
                }
            }
            entries.remove(&id);
        }

        entries.insert(id.clone(), ConnectionEntry::new(host.clone(), options.clone()));

        if let Some(entry) = entries.get_mut(&id) {
            entry.status = ConnectionStatus::Bootstrapping;
        }
        tracing::info!(id = %id, host = %host.hostname, "bootstrapping daemon");
        let info = match self.bootstrapper.bootstrap(&host, &options).await {
            Ok(info) => info,
            Err(e) => {
                if let Some(entry) = entries.get_mut(&id) {
                    entry.mark_error(e.to_string());
                }
                return Err(e);
            }
        };

        let client = match DaemonClient::new(&host.hostname, info.port, &info.token) {
            Ok(client) => client,
            Err(e) => {
                if let Some(entry) = entries.get_mut(&id) {
                    entry.mark_error(e.to_string());
                }
                return Err(e);
            }
        };

        if let Err(e) = client.health().await {
            if let Some(entry) = entries.get_mut(&id) {
                entry.mark_error(e.to_string());
            }
            return Err(e);
        }

        if let Some(entry) = entries.get_mut(&id) {
            entry.mark_ready(&info, client);
        }
        tracing::info!(id = %id, port = info.port, pid = info.pid, "connection ready");
        Ok(id)
    }

    /// Fetches the client of a `ready` entry.
    async fn ready_client(&self, id: &str) -> Result<DaemonClient> {
        let entries = self.entries.lock().await;
        let entry = entries
            .get(id)
            .ok_or_else(|| Error::ConnectionNotFound(id.to_string()))?;
        if entry.status != ConnectionStatus::Ready {
            return Err(Error::daemon(format!(
                "connection '{}' is not ready (status: {})",
                id, entry.status
            )));
        }
        entry
            .client
            .clone()
            .ok_or_else(|| Error::daemon(format!("connection '{}' has no client", id)))
    }

    async fn touch(&self, id: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.last_activity = Some(SystemTime::now());
        }
    }

    /// Runs a command on the connected host.
    pub async fn execute(&self, id: &str, request: &ExecRequest) -> Result<ExecResponse> {
        let client = self.ready_client(id).await?;
        let response = client.exec(request).await?;
        self.touch(id).await;
        Ok(response)
    }

    /// Reads a remote file.
    pub async fn read_file(&self, id: &str, path: &str) -> Result<String> {
        let client = self.ready_client(id).await?;
        let content = client.read_file(path).await?;
        self.touch(id).await;
        Ok(content)
    }

    /// Writes a remote file.
    pub async fn write_file(&self, id: &str, path: &str, content: &str) -> Result<()> {
        let client = self.ready_client(id).await?;
        client.write_file(path, content).await?;
        self.touch(id).await;
        Ok(())
    }

    /// Disconnects then connects again with the stored host config.
    pub async fn reconnect(&self, id: &str) -> Result<String> {
        let (host, options) = {
            let entries = self.entries.lock().await;
            let entry = entries
                .get(id)
                .ok_or_else(|| Error::ConnectionNotFound(id.to_string()))?;
            (entry.host.clone(), entry.options.clone())
        };
        self.disconnect(id).await?;
        self.connect(host, options).await
    }

    /// Best-effort daemon shutdown, then removes the entry. Unknown ids
    /// are a no-op.
    pub async fn disconnect(&self, id: &str) -> Result<()> {
        let entry = {
            let mut entries = self.entries.lock().await;
            entries.remove(id)
        };
        if let Some(entry) = entry {
            if let Some(client) = entry.client {
                // The daemon exits on its own idle timer if this fails.
                if let Err(e) = client.shutdown().await {
                    tracing::debug!(id = %id, error = %e, "shutdown request failed");
                }
            }
            tracing::info!(id = %id, "disconnected");
        }
        Ok(())
    }

    /// Disconnects every entry in parallel, gathering outcomes. Never
    /// fails as a whole.
    pub async fn disconnect_all(&self) -> Vec<(String, Result<()>)> {
        let ids: Vec<String> = {
            let entries = self.entries.lock().await;
            entries.keys().cloned().collect()
        };
        let results =
            futures::future::join_all(ids.iter().map(|id| self.disconnect(id))).await;
        ids.into_iter().zip(results).collect()
    }

    /// Whether `id` exists and is ready.
    pub async fn is_ready(&self, id: &str) -> bool {
        let entries = self.entries.lock().await;
        entries
            .get(id)
            .map(|e| e.status == ConnectionStatus::Ready)
            .unwrap_or(false)
    }

    /// Status of `id`, if the entry exists.
    pub async fn get_status(&self, id: &str) -> Option<ConnectionStatus> {
        let entries = self.entries.lock().await;
        entries.get(id).map(|e| e.status)
    }

    /// Snapshots of every entry.
    pub async fn list_connections(&self) -> Vec<ConnectionInfo> {
        let entries = self.entries.lock().await;
        let mut infos: Vec<ConnectionInfo> = entries
            .iter()
            .map(|(id, entry)| ConnectionInfo {
                id: id.clone(),
                hostname: entry.host.hostname.clone(),
                status: entry.status,
                daemon_port: entry.daemon_port,
                daemon_pid: entry.daemon_pid,
                connected_at: entry.connected_at,
                last_activity: entry.last_activity,
                error: entry.error.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::bootstrap::AuthMethod;
    use async_trait::async_trait;

    struct FailingBootstrapper;

    #[async_trait]
    impl Bootstrapper for FailingBootstrapper {
        async fn bootstrap(
            &self,
            host: &RemoteHost,
            _options: &BootstrapOptions,
        ) -> Result<DaemonInfo> {
            Err(Error::bootstrap(format!("no route to {}", host.hostname)))
        }
    }

    fn host() -> RemoteHost {
        RemoteHost {
            id: None,
            hostname: "h1".to_string(),
            port: 22,
            username: "u".to_string(),
            auth: AuthMethod::Agent,
        }
    }

    #[tokio::test]
    async fn test_connect_failure_records_error() {
        let pool = ConnectionPool::with_bootstrapper(Arc::new(FailingBootstrapper));
        let err = pool
            .connect(host(), BootstrapOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Bootstrap(_)));

        // Entry remains, in error state, with the message recorded.
        assert_eq!(
            pool.get_status("u@h1:22").await,
            Some(ConnectionStatus::Error)
        );
        assert!(!pool.is_ready("u@h1:22").await);
        let infos = pool.list_connections().await;
        assert_eq!(infos.len(), 1);
        assert!(infos[0].error.as_deref().unwrap().contains("no route"));
    }

    #[tokio::test]
    async fn test_execute_unknown_id() {
        let pool = ConnectionPool::with_bootstrapper(Arc::new(FailingBootstrapper));
        let err = pool
            .execute("nobody", &ExecRequest::new("echo hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionNotFound(_)));
        assert_eq!(err.to_string(), "Connection not found: nobody");
    }

    #[tokio::test]
    async fn test_execute_refused_when_not_ready() {
        let pool = ConnectionPool::with_bootstrapper(Arc::new(FailingBootstrapper));
        let _ = pool.connect(host(), BootstrapOptions::default()).await;

        let err = pool
            .execute("u@h1:22", &ExecRequest::new("echo hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Daemon(_)));
        assert!(err.to_string().contains("not ready"));
    }

    #[tokio::test]
    async fn test_disconnect_unknown_is_noop() {
        let pool = ConnectionPool::with_bootstrapper(Arc::new(FailingBootstrapper));
        assert!(pool.disconnect("nobody").await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_all_gathers_outcomes() {
        let pool = ConnectionPool::with_bootstrapper(Arc::new(FailingBootstrapper));
        let _ = pool.connect(host(), BootstrapOptions::default()).await;

        let outcomes = pool.disconnect_all().await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].1.is_ok());
        assert!(pool.list_connections().await.is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_unknown_id() {
        let pool = ConnectionPool::with_bootstrapper(Arc::new(FailingBootstrapper));
        let err = pool.reconnect("nobody").await.unwrap_err();
        assert!(matches!(err, Error::ConnectionNotFound(_)));
    }
}
