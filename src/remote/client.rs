//! Typed HTTP client for the remote execution daemon.
//!
//! One client instance holds the `(hostname, port, token)` triple of a
//! single daemon. Errors split along the taxonomy the pool relies on:
//! transport problems surface as `Error::Http`, protocol problems
//! (non-2xx status, malformed body) as `Error::Daemon`. The client never
//! retries; the pool's caller decides when to `reconnect`.

use crate::remote::protocol::{
    DEFAULT_EXEC_TIMEOUT_SECS, ErrorResponse, ExecRequest, ExecResponse, FileReadRequest,
    FileReadResponse, FileWriteRequest, FileWriteResponse, HealthResponse, ShutdownResponse,
};
use crate::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Margin added to the remote-side exec timeout so the daemon, not the
/// HTTP client, is the one that reports a timed-out command.
const EXEC_TIMEOUT_MARGIN_SECS: u64 = 30;

/// Client for one daemon instance.
#[derive(Clone)]
pub struct DaemonClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl DaemonClient {
    /// Builds a client for the daemon at `hostname:port`.
    pub fn new(hostname: &str, port: u16, token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            base_url: format!("http://{}:{}", hostname, port),
            token: token.into(),
            http,
        })
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            return Err(Error::daemon(format!("{}: {}", status, message)));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| Error::daemon(format!("malformed response body: {}", e)))
    }

    async fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
        timeout: Option<Duration>,
    ) -> Result<Resp> {
        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("Authorization", format!("Bearer {}", self.token))
            .json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await.map_err(Error::Http)?;
        Self::decode(response).await
    }

    /// `GET /health`.
    pub async fn health(&self) -> Result<HealthResponse> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .map_err(Error::Http)?;
        Self::decode(response).await
    }

    /// `POST /exec`. The HTTP timeout stretches past the remote-side
    /// command timeout so the daemon's own timeout error wins.
    pub async fn exec(&self, request: &ExecRequest) -> Result<ExecResponse> {
        let remote_timeout = request.timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT_SECS);
        self.post(
            "/exec",
            request,
            Some(Duration::from_secs(remote_timeout + EXEC_TIMEOUT_MARGIN_SECS)),
        )
        .await
    }

    /// `POST /file/read`.
    pub async fn read_file(&self, path: impl Into<String>) -> Result<String> {
        let response: FileReadResponse = self
            .post(
                "/file/read",
                &FileReadRequest { path: path.into() },
                None,
            )
            .await?;
        Ok(response.content)
    }

    /// `POST /file/write`.
    pub async fn write_file(
        &self,
        path: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<()> {
        let response: FileWriteResponse = self
            .post(
                "/file/write",
                &FileWriteRequest {
                    path: path.into(),
                    content: content.into(),
                },
                None,
            )
            .await?;
        if !response.success {
            return Err(Error::daemon("write reported failure"));
        }
        Ok(())
    }

    /// `POST /shutdown`. The daemon replies before exiting.
    pub async fn shutdown(&self) -> Result<String> {
        let response: ShutdownResponse = self
            .post("/shutdown", &serde_json::json!({}), None)
            .await?;
        Ok(response.message)
    }

    /// The daemon's base URL (scheme, host, port).
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl std::fmt::Debug for DaemonClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonClient")
            .field("base_url", &self.base_url)
            .field("token", &"***")
            .finish()
    }
}
