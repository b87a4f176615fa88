//! Request/response shapes shared by the daemon server and its client.
//!
//! Endpoints, all behind `Authorization: Bearer <token>`:
//!
//! | Method | Path | Body | Response |
//! |--------|------|------|----------|
//! | GET | `/health` | none | `{status:"ok", pid, uptime}` |
//! | POST | `/exec` | `{command, cwd?, env?, timeout?}` | `{stdout, stderr, exitCode}` |
//! | POST | `/file/read` | `{path}` | `{content}` |
//! | POST | `/file/write` | `{path, content}` | `{success:true}` |
//! | POST | `/shutdown` | none | `{message:"Shutting down"}` |
//!
//! Failures are `{error, exitCode?}` with status 500. On startup the
//! daemon prints exactly one marker line to stdout,
//! `DAEMON_STARTED:{"port":P,"token":T,"pid":K}`, which the bootstrap
//! parses to learn where to connect.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Prefix of the daemon's startup line on stdout.
pub const STARTUP_MARKER_PREFIX: &str = "DAEMON_STARTED:";

/// Default remote-side timeout for one exec call, seconds.
pub const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 60;

/// Default idle period after which the daemon shuts itself down, seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 1800;

/// `GET /health` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub pid: u32,
    /// Seconds since the daemon started.
    pub uptime: u64,
}

/// `POST /exec` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    /// Overlaid on the daemon's process environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,

    /// Remote-side timeout in seconds; [`DEFAULT_EXEC_TIMEOUT_SECS`] when
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }
}

/// `POST /exec` success response. Non-zero exit codes are still a
/// success at the protocol level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// `POST /file/read` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReadRequest {
    pub path: String,
}

/// `POST /file/read` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReadResponse {
    pub content: String,
}

/// `POST /file/write` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileWriteRequest {
    pub path: String,
    pub content: String,
}

/// `POST /file/write` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileWriteResponse {
    pub success: bool,
}

/// `POST /shutdown` response; the process exits roughly 100 ms after
/// replying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownResponse {
    pub message: String,
}

/// Error body for non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// What the bootstrap learns from the startup marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub port: u16,
    pub token: String,
    pub pid: u32,
}

/// Renders the startup marker line for `info`.
pub fn format_startup_marker(info: &DaemonInfo) -> String {
    // serde keeps struct field order, so the payload reads
    // {"port":...,"token":...,"pid":...} as documented.
    format!(
        "{}{}",
        STARTUP_MARKER_PREFIX,
        serde_json::to_string(info).unwrap_or_default()
    )
}

/// Parses a line as a startup marker. Returns `None` for lines without
/// the prefix or with an unparseable payload.
pub fn parse_startup_marker(line: &str) -> Option<DaemonInfo> {
    let payload = line.trim().strip_prefix(STARTUP_MARKER_PREFIX)?;
    serde_json::from_str(payload).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_marker_roundtrip() {
        let info = DaemonInfo {
            port: 43187,
            token: "tok-123".to_string(),
            pid: 4242,
        };
        let line = format_startup_marker(&info);
        assert!(line.starts_with("DAEMON_STARTED:{\"port\":43187"));
        assert_eq!(parse_startup_marker(&line), Some(info));
    }

    #[test]
    fn test_startup_marker_rejects_noise() {
        assert!(parse_startup_marker("starting up...").is_none());
        assert!(parse_startup_marker("DAEMON_STARTED:not json").is_none());
    }

    #[test]
    fn test_exec_response_wire_names() {
        let response = ExecResponse {
            stdout: "hi\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("exitCode").is_some());
        assert!(json.get("exit_code").is_none());
    }

    #[test]
    fn test_exec_request_omits_empty_options() {
        let request = ExecRequest::new("echo hi");
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"command":"echo hi"}"#);
    }

    #[test]
    fn test_error_response_exit_code_optional() {
        let body: ErrorResponse = serde_json::from_str(r#"{"error":"no such file"}"#).unwrap();
        assert_eq!(body.error, "no such file");
        assert!(body.exit_code.is_none());

        let body: ErrorResponse =
            serde_json::from_str(r#"{"error":"spawn failed","exitCode":-1}"#).unwrap();
        assert_eq!(body.exit_code, Some(-1));
    }
}
