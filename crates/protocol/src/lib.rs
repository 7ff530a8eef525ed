//! Wire types shared by the sandbox control plane, the edge router, and the
//! bridge.
//!
//! All `/api/*` traffic is JSON; streaming endpoints are server-sent events
//! where every frame is a single JSON object on a `data:` line. The types here
//! keep the three components in lockstep: one schema crate, no duplicated
//! shapes.

use {
    chrono::{DateTime, SecondsFormat, Utc},
    serde::{Deserialize, Serialize},
};

// ── Constants ────────────────────────────────────────────────────────────────

/// The in-container control-plane port. Never token-validated, never exposable.
pub const CONTROL_PLANE_PORT: u16 = 3000;

/// Default working directory for commands and processes.
pub const DEFAULT_WORKSPACE: &str = "/workspace";

/// Object-store key prefix for snapshots.
pub const SNAPSHOT_KEY_PREFIX: &str = "snapshots/";

/// Edge → sandbox: target user port for proxied (non-control-plane) traffic.
pub const PROXY_PORT_HEADER: &str = "x-warden-proxy-port";

/// Edge → sandbox: port access token accompanying [`PROXY_PORT_HEADER`].
pub const PROXY_TOKEN_HEADER: &str = "x-warden-proxy-token";

/// Sets the sandbox name on first sight; read-only afterwards.
pub const SANDBOX_NAME_HEADER: &str = "x-sandbox-name";

/// Keepalive comment emitted on idle SSE streams.
pub const SSE_KEEPALIVE_TEXT: &str = "keepalive";

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const SECURITY_VIOLATION: &str = "SECURITY_VIOLATION";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const FILE_NOT_FOUND: &str = "FILE_NOT_FOUND";
    pub const FILE_EXISTS: &str = "FILE_EXISTS";
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
    pub const FILESYSTEM_ERROR: &str = "FILESYSTEM_ERROR";
    pub const COMMAND_NOT_FOUND: &str = "COMMAND_NOT_FOUND";
    pub const PROCESS_NOT_FOUND: &str = "PROCESS_NOT_FOUND";
    pub const PROCESS_EXISTS: &str = "PROCESS_EXISTS";
    pub const PROCESS_LIMIT: &str = "PROCESS_LIMIT";
    pub const STREAM_LIMIT: &str = "STREAM_LIMIT";
    pub const PORT_ALREADY_EXPOSED: &str = "PORT_ALREADY_EXPOSED";
    pub const PORT_NOT_EXPOSED: &str = "PORT_NOT_EXPOSED";
    pub const INVALID_PORT: &str = "INVALID_PORT";
    pub const INVALID_TOKEN: &str = "INVALID_TOKEN";
    pub const GIT_REPOSITORY_NOT_FOUND: &str = "GIT_REPOSITORY_NOT_FOUND";
    pub const GIT_BRANCH_NOT_FOUND: &str = "GIT_BRANCH_NOT_FOUND";
    pub const GIT_AUTHENTICATION_ERROR: &str = "GIT_AUTHENTICATION_ERROR";
    pub const GIT_NETWORK_ERROR: &str = "GIT_NETWORK_ERROR";
    pub const GIT_CLONE_ERROR: &str = "GIT_CLONE_ERROR";
    pub const INVALID_GIT_URL: &str = "INVALID_GIT_URL";
    pub const SNAPSHOT_ERROR: &str = "SNAPSHOT_ERROR";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const SANDBOX_UNHEALTHY: &str = "SANDBOX_UNHEALTHY";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Security-violation subtypes carried in `details.violationType`.
pub mod violation_types {
    pub const PATH_TRAVERSAL: &str = "PATH_TRAVERSAL";
    pub const COMMAND_INJECTION: &str = "COMMAND_INJECTION";
    pub const RESERVED_PORT: &str = "RESERVED_PORT";
    pub const MALICIOUS_URL: &str = "MALICIOUS_URL";
}

// ── Timestamps ───────────────────────────────────────────────────────────────

/// Current time as ISO-8601 with millisecond precision and a `Z` suffix.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ── Response envelope ────────────────────────────────────────────────────────

/// Success envelope: `{"success":true, ...payload, "timestamp":...}`.
#[derive(Debug, Clone, Serialize)]
pub struct OkEnvelope<T: Serialize> {
    pub success: bool,
    #[serde(flatten)]
    pub payload: T,
    pub timestamp: String,
}

impl<T: Serialize> OkEnvelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            success: true,
            payload,
            timestamp: timestamp(),
        }
    }
}

/// Error envelope: `{"success":false, "error":..., "code":..., ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: String,
}

impl ErrorEnvelope {
    pub fn new(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            code: code.into(),
            details: None,
            timestamp: timestamp(),
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// One entry of `details` on a `VALIDATION_ERROR`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationDetail {
    pub field: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

// ── Encodings ────────────────────────────────────────────────────────────────

/// Content encoding for file payloads and process log data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Encoding {
    #[default]
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "base64")]
    Base64,
}

// ── Command execution ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<std::collections::BTreeMap<String, String>>,
    /// Timeout in milliseconds. Absent means no timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Session isolation: when true, this call's env/cwd stay scoped to the
    /// session and never write back into sandbox defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutePayload {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub command: String,
    /// Wall-clock duration in milliseconds.
    pub duration: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandsPayload {
    pub available_commands: Vec<String>,
    pub count: usize,
}

// ── Processes ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Completed,
    Failed,
    Killed,
    Error,
}

impl ProcessStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStartRequest {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<std::collections::BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<Encoding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation: Option<bool>,
    #[serde(default)]
    pub auto_cleanup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub id: String,
    pub pid: u32,
    pub command: String,
    pub status: ProcessStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Per-stream absolute read offsets, echoed back by log reads so clients can
/// resume with `?since=`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogOffsets {
    pub stdout: u64,
    pub stderr: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessLogsPayload {
    pub stdout: String,
    pub stderr: String,
    pub offset: LogOffsets,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessPayload {
    pub process: ProcessInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessListPayload {
    pub processes: Vec<ProcessInfo>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KilledPayload {
    pub killed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub message: String,
}

// ── Streaming events (exec + process logs) ───────────────────────────────────

/// SSE frames for `/api/execute/stream` and `/api/process/{id}/logs/stream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Stdout { data: String, offset: u64 },
    Stderr { data: String, offset: u64 },
    Exit { code: i32, status: ProcessStatus },
    Error { message: String },
}

// ── Files ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileWriteRequest {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub encoding: Encoding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReadRequest {
    pub path: String,
    #[serde(default)]
    pub encoding: Encoding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePathRequest {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRenameRequest {
    pub old_path: String,
    pub new_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMoveRequest {
    pub source_path: String,
    pub destination_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MkdirRequest {
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileWritePayload {
    pub path: String,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReadPayload {
    pub path: String,
    pub content: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePathPayload {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRenamePayload {
    pub path: String,
    pub new_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MkdirPayload {
    pub path: String,
    pub recursive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileListPayload {
    pub path: String,
    pub files: Vec<FileEntry>,
}

/// SSE frames for `/api/file/read/stream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FileStreamEvent {
    #[serde(rename_all = "camelCase")]
    Metadata {
        mime_type: String,
        size: u64,
        is_binary: bool,
        encoding: Encoding,
    },
    Chunk {
        data: String,
    },
    Complete {
        #[serde(rename = "bytesRead")]
        bytes_read: u64,
    },
    Error {
        message: String,
    },
}

// ── Git ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitCheckoutRequest {
    pub repo_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitCheckoutPayload {
    pub repo_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub target_dir: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

// ── Ports ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposePortRequest {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposedPortInfo {
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub token: String,
    pub exposed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortWatchRequest {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// SSE frames for `/api/port-watch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PortWatchEvent {
    Ready { port: u16 },
    Pending { port: u16 },
    Timeout { port: u16 },
}

// ── Snapshots ────────────────────────────────────────────────────────────────

/// Credentials and location for the S3-compatible snapshot store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct R2Config {
    pub bucket: String,
    /// Endpoint origin, e.g. `https://<account>.r2.cloudflarestorage.com`.
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotCreateRequest {
    pub directory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_level: Option<i32>,
    pub r2: R2Config,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotApplyRequest {
    pub id: String,
    pub target_directory: String,
    pub r2: R2Config,
}

/// SSE frames for `/api/snapshot/create` and `/api/snapshot/apply`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SnapshotEvent {
    Start {
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        #[serde(skip_serializing_if = "Option::is_none")]
        bytes_sent: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        bytes_received: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Complete {
        id: String,
        size_bytes: u64,
        created_at: DateTime<Utc>,
        bucket: String,
        key: String,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortsPayload {
    pub ports: Vec<ExposedPortInfo>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortPayload {
    pub port: u16,
}

// ── Sandbox name / env ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetNameRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvSetRequest {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvListPayload {
    pub env: std::collections::BTreeMap<String, String>,
    pub count: usize,
}

// ── Preview URLs ─────────────────────────────────────────────────────────────

/// Production preview hostname: `{port}-{sandboxId}-{token}.{domain}`.
pub fn preview_host(port: u16, sandbox_id: &str, token: &str, domain: &str) -> String {
    format!("{port}-{sandbox_id}-{token}.{domain}")
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_envelope_flattens_payload() {
        let env = OkEnvelope::new(ExecutePayload {
            stdout: "hello\n".into(),
            stderr: String::new(),
            exit_code: 0,
            command: "echo hello".into(),
            duration: 12,
            session_id: None,
        });
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["success"], true);
        assert_eq!(v["stdout"], "hello\n");
        assert_eq!(v["exitCode"], 0);
        assert!(v["timestamp"].as_str().unwrap().ends_with('Z'));
        assert!(v.get("payload").is_none());
    }

    #[test]
    fn error_envelope_shape() {
        let e = ErrorEnvelope::new(error_codes::INVALID_TOKEN, "Access denied")
            .with_details(serde_json::json!({"port": 8080}));
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["code"], "INVALID_TOKEN");
        assert_eq!(v["details"]["port"], 8080);
    }

    #[test]
    fn timestamp_is_iso8601_zulu() {
        let ts = timestamp();
        assert!(ts.ends_with('Z'), "got: {ts}");
        assert!(DateTime::parse_from_rfc3339(&ts).is_ok());
    }

    #[test]
    fn stream_event_wire_shape() {
        let e = StreamEvent::Stdout {
            data: "1\n".into(),
            offset: 2,
        };
        assert_eq!(
            serde_json::to_value(&e).unwrap(),
            serde_json::json!({"type":"stdout","data":"1\n","offset":2})
        );

        let e = StreamEvent::Exit {
            code: 0,
            status: ProcessStatus::Completed,
        };
        assert_eq!(
            serde_json::to_value(&e).unwrap(),
            serde_json::json!({"type":"exit","code":0,"status":"completed"})
        );
    }

    #[test]
    fn file_stream_metadata_wire_shape() {
        let e = FileStreamEvent::Metadata {
            mime_type: "text/plain".into(),
            size: 5,
            is_binary: false,
            encoding: Encoding::Utf8,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "metadata");
        assert_eq!(v["mimeType"], "text/plain");
        assert_eq!(v["isBinary"], false);
        assert_eq!(v["encoding"], "utf-8");
    }

    #[test]
    fn process_status_terminality() {
        assert!(!ProcessStatus::Running.is_terminal());
        for s in [
            ProcessStatus::Completed,
            ProcessStatus::Failed,
            ProcessStatus::Killed,
            ProcessStatus::Error,
        ] {
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn encoding_wire_names() {
        assert_eq!(serde_json::to_value(Encoding::Utf8).unwrap(), "utf-8");
        assert_eq!(serde_json::to_value(Encoding::Base64).unwrap(), "base64");
        let d: Encoding = serde_json::from_value(serde_json::json!("base64")).unwrap();
        assert_eq!(d, Encoding::Base64);
    }

    #[test]
    fn start_request_defaults() {
        let r: ProcessStartRequest =
            serde_json::from_value(serde_json::json!({"command": "sleep 1"})).unwrap();
        assert_eq!(r.command, "sleep 1");
        assert!(r.process_id.is_none());
        assert!(!r.auto_cleanup);
        assert!(r.timeout.is_none());
    }

    #[test]
    fn preview_host_format() {
        assert_eq!(
            preview_host(8080, "sb", "abcd1234efgh5678", "example.com"),
            "8080-sb-abcd1234efgh5678.example.com"
        );
    }

    #[test]
    fn snapshot_progress_omits_absent_counters() {
        let e = SnapshotEvent::Progress {
            bytes_sent: Some(1024),
            bytes_received: None,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["bytesSent"], 1024);
        assert!(v.get("bytesReceived").is_none());
    }
}
