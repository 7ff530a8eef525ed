//! Config schema for the sandbox control plane, edge router, and bridge.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub sandbox: SandboxConfig,
    pub limits: LimitsConfig,
    pub files: FilesConfig,
    pub ports: PortsConfig,
    pub snapshots: SnapshotsConfig,
    pub edge: EdgeConfig,
    pub bridge: BridgeConfig,
}

/// Control-plane server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Address the control plane binds to.
    pub bind: String,
    /// Control-plane port. The proxy treats this port as token-exempt.
    pub port: u16,
    /// Default working directory for commands, processes, and git checkouts.
    pub workspace_root: String,
    /// Path of the persistent KV state file. Empty means `<data_dir>/state.json`.
    pub state_file: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 3000,
            workspace_root: "/workspace".into(),
            state_file: String::new(),
        }
    }
}

/// Resource caps. Exceeding any of these yields a typed error, never silent
/// degradation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Ring-buffer capacity per process stream (stdout and stderr each).
    pub log_buffer_bytes: usize,
    /// Captured-output cap for foreground `exec`.
    pub exec_output_bytes: usize,
    /// Maximum tracked (non-terminal plus retained) processes.
    pub max_processes: usize,
    /// Maximum concurrent SSE connections.
    pub max_sse_streams: usize,
    /// Request body cap for the JSON API.
    pub request_body_bytes: usize,
    /// SIGTERM → SIGKILL escalation window, milliseconds.
    pub kill_grace_ms: u64,
    /// Retention window after a terminal status when `autoCleanup` is set.
    pub cleanup_grace_ms: u64,
    /// Idle TTL for per-call session overrides, seconds.
    pub session_ttl_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            log_buffer_bytes: 1024 * 1024,
            exec_output_bytes: 200 * 1024,
            max_processes: 256,
            max_sse_streams: 64,
            request_body_bytes: 10 * 1024 * 1024,
            kill_grace_ms: 5_000,
            cleanup_grace_ms: 30_000,
            session_ttl_secs: 3_600,
        }
    }
}

/// File-operation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    /// Absolute prefixes rejected for externally supplied paths, in addition
    /// to the built-in deny list.
    pub extra_deny_paths: Vec<String>,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            extra_deny_paths: Vec::new(),
        }
    }
}

/// Port registry and readiness-watch settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// Poll interval for `/api/port-watch` TCP probes, milliseconds.
    pub watch_interval_ms: u64,
    /// Default watch deadline, milliseconds.
    pub watch_deadline_ms: u64,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            watch_interval_ms: 500,
            watch_deadline_ms: 30_000,
        }
    }
}

/// Snapshot engine settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotsConfig {
    /// Default zstd compression level when the request omits one.
    pub compression_level: i32,
    /// Transfer-initiation retries before giving up.
    pub retry_limit: u32,
    /// Base delay for exponential backoff between retries, milliseconds.
    pub retry_base_delay_ms: u64,
    /// Minimum interval between SSE progress frames, milliseconds.
    pub progress_interval_ms: u64,
}

impl Default for SnapshotsConfig {
    fn default() -> Self {
        Self {
            compression_level: 3,
            retry_limit: 3,
            retry_base_delay_ms: 250,
            progress_interval_ms: 1_000,
        }
    }
}

/// Edge router settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub bind: String,
    pub port: u16,
    /// Public domain production preview hostnames hang off of.
    pub domain: String,
    /// Template resolving a sandbox id to its control-plane origin.
    /// `{id}` is replaced with the sanitized sandbox id.
    pub sandbox_origin_template: String,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8787,
            domain: "localhost".into(),
            sandbox_origin_template: "http://127.0.0.1:3000".into(),
        }
    }
}

/// Bridge (Bearer front door) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub bind: String,
    pub port: u16,
    /// Bearer API key. Usually set as `${WARDEN_API_KEY}` in the config file.
    pub api_key: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8788,
            api_key: String::new(),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = WardenConfig::default();
        assert_eq!(cfg.sandbox.port, 3000);
        assert_eq!(cfg.sandbox.workspace_root, "/workspace");
        assert_eq!(cfg.limits.log_buffer_bytes, 1024 * 1024);
        assert_eq!(cfg.limits.max_processes, 256);
        assert_eq!(cfg.limits.kill_grace_ms, 5_000);
        assert!(cfg.limits.cleanup_grace_ms >= 30_000);
        assert_eq!(cfg.snapshots.compression_level, 3);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: WardenConfig = toml::from_str(
            r#"
            [sandbox]
            workspace_root = "/srv/work"

            [limits]
            max_processes = 16
            "#,
        )
        .unwrap();
        assert_eq!(cfg.sandbox.workspace_root, "/srv/work");
        assert_eq!(cfg.sandbox.port, 3000);
        assert_eq!(cfg.limits.max_processes, 16);
        assert_eq!(cfg.limits.max_sse_streams, 64);
    }
}
