//! Shared control-plane state.
//!
//! The sandbox server exclusively owns the sandbox record (name + env vars),
//! the process table, and the exposed-port registry. Everything sits behind
//! per-table locks; request handlers copy out what they need and release.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    tokio::sync::{RwLock, Semaphore},
    tracing::{info, warn},
};

use {
    warden_config::WardenConfig,
    warden_files::{FileOps, PathPolicy},
    warden_git::GitClient,
    warden_ports::PortRegistry,
    warden_protocol::ProcessStartRequest,
    warden_proxy::ProxyClient,
    warden_snapshots::{SnapshotEngine, engine::EngineConfig},
    warden_store::{KvStore, keys},
    warden_supervisor::{ProcessSupervisor, SupervisorConfig},
};

use crate::{
    error::{ApiError, ApiResult},
    session::{ClientSessions, ResolvedContext},
};

pub type AppState = Arc<SandboxState>;

pub struct SandboxState {
    pub cfg: WardenConfig,
    pub store: Arc<dyn KvStore>,
    /// Set-once sandbox name.
    name: RwLock<Option<String>>,
    /// Persisted sandbox env vars, merged into every spawned child.
    env: RwLock<BTreeMap<String, String>>,
    /// Runtime default working directory (starts at the workspace root).
    cwd: RwLock<PathBuf>,
    pub sessions: ClientSessions,
    pub supervisor: ProcessSupervisor,
    pub files: FileOps,
    pub git: GitClient,
    pub ports: PortRegistry,
    pub snapshots: SnapshotEngine,
    pub proxy: ProxyClient,
    /// Flipped by `on_error`; unhealthy sandboxes answer 503.
    healthy: AtomicBool,
    /// Concurrent SSE connection budget.
    pub sse_slots: Arc<Semaphore>,
}

impl SandboxState {
    pub async fn new(cfg: WardenConfig, store: Arc<dyn KvStore>) -> anyhow::Result<AppState> {
        let name = store.get(keys::SANDBOX_NAME).await?;
        let mut env = BTreeMap::new();
        for key in store.keys(keys::ENV_PREFIX).await? {
            if let Some(value) = store.get(&key).await? {
                env.insert(key[keys::ENV_PREFIX.len()..].to_string(), value);
            }
        }
        if !env.is_empty() {
            info!(count = env.len(), "restored sandbox env vars");
        }

        let policy = PathPolicy::new(&cfg.sandbox.workspace_root, &cfg.files.extra_deny_paths);
        let supervisor = ProcessSupervisor::new(SupervisorConfig {
            log_buffer_bytes: cfg.limits.log_buffer_bytes,
            max_processes: cfg.limits.max_processes,
            kill_grace: Duration::from_millis(cfg.limits.kill_grace_ms),
            cleanup_grace: Duration::from_millis(cfg.limits.cleanup_grace_ms),
        });
        let snapshots = SnapshotEngine::new(EngineConfig {
            default_compression_level: cfg.snapshots.compression_level,
            retry_limit: cfg.snapshots.retry_limit,
            retry_base_delay: Duration::from_millis(cfg.snapshots.retry_base_delay_ms),
            progress_interval: Duration::from_millis(cfg.snapshots.progress_interval_ms),
        });
        let ports = PortRegistry::load(Arc::clone(&store)).await?;

        Ok(Arc::new(Self {
            name: RwLock::new(name),
            env: RwLock::new(env),
            cwd: RwLock::new(PathBuf::from(&cfg.sandbox.workspace_root)),
            sessions: ClientSessions::new(Duration::from_secs(cfg.limits.session_ttl_secs)),
            supervisor,
            files: FileOps::new(policy.clone()),
            git: GitClient::new(policy),
            ports,
            snapshots,
            proxy: ProxyClient::new(),
            healthy: AtomicBool::new(true),
            sse_slots: Arc::new(Semaphore::new(cfg.limits.max_sse_streams)),
            store,
            cfg,
        }))
    }

    // ── Sandbox name ────────────────────────────────────────────────────────

    pub async fn name(&self) -> Option<String> {
        self.name.read().await.clone()
    }

    /// Set the sandbox name. Immutable once set: a second set with a
    /// different value fails, re-setting the same value is a no-op.
    pub async fn set_name(&self, new_name: &str) -> ApiResult<()> {
        if new_name.trim().is_empty() {
            return Err(ApiError::validation("name", "must not be empty"));
        }
        let mut name = self.name.write().await;
        match name.as_deref() {
            Some(current) if current == new_name => Ok(()),
            Some(_) => Err(ApiError::validation("name", "sandbox name is already set")),
            None => {
                self.store.set(keys::SANDBOX_NAME, new_name).await?;
                *name = Some(new_name.to_string());
                info!(name = new_name, "sandbox name set");
                Ok(())
            },
        }
    }

    /// Adopt a name from the `X-Sandbox-Name` header; only the first sighting
    /// wins, later mismatches are ignored.
    pub async fn adopt_name(&self, header_name: &str) {
        if header_name.trim().is_empty() {
            return;
        }
        if self.name.read().await.is_some() {
            return;
        }
        if let Err(e) = self.set_name(header_name).await {
            warn!(error = %e.message, "failed to adopt sandbox name from header");
        }
    }

    // ── Env vars ────────────────────────────────────────────────────────────

    pub async fn env_vars(&self) -> BTreeMap<String, String> {
        self.env.read().await.clone()
    }

    pub async fn set_env_var(&self, name: &str, value: &str) -> ApiResult<()> {
        if name.is_empty() || name.contains('=') || name.contains('\0') {
            return Err(ApiError::validation("name", "invalid environment variable name"));
        }
        self.store
            .set(&format!("{}{name}", keys::ENV_PREFIX), value)
            .await?;
        self.env
            .write()
            .await
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    pub async fn remove_env_var(&self, name: &str) -> ApiResult<bool> {
        self.store
            .remove(&format!("{}{name}", keys::ENV_PREFIX))
            .await?;
        Ok(self.env.write().await.remove(name).is_some())
    }

    // ── Execution context ───────────────────────────────────────────────────

    pub async fn default_cwd(&self) -> PathBuf {
        self.cwd.read().await.clone()
    }

    /// Resolve merged env + cwd for a command/process request and apply any
    /// non-isolated session write-back to sandbox defaults.
    pub async fn resolve_context(
        &self,
        session_id: Option<&str>,
        req_env: Option<&BTreeMap<String, String>>,
        req_cwd: Option<&str>,
        isolation: Option<bool>,
    ) -> ResolvedContext {
        let base_env = self.env_vars().await;
        let base_cwd = self.default_cwd().await;
        let ctx = self
            .sessions
            .resolve(session_id, &base_env, &base_cwd, req_env, req_cwd, isolation)
            .await;

        for (k, v) in &ctx.writeback_env {
            if let Err(e) = self.set_env_var(k, v).await {
                warn!(var = k, error = %e.message, "env write-back failed");
            }
        }
        if let Some(cwd) = &ctx.writeback_cwd {
            *self.cwd.write().await = cwd.clone();
        }
        ctx
    }

    /// Build a supervisor start spec from a wire request.
    pub async fn start_spec(&self, req: &ProcessStartRequest) -> warden_supervisor::StartSpec {
        let ctx = self
            .resolve_context(
                req.session_id.as_deref(),
                req.env.as_ref(),
                req.cwd.as_deref(),
                req.isolation,
            )
            .await;
        warden_supervisor::StartSpec {
            command: req.command.clone(),
            process_id: req.process_id.clone(),
            session_id: req.session_id.clone(),
            env: ctx.env,
            cwd: Some(ctx.cwd),
            encoding: req.encoding.unwrap_or_default(),
            timeout: req.timeout.map(Duration::from_millis),
            auto_cleanup: req.auto_cleanup,
        }
    }

    // ── Health ──────────────────────────────────────────────────────────────

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Relaxed);
    }

    pub fn mark_healthy(&self) {
        self.healthy.store(true, Ordering::Relaxed);
    }
}
