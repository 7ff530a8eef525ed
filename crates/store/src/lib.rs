//! Persistent key/value storage for per-sandbox state.
//!
//! The hosting platform guarantees a durable KV namespace per sandbox; this
//! crate defines the interface the control plane consumes ([`KvStore`]) and
//! ships two implementations: a JSON-file store with atomic-replace writes
//! (the in-container default) and an in-memory store for tests.
//!
//! Well-known keys:
//! - `sandboxName` — the set-once sandbox name
//! - `envVars/<NAME>` — persisted sandbox environment variables
//! - `exposedPorts/<port>` — JSON-encoded exposed-port records

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use {async_trait::async_trait, dashmap::DashMap, thiserror::Error, tokio::sync::Mutex};

pub mod keys {
    pub const SANDBOX_NAME: &str = "sandboxName";
    pub const ENV_PREFIX: &str = "envVars/";
    pub const PORT_PREFIX: &str = "exposedPorts/";
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Durable string-to-string storage scoped to one sandbox.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Returns true when the key existed.
    async fn remove(&self, key: &str) -> Result<bool>;
    /// All keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
    /// Flush any buffered writes. A no-op for write-through stores.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

// ── JSON file store ──────────────────────────────────────────────────────────

/// File-backed store: the whole namespace as one JSON object, rewritten
/// atomically (temp file + rename) on every mutation.
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Open (or create) the store at `path`. The parent directory is created
    /// if missing.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Arc::new(Self {
            path,
            state: Mutex::new(state),
        }))
    }

    async fn persist(&self, state: &BTreeMap<String, String>) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.insert(key.to_string(), value.to_string());
        self.persist(&state).await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let existed = state.remove(key).is_some();
        if existed {
            self.persist(&state).await?;
        }
        Ok(existed)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Path of the default state file under `dir`.
pub fn default_state_path(dir: &Path) -> PathBuf {
    dir.join("state.json")
}

// ── In-memory store ──────────────────────────────────────────────────────────

/// Volatile store for tests and ephemeral sandboxes.
#[derive(Default)]
pub struct MemoryStore {
    state: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.state.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.state.remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .state
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
