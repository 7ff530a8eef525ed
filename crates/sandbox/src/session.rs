//! Per-call session overrides.
//!
//! A session is a TTL-bounded bundle of cwd/env overrides keyed by
//! `sessionId`. Sessions accumulate: a `cd`-like cwd change or an env update
//! in one call is visible to the next call carrying the same id. The
//! `isolation` flag keeps a session's overrides from writing back into
//! sandbox defaults.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use {tokio::sync::RwLock, tracing::debug};

#[derive(Debug, Clone, Default)]
pub struct SessionEntry {
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub isolation: bool,
    last_used: Option<Instant>,
}

/// The result of merging sandbox defaults with a session and per-request
/// overrides.
#[derive(Debug, Clone)]
pub struct ResolvedContext {
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    /// Env pairs that should persist into sandbox defaults (empty for
    /// isolated sessions).
    pub writeback_env: BTreeMap<String, String>,
    /// Cwd that should become the sandbox default, if any.
    pub writeback_cwd: Option<PathBuf>,
}

pub struct ClientSessions {
    entries: RwLock<HashMap<String, SessionEntry>>,
    ttl: Duration,
}

impl ClientSessions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Merge sandbox defaults, the session's remembered overrides, and this
    /// request's overrides. Request values win over session values, which win
    /// over sandbox values; the session remembers request values for next
    /// time.
    #[allow(clippy::too_many_arguments)]
    pub async fn resolve(
        &self,
        session_id: Option<&str>,
        sandbox_env: &BTreeMap<String, String>,
        sandbox_cwd: &Path,
        req_env: Option<&BTreeMap<String, String>>,
        req_cwd: Option<&str>,
        isolation: Option<bool>,
    ) -> ResolvedContext {
        let mut merged: BTreeMap<String, String> = sandbox_env.clone();
        let mut cwd = sandbox_cwd.to_path_buf();
        let mut writeback_env = BTreeMap::new();
        let mut writeback_cwd = None;

        if let Some(id) = session_id {
            let mut entries = self.entries.write().await;
            self.evict_expired(&mut entries);
            let entry = entries.entry(id.to_string()).or_default();
            entry.last_used = Some(Instant::now());
            if let Some(isolation) = isolation {
                entry.isolation = isolation;
            }
            if let Some(req_env) = req_env {
                entry.env.extend(req_env.clone());
            }
            if let Some(req_cwd) = req_cwd {
                entry.cwd = Some(resolve_cwd(sandbox_cwd, req_cwd));
            }

            merged.extend(entry.env.clone());
            if let Some(session_cwd) = &entry.cwd {
                cwd = session_cwd.clone();
            }
            if !entry.isolation {
                if let Some(req_env) = req_env {
                    writeback_env = req_env.clone();
                }
                if req_cwd.is_some() {
                    writeback_cwd = entry.cwd.clone();
                }
            }
        } else {
            if let Some(req_env) = req_env {
                merged.extend(req_env.clone());
            }
            if let Some(req_cwd) = req_cwd {
                cwd = resolve_cwd(sandbox_cwd, req_cwd);
            }
        }

        ResolvedContext {
            env: merged.into_iter().collect(),
            cwd,
            writeback_env,
            writeback_cwd,
        }
    }

    /// Drop a session's overrides. Unknown ids are fine.
    pub async fn remove(&self, session_id: &str) -> bool {
        self.entries.write().await.remove(session_id).is_some()
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }

    fn evict_expired(&self, entries: &mut HashMap<String, SessionEntry>) {
        let ttl = self.ttl;
        let before = entries.len();
        entries.retain(|_, e| match e.last_used {
            Some(at) => at.elapsed() < ttl,
            None => true,
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, "expired client sessions");
        }
    }
}

fn resolve_cwd(base: &Path, raw: &str) -> PathBuf {
    let p = PathBuf::from(raw);
    if p.is_absolute() { p } else { base.join(p) }
}
