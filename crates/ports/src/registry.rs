//! The exposed-port registry.

use std::{collections::HashMap, sync::Arc};

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    thiserror::Error,
    tokio::sync::RwLock,
    tracing::{info, warn},
};

use {
    warden_common::security::{generate_token, is_valid_token, validate_port},
    warden_protocol::ExposedPortInfo,
    warden_store::{KvStore, keys},
};

#[derive(Debug, Error)]
pub enum PortError {
    #[error("port {0} cannot be exposed")]
    InvalidPort(u16),

    #[error("token must be 16 characters of [a-z0-9_-]")]
    InvalidToken,

    #[error("port {0} is already exposed")]
    AlreadyExposed(u16),

    #[error("port {0} is not exposed")]
    NotExposed(u16),

    #[error(transparent)]
    Store(#[from] warden_store::StoreError),
}

pub type Result<T> = std::result::Result<T, PortError>;

/// Persisted shape under `exposedPorts/<port>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    token: String,
    exposed_at: DateTime<Utc>,
}

/// Linearizable port registry: mutations hold the write lock across both the
/// in-memory map and the store write, so a successful `expose` is visible to
/// every subsequent lookup.
pub struct PortRegistry {
    store: Arc<dyn KvStore>,
    ports: RwLock<HashMap<u16, PortRecord>>,
}

impl PortRegistry {
    /// Load persisted records from the store.
    pub async fn load(store: Arc<dyn KvStore>) -> Result<Self> {
        let mut ports = HashMap::new();
        for key in store.keys(keys::PORT_PREFIX).await? {
            let Some(value) = store.get(&key).await? else {
                continue;
            };
            let port_str = &key[keys::PORT_PREFIX.len()..];
            let Ok(port) = port_str.parse::<u16>() else {
                warn!(key, "skipping malformed port key");
                continue;
            };
            match serde_json::from_str::<PortRecord>(&value) {
                Ok(record) => {
                    ports.insert(port, record);
                },
                Err(e) => warn!(key, error = %e, "skipping corrupt port record"),
            }
        }
        if !ports.is_empty() {
            info!(count = ports.len(), "restored exposed ports");
        }
        Ok(Self {
            store,
            ports: RwLock::new(ports),
        })
    }

    /// Expose a port. A supplied token must already have the generated shape;
    /// otherwise one is minted.
    pub async fn expose(
        &self,
        port: u16,
        name: Option<String>,
        token: Option<String>,
    ) -> Result<ExposedPortInfo> {
        if !validate_port(port) {
            return Err(PortError::InvalidPort(port));
        }
        let token = match token {
            Some(t) => {
                if !is_valid_token(&t) {
                    return Err(PortError::InvalidToken);
                }
                t
            },
            None => generate_token(),
        };

        let mut ports = self.ports.write().await;
        if ports.contains_key(&port) {
            return Err(PortError::AlreadyExposed(port));
        }
        let record = PortRecord {
            name,
            token,
            exposed_at: Utc::now(),
        };
        self.store
            .set(
                &format!("{}{port}", keys::PORT_PREFIX),
                &serde_json::to_string(&record).map_err(warden_store::StoreError::Corrupt)?,
            )
            .await?;
        ports.insert(port, record.clone());
        info!(port, name = ?record.name, "port exposed");

        Ok(info_from(port, &record))
    }

    /// Remove a port. Unknown ports are an error; the second of two identical
    /// unexposes therefore fails with `NotExposed`.
    pub async fn unexpose(&self, port: u16) -> Result<ExposedPortInfo> {
        let mut ports = self.ports.write().await;
        let Some(record) = ports.remove(&port) else {
            return Err(PortError::NotExposed(port));
        };
        self.store
            .remove(&format!("{}{port}", keys::PORT_PREFIX))
            .await?;
        info!(port, "port unexposed");
        Ok(info_from(port, &record))
    }

    /// All records, sorted by port.
    pub async fn list(&self) -> Vec<ExposedPortInfo> {
        let ports = self.ports.read().await;
        let mut out: Vec<ExposedPortInfo> =
            ports.iter().map(|(p, r)| info_from(*p, r)).collect();
        out.sort_by_key(|r| r.port);
        out
    }

    /// Look up one record.
    pub async fn get(&self, port: u16) -> Option<ExposedPortInfo> {
        self.ports.read().await.get(&port).map(|r| info_from(port, r))
    }

    /// True iff `(port, token)` exactly matches a registry record.
    pub async fn validate_token(&self, port: u16, token: &str) -> bool {
        self.ports
            .read()
            .await
            .get(&port)
            .is_some_and(|r| r.token == token)
    }
}

fn info_from(port: u16, record: &PortRecord) -> ExposedPortInfo {
    ExposedPortInfo {
        port,
        name: record.name.clone(),
        token: record.token.clone(),
        exposed_at: record.exposed_at,
        url: None,
    }
}
