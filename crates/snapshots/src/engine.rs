//! The snapshot pipelines.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    chrono::Utc,
    futures::{Stream, StreamExt},
    thiserror::Error,
    tokio::{io::AsyncWriteExt, process::Command, sync::mpsc},
    tokio_stream::wrappers::ReceiverStream,
    tokio_util::{io::ReaderStream, sync::CancellationToken},
    tracing::{debug, info, warn},
};

use {
    warden_common::security::{generate_token, is_valid_token},
    warden_protocol::{R2Config, SNAPSHOT_KEY_PREFIX, SnapshotEvent},
};

use crate::presign::presign_url;

const PRESIGN_EXPIRES_SECS: u64 = 3600;
const PIPE_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
enum SnapshotError {
    #[error("'{0}' is not a directory")]
    NotADirectory(String),

    #[error("{0}")]
    Presign(#[from] crate::presign::PresignError),

    #[error("object store returned {0}")]
    Status(reqwest::StatusCode),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("{tool} failed: {detail}")]
    Pipeline { tool: String, detail: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SnapshotError {
    /// Transfer-initiation failures worth a retry.
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transfer(_)) || matches!(self, Self::Status(s) if s.is_server_error())
    }
}

impl From<reqwest::Error> for SnapshotError {
    fn from(e: reqwest::Error) -> Self {
        // reqwest errors can embed the full presigned URL; keep only the class.
        let kind = if e.is_connect() {
            "connect"
        } else if e.is_timeout() {
            "timeout"
        } else if e.is_body() || e.is_request() {
            "request"
        } else {
            "http"
        };
        Self::Transfer(format!("{kind} error"))
    }
}

/// Engine settings (see `SnapshotsConfig` in warden-config).
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub default_compression_level: i32,
    pub retry_limit: u32,
    pub retry_base_delay: Duration,
    pub progress_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_compression_level: 3,
            retry_limit: 3,
            retry_base_delay: Duration::from_millis(250),
            progress_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Clone)]
pub struct SnapshotEngine {
    http: reqwest::Client,
    cfg: EngineConfig,
}

impl SnapshotEngine {
    pub fn new(cfg: EngineConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            cfg,
        }
    }

    /// Snapshot `directory` into the store. Events: `start`, throttled
    /// `progress {bytesSent}`, then `complete` or `error`. Dropping the
    /// cancellation token's guard aborts the subprocess pipeline.
    pub fn create(
        &self,
        directory: PathBuf,
        compression_level: Option<i32>,
        r2: R2Config,
        cancel: CancellationToken,
    ) -> impl Stream<Item = SnapshotEvent> + Send + use<> {
        let engine = self.clone();
        let (tx, rx) = mpsc::channel::<SnapshotEvent>(32);
        tokio::spawn(async move {
            let id = generate_token();
            if !directory.is_dir() {
                let _ = tx
                    .send(SnapshotEvent::Error {
                        message: SnapshotError::NotADirectory(directory.display().to_string())
                            .to_string(),
                    })
                    .await;
                return;
            }
            let _ = tx.send(SnapshotEvent::Start { id: id.clone() }).await;

            let level = compression_level.unwrap_or(engine.cfg.default_compression_level);
            let key = format!("{SNAPSHOT_KEY_PREFIX}{id}.tar.zst");
            let mut attempt = 0;
            loop {
                let run = engine.run_create(&directory, level, &r2, &key, &tx);
                let result = tokio::select! {
                    r = run => r,
                    _ = cancel.cancelled() => {
                        debug!(id, "snapshot create cancelled");
                        return;
                    },
                };
                match result {
                    Ok(size_bytes) => {
                        info!(id, size_bytes, bucket = %r2.bucket, "snapshot created");
                        let _ = tx
                            .send(SnapshotEvent::Complete {
                                id: id.clone(),
                                size_bytes,
                                created_at: Utc::now(),
                                bucket: r2.bucket.clone(),
                                key: key.clone(),
                            })
                            .await;
                        return;
                    },
                    Err(e) if e.is_transient() && attempt < engine.cfg.retry_limit => {
                        attempt += 1;
                        let delay = engine.cfg.retry_base_delay * 2u32.pow(attempt - 1);
                        warn!(id, attempt, error = %e, "snapshot upload failed, retrying");
                        tokio::time::sleep(delay).await;
                    },
                    Err(e) => {
                        warn!(id, error = %e, "snapshot create failed");
                        let _ = tx
                            .send(SnapshotEvent::Error {
                                message: e.to_string(),
                            })
                            .await;
                        return;
                    },
                }
            }
        });
        ReceiverStream::new(rx)
    }

    async fn run_create(
        &self,
        directory: &Path,
        level: i32,
        r2: &R2Config,
        key: &str,
        tx: &mpsc::Sender<SnapshotEvent>,
    ) -> Result<u64, SnapshotError> {
        let url = presign_url(r2, "PUT", key, PRESIGN_EXPIRES_SECS, Utc::now())?;

        let mut tar = Command::new("tar")
            .arg("-cf")
            .arg("-")
            .arg("-C")
            .arg(directory)
            .arg(".")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let mut zstd = Command::new("zstd")
            .arg(format!("-{level}"))
            .arg("-T0")
            .arg("-c")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // tar stdout → zstd stdin
        let mut tar_out = tar.stdout.take();
        let mut zstd_in = zstd.stdin.take();
        let feeder = tokio::spawn(async move {
            if let (Some(out), Some(stdin)) = (tar_out.as_mut(), zstd_in.as_mut()) {
                let _ = tokio::io::copy(out, stdin).await;
                let _ = stdin.shutdown().await;
            }
        });

        // zstd stdout → counted body stream
        let sent = Arc::new(AtomicU64::new(0));
        let sent_in_stream = Arc::clone(&sent);
        let progress_tx = tx.clone();
        let interval = self.cfg.progress_interval;
        let zstd_out = zstd.stdout.take();
        let body_stream = async_stream::stream! {
            let Some(stdout) = zstd_out else { return };
            let mut inner = ReaderStream::with_capacity(stdout, PIPE_CHUNK_BYTES);
            let mut last_emit = tokio::time::Instant::now();
            while let Some(chunk) = inner.next().await {
                match chunk {
                    Ok(bytes) => {
                        let total =
                            sent_in_stream.fetch_add(bytes.len() as u64, Ordering::Relaxed)
                                + bytes.len() as u64;
                        if last_emit.elapsed() >= interval {
                            last_emit = tokio::time::Instant::now();
                            let _ = progress_tx.try_send(SnapshotEvent::Progress {
                                bytes_sent: Some(total),
                                bytes_received: None,
                            });
                        }
                        yield Ok::<_, std::io::Error>(bytes);
                    },
                    Err(e) => {
                        yield Err(e);
                        return;
                    },
                }
            }
        };

        let response = self
            .http
            .put(&url)
            .body(reqwest::Body::wrap_stream(body_stream))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SnapshotError::Status(status));
        }

        let _ = feeder.await;
        check_tool(&mut tar, "tar").await?;
        check_tool(&mut zstd, "zstd").await?;

        Ok(sent.load(Ordering::Relaxed))
    }

    /// Restore snapshot `id` into `target_directory` with atomic-replace
    /// semantics: readers see the old tree or the new tree, never a partial
    /// one. Failures before the final rename leave the target untouched.
    pub fn apply(
        &self,
        id: String,
        target_directory: PathBuf,
        r2: R2Config,
        cancel: CancellationToken,
    ) -> impl Stream<Item = SnapshotEvent> + Send + use<> {
        let engine = self.clone();
        let (tx, rx) = mpsc::channel::<SnapshotEvent>(32);
        tokio::spawn(async move {
            if !is_valid_token(&id) {
                let _ = tx
                    .send(SnapshotEvent::Error {
                        message: "invalid snapshot id".into(),
                    })
                    .await;
                return;
            }
            let _ = tx.send(SnapshotEvent::Start { id: id.clone() }).await;

            let key = format!("{SNAPSHOT_KEY_PREFIX}{id}.tar.zst");
            let mut attempt = 0;
            loop {
                let tmp = sibling_dir(&target_directory, "tmp");
                let run = engine.run_apply(&key, &tmp, &r2, &tx);
                let result = tokio::select! {
                    r = run => r,
                    _ = cancel.cancelled() => {
                        debug!(id, "snapshot apply cancelled");
                        let _ = tokio::fs::remove_dir_all(&tmp).await;
                        return;
                    },
                };
                match result {
                    Ok(received) => {
                        match finalize_replace(&target_directory, &tmp).await {
                            Ok(()) => {
                                info!(id, target = %target_directory.display(), "snapshot applied");
                                let _ = tx
                                    .send(SnapshotEvent::Complete {
                                        id: id.clone(),
                                        size_bytes: received,
                                        created_at: Utc::now(),
                                        bucket: r2.bucket.clone(),
                                        key: key.clone(),
                                    })
                                    .await;
                            },
                            Err(e) => {
                                let _ = tokio::fs::remove_dir_all(&tmp).await;
                                let _ = tx
                                    .send(SnapshotEvent::Error {
                                        message: format!("failed to swap directories: {e}"),
                                    })
                                    .await;
                            },
                        }
                        return;
                    },
                    Err(e) => {
                        let _ = tokio::fs::remove_dir_all(&tmp).await;
                        if e.is_transient() && attempt < engine.cfg.retry_limit {
                            attempt += 1;
                            let delay = engine.cfg.retry_base_delay * 2u32.pow(attempt - 1);
                            warn!(id, attempt, error = %e, "snapshot download failed, retrying");
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        warn!(id, error = %e, "snapshot apply failed");
                        let _ = tx
                            .send(SnapshotEvent::Error {
                                message: e.to_string(),
                            })
                            .await;
                        return;
                    },
                }
            }
        });
        ReceiverStream::new(rx)
    }

    async fn run_apply(
        &self,
        key: &str,
        tmp: &Path,
        r2: &R2Config,
        tx: &mpsc::Sender<SnapshotEvent>,
    ) -> Result<u64, SnapshotError> {
        let url = presign_url(r2, "GET", key, PRESIGN_EXPIRES_SECS, Utc::now())?;
        tokio::fs::create_dir_all(tmp).await?;

        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SnapshotError::Status(status));
        }

        let mut zstd = Command::new("zstd")
            .args(["-d", "-T0", "-c"])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let mut tar = Command::new("tar")
            .arg("-xf")
            .arg("-")
            .arg("-C")
            .arg(tmp)
            .arg("--no-same-owner")
            .arg("--no-same-permissions")
            .stdin(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // zstd stdout → tar stdin
        let mut zstd_out = zstd.stdout.take();
        let mut tar_in = tar.stdin.take();
        let feeder = tokio::spawn(async move {
            if let (Some(out), Some(stdin)) = (zstd_out.as_mut(), tar_in.as_mut()) {
                let _ = tokio::io::copy(out, stdin).await;
                let _ = stdin.shutdown().await;
            }
        });

        // HTTP body → zstd stdin, counting received bytes.
        let mut received: u64 = 0;
        let mut last_emit = tokio::time::Instant::now();
        let mut body = response.bytes_stream();
        let mut zstd_in = zstd.stdin.take();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            received += chunk.len() as u64;
            if let Some(stdin) = zstd_in.as_mut() {
                stdin.write_all(&chunk).await?;
            }
            if last_emit.elapsed() >= self.cfg.progress_interval {
                last_emit = tokio::time::Instant::now();
                let _ = tx.try_send(SnapshotEvent::Progress {
                    bytes_sent: None,
                    bytes_received: Some(received),
                });
            }
        }
        if let Some(mut stdin) = zstd_in.take() {
            stdin.shutdown().await?;
        }

        let _ = feeder.await;
        check_tool(&mut zstd, "zstd").await?;
        check_tool(&mut tar, "tar").await?;

        Ok(received)
    }
}

async fn check_tool(
    child: &mut tokio::process::Child,
    tool: &str,
) -> Result<(), SnapshotError> {
    let status = child.wait().await?;
    if status.success() {
        return Ok(());
    }
    let detail = match child.stderr.take() {
        Some(mut stderr) => {
            use tokio::io::AsyncReadExt;
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            let line = buf.lines().next().unwrap_or("").to_string();
            if line.is_empty() {
                format!("exit status {status}")
            } else {
                line
            }
        },
        None => format!("exit status {status}"),
    };
    Err(SnapshotError::Pipeline {
        tool: tool.to_string(),
        detail,
    })
}

/// `{base}.{tag}-{token}` next to the target, on the same filesystem so the
/// final renames stay atomic.
fn sibling_dir(base: &Path, tag: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!(".{tag}-{}", generate_token()));
    PathBuf::from(name)
}

/// Swap `tmp` into place: rename any existing target aside, rename tmp in,
/// then delete the old tree in the background.
async fn finalize_replace(target: &Path, tmp: &Path) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let old = if tokio::fs::metadata(target).await.is_ok() {
        let old = sibling_dir(target, "old");
        tokio::fs::rename(target, &old).await?;
        Some(old)
    } else {
        None
    };
    if let Err(e) = tokio::fs::rename(tmp, target).await {
        // Roll the old tree back so the target is never left missing.
        if let Some(old) = &old {
            let _ = tokio::fs::rename(old, target).await;
        }
        return Err(e);
    }
    if let Some(old) = old {
        tokio::spawn(async move {
            if let Err(e) = tokio::fs::remove_dir_all(&old).await {
                warn!(path = %old.display(), error = %e, "failed to remove replaced tree");
            }
        });
    }
    Ok(())
}

fn is_orphan_name(name: &str) -> bool {
    for marker in [".tmp-", ".old-"] {
        if let Some(idx) = name.rfind(marker) {
            let token = &name[idx + marker.len()..];
            if is_valid_token(token) {
                return true;
            }
        }
    }
    false
}

/// Remove leaked `.tmp-*` / `.old-*` directories under `parent`. Runs at
/// sandbox startup; apply crashes can leave them behind.
pub async fn clean_orphans(parent: &Path) -> usize {
    let Ok(mut dir) = tokio::fs::read_dir(parent).await else {
        return 0;
    };
    let mut removed = 0;
    while let Ok(Some(entry)) = dir.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !is_orphan_name(name) {
            continue;
        }
        let path = entry.path();
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                info!(path = %path.display(), "removed snapshot orphan");
                removed += 1;
            },
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove orphan"),
        }
    }
    removed
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orphan_names_are_recognized() {
        assert!(is_orphan_name("workspace.tmp-abcd1234efgh5678"));
        assert!(is_orphan_name("x.old-abcd1234efgh5678"));
        assert!(!is_orphan_name("workspace"));
        assert!(!is_orphan_name("workspace.tmp-short"));
        assert!(!is_orphan_name("notes.old-UPPERCASE1234567"));
    }

    #[test]
    fn sibling_dirs_share_the_parent() {
        let s = sibling_dir(Path::new("/data/work"), "tmp");
        assert!(s.starts_with("/data"));
        let name = s.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("work.tmp-"));
        assert!(is_orphan_name(name));
    }

    #[tokio::test]
    async fn clean_orphans_removes_only_markers() {
        let dir = tempfile::tempdir().unwrap();
        let orphan = dir.path().join("w.tmp-abcd1234efgh5678");
        let keeper = dir.path().join("w");
        tokio::fs::create_dir_all(&orphan).await.unwrap();
        tokio::fs::create_dir_all(&keeper).await.unwrap();

        let removed = clean_orphans(dir.path()).await;
        assert_eq!(removed, 1);
        assert!(!orphan.exists());
        assert!(keeper.exists());
    }

    #[tokio::test]
    async fn finalize_replace_swaps_and_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data");
        let tmp = dir.path().join("data.tmp-abcd1234efgh5678");
        tokio::fs::create_dir_all(&target).await.unwrap();
        tokio::fs::write(target.join("old.txt"), "old").await.unwrap();
        tokio::fs::create_dir_all(&tmp).await.unwrap();
        tokio::fs::write(tmp.join("new.txt"), "new").await.unwrap();

        finalize_replace(&target, &tmp).await.unwrap();
        assert!(target.join("new.txt").exists());
        assert!(!target.join("old.txt").exists());
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn finalize_replace_without_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("fresh");
        let tmp = dir.path().join("fresh.tmp-abcd1234efgh5678");
        tokio::fs::create_dir_all(&tmp).await.unwrap();
        tokio::fs::write(tmp.join("a.txt"), "a").await.unwrap();

        finalize_replace(&target, &tmp).await.unwrap();
        assert!(target.join("a.txt").exists());
    }

    #[tokio::test]
    async fn create_rejects_missing_directory() {
        use futures::StreamExt;
        let engine = SnapshotEngine::new(EngineConfig::default());
        let r2 = R2Config {
            bucket: "b".into(),
            endpoint: "https://example.com".into(),
            access_key_id: "k".into(),
            secret_access_key: "s".into(),
            region: None,
        };
        let events: Vec<_> = engine
            .create(
                PathBuf::from("/definitely/not/here"),
                None,
                r2,
                CancellationToken::new(),
            )
            .collect()
            .await;
        assert!(matches!(
            events.last(),
            Some(SnapshotEvent::Error { message }) if message.contains("not a directory")
        ));
    }
}
