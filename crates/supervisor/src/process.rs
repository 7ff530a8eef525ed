//! Background-process supervision.
//!
//! The supervisor owns the process table. All table mutations happen under a
//! single mutex; log readers copy out buffer handles and never touch the
//! lock while streaming. Each child gets its own process group, pump tasks
//! feeding the ring buffers, and a reaper task that records the terminal
//! status exactly once.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    chrono::{DateTime, Utc},
    futures::Stream,
    tokio::sync::watch,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use warden_protocol::{
    Encoding, LogOffsets, ProcessInfo, ProcessLogsPayload, ProcessStatus, StreamEvent,
};

use crate::{
    error::{Result, SupervisorError},
    exec::{self, ExecOpts},
    ring::LogBuffer,
    signal,
    stream::{ExitInfo, StreamSource, classify_exit, decode_chunk, stream_events},
};

/// Supervisor tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// Ring capacity per stream (stdout and stderr each).
    pub log_buffer_bytes: usize,
    /// Cap on tracked processes, running and retained alike.
    pub max_processes: usize,
    /// SIGTERM → SIGKILL escalation window.
    pub kill_grace: Duration,
    /// Retention window after terminal status for `auto_cleanup` processes.
    pub cleanup_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            log_buffer_bytes: 1024 * 1024,
            max_processes: 256,
            kill_grace: Duration::from_secs(5),
            cleanup_grace: Duration::from_secs(30),
        }
    }
}

/// Everything needed to start a background process.
#[derive(Debug, Clone, Default)]
pub struct StartSpec {
    pub command: String,
    /// Client-supplied id; generated when absent.
    pub process_id: Option<String>,
    pub session_id: Option<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<std::path::PathBuf>,
    pub encoding: Encoding,
    pub timeout: Option<Duration>,
    pub auto_cleanup: bool,
}

/// A spawned child plus the handles the rest of the system reads it through.
pub(crate) struct LiveProcess {
    pub pid: u32,
    pub stdout: Arc<LogBuffer>,
    pub stderr: Arc<LogBuffer>,
    pub status_rx: watch::Receiver<ProcessStatus>,
    pub exit: Arc<Mutex<Option<ExitInfo>>>,
}

fn pump<R: tokio::io::AsyncRead + Unpin + Send + 'static>(
    reader: Option<R>,
    buf: Arc<LogBuffer>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        let Some(mut reader) = reader else { return };
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.write(&chunk[..n]),
            }
        }
    })
}

/// Spawn a shell child wired to fresh ring buffers plus a reaper task.
///
/// The reaper waits for exit (or the timeout/cancellation in `opts`), drains
/// the pumps so late bytes land before the status flips, then records the
/// terminal status. Status transitions exactly once.
pub(crate) fn launch(
    command: &str,
    opts: &ExecOpts,
    buffer_capacity: usize,
) -> Result<LiveProcess> {
    if command.trim().is_empty() {
        return Err(SupervisorError::EmptyCommand);
    }
    if opts.cancel.is_cancelled() {
        return Err(SupervisorError::Aborted);
    }

    let mut cmd = exec::shell_command(command, opts.working_dir.as_ref(), &opts.env);
    let mut child = cmd
        .spawn()
        .map_err(|e| exec::map_spawn_error(&e, opts.working_dir.as_ref()))?;
    let pid = child.id().unwrap_or_default();

    let stdout = Arc::new(LogBuffer::new(buffer_capacity));
    let stderr = Arc::new(LogBuffer::new(buffer_capacity));
    let (status_tx, status_rx) = watch::channel(ProcessStatus::Running);
    let exit = Arc::new(Mutex::new(None));

    let out_pump = pump(child.stdout.take(), Arc::clone(&stdout));
    let err_pump = pump(child.stderr.take(), Arc::clone(&stderr));

    let timeout = opts.timeout;
    let kill_grace = opts.kill_grace;
    let cancel = opts.cancel.clone();
    let exit_slot = Arc::clone(&exit);
    tokio::spawn(async move {
        let wait_result = tokio::select! {
            r = child.wait() => r,
            _ = cancel.cancelled() => {
                exec::escalate_kill(&mut child, pid, kill_grace).await
            },
            _ = exec::sleep_opt(timeout) => {
                warn!(pid, "process timeout, killing");
                exec::escalate_kill(&mut child, pid, kill_grace).await
            },
        };
        // Pipes close once the child is gone; drain the last bytes before the
        // status flips so streams never miss output.
        let _ = out_pump.await;
        let _ = err_pump.await;
        let (code, status) = classify_exit(&wait_result);
        *exit_slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(ExitInfo {
            code,
            status,
            end_time: Utc::now(),
        });
        let _ = status_tx.send(status);
        debug!(pid, code, %status, "process reaped");
    });

    Ok(LiveProcess {
        pid,
        stdout,
        stderr,
        status_rx,
        exit,
    })
}

// ── Process table ────────────────────────────────────────────────────────────

struct ProcEntry {
    id: String,
    pid: u32,
    command: String,
    session_id: Option<String>,
    encoding: Encoding,
    start_time: DateTime<Utc>,
    stdout: Arc<LogBuffer>,
    stderr: Arc<LogBuffer>,
    status_rx: watch::Receiver<ProcessStatus>,
    exit: Arc<Mutex<Option<ExitInfo>>>,
}

impl ProcEntry {
    fn status(&self) -> ProcessStatus {
        *self.status_rx.borrow()
    }

    fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn info(&self) -> ProcessInfo {
        let exit = self.exit_info();
        ProcessInfo {
            id: self.id.clone(),
            pid: self.pid,
            command: self.command.clone(),
            status: self.status(),
            start_time: self.start_time,
            end_time: exit.map(|e| e.end_time),
            exit_code: exit.map(|e| e.code),
            session_id: self.session_id.clone(),
        }
    }

    fn stream_source(&self) -> StreamSource {
        StreamSource {
            stdout: Arc::clone(&self.stdout),
            stderr: Arc::clone(&self.stderr),
            status: self.status_rx.clone(),
            exit: Arc::clone(&self.exit),
            encoding: self.encoding,
        }
    }
}

struct Inner {
    cfg: SupervisorConfig,
    procs: Mutex<HashMap<String, Arc<ProcEntry>>>,
}

/// Tracks background processes for one sandbox.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

fn generate_process_id() -> String {
    let id = uuid::Uuid::new_v4();
    format!("proc-{}", &id.simple().to_string()[..8])
}

impl ProcessSupervisor {
    pub fn new(cfg: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                procs: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn entry(&self, id: &str) -> Result<Arc<ProcEntry>> {
        self.inner
            .procs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))
    }

    /// Start a background process.
    pub fn start(&self, spec: StartSpec) -> Result<ProcessInfo> {
        let id = spec.process_id.clone().unwrap_or_else(generate_process_id);

        let opts = ExecOpts {
            timeout: spec.timeout,
            working_dir: spec.cwd.clone(),
            env: spec.env.clone(),
            kill_grace: self.inner.cfg.kill_grace,
            cancel: CancellationToken::new(),
            ..Default::default()
        };

        let mut procs = self.inner.procs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = procs.get(&id) {
            if !existing.status().is_terminal() {
                return Err(SupervisorError::AlreadyExists(id));
            }
            // A terminal record under the same id gets replaced.
            procs.remove(&id);
        }
        if procs.len() >= self.inner.cfg.max_processes {
            return Err(SupervisorError::LimitReached(self.inner.cfg.max_processes));
        }

        let live = launch(&spec.command, &opts, self.inner.cfg.log_buffer_bytes)?;
        let entry = Arc::new(ProcEntry {
            id: id.clone(),
            pid: live.pid,
            command: spec.command.clone(),
            session_id: spec.session_id.clone(),
            encoding: spec.encoding,
            start_time: Utc::now(),
            stdout: live.stdout,
            stderr: live.stderr,
            status_rx: live.status_rx,
            exit: live.exit,
        });
        let info = entry.info();
        procs.insert(id.clone(), Arc::clone(&entry));
        drop(procs);

        info!(process_id = %id, pid = live.pid, command = %spec.command, "process started");

        if spec.auto_cleanup {
            let inner = Arc::clone(&self.inner);
            let mut status_rx = entry.status_rx.clone();
            tokio::spawn(async move {
                while !status_rx.borrow_and_update().is_terminal() {
                    if status_rx.changed().await.is_err() {
                        break;
                    }
                }
                // Grace window so in-flight log readers can drain.
                tokio::time::sleep(inner.cfg.cleanup_grace).await;
                let mut procs = inner.procs.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(current) = procs.get(&id)
                    && Arc::ptr_eq(current, &entry)
                {
                    procs.remove(&id);
                    debug!(process_id = %id, "auto-cleaned process record");
                }
            });
        }

        Ok(info)
    }

    /// Metadata for one process; `None` for unknown ids.
    pub fn get(&self, id: &str) -> Option<ProcessInfo> {
        self.entry(id).ok().map(|e| e.info())
    }

    /// All tracked processes, oldest first.
    pub fn list(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<ProcessInfo> = self
            .inner
            .procs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|e| e.info())
            .collect();
        infos.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        infos
    }

    async fn await_terminal(rx: &mut watch::Receiver<ProcessStatus>, limit: Duration) -> bool {
        tokio::time::timeout(limit, async {
            while !rx.borrow_and_update().is_terminal() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok()
    }

    /// SIGTERM the process group, escalating to SIGKILL after the grace
    /// window. Killing an already-terminal process is a successful no-op.
    pub async fn kill(&self, id: &str) -> Result<ProcessStatus> {
        let entry = self.entry(id)?;
        if entry.status().is_terminal() {
            return Ok(entry.status());
        }

        info!(process_id = %id, pid = entry.pid, "killing process");
        signal::terminate_group(entry.pid).await;
        let mut rx = entry.status_rx.clone();
        if !Self::await_terminal(&mut rx, self.inner.cfg.kill_grace).await {
            warn!(process_id = %id, pid = entry.pid, "escalating to SIGKILL");
            signal::kill_group(entry.pid).await;
            let _ = Self::await_terminal(&mut rx, self.inner.cfg.kill_grace).await;
        }
        Ok(entry.status())
    }

    /// Kill every non-terminal process. Returns the number killed. Atomicity
    /// is per-process: a concurrently starting process may survive.
    pub async fn kill_all(&self) -> usize {
        let targets: Vec<String> = self
            .inner
            .procs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|e| !e.status().is_terminal())
            .map(|e| e.id.clone())
            .collect();

        let kills = targets.iter().map(|id| self.kill(id));
        futures::future::join_all(kills)
            .await
            .into_iter()
            .filter(|r| r.is_ok())
            .count()
    }

    /// Remove a process record, killing the process first if still running.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        if !entry.status().is_terminal() {
            self.kill(id).await?;
        }
        self.inner
            .procs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        Ok(())
    }

    /// Current buffer contents from `since` (defaults to the oldest retained
    /// byte of each stream).
    pub fn logs(&self, id: &str, since: Option<LogOffsets>) -> Result<ProcessLogsPayload> {
        let entry = self.entry(id)?;
        let from = since.unwrap_or(LogOffsets {
            stdout: entry.stdout.start_offset(),
            stderr: entry.stderr.start_offset(),
        });
        let out = entry.stdout.read_since(from.stdout);
        let err = entry.stderr.read_since(from.stderr);
        Ok(ProcessLogsPayload {
            stdout: decode_chunk(&out.bytes, entry.encoding),
            stderr: decode_chunk(&err.bytes, entry.encoding),
            offset: LogOffsets {
                stdout: out.new_offset,
                stderr: err.new_offset,
            },
        })
    }

    /// Live SSE-shaped log stream. The returned stream owns copies of the
    /// buffer handles; dropping it never affects the process.
    pub fn stream_logs(
        &self,
        id: &str,
        since: Option<LogOffsets>,
    ) -> Result<impl Stream<Item = StreamEvent> + Send + use<>> {
        let entry = self.entry(id)?;
        Ok(stream_events(entry.stream_source(), since))
    }

    /// Number of tracked processes (running and retained).
    pub fn count(&self) -> usize {
        self.inner
            .procs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Drain for shutdown: kill everything, best-effort.
    pub async fn shutdown(&self) {
        let killed = self.kill_all().await;
        if killed > 0 {
            info!(killed, "killed processes during shutdown");
        }
    }
}

/// Streaming variant of the foreground executor: a fresh child whose output
/// is delivered as `stdout`/`stderr`/`exit` events. The child is never
/// retained; cancelling `opts.cancel` (e.g. on client disconnect) kills it.
pub fn exec_stream(
    command: &str,
    opts: &ExecOpts,
    encoding: Encoding,
    buffer_capacity: usize,
) -> Result<impl Stream<Item = StreamEvent> + Send + use<>> {
    let live = launch(command, opts, buffer_capacity)?;
    let source = StreamSource {
        stdout: live.stdout,
        stderr: live.stderr,
        status: live.status_rx,
        exit: live.exit,
        encoding,
    };
    Ok(stream_events(source, None))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn quick_config() -> SupervisorConfig {
        SupervisorConfig {
            kill_grace: Duration::from_millis(300),
            cleanup_grace: Duration::from_millis(100),
            ..Default::default()
        }
    }

    fn spec(command: &str) -> StartSpec {
        StartSpec {
            command: command.into(),
            ..Default::default()
        }
    }

    async fn wait_terminal(sup: &ProcessSupervisor, id: &str) -> ProcessInfo {
        for _ in 0..200 {
            let info = sup.get(id).unwrap();
            if info.status.is_terminal() {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("process {id} never became terminal");
    }

    #[tokio::test]
    async fn start_reports_running_then_completes() {
        let sup = ProcessSupervisor::new(quick_config());
        let info = sup
            .start(spec("for i in 1 2 3; do echo $i; sleep 0.05; done"))
            .unwrap();
        assert_eq!(info.status, ProcessStatus::Running);
        assert!(info.pid > 0);

        let done = wait_terminal(&sup, &info.id).await;
        assert_eq!(done.status, ProcessStatus::Completed);
        assert_eq!(done.exit_code, Some(0));
        assert!(done.end_time.is_some());

        let logs = sup.logs(&info.id, None).unwrap();
        assert_eq!(logs.stdout, "1\n2\n3\n");
    }

    #[tokio::test]
    async fn get_unknown_is_none_and_kill_unknown_errors() {
        let sup = ProcessSupervisor::new(quick_config());
        assert!(sup.get("nope").is_none());
        assert!(matches!(
            sup.kill("nope").await,
            Err(SupervisorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn client_supplied_id_conflicts_while_running() {
        let sup = ProcessSupervisor::new(quick_config());
        let mut s = spec("sleep 5");
        s.process_id = Some("job-1".into());
        sup.start(s.clone()).unwrap();
        assert!(matches!(
            sup.start(s),
            Err(SupervisorError::AlreadyExists(_))
        ));
        sup.kill("job-1").await.unwrap();
    }

    #[tokio::test]
    async fn terminal_id_can_be_reused() {
        let sup = ProcessSupervisor::new(quick_config());
        let mut s = spec("true");
        s.process_id = Some("job-2".into());
        sup.start(s).unwrap();
        wait_terminal(&sup, "job-2").await;

        let mut s2 = spec("echo again");
        s2.process_id = Some("job-2".into());
        sup.start(s2).unwrap();
        let done = wait_terminal(&sup, "job-2").await;
        assert_eq!(done.status, ProcessStatus::Completed);
    }

    #[tokio::test]
    async fn kill_transitions_to_killed_exactly_once() {
        let sup = ProcessSupervisor::new(quick_config());
        let info = sup.start(spec("sleep 30")).unwrap();
        let status = sup.kill(&info.id).await.unwrap();
        assert_eq!(status, ProcessStatus::Killed);

        // Idempotent: killing a terminal process is a no-op success.
        let again = sup.kill(&info.id).await.unwrap();
        assert_eq!(again, ProcessStatus::Killed);

        let done = sup.get(&info.id).unwrap();
        assert_eq!(done.status, ProcessStatus::Killed);
        assert_eq!(done.exit_code, Some(-1));
    }

    #[tokio::test]
    async fn kill_all_returns_count() {
        let sup = ProcessSupervisor::new(quick_config());
        sup.start(spec("sleep 30")).unwrap();
        sup.start(spec("sleep 30")).unwrap();
        let short = sup.start(spec("true")).unwrap();
        wait_terminal(&sup, &short.id).await;

        let killed = sup.kill_all().await;
        assert_eq!(killed, 2);
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed() {
        let sup = ProcessSupervisor::new(quick_config());
        let info = sup.start(spec("exit 7")).unwrap();
        let done = wait_terminal(&sup, &info.id).await;
        assert_eq!(done.status, ProcessStatus::Failed);
        assert_eq!(done.exit_code, Some(7));
    }

    #[tokio::test]
    async fn process_limit_is_enforced() {
        let cfg = SupervisorConfig {
            max_processes: 1,
            ..quick_config()
        };
        let sup = ProcessSupervisor::new(cfg);
        sup.start(spec("sleep 10")).unwrap();
        assert!(matches!(
            sup.start(spec("sleep 10")),
            Err(SupervisorError::LimitReached(1))
        ));
        sup.kill_all().await;
    }

    #[tokio::test]
    async fn auto_cleanup_removes_record_after_grace() {
        let sup = ProcessSupervisor::new(quick_config());
        let mut s = spec("true");
        s.auto_cleanup = true;
        let info = sup.start(s).unwrap();
        wait_terminal(&sup, &info.id).await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(sup.get(&info.id).is_none(), "record should be cleaned");
    }

    #[tokio::test]
    async fn remove_kills_and_forgets() {
        let sup = ProcessSupervisor::new(quick_config());
        let info = sup.start(spec("sleep 30")).unwrap();
        sup.remove(&info.id).await.unwrap();
        assert!(sup.get(&info.id).is_none());
        assert!(matches!(
            sup.remove(&info.id).await,
            Err(SupervisorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn logs_since_offset_returns_only_new_data() {
        let sup = ProcessSupervisor::new(quick_config());
        let info = sup.start(spec("printf 'abcdef'")).unwrap();
        wait_terminal(&sup, &info.id).await;

        let all = sup.logs(&info.id, None).unwrap();
        assert_eq!(all.stdout, "abcdef");

        let tail = sup
            .logs(
                &info.id,
                Some(LogOffsets {
                    stdout: 3,
                    stderr: 0,
                }),
            )
            .unwrap();
        assert_eq!(tail.stdout, "def");
        assert_eq!(tail.offset.stdout, 6);
    }

    #[tokio::test]
    async fn stream_logs_delivers_output_and_exit() {
        let sup = ProcessSupervisor::new(quick_config());
        let info = sup
            .start(spec("echo one; echo two 1>&2; exit 0"))
            .unwrap();
        let events: Vec<_> = sup.stream_logs(&info.id, None).unwrap().collect().await;

        let stdout: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Stdout { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect();
        let stderr: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Stderr { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(stdout, "one\n");
        assert_eq!(stderr, "two\n");
        assert_eq!(*events.last().unwrap(), StreamEvent::Exit {
            code: 0,
            status: ProcessStatus::Completed
        });
    }

    #[tokio::test]
    async fn stream_matches_logs_concatenation() {
        let sup = ProcessSupervisor::new(quick_config());
        let info = sup
            .start(spec("for i in 1 2 3 4 5; do echo line$i; done"))
            .unwrap();
        let events: Vec<_> = sup.stream_logs(&info.id, None).unwrap().collect().await;
        let streamed: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Stdout { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect();
        let logs = sup.logs(&info.id, None).unwrap();
        assert_eq!(streamed, logs.stdout);
    }

    #[tokio::test]
    async fn background_timeout_kills_process() {
        let sup = ProcessSupervisor::new(quick_config());
        let mut s = spec("sleep 30");
        s.timeout = Some(Duration::from_millis(100));
        let info = sup.start(s).unwrap();
        let done = wait_terminal(&sup, &info.id).await;
        assert_eq!(done.status, ProcessStatus::Killed);
    }

    #[tokio::test]
    async fn exec_stream_emits_same_shape() {
        let opts = ExecOpts::default();
        let events: Vec<_> = exec_stream("echo streamed", &opts, Encoding::Utf8, 64 * 1024)
            .unwrap()
            .collect()
            .await;
        assert!(matches!(
            events.first(),
            Some(StreamEvent::Stdout { data, .. }) if data == "streamed\n"
        ));
        assert_eq!(*events.last().unwrap(), StreamEvent::Exit {
            code: 0,
            status: ProcessStatus::Completed
        });
    }

    #[tokio::test]
    async fn exec_stream_cancel_kills_child() {
        let opts = ExecOpts {
            kill_grace: Duration::from_millis(200),
            ..Default::default()
        };
        let cancel = opts.cancel.clone();
        let stream = exec_stream("sleep 30", &opts, Encoding::Utf8, 64 * 1024).unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let events: Vec<_> =
            tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
                .await
                .expect("stream should end after cancellation");
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Exit {
                status: ProcessStatus::Killed,
                ..
            })
        ));
    }
}
