//! Foreground command execution.
//!
//! Commands run through a POSIX shell with a merged environment and working
//! directory, an optional timeout, and client-driven cancellation. On timeout
//! or cancellation the child's process group gets SIGTERM, then SIGKILL after
//! a grace window.

use std::{path::PathBuf, time::Duration};

use {
    tokio::{io::AsyncReadExt, process::Command, time::Instant},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{
    error::{Result, SupervisorError},
    signal,
};

/// Options controlling exec behavior.
#[derive(Debug, Clone)]
pub struct ExecOpts {
    /// No timeout unless provided.
    pub timeout: Option<Duration>,
    pub max_output_bytes: usize,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// SIGTERM → SIGKILL escalation window.
    pub kill_grace: Duration,
    pub cancel: CancellationToken,
}

impl Default for ExecOpts {
    fn default() -> Self {
        Self {
            timeout: None,
            max_output_bytes: 200 * 1024, // 200KB
            working_dir: None,
            env: Vec::new(),
            kill_grace: Duration::from_secs(5),
            cancel: CancellationToken::new(),
        }
    }
}

/// Result of a foreground execution.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl ExecOutcome {
    /// Success means a clean zero exit, not a timeout or signal death.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

pub(crate) fn shell_command(command: &str, working_dir: Option<&PathBuf>, env: &[(String, String)]) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    for (k, v) in env {
        cmd.env(k, v);
    }
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    // Prevent the child from inheriting stdin.
    cmd.stdin(std::process::Stdio::null());
    // Own process group, so signals reach the shell and its children.
    cmd.process_group(0);
    cmd
}

pub(crate) fn map_spawn_error(e: &std::io::Error, working_dir: Option<&PathBuf>) -> SupervisorError {
    if e.kind() == std::io::ErrorKind::NotFound {
        if let Some(dir) = working_dir {
            SupervisorError::Spawn(format!(
                "working directory '{}' does not exist",
                dir.display()
            ))
        } else {
            SupervisorError::Spawn("shell 'sh' not found".into())
        }
    } else {
        SupervisorError::Spawn(e.to_string())
    }
}

/// Drain a pipe to EOF, retaining at most `max` bytes.
pub(crate) async fn collect_capped<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max: usize,
) -> (Vec<u8>, bool) {
    let mut out = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if out.len() < max {
                    let take = n.min(max - out.len());
                    out.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            },
            Err(_) => break,
        }
    }
    (out, truncated)
}

/// Send SIGTERM to the child's group, escalate to SIGKILL after `grace`.
pub(crate) async fn escalate_kill(
    child: &mut tokio::process::Child,
    pid: u32,
    grace: Duration,
) -> std::io::Result<std::process::ExitStatus> {
    signal::terminate_group(pid).await;
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            signal::kill_group(pid).await;
            let _ = child.start_kill();
            child.wait().await
        },
    }
}

pub(crate) async fn sleep_opt(d: Option<Duration>) {
    match d {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Execute a shell command and capture its output.
///
/// Cancellation before spawn returns [`SupervisorError::Aborted`] without
/// starting a child; cancellation in flight terminates the child and then
/// returns the same error.
pub async fn exec_command(command: &str, opts: &ExecOpts) -> Result<ExecOutcome> {
    if command.trim().is_empty() {
        return Err(SupervisorError::EmptyCommand);
    }
    if opts.cancel.is_cancelled() {
        return Err(SupervisorError::Aborted);
    }

    debug!(command, timeout = ?opts.timeout, "exec_command");
    let started = Instant::now();

    let mut cmd = shell_command(command, opts.working_dir.as_ref(), &opts.env);
    let mut child = cmd
        .spawn()
        .map_err(|e| map_spawn_error(&e, opts.working_dir.as_ref()))?;
    let pid = child.id().unwrap_or_default();

    let stdout_handle = child
        .stdout
        .take()
        .map(|r| tokio::spawn(collect_capped(r, opts.max_output_bytes)));
    let stderr_handle = child
        .stderr
        .take()
        .map(|r| tokio::spawn(collect_capped(r, opts.max_output_bytes)));

    let mut timed_out = false;
    let mut aborted = false;
    let wait_result = tokio::select! {
        status = child.wait() => status,
        _ = opts.cancel.cancelled() => {
            aborted = true;
            escalate_kill(&mut child, pid, opts.kill_grace).await
        },
        _ = sleep_opt(opts.timeout) => {
            timed_out = true;
            warn!(command, "exec timeout");
            escalate_kill(&mut child, pid, opts.kill_grace).await
        },
    };
    let status =
        wait_result.map_err(|e| SupervisorError::Spawn(format!("failed to wait: {e}")))?;

    let mut stdout = Vec::new();
    let mut stdout_truncated = false;
    if let Some(handle) = stdout_handle
        && let Ok((bytes, truncated)) = handle.await
    {
        stdout = bytes;
        stdout_truncated = truncated;
    }
    let mut stderr = Vec::new();
    let mut stderr_truncated = false;
    if let Some(handle) = stderr_handle
        && let Ok((bytes, truncated)) = handle.await
    {
        stderr = bytes;
        stderr_truncated = truncated;
    }

    if aborted {
        return Err(SupervisorError::Aborted);
    }

    let mut stdout = String::from_utf8_lossy(&stdout).into_owned();
    let mut stderr = String::from_utf8_lossy(&stderr).into_owned();
    if stdout_truncated {
        stdout.push_str("\n... [output truncated]");
    }
    if stderr_truncated {
        stderr.push_str("\n... [output truncated]");
    }

    let exit_code = if timed_out {
        -1
    } else {
        status.code().unwrap_or(-1)
    };
    if timed_out {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        match opts.timeout {
            Some(t) => stderr.push_str(&format!("command timed out after {}ms", t.as_millis())),
            None => stderr.push_str("command timed out"),
        }
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    debug!(
        exit_code,
        duration_ms,
        stdout_len = stdout.len(),
        stderr_len = stderr.len(),
        "exec done"
    );

    Ok(ExecOutcome {
        exit_code,
        stdout,
        stderr,
        duration_ms,
        timed_out,
    })
}
