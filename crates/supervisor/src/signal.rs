//! Best-effort process-group signalling.
//!
//! Children are spawned in their own process group, so signalling the
//! negative pid reaches the shell and everything it forked. Signals go
//! through the `kill` binary; the container contract guarantees coreutils.

use tokio::process::Command;

pub(crate) async fn terminate_group(pid: u32) {
    send("-TERM", pid).await;
}

pub(crate) async fn kill_group(pid: u32) {
    send("-KILL", pid).await;
}

async fn send(sig: &str, pid: u32) {
    if pid == 0 {
        return;
    }
    let target = format!("-{pid}");
    match Command::new("kill")
        .arg(sig)
        .arg("--")
        .arg(&target)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
    {
        Ok(_) => {},
        Err(e) => tracing::debug!(pid, sig, error = %e, "failed to signal process group"),
    }
}
