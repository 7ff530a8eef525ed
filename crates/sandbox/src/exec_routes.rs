//! `/api/execute` and `/api/execute/stream`.

use std::time::Duration;

use {
    axum::{Json, extract::State, response::IntoResponse},
    tokio_util::sync::CancellationToken,
    tracing::info,
};

use {
    warden_protocol::{Encoding, ExecutePayload, ExecuteRequest, OkEnvelope},
    warden_supervisor::{ExecOpts, exec_command, exec_stream},
};

use crate::{
    error::{ApiError, ApiResult},
    sse,
    state::AppState,
};

async fn build_opts(state: &AppState, req: &ExecuteRequest, cancel: CancellationToken) -> ExecOpts {
    let ctx = state
        .resolve_context(
            req.session_id.as_deref(),
            req.env.as_ref(),
            req.cwd.as_deref(),
            req.isolation,
        )
        .await;
    ExecOpts {
        timeout: req.timeout.map(Duration::from_millis),
        max_output_bytes: state.cfg.limits.exec_output_bytes,
        working_dir: Some(ctx.cwd),
        env: ctx.env,
        kill_grace: Duration::from_millis(state.cfg.limits.kill_grace_ms),
        cancel,
    }
}

pub async fn execute(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> ApiResult<Json<OkEnvelope<ExecutePayload>>> {
    // The drop guard ties the child's lifetime to this request: if the client
    // disconnects, axum drops this future and the guard cancels the exec.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let opts = build_opts(&state, &req, cancel).await;

    let command = req.command.clone();
    let outcome = tokio::spawn(async move { exec_command(&command, &opts).await })
        .await
        .map_err(ApiError::internal)??;

    info!(
        command = %req.command,
        exit_code = outcome.exit_code,
        duration_ms = outcome.duration_ms,
        "command executed"
    );

    let mut envelope = OkEnvelope::new(ExecutePayload {
        stdout: outcome.stdout.clone(),
        stderr: outcome.stderr.clone(),
        exit_code: outcome.exit_code,
        command: req.command,
        duration: outcome.duration_ms,
        session_id: req.session_id,
    });
    envelope.success = outcome.success();
    Ok(Json(envelope))
}

pub async fn execute_stream(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> ApiResult<impl IntoResponse> {
    let permit = sse::acquire_slot(&state)?;
    let cancel = CancellationToken::new();
    let opts = build_opts(&state, &req, cancel.clone()).await;

    let events = exec_stream(
        &req.command,
        &opts,
        Encoding::Utf8,
        state.cfg.limits.log_buffer_bytes,
    )?;
    info!(command = %req.command, "streaming command started");
    Ok(sse::respond(permit, Some(cancel), events))
}
