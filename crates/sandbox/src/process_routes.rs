//! `/api/process/*`.

use {
    axum::{
        Json,
        extract::{Path, Query, State},
        response::IntoResponse,
    },
    serde::Deserialize,
};

use warden_protocol::{
    KilledPayload, LogOffsets, MessagePayload, OkEnvelope, ProcessListPayload, ProcessLogsPayload,
    ProcessPayload, ProcessStartRequest,
};

use crate::{
    error::{ApiError, ApiResult},
    ok, sse,
    state::AppState,
};

pub async fn start(
    State(state): State<AppState>,
    Json(req): Json<ProcessStartRequest>,
) -> ApiResult<Json<OkEnvelope<ProcessPayload>>> {
    let spec = state.start_spec(&req).await;
    let process = state.supervisor.start(spec)?;
    Ok(ok(ProcessPayload { process }))
}

pub async fn list(
    State(state): State<AppState>,
) -> Json<OkEnvelope<ProcessListPayload>> {
    let processes = state.supervisor.list();
    let count = processes.len();
    ok(ProcessListPayload { processes, count })
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<OkEnvelope<ProcessPayload>>> {
    let process = state
        .supervisor
        .get(&id)
        .ok_or_else(|| ApiError::not_found("process", &id))?;
    Ok(ok(ProcessPayload { process }))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<OkEnvelope<MessagePayload>>> {
    state.supervisor.remove(&id).await?;
    Ok(ok(MessagePayload {
        message: format!("process '{id}' removed"),
    }))
}

pub async fn kill_all(
    State(state): State<AppState>,
) -> Json<OkEnvelope<KilledPayload>> {
    let killed = state.supervisor.kill_all().await;
    ok(KilledPayload { killed })
}

#[derive(Debug, Deserialize)]
pub struct SinceQuery {
    /// Absolute byte offset applied to both streams.
    pub since: Option<u64>,
}

fn offsets(since: Option<u64>) -> Option<LogOffsets> {
    since.map(|s| LogOffsets {
        stdout: s,
        stderr: s,
    })
}

pub async fn logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SinceQuery>,
) -> ApiResult<Json<OkEnvelope<ProcessLogsPayload>>> {
    let payload = state.supervisor.logs(&id, offsets(query.since))?;
    Ok(ok(payload))
}

pub async fn stream_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SinceQuery>,
) -> ApiResult<impl IntoResponse> {
    let permit = sse::acquire_slot(&state)?;
    let events = state.supervisor.stream_logs(&id, offsets(query.since))?;
    Ok(sse::respond(permit, None, events))
}
