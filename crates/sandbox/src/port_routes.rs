//! `/api/expose-port`, `/api/exposed-ports`, `/api/port-watch`.

use std::time::Duration;

use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};

use {
    warden_ports::watch_port,
    warden_protocol::{
        ExposePortRequest, ExposedPortInfo, OkEnvelope, PortPayload, PortWatchRequest,
        PortsPayload, preview_host,
    },
};

use crate::{error::ApiResult, ok, sse, state::AppState};

/// Public preview URL for an exposed port, when the sandbox knows who it is.
async fn preview_url(state: &AppState, info: &ExposedPortInfo) -> Option<String> {
    let name = state.name().await?;
    Some(format!(
        "https://{}",
        preview_host(info.port, &name, &info.token, &state.cfg.edge.domain)
    ))
}

pub async fn expose(
    State(state): State<AppState>,
    Json(req): Json<ExposePortRequest>,
) -> ApiResult<Json<OkEnvelope<ExposedPortInfo>>> {
    let mut info = state.ports.expose(req.port, req.name, req.token).await?;
    info.url = preview_url(&state, &info).await;
    Ok(ok(info))
}

pub async fn list(
    State(state): State<AppState>,
) -> Json<OkEnvelope<PortsPayload>> {
    let mut ports = state.ports.list().await;
    for info in &mut ports {
        info.url = preview_url(&state, info).await;
    }
    let count = ports.len();
    ok(PortsPayload { ports, count })
}

pub async fn unexpose(
    State(state): State<AppState>,
    Path(port): Path<u16>,
) -> ApiResult<Json<OkEnvelope<PortPayload>>> {
    let removed = state.ports.unexpose(port).await?;
    Ok(ok(PortPayload { port: removed.port }))
}

pub async fn watch(
    State(state): State<AppState>,
    Json(req): Json<PortWatchRequest>,
) -> ApiResult<impl IntoResponse> {
    let permit = sse::acquire_slot(&state)?;
    let interval = Duration::from_millis(state.cfg.ports.watch_interval_ms);
    let deadline = Duration::from_millis(
        req.timeout_ms
            .unwrap_or(state.cfg.ports.watch_deadline_ms),
    );
    let events = watch_port(req.port, interval, deadline);
    Ok(sse::respond(permit, None, events))
}
