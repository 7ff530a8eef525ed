//! `/api/snapshot/create` and `/api/snapshot/apply`.
//!
//! Both endpoints answer 200 immediately and report progress as SSE; failures
//! after the stream starts arrive as terminal `error` events. Client
//! disconnects cancel the subprocess pipeline through the drop guard.

use {
    axum::{Json, extract::State, response::IntoResponse},
    tokio_util::sync::CancellationToken,
};

use warden_protocol::{SnapshotApplyRequest, SnapshotCreateRequest};

use crate::{error::ApiResult, sse, state::AppState};

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<SnapshotCreateRequest>,
) -> ApiResult<impl IntoResponse> {
    let permit = sse::acquire_slot(&state)?;
    // Policy check up front: snapshotting /etc would be a fine exfiltration
    // channel otherwise.
    let directory = state.files.policy().resolve(&req.directory)?;

    let cancel = CancellationToken::new();
    let events = state.snapshots.create(
        directory,
        req.compression_level,
        req.r2,
        cancel.clone(),
    );
    Ok(sse::respond(permit, Some(cancel), events))
}

pub async fn apply(
    State(state): State<AppState>,
    Json(req): Json<SnapshotApplyRequest>,
) -> ApiResult<impl IntoResponse> {
    let permit = sse::acquire_slot(&state)?;
    let target = state.files.policy().resolve(&req.target_directory)?;

    let cancel = CancellationToken::new();
    let events = state
        .snapshots
        .apply(req.id, target, req.r2, cancel.clone());
    Ok(sse::respond(permit, Some(cancel), events))
}
