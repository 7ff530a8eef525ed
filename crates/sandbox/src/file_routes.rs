//! `/api/file/*`.

use {
    axum::{
        Json,
        extract::{Query, State},
        response::IntoResponse,
    },
    futures::StreamExt,
    serde::Deserialize,
};

use warden_protocol::{
    FileListPayload, FileMoveRequest, FilePathPayload, FilePathRequest, FileReadPayload,
    FileReadRequest, FileRenamePayload, FileRenameRequest, FileStreamEvent, FileWritePayload,
    FileWriteRequest, MkdirPayload, MkdirRequest, OkEnvelope,
};

use crate::{error::ApiResult, ok, sse, state::AppState};

pub async fn write(
    State(state): State<AppState>,
    Json(req): Json<FileWriteRequest>,
) -> ApiResult<Json<OkEnvelope<FileWritePayload>>> {
    let (path, bytes_written) = state
        .files
        .write_file(&req.path, &req.content, req.encoding)
        .await?;
    Ok(ok(FileWritePayload {
        path: path.display().to_string(),
        bytes_written,
    }))
}

pub async fn read(
    State(state): State<AppState>,
    Json(req): Json<FileReadRequest>,
) -> ApiResult<Json<OkEnvelope<FileReadPayload>>> {
    let (path, content, size) = state.files.read_file(&req.path, req.encoding).await?;
    Ok(ok(FileReadPayload {
        path: path.display().to_string(),
        content,
        size,
    }))
}

pub async fn read_stream(
    State(state): State<AppState>,
    Json(req): Json<FilePathRequest>,
) -> ApiResult<impl IntoResponse> {
    let permit = sse::acquire_slot(&state)?;
    let streamed = state.files.open_stream(&req.path).await?;
    let metadata = FileStreamEvent::Metadata {
        mime_type: streamed.mime_type.clone(),
        size: streamed.size,
        is_binary: streamed.is_binary,
        encoding: streamed.encoding,
    };
    let events = futures::stream::once(std::future::ready(metadata)).chain(streamed.events);
    Ok(sse::respond(permit, None, events))
}

pub async fn delete(
    State(state): State<AppState>,
    Json(req): Json<FilePathRequest>,
) -> ApiResult<Json<OkEnvelope<FilePathPayload>>> {
    let path = state.files.delete(&req.path).await?;
    Ok(ok(FilePathPayload {
        path: path.display().to_string(),
    }))
}

pub async fn rename(
    State(state): State<AppState>,
    Json(req): Json<FileRenameRequest>,
) -> ApiResult<Json<OkEnvelope<FileRenamePayload>>> {
    let (old, new) = state.files.rename(&req.old_path, &req.new_path).await?;
    Ok(ok(FileRenamePayload {
        path: old.display().to_string(),
        new_path: new.display().to_string(),
    }))
}

pub async fn move_file(
    State(state): State<AppState>,
    Json(req): Json<FileMoveRequest>,
) -> ApiResult<Json<OkEnvelope<FileRenamePayload>>> {
    let (src, dst) = state
        .files
        .move_file(&req.source_path, &req.destination_path)
        .await?;
    Ok(ok(FileRenamePayload {
        path: src.display().to_string(),
        new_path: dst.display().to_string(),
    }))
}

pub async fn mkdir(
    State(state): State<AppState>,
    Json(req): Json<MkdirRequest>,
) -> ApiResult<Json<OkEnvelope<MkdirPayload>>> {
    let path = state.files.mkdir(&req.path, req.recursive).await?;
    Ok(ok(MkdirPayload {
        path: path.display().to_string(),
        recursive: req.recursive,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub path: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<OkEnvelope<FileListPayload>>> {
    let raw = query.path.unwrap_or_else(|| ".".to_string());
    let files = state.files.list(&raw).await?;
    Ok(ok(FileListPayload { path: raw, files }))
}
