//! Ping, command availability, sandbox name, env vars, and session teardown.

use std::collections::BTreeMap;

use axum::{
    Json,
    extract::{Path, State},
};

use warden_protocol::{
    CommandsPayload, EnvListPayload, EnvSetRequest, MessagePayload, NamePayload, OkEnvelope,
    SetNameRequest,
};

use crate::{error::ApiResult, ok, state::AppState};

/// Tools whose availability `/api/commands` probes.
const PROBED_COMMANDS: &[&str] = &[
    "sh", "bash", "git", "tar", "zstd", "curl", "node", "npm", "python3", "pip3", "make",
];

pub async fn ping() -> Json<OkEnvelope<MessagePayload>> {
    ok(MessagePayload {
        message: "pong".into(),
    })
}

pub async fn commands() -> Json<OkEnvelope<CommandsPayload>> {
    let available_commands: Vec<String> = PROBED_COMMANDS
        .iter()
        .filter(|cmd| which::which(cmd).is_ok())
        .map(|cmd| (*cmd).to_string())
        .collect();
    let count = available_commands.len();
    ok(CommandsPayload {
        available_commands,
        count,
    })
}

pub async fn get_name(State(state): State<AppState>) -> Json<OkEnvelope<NamePayload>> {
    ok(NamePayload {
        name: state.name().await,
    })
}

pub async fn set_name(
    State(state): State<AppState>,
    Json(req): Json<SetNameRequest>,
) -> ApiResult<Json<OkEnvelope<NamePayload>>> {
    state.set_name(&req.name).await?;
    Ok(ok(NamePayload {
        name: Some(req.name),
    }))
}

pub async fn env_list(State(state): State<AppState>) -> Json<OkEnvelope<EnvListPayload>> {
    let env: BTreeMap<String, String> = state.env_vars().await;
    let count = env.len();
    ok(EnvListPayload { env, count })
}

pub async fn env_set(
    State(state): State<AppState>,
    Json(req): Json<EnvSetRequest>,
) -> ApiResult<Json<OkEnvelope<MessagePayload>>> {
    state.set_env_var(&req.name, &req.value).await?;
    Ok(ok(MessagePayload {
        message: format!("env var '{}' set", req.name),
    }))
}

pub async fn env_delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<OkEnvelope<MessagePayload>>> {
    let removed = state.remove_env_var(&name).await?;
    let message = if removed {
        format!("env var '{name}' removed")
    } else {
        format!("env var '{name}' was not set")
    };
    Ok(ok(MessagePayload { message }))
}

pub async fn session_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<OkEnvelope<MessagePayload>> {
    let removed = state.sessions.remove(&id).await;
    let message = if removed {
        format!("session '{id}' cleared")
    } else {
        format!("session '{id}' was not active")
    };
    ok(MessagePayload { message })
}
