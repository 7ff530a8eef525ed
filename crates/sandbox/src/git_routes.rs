//! `/api/git/checkout`.

use axum::{Json, extract::State};

use {
    warden_git::CheckoutOpts,
    warden_protocol::{GitCheckoutPayload, GitCheckoutRequest, OkEnvelope},
};

use crate::{error::ApiResult, ok, state::AppState};

pub async fn checkout(
    State(state): State<AppState>,
    Json(req): Json<GitCheckoutRequest>,
) -> ApiResult<Json<OkEnvelope<GitCheckoutPayload>>> {
    let opts = CheckoutOpts {
        branch: req.branch.clone(),
        target_dir: req.target_dir.clone(),
        depth: req.depth,
    };
    let outcome = state.git.checkout(&req.repo_url, &opts).await?;
    Ok(ok(GitCheckoutPayload {
        repo_url: warden_common::redact_url_credentials(&req.repo_url),
        branch: outcome.branch,
        target_dir: outcome.target_dir.display().to_string(),
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        exit_code: outcome.exit_code,
    }))
}
