//! HTTP error surfacing.
//!
//! Every failure leaving the control plane is an [`ApiError`]: a status code,
//! a stable error code, a human string, and optional structured details.
//! Internal errors carry a generated request id and never leak paths, stack
//! traces, or connection strings into the public string.

use {
    axum::{
        Json,
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    tracing::error,
};

use warden_protocol::{ErrorEnvelope, error_codes, violation_types};

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(
            StatusCode::BAD_REQUEST,
            error_codes::VALIDATION_ERROR,
            format!("{field}: {message}"),
        )
        .with_details(serde_json::json!([{ "field": field, "message": message }]))
    }

    pub fn security_violation(
        violation_type: &'static str,
        blocked_value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let reason = reason.into();
        Self::new(
            StatusCode::BAD_REQUEST,
            error_codes::SECURITY_VIOLATION,
            reason.clone(),
        )
        .with_details(serde_json::json!({
            "violationType": violation_type,
            "blockedValue": blocked_value.into(),
            "reason": reason,
        }))
    }

    pub fn not_found(resource: &str, identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        Self::new(
            StatusCode::NOT_FOUND,
            error_codes::NOT_FOUND,
            format!("{resource} '{identifier}' not found"),
        )
        .with_details(serde_json::json!({
            "resource": resource,
            "identifier": identifier,
        }))
    }

    /// Wrap an unexpected failure. The cause is logged under a request id;
    /// only the id crosses the wire.
    pub fn internal(source: impl std::fmt::Display) -> Self {
        let request_id = uuid::Uuid::new_v4().to_string();
        error!(request_id = %request_id, error = %source, "internal error");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            error_codes::INTERNAL_ERROR,
            "internal error",
        )
        .with_details(serde_json::json!({
            "message": "internal error",
            "requestId": request_id,
        }))
    }

    /// The deliberate 404 for bad `(port, token)` pairs, indistinguishable
    /// from "not exposed".
    pub fn invalid_token() -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            error_codes::INVALID_TOKEN,
            "Access denied: Invalid token or port not exposed",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            success: false,
            error: self.message,
            code: self.code.to_string(),
            details: self.details,
            timestamp: warden_protocol::timestamp(),
        };
        (self.status, Json(body)).into_response()
    }
}

// ── Domain error mappings ───────────────────────────────────────────────────

impl From<warden_supervisor::SupervisorError> for ApiError {
    fn from(e: warden_supervisor::SupervisorError) -> Self {
        use warden_supervisor::SupervisorError as E;
        match &e {
            E::NotFound(id) => Self::new(
                StatusCode::NOT_FOUND,
                error_codes::PROCESS_NOT_FOUND,
                e.to_string(),
            )
            .with_details(serde_json::json!({ "resource": "process", "identifier": id })),
            E::AlreadyExists(_) => Self::new(
                StatusCode::CONFLICT,
                error_codes::PROCESS_EXISTS,
                e.to_string(),
            ),
            E::LimitReached(_) => Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                error_codes::PROCESS_LIMIT,
                e.to_string(),
            ),
            E::EmptyCommand => Self::validation("command", "must not be empty"),
            E::Spawn(_) | E::Aborted => Self::internal(e),
        }
    }
}

impl From<warden_files::FileError> for ApiError {
    fn from(e: warden_files::FileError) -> Self {
        use warden_files::FileError as E;
        match &e {
            E::EmptyPath => Self::validation("path", "must not be empty"),
            E::PathTraversal(raw) => Self::security_violation(
                violation_types::PATH_TRAVERSAL,
                raw.clone(),
                "path escapes the sandbox or targets a protected location",
            ),
            E::NotFound(path) => Self::new(
                StatusCode::NOT_FOUND,
                error_codes::FILE_NOT_FOUND,
                format!("file not found: {path}"),
            ),
            E::AlreadyExists(path) => Self::new(
                StatusCode::CONFLICT,
                error_codes::FILE_EXISTS,
                format!("file already exists: {path}"),
            ),
            E::PermissionDenied(path) => Self::new(
                StatusCode::FORBIDDEN,
                error_codes::PERMISSION_DENIED,
                format!("permission denied: {path}"),
            ),
            E::BadEncoding { .. } => Self::validation("content", e.to_string()),
            E::Io { .. } => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                error_codes::FILESYSTEM_ERROR,
                "filesystem operation failed",
            ),
        }
    }
}

impl From<warden_git::GitError> for ApiError {
    fn from(e: warden_git::GitError) -> Self {
        use warden_git::GitError as E;
        match &e {
            E::InvalidUrl(_) => Self::new(
                StatusCode::BAD_REQUEST,
                error_codes::INVALID_GIT_URL,
                e.to_string(),
            ),
            E::MaliciousUrl(url) => Self::security_violation(
                violation_types::MALICIOUS_URL,
                url.clone(),
                "repository url uses a blocked scheme or contains shell metacharacters",
            ),
            E::InvalidDepth(_) => Self::validation("depth", "must be a positive integer"),
            E::TargetNotPermitted(dir) => Self::security_violation(
                violation_types::PATH_TRAVERSAL,
                dir.clone(),
                "target directory escapes the sandbox",
            ),
            E::RepositoryNotFound(_) => Self::new(
                StatusCode::NOT_FOUND,
                error_codes::GIT_REPOSITORY_NOT_FOUND,
                e.to_string(),
            ),
            E::BranchNotFound { .. } => Self::new(
                StatusCode::NOT_FOUND,
                error_codes::GIT_BRANCH_NOT_FOUND,
                e.to_string(),
            ),
            E::AuthenticationError(_) => Self::new(
                StatusCode::FORBIDDEN,
                error_codes::GIT_AUTHENTICATION_ERROR,
                e.to_string(),
            ),
            E::NetworkError(_) => Self::new(
                StatusCode::BAD_GATEWAY,
                error_codes::GIT_NETWORK_ERROR,
                e.to_string(),
            ),
            E::CloneError(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                error_codes::GIT_CLONE_ERROR,
                e.to_string(),
            ),
        }
    }
}

impl From<warden_ports::PortError> for ApiError {
    fn from(e: warden_ports::PortError) -> Self {
        use warden_ports::PortError as E;
        match &e {
            E::InvalidPort(port) => Self::new(
                StatusCode::BAD_REQUEST,
                error_codes::INVALID_PORT,
                e.to_string(),
            )
            .with_details(serde_json::json!({
                "violationType": violation_types::RESERVED_PORT,
                "blockedValue": port,
                "reason": "port is reserved or outside [1024, 65535]",
            })),
            E::InvalidToken => Self::new(
                StatusCode::BAD_REQUEST,
                error_codes::INVALID_TOKEN,
                e.to_string(),
            ),
            E::AlreadyExposed(_) => Self::new(
                StatusCode::CONFLICT,
                error_codes::PORT_ALREADY_EXPOSED,
                e.to_string(),
            ),
            E::NotExposed(_) => Self::new(
                StatusCode::NOT_FOUND,
                error_codes::PORT_NOT_EXPOSED,
                e.to_string(),
            ),
            E::Store(source) => Self::internal(source),
        }
    }
}

impl From<warden_store::StoreError> for ApiError {
    fn from(e: warden_store::StoreError) -> Self {
        Self::internal(e)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn error_envelope_wire_shape() {
        let resp = ApiError::validation("command", "must not be empty").into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["code"], "VALIDATION_ERROR");
        assert_eq!(v["details"][0]["field"], "command");
        assert!(v["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn internal_errors_hide_the_cause() {
        let err = ApiError::internal("connection string postgres://user:pw@db");
        assert_eq!(err.message, "internal error");
        let details = err.details.unwrap();
        assert!(details["requestId"].as_str().is_some());
        assert!(!details.to_string().contains("postgres"));
    }

    #[test]
    fn path_traversal_maps_to_security_violation() {
        let err: ApiError = warden_files::FileError::PathTraversal("/etc/passwd".into()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "SECURITY_VIOLATION");
        assert_eq!(err.details.unwrap()["violationType"], "PATH_TRAVERSAL");
    }

    #[test]
    fn invalid_token_is_ambiguous_404() {
        let err = ApiError::invalid_token();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.code, "INVALID_TOKEN");
        assert_eq!(err.message, "Access denied: Invalid token or port not exposed");
    }
}
