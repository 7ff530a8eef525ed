//! Router construction, middleware stack, and sandbox lifecycle.

use std::path::PathBuf;

use {
    axum::{
        Router,
        extract::{DefaultBodyLimit, Request, State},
        http::{Method, StatusCode, header},
        middleware::{self, Next},
        response::{IntoResponse, Response},
        routing::{get, post},
    },
    tower_http::{
        catch_panic::CatchPanicLayer,
        cors::{Any, CorsLayer},
        request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
        sensitive_headers::SetSensitiveHeadersLayer,
        trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer},
    },
    tracing::{Level, error, info},
};

use {
    warden_config::WardenConfig,
    warden_protocol::{SANDBOX_NAME_HEADER, error_codes},
    warden_snapshots::clean_orphans,
    warden_store::JsonFileStore,
};

use crate::{
    error::ApiError,
    exec_routes, file_routes, git_routes, meta_routes, port_routes, process_routes, proxy_gate,
    snapshot_routes,
    state::{AppState, SandboxState},
};

fn build_api_routes() -> Router<AppState> {
    Router::new()
        .route("/api/ping", get(meta_routes::ping))
        .route("/api/commands", get(meta_routes::commands))
        .route("/api/execute", post(exec_routes::execute))
        .route("/api/execute/stream", post(exec_routes::execute_stream))
        .route("/api/process/start", post(process_routes::start))
        .route("/api/process/list", get(process_routes::list))
        .route("/api/process/kill-all", post(process_routes::kill_all))
        .route(
            "/api/process/{id}",
            get(process_routes::get).delete(process_routes::remove),
        )
        .route("/api/process/{id}/logs", get(process_routes::logs))
        .route(
            "/api/process/{id}/logs/stream",
            get(process_routes::stream_logs),
        )
        .route("/api/file/write", post(file_routes::write))
        .route("/api/file/read", post(file_routes::read))
        .route("/api/file/read/stream", post(file_routes::read_stream))
        .route("/api/file/delete", post(file_routes::delete))
        .route("/api/file/rename", post(file_routes::rename))
        .route("/api/file/move", post(file_routes::move_file))
        .route("/api/file/mkdir", post(file_routes::mkdir))
        .route("/api/file/list", get(file_routes::list))
        .route("/api/git/checkout", post(git_routes::checkout))
        .route("/api/expose-port", post(port_routes::expose))
        .route("/api/exposed-ports", get(port_routes::list))
        .route(
            "/api/exposed-ports/{port}",
            axum::routing::delete(port_routes::unexpose),
        )
        .route("/api/port-watch", post(port_routes::watch))
        .route("/api/snapshot/create", post(snapshot_routes::create))
        .route("/api/snapshot/apply", post(snapshot_routes::apply))
        .route(
            "/api/sandbox/name",
            get(meta_routes::get_name).post(meta_routes::set_name),
        )
        .route(
            "/api/env",
            get(meta_routes::env_list).post(meta_routes::env_set),
        )
        .route(
            "/api/env/{name}",
            axum::routing::delete(meta_routes::env_delete),
        )
        .route(
            "/api/session/{id}",
            axum::routing::delete(meta_routes::session_delete),
        )
}

/// CORS per the wire contract: any origin, the JSON API verbs, and the two
/// headers clients actually send.
fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

/// Preflights answer 204 rather than tower-http's default 200.
async fn preflight_no_content(req: Request, next: Next) -> Response {
    let is_options = req.method() == Method::OPTIONS;
    let mut resp = next.run(req).await;
    if is_options && resp.status() == StatusCode::OK {
        *resp.status_mut() = StatusCode::NO_CONTENT;
    }
    resp
}

/// After `on_error` the sandbox answers 503 until the next start.
async fn health_gate(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !state.is_healthy() {
        return ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            error_codes::SANDBOX_UNHEALTHY,
            "sandbox is unhealthy",
        )
        .into_response();
    }
    next.run(req).await
}

/// First sighting of `X-Sandbox-Name` sets the name; it is immutable after.
async fn adopt_name(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Some(name) = req
        .headers()
        .get(SANDBOX_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        state.adopt_name(name).await;
    }
    next.run(req).await
}

/// Build the full control-plane router.
///
/// Layer order (outermost → innermost for requests):
/// 1. `CatchPanicLayer` — converts handler panics to 500s
/// 2. health gate — 503 while unhealthy
/// 3. name adoption — set-once `X-Sandbox-Name`
/// 4. proxy gate — edge-forwarded user-port traffic bypasses the API
/// 5. `SetSensitiveHeadersLayer` — marks Authorization/Cookie as redacted
/// 6. `SetRequestIdLayer` — generates x-request-id before tracing
/// 7. `TraceLayer` — logs requests with request IDs
/// 8. preflight 204 + `CorsLayer`
/// 9. `PropagateRequestIdLayer` — copies x-request-id to the response
/// 10. `DefaultBodyLimit` (innermost) — caps JSON API bodies
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.cfg.limits.request_body_bytes;
    build_api_routes()
        .with_state(state.clone())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(build_cors_layer())
        .layer(middleware::from_fn(preflight_no_content))
        .layer(
            TraceLayer::new_for_http()
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(SetSensitiveHeadersLayer::new([
            header::AUTHORIZATION,
            header::COOKIE,
        ]))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            proxy_gate::proxy_gate,
        ))
        .layer(middleware::from_fn_with_state(state.clone(), adopt_name))
        .layer(middleware::from_fn_with_state(state, health_gate))
        .layer(CatchPanicLayer::new())
}

/// The per-sandbox supervisor: composition of the HTTP server, process
/// supervisor, port registry, snapshot engine, and persistent store, with
/// lifecycle hooks invoked by the hosting runtime.
pub struct Sandbox {
    pub state: AppState,
}

impl Sandbox {
    /// Open persistent state and assemble the sandbox.
    pub async fn new(cfg: WardenConfig) -> anyhow::Result<Self> {
        let state_path = if cfg.sandbox.state_file.is_empty() {
            warden_store::default_state_path(&warden_config::data_dir())
        } else {
            PathBuf::from(&cfg.sandbox.state_file)
        };
        let store = JsonFileStore::open(state_path).await?;
        let state = SandboxState::new(cfg, store).await?;
        Ok(Self { state })
    }

    pub fn from_state(state: AppState) -> Self {
        Self { state }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Startup: ensure the workspace exists, sweep snapshot leftovers, go
    /// healthy.
    pub async fn on_start(&self) {
        let workspace = PathBuf::from(&self.state.cfg.sandbox.workspace_root);
        if let Err(e) = tokio::fs::create_dir_all(&workspace).await {
            error!(path = %workspace.display(), error = %e, "failed to create workspace root");
        }
        let mut swept = clean_orphans(&workspace).await;
        if let Some(parent) = workspace.parent() {
            swept += clean_orphans(parent).await;
        }
        if swept > 0 {
            info!(swept, "cleaned snapshot orphans");
        }
        self.state.mark_healthy();
        info!(
            name = ?self.state.name().await,
            port = self.state.cfg.sandbox.port,
            "sandbox control plane ready"
        );
    }

    /// Drain: kill every non-terminal process, flush persistent state.
    pub async fn on_stop(&self) {
        self.state.supervisor.shutdown().await;
        if let Err(e) = self.state.store.flush().await {
            error!(error = %e, "failed to flush store during shutdown");
        }
        info!("sandbox control plane stopped");
    }

    /// Mark the sandbox unhealthy; requests answer 503 until the next start.
    pub fn on_error(&self, err: &anyhow::Error) {
        error!(error = %err, "sandbox entered error state");
        self.state.mark_unhealthy();
    }

    /// Bind and serve until SIGTERM/ctrl-c, then drain.
    pub async fn serve(self) -> anyhow::Result<()> {
        let bind = (
            self.state.cfg.sandbox.bind.clone(),
            self.state.cfg.sandbox.port,
        );
        let listener = tokio::net::TcpListener::bind(bind).await?;
        info!(addr = %listener.local_addr()?, "control plane listening");

        self.on_start().await;
        let router = self.router();
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        self.on_stop().await;
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(_) => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm => {},
    }
    info!("shutdown signal received");
}
