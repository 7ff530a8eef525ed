//! The bridge: an optional Bearer-authenticated front door.
//!
//! Routes `/{sandboxName}/{rest...}` to that sandbox's control plane. The
//! Bearer key is the only authentication layer in the system; everything
//! behind it trusts the proxy boundary. CORS is wide open so browser-based
//! tooling can drive sandboxes directly.

use std::sync::Arc;

use {
    axum::{
        Json, Router,
        extract::{Request, State},
        http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
        middleware::{self, Next},
        response::{IntoResponse, Response},
    },
    secrecy::{ExposeSecret, Secret},
    tower_http::cors::{Any, CorsLayer},
    tracing::{info, warn},
};

use {
    warden_common::security::sanitize_sandbox_id,
    warden_edge::SandboxResolver,
    warden_protocol::{
        CONTROL_PLANE_PORT, ErrorEnvelope, PROXY_PORT_HEADER, SANDBOX_NAME_HEADER, error_codes,
    },
    warden_proxy::ProxyClient,
};

pub struct Bridge {
    api_key: Secret<String>,
    resolver: Arc<dyn SandboxResolver>,
    proxy: ProxyClient,
}

#[derive(Clone)]
pub struct BridgeState(Arc<Bridge>);

impl Bridge {
    pub fn new(api_key: impl Into<String>, resolver: Arc<dyn SandboxResolver>) -> Arc<Self> {
        Arc::new(Self {
            api_key: Secret::new(api_key.into()),
            resolver,
            proxy: ProxyClient::new(),
        })
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(value) = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        match value.strip_prefix("Bearer ") {
            Some(token) => !token.is_empty() && token == self.api_key.expose_secret(),
            None => false,
        }
    }
}

fn unauthorized() -> Response {
    let body = ErrorEnvelope::new(error_codes::UNAUTHORIZED, "missing or invalid bearer token");
    let mut response = (StatusCode::UNAUTHORIZED, Json(body)).into_response();
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Bearer"),
    );
    response
}

async fn auth_gate(State(state): State<BridgeState>, req: Request, next: Next) -> Response {
    // Preflights carry no credentials; CORS answers them.
    if req.method() == Method::OPTIONS {
        return next.run(req).await;
    }
    if !state.0.authorized(req.headers()) {
        warn!(path = req.uri().path(), "bridge auth failed");
        return unauthorized();
    }
    next.run(req).await
}

async fn route(State(state): State<BridgeState>, req: Request) -> Response {
    let path = req.uri().path().trim_start_matches('/');
    let (name, rest) = match path.split_once('/') {
        Some((name, rest)) => (name, format!("/{rest}")),
        None => (path, "/".to_string()),
    };
    if name.is_empty() || sanitize_sandbox_id(name).is_err() {
        let body = ErrorEnvelope::new(error_codes::NOT_FOUND, "unknown sandbox");
        return (StatusCode::NOT_FOUND, Json(body)).into_response();
    }

    let origin = match state.0.resolver.resolve(name).await {
        Ok(Some(origin)) => origin,
        Ok(None) => {
            let body = ErrorEnvelope::new(error_codes::NOT_FOUND, "unknown sandbox");
            return (StatusCode::NOT_FOUND, Json(body)).into_response();
        },
        Err(e) => {
            warn!(error = %e, "bridge resolver failed");
            let body = ErrorEnvelope::new(error_codes::INTERNAL_ERROR, "internal error");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
        },
    };

    let forward_path = match req.uri().query() {
        Some(query) => format!("{rest}?{query}"),
        None => rest,
    };
    let url = format!(
        "{}{}",
        origin.as_str().trim_end_matches('/'),
        forward_path
    );

    let mut extra = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(name) {
        extra.insert(HeaderName::from_static(SANDBOX_NAME_HEADER), value);
    }
    // Bridge traffic always targets the control plane, never user ports.
    extra.insert(
        HeaderName::from_static(PROXY_PORT_HEADER),
        HeaderValue::from(CONTROL_PLANE_PORT),
    );
    state.0.proxy.forward_to(&url, extra, req).await
}

/// Preflights answer 204.
async fn preflight_no_content(req: Request, next: Next) -> Response {
    let is_options = req.method() == Method::OPTIONS;
    let mut resp = next.run(req).await;
    if is_options && resp.status() == StatusCode::OK {
        *resp.status_mut() = StatusCode::NO_CONTENT;
    }
    resp
}

pub fn bridge_app(bridge: Arc<Bridge>) -> Router {
    let state = BridgeState(bridge);
    Router::new()
        .fallback(route)
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
        )
        .layer(middleware::from_fn(preflight_no_content))
        .with_state(state)
}

/// Bind and serve the bridge.
pub async fn serve(cfg: warden_config::BridgeConfig, origin_template: String) -> anyhow::Result<()> {
    if cfg.api_key.is_empty() {
        anyhow::bail!("bridge requires an api key (set [bridge].api_key or WARDEN_API_KEY)");
    }
    let resolver = Arc::new(warden_edge::TemplateResolver::new(origin_template));
    let bridge = Bridge::new(cfg.api_key.clone(), resolver);
    let listener = tokio::net::TcpListener::bind((cfg.bind.as_str(), cfg.port)).await?;
    info!(addr = %listener.local_addr()?, "bridge listening");
    axum::serve(listener, bridge_app(bridge)).await?;
    Ok(())
}
