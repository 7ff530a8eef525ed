//! Proxy entry for edge-forwarded traffic.
//!
//! The edge forwards user-port requests to the control plane with
//! `x-warden-proxy-port` / `x-warden-proxy-token` headers; this middleware
//! intercepts them ahead of the API router, validates `(port, token)` against
//! the registry, and hands the request to the reverse proxy. Control-plane
//! traffic (no proxy header, or port 3000) falls through to the API.

use axum::{
    extract::{FromRequestParts, Request, State, WebSocketUpgrade},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};

use {
    warden_common::{Severity, log_security_event},
    warden_protocol::{CONTROL_PLANE_PORT, PROXY_PORT_HEADER, PROXY_TOKEN_HEADER},
    warden_proxy::{ForwardContext, relay_websocket, target_ws_url, wants_websocket_upgrade},
};

use crate::{error::ApiError, state::AppState};

fn header_str<'h>(req: &'h Request, name: &str) -> Option<&'h str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

pub async fn proxy_gate(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(port_raw) = header_str(&req, PROXY_PORT_HEADER) else {
        return next.run(req).await;
    };
    let Ok(port) = port_raw.parse::<u16>() else {
        return ApiError::invalid_token().into_response();
    };
    if port == CONTROL_PLANE_PORT {
        // Control-plane traffic is token-exempt and handled by the API router.
        return next.run(req).await;
    }

    let token = header_str(&req, PROXY_TOKEN_HEADER).unwrap_or_default();
    if !state.ports.validate_token(port, token).await {
        log_security_event(
            "INVALID_TOKEN_ACCESS_BLOCKED",
            serde_json::json!({
                "port": port,
                "path": req.uri().path(),
            }),
            Severity::High,
        );
        return ApiError::invalid_token().into_response();
    }

    let forwarded_host = header_str(&req, "x-forwarded-host")
        .or_else(|| {
            req.headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
        })
        .map(str::to_string);
    let forwarded_proto = header_str(&req, "x-forwarded-proto")
        .unwrap_or("http")
        .to_string();
    let original_url = header_str(&req, "x-original-url")
        .map(str::to_string)
        .unwrap_or_else(|| {
            format!(
                "{}://{}{}",
                forwarded_proto,
                forwarded_host.as_deref().unwrap_or("localhost"),
                req.uri()
            )
        });
    let ctx = ForwardContext {
        port,
        original_url,
        forwarded_host,
        forwarded_proto,
        sandbox_name: state.name().await,
    };

    if wants_websocket_upgrade(req.headers()) {
        let target = target_ws_url(port, req.uri());
        let (mut parts, _body) = req.into_parts();
        return match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => upgrade
                .on_upgrade(move |socket| relay_websocket(socket, target))
                .into_response(),
            Err(rejection) => rejection.into_response(),
        };
    }

    state.proxy.forward(&ctx, req).await
}
