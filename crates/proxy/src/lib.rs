//! Reverse proxy to user workloads on `localhost:<port>`.
//!
//! Requests arrive already authorized (the sandbox server checks the port
//! registry first); this crate only forwards. Plain HTTP streams through
//! reqwest without buffering; WebSocket upgrades become a bidirectional frame
//! relay that runs until either side closes.

use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

pub mod ws;

pub use ws::{relay_websocket, relay_websocket_request};

/// Headers that belong to one hop and must not be forwarded either way.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Request context injected into forwarded requests.
#[derive(Debug, Clone, Default)]
pub struct ForwardContext {
    /// Target user port inside the sandbox.
    pub port: u16,
    /// Full URL as seen at the public edge.
    pub original_url: String,
    /// Public host the client addressed.
    pub forwarded_host: Option<String>,
    /// `http` or `https` at the public edge.
    pub forwarded_proto: String,
    /// This sandbox's name, when set.
    pub sandbox_name: Option<String>,
}

/// True when the request asks for a WebSocket upgrade.
pub fn wants_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// True for headers that must not be forwarded across a proxy hop.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Target URL on localhost for a given inbound URI.
pub fn target_url(port: u16, uri: &Uri) -> String {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("http://127.0.0.1:{port}{path_and_query}")
}

/// WebSocket URL on localhost for a given inbound URI.
pub fn target_ws_url(port: u16, uri: &Uri) -> String {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("ws://127.0.0.1:{port}{path_and_query}")
}

/// HTTP forwarder with a shared connection pool.
#[derive(Clone)]
pub struct ProxyClient {
    http: reqwest::Client,
}

impl Default for ProxyClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            // The workload decides redirects, not the proxy.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http }
    }

    /// Forward `req` to `localhost:{ctx.port}` preserving method, headers,
    /// query, and body, and stream the response back unchanged.
    pub async fn forward(&self, ctx: &ForwardContext, req: Request) -> Response {
        let url = target_url(ctx.port, req.uri());
        let mut extra = HeaderMap::new();
        insert_str(&mut extra, "x-original-url", &ctx.original_url);
        if let Some(host) = &ctx.forwarded_host {
            insert_str(&mut extra, "x-forwarded-host", host);
        }
        insert_str(&mut extra, "x-forwarded-proto", &ctx.forwarded_proto);
        if let Some(name) = &ctx.sandbox_name {
            insert_str(&mut extra, "x-sandbox-name", name);
        }
        self.forward_to(&url, extra, req).await
    }

    /// Forward `req` to an explicit `url`, overlaying `extra` headers on top
    /// of the (hop-by-hop-stripped) originals, and stream the response back.
    pub async fn forward_to(&self, url: &str, extra: HeaderMap, req: Request) -> Response {
        let (parts, body) = req.into_parts();
        debug!(method = %parts.method, url, "proxying request");

        let mut headers = HeaderMap::new();
        for (name, value) in &parts.headers {
            if is_hop_by_hop(name) || name == header::HOST {
                continue;
            }
            headers.insert(name.clone(), value.clone());
        }
        for (name, value) in &extra {
            headers.insert(name.clone(), value.clone());
        }

        let result = self
            .http
            .request(parts.method.clone(), url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await;

        let upstream = match result {
            Ok(resp) => resp,
            Err(e) => {
                warn!(url, error = %e, "proxy target unreachable");
                return (StatusCode::BAD_GATEWAY, "upstream unreachable").into_response();
            },
        };

        let status = upstream.status();
        let mut response = Response::builder().status(status);
        if let Some(resp_headers) = response.headers_mut() {
            for (name, value) in upstream.headers() {
                if is_hop_by_hop(name) {
                    continue;
                }
                resp_headers.insert(name.clone(), value.clone());
            }
        }
        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
    }
}

fn insert_str(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}
