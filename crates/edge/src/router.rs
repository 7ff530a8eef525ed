//! The edge request path: parse → validate → forward.
//!
//! `proxy_to_sandbox` returns `None` ("not mine") for traffic that does not
//! address a sandbox, so a hosting router can fall through to its own
//! handlers. Everything that *does* address a sandbox gets a response, even
//! if that response is a 404 or the deliberate 500 text.

use std::sync::Arc;

use {
    axum::{
        Router,
        extract::{FromRequestParts, Request, State, WebSocketUpgrade},
        http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
        response::{IntoResponse, Response},
    },
    tracing::{error, info},
    url::Url,
};

use {
    warden_common::{
        Severity, log_security_event,
        security::{SANDBOX_ID_MAX_LEN, sanitize_sandbox_id, validate_port},
    },
    warden_protocol::{CONTROL_PLANE_PORT, PROXY_PORT_HEADER, PROXY_TOKEN_HEADER},
    warden_proxy::{ProxyClient, is_hop_by_hop, relay_websocket_request, wants_websocket_upgrade},
};

use crate::{
    parse::{
        RawTarget, is_local_host, looks_like_preview_host, parse_host, parse_preview_path,
        token_from_query,
    },
    resolver::SandboxResolver,
};

/// A validated preview target.
#[derive(Debug, Clone)]
struct Target {
    port: u16,
    sandbox_id: String,
    token: String,
    /// Path + query to forward to the sandbox.
    forward_path: String,
    /// `http` on localhost, `https` behind the public edge.
    proto: &'static str,
}

pub struct EdgeRouter {
    resolver: Arc<dyn SandboxResolver>,
    proxy: ProxyClient,
}

impl EdgeRouter {
    pub fn new(resolver: Arc<dyn SandboxResolver>) -> Self {
        Self {
            resolver,
            proxy: ProxyClient::new(),
        }
    }

    /// Route a request to its sandbox. `None` means the request does not
    /// address a sandbox at all.
    pub async fn proxy_to_sandbox(&self, req: Request) -> Option<Response> {
        let host = request_host(&req)?;
        let target = self.parse_target(&host, &req)?;

        let response = match self.forward(&host, target, req).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "proxy routing error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Proxy routing error").into_response()
            },
        };
        Some(response)
    }

    fn parse_target(&self, host: &str, req: &Request) -> Option<Target> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let (raw, proto) = if let Some(raw) = parse_host(host, &path_and_query) {
            (raw, "https")
        } else if is_local_host(host) {
            let token = req.uri().query().and_then(token_from_query);
            let mut raw = parse_preview_path(req.uri().path(), token.as_deref())?;
            // Path mode drops the /preview prefix but keeps the query.
            if let Some(query) = req.uri().query() {
                raw.forward_path = format!("{}?{query}", raw.forward_path);
            }
            (raw, "http")
        } else {
            if looks_like_preview_host(host) {
                log_security_event(
                    "MALFORMED_SUBDOMAIN_ATTEMPT",
                    serde_json::json!({ "host": host }),
                    Severity::Medium,
                );
            }
            return None;
        };

        validate_target(host, raw, proto)
    }

    async fn forward(
        &self,
        public_host: &str,
        target: Target,
        req: Request,
    ) -> anyhow::Result<Response> {
        let Some(origin) = self.resolver.resolve(&target.sandbox_id).await? else {
            info!(sandbox_id = %target.sandbox_id, "unknown sandbox");
            return Ok((StatusCode::NOT_FOUND, "sandbox not found").into_response());
        };

        let forward_url = join_origin(&origin, &target.forward_path)?;
        let original_url = format!("{}://{public_host}{}", target.proto, original_path(&req));

        if wants_websocket_upgrade(req.headers()) {
            return self
                .forward_websocket(public_host, &target, &forward_url, original_url, req)
                .await;
        }

        let mut extra = HeaderMap::new();
        insert_header(&mut extra, PROXY_PORT_HEADER, &target.port.to_string());
        insert_header(&mut extra, PROXY_TOKEN_HEADER, &target.token);
        insert_header(&mut extra, "x-original-url", &original_url);
        insert_header(&mut extra, "x-forwarded-host", public_host);
        insert_header(&mut extra, "x-forwarded-proto", target.proto);
        Ok(self.proxy.forward_to(&forward_url, extra, req).await)
    }

    async fn forward_websocket(
        &self,
        public_host: &str,
        target: &Target,
        forward_url: &str,
        original_url: String,
        req: Request,
    ) -> anyhow::Result<Response> {
        let ws_url = match forward_url.split_once("://") {
            Some(("https", rest)) => format!("wss://{rest}"),
            Some((_, rest)) => format!("ws://{rest}"),
            None => anyhow::bail!("malformed forward url"),
        };
        let mut upstream_req = axum::http::Request::builder().uri(ws_url.as_str());
        if let Some(headers) = upstream_req.headers_mut() {
            for (name, value) in req.headers() {
                if is_hop_by_hop(name)
                    || name == header::HOST
                    || name.as_str().starts_with("sec-websocket-")
                {
                    continue;
                }
                headers.insert(name.clone(), value.clone());
            }
            insert_header(headers, PROXY_PORT_HEADER, &target.port.to_string());
            insert_header(headers, PROXY_TOKEN_HEADER, &target.token);
            insert_header(headers, "x-original-url", &original_url);
            insert_header(headers, "x-forwarded-host", public_host);
            insert_header(headers, "x-forwarded-proto", target.proto);
        }
        let upstream_req = upstream_req.body(())?;

        let (mut parts, _body) = req.into_parts();
        match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => Ok(upgrade
                .on_upgrade(move |socket| relay_websocket_request(socket, upstream_req))
                .into_response()),
            Err(rejection) => Ok(rejection.into_response()),
        }
    }
}

fn validate_target(host: &str, raw: RawTarget, proto: &'static str) -> Option<Target> {
    let port = match raw.port_raw.parse::<u16>() {
        Ok(port) => port,
        Err(_) => {
            log_security_event(
                "INVALID_PORT_IN_SUBDOMAIN",
                serde_json::json!({ "host": host, "port": raw.port_raw }),
                Severity::High,
            );
            return None;
        },
    };
    if port != CONTROL_PLANE_PORT && !validate_port(port) {
        log_security_event(
            "INVALID_PORT_IN_SUBDOMAIN",
            serde_json::json!({ "host": host, "port": port }),
            Severity::High,
        );
        return None;
    }
    if raw.sandbox_id.len() > SANDBOX_ID_MAX_LEN {
        log_security_event(
            "SANDBOX_ID_LENGTH_VIOLATION",
            serde_json::json!({ "host": host, "length": raw.sandbox_id.len() }),
            Severity::Medium,
        );
        return None;
    }
    if sanitize_sandbox_id(&raw.sandbox_id).is_err() {
        log_security_event(
            "INVALID_SANDBOX_ID_IN_SUBDOMAIN",
            serde_json::json!({ "host": host }),
            Severity::High,
        );
        return None;
    }
    Some(Target {
        port,
        sandbox_id: raw.sandbox_id,
        token: raw.token.unwrap_or_default(),
        forward_path: raw.forward_path,
        proto,
    })
}

fn request_host(req: &Request) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
}

fn original_path(req: &Request) -> String {
    req.uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}

fn join_origin(origin: &Url, path_and_query: &str) -> anyhow::Result<String> {
    let mut base = origin.as_str().trim_end_matches('/').to_string();
    if !path_and_query.starts_with('/') {
        base.push('/');
    }
    base.push_str(path_and_query);
    Ok(base)
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

// ── Serving ─────────────────────────────────────────────────────────────────

async fn handle(State(edge): State<Arc<EdgeRouter>>, req: Request) -> Response {
    match edge.proxy_to_sandbox(req).await {
        Some(response) => response,
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

/// Build the edge app: every request goes through the sandbox router.
pub fn edge_app(edge: Arc<EdgeRouter>) -> Router {
    Router::new().fallback(handle).with_state(edge)
}

/// Bind and serve the edge until ctrl-c/SIGTERM.
pub async fn serve(cfg: warden_config::EdgeConfig) -> anyhow::Result<()> {
    let resolver = Arc::new(crate::resolver::TemplateResolver::new(
        cfg.sandbox_origin_template.clone(),
    ));
    let edge = Arc::new(EdgeRouter::new(resolver));
    let listener = tokio::net::TcpListener::bind((cfg.bind.as_str(), cfg.port)).await?;
    info!(addr = %listener.local_addr()?, domain = %cfg.domain, "edge router listening");
    axum::serve(listener, edge_app(edge)).await?;
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use {
        async_trait::async_trait,
        axum::body::Body,
    };

    struct FixedResolver(Option<String>);

    #[async_trait]
    impl SandboxResolver for FixedResolver {
        async fn resolve(&self, _sandbox_id: &str) -> anyhow::Result<Option<Url>> {
            Ok(self.0.as_ref().map(|u| Url::parse(u).unwrap()))
        }
    }

    fn request(host: &str, path: &str) -> Request {
        Request::builder()
            .uri(path)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn unrelated_host_is_not_mine() {
        let edge = EdgeRouter::new(Arc::new(FixedResolver(None)));
        let resp = edge
            .proxy_to_sandbox(request("not-a-sandbox.example.com", "/"))
            .await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn reserved_port_is_not_mine() {
        let edge = EdgeRouter::new(Arc::new(FixedResolver(None)));
        // Port 22 is in the reserved set.
        let resp = edge
            .proxy_to_sandbox(request("22-sb-abcd1234efgh5678.example.com", "/"))
            .await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn port_overflow_is_not_mine() {
        let edge = EdgeRouter::new(Arc::new(FixedResolver(None)));
        let resp = edge
            .proxy_to_sandbox(request("99999-sb-abcd1234efgh5678.example.com", "/"))
            .await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn oversized_sandbox_id_is_not_mine() {
        let edge = EdgeRouter::new(Arc::new(FixedResolver(None)));
        let long_id = "a".repeat(64);
        let host = format!("8080-{long_id}-abcd1234efgh5678.example.com");
        let resp = edge.proxy_to_sandbox(request(&host, "/")).await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn unknown_sandbox_is_404() {
        let edge = EdgeRouter::new(Arc::new(FixedResolver(None)));
        let resp = edge
            .proxy_to_sandbox(request("8080-sb-abcd1234efgh5678.example.com", "/"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn valid_target_forwards_with_proxy_headers() {
        // Stand-in sandbox that echoes the proxy headers it received.
        let app = Router::new().fallback(
            |headers: HeaderMap, uri: axum::http::Uri| async move {
                axum::Json(serde_json::json!({
                    "port": headers.get("x-warden-proxy-port").and_then(|v| v.to_str().ok()),
                    "token": headers.get("x-warden-proxy-token").and_then(|v| v.to_str().ok()),
                    "proto": headers.get("x-forwarded-proto").and_then(|v| v.to_str().ok()),
                    "uri": uri.to_string(),
                }))
            },
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let edge = EdgeRouter::new(Arc::new(FixedResolver(Some(origin))));
        let resp = edge
            .proxy_to_sandbox(request(
                "8080-sb-abcd1234efgh5678.example.com",
                "/app/x?q=1",
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["port"], "8080");
        assert_eq!(v["token"], "abcd1234efgh5678");
        assert_eq!(v["proto"], "https");
        assert_eq!(v["uri"], "/app/x?q=1");
    }

    #[tokio::test]
    async fn preview_path_mode_strips_prefix() {
        let app = Router::new().fallback(|uri: axum::http::Uri, headers: HeaderMap| async move {
            axum::Json(serde_json::json!({
                "uri": uri.to_string(),
                "token": headers.get("x-warden-proxy-token").and_then(|v| v.to_str().ok()),
            }))
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let edge = EdgeRouter::new(Arc::new(FixedResolver(Some(origin))));
        let resp = edge
            .proxy_to_sandbox(request(
                "localhost:8787",
                "/preview/8080/sb/app?token=abcd1234efgh5678",
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["uri"], "/app?token=abcd1234efgh5678");
        assert_eq!(v["token"], "abcd1234efgh5678");
    }
}
