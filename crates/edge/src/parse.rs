//! Preview-address parsing.
//!
//! Production requests address sandboxes by hostname:
//! `{port}-{sandboxId}-{token}.{domain}`. On localhost-style hosts the same
//! information travels in the path instead:
//! `/preview/{port}/{sandboxId}/{rest}` with `?token=`.

use {once_cell::sync::Lazy, regex::Regex};

#[allow(clippy::expect_used)]
static HOST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)-([A-Za-z0-9_-]+)-([a-z0-9_-]{16})\.(.+)$").expect("static regex")
});

/// Hosts that switch the edge into path-based preview parsing.
const LOCAL_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1", "[::1]", "0.0.0.0"];

/// A parsed preview address, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTarget {
    /// Digits as matched; may still overflow u16.
    pub port_raw: String,
    pub sandbox_id: String,
    /// Absent only in path mode without a `token` query parameter.
    pub token: Option<String>,
    /// Path to forward (path mode strips the `/preview/...` prefix).
    pub forward_path: String,
}

/// Parse a production preview hostname.
pub fn parse_host(host: &str, path: &str) -> Option<RawTarget> {
    let captures = HOST_RE.captures(host)?;
    Some(RawTarget {
        port_raw: captures[1].to_string(),
        sandbox_id: captures[2].to_string(),
        token: Some(captures[3].to_string()),
        forward_path: path.to_string(),
    })
}

/// True when a non-matching host still looks like a preview-host attempt and
/// deserves a security event (as opposed to ordinary unrelated traffic).
pub fn looks_like_preview_host(host: &str) -> bool {
    let Some(label) = host.split('.').next() else {
        return false;
    };
    label.starts_with(|c: char| c.is_ascii_digit()) && label.matches('-').count() >= 2
}

/// True for localhost-style hosts (optionally `host:port`).
pub fn is_local_host(host: &str) -> bool {
    if LOCAL_HOSTS.contains(&host) {
        return true;
    }
    // Bracketed IPv6 with a port: `[::1]:8787`.
    if let Some(inner) = host.strip_prefix('[') {
        if let Some((addr, _port)) = inner.split_once("]:") {
            return LOCAL_HOSTS.contains(&format!("[{addr}]").as_str());
        }
        return false;
    }
    // `host:port` with a numeric port.
    if let Some((bare, port)) = host.rsplit_once(':')
        && !port.is_empty()
        && port.bytes().all(|b| b.is_ascii_digit())
    {
        return LOCAL_HOSTS.contains(&bare);
    }
    false
}

/// Parse a development preview path: `/preview/{port}/{sandboxId}/{rest}`.
pub fn parse_preview_path(path: &str, token_query: Option<&str>) -> Option<RawTarget> {
    let rest = path.strip_prefix("/preview/")?;
    let mut segments = rest.splitn(3, '/');
    let port_raw = segments.next()?.to_string();
    let sandbox_id = segments.next()?.to_string();
    if port_raw.is_empty() || sandbox_id.is_empty() {
        return None;
    }
    let forward_path = match segments.next() {
        Some(tail) => format!("/{tail}"),
        None => "/".to_string(),
    };
    Some(RawTarget {
        port_raw,
        sandbox_id,
        token: token_query.map(str::to_string),
        forward_path,
    })
}

/// Extract `token` from a raw query string.
pub fn token_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == "token").then(|| v.to_string())
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_host_parses() {
        let t = parse_host("8080-my-sb-abcd1234efgh5678.preview.example.com", "/x?q=1").unwrap();
        assert_eq!(t.port_raw, "8080");
        assert_eq!(t.sandbox_id, "my-sb");
        assert_eq!(t.token.as_deref(), Some("abcd1234efgh5678"));
        assert_eq!(t.forward_path, "/x?q=1");
    }

    #[test]
    fn sandbox_id_may_contain_dashes() {
        let t = parse_host("3000-a-b-c-abcd1234efgh5678.example.com", "/").unwrap();
        assert_eq!(t.port_raw, "3000");
        assert_eq!(t.sandbox_id, "a-b-c");
    }

    #[test]
    fn non_preview_hosts_do_not_parse() {
        assert!(parse_host("not-a-sandbox.example.com", "/").is_none());
        assert!(parse_host("example.com", "/").is_none());
        assert!(parse_host("8080-sb-SHORTTOKEN.example.com", "/").is_none());
        assert!(parse_host("8080-sb-ABCD1234EFGH5678.example.com", "/").is_none(), "uppercase token");
    }

    #[test]
    fn partial_matches_are_flagged_for_events() {
        assert!(looks_like_preview_host("8080-sb-short.example.com"));
        assert!(looks_like_preview_host("99999-sb-abcd1234efgh5678.x.com"));
        assert!(!looks_like_preview_host("not-a-sandbox.example.com"));
        assert!(!looks_like_preview_host("www.example.com"));
    }

    #[test]
    fn local_hosts_are_recognized() {
        for h in [
            "localhost",
            "localhost:8787",
            "127.0.0.1",
            "127.0.0.1:3000",
            "[::1]:8787",
            "0.0.0.0",
        ] {
            assert!(is_local_host(h), "{h} should be local");
        }
        assert!(!is_local_host("example.com"));
        assert!(!is_local_host("preview.example.com:443"));
    }

    #[test]
    fn preview_path_parses_with_token_query() {
        let t = parse_preview_path("/preview/8080/my-sb/app/x", Some("abcd1234efgh5678")).unwrap();
        assert_eq!(t.port_raw, "8080");
        assert_eq!(t.sandbox_id, "my-sb");
        assert_eq!(t.token.as_deref(), Some("abcd1234efgh5678"));
        assert_eq!(t.forward_path, "/app/x");
    }

    #[test]
    fn preview_path_without_rest_forwards_root() {
        let t = parse_preview_path("/preview/8080/sb", None).unwrap();
        assert_eq!(t.forward_path, "/");
        assert!(t.token.is_none());
    }

    #[test]
    fn non_preview_paths_do_not_parse() {
        assert!(parse_preview_path("/api/ping", None).is_none());
        assert!(parse_preview_path("/preview/", None).is_none());
        assert!(parse_preview_path("/preview/8080", None).is_none());
    }

    #[test]
    fn token_query_extraction() {
        assert_eq!(
            token_from_query("a=1&token=abcd1234efgh5678&b=2").as_deref(),
            Some("abcd1234efgh5678")
        );
        assert!(token_from_query("a=1&b=2").is_none());
    }
}
