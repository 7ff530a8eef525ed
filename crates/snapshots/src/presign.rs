//! AWS Signature V4 query presigning for S3-compatible stores.
//!
//! Snapshots stream to and from R2 (or any S3-compatible endpoint) through
//! presigned URLs, so the upload/download legs carry no credential headers.
//! Uses path-style addressing (`{endpoint}/{bucket}/{key}`) and
//! `UNSIGNED-PAYLOAD`, which is what streaming bodies of unknown length
//! require.

use {
    chrono::{DateTime, Utc},
    hmac::{Hmac, Mac},
    sha2::{Digest, Sha256},
    thiserror::Error,
};

use warden_protocol::R2Config;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const DEFAULT_REGION: &str = "auto";

#[derive(Debug, Error)]
pub enum PresignError {
    #[error("invalid endpoint '{0}': {1}")]
    InvalidEndpoint(String, String),
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        // HMAC-SHA256 accepts keys of any length.
        Err(_) => return Vec::new(),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// RFC 3986 encoding of one path segment (`/` separators stay literal).
fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Presign `method` on `{endpoint}/{bucket}/{key}`, valid for `expires` seconds.
pub fn presign_url(
    cfg: &R2Config,
    method: &str,
    key: &str,
    expires_secs: u64,
    now: DateTime<Utc>,
) -> Result<String, PresignError> {
    let endpoint = url::Url::parse(cfg.endpoint.trim_end_matches('/'))
        .map_err(|e| PresignError::InvalidEndpoint(cfg.endpoint.clone(), e.to_string()))?;
    let host = match (endpoint.host_str(), endpoint.port()) {
        (Some(h), Some(p)) => format!("{h}:{p}"),
        (Some(h), None) => h.to_string(),
        (None, _) => {
            return Err(PresignError::InvalidEndpoint(
                cfg.endpoint.clone(),
                "missing host".into(),
            ));
        },
    };

    let region = cfg.region.as_deref().unwrap_or(DEFAULT_REGION);
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let datestamp = now.format("%Y%m%d").to_string();
    let scope = format!("{datestamp}/{region}/s3/aws4_request");
    let credential = format!("{}/{scope}", cfg.access_key_id);

    let canonical_path = format!("/{}/{}", encode_path(&cfg.bucket), encode_path(key));

    // Query parameters, sorted by name (they happen to sort lexically as
    // written here).
    let query_pairs = [
        ("X-Amz-Algorithm", ALGORITHM.to_string()),
        ("X-Amz-Credential", credential),
        ("X-Amz-Date", amz_date.clone()),
        ("X-Amz-Expires", expires_secs.to_string()),
        ("X-Amz-SignedHeaders", "host".to_string()),
    ];
    let canonical_query = query_pairs
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_request = format!(
        "{method}\n{canonical_path}\n{canonical_query}\nhost:{host}\n\nhost\nUNSIGNED-PAYLOAD"
    );
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let k_date = hmac_sha256(
        format!("AWS4{}", cfg.secret_access_key).as_bytes(),
        datestamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, b"s3");
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

    Ok(format!(
        "{}://{host}{canonical_path}?{canonical_query}&X-Amz-Signature={signature}",
        endpoint.scheme()
    ))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cfg() -> R2Config {
        R2Config {
            bucket: "snapshots-bucket".into(),
            endpoint: "https://account.r2.cloudflarestorage.com".into(),
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "secretkey".into(),
            region: None,
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn url_shape_and_query_params() {
        let url = presign_url(&cfg(), "PUT", "snapshots/abc123.tar.zst", 3600, fixed_now()).unwrap();
        assert!(url.starts_with(
            "https://account.r2.cloudflarestorage.com/snapshots-bucket/snapshots/abc123.tar.zst?"
        ));
        assert!(url.contains("X-Amz-Algorithm=AWS4-HMAC-SHA256"));
        assert!(url.contains("X-Amz-Date=20240501T120000Z"));
        assert!(url.contains("X-Amz-Expires=3600"));
        assert!(url.contains("X-Amz-SignedHeaders=host"));
        assert!(url.contains("X-Amz-Signature="));
        // Scope region defaults to "auto" for R2.
        assert!(url.contains(&urlencoding::encode("AKIDEXAMPLE/20240501/auto/s3/aws4_request").into_owned()));
    }

    #[test]
    fn signature_is_deterministic_and_method_sensitive() {
        let put = presign_url(&cfg(), "PUT", "k", 600, fixed_now()).unwrap();
        let put2 = presign_url(&cfg(), "PUT", "k", 600, fixed_now()).unwrap();
        let get = presign_url(&cfg(), "GET", "k", 600, fixed_now()).unwrap();
        assert_eq!(put, put2);
        assert_ne!(put, get, "method must change the signature");
    }

    #[test]
    fn secret_never_appears_in_url() {
        let url = presign_url(&cfg(), "PUT", "k", 600, fixed_now()).unwrap();
        assert!(!url.contains("secretkey"));
    }

    #[test]
    fn custom_region_and_port_are_honored() {
        let mut cfg = cfg();
        cfg.endpoint = "http://127.0.0.1:9000".into();
        cfg.region = Some("us-east-1".into());
        let url = presign_url(&cfg, "GET", "a/b.tar.zst", 600, fixed_now()).unwrap();
        assert!(url.starts_with("http://127.0.0.1:9000/snapshots-bucket/a/b.tar.zst?"));
        assert!(url.contains(&urlencoding::encode("20240501/us-east-1/s3").into_owned()));
    }

    #[test]
    fn bad_endpoint_is_rejected() {
        let mut cfg = cfg();
        cfg.endpoint = "not a url".into();
        assert!(matches!(
            presign_url(&cfg, "GET", "k", 600, fixed_now()),
            Err(PresignError::InvalidEndpoint(..))
        ));
    }

    #[test]
    fn key_segments_are_encoded() {
        let url = presign_url(&cfg(), "GET", "snapshots/id with space.tar.zst", 600, fixed_now())
            .unwrap();
        assert!(url.contains("id%20with%20space.tar.zst"));
    }
}
