//! Input validation and token generation for the sandbox boundary.
//!
//! Everything that crosses from a hostname, path segment, or request body into
//! an identifier, port, or capability token goes through this module.

use rand::Rng;
use thiserror::Error;

/// Maximum sandbox-id length. Sandbox ids travel as DNS subdomain labels.
pub const SANDBOX_ID_MAX_LEN: usize = 63;

/// Length of a port access token.
pub const TOKEN_LEN: usize = 16;

const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789-_";

/// Ports that can never be exposed: well-known service ports plus the
/// control-plane port 3000.
pub const RESERVED_PORTS: [u16; 8] = [22, 25, 53, 80, 443, 3000, 3306, 5432];

/// Lowest user-exposable port (everything below is privileged).
pub const MIN_EXPOSABLE_PORT: u16 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidSandboxId {
    #[error("sandbox id is empty")]
    Empty,
    #[error("sandbox id exceeds {SANDBOX_ID_MAX_LEN} characters")]
    TooLong,
    #[error("sandbox id contains characters outside [A-Za-z0-9_-]")]
    BadCharacter,
}

/// Validate a sandbox id, returning it unchanged on success.
pub fn sanitize_sandbox_id(id: &str) -> Result<&str, InvalidSandboxId> {
    if id.is_empty() {
        return Err(InvalidSandboxId::Empty);
    }
    if id.len() > SANDBOX_ID_MAX_LEN {
        return Err(InvalidSandboxId::TooLong);
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(InvalidSandboxId::BadCharacter);
    }
    Ok(id)
}

/// True iff `port` may be exposed: within `[1024, 65535]` and not reserved.
pub fn validate_port(port: u16) -> bool {
    port >= MIN_EXPOSABLE_PORT && !RESERVED_PORTS.contains(&port)
}

/// True iff `token` has the exact shape of a generated port token:
/// 16 characters of `[a-z0-9_-]`.
pub fn is_valid_token(token: &str) -> bool {
    token.len() == TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
}

/// Generate a 16-character port access token from a CSPRNG.
pub fn generate_token() -> String {
    let mut rng = rand::rng();
    (0..TOKEN_LEN)
        .map(|_| TOKEN_ALPHABET[rng.random_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_id_length_boundaries() {
        assert_eq!(
            sanitize_sandbox_id(""),
            Err(InvalidSandboxId::Empty),
            "length 0"
        );
        assert!(sanitize_sandbox_id("a").is_ok(), "length 1");
        let max = "a".repeat(63);
        assert!(sanitize_sandbox_id(&max).is_ok(), "length 63");
        let over = "a".repeat(64);
        assert_eq!(
            sanitize_sandbox_id(&over),
            Err(InvalidSandboxId::TooLong),
            "length 64"
        );
    }

    #[test]
    fn sandbox_id_character_set() {
        assert!(sanitize_sandbox_id("abc-DEF_123").is_ok());
        assert_eq!(
            sanitize_sandbox_id("has.dot"),
            Err(InvalidSandboxId::BadCharacter)
        );
        assert_eq!(
            sanitize_sandbox_id("has space"),
            Err(InvalidSandboxId::BadCharacter)
        );
        assert_eq!(
            sanitize_sandbox_id("has/slash"),
            Err(InvalidSandboxId::BadCharacter)
        );
        assert_eq!(
            sanitize_sandbox_id("$(whoami)"),
            Err(InvalidSandboxId::BadCharacter)
        );
    }

    #[test]
    fn port_boundaries() {
        assert!(!validate_port(1023));
        assert!(validate_port(1024));
        assert!(!validate_port(3000));
        assert!(validate_port(65535));
        // 65536 does not fit in a u16; the type enforces the upper bound.
    }

    #[test]
    fn reserved_ports_rejected() {
        for p in RESERVED_PORTS {
            assert!(!validate_port(p), "port {p} must be reserved");
        }
        assert!(validate_port(8080));
        assert!(validate_port(5433));
    }

    #[test]
    fn generated_tokens_are_well_formed() {
        for _ in 0..64 {
            let token = generate_token();
            assert_eq!(token.len(), TOKEN_LEN);
            assert!(is_valid_token(&token), "bad token: {token}");
        }
    }

    #[test]
    fn token_shape_validation() {
        assert!(is_valid_token("abcd1234efgh5678"));
        assert!(is_valid_token("a-b_c-d_e-f_g-h_"));
        assert!(!is_valid_token("short"));
        assert!(!is_valid_token("UPPERCASE1234567"));
        assert!(!is_valid_token("abcd1234efgh567!"));
        assert!(!is_valid_token("abcd1234efgh56789"));
    }

    #[test]
    fn tokens_are_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
    }
}
