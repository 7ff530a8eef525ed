//! Security primitives shared by the control plane, edge, and bridge.

pub mod events;
pub mod security;

pub use events::{Severity, log_security_event, redact_url_credentials};
pub use security::{generate_token, is_valid_token, sanitize_sandbox_id, validate_port};
