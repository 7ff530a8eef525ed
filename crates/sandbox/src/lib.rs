//! The in-container sandbox control plane.
//!
//! An axum server on port 3000 multiplexing command execution, background
//! processes, file I/O, git checkouts, port exposure, snapshots, and the
//! reverse proxy for edge-forwarded user-port traffic.

pub mod error;
pub mod exec_routes;
pub mod file_routes;
pub mod git_routes;
pub mod meta_routes;
pub mod port_routes;
pub mod process_routes;
pub mod proxy_gate;
pub mod server;
pub mod session;
pub mod snapshot_routes;
pub mod sse;
pub mod state;

pub use {
    error::{ApiError, ApiResult},
    server::{Sandbox, build_router},
    state::{AppState, SandboxState},
};

/// Wrap a payload in the success envelope.
pub(crate) fn ok<T: serde::Serialize>(
    payload: T,
) -> axum::Json<warden_protocol::OkEnvelope<T>> {
    axum::Json(warden_protocol::OkEnvelope::new(payload))
}
