//! Exposed-port registry and TCP readiness watching.
//!
//! A registry record `(port, token)` is the sole capability for reaching a
//! user port through the edge. Records persist across control-plane restarts
//! via the sandbox KV store.

pub mod registry;
pub mod watch;

pub use registry::{PortError, PortRegistry};
pub use watch::watch_port;
