//! The edge router.
//!
//! Parses sandbox identity and target port out of public hostnames (or
//! `/preview/...` paths on localhost), runs the validation chain, and
//! forwards authorized requests to the right sandbox's control plane. The
//! edge owns nothing mutable; it is a pure forwarder, and token checking
//! happens inside the sandbox it forwards to.

pub mod parse;
pub mod resolver;
pub mod router;

pub use {
    parse::{RawTarget, parse_host, parse_preview_path},
    resolver::{SandboxResolver, TemplateResolver},
    router::{EdgeRouter, edge_app, serve},
};
