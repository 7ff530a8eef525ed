//! Filesystem operations for the sandbox control plane.
//!
//! Every externally supplied path passes through one shared [`PathPolicy`]
//! before it touches the filesystem; the operations themselves are thin
//! `tokio::fs` wrappers that classify errors into the wire taxonomy.

pub mod error;
pub mod ops;
pub mod policy;

pub use {
    error::FileError,
    ops::{FileOps, StreamedRead},
    policy::PathPolicy,
};
