//! Directory snapshots to and from S3-compatible object storage.
//!
//! `create` streams `tar | zstd` into a presigned PUT; `apply` streams a
//! presigned GET through `zstd -d | tar -x` into a temp directory and then
//! atomically replaces the target. Nothing is ever held in memory beyond
//! pipe-sized chunks.

pub mod engine;
pub mod presign;

pub use {
    engine::{SnapshotEngine, clean_orphans},
    presign::{PresignError, presign_url},
};
