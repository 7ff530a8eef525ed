//! Process supervision for the sandbox control plane.
//!
//! Three layers, bottom up:
//! - [`ring`] — lossy-at-head byte rings holding per-process stdout/stderr
//! - [`exec`] — foreground command execution with timeout and cancellation
//! - [`process`] — the background-process table: start, track, signal, reap

pub mod error;
pub mod exec;
pub mod process;
pub mod ring;
mod signal;
pub mod stream;

pub use {
    error::SupervisorError,
    exec::{ExecOpts, ExecOutcome, exec_command},
    process::{ProcessSupervisor, StartSpec, SupervisorConfig, exec_stream},
    ring::{LogBuffer, ReadChunk},
};
