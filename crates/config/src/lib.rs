//! Configuration loading.
//!
//! One file, `warden.toml`, searched project-local first and then under
//! `~/.config/warden/`. `${VAR}` references anywhere in the file expand from
//! the process environment before parsing, which is how secrets like the
//! bridge API key stay out of the config on disk.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{config_dir, data_dir, discover_and_load, load_config},
    schema::{
        BridgeConfig, EdgeConfig, FilesConfig, LimitsConfig, PortsConfig, SandboxConfig,
        SnapshotsConfig, WardenConfig,
    },
};
