use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::WardenConfig};

const CONFIG_FILENAME: &str = "warden.toml";

/// Parse the config file at `path`, expanding `${VAR}` references first.
pub fn load_config(path: &Path) -> anyhow::Result<WardenConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    toml::from_str(&raw).map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))
}

/// Locate and load the config, falling back to defaults.
///
/// A project-local `./warden.toml` wins over the user-global copy in
/// `~/.config/warden/`; with neither present (the common case inside a
/// container) every knob takes its default.
pub fn discover_and_load() -> WardenConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    WardenConfig::default()
}

fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILENAME);
    if local.exists() {
        return Some(local);
    }
    if let Some(dir) = config_dir() {
        let p = dir.join(CONFIG_FILENAME);
        if p.exists() {
            return Some(p);
        }
    }
    None
}

/// Returns the user-global config directory (`~/.config/warden/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "warden").map(|d| d.config_dir().to_path_buf())
}

/// Returns the data directory used for persistent sandbox state.
///
/// Falls back to `/var/lib/warden` when no home directory exists, which is
/// the common case inside a container.
pub fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "warden")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("/var/lib/warden"))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_parses_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        std::fs::write(&path, "[sandbox]\nport = 3000\nworkspace_root = \"/w\"\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.sandbox.workspace_root, "/w");
    }

    #[test]
    fn load_config_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        std::fs::write(&path, "not [valid toml").unwrap();
        let err = load_config(&path).unwrap_err().to_string();
        assert!(err.contains("failed to parse"), "got: {err}");
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = load_config(Path::new("/nonexistent/warden.toml"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("failed to read"), "got: {err}");
    }
}
