//! Sweeper configuration management.
//!
//! Configuration is stored as TOML at `$LANDFALL_CONFIG`, or by default:
//! - Linux: `~/.config/landfall/sweeper.toml`
//! - Windows: `%APPDATA%/landfall/sweeper.toml`

use std::path::{Path, PathBuf};

use landfall_transfer::UploadConfig;
use serde::{Deserialize, Serialize};

/// Environment variable overriding the config file location.
const CONFIG_ENV: &str = "LANDFALL_CONFIG";

/// Sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding session records.
    #[serde(default = "default_store_root")]
    pub store_root: PathBuf,

    /// Run one sweep right after startup instead of waiting a full interval.
    #[serde(default = "default_true")]
    pub sweep_on_start: bool,

    /// Upload limits and storage locations; must match the serving process.
    #[serde(default)]
    pub upload: UploadConfig,
}

fn default_store_root() -> PathBuf {
    PathBuf::from("/var/lib/landfall/sessions")
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_root: default_store_root(),
            sweep_on_start: default_true(),
            upload: UploadConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or writes and returns the defaults
    /// if the file does not exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Restrict permissions on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Returns the configuration file path.
pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return PathBuf::from(path);
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("landfall").join("sweeper.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("landfall")
            .join("sweeper.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.store_root, PathBuf::from("/var/lib/landfall/sessions"));
        assert!(config.sweep_on_start);
        assert_eq!(config.upload.session_ttl_secs, 86_400);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let toml_str = r#"
            store_root = "/srv/landfall/sessions"

            [upload]
            session_ttl_secs = 600
            scratch_root = "/srv/landfall/scratch"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.store_root, PathBuf::from("/srv/landfall/sessions"));
        assert_eq!(config.upload.session_ttl_secs, 600);
        assert_eq!(
            config.upload.scratch_root,
            PathBuf::from("/srv/landfall/scratch")
        );
        assert_eq!(config.upload.sweep_interval_secs, 300);
        assert!(config.sweep_on_start);
    }

    #[test]
    fn empty_toml_is_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.upload.max_sessions_per_owner, 8);
    }

    #[test]
    fn load_writes_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sweeper.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert!(config.sweep_on_start);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.store_root, config.store_root);
        assert_eq!(reloaded.upload.scratch_root, config.upload.scratch_root);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweeper.toml");
        std::fs::write(&path, "store_root = [").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
