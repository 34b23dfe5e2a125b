//! Device configuration
//!
//! Values are layered: built-in defaults, then `config.toml` under the
//! platform config directory, then `FINISHLINE_*` environment variables.
//! The file location itself can be moved with `FINISHLINE_CONFIG`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "FINISHLINE";

/// Settings for one finish-line device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where the device id, event snapshots and history database live
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Relay WebSocket URL; the device works offline without one
    #[serde(default)]
    pub relay_url: Option<String>,

    /// SQLite history store, `{data_dir}/history.db` when unset
    #[serde(default)]
    pub store_path: Option<PathBuf>,

    /// Prefix for `event link`
    #[serde(default)]
    pub share_base_url: Option<String>,

    #[serde(default)]
    pub device_name: Option<String>,

    /// Debug log destination when FINISHLINE_LOG is set
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            relay_url: None,
            store_path: None,
            share_base_url: None,
            device_name: None,
            log_file: None,
        }
    }
}

/// Reads `FINISHLINE_{suffix}`. `Some(None)` means the variable is set but
/// empty, which clears an optional setting.
fn env_setting(suffix: &str) -> Option<Option<String>> {
    let value = std::env::var(format!("{}_{}", ENV_PREFIX, suffix)).ok()?;
    Some(Some(value).filter(|v| !v.is_empty()))
}

impl Config {
    /// Load from the default file location, then apply the environment
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load from `path`; a missing file yields defaults. The data directory
    /// is created if needed.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text)
                .with_context(|| format!("Invalid config file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("Cannot read {}", path.display()));
            }
        };

        config.apply_env_overrides();
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("Cannot create data directory {}", config.data_dir.display())
        })?;
        Ok(config)
    }

    /// Parse TOML text and apply the environment, without touching disk
    pub fn load_from_str(text: &str) -> Result<Self> {
        let mut config = Self::parse(text)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("Config is not valid TOML")
    }

    fn apply_env_overrides(&mut self) {
        if let Some(Some(dir)) = env_setting("DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = env_setting("RELAY_URL") {
            self.relay_url = url;
        }
        if let Some(path) = env_setting("STORE_PATH") {
            self.store_path = path.map(PathBuf::from);
        }
        if let Some(url) = env_setting("SHARE_URL") {
            self.share_base_url = url;
        }
    }

    /// Write the current values to the config file
    pub fn save(&self) -> Result<()> {
        let path = Self::config_file_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create {}", dir.display()))?;
        }

        let text = toml::to_string_pretty(self).context("Cannot encode config")?;
        std::fs::write(&path, text).with_context(|| format!("Cannot write {}", path.display()))
    }

    pub fn config_file_path() -> PathBuf {
        match env_setting("CONFIG") {
            Some(Some(path)) => PathBuf::from(path),
            _ => dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("finishline")
                .join("config.toml"),
        }
    }

    pub fn device_id_path(&self) -> PathBuf {
        self.data_dir.join("device_id")
    }

    /// One JSON snapshot per event lives here
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("events")
    }

    pub fn history_store_path(&self) -> PathBuf {
        match &self.store_path {
            Some(path) => path.clone(),
            None => self.data_dir.join("history.db"),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("finishline")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, MutexGuard};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "FINISHLINE_DATA_DIR",
        "FINISHLINE_RELAY_URL",
        "FINISHLINE_STORE_PATH",
        "FINISHLINE_SHARE_URL",
    ];

    /// Holds the env lock with all FINISHLINE_* variables cleared, and puts
    /// the previous values back on drop.
    struct CleanEnv {
        previous: Vec<(&'static str, Option<String>)>,
        _lock: MutexGuard<'static, ()>,
    }

    impl CleanEnv {
        fn acquire() -> Self {
            let lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let previous = VARS.iter().map(|&var| (var, env::var(var).ok())).collect();
            VARS.iter().for_each(|var| env::remove_var(var));
            Self {
                previous,
                _lock: lock,
            }
        }
    }

    impl Drop for CleanEnv {
        fn drop(&mut self) {
            for (var, value) in self.previous.drain(..) {
                match value {
                    Some(value) => env::set_var(var, value),
                    None => env::remove_var(var),
                }
            }
        }
    }

    #[test]
    fn test_defaults_are_offline() {
        let config = Config::default();
        assert!(config.relay_url.is_none());
        assert!(config.store_path.is_none());
        assert!(config.data_dir.ends_with("finishline"));
    }

    #[test]
    fn test_history_store_defaults_under_data_dir() {
        let config = Config {
            data_dir: PathBuf::from("/data/finishline"),
            ..Config::default()
        };
        assert!(config.device_id_path().ends_with("device_id"));
        assert!(config.snapshot_dir().ends_with("events"));
        assert_eq!(
            config.history_store_path(),
            PathBuf::from("/data/finishline/history.db")
        );

        let shared = Config {
            store_path: Some(PathBuf::from("/shared/history.db")),
            ..config
        };
        assert_eq!(
            shared.history_store_path(),
            PathBuf::from("/shared/history.db")
        );
    }

    #[test]
    fn test_env_sets_and_clears_relay() {
        let _env = CleanEnv::acquire();
        let mut config = Config {
            relay_url: Some("wss://from-file".to_string()),
            ..Config::default()
        };

        env::set_var("FINISHLINE_RELAY_URL", "ws://localhost:7070");
        config.apply_env_overrides();
        assert_eq!(config.relay_url.as_deref(), Some("ws://localhost:7070"));

        env::set_var("FINISHLINE_RELAY_URL", "");
        config.apply_env_overrides();
        assert!(config.relay_url.is_none());
    }

    #[test]
    fn test_empty_data_dir_is_ignored() {
        let _env = CleanEnv::acquire();
        let mut config = Config {
            data_dir: PathBuf::from("/kept"),
            ..Config::default()
        };

        env::set_var("FINISHLINE_DATA_DIR", "");
        config.apply_env_overrides();
        assert_eq!(config.data_dir, PathBuf::from("/kept"));

        env::set_var("FINISHLINE_DATA_DIR", "/tmp/finishline-test");
        config.apply_env_overrides();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/finishline-test"));
    }

    #[test]
    fn test_toml_text() {
        let _env = CleanEnv::acquire();
        let config = Config::load_from_str(
            r#"
            data_dir = "/custom/data"
            relay_url = "ws://relay.local"
            device_name = "Funnel 1"
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.relay_url.as_deref(), Some("ws://relay.local"));
        assert_eq!(config.device_name.as_deref(), Some("Funnel 1"));
        assert!(config.share_base_url.is_none());

        let written = toml::to_string_pretty(&config).unwrap();
        let reread: Config = toml::from_str(&written).unwrap();
        assert_eq!(reread.device_name, config.device_name);
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        let _env = CleanEnv::acquire();
        assert!(Config::load_from_str("relay_url = [").is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let _env = CleanEnv::acquire();
        let temp = tempfile::TempDir::new().unwrap();
        let data_dir = temp.path().join("data");
        env::set_var("FINISHLINE_DATA_DIR", &data_dir);

        let config = Config::load_from_path(&temp.path().join("absent.toml")).unwrap();
        assert!(config.relay_url.is_none());
        assert_eq!(config.data_dir, data_dir);
        assert!(data_dir.is_dir());
    }
}
