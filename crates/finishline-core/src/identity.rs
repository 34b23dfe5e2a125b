//! Device identity management
//!
//! Every device has two identifiers:
//!
//! - a **device id**: a UUID generated on first run and persisted in the data
//!   directory. It is recorded in the history store as the writer of saved
//!   assignments and as the subject of last-seen heartbeats.
//! - a **session id** (the "message source id"): a short random string created
//!   on every process start. It tags every outbound message, breaks ties when
//!   two devices claim the same token, and lets a device recognise its own
//!   broadcasts echoed back by the relay.
//!
//! Neither identifier is a credential.

use anyhow::{Context, Result};
use rand::Rng;
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

use crate::config::Config;

/// Length of a session id
pub const SESSION_ID_LEN: usize = 6;

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Identity manager for finishline
///
/// Handles checking initialization state and loading the device id.
pub struct Identity {
    config: Config,
}

/// Result of initialization
#[derive(Debug)]
pub struct InitResult {
    /// The persisted device id
    pub device_id: String,
    /// Whether the id was generated by this call
    pub is_new: bool,
}

/// Identifiers a running device attaches to its traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    /// Stable per-device identifier
    pub device_id: String,
    /// Per-process random identifier used as the origin id of messages
    pub session_id: String,
}

impl SessionIdentity {
    /// Create a session for the given device with a fresh session id
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            session_id: random_base36(SESSION_ID_LEN),
        }
    }

    /// Create a session with an explicit session id (tests and replays)
    pub fn with_session_id(device_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl Identity {
    /// Create a new identity manager with default configuration
    pub fn new() -> Result<Self> {
        let config = Config::load().context("Failed to load configuration")?;
        Ok(Self::with_config(config))
    }

    /// Create a new identity manager with specific configuration
    pub fn with_config(config: Config) -> Self {
        Self { config }
    }

    /// Check if a device id has been generated
    pub fn is_initialized(&self) -> bool {
        self.config.device_id_path().exists()
    }

    /// Get the data directory path (for display purposes)
    pub fn data_dir(&self) -> &PathBuf {
        &self.config.data_dir
    }

    /// Generate and persist the device id if none exists yet
    pub fn initialize(&self) -> Result<InitResult> {
        if let Some(device_id) = self.load_device_id()? {
            return Ok(InitResult {
                device_id,
                is_new: false,
            });
        }

        let device_id = Uuid::new_v4().to_string();
        let path = self.config.device_id_path();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        fs::write(&path, &device_id)
            .with_context(|| format!("Failed to save device id to {:?}", path))?;

        tracing::info!(device_id = %device_id, "Generated new device id");

        Ok(InitResult {
            device_id,
            is_new: true,
        })
    }

    /// Load the persisted device id, if any
    pub fn load_device_id(&self) -> Result<Option<String>> {
        let path = self.config.device_id_path();
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read device id from {:?}", path))?;
        let device_id = content.trim();

        if device_id.is_empty() {
            return Ok(None);
        }
        Ok(Some(device_id.to_string()))
    }

    /// Get the device id, generating it on first use
    pub fn device_id(&self) -> Result<String> {
        Ok(self.initialize()?.device_id)
    }

    /// Start a session for this device
    pub fn session(&self) -> Result<SessionIdentity> {
        Ok(SessionIdentity::new(self.device_id()?))
    }
}

/// Random lowercase base-36 string of the given length
pub fn random_base36(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(temp_dir: &TempDir) -> Config {
        Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Config::default()
        }
    }

    #[test]
    fn test_not_initialized_initially() {
        let temp_dir = TempDir::new().unwrap();
        let identity = Identity::with_config(test_config(&temp_dir));

        assert!(!identity.is_initialized());
        assert!(identity.load_device_id().unwrap().is_none());
    }

    #[test]
    fn test_initialize_creates_device_id() {
        let temp_dir = TempDir::new().unwrap();
        let identity = Identity::with_config(test_config(&temp_dir));

        let result = identity.initialize().unwrap();
        assert!(result.is_new);
        assert!(Uuid::parse_str(&result.device_id).is_ok());
        assert!(identity.is_initialized());
    }

    #[test]
    fn test_device_id_persists() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        let first = Identity::with_config(config.clone()).initialize().unwrap();

        // Simulates a restart
        let second = Identity::with_config(config).initialize().unwrap();
        assert!(!second.is_new);
        assert_eq!(first.device_id, second.device_id);
    }

    #[test]
    fn test_sessions_share_device_but_not_session_id() {
        let temp_dir = TempDir::new().unwrap();
        let identity = Identity::with_config(test_config(&temp_dir));

        let a = identity.session().unwrap();
        let b = identity.session().unwrap();

        assert_eq!(a.device_id, b.device_id);
        assert_eq!(a.session_id.len(), SESSION_ID_LEN);
        assert!(a
            .session_id
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }
}
