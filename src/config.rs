//! Agent configuration
//!
//! Loaded from a TOML file:
//! ```toml
//! [server]
//! host = "hawkbit.example:8080"
//! ssl = false
//! tenant_id = "DEFAULT"
//! target_name = "device-001"
//! auth_token = "..."
//!
//! [agent]
//! bundle_download_location = "/tmp/bundle.raucb"
//!
//! [device]
//! hw_revision = "2"
//! ```

use rauc_hawkbit_shared::defaults;
use serde::{Deserialize, Serialize};
use nix::unistd::{access, AccessFlags};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Connection to the hawkBit server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host and optional port, without scheme
    pub host: String,
    /// Use https
    pub ssl: bool,
    pub tenant_id: String,
    /// Controller id of this device
    pub target_name: String,
    /// Target security token
    pub auth_token: Option<String>,
    /// Timeout for JSON requests
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost:8080".into(),
            ssl: false,
            tenant_id: "DEFAULT".into(),
            target_name: "rauc-target".into(),
            auth_token: None,
            timeout_secs: defaults::REQUEST_TIMEOUT_SECS,
        }
    }
}

/// Behaviour of the update agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Where downloaded bundles are stored; the directory must exist
    pub bundle_download_location: PathBuf,
    /// Wait after a failed poll iteration
    pub poll_error_backoff_secs: u64,
    /// Download attempts before a checksum mismatch is terminal
    pub download_tries: u32,
    /// Range re-requests allowed within one download attempt
    pub max_resumes: u32,
    /// Cross-process install lock; in-process locking when unset
    pub lock_file: Option<PathBuf>,
    pub log_level: String,
    /// Command run after a successful installation, e.g. `["reboot"]`
    pub post_install_command: Option<Vec<String>>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            bundle_download_location: PathBuf::from("/tmp/bundle.raucb"),
            poll_error_backoff_secs: defaults::POLL_ERROR_BACKOFF_SECS,
            download_tries: defaults::DOWNLOAD_TRIES,
            max_resumes: defaults::MAX_RESUMES,
            lock_file: None,
            log_level: "info".into(),
            post_install_command: None,
        }
    }
}

impl AgentSettings {
    pub fn poll_error_backoff(&self) -> Duration {
        Duration::from_secs(self.poll_error_backoff_secs)
    }
}

/// Complete agent configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server: ServerConfig,
    pub agent: AgentSettings,
    /// Identification attributes sent as config data
    pub device: BTreeMap<String, String>,
}

impl AgentConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AgentConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check values the agent cannot run without
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::Invalid("server.host must not be empty".into()));
        }
        if self.server.target_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "server.target_name must not be empty".into(),
            ));
        }
        if self.agent.download_tries == 0 {
            return Err(ConfigError::Invalid(
                "agent.download_tries must be at least 1".into(),
            ));
        }
        if let Some(command) = &self.agent.post_install_command {
            if command.is_empty() {
                return Err(ConfigError::Invalid(
                    "agent.post_install_command must name a program".into(),
                ));
            }
        }
        validate_bundle_location(&self.agent.bundle_download_location)
    }
}

/// The bundle's directory must exist and be writable
pub fn validate_bundle_location(location: &Path) -> Result<(), ConfigError> {
    if location.file_name().is_none() {
        return Err(ConfigError::Invalid(format!(
            "Bundle location {} must name a file",
            location.display()
        )));
    }

    let dir = match location.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let metadata = std::fs::metadata(dir).map_err(|_| {
        ConfigError::Invalid(format!("Bundle directory {} must exist", dir.display()))
    })?;
    if !metadata.is_dir() {
        return Err(ConfigError::Invalid(format!(
            "Bundle directory {} is not a directory",
            dir.display()
        )));
    }
    // Checked against this process's credentials, not just the mode bits
    if let Err(errno) = access(dir, AccessFlags::W_OK) {
        return Err(ConfigError::Invalid(format!(
            "Bundle directory {} not writeable: {}",
            dir.display(),
            errno
        )));
    }
    Ok(())
}
