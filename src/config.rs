use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::forward::{ForwardOptions, SessionRegistry};

/// Settings loaded from `config.toml`. Every key is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KpfConfig {
    /// kubeconfig context to use instead of the current one.
    pub context: Option<String>,
    /// Namespace used when a tool call does not name one.
    pub namespace: Option<String>,
    /// Address local listeners bind to.
    pub bind_address: IpAddr,
    pub tunnel_timeout_ms: u64,
    pub drain_grace_ms: u64,
    /// Open one tunnel while starting a session so failures show up early.
    pub preflight: bool,
    pub max_sessions: usize,
}

impl Default for KpfConfig {
    fn default() -> Self {
        Self {
            context: None,
            namespace: None,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            tunnel_timeout_ms: 10_000,
            drain_grace_ms: 3_000,
            preflight: true,
            max_sessions: SessionRegistry::DEFAULT_MAX_SESSIONS,
        }
    }
}

impl KpfConfig {
    /// Load config from a TOML file path. Returns None if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate(path)?;
        Ok(Some(config))
    }

    /// Load from `path`, falling back to defaults when it is absent.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::load(path)?.unwrap_or_default())
    }

    fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        if self.tunnel_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                path.to_path_buf(),
                "tunnel_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::Invalid(
                path.to_path_buf(),
                "max_sessions must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn forward_options(&self) -> ForwardOptions {
        ForwardOptions {
            bind_address: self.bind_address,
            tunnel_timeout: Duration::from_millis(self.tunnel_timeout_ms),
            drain_grace: Duration::from_millis(self.drain_grace_ms),
            preflight: self.preflight,
            max_sessions: self.max_sessions,
        }
    }
}

/// `<config dir>/kpf/config.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("kpf").join("config.toml"))
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(PathBuf, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(path, reason) => {
                write!(f, "Invalid config {}: {}", path.display(), reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
