//! TOML Configuration File Support
//!
//! Configuration for the relay, loaded from `~/.config/research-relay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Values are applied in this order, later sources winning:
//! 1. Default values
//! 2. TOML configuration file
//! 3. Environment variables
//! 4. CLI arguments (via [`ConfigOverrides`])
//!
//! # Example Configuration
//!
//! ```toml
//! [upstream]
//! agent_url = "http://localhost:8001"
//! stall_timeout_secs = 60
//! connect_timeout_secs = 10
//! max_consecutive_protocol_errors = 3
//!
//! [server]
//! bind_address = "127.0.0.1:8765"
//! max_connections = 100
//! outbound_queue_capacity = 256
//! client_send_grace_ms = 2000
//! max_message_size = 65536
//! max_query_length = 32768
//!
//! [storage]
//! backend = "sqlite"
//! sqlite_path = "/var/lib/research-relay/relay.db"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::{ConnectionSettings, DEFAULT_MAX_QUERY_LENGTH, DEFAULT_OUTBOUND_CAPACITY};
use crate::error::DEFAULT_MAX_CONSECUTIVE_PROTOCOL_ERRORS;
use crate::relay::{RelaySettings, DEFAULT_STALL_TIMEOUT};
use crate::upstream::DEFAULT_AGENT_URL;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Tracks where the configuration last changed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Command-line argument
    Cli,
    /// Environment variable
    Env,
    /// TOML configuration file
    File,
    /// Default value
    Default,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Structures
// =============================================================================

/// `[upstream]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamToml {
    /// Research agent base URL
    pub agent_url: Option<String>,
    /// Stall timeout in seconds
    pub stall_timeout_secs: Option<u64>,
    /// Connect timeout in seconds
    pub connect_timeout_secs: Option<u64>,
    /// Malformed lines tolerated in a row
    pub max_consecutive_protocol_errors: Option<u32>,
}

/// `[server]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Listen address
    pub bind_address: Option<String>,
    /// Connection cap
    pub max_connections: Option<usize>,
    /// Per-connection outbound queue capacity
    pub outbound_queue_capacity: Option<usize>,
    /// Grace period for a full outbound queue, in milliseconds
    pub client_send_grace_ms: Option<u64>,
    /// Largest accepted client message, in bytes
    pub max_message_size: Option<usize>,
    /// Longest accepted query, in characters
    pub max_query_length: Option<usize>,
}

/// `[storage]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageToml {
    /// `memory` or `sqlite`
    pub backend: Option<StorageBackend>,
    /// SQLite database file
    pub sqlite_path: Option<PathBuf>,
}

/// Root of the TOML file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Upstream agent settings
    pub upstream: UpstreamToml,
    /// Client-facing server settings
    pub server: ServerToml,
    /// Storage settings
    pub storage: StorageToml,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Persistence backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local, lost on restart
    #[default]
    Memory,
    /// SQLite file
    Sqlite,
}

impl FromStr for StorageBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(ConfigError::ValidationError(format!(
                "unknown storage backend {other:?} (expected memory or sqlite)"
            ))),
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Fully resolved relay configuration
#[derive(Clone, Debug)]
pub struct RelayConfigFile {
    /// Research agent base URL
    pub agent_url: String,
    /// Longest wait for the agent's response or next chunk
    pub stall_timeout: Duration,
    /// TCP connect timeout to the agent
    pub connect_timeout: Duration,
    /// Malformed lines tolerated in a row
    pub max_consecutive_protocol_errors: u32,

    /// Listen address
    pub bind_address: String,
    /// Connection cap
    pub max_connections: usize,
    /// Per-connection outbound queue capacity
    pub outbound_queue_capacity: usize,
    /// Grace period for a full outbound queue
    pub client_send_grace: Duration,
    /// Largest accepted client message, in bytes
    pub max_message_size: usize,
    /// Longest accepted query, in characters
    pub max_query_length: usize,

    /// Persistence backend
    pub storage: StorageBackend,
    /// SQLite database file
    pub sqlite_path: PathBuf,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for RelayConfigFile {
    fn default() -> Self {
        Self {
            agent_url: DEFAULT_AGENT_URL.to_string(),
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            connect_timeout: Duration::from_secs(10),
            max_consecutive_protocol_errors: DEFAULT_MAX_CONSECUTIVE_PROTOCOL_ERRORS,
            bind_address: "127.0.0.1:8765".to_string(),
            max_connections: 100,
            outbound_queue_capacity: DEFAULT_OUTBOUND_CAPACITY,
            client_send_grace: Duration::from_millis(2000),
            max_message_size: 64 * 1024,
            max_query_length: DEFAULT_MAX_QUERY_LENGTH,
            storage: StorageBackend::Memory,
            sqlite_path: default_sqlite_path(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfigFile {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Where the configuration last changed
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Settings for the stream relay
    #[must_use]
    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            stall_timeout: self.stall_timeout,
            max_consecutive_protocol_errors: self.max_consecutive_protocol_errors,
        }
    }

    /// Settings for each client connection
    #[must_use]
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            outbound_capacity: self.outbound_queue_capacity,
            send_grace: self.client_send_grace,
            max_query_length: self.max_query_length,
        }
    }

    /// Reject values the relay cannot run with
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = reqwest::Url::parse(&self.agent_url).map_err(|e| {
            ConfigError::ValidationError(format!("agent_url {:?}: {e}", self.agent_url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::ValidationError(format!(
                "agent_url must be http or https, got {}",
                url.scheme()
            )));
        }

        let nonzero = [
            ("stall_timeout_secs", self.stall_timeout.is_zero()),
            ("connect_timeout_secs", self.connect_timeout.is_zero()),
            ("client_send_grace_ms", self.client_send_grace.is_zero()),
            ("max_connections", self.max_connections == 0),
            ("outbound_queue_capacity", self.outbound_queue_capacity == 0),
            ("max_message_size", self.max_message_size == 0),
            ("max_query_length", self.max_query_length == 0),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, zero)| *zero) {
            return Err(ConfigError::ValidationError(format!(
                "{name} must be greater than zero"
            )));
        }

        if self.bind_address.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "bind_address must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/research-relay/relay.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("research-relay").join("relay.toml"))
}

/// Default SQLite database location
#[must_use]
pub fn default_sqlite_path() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("research-relay").join("relay.db"))
        .unwrap_or_else(|| PathBuf::from("relay.db"))
}

/// Load configuration from the default path and the process environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if the
/// result fails validation. A missing config file is not an error.
pub fn load_config() -> Result<RelayConfigFile, ConfigError> {
    load_config_from_path(default_config_path().as_deref())
}

/// Load configuration from a specific path and the process environment
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if the result
/// fails validation.
pub fn load_config_from_path(path: Option<&Path>) -> Result<RelayConfigFile, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration, reading environment variables through `env`
///
/// # Errors
///
/// See [`load_config_from_path`].
pub fn load_config_with_env<F>(path: Option<&Path>, env: F) -> Result<RelayConfigFile, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = RelayConfigFile::default();

    if let Some(config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.to_path_buf(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.to_path_buf());
            config.source = ConfigSource::File;

            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env)?;
    config.validate()?;
    Ok(config)
}

fn apply_toml_config(config: &mut RelayConfigFile, toml: &RelayToml) {
    let upstream = &toml.upstream;
    if let Some(url) = &upstream.agent_url {
        config.agent_url = url.clone();
    }
    if let Some(secs) = upstream.stall_timeout_secs {
        config.stall_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = upstream.connect_timeout_secs {
        config.connect_timeout = Duration::from_secs(secs);
    }
    if let Some(max) = upstream.max_consecutive_protocol_errors {
        config.max_consecutive_protocol_errors = max;
    }

    let server = &toml.server;
    if let Some(addr) = &server.bind_address {
        config.bind_address = addr.clone();
    }
    if let Some(max) = server.max_connections {
        config.max_connections = max;
    }
    if let Some(capacity) = server.outbound_queue_capacity {
        config.outbound_queue_capacity = capacity;
    }
    if let Some(ms) = server.client_send_grace_ms {
        config.client_send_grace = Duration::from_millis(ms);
    }
    if let Some(size) = server.max_message_size {
        config.max_message_size = size;
    }
    if let Some(length) = server.max_query_length {
        config.max_query_length = length;
    }

    if let Some(backend) = toml.storage.backend {
        config.storage = backend;
    }
    if let Some(path) = &toml.storage.sqlite_path {
        config.sqlite_path = path.clone();
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("{key}={value:?} is not a valid value")))
}

fn apply_env_config<F>(config: &mut RelayConfigFile, env: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = env("RESEARCH_AGENT_URL").or_else(|| env("PYTHON_AGENT_URL")) {
        config.agent_url = url;
        config.source = ConfigSource::Env;
    }
    if let Some(addr) = env("RELAY_BIND_ADDRESS") {
        config.bind_address = addr;
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = env("RELAY_STALL_TIMEOUT") {
        config.stall_timeout = Duration::from_secs(parse_env("RELAY_STALL_TIMEOUT", &secs)?);
        config.source = ConfigSource::Env;
    }
    if let Some(capacity) = env("RELAY_OUTBOUND_CAPACITY") {
        config.outbound_queue_capacity = parse_env("RELAY_OUTBOUND_CAPACITY", &capacity)?;
        config.source = ConfigSource::Env;
    }
    if let Some(backend) = env("RELAY_STORAGE") {
        config.storage = backend.parse()?;
        config.source = ConfigSource::Env;
    }
    if let Some(path) = env("RELAY_SQLITE_PATH") {
        config.sqlite_path = PathBuf::from(path);
        config.source = ConfigSource::Env;
    }
    Ok(())
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied last
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Listen address override
    pub bind_address: Option<String>,
    /// Agent URL override
    pub agent_url: Option<String>,
    /// Storage backend override
    pub storage: Option<StorageBackend>,
    /// SQLite path override
    pub sqlite_path: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Create an empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listen address
    #[must_use]
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = Some(addr.into());
        self
    }

    /// Set the agent URL
    #[must_use]
    pub fn with_agent_url(mut self, url: impl Into<String>) -> Self {
        self.agent_url = Some(url.into());
        self
    }

    /// Set the storage backend
    #[must_use]
    pub fn with_storage(mut self, backend: StorageBackend) -> Self {
        self.storage = Some(backend);
        self
    }

    /// Set the SQLite path
    #[must_use]
    pub fn with_sqlite_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.sqlite_path = Some(path.into());
        self
    }

    /// Apply the overrides and re-validate
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if an override is invalid.
    pub fn apply(self, config: &mut RelayConfigFile) -> Result<(), ConfigError> {
        let mut changed = false;
        if let Some(addr) = self.bind_address {
            config.bind_address = addr;
            changed = true;
        }
        if let Some(url) = self.agent_url {
            config.agent_url = url;
            changed = true;
        }
        if let Some(backend) = self.storage {
            config.storage = backend;
            changed = true;
        }
        if let Some(path) = self.sqlite_path {
            config.sqlite_path = path;
            changed = true;
        }
        if changed {
            config.source = ConfigSource::Cli;
        }
        config.validate()
    }
}
