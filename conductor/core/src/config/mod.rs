//! TOML Configuration
//!
//! Configuration for streaming sessions and the relay, loaded from
//! `~/.config/stream-conductor/conductor.toml`.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. Explicit overrides ([`ConfigOverrides`], e.g. from CLI arguments)
//! 2. Environment variables (`STREAM_CONDUCTOR_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [admission]
//! capacity = 5
//! acquire_timeout_ms = 5000
//!
//! [persistence]
//! cache_interval_ms = 1000
//! store_interval_ms = 5000
//!
//! [emitter]
//! sse_capacity = 256
//! room_capacity = 256
//! slim_thinking_kinds = ["Chat"]
//!
//! [relay]
//! socket_path = "/run/user/1000/stream-conductor/relay.sock"
//! channel_prefix = "stream:"
//! subscription_capacity = 256
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

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

/// Where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Command-line argument or explicit override
    Cli,
    /// Environment variable
    Env,
    /// TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
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

/// `[admission]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionToml {
    /// Maximum concurrently active sessions
    pub capacity: Option<usize>,
    /// How long a session waits for a slot
    pub acquire_timeout_ms: Option<u64>,
}

/// `[persistence]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceToml {
    /// Interval between fast cache snapshot writes
    pub cache_interval_ms: Option<u64>,
    /// Interval between authoritative store writes
    pub store_interval_ms: Option<u64>,
}

/// `[emitter]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterToml {
    /// Queue capacity of the unidirectional stream emitter
    pub sse_capacity: Option<usize>,
    /// Per-subscriber buffer of push rooms
    pub room_capacity: Option<usize>,
    /// Agent kinds that receive slimmed thinking logs
    pub slim_thinking_kinds: Option<Vec<String>>,
}

/// `[relay]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Hub socket path
    pub socket_path: Option<String>,
    /// Prefix of per-session channel names
    pub channel_prefix: Option<String>,
    /// Per-subscription buffer
    pub subscription_capacity: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorToml {
    /// Admission section
    pub admission: AdmissionToml,
    /// Persistence section
    pub persistence: PersistenceToml,
    /// Emitter section
    pub emitter: EmitterToml,
    /// Relay section
    pub relay: RelayToml,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Per-session orchestrator settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// How long to wait for an admission slot
    pub acquire_timeout: Duration,
    /// Interval between fast cache snapshot writes
    pub cache_interval: Duration,
    /// Interval between authoritative store writes
    pub store_interval: Duration,
    /// Agent kinds that receive slimmed thinking logs
    pub slim_thinking_kinds: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(5),
            cache_interval: Duration::from_secs(1),
            store_interval: Duration::from_secs(5),
            slim_thinking_kinds: vec!["Chat".to_string()],
        }
    }
}

/// Relay settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayConfig {
    /// Hub socket path
    pub socket_path: PathBuf,
    /// Prefix of per-session channel names
    pub channel_prefix: String,
    /// Per-subscription buffer
    pub subscription_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            socket_path: crate::transport::default_socket_path(),
            channel_prefix: "stream:".to_string(),
            subscription_capacity: crate::relay::DEFAULT_SUBSCRIPTION_CAPACITY,
        }
    }
}

/// Fully resolved configuration
#[derive(Clone, Debug)]
pub struct ConductorConfig {
    /// Admission capacity
    pub capacity: usize,
    /// Orchestrator settings
    pub orchestrator: OrchestratorConfig,
    /// Queue capacity of the unidirectional stream emitter
    pub sse_capacity: usize,
    /// Per-subscriber buffer of push rooms
    pub room_capacity: usize,
    /// Relay settings
    pub relay: RelayConfig,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    capacity_source: ConfigSource,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            orchestrator: OrchestratorConfig::default(),
            sse_capacity: 256,
            room_capacity: 256,
            relay: RelayConfig::default(),
            config_file_path: None,
            capacity_source: ConfigSource::Default,
        }
    }
}

impl ConductorConfig {
    /// Where the admission capacity came from
    #[must_use]
    pub fn capacity_source(&self) -> ConfigSource {
        self.capacity_source
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "admission capacity must be greater than 0".to_string(),
            ));
        }
        let orchestrator = &self.orchestrator;
        if orchestrator.store_interval < orchestrator.cache_interval {
            return Err(ConfigError::ValidationError(format!(
                "store interval ({:?}) must not be shorter than cache interval ({:?})",
                orchestrator.store_interval, orchestrator.cache_interval
            )));
        }
        if self.relay.channel_prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "relay channel prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Loading
// =============================================================================

/// Default configuration file path
///
/// `$XDG_CONFIG_HOME/stream-conductor/conductor.toml`, typically
/// `~/.config/stream-conductor/conductor.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("stream-conductor").join("conductor.toml"))
}

/// Load configuration from the default file and the process environment
///
/// A missing config file is not an error.
pub fn load_config() -> Result<ConductorConfig, ConfigError> {
    load_config_from_path(default_config_path().as_deref())
}

/// Load configuration from a specific file and the process environment
pub fn load_config_from_path(path: Option<&Path>) -> Result<ConductorConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration with an explicit environment lookup
///
/// The result is validated.
pub fn load_config_with_env(
    path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ConductorConfig, ConfigError> {
    let mut config = ConductorConfig::default();

    if let Some(config_path) = path {
        if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.to_path_buf(),
                    source: e,
                })?;
            let toml_config: ConductorToml = toml::from_str(&content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.to_path_buf());

            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
        } else {
            tracing::debug!(path = %config_path.display(), "Config file not found, using defaults");
        }
    }

    apply_env_config(&mut config, env);
    config.validate()?;
    Ok(config)
}

fn apply_toml_config(config: &mut ConductorConfig, toml: &ConductorToml) {
    if let Some(capacity) = toml.admission.capacity {
        config.capacity = capacity;
        config.capacity_source = ConfigSource::File;
    }
    if let Some(ms) = toml.admission.acquire_timeout_ms {
        config.orchestrator.acquire_timeout = Duration::from_millis(ms);
    }

    if let Some(ms) = toml.persistence.cache_interval_ms {
        config.orchestrator.cache_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.persistence.store_interval_ms {
        config.orchestrator.store_interval = Duration::from_millis(ms);
    }

    if let Some(capacity) = toml.emitter.sse_capacity {
        config.sse_capacity = capacity;
    }
    if let Some(capacity) = toml.emitter.room_capacity {
        config.room_capacity = capacity;
    }
    if let Some(kinds) = &toml.emitter.slim_thinking_kinds {
        config.orchestrator.slim_thinking_kinds = kinds.clone();
    }

    if let Some(path) = &toml.relay.socket_path {
        config.relay.socket_path = PathBuf::from(path);
    }
    if let Some(prefix) = &toml.relay.channel_prefix {
        config.relay.channel_prefix = prefix.clone();
    }
    if let Some(capacity) = toml.relay.subscription_capacity {
        config.relay.subscription_capacity = capacity;
    }
}

fn parse_env<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable environment variable");
            None
        }
    }
}

fn apply_env_config(config: &mut ConductorConfig, env: impl Fn(&str) -> Option<String>) {
    if let Some(capacity) = parse_env(&env, "STREAM_CONDUCTOR_CAPACITY") {
        config.capacity = capacity;
        config.capacity_source = ConfigSource::Env;
    }
    if let Some(ms) = parse_env(&env, "STREAM_CONDUCTOR_ACQUIRE_TIMEOUT_MS") {
        config.orchestrator.acquire_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = parse_env(&env, "STREAM_CONDUCTOR_CACHE_INTERVAL_MS") {
        config.orchestrator.cache_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = parse_env(&env, "STREAM_CONDUCTOR_STORE_INTERVAL_MS") {
        config.orchestrator.store_interval = Duration::from_millis(ms);
    }
    if let Some(kinds) = env("STREAM_CONDUCTOR_SLIM_KINDS") {
        config.orchestrator.slim_thinking_kinds = kinds
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(path) = env("STREAM_CONDUCTOR_RELAY_SOCKET") {
        config.relay.socket_path = PathBuf::from(path);
    }
    if let Some(prefix) = env("STREAM_CONDUCTOR_CHANNEL_PREFIX") {
        config.relay.channel_prefix = prefix;
    }
}

// =============================================================================
// Explicit Overrides
// =============================================================================

/// Overrides applied after loading, typically from CLI arguments
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Admission capacity override
    pub capacity: Option<usize>,
    /// Acquire timeout override (milliseconds)
    pub acquire_timeout_ms: Option<u64>,
    /// Hub socket path override
    pub socket_path: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Create an empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set capacity override
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Set acquire timeout override
    #[must_use]
    pub fn with_acquire_timeout_ms(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = Some(ms);
        self
    }

    /// Set socket path override
    #[must_use]
    pub fn with_socket_path(mut self, path: PathBuf) -> Self {
        self.socket_path = Some(path);
        self
    }

    /// Apply overrides and re-validate
    pub fn apply(&self, config: &mut ConductorConfig) -> Result<(), ConfigError> {
        if let Some(capacity) = self.capacity {
            config.capacity = capacity;
            config.capacity_source = ConfigSource::Cli;
        }
        if let Some(ms) = self.acquire_timeout_ms {
            config.orchestrator.acquire_timeout = Duration::from_millis(ms);
        }
        if let Some(path) = &self.socket_path {
            config.relay.socket_path = path.clone();
        }
        config.validate()
    }
}
