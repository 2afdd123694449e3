//! Configuration
//!
//! Two kinds of configuration live here:
//!
//! - [`store`]: the persisted, checksummed settings changed by `#` setup
//!   commands at runtime
//! - this module: the daemon's runtime configuration (transport, HAL backend,
//!   tick interval, paths), read once at startup
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`SITH_*`)
//! 3. TOML file at `$XDG_CONFIG_HOME/sith/sith.toml`
//! 4. Defaults
//!
//! # Example Configuration
//!
//! ```toml
//! [transport]
//! device = "/dev/ttyUSB0"
//! baud = 9600
//! echo = false
//!
//! [hal]
//! backend = "sim"
//!
//! [engine]
//! tick_interval_ms = 10
//!
//! [store]
//! path = "/var/lib/sith/settings.bin"
//!
//! [sequences]
//! dir = "/etc/sith/sequences"
//! ```

pub mod store;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use store::{
    ConfigField, ConfigStorage, ConfigStore, ConfigStoreError, FileStorage, LoadOutcome,
    MemoryStorage, Setting, Settings, SoundModule,
};

/// Default serial baud rate of MarcDuino boards
pub const DEFAULT_BAUD: u32 = 9600;

/// Default engine tick
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 10;

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

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
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
// Runtime configuration
// =============================================================================

/// Which HAL backend drives the outputs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HalBackendKind {
    /// Record calls only
    #[default]
    Logger,
    /// Simulated hardware state
    Sim,
}

impl FromStr for HalBackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "logger" | "log" => Ok(Self::Logger),
            "sim" | "simulated" | "simulator" => Ok(Self::Sim),
            other => Err(ConfigError::ValidationError(format!(
                "unknown HAL backend {other:?} (expected logger or sim)"
            ))),
        }
    }
}

impl fmt::Display for HalBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Logger => f.write_str("logger"),
            Self::Sim => f.write_str("sim"),
        }
    }
}

/// Where command bytes come from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportKind {
    /// Serial device or pseudo-terminal
    Serial {
        /// Device path
        device: PathBuf,
        /// Baud rate
        baud: u32,
    },
    /// Unix socket server
    Socket {
        /// Socket path
        path: PathBuf,
    },
}

/// Complete runtime configuration
#[derive(Clone, Debug)]
pub struct SithConfig {
    /// Serial device; when `None` the daemon listens on `socket_path`
    pub device: Option<PathBuf>,
    /// Serial baud rate
    pub baud: u32,
    /// Unix socket path
    pub socket_path: PathBuf,
    /// Echo each frame back before its reply
    pub echo: bool,
    /// HAL backend
    pub hal_backend: HalBackendKind,
    /// Engine tick interval
    pub tick_interval: Duration,
    /// Settings record path
    pub store_path: PathBuf,
    /// Directory of sequence definition files
    pub sequences_dir: Option<PathBuf>,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    /// Source of configuration values
    source: ConfigSource,
}

impl Default for SithConfig {
    fn default() -> Self {
        Self {
            device: None,
            baud: DEFAULT_BAUD,
            socket_path: default_runtime_dir().join("sith.sock"),
            echo: false,
            hal_backend: HalBackendKind::default(),
            tick_interval: Duration::from_millis(DEFAULT_TICK_INTERVAL_MS),
            store_path: default_store_path(),
            sequences_dir: None,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl SithConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Transport selected by this configuration
    #[must_use]
    pub fn transport(&self) -> TransportKind {
        match &self.device {
            Some(device) => TransportKind::Serial {
                device: device.clone(),
                baud: self.baud,
            },
            None => TransportKind::Socket {
                path: self.socket_path.clone(),
            },
        }
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// `ValidationError` naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "tick_interval_ms must be at least 1".into(),
            ));
        }
        if self.baud == 0 {
            return Err(ConfigError::ValidationError("baud must be non-zero".into()));
        }
        Ok(())
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[transport]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportToml {
    /// Serial device path
    pub device: Option<PathBuf>,
    /// Unix socket path
    pub socket: Option<PathBuf>,
    /// Serial baud rate
    pub baud: Option<u32>,
    /// Echo frames back
    pub echo: Option<bool>,
}

/// `[hal]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HalToml {
    /// `logger` or `sim`
    pub backend: Option<HalBackendKind>,
}

/// `[engine]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineToml {
    /// Tick interval in milliseconds
    pub tick_interval_ms: Option<u64>,
}

/// `[store]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreToml {
    /// Settings record path
    pub path: Option<PathBuf>,
}

/// `[sequences]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencesToml {
    /// Directory of `*.toml` sequence files
    pub dir: Option<PathBuf>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SithToml {
    /// Transport section
    pub transport: TransportToml,
    /// HAL section
    pub hal: HalToml,
    /// Engine section
    pub engine: EngineToml,
    /// Settings store section
    pub store: StoreToml,
    /// Sequence library section
    pub sequences: SequencesToml,
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Runtime directory: `$XDG_RUNTIME_DIR/sith` or `/tmp/sith-$UID`
#[must_use]
pub fn default_runtime_dir() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("sith")
    } else {
        // SAFETY: getuid has no preconditions and cannot fail
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/sith-{uid}"))
    }
}

/// Default configuration file path
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("sith").join("sith.toml"))
}

/// Default settings record path (`$XDG_DATA_HOME/sith/settings.bin`)
#[must_use]
pub fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("sith"))
        .unwrap_or_else(default_runtime_dir)
        .join("settings.bin")
}

/// Load configuration from the default path, environment and defaults
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
pub fn load_config() -> Result<SithConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// A missing file is not an error.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if a value
/// fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<SithConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// [`load_config_from_path`] with an explicit environment lookup
///
/// # Errors
///
/// Same as [`load_config_from_path`].
pub fn load_config_with_env(
    path: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<SithConfig, ConfigError> {
    let mut config = SithConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: SithToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
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

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut SithConfig, toml: &SithToml) {
    if toml.transport.device.is_some() {
        config.device.clone_from(&toml.transport.device);
    }
    if let Some(ref socket) = toml.transport.socket {
        config.socket_path.clone_from(socket);
    }
    if let Some(baud) = toml.transport.baud {
        config.baud = baud;
    }
    if let Some(echo) = toml.transport.echo {
        config.echo = echo;
    }
    if let Some(backend) = toml.hal.backend {
        config.hal_backend = backend;
    }
    if let Some(ms) = toml.engine.tick_interval_ms {
        config.tick_interval = Duration::from_millis(ms);
    }
    if let Some(ref path) = toml.store.path {
        config.store_path.clone_from(path);
    }
    if toml.sequences.dir.is_some() {
        config.sequences_dir.clone_from(&toml.sequences.dir);
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("{key}={value:?} is not valid")))
}

/// Apply environment variable overrides to the config
///
/// - `SITH_DEVICE`, `SITH_SOCKET`, `SITH_BAUD`, `SITH_ECHO`
/// - `SITH_HAL` (`logger` or `sim`)
/// - `SITH_TICK_MS`
/// - `SITH_STORE`, `SITH_SEQUENCES`
fn apply_env_config(
    config: &mut SithConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    let mut touched = false;

    if let Some(device) = env("SITH_DEVICE") {
        config.device = Some(PathBuf::from(device));
        touched = true;
    }
    if let Some(socket) = env("SITH_SOCKET") {
        config.socket_path = PathBuf::from(socket);
        touched = true;
    }
    if let Some(baud) = env("SITH_BAUD") {
        config.baud = parse_env("SITH_BAUD", &baud)?;
        touched = true;
    }
    if let Some(echo) = env("SITH_ECHO") {
        config.echo = echo != "0" && !echo.eq_ignore_ascii_case("false");
        touched = true;
    }
    if let Some(backend) = env("SITH_HAL") {
        config.hal_backend = backend.parse()?;
        touched = true;
    }
    if let Some(tick) = env("SITH_TICK_MS") {
        config.tick_interval = Duration::from_millis(parse_env("SITH_TICK_MS", &tick)?);
        touched = true;
    }
    if let Some(store) = env("SITH_STORE") {
        config.store_path = PathBuf::from(store);
        touched = true;
    }
    if let Some(dir) = env("SITH_SEQUENCES") {
        config.sequences_dir = Some(PathBuf::from(dir));
        touched = true;
    }

    if touched {
        config.source = ConfigSource::Env;
    }
    Ok(())
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Serial device
    pub device: Option<PathBuf>,
    /// Socket path
    pub socket_path: Option<PathBuf>,
    /// Baud rate
    pub baud: Option<u32>,
    /// Echo frames
    pub echo: Option<bool>,
    /// HAL backend
    pub hal_backend: Option<HalBackendKind>,
    /// Tick interval in milliseconds
    pub tick_interval_ms: Option<u64>,
    /// Settings record path
    pub store_path: Option<PathBuf>,
    /// Sequence directory
    pub sequences_dir: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set serial device override
    #[must_use]
    pub fn with_device(mut self, device: PathBuf) -> Self {
        self.device = Some(device);
        self
    }

    /// Set socket path override
    #[must_use]
    pub fn with_socket_path(mut self, path: PathBuf) -> Self {
        self.socket_path = Some(path);
        self
    }

    /// Set HAL backend override
    #[must_use]
    pub fn with_hal_backend(mut self, backend: HalBackendKind) -> Self {
        self.hal_backend = Some(backend);
        self
    }

    /// Set tick interval override
    #[must_use]
    pub fn with_tick_interval_ms(mut self, ms: u64) -> Self {
        self.tick_interval_ms = Some(ms);
        self
    }

    /// Apply overrides to a configuration
    ///
    /// # Errors
    ///
    /// `ValidationError` if the result is out of range.
    pub fn apply(&self, config: &mut SithConfig) -> Result<(), ConfigError> {
        let any = self.device.is_some()
            || self.socket_path.is_some()
            || self.baud.is_some()
            || self.echo.is_some()
            || self.hal_backend.is_some()
            || self.tick_interval_ms.is_some()
            || self.store_path.is_some()
            || self.sequences_dir.is_some();
        if any {
            config.source = ConfigSource::Cli;
        }

        if self.device.is_some() {
            config.device.clone_from(&self.device);
        }
        if let Some(ref path) = self.socket_path {
            config.socket_path.clone_from(path);
        }
        if let Some(baud) = self.baud {
            config.baud = baud;
        }
        if let Some(echo) = self.echo {
            config.echo = echo;
        }
        if let Some(backend) = self.hal_backend {
            config.hal_backend = backend;
        }
        if let Some(ms) = self.tick_interval_ms {
            config.tick_interval = Duration::from_millis(ms);
        }
        if let Some(ref path) = self.store_path {
            config.store_path.clone_from(path);
        }
        if self.sequences_dir.is_some() {
            config.sequences_dir.clone_from(&self.sequences_dir);
        }
        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
