//! Configuration loading traits and types.
//!
//! The broker reads a single `broker.toml`. Every section has defaults,
//! so a missing file (or a missing section) yields a usable
//! configuration.
//!
//! # TOML Example
//!
//! ```toml
//! [shared]
//! log_level = "debug"
//! service_name = "hwbroker"
//!
//! [broker]
//! socket_path = "/run/hwbroker.sock"
//!
//! [board]
//! descriptor = "/etc/hwbroker/boards/rpi3.toml"
//!
//! [policy]
//! allow_uids = [0, 5001]
//! allow_gids = [997]
//! ```

use crate::consts::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Common configuration fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SharedConfig {
    /// Logging verbosity level.
    pub log_level: LogLevel,

    /// Instance identifier used in log output.
    pub service_name: String,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            service_name: BROKER_SERVICE_NAME.to_string(),
        }
    }
}

/// Listening socket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SocketConfig {
    /// Unix stream socket path. A stale socket file is replaced at bind.
    pub socket_path: PathBuf,
    /// Permission bits applied to the socket file after bind.
    pub socket_mode: u32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            socket_mode: 0o666,
        }
    }
}

/// Board descriptor selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BoardConfig {
    /// Explicit descriptor; skips model discovery when set.
    pub descriptor: Option<PathBuf>,
    /// Directory scanned during model discovery.
    pub descriptor_dir: PathBuf,
    /// File holding the running board's model string.
    pub model_path: PathBuf,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            descriptor: None,
            descriptor_dir: PathBuf::from(DEFAULT_BOARD_DIR),
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
        }
    }
}

/// Access policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Privilege token every acquisition is checked against.
    pub privilege: String,
    /// Decision cache capacity (LRU).
    pub cache_capacity: usize,
    /// Users granted the privilege.
    pub allow_uids: Vec<u32>,
    /// Groups (primary or supplementary) granted the privilege.
    pub allow_gids: Vec<u32>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            privilege: DEFAULT_PRIVILEGE.to_string(),
            cache_capacity: DEFAULT_POLICY_CACHE_CAPACITY,
            allow_uids: vec![0],
            allow_gids: Vec::new(),
        }
    }
}

/// Roots of the kernel interfaces used by the device adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SysfsConfig {
    pub gpio_root: PathBuf,
    pub pwm_root: PathBuf,
    pub iio_root: PathBuf,
    pub dev_root: PathBuf,
}

impl Default for SysfsConfig {
    fn default() -> Self {
        Self {
            gpio_root: PathBuf::from("/sys/class/gpio"),
            pwm_root: PathBuf::from("/sys/class/pwm"),
            iio_root: PathBuf::from("/sys/bus/iio/devices"),
            dev_root: PathBuf::from("/dev"),
        }
    }
}

/// GPIO export readiness wait.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GpioConfig {
    /// Polls of the value node after export before giving up.
    pub ready_attempts: u32,
    /// Delay between polls in milliseconds.
    pub ready_interval_ms: u64,
}

impl GpioConfig {
    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms)
    }
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            ready_attempts: DEFAULT_GPIO_READY_ATTEMPTS,
            ready_interval_ms: DEFAULT_GPIO_READY_INTERVAL_MS,
        }
    }
}

/// Full broker configuration loaded from `broker.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub shared: SharedConfig,
    pub broker: SocketConfig,
    pub board: BoardConfig,
    pub policy: PolicyConfig,
    pub sysfs: SysfsConfig,
    pub gpio: GpioConfig,
}

impl BrokerConfig {
    /// Load `path`, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Ok(config) => {
                config.validate()?;
                Ok(config)
            }
            Err(ConfigError::FileNotFound) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `service_name` or `policy.privilege` is empty
    /// - `policy.cache_capacity` is zero
    /// - `gpio.ready_attempts` is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shared.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        if self.policy.privilege.is_empty() {
            return Err(ConfigError::ValidationError(
                "policy.privilege cannot be empty".to_string(),
            ));
        }
        if self.policy.cache_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "policy.cache_capacity must be > 0".to_string(),
            ));
        }
        if self.gpio.ready_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "gpio.ready_attempts must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation for all types that implement DeserializeOwned.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
