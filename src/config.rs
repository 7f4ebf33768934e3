//! Bus configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. `config/instrument_bus.toml` (or an explicit path)
//! 2. Environment variables prefixed with `INSTRUMENT_BUS_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore so that field names keep their own
//! underscores:
//!
//! ```text
//! INSTRUMENT_BUS_LOGGING__LEVEL=debug
//! INSTRUMENT_BUS_DEFAULTS__READ_RETRIES=4
//! INSTRUMENT_BUS_DEFAULTS__SUSPEND_DELAY=10s
//! ```
//!
//! # Example
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [defaults]
//! read_timeout = "400ms"
//! read_retries = 2
//!
//! [[devices]]
//! id = "psu_a"
//! protocol = "gen"
//! endpoint = "/dev/ttyUSB0"
//! address = 6
//! poll_command = "MV?"
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::ProtocolKind;
use crate::session::SessionOptions;
use crate::transport::Endpoint;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/instrument_bus.toml";

/// Environment prefix for overrides.
pub const ENV_PREFIX: &str = "INSTRUMENT_BUS_";

/// Configuration error types
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level bus configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusConfig {
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Session options applied to every device unless overridden
    #[serde(default)]
    pub defaults: SessionOptions,
    /// Device definitions
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// One device on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device identifier
    pub id: String,
    /// Framing policy
    pub protocol: ProtocolKind,
    /// Transport endpoint (serial path, `tcp://host:port`, ...)
    pub endpoint: Endpoint,
    /// Address on the link
    pub address: u16,
    /// Whether this device is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Command sent on each poll cycle
    #[serde(default)]
    pub poll_command: Option<String>,
    /// Per-device overrides of the default session options
    #[serde(default)]
    pub options: OptionOverrides,
}

/// Optional per-device replacements for [`SessionOptions`] fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct OptionOverrides {
    #[serde(default)]
    pub checksum: Option<bool>,
    #[serde(default)]
    pub baud_rate: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    pub read_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub min_read_timeout: Option<Duration>,
    #[serde(default)]
    pub read_retries: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    pub suspend_delay: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub long_suspend_delay: Option<Duration>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_enabled() -> bool {
    true
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl BusConfig {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and the environment.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// Environment variables take precedence over the file. A missing file is not an
    /// error; the defaults plus any environment overrides are used.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid
    /// - Default options are coherent
    /// - Device IDs are unique
    /// - No two devices share an (endpoint, address) pair
    /// - Every address is in range for its protocol
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        validate_options("defaults", &self.defaults)?;

        let mut ids = HashSet::new();
        let mut slots = HashSet::new();
        for device in &self.devices {
            if !ids.insert(&device.id) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate device ID: '{}'",
                    device.id
                )));
            }
            if !slots.insert((&device.endpoint, device.address)) {
                return Err(ConfigError::ValidationError(format!(
                    "Device '{}' reuses address {} on {}",
                    device.id, device.address, device.endpoint
                )));
            }

            let max = device.protocol.build(false).max_address();
            if device.address == 0 || device.address > max {
                return Err(ConfigError::ValidationError(format!(
                    "Device '{}' address {} out of range 1..={max} for {}",
                    device.id, device.address, device.protocol
                )));
            }

            validate_options(&device.id, &device.session_options(&self.defaults))?;
        }

        Ok(())
    }

    /// Devices with `enabled = true`.
    pub fn enabled_devices(&self) -> impl Iterator<Item = &DeviceDefinition> {
        self.devices.iter().filter(|d| d.enabled)
    }
}

fn validate_options(scope: &str, options: &SessionOptions) -> Result<(), ConfigError> {
    if options.baud_rate == 0 {
        return Err(ConfigError::ValidationError(format!(
            "{scope}: baud_rate must be positive"
        )));
    }
    if options.read_timeout.is_zero() {
        return Err(ConfigError::ValidationError(format!(
            "{scope}: read_timeout must be positive"
        )));
    }
    if options.min_read_timeout > options.read_timeout {
        return Err(ConfigError::ValidationError(format!(
            "{scope}: min_read_timeout {:?} exceeds read_timeout {:?}",
            options.min_read_timeout, options.read_timeout
        )));
    }
    Ok(())
}

impl DeviceDefinition {
    /// Session options for this device: `defaults` with the overrides applied.
    pub fn session_options(&self, defaults: &SessionOptions) -> SessionOptions {
        let o = &self.options;
        SessionOptions {
            checksum: o.checksum.unwrap_or(defaults.checksum),
            baud_rate: o.baud_rate.unwrap_or(defaults.baud_rate),
            read_timeout: o.read_timeout.unwrap_or(defaults.read_timeout),
            min_read_timeout: o.min_read_timeout.unwrap_or(defaults.min_read_timeout),
            read_retries: o.read_retries.unwrap_or(defaults.read_retries),
            suspend_delay: o.suspend_delay.unwrap_or(defaults.suspend_delay),
            long_suspend_delay: o.long_suspend_delay.unwrap_or(defaults.long_suspend_delay),
            connect_timeout: defaults.connect_timeout,
        }
    }
}
