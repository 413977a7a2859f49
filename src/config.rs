//! Bench Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `METER_BENCH_`, nested keys
//!    separated by `__` (e.g. `METER_BENCH_APPLICATION__LOG_LEVEL=debug`)
//!
//! ```toml
//! [application]
//! log_level = "info"
//! log_format = "compact"
//!
//! [devices.refmeter]
//! kind = "device"
//! endpoint = "/dev/ttyUSB0"
//! options = { baud_rate = 9600, read_timeout_ms = 5000 }
//!
//! [devices.zif]
//! kind = "mock"
//! endpoint = "zif8121"
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serial_proxy::{ConfigError, PortConfig};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "METER_BENCH_";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Invalid or unloadable bench configuration.
#[derive(Error, Debug)]
pub enum BenchConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid log_level '{0}'. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("device '{id}': {source}")]
    Device {
        id: String,
        #[source]
        source: ConfigError,
    },

    #[error("unknown device '{0}'")]
    UnknownDevice(String),
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Multi-line with colours
    #[default]
    Pretty,
    /// One line per event
    Compact,
    /// Structured JSON lines
    Json,
}

/// Application-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Console output format
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
        }
    }
}

/// Top-level bench configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial lines by device id
    #[serde(default)]
    pub devices: BTreeMap<String, PortConfig>,
}

impl BenchConfig {
    /// Load from `path` merged with environment overrides, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, BenchConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        tracing::debug!(
            path = %path.as_ref().display(),
            devices = config.devices.len(),
            "Loaded bench configuration"
        );
        Ok(config)
    }

    /// Check the log level and every device's port settings.
    pub fn validate(&self) -> Result<(), BenchConfigError> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(BenchConfigError::InvalidLogLevel(
                self.application.log_level.clone(),
            ));
        }

        for (id, port) in &self.devices {
            port.validate().map_err(|source| BenchConfigError::Device {
                id: id.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Port settings of device `id`.
    pub fn device(&self, id: &str) -> Result<&PortConfig, BenchConfigError> {
        self.devices
            .get(id)
            .ok_or_else(|| BenchConfigError::UnknownDevice(id.to_string()))
    }
}
