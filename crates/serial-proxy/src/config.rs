//! Connection configuration.
//!
//! ```toml
//! [devices.refmeter]
//! kind = "device"
//! endpoint = "/dev/ttyUSB0"
//!
//! [devices.refmeter.options]
//! baud_rate = 9600
//! read_timeout_ms = 30000
//! desync_policy = "resync"
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Port Configuration
// =============================================================================

/// How a connection reaches its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    /// Local serial device (RS-232 or USB-serial)
    #[default]
    Device,
    /// Serial-over-TCP bridge, endpoint is `host:port`
    Network,
    /// Built-in scripted device, endpoint names the mock
    Mock,
}

impl PortKind {
    /// Lowercase name as used in configuration files.
    pub fn as_str(self) -> &'static str {
        match self {
            PortKind::Device => "device",
            PortKind::Network => "network",
            PortKind::Mock => "mock",
        }
    }
}

/// Everything needed to open one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortConfig {
    /// Connection type
    #[serde(default)]
    pub kind: PortKind,

    /// Device path, `host:port` or mock name
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Line settings and timeouts
    #[serde(default)]
    pub options: SerialPortOptions,
}

impl PortConfig {
    /// Local serial device at `path`.
    pub fn device(path: impl Into<String>) -> Self {
        Self::with_kind(PortKind::Device, path)
    }

    /// TCP bridge at `host:port`.
    pub fn network(address: impl Into<String>) -> Self {
        Self::with_kind(PortKind::Network, address)
    }

    /// Built-in mock device.
    pub fn mock(name: impl Into<String>) -> Self {
        Self::with_kind(PortKind::Mock, name)
    }

    fn with_kind(kind: PortKind, endpoint: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint: Some(endpoint.into()),
            options: SerialPortOptions::default(),
        }
    }

    /// Replace the options.
    pub fn with_options(mut self, options: SerialPortOptions) -> Self {
        self.options = options;
        self
    }

    /// Endpoint, or an error naming the connection kind that needs one.
    pub fn require_endpoint(&self) -> Result<&str, ConfigError> {
        self.endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .ok_or(ConfigError::MissingEndpoint(self.kind.as_str()))
    }

    /// Check endpoint presence and option ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.require_endpoint()?;
        self.options.validate()
    }
}

// =============================================================================
// Line Options
// =============================================================================

/// Parity bit setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

/// What happens to a connection after a request left the wire in an unknown
/// state (timeout, cancellation, transport or protocol failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesyncPolicy {
    /// Discard pending input for the drain window, abort the rest of the
    /// batch and keep serving.
    #[default]
    Resync,
    /// Fault the connection; every later submission fails until reset.
    FailFast,
}

/// Serial line settings and timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SerialPortOptions {
    /// Baud rate (300-921600)
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, or 8)
    pub data_bits: u8,
    /// Parity setting
    pub parity: Parity,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Per-request reply timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Blocking read slice; bounds cancellation latency
    pub poll_interval_ms: u64,
    /// Appended to every written line
    pub line_terminator: String,
    /// Behaviour after a desynchronising failure
    pub desync_policy: DesyncPolicy,
    /// How long to discard input when resynchronising
    pub drain_window_ms: u64,
}

impl Default for SerialPortOptions {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            read_timeout_ms: 30_000,
            poll_interval_ms: 100,
            line_terminator: "\r".to_string(),
            desync_policy: DesyncPolicy::Resync,
            drain_window_ms: 50,
        }
    }
}

impl SerialPortOptions {
    /// Short timeouts for tests against mocks.
    pub fn unit_test(read_timeout: Duration) -> Self {
        Self {
            read_timeout_ms: u64::try_from(read_timeout.as_millis()).unwrap_or(u64::MAX),
            poll_interval_ms: 5,
            drain_window_ms: 10,
            ..Self::default()
        }
    }

    /// Switch the desync policy.
    pub fn with_desync_policy(mut self, policy: DesyncPolicy) -> Self {
        self.desync_policy = policy;
        self
    }

    /// Default reply timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Blocking read slice.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Resynchronisation drain window.
    pub fn drain_window(&self) -> Duration {
        Duration::from_millis(self.drain_window_ms)
    }

    /// serialport data bits for the configured count.
    pub fn serial_data_bits(&self) -> Result<serialport::DataBits, ConfigError> {
        match self.data_bits {
            5 => Ok(serialport::DataBits::Five),
            6 => Ok(serialport::DataBits::Six),
            7 => Ok(serialport::DataBits::Seven),
            8 => Ok(serialport::DataBits::Eight),
            other => Err(ConfigError::InvalidValue {
                field: "data_bits",
                message: format!("{} (expected 5-8)", other),
            }),
        }
    }

    /// serialport stop bits for the configured count.
    pub fn serial_stop_bits(&self) -> Result<serialport::StopBits, ConfigError> {
        match self.stop_bits {
            1 => Ok(serialport::StopBits::One),
            2 => Ok(serialport::StopBits::Two),
            other => Err(ConfigError::InvalidValue {
                field: "stop_bits",
                message: format!("{} (expected 1 or 2)", other),
            }),
        }
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(300..=921_600).contains(&self.baud_rate) {
            return Err(ConfigError::InvalidValue {
                field: "baud_rate",
                message: format!("{} (expected 300-921600)", self.baud_rate),
            });
        }
        self.serial_data_bits()?;
        self.serial_stop_bits()?;
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "read_timeout_ms",
                message: "must be positive".to_string(),
            });
        }
        if self.line_terminator.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "line_terminator",
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = SerialPortOptions::default();
        assert_eq!(options.baud_rate, 9600);
        assert_eq!(options.read_timeout(), Duration::from_secs(30));
        assert_eq!(options.desync_policy, DesyncPolicy::Resync);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_unit_test_options_shrink_timeouts() {
        let options = SerialPortOptions::unit_test(Duration::from_millis(200));
        assert_eq!(options.read_timeout_ms, 200);
        assert_eq!(options.poll_interval(), Duration::from_millis(5));

        let unbounded = SerialPortOptions::unit_test(Duration::MAX);
        assert_eq!(unbounded.read_timeout_ms, u64::MAX);
    }

    #[test]
    fn test_missing_endpoint_is_rejected() {
        let config = PortConfig {
            kind: PortKind::Network,
            endpoint: None,
            options: SerialPortOptions::default(),
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingEndpoint("network"))
        );
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let options = SerialPortOptions {
            data_bits: 9,
            ..SerialPortOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InvalidValue {
                field: "data_bits",
                ..
            })
        ));

        let options = SerialPortOptions {
            baud_rate: 100,
            ..SerialPortOptions::default()
        };
        assert!(options.validate().is_err());
    }
}
