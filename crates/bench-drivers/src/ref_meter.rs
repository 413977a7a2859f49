//! MT786 Reference Meter Driver
//!
//! Protocol Overview:
//! - Format: ASCII command/response, CR terminated
//! - Every command is acknowledged by `<command>ACK` as the terminal line
//! - Data lines precede the acknowledgement
//!
//! | Command | Reply                                   |
//! |---------|-----------------------------------------|
//! | `AAV`   | `MT786V06.33`, `AAVACK`                 |
//! | `ATI01` | `ATIACK` (selects the measurement set)  |
//! | `AME`   | `<index>;<value>` lines, `AMEACK`       |
//! | `AML`   | `<index>;<mode>;<description>`, `AMLACK`|
//!
//! Actual values are read as the batch `ATI01`, `AME` through a
//! [`ResponseShare`], so any number of concurrent readers cost one exchange.
//!
//! # Usage
//!
//! ```rust,no_run
//! use bench_drivers::RefMeter;
//! use serial_proxy::{LogSource, LogSourceKind, PortConfig, SerialPortConnection, SerialPortExecutor};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let connection = Arc::new(SerialPortConnection::open("refmeter", &PortConfig::mock("mt786"))?);
//! let source = LogSource::new(LogSourceKind::RefMeter, connection.endpoint());
//! let meter = RefMeter::new(SerialPortExecutor::unlogged(connection, source));
//! let values = meter.actual_values().await?;
//! println!("{:?} Hz", values.frequency);
//! # Ok(())
//! # }
//! ```

use crate::error::{DriverError, DriverResult};
use crate::run_batch;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serial_proxy::{ResponseShare, SerialPortExecutor, SerialPortRequest};
use std::sync::LazyLock;

static ACTUAL_VALUE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,3});(.+)$").expect("Invalid actual value regex"));
static MEASUREMENT_MODE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,3});([^;]+);(.+)$").expect("Invalid measurement mode regex"));
static FIRMWARE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)V(\d+\.\d+)$").expect("Invalid firmware regex"));

/// Index of the phase order string in an `AME` reply.
const PHASE_ORDER_INDEX: u32 = 27;

// =============================================================================
// Data Model
// =============================================================================

/// Measured values of one phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseValues {
    /// RMS voltage (V)
    pub voltage: Option<f64>,
    /// RMS current (A)
    pub current: Option<f64>,
    /// Voltage angle (deg)
    pub angle_voltage: Option<f64>,
    /// Current angle (deg)
    pub angle_current: Option<f64>,
    /// Power factor (cos phi)
    pub power_factor: Option<f64>,
    /// Active power (W)
    pub active_power: Option<f64>,
    /// Reactive power (var)
    pub reactive_power: Option<f64>,
    /// Apparent power (VA)
    pub apparent_power: Option<f64>,
}

/// One complete `AME` measurement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActualValues {
    /// Per-phase values, L1 to L3
    pub phases: [PhaseValues; 3],
    /// Total active power (W)
    pub active_power: Option<f64>,
    /// Total reactive power (var)
    pub reactive_power: Option<f64>,
    /// Total apparent power (VA)
    pub apparent_power: Option<f64>,
    /// Phase sequence as reported, e.g. `"123"`
    pub phase_order: Option<String>,
    /// Frequency (Hz)
    pub frequency: Option<f64>,
}

impl ActualValues {
    /// Store `value` under its `AME` index. Later values overwrite earlier ones.
    fn assign(&mut self, index: u32, value: f64) {
        let phase = (index % 3) as usize;
        match index {
            0..=2 => self.phases[phase].voltage = Some(value),
            3..=5 => self.phases[phase].current = Some(value),
            6..=8 => self.phases[phase].angle_voltage = Some(value),
            9..=11 => self.phases[phase].angle_current = Some(value),
            12..=14 => self.phases[phase].power_factor = Some(value),
            15..=17 => self.phases[phase].active_power = Some(value),
            18..=20 => self.phases[phase].reactive_power = Some(value),
            21..=23 => self.phases[phase].apparent_power = Some(value),
            24 => self.active_power = Some(value),
            25 => self.reactive_power = Some(value),
            26 => self.apparent_power = Some(value),
            28 => self.frequency = Some(value),
            _ => tracing::debug!(index, "Ignoring unknown actual value index"),
        }
    }
}

/// Measurement modes reported by `AML`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementMode {
    /// `2WA`
    TwoWireActivePower,
    /// `2WAP`
    TwoWireApparentPower,
    /// `2WR`
    TwoWireReactivePower,
    /// `3WA`
    ThreeWireActivePower,
    /// `3WAP`
    ThreeWireApparentPower,
    /// `3WR`
    ThreeWireReactivePower,
    /// `3WRCA`
    ThreeWireReactivePowerCrossConnectedA,
    /// `3WRCB`
    ThreeWireReactivePowerCrossConnectedB,
    /// `4WA`
    FourWireActivePower,
    /// `4WAP`
    FourWireApparentPower,
    /// `4WR`
    FourWireReactivePower,
    /// `4WRC`
    FourWireReactivePowerCrossConnected,
}

impl MeasurementMode {
    /// Map the device's short name (`2WA`, `4WRC`, ...) to a mode.
    pub fn from_code(code: &str) -> Option<Self> {
        let mode = match code {
            "2WA" => MeasurementMode::TwoWireActivePower,
            "2WAP" => MeasurementMode::TwoWireApparentPower,
            "2WR" => MeasurementMode::TwoWireReactivePower,
            "3WA" => MeasurementMode::ThreeWireActivePower,
            "3WAP" => MeasurementMode::ThreeWireApparentPower,
            "3WR" => MeasurementMode::ThreeWireReactivePower,
            "3WRCA" => MeasurementMode::ThreeWireReactivePowerCrossConnectedA,
            "3WRCB" => MeasurementMode::ThreeWireReactivePowerCrossConnectedB,
            "4WA" => MeasurementMode::FourWireActivePower,
            "4WAP" => MeasurementMode::FourWireApparentPower,
            "4WR" => MeasurementMode::FourWireReactivePower,
            "4WRC" => MeasurementMode::FourWireReactivePowerCrossConnected,
            _ => return None,
        };
        Some(mode)
    }
}

/// Parsed `AAV` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion {
    /// Device model, e.g. `MT786`
    pub model: String,
    /// Firmware version, e.g. `06.33`
    pub version: String,
}

// =============================================================================
// Parsing
// =============================================================================

/// Parse the data lines of an `AME` reply.
///
/// Lines that do not look like `<index>;<value>` or carry an unparsable
/// number are logged and skipped. Values are parsed locale independently.
pub fn parse_actual_values<S: AsRef<str>>(lines: &[S]) -> ActualValues {
    let mut values = ActualValues::default();

    for line in lines.iter().map(|line| line.as_ref()) {
        let Some(caps) = ACTUAL_VALUE_REGEX.captures(line) else {
            tracing::warn!(reply = %line, "bad reply");
            continue;
        };
        let Ok(index) = caps[1].parse::<u32>() else {
            tracing::warn!(reply = %line, "bad reply");
            continue;
        };

        if index == PHASE_ORDER_INDEX {
            values.phase_order = Some(caps[2].to_string());
            continue;
        }
        match caps[2].parse::<f64>() {
            Ok(value) => values.assign(index, value),
            Err(_) => tracing::warn!(reply = %line, "invalid number in reply"),
        }
    }

    values
}

/// Parse the data lines of an `AML` reply, keeping known modes in order.
pub fn parse_measurement_modes<S: AsRef<str>>(lines: &[S]) -> Vec<MeasurementMode> {
    lines
        .iter()
        .map(|line| line.as_ref())
        .filter_map(|line| match MEASUREMENT_MODE_REGEX.captures(line) {
            Some(caps) => MeasurementMode::from_code(&caps[2]),
            None => {
                tracing::warn!(reply = %line, "bad reply");
                None
            }
        })
        .collect()
}

// =============================================================================
// RefMeter
// =============================================================================

/// Client for an MT786 reference meter.
#[derive(Debug)]
pub struct RefMeter {
    executor: SerialPortExecutor,
    actual_values: ResponseShare<ActualValues, DriverError>,
}

impl RefMeter {
    /// Wrap an executor bound to the meter's log source.
    ///
    /// Keep one instance per physical meter; the actual value share only
    /// de-duplicates readers of the same instance.
    pub fn new(executor: SerialPortExecutor) -> Self {
        let shared = executor.clone();
        let actual_values = ResponseShare::new(move || {
            let executor = shared.clone();
            async move { Self::read_actual_values(&executor).await }
        });
        Self {
            executor,
            actual_values,
        }
    }

    async fn read_actual_values(executor: &SerialPortExecutor) -> DriverResult<ActualValues> {
        let replies = run_batch(
            executor,
            vec![
                SerialPortRequest::create("ATI01", "ATIACK"),
                SerialPortRequest::create("AME", "AMEACK"),
            ],
        )
        .await?;
        let ame = replies.last().ok_or_else(|| DriverError::BadReply {
            command: "AME".to_string(),
            detail: "no reply".to_string(),
        })?;
        Ok(parse_actual_values(ame.data()))
    }

    /// Current actual values, shared with concurrent callers.
    pub async fn actual_values(&self) -> DriverResult<ActualValues> {
        self.actual_values.execute().await
    }

    /// Supported measurement modes.
    pub async fn measurement_modes(&self) -> DriverResult<Vec<MeasurementMode>> {
        let replies = run_batch(&self.executor, vec![SerialPortRequest::create("AML", "AMLACK")]).await?;
        Ok(replies
            .first()
            .map(|reply| parse_measurement_modes(reply.data()))
            .unwrap_or_default())
    }

    /// Model and firmware version.
    pub async fn firmware_version(&self) -> DriverResult<FirmwareVersion> {
        let replies = run_batch(&self.executor, vec![SerialPortRequest::create("AAV", "AAVACK")]).await?;
        let line = replies
            .first()
            .and_then(|reply| reply.data().first())
            .ok_or_else(|| DriverError::BadReply {
                command: "AAV".to_string(),
                detail: "no version line".to_string(),
            })?;
        let caps = FIRMWARE_REGEX
            .captures(line)
            .ok_or_else(|| DriverError::BadReply {
                command: "AAV".to_string(),
                detail: line.clone(),
            })?;
        Ok(FirmwareVersion {
            model: caps[1].to_string(),
            version: caps[2].to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_parse_maps_indices() {
        let values = parse_actual_values(&["0;230.5", "4;5.0", "8;240", "12;0.99965084", "27;123", "28;50.01"]);

        assert_eq!(values.phases[0].voltage, Some(230.5));
        assert_eq!(values.phases[1].current, Some(5.0));
        assert_eq!(values.phases[2].angle_voltage, Some(240.0));
        assert_eq!(values.phases[0].power_factor, Some(0.99965084));
        assert_eq!(values.phase_order.as_deref(), Some("123"));
        assert_eq!(values.frequency, Some(50.01));
    }

    #[test]
    fn test_later_index_overwrites_earlier() {
        let values = parse_actual_values(&["28;1", "28;2"]);
        assert_eq!(values.frequency, Some(2.0));
    }

    #[test]
    fn test_empty_reply_is_default() {
        let values = parse_actual_values::<&str>(&[]);
        assert_eq!(values, ActualValues::default());
    }

    #[traced_test]
    #[test]
    fn test_bad_lines_are_skipped_with_warning() {
        for line in ["-1;1", ";1", "1;", "12.3;1", "xxxx", "ATIACK"] {
            let values = parse_actual_values(&[line]);
            assert_eq!(values, ActualValues::default(), "line {:?}", line);
        }
        assert!(logs_contain("bad reply"));

        let values = parse_actual_values(&["1;1EA3"]);
        assert_eq!(values, ActualValues::default());
        assert!(logs_contain("invalid number in reply"));
    }

    #[test]
    fn test_measurement_modes_skip_unknown() {
        let modes = parse_measurement_modes(&["01;2WA;2WAde", "02;XYZ;unknown", "03;4WRC;4WRCde", "junk"]);
        assert_eq!(
            modes,
            vec![
                MeasurementMode::TwoWireActivePower,
                MeasurementMode::FourWireReactivePowerCrossConnected
            ]
        );
    }
}
