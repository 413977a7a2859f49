//! PowerMaster 8121 ZIF Socket Driver
//!
//! Protocol Overview:
//! - Binary frames `A5 <len> <command..> <crc8> 5A`, see [`serial_proxy::frame`]
//! - Replies are `06 <command> <payload..>` (ACK) or `15 <command> <detail..>` (NAK)
//!
//! Each query runs as one raw job on the connection worker, so the write and
//! the framed read can never interleave with other traffic on the line. Both
//! directions are recorded with the executor's interface logger.

use crate::error::{DriverError, DriverResult};
use serde::{Deserialize, Serialize};
use serial_proxy::frame::{encode_command, read_frame};
use serial_proxy::request::hex;
use serial_proxy::{
    CancellationToken, LogCorrelation, LogPayload, ProtocolError, SerialError, SerialPortExecutor,
    Transport,
};
use std::time::{Duration, Instant};

const CMD_SERIAL: u8 = 0xC1;
const CMD_VERSION: u8 = 0xC2;
const CMD_STATUS: u8 = 0xC4;
const CMD_SET_ACTIVE: u8 = 0x8D;

const STATUS_ACTIVE: u8 = 0x01;
const STATUS_METER: u8 = 0x02;
const STATUS_ERROR: u8 = 0x40;

/// Socket firmware version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZifVersion {
    /// Major version, little endian on the wire
    pub major: i32,
    /// Minor version
    pub minor: u8,
}

/// Decoded status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZifStatus {
    /// Socket is switched on
    pub active: bool,
    /// A meter is plugged in
    pub has_meter: bool,
    /// The socket reports a fault
    pub has_error: bool,
}

impl ZifStatus {
    fn from_byte(status: u8) -> Self {
        Self {
            active: status & STATUS_ACTIVE == STATUS_ACTIVE,
            has_meter: status & STATUS_METER == STATUS_METER,
            has_error: status & STATUS_ERROR == STATUS_ERROR,
        }
    }
}

/// Write one framed command and read its framed reply on the worker thread.
///
/// Returns the ACK payload following the echoed command byte.
fn transfer(
    port: &mut dyn Transport,
    log: &LogCorrelation,
    cancel: &CancellationToken,
    command: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, SerialError> {
    let buffer = encode_command(command)?;
    let name = hex(command);

    let entry = log.prepare(true);
    let written = port.raw_write(&buffer);
    if let Err(e) = &written {
        tracing::error!(command = %name, error = %e, "Unable to send command to port");
    }
    LogCorrelation::finish(
        entry,
        LogPayload::raw(&buffer).with_exception(written.as_ref().err().map(ToString::to_string)),
    );
    written.map_err(|e| SerialError::from_transport(e, &name, timeout))?;

    let entry = log.prepare(false);
    let mut seen = Vec::new();
    let result = read_frame(port, Instant::now() + timeout, cancel, &mut seen)
        .map_err(|e| SerialError::from_transport(e, &name, timeout))
        .and_then(|frame| Ok(frame.reply()?.expect_echo(command[0])?));
    if let Err(e) = &result {
        tracing::error!(command = %name, error = %e, "Unable to read reply from port");
    }
    LogCorrelation::finish(
        entry,
        LogPayload::raw(&seen).with_exception(result.as_ref().err().map(ToString::to_string)),
    );
    result
}

/// Client for one PowerMaster 8121 socket.
#[derive(Debug, Clone)]
pub struct PowerMaster8121 {
    executor: SerialPortExecutor,
    timeout: Duration,
    cancellation: Option<CancellationToken>,
}

impl PowerMaster8121 {
    /// Use the connection's read timeout for replies.
    pub fn new(executor: SerialPortExecutor) -> Self {
        let timeout = executor.read_timeout();
        Self {
            executor,
            timeout,
            cancellation: None,
        }
    }

    /// Override the reply timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Abort pending and running commands when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Run `command` and check the payload has exactly `expected` bytes.
    async fn execute(&self, command: Vec<u8>, expected: usize) -> DriverResult<Vec<u8>> {
        if command.is_empty() {
            return Err(DriverError::InvalidArgument("empty command".to_string()));
        }
        let timeout = self.timeout;
        let job = move |port: &mut dyn Transport, log: &LogCorrelation, cancel: &CancellationToken| {
            transfer(port, log, cancel, &command, timeout)
        };
        let payload = match &self.cancellation {
            Some(token) => self.executor.raw_execute_with_cancellation(token.clone(), job).await?,
            None => self.executor.raw_execute(job).await?,
        };

        if payload.len() != expected {
            return Err(ProtocolError::BadLength {
                expected,
                actual: payload.len(),
            }
            .into());
        }
        Ok(payload)
    }

    /// Firmware version (`0xC2`).
    pub async fn version(&self) -> DriverResult<ZifVersion> {
        let payload = self.execute(vec![CMD_VERSION], 5).await?;
        let major = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        Ok(ZifVersion {
            major,
            minor: payload[4],
        })
    }

    /// Socket serial number (`0xC1`, big endian).
    pub async fn serial_number(&self) -> DriverResult<u16> {
        let payload = self.execute(vec![CMD_SERIAL], 2).await?;
        Ok(u16::from_be_bytes([payload[0], payload[1]]))
    }

    /// Status flags (`0xC4`).
    pub async fn status(&self) -> DriverResult<ZifStatus> {
        let payload = self.execute(vec![CMD_STATUS], 1).await?;
        Ok(ZifStatus::from_byte(payload[0]))
    }

    /// True if the socket is switched on.
    pub async fn is_active(&self) -> DriverResult<bool> {
        Ok(self.status().await?.active)
    }

    /// True if a meter is plugged in.
    pub async fn has_meter(&self) -> DriverResult<bool> {
        Ok(self.status().await?.has_meter)
    }

    /// True if the socket reports an error.
    pub async fn has_error(&self) -> DriverResult<bool> {
        Ok(self.status().await?.has_error)
    }

    /// Switch the socket on or off (`0x8D`).
    pub async fn set_active(&self, active: bool) -> DriverResult<()> {
        self.execute(vec![CMD_SET_ACTIVE, u8::from(active)], 0).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_byte_decoding() {
        assert_eq!(
            ZifStatus::from_byte(0x03),
            ZifStatus {
                active: true,
                has_meter: true,
                has_error: false
            }
        );
        assert!(ZifStatus::from_byte(0x40).has_error);
        assert!(!ZifStatus::from_byte(0x02).active);
    }
}
