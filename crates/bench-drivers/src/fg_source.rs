//! FG30x Source Dosage Driver
//!
//! Protocol Overview:
//! - Format: ASCII command/response, CR terminated
//! - Replies echo the command prefixed with `OK`, values after `;`
//! - Energies are transferred in kWh, exposed here in Wh
//!
//! Only the dosage commands are implemented:
//!
//! | Command       | Reply            | Meaning                         |
//! |---------------|------------------|---------------------------------|
//! | `3CM1`        | `OK3CM1`         | start dosage                    |
//! | `3CM2`        | `OK3CM2`         | cancel dosage                   |
//! | `3CM3`/`3CM4` | `OK3CM3`/`OK3CM4`| dosage mode on/off              |
//! | `3SA1`        | `OK3SA1;<0-3>`   | dosage state, 2 = running       |
//! | `3SA3`        | `OK3SA3;<0-2>`   | switch mode                     |
//! | `3MA1`        | `OK3MA1;<kWh>`   | remaining energy                |
//! | `3PA45`       | `OK3PA45;<kWh>`  | total energy                    |
//! | `3PS45;<kWh>` | `OK3PS45`        | set total energy                |

use crate::error::{DriverError, DriverResult};
use crate::run_batch;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serial_proxy::{ProtocolError, Reply, SerialPortExecutor, SerialPortRequest};

/// Snapshot of a running or finished dosage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DosageProgress {
    /// Dosage is currently running
    pub active: bool,
    /// Energy already delivered (Wh)
    pub progress: f64,
    /// Energy still to deliver (Wh)
    pub remaining: f64,
    /// Configured energy (Wh)
    pub total: f64,
}

/// Dosage client for an FG30x source.
#[derive(Debug, Clone)]
pub struct FgSource {
    executor: SerialPortExecutor,
}

/// Request whose single reply line must match `pattern`.
fn query(command: &str, pattern: &str) -> DriverResult<SerialPortRequest> {
    let regex = Regex::new(pattern).map_err(|e| DriverError::InvalidArgument(e.to_string()))?;
    Ok(SerialPortRequest::create_with(command, regex, false).strict())
}

/// Capture group 1 of the terminal match.
fn captured<'a>(reply: &'a Reply, command: &str) -> DriverResult<&'a str> {
    reply
        .end_match
        .as_ref()
        .and_then(|m| m.group(1))
        .ok_or_else(|| DriverError::BadReply {
            command: command.to_string(),
            detail: format!("{:?}", reply.last()),
        })
}

/// Parse a kWh value from the device into Wh.
fn energy_wh(reply: &Reply, command: &str) -> DriverResult<f64> {
    let text = captured(reply, command)?;
    let kwh = text
        .parse::<f64>()
        .map_err(|_| ProtocolError::InvalidNumber(text.to_string()))?;
    Ok(kwh * 1000.0)
}

impl FgSource {
    /// Client sending through `executor`.
    pub fn new(executor: SerialPortExecutor) -> Self {
        Self { executor }
    }

    async fn command(&self, command: String) -> DriverResult<()> {
        let expected = format!("OK{}", command);
        run_batch(
            &self.executor,
            vec![SerialPortRequest::create_with(command, expected, false).strict()],
        )
        .await?;
        Ok(())
    }

    /// Start the configured dosage.
    pub async fn start_dosage(&self) -> DriverResult<()> {
        self.command("3CM1".to_string()).await
    }

    /// Abort a running dosage.
    pub async fn cancel_dosage(&self) -> DriverResult<()> {
        self.command("3CM2".to_string()).await
    }

    /// Arm (`true`) or disarm dosage mode.
    pub async fn set_dosage_mode(&self, on: bool) -> DriverResult<()> {
        self.command(format!("3CM{}", if on { 3 } else { 4 })).await
    }

    /// Configure the dosage energy in Wh.
    pub async fn set_dosage_energy(&self, value_wh: f64) -> DriverResult<()> {
        if !value_wh.is_finite() || value_wh < 0.0 {
            return Err(DriverError::InvalidArgument(format!(
                "dosage energy must be non-negative, got {}",
                value_wh
            )));
        }
        let command = format!("3PS45;{}", value_wh / 1000.0);
        run_batch(
            &self.executor,
            vec![SerialPortRequest::create_with(command, "OK3PS45", false).strict()],
        )
        .await?;
        Ok(())
    }

    /// Read state, remaining and total energy in one batch.
    pub async fn dosage_progress(&self) -> DriverResult<DosageProgress> {
        let replies = run_batch(
            &self.executor,
            vec![
                query("3SA1", r"^OK3SA1;([0123])$")?,
                query("3MA1", r"^OK3MA1;(.+)$")?,
                query("3PA45", r"^OK3PA45;(.+)$")?,
            ],
        )
        .await?;
        let [state, countdown, total] = replies.as_slice() else {
            return Err(DriverError::BadReply {
                command: "3SA1".to_string(),
                detail: format!("expected 3 replies, got {}", replies.len()),
            });
        };

        let remaining = energy_wh(countdown, "3MA1")?;
        let total = energy_wh(total, "3PA45")?;
        let progress = DosageProgress {
            active: captured(state, "3SA1")? == "2",
            progress: total - remaining,
            remaining,
            total,
        };
        tracing::debug!(?progress, "Dosage progress");
        Ok(progress)
    }

    /// True while dosage mode is armed but not yet running, i.e. the
    /// current is switched off waiting for the start.
    pub async fn current_switched_off_for_dosage(&self) -> DriverResult<bool> {
        let replies = run_batch(
            &self.executor,
            vec![
                query("3SA1", r"^OK3SA1;([0123])$")?,
                query("3SA3", r"^OK3SA3;([012])$")?,
            ],
        )
        .await?;
        let [dosage, mode] = replies.as_slice() else {
            return Ok(false);
        };
        Ok(captured(mode, "3SA3")? == "2" && captured(dosage, "3SA1")? == "1")
    }
}
