//! `bench-drivers`
//!
//! Device clients for a meter test bench, built on [`serial_proxy`].
//!
//! Each driver holds a [`SerialPortExecutor`] bound to its log source and
//! never touches the serial line directly:
//!
//! - [`RefMeter`]: MT786 reference meter (line protocol, shared actual values)
//! - [`FgSource`]: FG30x source dosage commands (regex terminal replies)
//! - [`PowerMaster8121`]: ZIF socket (CRC8 framed binary protocol)

pub mod error;
pub mod fg_source;
pub mod ref_meter;
pub mod zif;

pub use error::{DriverError, DriverResult};
pub use fg_source::{DosageProgress, FgSource};
pub use ref_meter::{ActualValues, FirmwareVersion, MeasurementMode, PhaseValues, RefMeter};
pub use zif::{PowerMaster8121, ZifStatus, ZifVersion};

use futures::future::join_all;
use serial_proxy::{Reply, SerialPortExecutor, SerialPortRequest};

/// Submit `requests` as one batch and wait for every reply.
///
/// The first failure in batch order is returned; later requests of a failed
/// batch only ever report `Aborted`.
pub(crate) async fn run_batch(
    executor: &SerialPortExecutor,
    requests: Vec<SerialPortRequest>,
) -> DriverResult<Vec<Reply>> {
    let replies = join_all(executor.execute(requests)).await;
    Ok(replies.into_iter().collect::<Result<Vec<_>, _>>()?)
}
