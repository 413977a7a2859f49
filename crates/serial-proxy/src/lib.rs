//! `serial-proxy`
//!
//! Single-writer request/response multiplexing for shared serial lines.
//!
//! Test-bench equipment (reference meters, sources, ZIF sockets) talks
//! half-duplex command/response protocols over serial lines that several
//! drivers share. This crate gives every line exactly one owner:
//!
//! - [`SerialPortConnection`]: one worker thread per line, FIFO request
//!   queue, per-request timeouts and cancellation, batch semantics.
//! - [`SerialPortRequest`] / [`Matcher`]: what to send and how to recognise
//!   the reply (exact line, regex with captures, byte count).
//! - [`frame`]: the CRC8/MAXIM framed binary protocol (`A5 .. 5A`).
//! - [`ResponseShare`]: single-flight de-duplication of idempotent queries.
//! - [`interface_log`]: two-phase audit logging of every transfer.
//! - [`ConnectionRegistry`]: one connection per device id.
//!
//! ## Example
//!
//! ```rust,no_run
//! use serial_proxy::{PortConfig, SerialPortConnection, SerialPortRequest};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connection = SerialPortConnection::open("refmeter", &PortConfig::device("/dev/ttyUSB0"))?;
//! let handles = connection.execute(vec![
//!     SerialPortRequest::create("ATI01", "ATIACK"),
//!     SerialPortRequest::create("AME", "AMEACK"),
//! ]);
//! for handle in handles {
//!     println!("{:?}", handle.await?.lines);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod interface_log;
pub mod mock;
pub mod registry;
pub mod request;
pub mod share;
pub mod transport;

pub use config::{DesyncPolicy, Parity, PortConfig, PortKind, SerialPortOptions};
pub use connection::{ReplyHandle, SerialPortConnection, SerialPortExecutor};
pub use error::{ConfigError, ErrorKind, ProtocolError, SerialError, SerialResult, TransportError};
pub use interface_log::{
    InterfaceLogger, LogCorrelation, LogPayload, LogSource, LogSourceKind, MemoryInterfaceLogger,
    NoopInterfaceLogger, SharedInterfaceLogger, TracingInterfaceLogger,
};
pub use registry::{ConnectionRegistry, SharedConnection};
pub use request::{MatchResult, Matcher, Reply, SerialPortRequest, Strictness};
pub use share::ResponseShare;
pub use transport::{DynTransport, StreamTransport, Transport};

/// Re-exported so callers can build cancellation tokens without a direct
/// `tokio-util` dependency.
pub use tokio_util::sync::CancellationToken;
