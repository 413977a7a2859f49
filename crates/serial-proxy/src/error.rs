//! Error types for the serial proxy.
//!
//! Every failure that can reach a caller is one of a small set of
//! distinguishable kinds:
//!
//! - **`Timeout`**: no matching reply arrived before the request deadline.
//! - **`Cancelled`**: the caller cancelled the request via its token.
//! - **`Protocol`**: the device answered, but not in the expected shape
//!   (NAK, out-of-band ACK, short reply, unparsable number, or an unexpected
//!   line in strict mode). Only the last one leaves the wire desynchronised.
//! - **`Transport`**: the underlying byte stream failed.
//! - **`Aborted`**: an earlier request of the same batch failed, so this one
//!   was never written to the wire.
//! - **`Faulted`**: the connection was poisoned by an earlier failure under
//!   the fail-fast desync policy and has not been reset.
//! - **`Closed`**: the connection has been shut down.
//!
//! All error types are `Clone` so a single failure can be fanned out to every
//! waiter of a [`ResponseShare`](crate::share::ResponseShare).

use std::time::Duration;
use thiserror::Error;

/// Coarse classification of a [`SerialError`], stable for fault mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No reply in time
    Timeout,
    /// Cancelled by the caller
    Cancelled,
    /// Reply of the wrong shape, or rejected by the device
    Protocol,
    /// Stream failure
    Transport,
    /// Skipped after an earlier failure in the batch
    Aborted,
    /// Connection poisoned under fail-fast
    Faulted,
    /// Connection shut down
    Closed,
    /// Raw handler failure
    Handler,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Transport => "transport",
            ErrorKind::Aborted => "aborted",
            ErrorKind::Faulted => "faulted",
            ErrorKind::Closed => "closed",
            ErrorKind::Handler => "handler",
        };
        write!(f, "{}", label)
    }
}

/// Failure of the raw byte/line stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Deadline passed before a complete line/byte arrived.
    #[error("read timed out")]
    Timeout,

    /// The cancellation token fired while waiting for data.
    #[error("read cancelled")]
    Cancelled,

    /// The peer closed the stream.
    #[error("port disconnected")]
    Disconnected,

    /// Any other I/O failure.
    #[error("I/O error ({kind:?}): {message}")]
    Io {
        /// Kind reported by the operating system.
        kind: std::io::ErrorKind,
        /// Human readable detail.
        message: String,
    },
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                TransportError::Timeout
            }
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof => TransportError::Disconnected,
            kind => TransportError::Io {
                kind,
                message: err.to_string(),
            },
        }
    }
}

impl From<serialport::Error> for TransportError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::NoDevice => TransportError::Disconnected,
            serialport::ErrorKind::Io(kind) => TransportError::Io {
                kind,
                message: err.description,
            },
            _ => TransportError::Io {
                kind: std::io::ErrorKind::Other,
                message: err.description,
            },
        }
    }
}

/// The device answered, but the answer is not what the protocol allows.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A line did not match the expected reply (strict mode only).
    #[error("unexpected reply '{line}' to '{command}' (expected {expected})")]
    UnexpectedReply {
        /// Command that was sent
        command: String,
        /// Line received
        line: String,
        /// Description of the matcher
        expected: String,
    },

    /// The device rejected the command.
    #[error("device rejected command (NAK) {detail:02X?}")]
    Nak {
        /// Bytes after the echoed command
        detail: Vec<u8>,
    },

    /// An ACK arrived for a different command than the one sent.
    #[error("out-of-band reply for command {received:#04X}, expected {expected:#04X}")]
    OutOfBand {
        /// Echoed command byte
        received: u8,
        /// Command byte sent
        expected: u8,
    },

    /// An ACK frame too short to carry the command echo.
    #[error("reply too short")]
    ReplyTooShort,

    /// Frame code is neither ACK nor NAK.
    #[error("unsupported reply code {0:#04X}")]
    UnsupportedCode(u8),

    /// Payload length does not fit the command or query.
    #[error("bad length {actual}, expected {expected}")]
    BadLength {
        /// Length the protocol allows
        expected: usize,
        /// Length seen
        actual: usize,
    },

    /// A numeric field could not be parsed.
    #[error("invalid number in reply '{0}'")]
    InvalidNumber(String),
}

impl ProtocolError {
    /// True if the wire position is unknown after this error.
    ///
    /// A complete frame or line the device chose to send (NAK, wrong echo,
    /// bad value) leaves the stream aligned; only an unexpected line in a
    /// strict exchange means replies may belong to someone else.
    pub fn desynchronizes(&self) -> bool {
        matches!(self, ProtocolError::UnexpectedReply { .. })
    }
}

/// Failure of the interface (audit) logger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("interface log error: {0}")]
pub struct LogError(pub String);

/// Error delivered to the caller of one request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerialError {
    /// No matching reply within the request deadline.
    #[error("no reply to '{command}' within {timeout:?}")]
    Timeout {
        /// Command that was sent
        command: String,
        /// Deadline that passed
        timeout: Duration,
    },

    /// Cancelled by the caller.
    #[error("request '{command}' cancelled")]
    Cancelled {
        /// Command or raw job that was cancelled
        command: String,
    },

    /// Unexpected reply shape or device rejection.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Underlying stream failure.
    #[error("transport error: {0}")]
    Transport(TransportError),

    /// Never sent because an earlier request of the batch failed.
    #[error("request '{command}' not sent: earlier request in batch failed")]
    Aborted {
        /// Command that was skipped
        command: String,
    },

    /// Connection poisoned by an earlier failure and not yet reset.
    #[error("connection '{0}' is faulted")]
    Faulted(String),

    /// Connection shut down.
    #[error("connection closed")]
    Closed,

    /// A raw execute handler failed for a reason of its own.
    #[error("handler failed: {0}")]
    Handler(String),
}

impl SerialError {
    /// Coarse classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SerialError::Timeout { .. } => ErrorKind::Timeout,
            SerialError::Cancelled { .. } => ErrorKind::Cancelled,
            SerialError::Protocol(_) => ErrorKind::Protocol,
            SerialError::Transport(_) => ErrorKind::Transport,
            SerialError::Aborted { .. } => ErrorKind::Aborted,
            SerialError::Faulted(_) => ErrorKind::Faulted,
            SerialError::Closed => ErrorKind::Closed,
            SerialError::Handler(_) => ErrorKind::Handler,
        }
    }

    /// Map a transport failure for `command` to the caller-facing error.
    ///
    /// Timeout and cancellation get their own variants so callers never have
    /// to look inside `Transport`.
    pub fn from_transport(err: TransportError, command: &str, timeout: Duration) -> Self {
        match err {
            TransportError::Timeout => SerialError::Timeout {
                command: command.to_string(),
                timeout,
            },
            TransportError::Cancelled => SerialError::Cancelled {
                command: command.to_string(),
            },
            other => SerialError::Transport(other),
        }
    }

    /// True if the wire state after this failure is unknown.
    pub fn desynchronizes(&self) -> bool {
        match self {
            SerialError::Timeout { .. } | SerialError::Cancelled { .. } | SerialError::Transport(_) => {
                true
            }
            SerialError::Protocol(e) => e.desynchronizes(),
            _ => false,
        }
    }
}

/// Invalid connection configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Endpoint missing for a device or network connection.
    #[error("endpoint required for {0} connections")]
    MissingEndpoint(&'static str),

    /// Unknown mock device name.
    #[error("unknown mock device '{0}'")]
    UnknownMock(String),

    /// A field value is out of range.
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },

    /// Port could not be opened.
    #[error("failed to open '{endpoint}': {message}")]
    Open { endpoint: String, message: String },
}

/// Result alias for per-request operations.
pub type SerialResult<T> = std::result::Result<T, SerialError>;
