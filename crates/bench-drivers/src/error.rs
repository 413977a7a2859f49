//! Driver-level errors.

use serial_proxy::{ErrorKind, ProtocolError, SerialError};
use thiserror::Error;

/// Failure of a device driver operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    /// The serial exchange itself failed.
    #[error(transparent)]
    Serial(#[from] SerialError),

    /// The device answered, but the reply could not be interpreted.
    #[error("unexpected reply to '{command}': {detail}")]
    BadReply {
        /// Command whose reply failed
        command: String,
        /// What was received
        detail: String,
    },

    /// Caller passed a value the device cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl DriverError {
    /// Coarse classification; parse failures count as protocol errors.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriverError::Serial(e) => e.kind(),
            DriverError::BadReply { .. } => ErrorKind::Protocol,
            DriverError::InvalidArgument(_) => ErrorKind::Handler,
        }
    }
}

impl From<ProtocolError> for DriverError {
    fn from(err: ProtocolError) -> Self {
        DriverError::Serial(SerialError::Protocol(err))
    }
}

/// Result alias for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;
