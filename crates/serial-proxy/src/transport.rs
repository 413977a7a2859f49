//! Byte/line transports.
//!
//! A [`Transport`] is the raw stream under a connection. It is blocking and
//! owned by exactly one worker thread, so implementations never need locks.
//! Every wait takes a deadline and a [`CancellationToken`]; implementations
//! check both at least once per poll slice.
//!
//! - [`StreamTransport`] adapts any `Read + Write` stream (serial device,
//!   TCP socket) with CR/LF tolerant line splitting.
//! - [`open_transport`] builds the right transport for a [`PortConfig`].

use crate::config::{PortConfig, PortKind, SerialPortOptions};
use crate::error::{ConfigError, TransportError};
use crate::mock;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Blocking byte/line stream owned by a connection worker.
pub trait Transport: Send {
    /// Write `line` followed by the line terminator.
    fn write_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Read the next non-empty line, without its terminator.
    fn read_line(
        &mut self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<String, TransportError>;

    /// Write bytes as-is.
    fn raw_write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read one byte. `Ok(None)` means the stream ended.
    fn raw_read(
        &mut self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Option<u8>, TransportError>;

    /// Discard whatever arrives within `window`. Returns the bytes dropped.
    fn discard_input(&mut self, _window: Duration) -> usize {
        0
    }

    /// Human readable endpoint for logs.
    fn describe(&self) -> String;
}

/// Type-erased transport.
pub type DynTransport = Box<dyn Transport>;

// =============================================================================
// Stream Transport
// =============================================================================

/// Line/byte transport over a blocking `Read + Write` stream.
///
/// The stream must be configured with a short read timeout (the poll slice);
/// a timed-out read simply means "nothing yet".
pub struct StreamTransport<S> {
    stream: S,
    name: String,
    terminator: Vec<u8>,
    buffer: VecDeque<u8>,
}

impl<S: Read + Write + Send> StreamTransport<S> {
    /// Wrap `stream`, appending `terminator` to written lines.
    pub fn new(stream: S, name: impl Into<String>, terminator: &str) -> Self {
        Self {
            stream,
            name: name.into(),
            terminator: terminator.as_bytes().to_vec(),
            buffer: VecDeque::new(),
        }
    }

    /// Read one chunk into the buffer. Returns false at end of stream.
    fn fill(&mut self, deadline: Instant, cancel: &CancellationToken) -> Result<bool, TransportError> {
        let mut chunk = [0u8; 256];
        loop {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout);
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.buffer.extend(&chunk[..n]);
                    return Ok(true);
                }
                Err(e) if is_idle(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Pop the next complete non-empty line from the buffer.
    fn take_line(&mut self) -> Option<String> {
        loop {
            let end = self.buffer.iter().position(|b| *b == b'\r' || *b == b'\n')?;
            let line: Vec<u8> = self.buffer.drain(..end).collect();
            self.buffer.pop_front();
            if !line.is_empty() {
                return Some(String::from_utf8_lossy(&line).into_owned());
            }
        }
    }
}

fn is_idle(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted
    )
}

impl<S: Read + Write + Send> Transport for StreamTransport<S> {
    fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let mut bytes = Vec::with_capacity(line.len() + self.terminator.len());
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(&self.terminator);
        self.raw_write(&bytes)
    }

    fn read_line(
        &mut self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<String, TransportError> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }
            if !self.fill(deadline, cancel)? {
                return Err(TransportError::Disconnected);
            }
        }
    }

    fn raw_write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    fn raw_read(
        &mut self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Option<u8>, TransportError> {
        loop {
            if let Some(byte) = self.buffer.pop_front() {
                return Ok(Some(byte));
            }
            if !self.fill(deadline, cancel)? {
                return Ok(None);
            }
        }
    }

    fn discard_input(&mut self, window: Duration) -> usize {
        let mut discarded = self.buffer.len();
        self.buffer.clear();
        let deadline = Instant::now() + window;
        let never = CancellationToken::new();
        while let Ok(true) = self.fill(deadline, &never) {
            discarded += self.buffer.len();
            self.buffer.clear();
        }
        discarded
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

// =============================================================================
// Factories
// =============================================================================

/// Open a local serial device with the configured line settings.
pub fn open_serial(
    path: &str,
    options: &SerialPortOptions,
) -> Result<StreamTransport<Box<dyn serialport::SerialPort>>, ConfigError> {
    let port = serialport::new(path, options.baud_rate)
        .data_bits(options.serial_data_bits()?)
        .parity(options.parity.into())
        .stop_bits(options.serial_stop_bits()?)
        .flow_control(serialport::FlowControl::None)
        .timeout(options.poll_interval())
        .open()
        .map_err(|e| ConfigError::Open {
            endpoint: path.to_string(),
            message: e.to_string(),
        })?;

    tracing::info!(port = %path, baud = options.baud_rate, "Opened serial port");
    Ok(StreamTransport::new(port, path, &options.line_terminator))
}

/// Connect to a serial-over-TCP bridge at `host:port`.
pub fn open_network(
    address: &str,
    options: &SerialPortOptions,
) -> Result<StreamTransport<TcpStream>, ConfigError> {
    let open_err = |e: std::io::Error| ConfigError::Open {
        endpoint: address.to_string(),
        message: e.to_string(),
    };
    let stream = TcpStream::connect(address).map_err(open_err)?;
    stream
        .set_read_timeout(Some(options.poll_interval()))
        .map_err(open_err)?;
    stream.set_nodelay(true).map_err(open_err)?;

    tracing::info!(address = %address, "Connected to network serial bridge");
    Ok(StreamTransport::new(
        stream,
        format!("tcp://{}", address),
        &options.line_terminator,
    ))
}

/// Build the transport for `config`.
pub fn open_transport(config: &PortConfig) -> Result<DynTransport, ConfigError> {
    config.validate()?;
    let endpoint = config.require_endpoint()?;
    match config.kind {
        PortKind::Device => Ok(Box::new(open_serial(endpoint, &config.options)?)),
        PortKind::Network => Ok(Box::new(open_network(endpoint, &config.options)?)),
        PortKind::Mock => mock::named(endpoint),
    }
}
