//! Interface (audit) logging of everything sent to and received from a device.
//!
//! Each transfer is logged in two phases: [`InterfaceLogger::prepare`] before
//! the bytes move, [`PreparedLogEntry::finish`] afterwards with the payload and
//! any transfer error. Logging failures never abort a transfer; they are
//! reported through `tracing` only.

use crate::error::LogError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;

/// Kind of equipment producing interface traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSourceKind {
    /// Reference meter
    RefMeter,
    /// Error calculator
    ErrorCalculator,
    /// Voltage and current source
    Source,
    /// ZIF socket
    Zif,
    /// Burden
    Burden,
    /// Device under test
    Dut,
    /// The test system as a whole
    MeterTestSystem,
}

/// Which device produced a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogSource {
    /// Equipment kind
    pub kind: LogSourceKind,
    /// Connection endpoint
    pub endpoint: String,
    /// Position or instance id on a shared line
    pub id: Option<String>,
}

impl LogSource {
    /// Source without an instance id.
    pub fn new(kind: LogSourceKind, endpoint: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint: endpoint.into(),
            id: None,
        }
    }

    /// Attach an instance id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Correlation data fixed when an entry is prepared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogScope {
    /// Producing device
    pub source: LogSource,
    /// Shared by the outgoing and incoming entry of one exchange
    pub request_id: String,
    /// Direction
    pub outgoing: bool,
}

/// How `payload` is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    /// Dash separated hex bytes
    Raw,
    /// Plain text
    Utf8,
}

/// What was transferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPayload {
    /// How `payload` is rendered
    pub encoding: PayloadEncoding,
    /// Dash-separated hex for raw bytes, the text itself otherwise
    pub payload: String,
    /// Free-form classification, empty unless a driver sets one
    pub payload_type: String,
    /// Error text if the transfer failed
    pub transfer_exception: Option<String>,
}

impl LogPayload {
    /// Text payload.
    pub fn text(payload: impl Into<String>) -> Self {
        Self {
            encoding: PayloadEncoding::Utf8,
            payload: payload.into(),
            payload_type: String::new(),
            transfer_exception: None,
        }
    }

    /// Binary payload rendered as hex.
    pub fn raw(bytes: &[u8]) -> Self {
        Self {
            encoding: PayloadEncoding::Raw,
            payload: crate::request::hex(bytes),
            payload_type: String::new(),
            transfer_exception: None,
        }
    }

    /// Record a transfer failure.
    pub fn with_exception(mut self, error: Option<String>) -> Self {
        self.transfer_exception = error;
        self
    }
}

/// An entry waiting for its payload.
pub trait PreparedLogEntry: Send {
    /// Complete the entry.
    fn finish(self: Box<Self>, payload: LogPayload) -> Result<(), LogError>;
}

/// Sink for interface log entries.
pub trait InterfaceLogger: Send + Sync {
    /// Open an entry before a transfer.
    fn prepare(&self, scope: LogScope) -> Result<Box<dyn PreparedLogEntry>, LogError>;
}

/// Shared logger handle.
pub type SharedInterfaceLogger = Arc<dyn InterfaceLogger>;

// =============================================================================
// Correlation
// =============================================================================

/// Logger plus source bound to one exchange; handed to raw handlers.
#[derive(Clone)]
pub struct LogCorrelation {
    logger: SharedInterfaceLogger,
    source: LogSource,
    request_id: String,
}

impl std::fmt::Debug for LogCorrelation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogCorrelation")
            .field("source", &self.source)
            .field("request_id", &self.request_id)
            .finish()
    }
}

impl LogCorrelation {
    /// Bind `logger` to `source` for request `request_id`.
    pub fn new(logger: SharedInterfaceLogger, source: LogSource, request_id: impl Into<String>) -> Self {
        Self {
            logger,
            source,
            request_id: request_id.into(),
        }
    }

    /// Id shared by both directions of this exchange.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Producing device.
    pub fn source(&self) -> &LogSource {
        &self.source
    }

    /// Open an entry. A logger failure is reported and yields `None`.
    pub fn prepare(&self, outgoing: bool) -> Option<Box<dyn PreparedLogEntry>> {
        let scope = LogScope {
            source: self.source.clone(),
            request_id: self.request_id.clone(),
            outgoing,
        };
        match self.logger.prepare(scope) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::error!(request_id = %self.request_id, error = %e, "Unable to create log entry");
                None
            }
        }
    }

    /// Finish an entry opened by [`prepare`](Self::prepare).
    pub fn finish(entry: Option<Box<dyn PreparedLogEntry>>, payload: LogPayload) {
        if let Some(entry) = entry {
            if let Err(e) = entry.finish(payload) {
                tracing::error!(error = %e, "Unable to finish log entry");
            }
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInterfaceLogger;

struct NoopEntry;

impl PreparedLogEntry for NoopEntry {
    fn finish(self: Box<Self>, _payload: LogPayload) -> Result<(), LogError> {
        Ok(())
    }
}

impl InterfaceLogger for NoopInterfaceLogger {
    fn prepare(&self, _scope: LogScope) -> Result<Box<dyn PreparedLogEntry>, LogError> {
        Ok(Box::new(NoopEntry))
    }
}

/// One finished entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceLogEntry {
    /// Source, request and direction
    pub scope: LogScope,
    /// Transferred data
    pub payload: LogPayload,
    /// When `prepare` was called, before the transfer
    pub prepared_at: SystemTime,
}

/// Keeps entries in memory, in finish order.
#[derive(Debug, Clone, Default)]
pub struct MemoryInterfaceLogger {
    entries: Arc<Mutex<Vec<InterfaceLogEntry>>>,
}

impl MemoryInterfaceLogger {
    /// Empty logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all finished entries.
    pub fn entries(&self) -> Vec<InterfaceLogEntry> {
        self.entries.lock().clone()
    }

    /// Entries for one request id.
    pub fn for_request(&self, request_id: &str) -> Vec<InterfaceLogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.scope.request_id == request_id)
            .cloned()
            .collect()
    }

    /// Drop all entries.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

struct MemoryEntry {
    scope: LogScope,
    prepared_at: SystemTime,
    sink: Arc<Mutex<Vec<InterfaceLogEntry>>>,
}

impl PreparedLogEntry for MemoryEntry {
    fn finish(self: Box<Self>, payload: LogPayload) -> Result<(), LogError> {
        let MemoryEntry {
            scope,
            prepared_at,
            sink,
        } = *self;
        sink.lock().push(InterfaceLogEntry {
            scope,
            payload,
            prepared_at,
        });
        Ok(())
    }
}

impl InterfaceLogger for MemoryInterfaceLogger {
    fn prepare(&self, scope: LogScope) -> Result<Box<dyn PreparedLogEntry>, LogError> {
        Ok(Box::new(MemoryEntry {
            scope,
            prepared_at: SystemTime::now(),
            sink: Arc::clone(&self.entries),
        }))
    }
}

/// Emits entries as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingInterfaceLogger;

struct TracingEntry(LogScope);

impl PreparedLogEntry for TracingEntry {
    fn finish(self: Box<Self>, payload: LogPayload) -> Result<(), LogError> {
        let scope = &self.0;
        let direction = if scope.outgoing { "out" } else { "in" };
        match &payload.transfer_exception {
            None => tracing::info!(
                source = ?scope.source.kind,
                endpoint = %scope.source.endpoint,
                request_id = %scope.request_id,
                direction,
                payload = %payload.payload,
                "transfer"
            ),
            Some(error) => tracing::warn!(
                source = ?scope.source.kind,
                endpoint = %scope.source.endpoint,
                request_id = %scope.request_id,
                direction,
                payload = %payload.payload,
                error = %error,
                "transfer failed"
            ),
        }
        Ok(())
    }
}

impl InterfaceLogger for TracingInterfaceLogger {
    fn prepare(&self, scope: LogScope) -> Result<Box<dyn PreparedLogEntry>, LogError> {
        Ok(Box::new(TracingEntry(scope)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    struct BrokenLogger;

    impl InterfaceLogger for BrokenLogger {
        fn prepare(&self, _scope: LogScope) -> Result<Box<dyn PreparedLogEntry>, LogError> {
            Err(LogError("disk full".into()))
        }
    }

    fn source() -> LogSource {
        LogSource::new(LogSourceKind::Zif, "mock://zif").with_id("1")
    }

    #[test]
    fn test_memory_logger_records_both_directions() {
        let logger = MemoryInterfaceLogger::new();
        let correlation = LogCorrelation::new(Arc::new(logger.clone()), source(), "7");

        let out = correlation.prepare(true);
        LogCorrelation::finish(out, LogPayload::raw(&[0xA5, 0x5A]));
        let incoming = correlation.prepare(false);
        LogCorrelation::finish(
            incoming,
            LogPayload::raw(&[]).with_exception(Some("timeout".into())),
        );

        let entries = logger.for_request("7");
        assert_eq!(entries.len(), 2);
        assert!(entries[0].scope.outgoing);
        assert_eq!(entries[0].payload.payload, "A5-5A");
        assert_eq!(entries[1].payload.transfer_exception.as_deref(), Some("timeout"));
    }

    #[traced_test]
    #[test]
    fn test_logger_failure_is_reported_not_raised() {
        let correlation = LogCorrelation::new(Arc::new(BrokenLogger), source(), "1");
        let entry = correlation.prepare(true);
        assert!(entry.is_none());
        LogCorrelation::finish(entry, LogPayload::text("AAV"));
        assert!(logs_contain("Unable to create log entry"));
    }

    #[traced_test]
    #[test]
    fn test_tracing_logger_emits_events() {
        let correlation = LogCorrelation::new(Arc::new(TracingInterfaceLogger), source(), "3");
        LogCorrelation::finish(correlation.prepare(true), LogPayload::text("AAV"));
        assert!(logs_contain("transfer"));
    }
}
