//! Single-writer serial connection.
//!
//! A [`SerialPortConnection`] owns one [`Transport`] and one dedicated worker
//! thread. Callers never touch the transport: they submit batches of
//! [`SerialPortRequest`]s (or raw handlers) to a FIFO queue and await the
//! returned [`ReplyHandle`]s. The worker drains the queue strictly in order,
//! writing a request, reading until its matchers are satisfied, resolving its
//! handle and only then moving on. A batch is processed contiguously; once a
//! request of a batch fails, the remaining requests of that batch are failed
//! with [`SerialError::Aborted`] without being written.
//!
//! # Example
//!
//! ```rust,no_run
//! use serial_proxy::{PortConfig, SerialPortConnection, SerialPortRequest};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let connection = SerialPortConnection::open("refmeter", &PortConfig::mock("mt786"))?;
//! let mut handles = connection.execute(vec![SerialPortRequest::create("AAV", "AAVACK")]);
//! let reply = handles.remove(0).await?;
//! assert_eq!(reply.lines, vec!["MT786V06.33", "AAVACK"]);
//! connection.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::config::{DesyncPolicy, PortConfig, SerialPortOptions};
use crate::error::{ConfigError, SerialError, SerialResult, TransportError};
use crate::interface_log::{
    LogCorrelation, LogPayload, LogSource, NoopInterfaceLogger, SharedInterfaceLogger,
};
use crate::request::{MatchState, Matcher, Payload, Reply, RequestMatcher, SerialPortRequest};
use crate::transport::{open_transport, DynTransport, Transport};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// How long [`SerialPortConnection::shutdown`] waits for the worker.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A raw handler plus its reply channel, type-erased for the queue.
trait RawTask: Send {
    /// Run on the worker; returns the error (if any) for the desync policy.
    fn run(
        self: Box<Self>,
        port: &mut dyn Transport,
        correlation: &LogCorrelation,
        cancel: &CancellationToken,
    ) -> Option<SerialError>;

    /// Fail without running.
    fn refuse(self: Box<Self>, error: SerialError);
}

struct RawCall<T, F> {
    handler: F,
    reply: oneshot::Sender<SerialResult<T>>,
}

impl<T, F> RawTask for RawCall<T, F>
where
    T: Send,
    F: FnOnce(&mut dyn Transport, &LogCorrelation, &CancellationToken) -> SerialResult<T> + Send,
{
    fn run(
        self: Box<Self>,
        port: &mut dyn Transport,
        correlation: &LogCorrelation,
        cancel: &CancellationToken,
    ) -> Option<SerialError> {
        let result = (self.handler)(port, correlation, cancel);
        let error = result.as_ref().err().cloned();
        let _ = self.reply.send(result);
        error
    }

    fn refuse(self: Box<Self>, error: SerialError) {
        let _ = self.reply.send(Err(error));
    }
}

enum Job {
    Batch {
        requests: Vec<Queued>,
        log: Option<LogBinding>,
    },
    Raw {
        id: u64,
        log: LogBinding,
        cancel: Option<CancellationToken>,
        task: Box<dyn RawTask>,
    },
}

struct Queued {
    id: u64,
    request: SerialPortRequest,
    reply: oneshot::Sender<SerialResult<Reply>>,
}

#[derive(Clone)]
struct LogBinding {
    logger: SharedInterfaceLogger,
    source: LogSource,
}

/// State shared between the connection handle and its worker.
struct Shared {
    name: String,
    closing: AtomicBool,
    fault: Mutex<Option<String>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    in_flight: Mutex<Option<CancellationToken>>,
}

impl Shared {
    fn fault_reason(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    /// Token for one request: caller's token (if any) linked below, and
    /// cancelled by shutdown via `in_flight`.
    fn begin(&self, caller: Option<&CancellationToken>) -> CancellationToken {
        let token = match caller {
            Some(caller) => caller.child_token(),
            None => self.shutdown.child_token(),
        };
        *self.in_flight.lock() = Some(token.clone());
        if self.closing.load(Ordering::SeqCst) {
            token.cancel();
        }
        token
    }

    fn end(&self) {
        *self.in_flight.lock() = None;
    }
}

// =============================================================================
// Reply Handle
// =============================================================================

/// Future resolving to the outcome of one submitted request or raw job.
///
/// Dropping the handle does not cancel the request; use the request's
/// cancellation token for that.
#[derive(Debug)]
pub struct ReplyHandle<T = Reply> {
    id: u64,
    rx: oneshot::Receiver<SerialResult<T>>,
}

impl<T> ReplyHandle<T> {
    fn new(id: u64) -> (oneshot::Sender<SerialResult<T>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { id, rx })
    }

    fn resolved(id: u64, result: SerialResult<T>) -> Self {
        let (tx, handle) = Self::new(id);
        let _ = tx.send(result);
        handle
    }

    /// Submission sequence number; also the interface log request id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Future for ReplyHandle<T> {
    type Output = SerialResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(SerialError::Closed)))
    }
}

// =============================================================================
// Connection
// =============================================================================

/// Exclusive owner of one serial line.
pub struct SerialPortConnection {
    shared: Arc<Shared>,
    queue: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    options: SerialPortOptions,
    endpoint: String,
}

impl std::fmt::Debug for SerialPortConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialPortConnection")
            .field("name", &self.shared.name)
            .field("endpoint", &self.endpoint)
            .field("faulted", &self.is_faulted())
            .finish()
    }
}

impl SerialPortConnection {
    /// Open the transport described by `config` and start the worker.
    pub fn open(name: impl Into<String>, config: &PortConfig) -> Result<Self, ConfigError> {
        let transport = open_transport(config)?;
        Self::from_transport(name, transport, config.options.clone())
    }

    /// Start a worker around an already opened transport.
    pub fn from_transport(
        name: impl Into<String>,
        transport: DynTransport,
        options: SerialPortOptions,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let endpoint = transport.describe();
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            name: name.clone(),
            closing: AtomicBool::new(false),
            fault: Mutex::new(None),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            in_flight: Mutex::new(None),
        });

        let worker = Worker {
            port: transport,
            shared: Arc::clone(&shared),
            options: options.clone(),
        };
        let handle = std::thread::Builder::new()
            .name(format!("serial-{}", name))
            .spawn(move || worker.run(rx))
            .map_err(|e| ConfigError::Open {
                endpoint: endpoint.clone(),
                message: format!("failed to start worker thread: {}", e),
            })?;

        tracing::info!(connection = %name, endpoint = %endpoint, "Serial connection started");
        Ok(Self {
            shared,
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
            options,
            endpoint,
        })
    }

    /// Connection name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Transport description.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Options the connection was started with.
    pub fn options(&self) -> &SerialPortOptions {
        &self.options
    }

    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Submit a batch; one handle per request, in order.
    pub fn execute(&self, requests: Vec<SerialPortRequest>) -> Vec<ReplyHandle> {
        self.submit(requests, None)
    }

    /// Submit a batch with interface logging of every transfer.
    pub fn execute_logged(
        &self,
        logger: SharedInterfaceLogger,
        source: LogSource,
        requests: Vec<SerialPortRequest>,
    ) -> Vec<ReplyHandle> {
        self.submit(requests, Some(LogBinding { logger, source }))
    }

    fn submit(&self, requests: Vec<SerialPortRequest>, log: Option<LogBinding>) -> Vec<ReplyHandle> {
        let ids: Vec<u64> = requests.iter().map(|_| self.next_id()).collect();

        if let Some(error) = self.refusal() {
            return ids
                .into_iter()
                .map(|id| ReplyHandle::resolved(id, Err(error.clone())))
                .collect();
        }

        let mut handles = Vec::with_capacity(requests.len());
        let mut queued = Vec::with_capacity(requests.len());
        for (id, request) in ids.into_iter().zip(requests) {
            let (reply, handle) = ReplyHandle::new(id);
            handles.push(handle);
            queued.push(Queued { id, request, reply });
        }

        if let Err(mpsc::error::SendError(job)) = self.send(Job::Batch {
            requests: queued,
            log,
        }) {
            if let Job::Batch { requests, .. } = job {
                for pending in requests {
                    let _ = pending.reply.send(Err(SerialError::Closed));
                }
            }
        }
        handles
    }

    /// Run `handler` on the worker thread with exclusive transport access.
    ///
    /// The handler gets the transport, a log correlation bound to `source`
    /// and a cancellation token that fires on shutdown.
    pub fn raw_execute<T, F>(
        &self,
        logger: SharedInterfaceLogger,
        source: LogSource,
        handler: F,
    ) -> ReplyHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Transport, &LogCorrelation, &CancellationToken) -> SerialResult<T>
            + Send
            + 'static,
    {
        self.submit_raw(logger, source, None, handler)
    }

    /// Like [`raw_execute`](Self::raw_execute), but the handler's token also
    /// fires when `cancel` is cancelled. A job cancelled while still queued
    /// never runs.
    pub fn raw_execute_with_cancellation<T, F>(
        &self,
        logger: SharedInterfaceLogger,
        source: LogSource,
        cancel: CancellationToken,
        handler: F,
    ) -> ReplyHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Transport, &LogCorrelation, &CancellationToken) -> SerialResult<T>
            + Send
            + 'static,
    {
        self.submit_raw(logger, source, Some(cancel), handler)
    }

    fn submit_raw<T, F>(
        &self,
        logger: SharedInterfaceLogger,
        source: LogSource,
        cancel: Option<CancellationToken>,
        handler: F,
    ) -> ReplyHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Transport, &LogCorrelation, &CancellationToken) -> SerialResult<T>
            + Send
            + 'static,
    {
        let id = self.next_id();
        if let Some(error) = self.refusal() {
            return ReplyHandle::resolved(id, Err(error));
        }

        let (reply, handle) = ReplyHandle::new(id);
        let task = Box::new(RawCall { handler, reply });

        if let Err(mpsc::error::SendError(Job::Raw { task, .. })) = self.send(Job::Raw {
            id,
            log: LogBinding { logger, source },
            cancel,
            task,
        }) {
            task.refuse(SerialError::Closed);
        }
        handle
    }

    /// Bind a log source for drivers sharing this connection.
    pub fn create_executor(
        self: &Arc<Self>,
        source: LogSource,
        logger: SharedInterfaceLogger,
    ) -> SerialPortExecutor {
        SerialPortExecutor {
            connection: Arc::clone(self),
            source,
            logger,
        }
    }

    fn refusal(&self) -> Option<SerialError> {
        if self.shared.closing.load(Ordering::SeqCst) {
            return Some(SerialError::Closed);
        }
        self.shared
            .fault_reason()
            .map(|_| SerialError::Faulted(self.shared.name.clone()))
    }

    fn send(&self, job: Job) -> Result<(), mpsc::error::SendError<Job>> {
        match self.queue.lock().as_ref() {
            Some(queue) => queue.send(job),
            None => Err(mpsc::error::SendError(job)),
        }
    }

    /// True after a desynchronising failure under [`DesyncPolicy::FailFast`].
    pub fn is_faulted(&self) -> bool {
        self.shared.fault.lock().is_some()
    }

    /// Clear the faulted state so the connection serves again.
    pub fn reset(&self) {
        if let Some(reason) = self.shared.fault.lock().take() {
            tracing::info!(connection = %self.shared.name, reason = %reason, "Connection reset");
        }
    }

    /// True once shutdown has begun.
    pub fn is_closed(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst)
    }

    /// Stop accepting work, interrupt the in-flight request and fail every
    /// queued job with [`SerialError::Closed`].
    fn close(&self) -> Option<JoinHandle<()>> {
        if !self.shared.closing.swap(true, Ordering::SeqCst) {
            tracing::info!(connection = %self.shared.name, "Closing serial connection");
        }
        self.shared.shutdown.cancel();
        if let Some(token) = self.shared.in_flight.lock().as_ref() {
            token.cancel();
        }
        self.queue.lock().take();
        self.worker.lock().take()
    }

    /// Close the connection and wait for the worker to release the port.
    pub async fn shutdown(&self) {
        let Some(handle) = self.close() else {
            return;
        };
        let joined = tokio::time::timeout(
            SHUTDOWN_JOIN_TIMEOUT,
            tokio::task::spawn_blocking(move || handle.join()),
        )
        .await;
        match joined {
            Ok(Ok(Ok(()))) => {
                tracing::debug!(connection = %self.shared.name, "Worker stopped")
            }
            Ok(_) => tracing::error!(connection = %self.shared.name, "Worker panicked"),
            Err(_) => tracing::warn!(
                connection = %self.shared.name,
                timeout_secs = SHUTDOWN_JOIN_TIMEOUT.as_secs(),
                "Worker did not stop in time"
            ),
        }
    }
}

impl Drop for SerialPortConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.close() {
            if handle.join().is_err() {
                tracing::error!(connection = %self.shared.name, "Worker panicked");
            }
        }
    }
}

// =============================================================================
// Executor
// =============================================================================

/// A connection bound to one log source and interface logger.
///
/// Drivers keep one of these per device position; cloning is cheap.
#[derive(Clone)]
pub struct SerialPortExecutor {
    connection: Arc<SerialPortConnection>,
    source: LogSource,
    logger: SharedInterfaceLogger,
}

impl std::fmt::Debug for SerialPortExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialPortExecutor")
            .field("connection", &self.connection.name())
            .field("source", &self.source)
            .finish()
    }
}

impl SerialPortExecutor {
    /// Executor without interface logging.
    pub fn unlogged(connection: Arc<SerialPortConnection>, source: LogSource) -> Self {
        Self {
            connection,
            source,
            logger: Arc::new(NoopInterfaceLogger),
        }
    }

    /// Submit a logged batch.
    pub fn execute(&self, requests: Vec<SerialPortRequest>) -> Vec<ReplyHandle> {
        self.connection
            .execute_logged(Arc::clone(&self.logger), self.source.clone(), requests)
    }

    /// Run a raw handler with this executor's log binding.
    pub fn raw_execute<T, F>(&self, handler: F) -> ReplyHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Transport, &LogCorrelation, &CancellationToken) -> SerialResult<T>
            + Send
            + 'static,
    {
        self.connection
            .raw_execute(Arc::clone(&self.logger), self.source.clone(), handler)
    }

    /// Run a raw handler that also stops when `cancel` fires.
    pub fn raw_execute_with_cancellation<T, F>(
        &self,
        cancel: CancellationToken,
        handler: F,
    ) -> ReplyHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Transport, &LogCorrelation, &CancellationToken) -> SerialResult<T>
            + Send
            + 'static,
    {
        self.connection.raw_execute_with_cancellation(
            Arc::clone(&self.logger),
            self.source.clone(),
            cancel,
            handler,
        )
    }

    /// Underlying connection.
    pub fn connection(&self) -> &Arc<SerialPortConnection> {
        &self.connection
    }

    /// Bound log source.
    pub fn source(&self) -> &LogSource {
        &self.source
    }

    /// Default read timeout of the connection.
    pub fn read_timeout(&self) -> Duration {
        self.connection.options().read_timeout()
    }
}

// =============================================================================
// Worker
// =============================================================================

struct Worker {
    port: DynTransport,
    shared: Arc<Shared>,
    options: SerialPortOptions,
}

impl Worker {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Job>) {
        let span = tracing::info_span!("serial_worker", connection = %self.shared.name);
        let _enter = span.enter();
        tracing::debug!("Worker started");

        while let Some(job) = rx.blocking_recv() {
            match job {
                Job::Batch { requests, log } => self.process_batch(requests, log.as_ref()),
                Job::Raw {
                    id,
                    log,
                    cancel,
                    task,
                } => self.process_raw(id, &log, cancel.as_ref(), task),
            }
        }

        tracing::debug!(endpoint = %self.port.describe(), "Worker stopped, releasing port");
    }

    /// Error for a job that must not touch the wire, if any.
    fn refusal(&self) -> Option<SerialError> {
        if self.shared.closing.load(Ordering::SeqCst) {
            return Some(SerialError::Closed);
        }
        self.shared
            .fault_reason()
            .map(|_| SerialError::Faulted(self.shared.name.clone()))
    }

    fn process_batch(&mut self, requests: Vec<Queued>, log: Option<&LogBinding>) {
        let mut batch_failed = false;
        for queued in requests {
            let Queued { id, request, reply } = queued;

            if batch_failed && !self.shared.closing.load(Ordering::SeqCst) {
                let _ = reply.send(Err(SerialError::Aborted {
                    command: request.command(),
                }));
                continue;
            }
            if let Some(error) = self.refusal() {
                let _ = reply.send(Err(error));
                continue;
            }

            let started = Instant::now();
            let result = self.exchange(id, &request, log);
            match &result {
                Ok(reply) => tracing::debug!(
                    request_id = id,
                    command = %request.command(),
                    lines = reply.lines.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Request complete"
                ),
                Err(error) => {
                    tracing::warn!(
                        request_id = id,
                        command = %request.command(),
                        error = %error,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Request failed"
                    );
                    batch_failed = true;
                    self.after_failure(error);
                }
            }
            let _ = reply.send(result);
        }
    }

    fn process_raw(
        &mut self,
        id: u64,
        log: &LogBinding,
        cancel: Option<&CancellationToken>,
        task: Box<dyn RawTask>,
    ) {
        if let Some(error) = self.refusal() {
            task.refuse(error);
            return;
        }
        // cancelled while queued: never touches the wire
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            task.refuse(SerialError::Cancelled {
                command: format!("raw job {}", id),
            });
            return;
        }

        let correlation = LogCorrelation::new(Arc::clone(&log.logger), log.source.clone(), id.to_string());
        let token = self.shared.begin(cancel);
        let error = task.run(self.port.as_mut(), &correlation, &token);
        self.shared.end();

        if let Some(error) = error {
            tracing::warn!(request_id = id, error = %error, "Raw job failed");
            self.after_failure(&error);
        }
    }

    /// Apply the desync policy after a failed request.
    fn after_failure(&mut self, error: &SerialError) {
        if !error.desynchronizes() || self.shared.closing.load(Ordering::SeqCst) {
            return;
        }
        match self.options.desync_policy {
            DesyncPolicy::Resync => {
                let discarded = self.port.discard_input(self.options.drain_window());
                tracing::debug!(discarded, "Resynchronised after failure");
            }
            DesyncPolicy::FailFast => {
                tracing::error!(error = %error, "Connection faulted");
                *self.shared.fault.lock() = Some(error.to_string());
            }
        }
    }

    fn exchange(
        &mut self,
        id: u64,
        request: &SerialPortRequest,
        log: Option<&LogBinding>,
    ) -> SerialResult<Reply> {
        let command = request.command();
        let timeout = request.timeout().unwrap_or_else(|| self.options.read_timeout());

        let token = self.shared.begin(request.cancellation());
        let result = self.exchange_with(id, request, log, &command, timeout, &token);
        self.shared.end();
        result
    }

    fn exchange_with(
        &mut self,
        id: u64,
        request: &SerialPortRequest,
        log: Option<&LogBinding>,
        command: &str,
        timeout: Duration,
        token: &CancellationToken,
    ) -> SerialResult<Reply> {
        let shared = Arc::clone(&self.shared);
        let map_err = |e: TransportError| {
            if e == TransportError::Cancelled && shared.closing.load(Ordering::SeqCst) {
                SerialError::Closed
            } else {
                SerialError::from_transport(e, command, timeout)
            }
        };

        // cancelled before the write: never touches the wire
        if token.is_cancelled() {
            return Err(map_err(TransportError::Cancelled));
        }

        let correlation = log.map(|l| LogCorrelation::new(Arc::clone(&l.logger), l.source.clone(), id.to_string()));

        let entry = correlation.as_ref().and_then(|c| c.prepare(true));
        let (written, outgoing) = match request.payload() {
            Payload::Line(line) => (self.port.write_line(line), LogPayload::text(line.clone())),
            Payload::Bytes(bytes) => (self.port.raw_write(bytes), LogPayload::raw(bytes)),
        };
        LogCorrelation::finish(
            entry,
            outgoing.with_exception(written.as_ref().err().map(ToString::to_string)),
        );
        written.map_err(map_err)?;

        let deadline = Instant::now() + timeout;
        let entry = correlation.as_ref().and_then(|c| c.prepare(false));
        let (result, incoming) = if request.reads_raw() {
            let mut seen = Vec::new();
            let result = self.read_bytes(request, deadline, token, &mut seen);
            (result, LogPayload::raw(&seen))
        } else {
            let mut seen = Vec::new();
            let result = self.read_lines(request, deadline, token, &mut seen);
            (result, LogPayload::text(seen.join("\n")))
        };
        let result = result.map_err(|e| match e {
            ReadError::Transport(e) => map_err(e),
            ReadError::Serial(e) => e,
        });
        LogCorrelation::finish(
            entry,
            incoming.with_exception(result.as_ref().err().map(ToString::to_string)),
        );
        result
    }

    fn read_lines(
        &mut self,
        request: &SerialPortRequest,
        deadline: Instant,
        token: &CancellationToken,
        seen: &mut Vec<String>,
    ) -> Result<Reply, ReadError> {
        let mut matcher = RequestMatcher::new(request);
        while matcher.state() != MatchState::Complete {
            let line = self
                .port
                .read_line(deadline, token)
                .map_err(ReadError::Transport)?;
            seen.push(line.clone());
            matcher
                .feed(line)
                .map_err(|e| ReadError::Serial(SerialError::Protocol(e)))?;
        }
        Ok(matcher.finish())
    }

    fn read_bytes(
        &mut self,
        request: &SerialPortRequest,
        deadline: Instant,
        token: &CancellationToken,
        seen: &mut Vec<u8>,
    ) -> Result<Reply, ReadError> {
        let count = match request.steps().first().map(|s| &s.matcher) {
            Some(Matcher::ByteLength(count)) => *count,
            _ => 0,
        };
        while seen.len() < count {
            match self.port.raw_read(deadline, token).map_err(ReadError::Transport)? {
                Some(byte) => seen.push(byte),
                None => return Err(ReadError::Transport(TransportError::Disconnected)),
            }
        }
        Ok(Reply {
            lines: Vec::new(),
            raw: seen.clone(),
            end_match: None,
        })
    }
}

enum ReadError {
    Transport(TransportError),
    Serial(SerialError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedPort;

    fn connection(port: ScriptedPort) -> SerialPortConnection {
        SerialPortConnection::from_transport(
            "test",
            Box::new(port),
            SerialPortOptions::unit_test(Duration::from_millis(100)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_scenario_collects_data_and_terminal_line() {
        let conn = connection(ScriptedPort::new("mt").reply("AAV", ["MT786V06.33", "AAVACK"]));

        let mut handles = conn.execute(vec![SerialPortRequest::create("AAV", "AAVACK")]);
        let reply = handles.remove(0).await.unwrap();

        assert_eq!(reply.lines, vec!["MT786V06.33", "AAVACK"]);
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn test_ids_increase_per_request() {
        let conn = connection(crate::mock::counting());
        let handles = conn.execute(vec![
            SerialPortRequest::create("START", "STOP"),
            SerialPortRequest::create("START", "STOP"),
        ]);
        assert!(handles[0].id() < handles[1].id());
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_closed() {
        let conn = connection(crate::mock::counting());
        conn.shutdown().await;

        let mut handles = conn.execute(vec![SerialPortRequest::create("START", "STOP")]);
        assert_eq!(handles.remove(0).await, Err(SerialError::Closed));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_drop_releases_transport() {
        let port = crate::mock::counting();
        let handle = port.handle();
        let conn = connection(port);
        drop(conn);
        assert!(handle.is_dropped());
    }
}
