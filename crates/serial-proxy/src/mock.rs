//! Scripted mock transports for tests and bench simulation.
//!
//! [`ScriptedPort`] is a [`Transport`] whose replies come from a script:
//! fixed replies per command, a fallback responder closure, or a byte
//! responder for framed protocols. A cloneable [`MockHandle`] stays with the
//! test to inspect what was written, push unsolicited input and check which
//! threads touched the port.
//!
//! # Example
//!
//! ```rust
//! use serial_proxy::mock::ScriptedPort;
//!
//! let port = ScriptedPort::new("refmeter").reply("AAV", ["MT786V06.33", "AAVACK"]);
//! let handle = port.handle();
//! # let _ = handle;
//! ```
//!
//! Named mocks ([`named`]) give configuration files a way to run a bench
//! without hardware: `"mt786"` (reference meter), `"fg30x"` (source),
//! `"zif8121"` (binary ZIF socket) and `"echo"`.

use crate::error::{ConfigError, TransportError};
use crate::frame::{encode_command, FrameDecoder, ACK, NAK};
use crate::transport::{DynTransport, Transport};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Produces reply lines for a written command line.
pub type LineResponder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

/// Produces reply bytes for a raw write.
pub type ByteResponder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

#[derive(Debug, Default)]
struct MockState {
    written: Vec<Vec<u8>>,
    lines: VecDeque<String>,
    bytes: VecDeque<u8>,
    threads: HashSet<ThreadId>,
    dropped: bool,
    /// Replies stay invisible until this instant.
    ready_at: Option<Instant>,
}

/// Test-side view of a [`ScriptedPort`].
#[derive(Debug, Clone, Default)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    /// Everything written, as text (lines without terminator).
    pub fn written_lines(&self) -> Vec<String> {
        self.state
            .lock()
            .written
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    /// Everything written, as bytes.
    pub fn written_bytes(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.clone()
    }

    /// Number of writes equal to `command`.
    pub fn count_of(&self, command: &str) -> usize {
        self.state
            .lock()
            .written
            .iter()
            .filter(|w| w.as_slice() == command.as_bytes())
            .count()
    }

    /// Queue an unsolicited line.
    pub fn push_line(&self, line: impl Into<String>) {
        self.state.lock().lines.push_back(line.into());
    }

    /// Queue unsolicited bytes.
    pub fn push_bytes(&self, bytes: &[u8]) {
        self.state.lock().bytes.extend(bytes);
    }

    /// Lines queued but not yet read.
    pub fn pending_lines(&self) -> usize {
        self.state.lock().lines.len()
    }

    /// Distinct threads that read from or wrote to the port.
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.state.lock().threads.iter().copied().collect()
    }

    /// True once the port has been dropped.
    pub fn is_dropped(&self) -> bool {
        self.state.lock().dropped
    }
}

/// Mock transport driven by a reply script.
pub struct ScriptedPort {
    name: String,
    handle: MockHandle,
    script: HashMap<String, Vec<String>>,
    on_line: Option<LineResponder>,
    on_bytes: Option<ByteResponder>,
    poll: Duration,
    latency: Duration,
}

impl ScriptedPort {
    /// Silent port: nothing written gets an answer.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handle: MockHandle::default(),
            script: HashMap::new(),
            on_line: None,
            on_bytes: None,
            poll: Duration::from_millis(1),
            latency: Duration::ZERO,
        }
    }

    /// Reply to `command` with `lines`, every time it is written.
    pub fn reply<I, S>(mut self, command: impl Into<String>, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script
            .insert(command.into(), lines.into_iter().map(Into::into).collect());
        self
    }

    /// Fallback for lines not in the script.
    pub fn respond_with(mut self, responder: impl FnMut(&str) -> Vec<String> + Send + 'static) -> Self {
        self.on_line = Some(Box::new(responder));
        self
    }

    /// Responder for raw writes.
    pub fn respond_bytes_with(
        mut self,
        responder: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    ) -> Self {
        self.on_bytes = Some(Box::new(responder));
        self
    }

    /// Hold back each reply for `latency` after the write that caused it.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Handle for inspecting the port from a test.
    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }

    fn touch(&self) {
        self.handle
            .state
            .lock()
            .threads
            .insert(std::thread::current().id());
    }

    fn ready_at(&self) -> Option<Instant> {
        (!self.latency.is_zero()).then(|| Instant::now() + self.latency)
    }

    /// Wait for `take` to yield a value, honouring deadline and cancellation.
    fn wait_for<T>(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
        mut take: impl FnMut(&mut MockState) -> Option<T>,
    ) -> Result<T, TransportError> {
        self.touch();
        loop {
            {
                let mut state = self.handle.state.lock();
                let ready = state.ready_at.map_or(true, |at| Instant::now() >= at);
                if ready {
                    if let Some(value) = take(&mut state) {
                        return Ok(value);
                    }
                }
            }
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout);
            }
            std::thread::sleep(self.poll.min(deadline - now));
        }
    }
}

impl std::fmt::Debug for ScriptedPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedPort")
            .field("name", &self.name)
            .field("script", &self.script)
            .finish()
    }
}

impl Transport for ScriptedPort {
    fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.touch();
        let replies = match self.script.get(line) {
            Some(lines) => lines.clone(),
            None => self.on_line.as_mut().map(|f| f(line)).unwrap_or_default(),
        };
        let mut state = self.handle.state.lock();
        state.written.push(line.as_bytes().to_vec());
        state.lines.extend(replies);
        state.ready_at = self.ready_at();
        Ok(())
    }

    fn read_line(
        &mut self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<String, TransportError> {
        self.wait_for(deadline, cancel, |state| state.lines.pop_front())
    }

    fn raw_write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.touch();
        let reply = self.on_bytes.as_mut().map(|f| f(bytes)).unwrap_or_default();
        let mut state = self.handle.state.lock();
        state.written.push(bytes.to_vec());
        state.bytes.extend(reply);
        state.ready_at = self.ready_at();
        Ok(())
    }

    fn raw_read(
        &mut self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Option<u8>, TransportError> {
        self.wait_for(deadline, cancel, |state| state.bytes.pop_front())
            .map(Some)
    }

    fn discard_input(&mut self, _window: Duration) -> usize {
        let mut state = self.handle.state.lock();
        let dropped = state.bytes.len() + state.lines.iter().map(|l| l.len() + 1).sum::<usize>();
        state.bytes.clear();
        state.lines.clear();
        dropped
    }

    fn describe(&self) -> String {
        format!("mock://{}", self.name)
    }
}

impl Drop for ScriptedPort {
    fn drop(&mut self) {
        self.handle.state.lock().dropped = true;
    }
}

// =============================================================================
// Canned Ports
// =============================================================================

/// Port that answers any command with the same lines.
///
/// The lines are queued again only once everything queued before has been
/// read, so a multi-request batch consumes one copy.
pub fn fixed_reply<I, S>(lines: I) -> ScriptedPort
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let lines: Vec<String> = lines.into_iter().map(Into::into).collect();
    let port = ScriptedPort::new("fixed");
    let handle = port.handle();
    port.respond_with(move |_| {
        if handle.pending_lines() == 0 {
            lines.clone()
        } else {
            Vec::new()
        }
    })
}

/// Port answering `START` with `STOP`; used to count executions.
pub fn counting() -> ScriptedPort {
    ScriptedPort::new("counter").reply("START", ["STOP"])
}

/// Port that echoes every line back.
pub fn echo() -> ScriptedPort {
    ScriptedPort::new("echo").respond_with(|line| vec![line.to_string()])
}

/// MT786 reference meter: firmware, modes and actual values.
///
/// The frequency (index 28) rises by 0.01 Hz with every `AME`, so repeated
/// reads are distinguishable.
pub fn mt786() -> ScriptedPort {
    let mut reads = 0u32;
    ScriptedPort::new("mt786")
        .reply("AAV", ["MT786V06.33", "AAVACK"])
        .reply("ATI01", ["ATIACK"])
        .reply(
            "AML",
            ["01;2WA;2WAde", "02;3WA;3WAde", "03;4WA;4WAde", "AMLACK"],
        )
        .respond_with(move |line| {
            if line != "AME" {
                return Vec::new();
            }
            let frequency = 50.0 + f64::from(reads) / 100.0;
            reads += 1;
            actual_values(frequency)
        })
}

fn actual_values(frequency: f64) -> Vec<String> {
    let mut lines = Vec::new();
    for (index, value) in [230.0, 230.1, 229.9].iter().enumerate() {
        lines.push(format!("{};{}", index, value));
    }
    for (index, value) in [5.0, 5.01, 4.99].iter().enumerate() {
        lines.push(format!("{};{}", index + 3, value));
    }
    for (index, angle) in [0.0, 120.0, 240.0, 0.5, 120.5, 240.5].iter().enumerate() {
        lines.push(format!("{};{}", index + 6, angle));
    }
    for index in 12..=14 {
        lines.push(format!("{};0.99965084", index));
    }
    lines.push("27;123".to_string());
    lines.push(format!("28;{}", frequency));
    lines.push("AMEACK".to_string());
    lines
}

/// FG30x source: dosage state, energy and progress.
///
/// `3SA1` reports 0 (off), 1 (dosage mode armed) or 2 (running).
pub fn fg30x() -> ScriptedPort {
    let set_energy = Regex::new(r"^3PS45;(\d+(\.\d+)?)$").ok();
    let mut energy = String::from("0");
    let mut dosage = 0;
    ScriptedPort::new("fg30x")
        .reply("TS", ["TSFG399   V703"])
        .respond_with(move |line| {
            let reply = match line {
                "3CM1" | "3CM2" | "3CM3" | "3CM4" => {
                    dosage = match line {
                        "3CM1" => 2,
                        "3CM3" => 1,
                        _ => 0,
                    };
                    format!("OK{}", line)
                }
                "3SA1" => format!("OK3SA1;{}", dosage),
                "3SA3" => format!("OK3SA3;{}", if dosage == 1 { 2 } else { 0 }),
                "3MA1" => "OK3MA1;0".to_string(),
                "3PA45" => format!("OK3PA45;{}", energy),
                other => match set_energy.as_ref().and_then(|r| r.captures(other)) {
                    Some(caps) => {
                        energy = caps[1].to_string();
                        "OK3PS45".to_string()
                    }
                    None => return Vec::new(),
                },
            };
            vec![reply]
        })
}

/// PowerMaster 8121 ZIF socket speaking the CRC8 framed protocol.
pub fn zif8121() -> ScriptedPort {
    let mut active = false;
    ScriptedPort::new("zif8121").respond_bytes_with(move |bytes| {
        let mut decoder = FrameDecoder::new();
        let Some(frame) = bytes.iter().find_map(|b| decoder.push(*b)) else {
            return Vec::new();
        };
        let body = frame.body();
        let reply: Vec<u8> = match body {
            [0xC2] => vec![ACK, 0xC2, 0x01, 0x00, 0x00, 0x00, 0x07],
            [0xC1] => vec![ACK, 0xC1, 0x30, 0x39],
            [0xC4] => vec![ACK, 0xC4, if active { 0x03 } else { 0x02 }],
            [0x8D, flag] => {
                active = *flag != 0;
                vec![ACK, 0x8D]
            }
            [command, ..] => vec![NAK, *command],
            [] => return Vec::new(),
        };
        encode_command(&reply).unwrap_or_default()
    })
}

/// Build a named mock transport.
pub fn named(name: &str) -> Result<DynTransport, ConfigError> {
    let port = match name {
        "mt786" => mt786(),
        "fg30x" => fg30x(),
        "zif8121" => zif8121(),
        "echo" => echo(),
        other => return Err(ConfigError::UnknownMock(other.to_string())),
    };
    tracing::debug!(mock = %name, "Created mock transport");
    Ok(Box::new(port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_millis(50)
    }

    #[test]
    fn test_scripted_reply_and_timeout() {
        let mut port = ScriptedPort::new("t").reply("AAV", ["MT786V06.33", "AAVACK"]);
        let cancel = CancellationToken::new();

        port.write_line("AAV").unwrap();
        assert_eq!(port.read_line(deadline(), &cancel).unwrap(), "MT786V06.33");
        assert_eq!(port.read_line(deadline(), &cancel).unwrap(), "AAVACK");
        assert_eq!(
            port.read_line(deadline(), &cancel),
            Err(TransportError::Timeout)
        );
    }

    #[test]
    fn test_fixed_reply_queues_one_copy_per_batch() {
        let mut port = fixed_reply(["ATIACK", "0;1", "AMEACK"]);
        let handle = port.handle();
        let cancel = CancellationToken::new();

        port.write_line("ATI01").unwrap();
        assert_eq!(port.read_line(deadline(), &cancel).unwrap(), "ATIACK");
        port.write_line("AME").unwrap();
        assert_eq!(handle.pending_lines(), 2);
    }

    #[test]
    fn test_handle_tracks_writes_and_drop() {
        let mut port = counting();
        let handle = port.handle();
        port.write_line("START").unwrap();
        port.write_line("START").unwrap();
        assert_eq!(handle.count_of("START"), 2);
        assert_eq!(handle.thread_ids().len(), 1);

        drop(port);
        assert!(handle.is_dropped());
    }

    #[test]
    fn test_fg30x_energy_round_trip() {
        let mut port = fg30x();
        let cancel = CancellationToken::new();

        port.write_line("3PS45;12.5").unwrap();
        assert_eq!(port.read_line(deadline(), &cancel).unwrap(), "OK3PS45");
        port.write_line("3PA45").unwrap();
        assert_eq!(port.read_line(deadline(), &cancel).unwrap(), "OK3PA45;12.5");
    }

    #[test]
    fn test_zif_mock_answers_version_frame() {
        let mut port = zif8121();
        let cancel = CancellationToken::new();
        port.raw_write(&encode_command(&[0xC2]).unwrap()).unwrap();

        let mut decoder = FrameDecoder::new();
        let frame = loop {
            let byte = port.raw_read(deadline(), &cancel).unwrap().unwrap();
            if let Some(frame) = decoder.push(byte) {
                break frame;
            }
        };
        assert_eq!(
            frame.reply().unwrap().expect_echo(0xC2).unwrap(),
            vec![0x01, 0x00, 0x00, 0x00, 0x07]
        );
    }

    #[test]
    fn test_latency_delays_replies() {
        let mut port = ScriptedPort::new("slow")
            .reply("AAV", ["AAVACK"])
            .with_latency(Duration::from_millis(40));
        let cancel = CancellationToken::new();

        port.write_line("AAV").unwrap();
        assert_eq!(
            port.read_line(Instant::now() + Duration::from_millis(10), &cancel),
            Err(TransportError::Timeout)
        );
        let started = Instant::now();
        assert_eq!(
            port.read_line(Instant::now() + Duration::from_millis(500), &cancel).unwrap(),
            "AAVACK"
        );
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_unknown_named_mock() {
        assert!(named("nope").is_err());
    }
}
