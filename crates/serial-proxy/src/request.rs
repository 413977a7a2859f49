//! Requests and reply matching.
//!
//! A [`SerialPortRequest`] describes one logical command: what to write and a
//! sequence of [`Matcher`]s that recognise the reply lines belonging to it.
//! The worker feeds every incoming line to a [`RequestMatcher`], which walks
//! the matcher sequence and decides when the request is complete.
//!
//! # Example
//!
//! ```rust
//! use serial_proxy::request::{Matcher, SerialPortRequest};
//! use regex::Regex;
//!
//! // Collect data lines until "AMEACK".
//! let actual_values = SerialPortRequest::create("AME", "AMEACK");
//!
//! // Single reply line with a captured value.
//! let dosage = SerialPortRequest::create(
//!     "3SA1",
//!     Regex::new(r"^OK3SA1;([0123])$").unwrap(),
//! )
//! .strict();
//! # let _ = (actual_values, dosage);
//! ```

use crate::error::ProtocolError;
use regex::Regex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Recognises one expected reply line.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Line equals the string exactly.
    Exact(String),
    /// Line matches the regular expression; groups are captured.
    Pattern(Regex),
    /// Reply is exactly this many bytes long.
    ByteLength(usize),
}

impl Matcher {
    /// Shorthand for [`Matcher::ByteLength`].
    pub fn bytes(count: usize) -> Self {
        Matcher::ByteLength(count)
    }

    /// Test a reply line against this matcher.
    pub fn matches(&self, line: &str) -> Option<MatchResult> {
        match self {
            Matcher::Exact(expected) => (line == expected).then(|| MatchResult::whole(line)),
            Matcher::Pattern(regex) => regex.captures(line).map(|caps| MatchResult {
                groups: caps
                    .iter()
                    .map(|group| group.map(|m| m.as_str().to_string()))
                    .collect(),
            }),
            Matcher::ByteLength(count) => (line.len() == *count).then(|| MatchResult::whole(line)),
        }
    }
}

impl std::fmt::Display for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Matcher::Exact(text) => write!(f, "'{}'", text),
            Matcher::Pattern(regex) => write!(f, "/{}/", regex.as_str()),
            Matcher::ByteLength(count) => write!(f, "{} bytes", count),
        }
    }
}

impl From<&str> for Matcher {
    fn from(text: &str) -> Self {
        Matcher::Exact(text.to_string())
    }
}

impl From<String> for Matcher {
    fn from(text: String) -> Self {
        Matcher::Exact(text)
    }
}

impl From<Regex> for Matcher {
    fn from(regex: Regex) -> Self {
        Matcher::Pattern(regex)
    }
}

/// Result of a successful match. Group 0 is always the whole line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    groups: Vec<Option<String>>,
}

impl MatchResult {
    fn whole(line: &str) -> Self {
        Self {
            groups: vec![Some(line.to_string())],
        }
    }

    /// Capture group `index`, if it participated in the match.
    pub fn group(&self, index: usize) -> Option<&str> {
        self.groups.get(index).and_then(|g| g.as_deref())
    }

    /// Number of groups including group 0.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Always false; a match has at least group 0.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// What goes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Text line; the transport appends its terminator.
    Line(String),
    /// Raw bytes written as-is.
    Bytes(Vec<u8>),
}

impl Payload {
    /// Printable form for logs and error messages.
    pub fn display(&self) -> String {
        match self {
            Payload::Line(line) => line.clone(),
            Payload::Bytes(bytes) => hex(bytes),
        }
    }
}

/// How to treat a line that matches neither the current step nor data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strictness {
    /// Warn and skip the line.
    #[default]
    Lenient,
    /// Fail the request with [`ProtocolError::UnexpectedReply`].
    Strict,
}

/// One step of a (possibly multi-step) exchange.
#[derive(Debug, Clone)]
pub struct Step {
    /// Recognises the line that finishes this step.
    pub matcher: Matcher,
    /// Accumulate non-matching lines as data while waiting for this step.
    pub collect_data: bool,
}

/// One logical command plus the rules recognising its reply.
#[derive(Debug, Clone)]
pub struct SerialPortRequest {
    payload: Payload,
    steps: Vec<Step>,
    strictness: Strictness,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
}

impl SerialPortRequest {
    /// Command line plus terminal matcher, collecting every line before the
    /// terminal one as data.
    pub fn create(command: impl Into<String>, end: impl Into<Matcher>) -> Self {
        Self::create_with(command, end, true)
    }

    /// Command line plus terminal matcher with explicit data collection.
    pub fn create_with(
        command: impl Into<String>,
        end: impl Into<Matcher>,
        collect_data: bool,
    ) -> Self {
        Self {
            payload: Payload::Line(command.into()),
            steps: vec![Step {
                matcher: end.into(),
                collect_data,
            }],
            strictness: Strictness::default(),
            timeout: None,
            cancel: None,
        }
    }

    /// Raw byte command. With a [`Matcher::ByteLength`] step the worker
    /// reads exactly that many raw bytes instead of a line.
    pub fn raw(bytes: impl Into<Vec<u8>>, end: impl Into<Matcher>) -> Self {
        Self {
            payload: Payload::Bytes(bytes.into()),
            steps: vec![Step {
                matcher: end.into(),
                collect_data: false,
            }],
            strictness: Strictness::Strict,
            timeout: None,
            cancel: None,
        }
    }

    /// Append a further step that must complete after the current last one.
    pub fn then(mut self, matcher: impl Into<Matcher>, collect_data: bool) -> Self {
        self.steps.push(Step {
            matcher: matcher.into(),
            collect_data,
        });
        self
    }

    /// Fail on unexpected lines.
    pub fn strict(mut self) -> Self {
        self.strictness = Strictness::Strict;
        self
    }

    /// Warn and skip unexpected lines.
    pub fn lenient(mut self) -> Self {
        self.strictness = Strictness::Lenient;
        self
    }

    /// Override the connection's read timeout for this request.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a caller cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Outgoing payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Declared steps, in order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Strictness for unexpected lines.
    pub fn strictness(&self) -> Strictness {
        self.strictness
    }

    /// Per-request timeout, if overridden.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Caller cancellation token, if any.
    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    /// Printable command for logs and errors.
    pub fn command(&self) -> String {
        self.payload.display()
    }

    /// True if the reply is read as raw bytes rather than lines.
    pub fn reads_raw(&self) -> bool {
        matches!(self.payload, Payload::Bytes(_))
            && matches!(
                self.steps.first().map(|s| &s.matcher),
                Some(Matcher::ByteLength(_))
            )
    }
}

/// Completed reply to one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    /// Accumulated reply lines, terminal line last.
    pub lines: Vec<String>,
    /// Raw reply bytes for byte-length requests.
    pub raw: Vec<u8>,
    /// Match of the terminal line (regex groups for pattern matchers).
    pub end_match: Option<MatchResult>,
}

impl Reply {
    /// Terminal reply line.
    pub fn last(&self) -> Option<&str> {
        self.lines.last().map(String::as_str)
    }

    /// Data lines, i.e. everything but the terminal line.
    pub fn data(&self) -> &[String] {
        match self.lines.split_last() {
            Some((_, data)) => data,
            None => &[],
        }
    }
}

/// Outcome of feeding one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More lines needed.
    Pending,
    /// Last matcher satisfied.
    Complete,
}

/// Matcher state of a request in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    /// Waiting for matcher `i`.
    Awaiting(usize),
    /// Every matcher has matched.
    Complete,
    /// A strict request saw an unexpected line.
    Failed,
}

/// Walks a request's matcher sequence over incoming lines.
#[derive(Debug)]
pub struct RequestMatcher<'a> {
    request: &'a SerialPortRequest,
    state: MatchState,
    lines: Vec<String>,
    skipped: usize,
    end_match: Option<MatchResult>,
}

impl<'a> RequestMatcher<'a> {
    /// Start matching replies for `request`.
    pub fn new(request: &'a SerialPortRequest) -> Self {
        let state = if request.steps.is_empty() {
            MatchState::Complete
        } else {
            MatchState::Awaiting(0)
        };
        Self {
            request,
            state,
            lines: Vec::new(),
            skipped: 0,
            end_match: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> MatchState {
        self.state
    }

    /// Lines skipped in lenient mode.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Feed one incoming line.
    pub fn feed(&mut self, line: String) -> Result<Progress, ProtocolError> {
        let index = match self.state {
            MatchState::Awaiting(index) => index,
            MatchState::Complete => return Ok(Progress::Complete),
            MatchState::Failed => {
                return Err(ProtocolError::UnexpectedReply {
                    command: self.request.command(),
                    line,
                    expected: "nothing (request failed)".to_string(),
                })
            }
        };
        let step = &self.request.steps[index];

        if let Some(found) = step.matcher.matches(&line) {
            self.lines.push(line);
            if index + 1 == self.request.steps.len() {
                self.end_match = Some(found);
                self.state = MatchState::Complete;
                return Ok(Progress::Complete);
            }
            self.state = MatchState::Awaiting(index + 1);
            return Ok(Progress::Pending);
        }

        if step.collect_data {
            self.lines.push(line);
            return Ok(Progress::Pending);
        }

        match self.request.strictness {
            Strictness::Lenient => {
                tracing::warn!(
                    command = %self.request.command(),
                    reply = %line,
                    expected = %step.matcher,
                    "bad reply"
                );
                self.skipped += 1;
                Ok(Progress::Pending)
            }
            Strictness::Strict => {
                self.state = MatchState::Failed;
                Err(ProtocolError::UnexpectedReply {
                    command: self.request.command(),
                    line,
                    expected: step.matcher.to_string(),
                })
            }
        }
    }

    /// Finish a completed request. Returns `None` while still pending.
    pub fn into_reply(self) -> Option<Reply> {
        if self.state == MatchState::Complete {
            Some(self.finish())
        } else {
            None
        }
    }

    /// Lines accepted so far, whatever the state.
    pub fn finish(self) -> Reply {
        Reply {
            lines: self.lines,
            raw: Vec::new(),
            end_match: self.end_match,
        }
    }
}

/// Dash separated upper-case hex, the format used in interface logs.
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn feed_all(request: &SerialPortRequest, lines: &[&str]) -> (Vec<Progress>, Option<Reply>) {
        let mut matcher = RequestMatcher::new(request);
        let progress = lines
            .iter()
            .map(|l| matcher.feed(l.to_string()).expect("feed failed"))
            .collect();
        (progress, matcher.into_reply())
    }

    #[test]
    fn test_exact_terminal_collects_data() {
        let request = SerialPortRequest::create("AAV", "AAVACK");
        let (progress, reply) = feed_all(&request, &["MT786V06.33", "AAVACK"]);

        assert_eq!(progress, vec![Progress::Pending, Progress::Complete]);
        let reply = reply.expect("complete");
        assert_eq!(reply.lines, vec!["MT786V06.33", "AAVACK"]);
        assert_eq!(reply.data(), &["MT786V06.33".to_string()]);
        assert_eq!(reply.last(), Some("AAVACK"));
    }

    #[test]
    fn test_regex_terminal_captures_groups() {
        let request = SerialPortRequest::create(
            "3MA1",
            Regex::new(r"^OK3MA1;(.+)$").expect("regex"),
        );
        let (_, reply) = feed_all(&request, &["OK3MA1;12.5"]);
        let end = reply.and_then(|r| r.end_match).expect("end match");

        assert_eq!(end.group(0), Some("OK3MA1;12.5"));
        assert_eq!(end.group(1), Some("12.5"));
        assert_eq!(end.len(), 2);
    }

    #[test]
    fn test_multi_step_advances_in_order() {
        // ack first, then data lines until the final ack
        let request = SerialPortRequest::create_with("AML", "AMLSTART", false)
            .then("AMLACK", true);
        let (progress, reply) = feed_all(&request, &["AMLSTART", "01;4WA;x", "02;3WA;y", "AMLACK"]);

        assert_eq!(
            progress,
            vec![
                Progress::Pending,
                Progress::Pending,
                Progress::Pending,
                Progress::Complete
            ]
        );
        assert_eq!(reply.expect("complete").lines.len(), 4);
    }

    #[test]
    fn test_data_before_first_ack_is_rejected_in_strict_mode() {
        let request = SerialPortRequest::create_with("AML", "AMLSTART", false)
            .then("AMLACK", true)
            .strict();
        let mut matcher = RequestMatcher::new(&request);

        let err = matcher.feed("01;4WA;x".to_string()).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedReply { .. }));
        assert_eq!(matcher.state(), MatchState::Failed);
        assert!(matcher.into_reply().is_none());
    }

    #[traced_test]
    #[test]
    fn test_lenient_mode_skips_and_warns() {
        let request = SerialPortRequest::create_with("START", "STOP", false);
        let mut matcher = RequestMatcher::new(&request);

        assert_eq!(matcher.feed("GARBAGE".into()).unwrap(), Progress::Pending);
        assert_eq!(matcher.feed("STOP".into()).unwrap(), Progress::Complete);
        assert_eq!(matcher.skipped(), 1);
        assert_eq!(matcher.into_reply().expect("complete").lines, vec!["STOP"]);
        assert!(logs_contain("bad reply"));
    }

    #[test]
    fn test_byte_length_matcher() {
        let matcher = Matcher::bytes(4);
        assert!(matcher.matches("ABCD").is_some());
        assert!(matcher.matches("ABC").is_none());
    }

    #[test]
    fn test_raw_request_reads_raw() {
        let request = SerialPortRequest::raw(vec![0x01, 0x02], Matcher::bytes(3));
        assert!(request.reads_raw());
        assert_eq!(request.command(), "01-02");
        assert!(!SerialPortRequest::create("A", "B").reads_raw());
    }

    #[test]
    fn test_matcher_display() {
        assert_eq!(Matcher::from("ACK").to_string(), "'ACK'");
        assert_eq!(Matcher::bytes(2).to_string(), "2 bytes");
    }
}
