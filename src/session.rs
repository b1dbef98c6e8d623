//! Controller sessions, their outgoing queues, and delivery sinks.
//!
//! A [`ControllerSession`] owns its subscription [`EventMask`], a FIFO queue of
//! already formatted [`QueuedLine`]s, and the [`EventSink`] that stands in for
//! its transport. Lines leave the queue strictly in the order they entered it.
//!
//! ```text
//!   producer ──▶ enqueue (mask check) ──▶ VecDeque<QueuedLine> ──▶ flush ──▶ EventSink
//! ```

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::config::LogLevel;
use crate::error::{Error, Result};
use crate::events::{EventKind, EventMask};

/// Identifier of a live controller session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {}", self.0)
    }
}

/// One fully formatted event line, shared between every session it was
/// queued on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedLine {
    kind: EventKind,
    bytes: Arc<[u8]>,
}

impl QueuedLine {
    /// Wraps formatted bytes for `kind`.
    pub fn new(kind: EventKind, bytes: Vec<u8>) -> Self {
        Self {
            kind,
            bytes: bytes.into(),
        }
    }

    /// The event kind this line carries.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// The raw line bytes, including the trailing CRLF.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The line as text, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the line is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Destination for a session's flushed lines.
///
/// Implementations must not block. Returning [`Error::SessionGone`] tells the
/// registry the transport is closed and the session should be torn down.
pub trait EventSink {
    /// Hands one line to the transport.
    fn deliver(&mut self, line: &QueuedLine) -> Result<()>;
}

impl EventSink for UnboundedSender<QueuedLine> {
    fn deliver(&mut self, line: &QueuedLine) -> Result<()> {
        self.send(line.clone()).map_err(|_| Error::SessionGone)
    }
}

impl EventSink for Vec<QueuedLine> {
    fn deliver(&mut self, line: &QueuedLine) -> Result<()> {
        self.push(line.clone());
        Ok(())
    }
}

/// In-memory sink whose deliveries stay observable after it is handed to a
/// session.
///
/// ```rust
/// use privcount_control::session::MemorySink;
///
/// let sink = MemorySink::new();
/// let observer = sink.clone();
/// assert!(observer.lines().is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Rc<RefCell<Vec<QueuedLine>>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything delivered so far.
    pub fn lines(&self) -> Vec<QueuedLine> {
        self.lines.borrow().clone()
    }

    /// Removes and returns everything delivered so far.
    pub fn take(&self) -> Vec<QueuedLine> {
        std::mem::take(&mut *self.lines.borrow_mut())
    }
}

impl EventSink for MemorySink {
    fn deliver(&mut self, line: &QueuedLine) -> Result<()> {
        self.lines.borrow_mut().push(line.clone());
        Ok(())
    }
}

/// One authenticated-or-not controller connection.
pub struct ControllerSession {
    id: SessionId,
    mask: EventMask,
    queue: VecDeque<QueuedLine>,
    authenticated: bool,
    failed_auth_attempts: u32,
    min_log_severity: Option<LogLevel>,
    sink: Box<dyn EventSink>,
    delivered: u64,
}

impl fmt::Debug for ControllerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerSession")
            .field("id", &self.id)
            .field("mask", &self.mask)
            .field("queued", &self.queue.len())
            .field("authenticated", &self.authenticated)
            .field("failed_auth_attempts", &self.failed_auth_attempts)
            .field("min_log_severity", &self.min_log_severity)
            .field("delivered", &self.delivered)
            .finish()
    }
}

impl ControllerSession {
    /// Creates an unauthenticated session with an empty mask.
    pub fn new(id: SessionId, sink: Box<dyn EventSink>) -> Self {
        Self {
            id,
            mask: EventMask::NONE,
            queue: VecDeque::new(),
            authenticated: false,
            failed_auth_attempts: 0,
            min_log_severity: None,
            sink,
            delivered: 0,
        }
    }

    /// The session identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The session's subscription mask.
    pub fn mask(&self) -> EventMask {
        self.mask
    }

    /// Whether the session has authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Failed authentication attempts so far.
    pub fn failed_auth_attempts(&self) -> u32 {
        self.failed_auth_attempts
    }

    /// The least severe log level this session subscribed to, if any.
    pub fn min_log_severity(&self) -> Option<LogLevel> {
        self.min_log_severity
    }

    /// Number of lines waiting to be flushed.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// The waiting lines, oldest first.
    pub fn queued(&self) -> impl Iterator<Item = &QueuedLine> {
        self.queue.iter()
    }

    /// Total lines handed to the sink over the session's lifetime.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub(crate) fn set_mask(&mut self, mask: EventMask) {
        self.mask = mask;
        self.min_log_severity = mask.kinds().filter_map(EventKind::log_severity).min();
    }

    pub(crate) fn mark_authenticated(&mut self) {
        self.authenticated = true;
        self.failed_auth_attempts = 0;
    }

    pub(crate) fn record_auth_failure(&mut self) -> u32 {
        self.failed_auth_attempts = self.failed_auth_attempts.saturating_add(1);
        self.failed_auth_attempts
    }

    /// Appends `line` if the session subscribed to its kind.
    ///
    /// Returns whether the line was queued.
    pub fn enqueue(&mut self, line: &QueuedLine) -> bool {
        if !self.mask.contains(line.kind()) {
            return false;
        }
        self.queue.push_back(line.clone());
        true
    }

    /// Delivers queued lines in FIFO order.
    ///
    /// Without `force`, nothing is delivered until the queue holds at least
    /// `threshold` lines; the registry's scheduled flush picks up the rest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionGone`] if the sink is closed. Lines that were
    /// not delivered stay queued until the session is torn down.
    pub fn flush(&mut self, force: bool, threshold: usize) -> Result<usize> {
        if !force && self.queue.len() < threshold {
            return Ok(0);
        }
        let mut count = 0;
        while let Some(line) = self.queue.front() {
            self.sink.deliver(line)?;
            self.queue.pop_front();
            self.delivered += 1;
            count += 1;
        }
        Ok(count)
    }
}
