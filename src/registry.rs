//! The live-session registry and its aggregated interest mask.
//!
//! [`ControlRegistry`] is the explicit context every producer is handed. It
//! owns all live [`ControllerSession`]s and the global mask, the bitwise OR
//! of every session's subscription. The global mask is recomputed on every
//! subscription change and session close, so a producer never observes a
//! mask that is stale across a logical step.
//!
//! # Event Path
//!
//! ```text
//!   producer
//!      │  is_interesting(kind)?  ── no ──▶ return (no formatting)
//!      ▼
//!   format_event(kind, payload)  ──▶ QueuedLine (shared, immutable)
//!      │
//!      ▼
//!   for each session whose mask has kind:
//!      enqueue ──▶ queue_len ≥ flush_threshold? ──▶ flush now
//!      │
//!      ▼
//!   flush_all(false) on the next tick   │   flush_all(true) at shutdown
//! ```
//!
//! # Example
//!
//! ```rust
//! use privcount_control::payload::{Payload, Words};
//! use privcount_control::session::MemorySink;
//! use privcount_control::{ControlRegistry, EventKind, RegistryConfig};
//!
//! let mut registry = ControlRegistry::new(RegistryConfig::default());
//! let sink = MemorySink::new();
//! let id = registry.open_session_authenticated(Box::new(sink.clone()));
//! registry.set_events(id, &["BW"]).unwrap();
//!
//! registry.queue_event(EventKind::BandwidthUsed, &Payload::Plain(Words::new().word(1).word(2)));
//! registry.flush_all(true);
//!
//! assert_eq!(sink.lines()[0].as_bytes(), b"650 BW 1 2\r\n");
//! ```

use std::collections::BTreeMap;

use crate::auth::{Credential, CredentialVerifier};
use crate::config::{LogLevel, RegistryConfig};
use crate::error::{Error, Result};
use crate::events::{self, EventKind, EventMask};
use crate::logger::plog;
use crate::payload::{format_event, Payload, Words};
use crate::session::{ControllerSession, EventSink, QueuedLine, SessionId};

/// All live controller sessions plus their aggregated interest mask.
#[derive(Debug)]
pub struct ControlRegistry {
    sessions: BTreeMap<SessionId, ControllerSession>,
    global_mask: EventMask,
    config: RegistryConfig,
    flush_pending: bool,
    next_id: u64,
}

impl ControlRegistry {
    /// Creates an empty registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            sessions: BTreeMap::new(),
            global_mask: EventMask::NONE,
            config,
            flush_pending: false,
            next_id: 1,
        }
    }

    /// The registry settings.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Registers a new, unauthenticated session delivering into `sink`.
    pub fn open_session(&mut self, sink: Box<dyn EventSink>) -> SessionId {
        let id = SessionId(self.next_id);
        self.next_id += 1;
        self.sessions.insert(id, ControllerSession::new(id, sink));
        plog(LogLevel::Notice, &format!("New control connection opened ({})", id));
        id
    }

    /// Registers a session that is already authenticated, for transports
    /// that authenticate out of band.
    pub fn open_session_authenticated(&mut self, sink: Box<dyn EventSink>) -> SessionId {
        let id = self.open_session(sink);
        if let Some(session) = self.sessions.get_mut(&id) {
            session.mark_authenticated();
        }
        id
    }

    /// Tears a session down, discarding anything still queued.
    ///
    /// The session's mask contribution is removed in the same step, so no
    /// later event can be queued onto it. Returns whether it existed.
    pub fn close_session(&mut self, id: SessionId) -> bool {
        match self.sessions.remove(&id) {
            Some(session) => {
                self.recompute_global_mask();
                plog(
                    LogLevel::Notice,
                    &format!(
                        "Control connection closed ({}), {} queued lines discarded",
                        id,
                        session.queue_len()
                    ),
                );
                true
            }
            None => false,
        }
    }

    /// Looks up a live session.
    pub fn session(&self, id: SessionId) -> Option<&ControllerSession> {
        self.sessions.get(&id)
    }

    /// Identifiers of all live sessions, in opening order.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Rebuilds the global mask from every live session.
    pub fn recompute_global_mask(&mut self) {
        let old = self.global_mask;
        self.global_mask = self
            .sessions
            .values()
            .fold(EventMask::NONE, |acc, session| acc | session.mask());
        if old != self.global_mask {
            plog(
                LogLevel::Debug,
                &format!(
                    "Global event mask changed from {:#018x} to {:#018x}",
                    old.bits(),
                    self.global_mask.bits()
                ),
            );
        }
    }

    /// The OR of every live session's mask.
    pub fn global_mask(&self) -> EventMask {
        self.global_mask
    }

    /// Whether any live session wants `kind`.
    #[inline]
    pub fn is_interesting(&self, kind: EventKind) -> bool {
        events::is_interesting(self.global_mask, kind)
    }

    /// Replaces a session's subscriptions with the named kinds.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownSession`] if `id` is not live.
    /// - [`Error::Unauthenticated`] before the session has authenticated.
    /// - [`Error::InvalidEventName`] for the first unknown token; the
    ///   session's mask is left untouched.
    pub fn set_events<S: AsRef<str>>(&mut self, id: SessionId, tokens: &[S]) -> Result<()> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(Error::UnknownSession(id))?;
        if !session.is_authenticated() {
            return Err(Error::Unauthenticated);
        }
        let mask = events::parse_event_names(tokens)?;
        session.set_mask(mask);
        plog(
            LogLevel::Debug,
            &format!("{} subscribed to {:#018x}", id, mask.bits()),
        );
        self.recompute_global_mask();
        Ok(())
    }

    /// Checks a credential for a session.
    ///
    /// After `max_auth_failures` consecutive failures the session is closed.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownSession`] if `id` is not live.
    /// - [`Error::AuthFailure`] on mismatch, with the attempts left.
    pub fn authenticate(
        &mut self,
        id: SessionId,
        credential: &Credential,
        verifier: &dyn CredentialVerifier,
    ) -> Result<()> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(Error::UnknownSession(id))?;

        if verifier.verify(credential) {
            session.mark_authenticated();
            plog(LogLevel::Info, &format!("Authenticated control connection ({})", id));
            return Ok(());
        }

        let failures = session.record_auth_failure();
        let attempts_remaining = self.config.max_auth_failures.saturating_sub(failures);
        plog(
            LogLevel::Warn,
            &format!(
                "Bad authentication attempt on control connection ({}), {} left",
                id, attempts_remaining
            ),
        );
        if attempts_remaining == 0 {
            self.close_session(id);
        }
        Err(Error::AuthFailure { attempts_remaining })
    }

    /// Formats and fans out one event, if anyone wants it.
    ///
    /// Returns the number of sessions the line was queued on.
    pub fn queue_event(&mut self, kind: EventKind, payload: &Payload) -> usize {
        if !self.is_interesting(kind) {
            return 0;
        }
        let line = format_event(kind, payload);
        self.enqueue_line(&line)
    }

    /// Queues an already formatted line on every subscribed session.
    ///
    /// A session whose queue reaches the flush threshold is flushed at once.
    pub fn enqueue_line(&mut self, line: &QueuedLine) -> usize {
        let threshold = self.config.flush_threshold;
        let mut queued = 0;
        let mut gone = Vec::new();

        for (id, session) in self.sessions.iter_mut() {
            if !session.enqueue(line) {
                continue;
            }
            queued += 1;
            if let Err(Error::SessionGone) = session.flush(false, threshold) {
                gone.push(*id);
            }
        }
        if queued > 0 {
            self.flush_pending = true;
        }
        for id in gone {
            self.teardown_gone(id);
        }
        queued
    }

    /// Flushes one session.
    ///
    /// Non-forced flushes deliver only once the threshold is reached.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownSession`] if `id` is not live. A closed sink
    /// tears the session down and reports zero lines delivered.
    pub fn flush(&mut self, id: SessionId, force: bool) -> Result<usize> {
        let threshold = self.config.flush_threshold;
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(Error::UnknownSession(id))?;
        match session.flush(force, threshold) {
            Ok(n) => Ok(n),
            Err(Error::SessionGone) => {
                self.teardown_gone(id);
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    /// Drains every session's queue.
    ///
    /// A non-forced call is the scheduled tick: it does nothing unless
    /// something was queued since the last drain. A forced call always
    /// drains, as at shutdown. Returns the number of lines delivered.
    pub fn flush_all(&mut self, force: bool) -> usize {
        if !force && !self.flush_pending {
            return 0;
        }
        self.flush_pending = false;

        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, session) in self.sessions.iter_mut() {
            match session.flush(true, 0) {
                Ok(n) => delivered += n,
                Err(_) => gone.push(*id),
            }
        }
        for id in gone {
            self.teardown_gone(id);
        }
        if delivered > 0 {
            plog(
                LogLevel::Debug,
                &format!("Flushed {} event lines (forced: {})", delivered, force),
            );
        }
        delivered
    }

    /// Whether a scheduled flush has anything to do.
    pub fn flush_pending(&self) -> bool {
        self.flush_pending
    }

    /// Forwards a daemon log message as a `DEBUG`..`ERR` event.
    ///
    /// Line breaks are folded into spaces so the message stays one line.
    pub fn queue_log_message(&mut self, severity: LogLevel, message: &str) -> usize {
        let kind = EventKind::for_log_severity(severity);
        if !self.is_interesting(kind) {
            return 0;
        }
        self.queue_event(kind, &Payload::Plain(Words::new().rest(message)))
    }

    /// The least and most severe log levels any session subscribed to.
    ///
    /// The daemon uses this to widen or narrow what it hands to
    /// [`queue_log_message`](Self::queue_log_message).
    pub fn log_severity_range(&self) -> Option<(LogLevel, LogLevel)> {
        let mut levels = self.global_mask.kinds().filter_map(EventKind::log_severity);
        let first = levels.next()?;
        Some(levels.fold((first, first), |(lo, hi), level| {
            (lo.min(level), hi.max(level))
        }))
    }

    fn teardown_gone(&mut self, id: SessionId) {
        plog(
            LogLevel::Debug,
            &format!("Transport for {} closed during flush", id),
        );
        self.close_session(id);
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::session::MemorySink;
    use proptest::prelude::*;

    fn kind_strategy() -> impl Strategy<Value = EventKind> {
        prop::sample::select(EventKind::ALL.to_vec())
    }

    fn plain_kind_strategy() -> impl Strategy<Value = EventKind> {
        prop::sample::select(
            EventKind::ALL
                .iter()
                .copied()
                .filter(|k| k.encoding() == events::EventEncoding::Plain)
                .collect::<Vec<_>>(),
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn delivery_is_fifo(
            payloads in prop::collection::vec("[a-z0-9]{1,8}", 0..40),
            threshold in 1usize..8,
        ) {
            let mut registry = ControlRegistry::new(RegistryConfig {
                flush_threshold: threshold,
                ..RegistryConfig::default()
            });
            let sink = MemorySink::new();
            let id = registry.open_session_authenticated(Box::new(sink.clone()));
            registry.set_events(id, &["BW"]).unwrap();

            for p in &payloads {
                registry.queue_event(EventKind::BandwidthUsed, &Payload::Plain(Words::new().word(p)));
            }
            registry.flush_all(true);

            let got: Vec<String> = sink
                .lines()
                .iter()
                .map(|l| l.as_str().unwrap().to_string())
                .collect();
            let want: Vec<String> = payloads.iter().map(|p| format!("650 BW {}\r\n", p)).collect();
            prop_assert_eq!(got, want);
        }

        #[test]
        fn unsubscribed_kinds_never_queued(
            subscribed in prop::collection::vec(kind_strategy(), 0..6),
            fired in prop::collection::vec(plain_kind_strategy(), 0..30),
        ) {
            let mut registry = ControlRegistry::new(RegistryConfig {
                flush_threshold: usize::MAX,
                ..RegistryConfig::default()
            });
            let id = registry.open_session_authenticated(Box::new(Vec::<QueuedLine>::new()));
            let names: Vec<&str> = subscribed.iter().map(|k| k.name()).collect();
            registry.set_events(id, &names).unwrap();
            let mask = EventMask::from_kinds(&subscribed);

            for kind in &fired {
                registry.queue_event(*kind, &Payload::Plain(Words::new().word("x")));
            }

            let session = registry.session(id).unwrap();
            for line in session.queued() {
                prop_assert!(mask.contains(line.kind()));
            }
            let expected = fired.iter().filter(|k| mask.contains(**k)).count();
            prop_assert_eq!(session.queue_len(), expected);
        }
    }
}
