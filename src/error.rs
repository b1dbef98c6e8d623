//! Error types for privcount-control.
//!
//! This module defines the [`enum@Error`] enum representing every failure the
//! control-channel event subsystem can report, and the crate-wide [`Result`]
//! alias.
//!
//! # Error Categories
//!
//! ```text
//!   Error
//!   ├── InvalidEventName       ◄── Unknown subscription token (session unchanged)
//!   ├── MalformedEscapedData   ◄── Dot-escaped input violates framing rules
//!   ├── AuthFailure            ◄── Credential mismatch (bounded retries)
//!   ├── Unauthenticated        ◄── Command needs an authenticated session
//!   ├── UnknownSession         ◄── No live session with that id
//!   ├── SessionGone            ◄── Transport closed while delivering
//!   ├── InvalidHashedPassword  ◄── One configured password entry is malformed
//!   ├── Config                 ◄── Invalid configuration
//!   ├── Io                     ◄── File I/O failures
//!   └── Validation             ◄── Invalid input data
//! ```
//!
//! # Recovery Guide
//!
//! | Error | Scope | Recommended Action |
//! |-------|-------|-------------------|
//! | [`InvalidEventName`](Error::InvalidEventName) | One session | Reply `552`, keep session |
//! | [`MalformedEscapedData`](Error::MalformedEscapedData) | One session | Reply syntax error |
//! | [`AuthFailure`](Error::AuthFailure) | One session | Reply `515`, drop when exhausted |
//! | [`Unauthenticated`](Error::Unauthenticated) | One session | Reply `514` |
//! | [`SessionGone`](Error::SessionGone) | One session | Tear the session down silently |
//! | [`InvalidHashedPassword`](Error::InvalidHashedPassword) | One entry | Skip entry, warn |
//! | [`Config`](Error::Config) | Process | Fix configuration |
//!
//! There is deliberately no variant for an event mask overflowing its 64
//! bits: that condition is rejected at compile time by a `const` assertion in
//! [`crate::events`].
//!
//! # Example
//!
//! ```rust
//! use privcount_control::{ControlRegistry, Error, MemorySink, RegistryConfig};
//!
//! let mut registry = ControlRegistry::new(RegistryConfig::default());
//! let id = registry.open_session_authenticated(Box::new(MemorySink::new()));
//!
//! match registry.set_events(id, &["CIRC", "NOT_AN_EVENT"]) {
//!     Err(Error::InvalidEventName(name)) => assert_eq!(name, "NOT_AN_EVENT"),
//!     other => panic!("unexpected: {:?}", other),
//! }
//! ```

use thiserror::Error;

use crate::session::SessionId;

/// Errors that can occur in the control-channel event subsystem.
///
/// Local, recoverable errors (bad subscription tokens, bad authentication
/// attempts, malformed escaped input) only ever affect the session that
/// caused them. None of them touch other sessions' queues.
#[derive(Debug, Error)]
pub enum Error {
    /// A subscription request named an event that does not exist.
    ///
    /// Subscription is all-or-nothing, so the session's mask is left exactly
    /// as it was before the request.
    #[error("unrecognized event \"{0}\"")]
    InvalidEventName(String),

    /// Dot-escaped input violated line termination or stuffing rules.
    #[error("malformed escaped data: {0}")]
    MalformedEscapedData(String),

    /// Authentication failed.
    ///
    /// The message never reveals which part of a credential was wrong.
    #[error("authentication failed ({attempts_remaining} attempts remaining)")]
    AuthFailure {
        /// Attempts left before the session is disconnected.
        attempts_remaining: u32,
    },

    /// The session has not authenticated yet.
    #[error("authentication required")]
    Unauthenticated,

    /// No live session has this identifier.
    #[error("no such session: {0}")]
    UnknownSession(SessionId),

    /// The session's transport went away while lines were being delivered.
    ///
    /// The registry handles this internally by tearing the session down; it
    /// is never propagated to event producers.
    #[error("session transport is gone")]
    SessionGone,

    /// A configured hashed password could not be decoded.
    #[error("hashed password entry {index} is invalid: {reason}")]
    InvalidHashedPassword {
        /// Zero-based position of the entry in the configured list.
        index: usize,
        /// Human-readable reason, never containing the entry itself.
        reason: String,
    },

    /// Configuration error.
    ///
    /// Not recoverable without fixing the configuration file or CLI flags.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error while reading configuration or writing logs.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Input validation error.
    #[error("validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Returns the control-protocol status code used when this error is
    /// reported back to the originating session.
    ///
    /// ```rust
    /// use privcount_control::Error;
    ///
    /// assert_eq!(Error::InvalidEventName("X".into()).status_code(), 552);
    /// assert_eq!(Error::AuthFailure { attempts_remaining: 1 }.status_code(), 515);
    /// ```
    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidEventName(_) => 552,
            Error::MalformedEscapedData(_) | Error::Validation(_) => 512,
            Error::AuthFailure { .. } => 515,
            Error::Unauthenticated => 514,
            _ => 551,
        }
    }

    /// Formats this error as a single control-protocol reply line.
    pub fn reply_line(&self) -> String {
        format!("{} {}\r\n", self.status_code(), self)
    }
}

/// Result type alias for privcount-control operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_does_not_name_credential_part() {
        let msg = Error::AuthFailure {
            attempts_remaining: 2,
        }
        .to_string();
        assert!(!msg.contains("password"));
        assert!(!msg.contains("cookie"));
        assert!(msg.contains('2'));
    }

    #[test]
    fn test_reply_line_format() {
        let line = Error::InvalidEventName("FOO".to_string()).reply_line();
        assert_eq!(line, "552 unrecognized event \"FOO\"\r\n");
    }

    #[test]
    fn test_hashed_password_error_hides_entry() {
        let err = Error::InvalidHashedPassword {
            index: 3,
            reason: "bad length".to_string(),
        };
        assert_eq!(err.to_string(), "hashed password entry 3 is invalid: bad length");
    }
}
