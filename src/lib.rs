//! # privcount-control
//!
//! The asynchronous control-channel event subsystem of an onion-routing
//! daemon, with PrivCount traffic instrumentation.
//!
//! # Overview
//!
//! Authenticated controller sessions subscribe to a fixed set of event kinds
//! and receive them as line-oriented, escaped text. Event production never
//! blocks: producers check a global interest mask, format once, and queue the
//! line on every subscribed session; a flush step hands queued lines to each
//! session's transport in FIFO order.
//!
//! ```text
//!   lifecycle tap ──▶ is_interesting? ──▶ typed Payload ──▶ format_event
//!                                                                │
//!        ┌───────────────────────────────────────────────────────┘
//!        ▼
//!   ControlRegistry ──▶ session queues ──▶ flush ──▶ EventSink (transport)
//! ```
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`events`] | Event kinds, masks, and the compile-time capacity check |
//! | [`escape`] | Dot-escaping codec and quoted field values |
//! | [`payload`] | Typed payload builders and the single event formatter |
//! | [`session`] | Controller sessions, queued lines, and delivery sinks |
//! | [`registry`] | Live sessions, global mask, fan-out, flush, subscription, authentication |
//! | [`cell_stats`] | Per-circuit cell statistics for `CELL_STATS` |
//! | [`entities`] | Arena of circuits, connections, and exit streams addressed by handles |
//! | [`privcount`] | PrivCount instrumentation events |
//! | [`control`] | Producers for the classic control events |
//! | [`auth`] | Hashed passwords, cookies, and credential verification |
//! | [`config`] | Configuration management (TOML, CLI, environment) |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`logger`] | Logging infrastructure using tracing |
//!
//! # What This Library Does NOT Do
//!
//! - **Socket I/O**: sessions deliver into an [`EventSink`]; the transport
//!   behind it belongs to the daemon
//! - **Circuit construction**: circuits, connections, and streams are
//!   registered in an [`EntityArena`] by the daemon
//! - **Cookie files**: cookies are generated and compared in memory only
//! - **Persistence**: nothing outlives the process
//!
//! # Quick Start
//!
//! ```rust
//! use privcount_control::auth::{ConfiguredAuth, Credential, HashedPassword};
//! use privcount_control::control;
//! use privcount_control::session::MemorySink;
//! use privcount_control::{ControlRegistry, RegistryConfig};
//!
//! let auth = ConfiguredAuth::new(vec![HashedPassword::generate(b"secret")], None);
//! let mut registry = ControlRegistry::new(RegistryConfig::default());
//!
//! let sink = MemorySink::new();
//! let id = registry.open_session(Box::new(sink.clone()));
//! let credential = Credential::parse_argument("\"secret\"").unwrap();
//! registry.authenticate(id, &credential, &auth).unwrap();
//! registry.set_events(id, &["NETWORK_LIVENESS"]).unwrap();
//!
//! control::network_liveness_update(&mut registry, true);
//! registry.flush_all(false);
//!
//! assert_eq!(sink.lines()[0].as_bytes(), b"650 NETWORK_LIVENESS UP\r\n");
//! ```
//!
//! # Configuration
//!
//! ```text
//! ┌─────────────────┐
//! │   CLI Arguments │ ◄── Highest priority (overrides all)
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │   Config File   │ ◄── TOML file (default: privcount-control.toml,
//! │     (TOML)      │     or PRIVCOUNT_CONTROL_CONFIG)
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │    Defaults     │ ◄── Sensible defaults for all options
//! └─────────────────┘
//! ```
//!
//! See [`Config`] for all available options.
//!
//! # Security Considerations
//!
//! - **Constant-time comparison**: password digests and cookies are compared
//!   over their full length
//! - **Memory hygiene**: candidate secrets and cookies are zeroized on drop
//! - **No leakage**: authentication failures never say which credential was
//!   wrong, and secrets are never logged
//!
//! # See Also
//!
//! - [Tor Control Protocol Specification](https://spec.torproject.org/control-spec) - Protocol reference

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod auth;
pub mod cell_stats;
pub mod config;
pub mod control;
pub mod entities;
pub mod error;
pub mod escape;
pub mod events;
pub mod logger;
pub mod payload;
pub mod privcount;
pub mod registry;
pub mod session;

pub use auth::{
    AuthCookie, ConfiguredAuth, Credential, CredentialVerifier, HashedPassword, SecurePassword,
};
pub use cell_stats::{CellOp, CellStats, CellStatsEntry, CellStatsIdentity, Direction};
pub use config::{CliArgs, Config, LogLevel, PrivcountConfig, RegistryConfig};
pub use entities::{CircuitHandle, ConnectionHandle, EntityArena, StreamHandle};
pub use error::{Error, Result};
pub use events::{EventEncoding, EventKind, EventMask};
pub use payload::{format_event, Fields, Payload, Words};
pub use privcount::{ExitTrafficOnly, PrivcountEmitter, TrafficFilter, PRIVCOUNT_VERSION};
pub use registry::ControlRegistry;
pub use session::{ControllerSession, EventSink, MemorySink, QueuedLine, SessionId};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
