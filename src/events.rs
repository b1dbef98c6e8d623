//! Event kinds, subscription masks, and the build-time capacity check.
//!
//! Every asynchronous event a controller can subscribe to is an [`EventKind`].
//! Each kind owns exactly one bit of a 64-bit [`EventMask`]; the bit index is
//! the kind's numeric code, so the mapping is injective by construction.
//!
//! # Event Code Layout
//!
//! ```text
//!   0x01 ─ 0x1D   status / log / bandwidth events      (0x0D reclaimed)
//!   0x20 ─ 0x23   transport / hidden service / liveness
//!   0x24          PRIVCOUNT positional (exit) events
//!   0x25 ─ 0x28   PRIVCOUNT exit-only end-of-life events
//!   0x29 ─ 0x2A   PRIVCOUNT HSDir cache events
//!   0x32 ─ 0x34   PRIVCOUNT unfiltered cell / close events
//!   0x35 ─ 0x36   PRIVCOUNT tagged Viterbi events
//!
//!   EVENT_CAPACITY = 64 bits ── MAX must stay below it (checked at compile time)
//! ```
//!
//! # Example
//!
//! ```rust
//! use privcount_control::{EventKind, EventMask};
//!
//! let mask = EventMask::from_kinds(&[EventKind::CircuitStatus, EventKind::BandwidthUsed]);
//! assert!(mask.contains(EventKind::CircuitStatus));
//! assert!(!mask.contains(EventKind::StreamStatus));
//! assert_eq!(EventKind::from_name("circ"), Some(EventKind::CircuitStatus));
//! ```

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::config::LogLevel;

/// Number of bits in an [`EventMask`].
pub const EVENT_CAPACITY: u32 = 64;

/// How an event's payload is laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventEncoding {
    /// Classic control-protocol event text.
    Plain,
    /// Field order carries meaning.
    Positional,
    /// `Key=Value` pairs; consumers must not depend on order.
    PositionIndependent,
    /// A single opaque blob carried verbatim behind the event name.
    Tagged,
}

macro_rules! event_kinds {
    ($( $(#[$meta:meta])* $variant:ident = $code:literal => $name:literal, $enc:ident; )+) => {
        /// An asynchronous event a controller session can subscribe to.
        ///
        /// The discriminant is the event's numeric code and doubles as its bit
        /// position in an [`EventMask`].
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(u8)]
        pub enum EventKind {
            $( $(#[$meta])* $variant = $code, )+
        }

        impl EventKind {
            /// Every declared kind, in code order.
            pub const ALL: &'static [EventKind] = &[ $( EventKind::$variant, )+ ];

            /// The name used on the control channel (`SETEVENTS` token and
            /// event line keyword).
            pub const fn name(self) -> &'static str {
                match self {
                    $( EventKind::$variant => $name, )+
                }
            }

            /// The payload discipline used for this kind.
            pub const fn encoding(self) -> EventEncoding {
                match self {
                    $( EventKind::$variant => EventEncoding::$enc, )+
                }
            }

            /// Looks a kind up by its control-channel name, ignoring ASCII case.
            pub fn from_name(name: &str) -> Option<EventKind> {
                $(
                    if name.eq_ignore_ascii_case($name) {
                        return Some(EventKind::$variant);
                    }
                )+
                None
            }
        }
    };
}

event_kinds! {
    /// Circuit status changed.
    CircuitStatus = 0x01 => "CIRC", Plain;
    /// Stream status changed.
    StreamStatus = 0x02 => "STREAM", Plain;
    /// OR connection status changed.
    OrConnStatus = 0x03 => "ORCONN", Plain;
    /// Bytes read and written in the last second.
    BandwidthUsed = 0x04 => "BW", Plain;
    /// Minor circuit change (purpose change, cannibalization).
    CircuitStatusMinor = 0x05 => "CIRC_MINOR", Plain;
    /// New router descriptors available.
    NewDesc = 0x06 => "NEWDESC", Plain;
    /// Debug-severity log message.
    DebugMsg = 0x07 => "DEBUG", Plain;
    /// Info-severity log message.
    InfoMsg = 0x08 => "INFO", Plain;
    /// Notice-severity log message.
    NoticeMsg = 0x09 => "NOTICE", Plain;
    /// Warn-severity log message.
    WarnMsg = 0x0A => "WARN", Plain;
    /// Error-severity log message.
    ErrMsg = 0x0B => "ERR", Plain;
    /// Address mapping changed.
    AddrMap = 0x0C => "ADDRMAP", Plain;
    /// Our own descriptor changed.
    DescChanged = 0x0E => "DESCCHANGED", Plain;
    /// Network status changed.
    NetworkStatus = 0x0F => "NS", Plain;
    /// Client status.
    StatusClient = 0x10 => "STATUS_CLIENT", Plain;
    /// Server status.
    StatusServer = 0x11 => "STATUS_SERVER", Plain;
    /// General status.
    StatusGeneral = 0x12 => "STATUS_GENERAL", Plain;
    /// Entry guard changed.
    Guard = 0x13 => "GUARD", Plain;
    /// Per-stream bandwidth.
    StreamBandwidthUsed = 0x14 => "STREAM_BW", Plain;
    /// Client countries seen by a bridge.
    ClientsSeen = 0x15 => "CLIENTS_SEEN", Plain;
    /// New consensus arrived.
    NewConsensus = 0x16 => "NEWCONSENSUS", Plain;
    /// Circuit build timeout changed.
    BuildTimeoutSet = 0x17 => "BUILDTIMEOUT_SET", Plain;
    /// Signal received.
    GotSignal = 0x18 => "SIGNAL", Plain;
    /// Configuration changed.
    ConfChanged = 0x19 => "CONF_CHANGED", Plain;
    /// Per-connection bandwidth.
    ConnBandwidth = 0x1A => "CONN_BW", Plain;
    /// Per-circuit cell statistics.
    CellStats = 0x1B => "CELL_STATS", Plain;
    /// Token bucket emptied.
    TbEmpty = 0x1C => "TB_EMPTY", Plain;
    /// Per-circuit bandwidth.
    CircBandwidthUsed = 0x1D => "CIRC_BW", Plain;
    /// Pluggable transport launched.
    TransportLaunched = 0x20 => "TRANSPORT_LAUNCHED", Plain;
    /// Hidden service descriptor activity.
    HsDesc = 0x21 => "HS_DESC", Plain;
    /// Hidden service descriptor content.
    HsDescContent = 0x22 => "HS_DESC_CONTENT", Plain;
    /// Network liveness changed.
    NetworkLiveness = 0x23 => "NETWORK_LIVENESS", Plain;
    /// Exit resolved a DNS name.
    PrivcountDnsResolved = 0x24 => "PRIVCOUNT_DNS_RESOLVED", Positional;
    /// Exit stream transferred bytes.
    PrivcountStreamBytesTransferred = 0x25 => "PRIVCOUNT_STREAM_BYTES_TRANSFERRED", PositionIndependent;
    /// Exit stream ended.
    PrivcountStreamEnded = 0x26 => "PRIVCOUNT_STREAM_ENDED", PositionIndependent;
    /// Exit circuit ended.
    PrivcountCircuitEnded = 0x27 => "PRIVCOUNT_CIRCUIT_ENDED", PositionIndependent;
    /// Client OR connection ended.
    PrivcountConnectionEnded = 0x28 => "PRIVCOUNT_CONNECTION_ENDED", PositionIndependent;
    /// HSDir cache store attempt.
    PrivcountHsdirCacheStore = 0x29 => "PRIVCOUNT_HSDIR_CACHE_STORE", PositionIndependent;
    /// HSDir cache fetch attempt.
    PrivcountHsdirCacheFetch = 0x2A => "PRIVCOUNT_HSDIR_CACHE_FETCH", PositionIndependent;
    /// A cell was sent or received on a circuit.
    PrivcountCircuitCell = 0x32 => "PRIVCOUNT_CIRCUIT_CELL", PositionIndependent;
    /// Any circuit closed.
    PrivcountCircuitClose = 0x33 => "PRIVCOUNT_CIRCUIT_CLOSE", PositionIndependent;
    /// Any OR connection closed.
    PrivcountConnectionClose = 0x34 => "PRIVCOUNT_CONNECTION_CLOSE", PositionIndependent;
    /// Viterbi decoder packet summary.
    PrivcountViterbiPackets = 0x35 => "PRIVCOUNT_VITERBI_PACKETS", Tagged;
    /// Viterbi decoder stream summary.
    PrivcountViterbiStreams = 0x36 => "PRIVCOUNT_VITERBI_STREAMS", Tagged;
}

impl EventKind {
    /// Lowest declared kind.
    pub const MIN: EventKind = EventKind::CircuitStatus;
    /// Highest declared kind.
    pub const MAX: EventKind = EventKind::PrivcountViterbiStreams;

    /// The numeric code of this kind.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// The bit position of this kind in an [`EventMask`], in `0..64`.
    pub const fn bit_index(self) -> u32 {
        self as u32
    }

    /// The single-bit mask for this kind.
    pub const fn bit(self) -> u64 {
        1u64 << self.bit_index()
    }

    /// Maps a log-message kind to its severity.
    pub fn log_severity(self) -> Option<LogLevel> {
        match self {
            EventKind::DebugMsg => Some(LogLevel::Debug),
            EventKind::InfoMsg => Some(LogLevel::Info),
            EventKind::NoticeMsg => Some(LogLevel::Notice),
            EventKind::WarnMsg => Some(LogLevel::Warn),
            EventKind::ErrMsg => Some(LogLevel::Error),
            _ => None,
        }
    }

    /// Maps a log severity to the event kind that carries it.
    pub fn for_log_severity(level: LogLevel) -> EventKind {
        match level {
            LogLevel::Debug => EventKind::DebugMsg,
            LogLevel::Info => EventKind::InfoMsg,
            LogLevel::Notice => EventKind::NoticeMsg,
            LogLevel::Warn => EventKind::WarnMsg,
            LogLevel::Error => EventKind::ErrMsg,
        }
    }

    /// Whether this is one of the PrivCount instrumentation kinds.
    pub fn is_privcount(self) -> bool {
        self >= EventKind::PrivcountDnsResolved
    }
}

// The mask shifts by the kind code, so the largest code must fit in 64 bits.
const _: () = assert!(
    (EventKind::MAX as u32) < EVENT_CAPACITY,
    "event mask has an event greater than its capacity"
);

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of subscribed event kinds, one bit per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u64);

impl EventMask {
    /// The empty mask.
    pub const NONE: EventMask = EventMask(0);

    /// The union of every declared kind.
    pub const ALL_VALID: EventMask = EventMask::all_valid();

    const fn all_valid() -> EventMask {
        let mut bits = 0u64;
        let mut i = 0;
        while i < EventKind::ALL.len() {
            bits |= EventKind::ALL[i].bit();
            i += 1;
        }
        EventMask(bits)
    }

    /// Wraps raw mask bits.
    pub const fn from_bits(bits: u64) -> EventMask {
        EventMask(bits)
    }

    /// Builds a mask from a list of kinds.
    pub fn from_kinds(kinds: &[EventKind]) -> EventMask {
        kinds.iter().fold(EventMask::NONE, |mask, kind| mask.with(*kind))
    }

    /// Raw mask bits.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Returns this mask with `kind` added.
    pub const fn with(self, kind: EventKind) -> EventMask {
        EventMask(self.0 | kind.bit())
    }

    /// Whether `kind` is in the mask.
    pub const fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// Whether the mask is empty.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every set bit belongs to a declared kind.
    pub const fn is_valid(self) -> bool {
        self.0 & !EventMask::ALL_VALID.0 == 0
    }

    /// Iterates over the kinds in the mask in code order.
    pub fn kinds(self) -> impl Iterator<Item = EventKind> {
        EventKind::ALL
            .iter()
            .copied()
            .filter(move |kind| self.contains(*kind))
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

/// Returns the union of every declared kind's bit.
pub fn mask_all_valid_kinds() -> EventMask {
    EventMask::ALL_VALID
}

/// Cheap interest pre-filter, checked before any formatting work.
#[inline]
pub fn is_interesting(global_mask: EventMask, kind: EventKind) -> bool {
    global_mask.contains(kind)
}

/// Parses a `SETEVENTS` token list into a mask.
///
/// All-or-nothing: the first unknown token fails the whole list. The legacy
/// `EXTENDED` token is accepted and ignored.
pub fn parse_event_names<S: AsRef<str>>(tokens: &[S]) -> crate::Result<EventMask> {
    let mut mask = EventMask::NONE;
    for token in tokens {
        let token = token.as_ref();
        if token.eq_ignore_ascii_case("EXTENDED") {
            continue;
        }
        match EventKind::from_name(token) {
            Some(kind) => mask = mask.with(kind),
            None => return Err(crate::Error::InvalidEventName(token.to_string())),
        }
    }
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_codes_match_control_numbering() {
        assert_eq!(EventKind::CircuitStatus.code(), 0x01);
        assert_eq!(EventKind::NetworkStatus.code(), 0x0F);
        assert_eq!(EventKind::CircBandwidthUsed.code(), 0x1D);
        assert_eq!(EventKind::TransportLaunched.code(), 0x20);
        assert_eq!(EventKind::PrivcountHsdirCacheFetch.code(), 0x2A);
        assert_eq!(EventKind::PrivcountCircuitCell.code(), 0x32);
        assert_eq!(EventKind::MAX.code(), 0x36);
    }

    #[test]
    fn test_bits_are_unique() {
        let mut seen = HashSet::new();
        for kind in EventKind::ALL {
            assert!(kind.bit_index() < EVENT_CAPACITY);
            assert!(seen.insert(kind.bit()), "{} shares a bit", kind);
        }
    }

    #[test]
    fn test_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_name(kind.name()), Some(*kind));
            assert_eq!(
                EventKind::from_name(&kind.name().to_lowercase()),
                Some(*kind)
            );
        }
        assert_eq!(EventKind::from_name("AUTHDIR_NEWDESCS"), None);
    }

    #[test]
    fn test_all_valid_excludes_gaps() {
        let all = mask_all_valid_kinds();
        assert_eq!(all.bits() & 1, 0);
        assert_eq!(all.bits() & (1 << 0x0D), 0);
        assert_eq!(all.bits() & (1 << 0x1E), 0);
        assert_eq!(all.bits() & (1 << 0x2B), 0);
        assert_eq!(all.bits().count_ones() as usize, EventKind::ALL.len());
        assert!(!EventMask::from_bits(1 << 0x2B).is_valid());
        assert!(all.is_valid());
    }

    #[test]
    fn test_is_interesting() {
        let mask = EventMask::from_kinds(&[EventKind::CircuitStatus]);
        assert!(is_interesting(mask, EventKind::CircuitStatus));
        assert!(!is_interesting(mask, EventKind::StreamStatus));
        assert!(!is_interesting(EventMask::NONE, EventKind::CircuitStatus));
    }

    #[test]
    fn test_parse_event_names_all_or_nothing() {
        let mask = parse_event_names(&["circ", "EXTENDED", "Stream"]).unwrap();
        assert_eq!(
            mask,
            EventMask::from_kinds(&[EventKind::CircuitStatus, EventKind::StreamStatus])
        );

        let err = parse_event_names(&["CIRC", "BOGUS"]).unwrap_err();
        assert!(matches!(err, crate::Error::InvalidEventName(ref n) if n == "BOGUS"));
    }

    #[test]
    fn test_encodings() {
        assert_eq!(
            EventKind::PrivcountDnsResolved.encoding(),
            EventEncoding::Positional
        );
        assert_eq!(
            EventKind::PrivcountStreamEnded.encoding(),
            EventEncoding::PositionIndependent
        );
        assert_eq!(
            EventKind::PrivcountViterbiPackets.encoding(),
            EventEncoding::Tagged
        );
        assert_eq!(EventKind::CircuitStatus.encoding(), EventEncoding::Plain);
        assert!(EventKind::PrivcountDnsResolved.is_privcount());
        assert!(!EventKind::NetworkLiveness.is_privcount());
    }

    #[test]
    fn test_log_severity_mapping() {
        for level in [
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Notice,
            LogLevel::Warn,
            LogLevel::Error,
        ] {
            assert_eq!(EventKind::for_log_severity(level).log_severity(), Some(level));
        }
    }
}
