//! Typed event payloads and the single event-line formatter.
//!
//! Producers never build event text with format strings. They assemble a
//! [`Payload`] with one of the typed builders and hand it to
//! [`format_event`], which is the only place event lines are rendered.
//!
//! # Wire Shapes
//!
//! ```text
//!   single line     650 <NAME> <fields...>\r\n
//!   multi-line      650+<NAME> <fields...>\r\n
//!                   <dot-escaped body>
//!                   .\r\n
//!                   650 OK\r\n
//!   continued       650-<NAME>\r\n
//!                   650-<entry>\r\n ...
//!                   650 OK\r\n
//! ```
//!
//! | Payload | Used by | Field layout |
//! |---------|---------|--------------|
//! | [`Payload::Plain`] | classic events | words and `Key=Value` as the event defines |
//! | [`Payload::Positional`] | `PRIVCOUNT_DNS_RESOLVED` | fixed order |
//! | [`Payload::PositionIndependent`] | PrivCount end-of-life, cell, HSDir | `Key=Value`, any order |
//! | [`Payload::Tagged`] | Viterbi summaries | one opaque multi-line blob |
//! | [`Payload::MultiLine`] | `HS_DESC_CONTENT`, `NS`, `NEWCONSENSUS` | words plus a multi-line body |
//! | [`Payload::Continued`] | `CONF_CHANGED` | one `650-` line per entry |

use std::fmt::Display;

use crate::escape;
use crate::events::{EventEncoding, EventKind};
use crate::session::QueuedLine;

/// Status code carried by every asynchronous event line.
pub const ASYNC_EVENT_STATUS: u16 = 650;

/// An ordered list of `Key=Value` fields.
///
/// Text values are quoted when they contain anything that would break a
/// space-separated token.
///
/// ```rust
/// use privcount_control::payload::Fields;
///
/// let fields = Fields::new()
///     .num("StreamId", 7)
///     .text("RemoteHost", "example.com")
///     .text("Reason", "timed out")
///     .flag("IsOutboundFlag", true);
/// assert_eq!(
///     fields.render(),
///     "StreamId=7 RemoteHost=example.com Reason=\"timed out\" IsOutboundFlag=1"
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields {
    pairs: Vec<(&'static str, String)>,
}

impl Fields {
    /// Creates an empty field list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a numeric or otherwise token-safe value.
    ///
    /// A value that is not a single bare token is quoted.
    pub fn num<V: Display>(mut self, key: &'static str, value: V) -> Self {
        self.pairs.push((key, bare(value)));
        self
    }

    /// Adds free-form text, quoting it when required.
    pub fn text(mut self, key: &'static str, value: &str) -> Self {
        self.pairs
            .push((key, escape::field_value(value).into_owned()));
        self
    }

    /// Adds text that is always quoted.
    pub fn quoted(mut self, key: &'static str, value: &str) -> Self {
        self.pairs.push((key, escape::quote(value)));
        self
    }

    /// Adds a boolean as `1` / `0`.
    pub fn flag(self, key: &'static str, value: bool) -> Self {
        self.num(key, u8::from(value))
    }

    /// Adds a numeric value only when present.
    pub fn opt_num<V: Display>(self, key: &'static str, value: Option<V>) -> Self {
        match value {
            Some(value) => self.num(key, value),
            None => self,
        }
    }

    /// Adds a text value only when present.
    pub fn opt_text(self, key: &'static str, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.text(key, value),
            None => self,
        }
    }

    /// Adds a boolean only when known.
    pub fn opt_flag(self, key: &'static str, value: Option<bool>) -> Self {
        match value {
            Some(value) => self.flag(key, value),
            None => self,
        }
    }

    /// Looks a field up by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.pairs.iter().map(|(k, _)| *k)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether there are no fields.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Renders the fields as space-separated `Key=Value` tokens.
    pub fn render(&self) -> String {
        self.pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Builder for payloads whose tokens are written in a fixed order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Words {
    words: Vec<String>,
}

impl Words {
    /// Creates an empty word list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a token-safe value.
    ///
    /// A value that is not a single bare token is quoted, so no value can
    /// end the line early.
    pub fn word<V: Display>(mut self, value: V) -> Self {
        self.words.push(bare(value));
        self
    }

    /// Appends free-form text, quoting it when required.
    pub fn text(mut self, value: &str) -> Self {
        self.words.push(escape::field_value(value).into_owned());
        self
    }

    /// Appends `Key=Value` with a token-safe value.
    pub fn pair<V: Display>(mut self, key: &str, value: V) -> Self {
        self.words.push(format!("{}={}", escape::token(key), bare(value)));
        self
    }

    /// Appends `Key=Value` with free-form text.
    pub fn text_pair(mut self, key: &str, value: &str) -> Self {
        self.words.push(format!(
            "{}={}",
            escape::token(key),
            escape::field_value(value)
        ));
        self
    }

    /// Appends `Key="Value"`, quoted even when not required.
    pub fn quoted_pair(mut self, key: &str, value: &str) -> Self {
        self.words
            .push(format!("{}={}", escape::token(key), escape::quote(value)));
        self
    }

    /// Appends free text that runs to the end of the line.
    ///
    /// Control bytes, line breaks included, become spaces.
    pub fn rest(mut self, text: &str) -> Self {
        self.words.push(
            text.chars()
                .map(|c| if c.is_control() { ' ' } else { c })
                .collect(),
        );
        self
    }

    /// Appends pre-rendered `Key=Value` fields.
    pub fn fields(mut self, fields: &Fields) -> Self {
        if !fields.is_empty() {
            self.words.push(fields.render());
        }
        self
    }

    /// The words in order.
    pub fn as_slice(&self) -> &[String] {
        &self.words
    }

    /// Renders the words separated by single spaces.
    pub fn render(&self) -> String {
        self.words.join(" ")
    }
}

fn bare<V: Display>(value: V) -> String {
    let value = value.to_string();
    if escape::is_bare_token(&value) {
        value
    } else {
        escape::quote(&value)
    }
}

/// A fully structured event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Classic event text.
    Plain(Words),
    /// Field order is meaningful.
    Positional(Words),
    /// `Key=Value` fields in any order.
    PositionIndependent(Fields),
    /// A single opaque blob sent as a dot-escaped block.
    Tagged(Vec<u8>),
    /// Header words followed by a dot-escaped body.
    MultiLine {
        /// Words on the `650+` line.
        header: Words,
        /// Raw body, escaped when formatted.
        body: Vec<u8>,
    },
    /// One `650-` line per entry after the event name, closed by `650 OK`.
    Continued(Vec<Words>),
}

impl Payload {
    /// The encoding discipline this payload implements.
    pub fn encoding(&self) -> EventEncoding {
        match self {
            Payload::Plain(_) | Payload::MultiLine { .. } | Payload::Continued(_) => {
                EventEncoding::Plain
            }
            Payload::Positional(_) => EventEncoding::Positional,
            Payload::PositionIndependent(_) => EventEncoding::PositionIndependent,
            Payload::Tagged(_) => EventEncoding::Tagged,
        }
    }
}

/// Renders one event into a queueable line.
///
/// The payload shape must match the kind's declared encoding.
pub fn format_event(kind: EventKind, payload: &Payload) -> QueuedLine {
    debug_assert_eq!(
        kind.encoding(),
        payload.encoding(),
        "{} formatted with the wrong payload shape",
        kind
    );

    let mut out: Vec<u8> = Vec::with_capacity(64);
    match payload {
        Payload::Plain(words) | Payload::Positional(words) => {
            single_line(&mut out, kind, &words.render());
        }
        Payload::PositionIndependent(fields) => {
            single_line(&mut out, kind, &fields.render());
        }
        Payload::Tagged(blob) => {
            multi_line(&mut out, kind, "", blob);
        }
        Payload::MultiLine { header, body } => {
            multi_line(&mut out, kind, &header.render(), body);
        }
        Payload::Continued(lines) => {
            continued(&mut out, kind, lines);
        }
    }
    QueuedLine::new(kind, out)
}

fn single_line(out: &mut Vec<u8>, kind: EventKind, rest: &str) {
    out.extend_from_slice(format!("{} {}", ASYNC_EVENT_STATUS, kind.name()).as_bytes());
    if !rest.is_empty() {
        out.push(b' ');
        out.extend_from_slice(rest.as_bytes());
    }
    out.extend_from_slice(b"\r\n");
}

fn multi_line(out: &mut Vec<u8>, kind: EventKind, header: &str, body: &[u8]) {
    out.extend_from_slice(format!("{}+{}", ASYNC_EVENT_STATUS, kind.name()).as_bytes());
    if !header.is_empty() {
        out.push(b' ');
        out.extend_from_slice(header.as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&escape::encode(body));
    out.extend_from_slice(format!("{} OK\r\n", ASYNC_EVENT_STATUS).as_bytes());
}

fn continued(out: &mut Vec<u8>, kind: EventKind, lines: &[Words]) {
    out.extend_from_slice(format!("{}-{}\r\n", ASYNC_EVENT_STATUS, kind.name()).as_bytes());
    for line in lines {
        out.extend_from_slice(format!("{}-{}\r\n", ASYNC_EVENT_STATUS, line.render()).as_bytes());
    }
    out.extend_from_slice(format!("{} OK\r\n", ASYNC_EVENT_STATUS).as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_line() {
        let line = format_event(
            EventKind::BandwidthUsed,
            &Payload::Plain(Words::new().word(10).word(20)),
        );
        assert_eq!(line.as_bytes(), b"650 BW 10 20\r\n");
        assert_eq!(line.kind(), EventKind::BandwidthUsed);
    }

    #[test]
    fn test_position_independent_line() {
        let fields = Fields::new().num("ChannelId", 3).text("Reason", "a b");
        let line = format_event(
            EventKind::PrivcountConnectionClose,
            &Payload::PositionIndependent(fields),
        );
        assert_eq!(
            line.as_str(),
            Some("650 PRIVCOUNT_CONNECTION_CLOSE ChannelId=3 Reason=\"a b\"\r\n")
        );
    }

    #[test]
    fn test_tagged_blob_is_dot_escaped() {
        let line = format_event(
            EventKind::PrivcountViterbiPackets,
            &Payload::Tagged(b"state A\n.\nstate B".to_vec()),
        );
        assert_eq!(
            line.as_bytes(),
            b"650+PRIVCOUNT_VITERBI_PACKETS\r\nstate A\r\n..\r\nstate B\r\n.\r\n650 OK\r\n"
        );
    }

    #[test]
    fn test_multi_line_with_header() {
        let line = format_event(
            EventKind::HsDescContent,
            &Payload::MultiLine {
                header: Words::new().word("abc").word("desc").word("fp"),
                body: b"rendezvous-service-descriptor x".to_vec(),
            },
        );
        assert_eq!(
            line.as_bytes(),
            b"650+HS_DESC_CONTENT abc desc fp\r\nrendezvous-service-descriptor x\r\n.\r\n650 OK\r\n"
        );
    }

    #[test]
    fn test_fields_optional_helpers() {
        let fields = Fields::new()
            .opt_num("A", Some(1))
            .opt_num::<u32>("B", None)
            .opt_text("C", None)
            .opt_flag("D", Some(false));
        assert_eq!(fields.render(), "A=1 D=0");
        assert_eq!(fields.get("D"), Some("0"));
        assert_eq!(fields.keys().collect::<Vec<_>>(), vec!["A", "D"]);
    }

    #[test]
    fn test_words_text_is_quoted() {
        let words = Words::new().word("CIRC").text("two words").text_pair("K", "v=1");
        assert_eq!(words.render(), "CIRC \"two words\" K=\"v=1\"");
    }

    #[test]
    fn test_line_breaks_cannot_escape_a_word() {
        let words = Words::new()
            .word("$AA~x\r\n650 SIGNAL HALT")
            .pair("ID", "1\n2")
            .pair("BAD KEY", 3);
        let line = format_event(EventKind::CircuitStatus, &Payload::Plain(words));
        let text = line.as_str().unwrap();
        assert_eq!(text.matches("\r\n").count(), 1);
        assert_eq!(
            text,
            "650 CIRC \"$AA~x\\r\\n650 SIGNAL HALT\" ID=\"1\\n2\" \"BAD KEY\"=3\r\n"
        );
    }

    #[test]
    fn test_rest_folds_line_breaks() {
        let words = Words::new().rest("disk\r\nfull\tnow");
        assert_eq!(words.render(), "disk  full now");
    }

    #[test]
    fn test_fields_num_quotes_unsafe_values() {
        let fields = Fields::new().num("Count", 5).num("Host", "a\rb");
        assert_eq!(fields.render(), "Count=5 Host=\"a\\rb\"");
    }

    #[test]
    fn test_quoted_pair_always_quotes() {
        let words = Words::new().quoted_pair("CACHED", "YES");
        assert_eq!(words.render(), "CACHED=\"YES\"");
    }

    #[test]
    fn test_continued_lines() {
        let line = format_event(
            EventKind::ConfChanged,
            &Payload::Continued(vec![
                Words::new().pair("SocksPort", 9050),
                Words::new().word("ExitPolicy"),
            ]),
        );
        assert_eq!(
            line.as_str(),
            Some("650-CONF_CHANGED\r\n650-SocksPort=9050\r\n650-ExitPolicy\r\n650 OK\r\n")
        );
    }
}
