//! Producers for the classic control-protocol events.
//!
//! Each producer checks the registry's global mask first and returns without
//! building anything when no session is interested. Payloads are assembled
//! with the typed builders in [`crate::payload`].
//!
//! # Event Shapes
//!
//! ```text
//!   650 CIRC <id> <status> [<path>] [PURPOSE=..] [REASON=..]
//!   650 CIRC_MINOR <id> PURPOSE_CHANGED PURPOSE=.. OLD_PURPOSE=..
//!   650 CIRC_MINOR <id> CANNIBALIZED [<path>] PURPOSE=.. TIME_CREATED=..
//!                  OLD_PURPOSE=.. OLD_TIME_CREATED=..
//!   650 STREAM <id> <status> <circ id> <target> [REASON=..]
//!   650 ORCONN <target> <status> [REASON=..] [NCIRCS=..] ID=..
//!   650 BW <read> <written>
//!   650 STREAM_BW <id> <written> <read>
//!   650 CIRC_BW ID=.. READ=.. WRITTEN=..
//!   650 CONN_BW ID=.. TYPE=.. READ=.. WRITTEN=..
//!   650 TB_EMPTY <bucket> [ID=..] READ=.. WRITTEN=.. LAST=..
//!   650 NETWORK_LIVENESS UP|DOWN
//!   650 SIGNAL <name>
//!   650 STATUS_{GENERAL,CLIENT,SERVER} <severity> <action> [<args>]
//!   650 GUARD ENTRY $<fingerprint>[~<nickname>] <status>
//!   650 ADDRMAP <from> <to> "<expiry>"|NEVER [error=..] [EXPIRES=".."] CACHED=".."
//!   650-CONF_CHANGED / 650-<key>[=<value>] ... / 650 OK
//!   650 BUILDTIMEOUT_SET <type> TOTAL_TIMES=.. TIMEOUT_MS=.. XM=.. ALPHA=..
//!                  CUTOFF_QUANTILE=.. TIMEOUT_RATE=.. CLOSE_MS=.. CLOSE_RATE=..
//!   650 CLIENTS_SEEN TimeStarted=".." CountrySummary=.. IPVersions=..
//!   650 TRANSPORT_LAUNCHED client|server <name> <address> <port>
//!   650 NEWDESC <router> ...
//!   650 DESCCHANGED
//!   650+NS / 650+NEWCONSENSUS  (dot-escaped router status entries)
//!   650 HS_DESC <action> <address> <auth type> <hsdir> [<desc id>] [REASON=..] [REPLICA=..]
//!   650+HS_DESC_CONTENT <address> <desc id> <hsdir>  (dot-escaped body)
//!   650 CELL_STATS <identity> <command groups>
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};

use crate::cell_stats::{format_cell_stats, CellStats};
use crate::entities::{CircuitHandle, EntityArena};
use crate::events::EventKind;
use crate::payload::{Fields, Payload, Words};
use crate::registry::ControlRegistry;

macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $(
                #[doc = $text]
                $variant,
            )+
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(match self {
                    $( $name::$variant => $text, )+
                })
            }
        }
    };
}

status_enum! {
    /// Circuit lifecycle status.
    CircuitStatus {
        Launched => "LAUNCHED",
        Built => "BUILT",
        GuardWait => "GUARD_WAIT",
        Extended => "EXTENDED",
        Failed => "FAILED",
        Closed => "CLOSED",
    }
}

status_enum! {
    /// Stream lifecycle status.
    StreamStatus {
        New => "NEW",
        NewResolve => "NEWRESOLVE",
        Remap => "REMAP",
        SentConnect => "SENTCONNECT",
        SentResolve => "SENTRESOLVE",
        Succeeded => "SUCCEEDED",
        Failed => "FAILED",
        Closed => "CLOSED",
        Detached => "DETACHED",
    }
}

status_enum! {
    /// OR connection lifecycle status.
    OrConnStatus {
        New => "NEW",
        Launched => "LAUNCHED",
        Connected => "CONNECTED",
        Failed => "FAILED",
        Closed => "CLOSED",
    }
}

status_enum! {
    /// Severity of a `STATUS_*` event.
    StatusSeverity {
        Notice => "NOTICE",
        Warn => "WARN",
        Err => "ERR",
    }
}

status_enum! {
    /// Entry guard status change.
    GuardStatus {
        New => "NEW",
        Dropped => "DROPPED",
        Up => "UP",
        Down => "DOWN",
        Bad => "BAD",
        Good => "GOOD",
    }
}

status_enum! {
    /// Why the circuit build timeout changed.
    BuildTimeoutKind {
        Computed => "COMPUTED",
        Reset => "RESET",
        Suspended => "SUSPENDED",
        Discard => "DISCARD",
        Resume => "RESUME",
    }
}

status_enum! {
    /// Which side of a pluggable transport was launched.
    TransportMode {
        Client => "client",
        Server => "server",
    }
}

status_enum! {
    /// Hidden service descriptor activity.
    HsDescAction {
        Requested => "REQUESTED",
        Upload => "UPLOAD",
        Received => "RECEIVED",
        Uploaded => "UPLOADED",
        Failed => "FAILED",
        Created => "CREATED",
    }
}

status_enum! {
    /// Client authorization used for a hidden service.
    HsAuthType {
        NoAuth => "NO_AUTH",
        BasicAuth => "BASIC_AUTH",
        StealthAuth => "STEALTH_AUTH",
        Unknown => "UNKNOWN",
    }
}

/// The three `STATUS_*` event families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusFamily {
    /// `STATUS_GENERAL`
    General,
    /// `STATUS_CLIENT`
    Client,
    /// `STATUS_SERVER`
    Server,
}

impl StatusFamily {
    fn kind(self) -> EventKind {
        match self {
            StatusFamily::General => EventKind::StatusGeneral,
            StatusFamily::Client => EventKind::StatusClient,
            StatusFamily::Server => EventKind::StatusServer,
        }
    }
}

/// A `CIRC` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitEvent {
    /// Circuit identifier.
    pub circ_id: u32,
    /// New status.
    pub status: CircuitStatus,
    /// Hops, as `$fingerprint~nickname` tokens.
    pub path: Vec<String>,
    /// Circuit purpose.
    pub purpose: Option<String>,
    /// Why the circuit failed or closed.
    pub reason: Option<String>,
}

/// Emits a `CIRC` event.
pub fn circuit_status(registry: &mut ControlRegistry, event: &CircuitEvent) -> bool {
    let kind = EventKind::CircuitStatus;
    if !registry.is_interesting(kind) {
        return false;
    }
    let mut words = Words::new().word(event.circ_id).word(event.status);
    if !event.path.is_empty() {
        words = words.text(&event.path.join(","));
    }
    if let Some(purpose) = &event.purpose {
        words = words.text_pair("PURPOSE", purpose);
    }
    if let Some(reason) = &event.reason {
        words = words.text_pair("REASON", reason);
    }
    registry.queue_event(kind, &Payload::Plain(words)) > 0
}

/// Emits a `CIRC_MINOR` purpose change.
pub fn circuit_purpose_changed(
    registry: &mut ControlRegistry,
    circ_id: u32,
    old_purpose: &str,
    new_purpose: &str,
) -> bool {
    let kind = EventKind::CircuitStatusMinor;
    if !registry.is_interesting(kind) {
        return false;
    }
    let words = Words::new()
        .word(circ_id)
        .word("PURPOSE_CHANGED")
        .text_pair("PURPOSE", new_purpose)
        .text_pair("OLD_PURPOSE", old_purpose);
    registry.queue_event(kind, &Payload::Plain(words)) > 0
}

/// Emits a `CIRC_MINOR` event for a circuit taken over for a new purpose.
///
/// `event` carries the circuit after cannibalization; its status is not
/// part of this line.
pub fn circuit_cannibalized(
    registry: &mut ControlRegistry,
    event: &CircuitEvent,
    created: DateTime<Utc>,
    old_purpose: &str,
    old_created: DateTime<Utc>,
) -> bool {
    let kind = EventKind::CircuitStatusMinor;
    if !registry.is_interesting(kind) {
        return false;
    }
    let mut words = Words::new().word(event.circ_id).word("CANNIBALIZED");
    if !event.path.is_empty() {
        words = words.text(&event.path.join(","));
    }
    if let Some(purpose) = &event.purpose {
        words = words.text_pair("PURPOSE", purpose);
    }
    let words = words
        .pair("TIME_CREATED", iso_time_usec(&created))
        .text_pair("OLD_PURPOSE", old_purpose)
        .pair("OLD_TIME_CREATED", iso_time_usec(&old_created));
    registry.queue_event(kind, &Payload::Plain(words)) > 0
}

fn iso_time_usec(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

fn iso_time(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Emits a `STREAM` event. `circ_id` is 0 for unattached streams.
pub fn stream_status(
    registry: &mut ControlRegistry,
    stream_id: u64,
    status: StreamStatus,
    circ_id: u32,
    target: &str,
    reason: Option<&str>,
) -> bool {
    let kind = EventKind::StreamStatus;
    if !registry.is_interesting(kind) {
        return false;
    }
    let mut words = Words::new()
        .word(stream_id)
        .word(status)
        .word(circ_id)
        .text(target);
    if let Some(reason) = reason {
        words = words.text_pair("REASON", reason);
    }
    registry.queue_event(kind, &Payload::Plain(words)) > 0
}

/// Emits an `ORCONN` event.
pub fn or_conn_status(
    registry: &mut ControlRegistry,
    conn_id: u64,
    target: &str,
    status: OrConnStatus,
    reason: Option<&str>,
    n_circuits: Option<u32>,
) -> bool {
    let kind = EventKind::OrConnStatus;
    if !registry.is_interesting(kind) {
        return false;
    }
    let mut words = Words::new().text(target).word(status);
    if let Some(reason) = reason {
        words = words.text_pair("REASON", reason);
    }
    if let Some(n) = n_circuits {
        words = words.pair("NCIRCS", n);
    }
    words = words.pair("ID", conn_id);
    registry.queue_event(kind, &Payload::Plain(words)) > 0
}

/// Emits the once-a-second `BW` totals.
pub fn bandwidth_used(registry: &mut ControlRegistry, read: u64, written: u64) -> bool {
    let kind = EventKind::BandwidthUsed;
    if !registry.is_interesting(kind) {
        return false;
    }
    let words = Words::new().word(read).word(written);
    registry.queue_event(kind, &Payload::Plain(words)) > 0
}

/// Emits a `STREAM_BW` event for one stream.
pub fn stream_bandwidth(
    registry: &mut ControlRegistry,
    stream_id: u64,
    read: u64,
    written: u64,
) -> bool {
    let kind = EventKind::StreamBandwidthUsed;
    if !registry.is_interesting(kind) || (read == 0 && written == 0) {
        return false;
    }
    let words = Words::new().word(stream_id).word(written).word(read);
    registry.queue_event(kind, &Payload::Plain(words)) > 0
}

/// Emits a `CIRC_BW` event for one origin circuit.
pub fn circ_bandwidth_used(
    registry: &mut ControlRegistry,
    circ_id: u32,
    read: u64,
    written: u64,
) -> bool {
    let kind = EventKind::CircBandwidthUsed;
    if !registry.is_interesting(kind) || (read == 0 && written == 0) {
        return false;
    }
    let words = Words::new()
        .pair("ID", circ_id)
        .pair("READ", read)
        .pair("WRITTEN", written);
    registry.queue_event(kind, &Payload::Plain(words)) > 0
}

/// Emits a `CONN_BW` event for one connection.
pub fn conn_bandwidth(
    registry: &mut ControlRegistry,
    conn_id: u64,
    conn_type: &str,
    read: u64,
    written: u64,
) -> bool {
    let kind = EventKind::ConnBandwidth;
    if !registry.is_interesting(kind) || (read == 0 && written == 0) {
        return false;
    }
    let words = Words::new()
        .pair("ID", conn_id)
        .text_pair("TYPE", conn_type)
        .pair("READ", read)
        .pair("WRITTEN", written);
    registry.queue_event(kind, &Payload::Plain(words)) > 0
}

/// Emits `TB_EMPTY` when a token bucket refills after running dry.
///
/// `conn_id` is `None` for the global buckets. Durations are milliseconds.
pub fn tb_empty(
    registry: &mut ControlRegistry,
    bucket: &str,
    conn_id: Option<u64>,
    read_empty_ms: u64,
    write_empty_ms: u64,
    since_last_refill_ms: u64,
) -> bool {
    let kind = EventKind::TbEmpty;
    if !registry.is_interesting(kind) {
        return false;
    }
    let mut words = Words::new().text(bucket);
    if let Some(id) = conn_id {
        words = words.pair("ID", id);
    }
    let words = words
        .pair("READ", read_empty_ms)
        .pair("WRITTEN", write_empty_ms)
        .pair("LAST", since_last_refill_ms);
    registry.queue_event(kind, &Payload::Plain(words)) > 0
}

/// Emits `NETWORK_LIVENESS`.
pub fn network_liveness_update(registry: &mut ControlRegistry, is_live: bool) -> bool {
    let kind = EventKind::NetworkLiveness;
    if !registry.is_interesting(kind) {
        return false;
    }
    let words = Words::new().word(if is_live { "UP" } else { "DOWN" });
    registry.queue_event(kind, &Payload::Plain(words)) > 0
}

/// Emits `SIGNAL` for a signal the daemon acted on.
pub fn signal(registry: &mut ControlRegistry, name: &str) -> bool {
    let kind = EventKind::GotSignal;
    if !registry.is_interesting(kind) {
        return false;
    }
    registry.queue_event(kind, &Payload::Plain(Words::new().text(name))) > 0
}

/// Emits a `STATUS_GENERAL`, `STATUS_CLIENT` or `STATUS_SERVER` event.
pub fn status_event(
    registry: &mut ControlRegistry,
    family: StatusFamily,
    severity: StatusSeverity,
    action: &str,
    args: &Fields,
) -> bool {
    let kind = family.kind();
    if !registry.is_interesting(kind) {
        return false;
    }
    let words = Words::new().word(severity).word(action).fields(args);
    registry.queue_event(kind, &Payload::Plain(words)) > 0
}

/// Emits the client `BOOTSTRAP` status for a new bootstrap phase.
pub fn bootstrap(registry: &mut ControlRegistry, progress: u8, tag: &str, summary: &str) -> bool {
    let args = Fields::new()
        .num("PROGRESS", progress)
        .text("TAG", tag)
        .quoted("SUMMARY", summary);
    status_event(
        registry,
        StatusFamily::Client,
        StatusSeverity::Notice,
        "BOOTSTRAP",
        &args,
    )
}

/// A bootstrap phase that is stuck.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapProblem {
    /// Percent complete when the problem happened.
    pub progress: u8,
    /// Phase tag.
    pub tag: String,
    /// Human-readable phase summary.
    pub summary: String,
    /// What went wrong.
    pub warning: String,
    /// Machine-readable reason keyword.
    pub reason: String,
    /// How many times this problem has been seen.
    pub count: u32,
    /// Whether the controller should surface the problem to the user.
    pub recommend_warn: bool,
    /// The peer involved, if any.
    pub host: Option<SocketAddr>,
}

/// Emits the client `BOOTSTRAP` warning for a stuck phase.
pub fn bootstrap_problem(registry: &mut ControlRegistry, problem: &BootstrapProblem) -> bool {
    let args = Fields::new()
        .num("PROGRESS", problem.progress)
        .text("TAG", &problem.tag)
        .quoted("SUMMARY", &problem.summary)
        .quoted("WARNING", &problem.warning)
        .text("REASON", &problem.reason)
        .num("COUNT", problem.count)
        .text(
            "RECOMMENDATION",
            if problem.recommend_warn { "warn" } else { "ignore" },
        )
        .opt_text("HOSTADDR", problem.host.map(|h| h.to_string()).as_deref());
    status_event(
        registry,
        StatusFamily::Client,
        StatusSeverity::Warn,
        "BOOTSTRAP",
        &args,
    )
}

/// Emits a `GUARD` event for an entry guard.
///
/// `fingerprint` is the relay identity in hex, without the `$`.
pub fn guard_status(
    registry: &mut ControlRegistry,
    fingerprint: &str,
    nickname: Option<&str>,
    status: GuardStatus,
) -> bool {
    let kind = EventKind::Guard;
    if !registry.is_interesting(kind) {
        return false;
    }
    let name = match nickname {
        Some(nick) => format!("${}~{}", fingerprint, nick),
        None => format!("${}", fingerprint),
    };
    let words = Words::new().word("ENTRY").word(name).word(status);
    registry.queue_event(kind, &Payload::Plain(words)) > 0
}

/// An address mapping that was added or replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressMapping {
    /// Original address.
    pub from: String,
    /// Mapped address, or `<error>`.
    pub to: String,
    /// When the mapping expires; `None` means never.
    pub expires: Option<DateTime<Utc>>,
    /// Resolver error code, if the mapping records a failure.
    pub error: Option<String>,
    /// Whether the mapping lives in the DNS cache.
    pub cached: bool,
}

/// Emits an `ADDRMAP` event.
///
/// Both expiry fields are rendered in UTC.
pub fn address_mapped(registry: &mut ControlRegistry, mapping: &AddressMapping) -> bool {
    let kind = EventKind::AddrMap;
    if !registry.is_interesting(kind) {
        return false;
    }
    let mut words = Words::new().text(&mapping.from).text(&mapping.to);
    words = match &mapping.expires {
        Some(expires) => words.text(&iso_time(expires)),
        None => words.word("NEVER"),
    };
    if let Some(error) = &mapping.error {
        words = words.text_pair("error", error);
    }
    if let Some(expires) = &mapping.expires {
        words = words.quoted_pair("EXPIRES", &iso_time(expires));
    }
    let words = words.quoted_pair("CACHED", if mapping.cached { "YES" } else { "NO" });
    registry.queue_event(kind, &Payload::Plain(words)) > 0
}

/// Emits `CONF_CHANGED` listing the options that were set.
///
/// An option reset to its default has no value. Nothing is sent for an
/// empty list.
pub fn conf_changed(registry: &mut ControlRegistry, changes: &[(&str, Option<&str>)]) -> bool {
    let kind = EventKind::ConfChanged;
    if changes.is_empty() || !registry.is_interesting(kind) {
        return false;
    }
    let lines = changes
        .iter()
        .map(|(key, value)| match value {
            Some(value) => Words::new().text_pair(key, value),
            None => Words::new().word(key),
        })
        .collect();
    registry.queue_event(kind, &Payload::Continued(lines)) > 0
}

/// Circuit build timeout estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuildTimeoutStats {
    /// Build times recorded.
    pub total_times: u32,
    /// Current timeout in milliseconds.
    pub timeout_ms: u64,
    /// Pareto Xm parameter.
    pub xm: u64,
    /// Pareto alpha parameter.
    pub alpha: f64,
    /// Quantile the timeout is cut off at.
    pub cutoff_quantile: f64,
    /// Fraction of recent circuits that timed out.
    pub timeout_rate: f64,
    /// Time after which measurement circuits are closed, in milliseconds.
    pub close_ms: u64,
    /// Fraction of recent circuits closed at `close_ms`.
    pub close_rate: f64,
}

/// Emits `BUILDTIMEOUT_SET`.
pub fn buildtimeout_set(
    registry: &mut ControlRegistry,
    kind_of_change: BuildTimeoutKind,
    stats: &BuildTimeoutStats,
) -> bool {
    let kind = EventKind::BuildTimeoutSet;
    if !registry.is_interesting(kind) {
        return false;
    }
    let words = Words::new()
        .word(kind_of_change)
        .pair("TOTAL_TIMES", stats.total_times)
        .pair("TIMEOUT_MS", stats.timeout_ms)
        .pair("XM", stats.xm)
        .pair("ALPHA", format!("{:.6}", stats.alpha))
        .pair("CUTOFF_QUANTILE", format!("{:.6}", stats.cutoff_quantile))
        .pair("TIMEOUT_RATE", format!("{:.6}", stats.timeout_rate))
        .pair("CLOSE_MS", stats.close_ms)
        .pair("CLOSE_RATE", format!("{:.6}", stats.close_rate));
    registry.queue_event(kind, &Payload::Plain(words)) > 0
}

/// Emits a bridge's `CLIENTS_SEEN` summary.
///
/// `countries` and `ip_versions` are `(label, count)` pairs in the order
/// they should be reported.
pub fn clients_seen(
    registry: &mut ControlRegistry,
    time_started: DateTime<Utc>,
    countries: &[(&str, u32)],
    ip_versions: &[(&str, u32)],
) -> bool {
    let kind = EventKind::ClientsSeen;
    if !registry.is_interesting(kind) {
        return false;
    }
    let words = Words::new()
        .quoted_pair("TimeStarted", &iso_time(&time_started))
        .pair("CountrySummary", summary(countries))
        .pair("IPVersions", summary(ip_versions));
    registry.queue_event(kind, &Payload::Plain(words)) > 0
}

fn summary(pairs: &[(&str, u32)]) -> String {
    pairs
        .iter()
        .map(|(label, count)| format!("{}={}", label, count))
        .collect::<Vec<_>>()
        .join(",")
}

/// Emits `TRANSPORT_LAUNCHED` once a pluggable transport is listening.
pub fn transport_launched(
    registry: &mut ControlRegistry,
    mode: TransportMode,
    transport: &str,
    address: SocketAddr,
) -> bool {
    let kind = EventKind::TransportLaunched;
    if !registry.is_interesting(kind) {
        return false;
    }
    let host = match address.ip() {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    };
    let words = Words::new()
        .word(mode)
        .word(transport)
        .word(host)
        .word(address.port());
    registry.queue_event(kind, &Payload::Plain(words)) > 0
}

/// Emits `NEWDESC` for routers whose descriptors arrived.
///
/// Each router is a `$fingerprint~nickname` token. Nothing is sent for an
/// empty list.
pub fn descriptors_changed(registry: &mut ControlRegistry, routers: &[String]) -> bool {
    let kind = EventKind::NewDesc;
    if routers.is_empty() || !registry.is_interesting(kind) {
        return false;
    }
    let words = routers.iter().fold(Words::new(), |words, r| words.word(r));
    registry.queue_event(kind, &Payload::Plain(words)) > 0
}

/// Emits `DESCCHANGED` when our own descriptor changed.
pub fn my_descriptor_changed(registry: &mut ControlRegistry) -> bool {
    let kind = EventKind::DescChanged;
    if !registry.is_interesting(kind) {
        return false;
    }
    registry.queue_event(kind, &Payload::Plain(Words::new())) > 0
}

/// Emits `NS` with changed router status entries as a dot-escaped body.
pub fn networkstatus_changed(registry: &mut ControlRegistry, entries: &str) -> bool {
    router_status_block(registry, EventKind::NetworkStatus, entries)
}

/// Emits `NEWCONSENSUS` with every router status entry of a new consensus.
pub fn new_consensus(registry: &mut ControlRegistry, entries: &str) -> bool {
    router_status_block(registry, EventKind::NewConsensus, entries)
}

fn router_status_block(registry: &mut ControlRegistry, kind: EventKind, entries: &str) -> bool {
    if entries.is_empty() || !registry.is_interesting(kind) {
        return false;
    }
    let payload = Payload::MultiLine {
        header: Words::new(),
        body: entries.as_bytes().to_vec(),
    };
    registry.queue_event(kind, &payload) > 0
}

/// One `HS_DESC` event.
///
/// A missing address or directory is reported as `UNKNOWN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HsDescEvent {
    /// What happened.
    pub action: HsDescAction,
    /// Onion address or service id, without `.onion`.
    pub address: String,
    /// Client authorization type.
    pub auth_type: HsAuthType,
    /// The directory involved, as `$fingerprint~nickname`.
    pub hs_dir: Option<String>,
    /// Descriptor id in base32.
    pub descriptor_id: Option<String>,
    /// Failure reason.
    pub reason: Option<String>,
    /// Descriptor replica number.
    pub replica: Option<u32>,
}

impl HsDescEvent {
    fn new(action: HsDescAction, address: &str, auth_type: HsAuthType) -> Self {
        Self {
            action,
            address: address.to_string(),
            auth_type,
            hs_dir: None,
            descriptor_id: None,
            reason: None,
            replica: None,
        }
    }
}

/// Emits an `HS_DESC` event.
pub fn hs_descriptor(registry: &mut ControlRegistry, event: &HsDescEvent) -> bool {
    let kind = EventKind::HsDesc;
    if !registry.is_interesting(kind) {
        return false;
    }
    let mut words = Words::new()
        .word(event.action)
        .text(or_unknown(&event.address))
        .word(event.auth_type)
        .text(or_unknown(event.hs_dir.as_deref().unwrap_or("")));
    if let Some(id) = &event.descriptor_id {
        words = words.text(id);
    }
    if let Some(reason) = &event.reason {
        words = words.text_pair("REASON", reason);
    }
    if let Some(replica) = event.replica {
        words = words.pair("REPLICA", replica);
    }
    registry.queue_event(kind, &Payload::Plain(words)) > 0
}

fn or_unknown(value: &str) -> &str {
    if value.is_empty() {
        "UNKNOWN"
    } else {
        value
    }
}

/// A client asked a directory for a descriptor.
pub fn hs_descriptor_requested(
    registry: &mut ControlRegistry,
    onion_address: &str,
    auth_type: HsAuthType,
    hs_dir: &str,
    descriptor_id: &str,
) -> bool {
    let mut event = HsDescEvent::new(HsDescAction::Requested, onion_address, auth_type);
    event.hs_dir = Some(hs_dir.to_string());
    event.descriptor_id = Some(descriptor_id.to_string());
    hs_descriptor(registry, &event)
}

/// A service built a new descriptor replica.
pub fn hs_descriptor_created(
    registry: &mut ControlRegistry,
    service_id: &str,
    descriptor_id: &str,
    replica: u32,
) -> bool {
    let mut event = HsDescEvent::new(HsDescAction::Created, service_id, HsAuthType::Unknown);
    event.descriptor_id = Some(descriptor_id.to_string());
    event.replica = Some(replica);
    hs_descriptor(registry, &event)
}

/// A service started uploading a descriptor to a directory.
pub fn hs_descriptor_upload(
    registry: &mut ControlRegistry,
    service_id: &str,
    descriptor_id: &str,
    hs_dir: &str,
) -> bool {
    let mut event = HsDescEvent::new(HsDescAction::Upload, service_id, HsAuthType::Unknown);
    event.hs_dir = Some(hs_dir.to_string());
    event.descriptor_id = Some(descriptor_id.to_string());
    hs_descriptor(registry, &event)
}

/// A client fetched a descriptor.
pub fn hs_descriptor_received(
    registry: &mut ControlRegistry,
    onion_address: &str,
    auth_type: HsAuthType,
    hs_dir: &str,
) -> bool {
    let mut event = HsDescEvent::new(HsDescAction::Received, onion_address, auth_type);
    event.hs_dir = Some(hs_dir.to_string());
    hs_descriptor(registry, &event)
}

/// A directory accepted an uploaded descriptor.
pub fn hs_descriptor_uploaded(
    registry: &mut ControlRegistry,
    hs_dir: &str,
    onion_address: &str,
) -> bool {
    let mut event = HsDescEvent::new(HsDescAction::Uploaded, onion_address, HsAuthType::Unknown);
    event.hs_dir = Some(hs_dir.to_string());
    hs_descriptor(registry, &event)
}

/// A client failed to fetch a descriptor.
pub fn hs_descriptor_failed(
    registry: &mut ControlRegistry,
    onion_address: &str,
    auth_type: HsAuthType,
    hs_dir: &str,
    reason: &str,
) -> bool {
    let mut event = HsDescEvent::new(HsDescAction::Failed, onion_address, auth_type);
    event.hs_dir = Some(hs_dir.to_string());
    event.reason = Some(reason.to_string());
    hs_descriptor(registry, &event)
}

/// A service failed to upload a descriptor.
pub fn hs_descriptor_upload_failed(
    registry: &mut ControlRegistry,
    hs_dir: &str,
    onion_address: &str,
    reason: &str,
) -> bool {
    let mut event = HsDescEvent::new(HsDescAction::Failed, onion_address, HsAuthType::Unknown);
    event.hs_dir = Some(hs_dir.to_string());
    event.reason = Some(reason.to_string());
    hs_descriptor(registry, &event)
}

/// Emits `HS_DESC_CONTENT` with the descriptor as a dot-escaped body.
///
/// Missing address or directory fingerprints are reported as `UNKNOWN`.
pub fn hs_descriptor_content(
    registry: &mut ControlRegistry,
    onion_address: &str,
    desc_id: &str,
    hsdir_fp: &str,
    content: &str,
) -> bool {
    let kind = EventKind::HsDescContent;
    if !registry.is_interesting(kind) {
        return false;
    }
    let header = Words::new()
        .text(or_unknown(onion_address))
        .text(desc_id)
        .text(or_unknown(hsdir_fp));
    let payload = Payload::MultiLine {
        header,
        body: content.as_bytes().to_vec(),
    };
    registry.queue_event(kind, &payload) > 0
}

/// Emits one `CELL_STATS` event per circuit with recorded queue activity,
/// then clears what was reported.
///
/// Returns the number of circuits reported.
pub fn circuit_cell_stats(registry: &mut ControlRegistry, arena: &mut EntityArena) -> usize {
    let kind = EventKind::CellStats;
    if !registry.is_interesting(kind) {
        return 0;
    }
    let pending: Vec<CircuitHandle> = arena
        .circuits
        .iter()
        .filter(|(_, circ)| !circ.cell_stats_entries.is_empty())
        .map(|(handle, _)| handle)
        .collect();

    let mut reported = 0;
    for handle in pending {
        let Some(circ) = arena.circuits.get(handle) else {
            continue;
        };
        let stats = CellStats::from_entries(&circ.cell_stats_entries);
        let words = format_cell_stats(&arena.cell_stats_identity(circ), &stats);
        registry.queue_event(kind, &Payload::Plain(words));
        if let Some(circ) = arena.circuits.get_mut(handle) {
            circ.cell_stats_entries.clear();
        }
        reported += 1;
    }
    reported
}
