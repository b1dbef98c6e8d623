//! PrivCount traffic-instrumentation events.
//!
//! The emitter turns lifecycle taps (DNS resolution, stream bytes, stream,
//! circuit and connection end, per-cell outcomes, HSDir cache activity,
//! Viterbi summaries) into statistics-only events.
//!
//! Every emission point takes the [`EntityArena`] and a handle, resolves the
//! handle on the spot, reads what it needs, and lets go. A handle whose
//! entity is already gone produces no event.
//!
//! # Encodings
//!
//! | Kind | Encoding |
//! |------|----------|
//! | `PRIVCOUNT_DNS_RESOLVED` | positional: `<ChannelId> <CircuitId> <StreamId> <Host> <Timestamp>` |
//! | `PRIVCOUNT_STREAM_*`, `*_ENDED`, `*_CLOSE`, `CIRCUIT_CELL`, `HSDIR_CACHE_*` | `Key=Value` |
//! | `PRIVCOUNT_VITERBI_*` | tagged multi-line blob |
//!
//! # Exit-Only Filtering
//!
//! The legacy stream and circuit events count exit traffic only. Which
//! streams and circuits qualify is decided by a [`TrafficFilter`]; the
//! default [`ExitTrafficOnly`] leaves directory requests tunnelled over
//! circuits out when `exclude_directory_traffic` is set.

use chrono::{DateTime, Utc};

use crate::cell_stats::cell_command_name;
use crate::config::PrivcountConfig;
use crate::entities::{
    CellCounters, Circuit, CircuitHandle, ConnectionHandle, EntityArena, ExitStream, HsVersion,
    HsdirMark, StreamHandle,
};
use crate::events::EventKind;
use crate::payload::{Fields, Payload, Words};
use crate::registry::ControlRegistry;

/// Version string reported alongside PrivCount events.
pub const PRIVCOUNT_VERSION: &str = "1.1.0";

/// The PrivCount instrumentation version.
pub fn privcount_version() -> &'static str {
    PRIVCOUNT_VERSION
}

/// Renders a time as `<unix seconds>.<microseconds, six digits>`.
///
/// ```rust
/// use chrono::{TimeZone, Utc};
/// use privcount_control::privcount::iso_epoch;
///
/// let t = Utc.timestamp_opt(1_500_000_000, 42_000).unwrap();
/// assert_eq!(iso_epoch(&t), "1500000000.000042");
/// ```
pub fn iso_epoch(time: &DateTime<Utc>) -> String {
    format!("{}.{:06}", time.timestamp(), time.timestamp_subsec_micros())
}

/// Source of event timestamps.
pub trait Clock {
    /// The current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Decides which traffic the exit-only events count.
pub trait TrafficFilter {
    /// Whether a stream's bytes and end-of-life are counted.
    fn count_stream(&self, stream: &ExitStream) -> bool;

    /// Whether a circuit's legacy end-of-life event is counted.
    fn count_circuit(&self, circuit: &Circuit) -> bool;
}

/// Counts relay circuits that carried exit streams, optionally including
/// directory requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitTrafficOnly {
    /// Leave directory-fetch-over-circuit traffic out.
    pub exclude_directory_traffic: bool,
}

impl Default for ExitTrafficOnly {
    fn default() -> Self {
        Self {
            exclude_directory_traffic: true,
        }
    }
}

impl TrafficFilter for ExitTrafficOnly {
    fn count_stream(&self, stream: &ExitStream) -> bool {
        !(self.exclude_directory_traffic && stream.is_dir)
    }

    fn count_circuit(&self, circuit: &Circuit) -> bool {
        if circuit.is_origin() {
            return false;
        }
        circuit.exit_streams_seen > 0
            || (!self.exclude_directory_traffic && circuit.dir_streams_seen > 0)
    }
}

/// The cell a `PRIVCOUNT_CIRCUIT_CELL` event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellInfo {
    /// Cell command code.
    pub command: u8,
    /// Relay command, when the relay header was readable.
    pub relay_command: Option<u8>,
    /// Stream id from the relay header.
    pub stream_id: Option<u16>,
}

/// The outcome of processing one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CellOutcome {
    /// The cell was sent rather than received.
    pub is_sent: bool,
    /// The cell was recognized at this hop, when known.
    pub is_recognized: Option<bool>,
    /// Relay crypto succeeded, when attempted.
    pub was_relay_crypt_successful: Option<bool>,
}

/// What is known about a cached onion-service descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HsDescriptorInfo {
    /// A v2 descriptor.
    V2 {
        /// Base32 descriptor id.
        desc_id: String,
        /// Publication time.
        published: Option<DateTime<Utc>>,
        /// Introduction points listed.
        intro_point_count: Option<usize>,
        /// Size of the descriptor body.
        body_byte_count: usize,
    },
    /// A v3 descriptor.
    V3 {
        /// Base64 blinded public key.
        blinded_key: String,
        /// Descriptor revision counter.
        revision_counter: Option<u64>,
        /// Descriptor lifetime in seconds.
        lifetime_secs: Option<u64>,
    },
}

impl HsDescriptorInfo {
    /// Protocol version of this descriptor.
    pub fn version(&self) -> HsVersion {
        match self {
            HsDescriptorInfo::V2 { .. } => HsVersion::V2,
            HsDescriptorInfo::V3 { .. } => HsVersion::V3,
        }
    }

    fn add_fields(&self, fields: Fields) -> Fields {
        match self {
            HsDescriptorInfo::V2 {
                desc_id,
                published,
                intro_point_count,
                body_byte_count,
            } => fields
                .text("DescriptorIdString", desc_id)
                .opt_text(
                    "DescriptorCreationTime",
                    published.as_ref().map(iso_epoch).as_deref(),
                )
                .opt_num("IntroPointCount", *intro_point_count)
                .num("DescriptorByteCount", body_byte_count),
            HsDescriptorInfo::V3 {
                blinded_key,
                revision_counter,
                lifetime_secs,
            } => fields
                .text("BlindedEd25519PublicKeyString", blinded_key)
                .opt_num("RevisionNumber", *revision_counter)
                .opt_num("DescriptorLifetime", *lifetime_secs),
        }
    }
}

/// An HSDir cache store attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HsdirStore {
    /// Protocol version of the upload.
    pub version: HsVersion,
    /// A cache entry already existed for this descriptor.
    pub has_existing_cache_entry: bool,
    /// The descriptor ended up in the cache.
    pub was_added_to_cache: bool,
    /// Why the cache accepted or refused it.
    pub reason: String,
    /// The descriptor, when it parsed.
    pub descriptor: Option<HsDescriptorInfo>,
    /// Size of the encoded descriptor.
    pub encoded_descriptor_byte_count: Option<u64>,
    /// Size of the encoded introduction points.
    pub encoded_intro_point_byte_count: Option<u64>,
}

/// An HSDir cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HsdirFetch {
    /// Protocol version of the query.
    pub version: HsVersion,
    /// The query found an entry.
    pub has_cache_entry: bool,
    /// Size of the query key.
    pub query_byte_count: u64,
    /// Why the lookup succeeded or failed.
    pub reason: String,
    /// The cached descriptor, when found.
    pub descriptor: Option<HsDescriptorInfo>,
    /// When the entry was last served (v2) or cached (v3).
    pub cached_at: Option<DateTime<Utc>>,
    /// Size of the encoded descriptor.
    pub encoded_descriptor_byte_count: Option<u64>,
    /// Size of the encoded introduction points.
    pub encoded_intro_point_byte_count: Option<u64>,
}

/// Builds and queues PrivCount events.
pub struct PrivcountEmitter {
    enabled: bool,
    filter: Box<dyn TrafficFilter>,
    clock: Box<dyn Clock>,
}

impl std::fmt::Debug for PrivcountEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivcountEmitter")
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl PrivcountEmitter {
    /// An emitter using the configured exit filter and the system clock.
    pub fn new(config: &PrivcountConfig) -> Self {
        Self::with_parts(
            config.enabled,
            Box::new(ExitTrafficOnly {
                exclude_directory_traffic: config.exclude_directory_traffic,
            }),
            Box::new(SystemClock),
        )
    }

    /// An emitter with an explicit filter and clock.
    pub fn with_parts(
        enabled: bool,
        filter: Box<dyn TrafficFilter>,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            enabled,
            filter,
            clock,
        }
    }

    fn wants(&self, registry: &ControlRegistry, kind: EventKind) -> bool {
        self.enabled && registry.is_interesting(kind)
    }

    fn timestamp(&self) -> String {
        iso_epoch(&self.clock.now())
    }

    fn base_fields(&self) -> Fields {
        Fields::new().text("EventTimestamp", &self.timestamp())
    }

    fn emit(&self, registry: &mut ControlRegistry, kind: EventKind, payload: Payload) -> bool {
        registry.queue_event(kind, &payload) > 0
    }

    /// An exit stream's host name was resolved.
    pub fn dns_resolved(
        &self,
        registry: &mut ControlRegistry,
        arena: &EntityArena,
        stream: StreamHandle,
    ) -> bool {
        let kind = EventKind::PrivcountDnsResolved;
        if !self.wants(registry, kind) {
            return false;
        }
        let Some((stream, circ)) = resolve_stream(arena, stream) else {
            return false;
        };
        if !self.filter.count_stream(stream) {
            return false;
        }
        let channel = arena.connection_id(circ.prev_conn()).unwrap_or(0);
        let words = Words::new()
            .word(channel)
            .word(circ.global_id)
            .word(stream.stream_id)
            .text(&stream.remote_host)
            .word(self.timestamp());
        self.emit(registry, kind, Payload::Positional(words))
    }

    /// Bytes moved on an exit stream.
    pub fn stream_bytes_transferred(
        &self,
        registry: &mut ControlRegistry,
        arena: &EntityArena,
        stream: StreamHandle,
        amount: u64,
        is_outbound: bool,
    ) -> bool {
        let kind = EventKind::PrivcountStreamBytesTransferred;
        if !self.wants(registry, kind) {
            return false;
        }
        let Some((stream, circ)) = resolve_stream(arena, stream) else {
            return false;
        };
        if !self.filter.count_stream(stream) {
            return false;
        }
        let fields = self
            .base_fields()
            .opt_num("ChannelId", arena.connection_id(circ.prev_conn()))
            .num("CircuitId", circ.global_id)
            .num("StreamId", stream.stream_id)
            .flag("IsOutboundFlag", is_outbound)
            .num("ByteCount", amount);
        self.emit(registry, kind, Payload::PositionIndependent(fields))
    }

    /// An exit stream closed.
    pub fn stream_ended(
        &self,
        registry: &mut ControlRegistry,
        arena: &EntityArena,
        stream: StreamHandle,
    ) -> bool {
        let kind = EventKind::PrivcountStreamEnded;
        if !self.wants(registry, kind) {
            return false;
        }
        let Some((stream, circ)) = resolve_stream(arena, stream) else {
            return false;
        };
        if !self.filter.count_stream(stream) {
            return false;
        }
        let resolved = stream.resolved_address.map(|a| a.to_string());
        let fields = self
            .base_fields()
            .opt_num("ChannelId", arena.connection_id(circ.prev_conn()))
            .num("CircuitId", circ.global_id)
            .num("StreamId", stream.stream_id)
            .num("RemotePort", stream.remote_port)
            .text("RemoteHost", &stream.remote_host)
            .opt_text("ResolvedAddress", resolved.as_deref())
            .num("InboundByteCount", stream.bytes.inbound_bytes)
            .num("OutboundByteCount", stream.bytes.outbound_bytes)
            .text("CreatedTimestamp", &iso_epoch(&stream.created_at));
        self.emit(registry, kind, Payload::PositionIndependent(fields))
    }

    /// A circuit is being torn down.
    ///
    /// The legacy counting point emits `PRIVCOUNT_CIRCUIT_ENDED` for exit
    /// circuits only; the newer one emits `PRIVCOUNT_CIRCUIT_CLOSE` for every
    /// circuit.
    pub fn circuit_end(
        &self,
        registry: &mut ControlRegistry,
        arena: &EntityArena,
        circuit: CircuitHandle,
        is_legacy: bool,
    ) -> bool {
        let Some(circ) = arena.circuits.get(circuit) else {
            return false;
        };
        if is_legacy {
            let kind = EventKind::PrivcountCircuitEnded;
            if !self.wants(registry, kind) || !self.filter.count_circuit(circ) {
                return false;
            }
            let fields = self.circuit_fields(arena, circ, &circ.legacy_cells);
            return self.emit(registry, kind, Payload::PositionIndependent(fields));
        }

        let kind = EventKind::PrivcountCircuitClose;
        if !self.wants(registry, kind) {
            return false;
        }
        let fields = self
            .circuit_fields(arena, circ, &circ.all_cells)
            .flag("IsOriginFlag", circ.is_origin())
            .flag("IsLegacyHandshakeFlag", circ.used_legacy_handshake)
            .opt_num("HiddenServiceVersionNumber", circ.hsdir.map(|m| m.version.number()))
            .opt_flag("IsHSDirStoreFlag", circ.hsdir.map(|m| m.is_store))
            .opt_num(
                "IntroClientSinkCircuitId",
                circ.intro_client_sink
                    .and_then(|(sink, _)| arena.circuits.get(sink))
                    .map(|sink| sink.global_id),
            );
        self.emit(registry, kind, Payload::PositionIndependent(fields))
    }

    fn circuit_fields(&self, arena: &EntityArena, circ: &Circuit, cells: &CellCounters) -> Fields {
        self.base_fields()
            .num("CircuitId", circ.global_id)
            .opt_num("PreviousChannelId", arena.connection_id(circ.prev_conn()))
            .opt_num("NextChannelId", arena.connection_id(circ.next_conn()))
            .num("PreviousChannelInboundCellCount", cells.received_from_previous)
            .num("PreviousChannelOutboundCellCount", cells.sent_to_previous)
            .num("NextChannelInboundCellCount", cells.received_from_next)
            .num("NextChannelOutboundCellCount", cells.sent_to_next)
            .text("CreatedTimestamp", &iso_epoch(&circ.created_at))
    }

    /// An OR connection closed: emits both the legacy
    /// `PRIVCOUNT_CONNECTION_ENDED` and the newer `PRIVCOUNT_CONNECTION_CLOSE`.
    ///
    /// Returns how many events were queued.
    pub fn connection_end(
        &self,
        registry: &mut ControlRegistry,
        arena: &EntityArena,
        conn: ConnectionHandle,
    ) -> usize {
        let Some(connection) = arena.connections.get(conn) else {
            return 0;
        };
        let mut emitted = 0;
        for (kind, bytes) in [
            (EventKind::PrivcountConnectionEnded, &connection.legacy_bytes),
            (EventKind::PrivcountConnectionClose, &connection.all_bytes),
        ] {
            if !self.wants(registry, kind) {
                continue;
            }
            let fields = self
                .base_fields()
                .num("ChannelId", connection.global_id)
                .text("RemoteIPAddress", &connection.remote_address.to_string())
                .num("RemotePort", connection.remote_port)
                .flag("IsClientFlag", connection.is_client)
                .num("InboundByteCount", bytes.inbound_bytes)
                .num("OutboundByteCount", bytes.outbound_bytes)
                .text("CreatedTimestamp", &iso_epoch(&connection.created_at));
            if self.emit(registry, kind, Payload::PositionIndependent(fields)) {
                emitted += 1;
            }
        }
        emitted
    }

    /// One cell was sent or received on a circuit.
    pub fn circuit_cell(
        &self,
        registry: &mut ControlRegistry,
        arena: &EntityArena,
        circuit: CircuitHandle,
        channel: Option<ConnectionHandle>,
        cell: CellInfo,
        outcome: CellOutcome,
    ) -> bool {
        let kind = EventKind::PrivcountCircuitCell;
        if !self.wants(registry, kind) {
            return false;
        }
        let Some(circ) = arena.circuits.get(circuit) else {
            return false;
        };
        let command = cell_command_name(cell.command)
            .map(str::to_string)
            .unwrap_or_else(|| cell.command.to_string());
        let fields = self
            .base_fields()
            .opt_num("ChannelId", arena.connection_id(channel))
            .num("CircuitId", circ.global_id)
            .flag("IsOriginFlag", circ.is_origin())
            .flag("IsSentFlag", outcome.is_sent)
            .flag(
                "IsPreviousChannelFlag",
                channel.is_some() && channel == circ.prev_conn(),
            )
            .text("CellCommandString", &command)
            .opt_num("RelayCommand", cell.relay_command)
            .opt_num("StreamId", cell.stream_id)
            .opt_flag("IsRecognizedFlag", outcome.is_recognized)
            .opt_flag("WasRelayCryptSuccessfulFlag", outcome.was_relay_crypt_successful);
        self.emit(registry, kind, Payload::PositionIndependent(fields))
    }

    /// A descriptor upload reached the HSDir cache.
    pub fn hsdir_cache_store(&self, registry: &mut ControlRegistry, store: &HsdirStore) -> bool {
        let kind = EventKind::PrivcountHsdirCacheStore;
        if !self.wants(registry, kind) {
            return false;
        }
        let mut fields = self
            .base_fields()
            .num("HiddenServiceVersionNumber", store.version.number())
            .flag("HasExistingCacheEntryFlag", store.has_existing_cache_entry)
            .flag("WasAddedToCacheFlag", store.was_added_to_cache)
            .text("CacheReasonString", &store.reason);
        if let Some(descriptor) = &store.descriptor {
            fields = descriptor.add_fields(fields);
        }
        let fields = fields
            .opt_num("EncodedDescriptorByteCount", store.encoded_descriptor_byte_count)
            .opt_num("EncodedIntroPointByteCount", store.encoded_intro_point_byte_count);
        self.emit(registry, kind, Payload::PositionIndependent(fields))
    }

    /// A descriptor was looked up in the HSDir cache.
    pub fn hsdir_cache_fetch(&self, registry: &mut ControlRegistry, fetch: &HsdirFetch) -> bool {
        let kind = EventKind::PrivcountHsdirCacheFetch;
        if !self.wants(registry, kind) {
            return false;
        }
        let mut fields = self
            .base_fields()
            .num("HiddenServiceVersionNumber", fetch.version.number())
            .flag("HasCacheEntryFlag", fetch.has_cache_entry)
            .num("RequestByteCount", fetch.query_byte_count)
            .text("CacheReasonString", &fetch.reason);
        if let Some(descriptor) = &fetch.descriptor {
            fields = descriptor.add_fields(fields);
        }
        let fields = fields
            .opt_text(
                "CacheEntryTimestamp",
                fetch.cached_at.as_ref().map(iso_epoch).as_deref(),
            )
            .opt_num("EncodedDescriptorByteCount", fetch.encoded_descriptor_byte_count)
            .opt_num("EncodedIntroPointByteCount", fetch.encoded_intro_point_byte_count);
        self.emit(registry, kind, Payload::PositionIndependent(fields))
    }

    /// A Viterbi decoder packet summary.
    pub fn viterbi_packets(&self, registry: &mut ControlRegistry, result: &[u8]) -> bool {
        self.viterbi(registry, EventKind::PrivcountViterbiPackets, result)
    }

    /// A Viterbi decoder stream summary.
    pub fn viterbi_streams(&self, registry: &mut ControlRegistry, result: &[u8]) -> bool {
        self.viterbi(registry, EventKind::PrivcountViterbiStreams, result)
    }

    fn viterbi(&self, registry: &mut ControlRegistry, kind: EventKind, result: &[u8]) -> bool {
        if !self.wants(registry, kind) {
            return false;
        }
        self.emit(registry, kind, Payload::Tagged(result.to_vec()))
    }
}

fn resolve_stream(arena: &EntityArena, stream: StreamHandle) -> Option<(&ExitStream, &Circuit)> {
    let stream = arena.streams.get(stream)?;
    let circ = arena.circuits.get(stream.circuit)?;
    Some((stream, circ))
}

/// Counts bytes on an OR connection at one of the two counting points.
pub fn byte_transfer(
    arena: &mut EntityArena,
    conn: ConnectionHandle,
    byte_count: u64,
    is_outbound: bool,
    is_legacy: bool,
) {
    let Some(connection) = arena.connections.get_mut(conn) else {
        return;
    };
    let counters = if is_legacy {
        &mut connection.legacy_bytes
    } else {
        &mut connection.all_bytes
    };
    if is_outbound {
        counters.outbound_bytes = counters.outbound_bytes.saturating_add(byte_count);
    } else {
        counters.inbound_bytes = counters.inbound_bytes.saturating_add(byte_count);
    }
}

/// Counts one cell on a circuit, attributed to the side `channel` is on.
pub fn cell_transfer(
    arena: &mut EntityArena,
    circuit: CircuitHandle,
    channel: Option<ConnectionHandle>,
    is_sent: bool,
    is_legacy: bool,
) {
    let Some(circ) = arena.circuits.get_mut(circuit) else {
        return;
    };
    let on_previous = channel.is_some() && channel == circ.prev_conn();
    let counters = if is_legacy {
        &mut circ.legacy_cells
    } else {
        &mut circ.all_cells
    };
    let slot = match (on_previous, is_sent) {
        (true, false) => &mut counters.received_from_previous,
        (true, true) => &mut counters.sent_to_previous,
        (false, false) => &mut counters.received_from_next,
        (false, true) => &mut counters.sent_to_next,
    };
    *slot = slot.saturating_add(1);
}

/// Marks a circuit as having carried an HSDir request.
pub fn mark_circuit_hsdir(
    arena: &mut EntityArena,
    circuit: CircuitHandle,
    version: HsVersion,
    is_store: bool,
) {
    if let Some(circ) = arena.circuits.get_mut(circuit) {
        circ.hsdir = Some(HsdirMark { version, is_store });
    }
}

/// Whether a circuit was created with a legacy handshake.
pub fn circuit_used_legacy_handshake(arena: &EntityArena, circuit: CircuitHandle) -> bool {
    arena
        .circuits
        .get(circuit)
        .map(|c| c.used_legacy_handshake)
        .unwrap_or(false)
}

/// Links a client intro circuit to the service intro circuit it feeds.
pub fn set_intro_client_sink(
    arena: &mut EntityArena,
    client: CircuitHandle,
    service: CircuitHandle,
    version: HsVersion,
) -> bool {
    if arena.circuits.get(service).is_none() {
        return false;
    }
    match arena.circuits.get_mut(client) {
        Some(circ) => {
            circ.intro_client_sink = Some((service, version));
            true
        }
        None => false,
    }
}

/// Unlinks a client intro circuit.
pub fn clear_intro_client_sink(arena: &mut EntityArena, client: CircuitHandle) {
    if let Some(circ) = arena.circuits.get_mut(client) {
        circ.intro_client_sink = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::session::MemorySink;
    use chrono::TimeZone;
    use std::net::{IpAddr, Ipv4Addr};

    struct FixedClock;

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            Utc.timestamp_opt(1_000, 5).unwrap()
        }
    }

    const TS: &str = "1000.000000";

    fn emitter(exclude_dir: bool) -> PrivcountEmitter {
        PrivcountEmitter::with_parts(
            true,
            Box::new(ExitTrafficOnly {
                exclude_directory_traffic: exclude_dir,
            }),
            Box::new(FixedClock),
        )
    }

    fn registry_for(tokens: &[&str]) -> (ControlRegistry, MemorySink) {
        let mut registry = ControlRegistry::new(RegistryConfig::default());
        let sink = MemorySink::new();
        let id = registry.open_session_authenticated(Box::new(sink.clone()));
        registry.set_events(id, tokens).unwrap();
        (registry, sink)
    }

    fn drain(registry: &mut ControlRegistry, sink: &MemorySink) -> Vec<String> {
        registry.flush_all(true);
        sink.take()
            .iter()
            .map(|l| l.as_str().unwrap().to_string())
            .collect()
    }

    struct Exit {
        arena: EntityArena,
        circ: CircuitHandle,
        prev: ConnectionHandle,
        stream: StreamHandle,
        dir_stream: StreamHandle,
    }

    fn exit_setup() -> Exit {
        let mut arena = EntityArena::new();
        let prev = arena.add_connection(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 9001, true);
        let circ = arena.add_relay_circuit(77, prev);
        let stream = arena
            .add_exit_stream(circ, 3, "example.com", 443, false)
            .unwrap();
        let dir_stream = arena.add_exit_stream(circ, 4, "", 0, true).unwrap();
        Exit {
            arena,
            circ,
            prev,
            stream,
            dir_stream,
        }
    }

    #[test]
    fn test_iso_epoch_pads_micros() {
        let t = Utc.timestamp_opt(12, 3_000_000).unwrap();
        assert_eq!(iso_epoch(&t), "12.003000");
        assert_eq!(privcount_version(), PRIVCOUNT_VERSION);
    }

    #[test]
    fn test_dns_resolved_is_positional() {
        let exit = exit_setup();
        let (mut registry, sink) = registry_for(&["PRIVCOUNT_DNS_RESOLVED"]);
        assert!(emitter(true).dns_resolved(&mut registry, &exit.arena, exit.stream));
        assert_eq!(
            drain(&mut registry, &sink),
            vec![format!("650 PRIVCOUNT_DNS_RESOLVED 1 1 3 example.com {}\r\n", TS)]
        );
    }

    #[test]
    fn test_nothing_formatted_without_subscribers() {
        let exit = exit_setup();
        let (mut registry, sink) = registry_for(&["CIRC"]);
        let emitter = emitter(true);
        assert!(!emitter.dns_resolved(&mut registry, &exit.arena, exit.stream));
        assert!(!emitter.viterbi_packets(&mut registry, b"x"));
        assert!(drain(&mut registry, &sink).is_empty());
    }

    #[test]
    fn test_disabled_emitter_is_silent() {
        let exit = exit_setup();
        let (mut registry, sink) = registry_for(&["PRIVCOUNT_STREAM_ENDED"]);
        let config = PrivcountConfig {
            enabled: false,
            ..PrivcountConfig::default()
        };
        let emitter = PrivcountEmitter::new(&config);
        assert!(!emitter.stream_ended(&mut registry, &exit.arena, exit.stream));
        assert!(drain(&mut registry, &sink).is_empty());
    }

    #[test]
    fn test_directory_streams_filtered() {
        let exit = exit_setup();
        let (mut registry, sink) = registry_for(&["PRIVCOUNT_STREAM_ENDED"]);

        assert!(!emitter(true).stream_ended(&mut registry, &exit.arena, exit.dir_stream));
        assert!(emitter(false).stream_ended(&mut registry, &exit.arena, exit.dir_stream));
        assert_eq!(drain(&mut registry, &sink).len(), 1);
    }

    #[test]
    fn test_stream_ended_fields() {
        let mut exit = exit_setup();
        exit.arena.record_stream_bytes(exit.stream, 500, true);
        let (mut registry, sink) = registry_for(&["PRIVCOUNT_STREAM_ENDED"]);
        emitter(true).stream_ended(&mut registry, &exit.arena, exit.stream);

        let lines = drain(&mut registry, &sink);
        let line = &lines[0];
        assert!(line.starts_with("650 PRIVCOUNT_STREAM_ENDED EventTimestamp=1000.000000 "));
        assert!(line.contains(" ChannelId=1 "));
        assert!(line.contains(" StreamId=3 "));
        assert!(line.contains(" RemoteHost=example.com "));
        assert!(line.contains(" OutboundByteCount=500 "));
        assert!(!line.contains("ResolvedAddress"));
    }

    #[test]
    fn test_stream_bytes_transferred() {
        let exit = exit_setup();
        let (mut registry, sink) = registry_for(&["PRIVCOUNT_STREAM_BYTES_TRANSFERRED"]);
        emitter(true).stream_bytes_transferred(&mut registry, &exit.arena, exit.stream, 42, false);
        assert_eq!(
            drain(&mut registry, &sink),
            vec![format!(
                "650 PRIVCOUNT_STREAM_BYTES_TRANSFERRED EventTimestamp={} ChannelId=1 CircuitId=1 StreamId=3 IsOutboundFlag=0 ByteCount=42\r\n",
                TS
            )]
        );
    }

    #[test]
    fn test_stale_handles_emit_nothing() {
        let mut exit = exit_setup();
        exit.arena.remove_circuit(exit.circ);
        let (mut registry, sink) = registry_for(&[
            "PRIVCOUNT_STREAM_ENDED",
            "PRIVCOUNT_CIRCUIT_CLOSE",
            "PRIVCOUNT_CIRCUIT_CELL",
        ]);
        let emitter = emitter(true);
        assert!(!emitter.stream_ended(&mut registry, &exit.arena, exit.stream));
        assert!(!emitter.circuit_end(&mut registry, &exit.arena, exit.circ, false));
        assert!(!emitter.circuit_cell(
            &mut registry,
            &exit.arena,
            exit.circ,
            None,
            CellInfo {
                command: 3,
                relay_command: None,
                stream_id: None
            },
            CellOutcome::default(),
        ));
        assert!(drain(&mut registry, &sink).is_empty());
    }

    #[test]
    fn test_circuit_end_legacy_vs_close() {
        let mut exit = exit_setup();
        cell_transfer(&mut exit.arena, exit.circ, Some(exit.prev), false, true);
        cell_transfer(&mut exit.arena, exit.circ, Some(exit.prev), true, false);
        cell_transfer(&mut exit.arena, exit.circ, None, true, false);
        mark_circuit_hsdir(&mut exit.arena, exit.circ, HsVersion::V3, false);

        let (mut registry, sink) =
            registry_for(&["PRIVCOUNT_CIRCUIT_ENDED", "PRIVCOUNT_CIRCUIT_CLOSE"]);
        let emitter = emitter(true);
        assert!(emitter.circuit_end(&mut registry, &exit.arena, exit.circ, true));
        assert!(emitter.circuit_end(&mut registry, &exit.arena, exit.circ, false));

        let lines = drain(&mut registry, &sink);
        assert!(lines[0].starts_with("650 PRIVCOUNT_CIRCUIT_ENDED "));
        assert!(lines[0].contains(" PreviousChannelInboundCellCount=1 "));
        assert!(lines[0].contains(" PreviousChannelOutboundCellCount=0 "));
        assert!(!lines[0].contains("IsOriginFlag"));

        assert!(lines[1].starts_with("650 PRIVCOUNT_CIRCUIT_CLOSE "));
        assert!(lines[1].contains(" PreviousChannelOutboundCellCount=1 "));
        assert!(lines[1].contains(" NextChannelOutboundCellCount=1 "));
        assert!(lines[1].contains(" HiddenServiceVersionNumber=3 "));
        assert!(lines[1].contains(" IsHSDirStoreFlag=0"));
    }

    #[test]
    fn test_legacy_circuit_end_skips_non_exit_circuits() {
        let mut arena = EntityArena::new();
        let origin = arena.add_origin_circuit();
        let prev = arena.add_connection(IpAddr::V4(Ipv4Addr::LOCALHOST), 1, true);
        let dir_only = arena.add_relay_circuit(1, prev);
        arena.add_exit_stream(dir_only, 1, "", 0, true);

        let (mut registry, _) = registry_for(&["PRIVCOUNT_CIRCUIT_ENDED"]);
        assert!(!emitter(true).circuit_end(&mut registry, &arena, origin, true));
        assert!(!emitter(true).circuit_end(&mut registry, &arena, dir_only, true));
        assert!(emitter(false).circuit_end(&mut registry, &arena, dir_only, true));
    }

    #[test]
    fn test_connection_end_emits_both() {
        let mut exit = exit_setup();
        byte_transfer(&mut exit.arena, exit.prev, 10, true, true);
        byte_transfer(&mut exit.arena, exit.prev, 30, true, false);
        byte_transfer(&mut exit.arena, exit.prev, 7, false, false);

        let (mut registry, sink) =
            registry_for(&["PRIVCOUNT_CONNECTION_ENDED", "PRIVCOUNT_CONNECTION_CLOSE"]);
        assert_eq!(emitter(true).connection_end(&mut registry, &exit.arena, exit.prev), 2);

        let lines = drain(&mut registry, &sink);
        assert!(lines[0].starts_with("650 PRIVCOUNT_CONNECTION_ENDED "));
        assert!(lines[0].contains(" OutboundByteCount=10 "));
        assert!(lines[1].starts_with("650 PRIVCOUNT_CONNECTION_CLOSE "));
        assert!(lines[1].contains(" InboundByteCount=7 OutboundByteCount=30 "));
        assert!(lines[1].contains(" RemoteIPAddress=10.0.0.1 "));
    }

    #[test]
    fn test_circuit_cell_optional_flags() {
        let exit = exit_setup();
        let (mut registry, sink) = registry_for(&["PRIVCOUNT_CIRCUIT_CELL"]);
        emitter(true).circuit_cell(
            &mut registry,
            &exit.arena,
            exit.circ,
            Some(exit.prev),
            CellInfo {
                command: 3,
                relay_command: Some(2),
                stream_id: None,
            },
            CellOutcome {
                is_sent: false,
                is_recognized: Some(true),
                was_relay_crypt_successful: None,
            },
        );
        let lines = drain(&mut registry, &sink);
        assert_eq!(
            lines[0],
            format!(
                "650 PRIVCOUNT_CIRCUIT_CELL EventTimestamp={} ChannelId=1 CircuitId=1 IsOriginFlag=0 IsSentFlag=0 IsPreviousChannelFlag=1 CellCommandString=relay RelayCommand=2 IsRecognizedFlag=1\r\n",
                TS
            )
        );
    }

    #[test]
    fn test_hsdir_store_v2_and_v3_shapes() {
        let (mut registry, sink) = registry_for(&["PRIVCOUNT_HSDIR_CACHE_STORE"]);
        let emitter = emitter(true);
        emitter.hsdir_cache_store(
            &mut registry,
            &HsdirStore {
                version: HsVersion::V2,
                has_existing_cache_entry: false,
                was_added_to_cache: true,
                reason: "new".to_string(),
                descriptor: Some(HsDescriptorInfo::V2 {
                    desc_id: "abcdef".to_string(),
                    published: None,
                    intro_point_count: Some(3),
                    body_byte_count: 900,
                }),
                encoded_descriptor_byte_count: Some(1200),
                encoded_intro_point_byte_count: None,
            },
        );
        emitter.hsdir_cache_store(
            &mut registry,
            &HsdirStore {
                version: HsVersion::V3,
                has_existing_cache_entry: true,
                was_added_to_cache: false,
                reason: "obsolete revision".to_string(),
                descriptor: None,
                encoded_descriptor_byte_count: None,
                encoded_intro_point_byte_count: None,
            },
        );
        let lines = drain(&mut registry, &sink);
        assert!(lines[0].contains(" HiddenServiceVersionNumber=2 HasExistingCacheEntryFlag=0 WasAddedToCacheFlag=1 CacheReasonString=new DescriptorIdString=abcdef IntroPointCount=3 DescriptorByteCount=900 EncodedDescriptorByteCount=1200\r\n"));
        assert!(lines[1].ends_with(" HiddenServiceVersionNumber=3 HasExistingCacheEntryFlag=1 WasAddedToCacheFlag=0 CacheReasonString=\"obsolete revision\"\r\n"));
    }

    #[test]
    fn test_hsdir_fetch_v3() {
        let (mut registry, sink) = registry_for(&["PRIVCOUNT_HSDIR_CACHE_FETCH"]);
        emitter(true).hsdir_cache_fetch(
            &mut registry,
            &HsdirFetch {
                version: HsVersion::V3,
                has_cache_entry: true,
                query_byte_count: 32,
                reason: "found".to_string(),
                descriptor: Some(HsDescriptorInfo::V3 {
                    blinded_key: "AAAA".to_string(),
                    revision_counter: Some(9),
                    lifetime_secs: None,
                }),
                cached_at: Some(Utc.timestamp_opt(50, 0).unwrap()),
                encoded_descriptor_byte_count: None,
                encoded_intro_point_byte_count: None,
            },
        );
        let lines = drain(&mut registry, &sink);
        assert!(lines[0].contains(" BlindedEd25519PublicKeyString=AAAA RevisionNumber=9 CacheEntryTimestamp=50.000000\r\n"));
    }

    #[test]
    fn test_viterbi_is_tagged_blob() {
        let (mut registry, sink) = registry_for(&["PRIVCOUNT_VITERBI_STREAMS"]);
        assert!(emitter(true).viterbi_streams(&mut registry, b"{\"s\":1}\n."));
        assert_eq!(
            drain(&mut registry, &sink),
            vec!["650+PRIVCOUNT_VITERBI_STREAMS\r\n{\"s\":1}\r\n..\r\n.\r\n650 OK\r\n".to_string()]
        );
    }

    #[test]
    fn test_emit_reports_whether_a_line_was_queued() {
        let (mut registry, sink) = registry_for(&["PRIVCOUNT_VITERBI_PACKETS"]);
        let emitter = emitter(true);

        let unwanted = Payload::Tagged(b"x".to_vec());
        assert!(!emitter.emit(&mut registry, EventKind::PrivcountViterbiStreams, unwanted));
        assert!(drain(&mut registry, &sink).is_empty());

        let wanted = Payload::Tagged(b"y".to_vec());
        assert!(emitter.emit(&mut registry, EventKind::PrivcountViterbiPackets, wanted));
        assert_eq!(drain(&mut registry, &sink).len(), 1);
    }

    #[test]
    fn test_intro_client_sink() {
        let mut arena = EntityArena::new();
        let client = arena.add_origin_circuit();
        let service = arena.add_origin_circuit();
        assert!(set_intro_client_sink(&mut arena, client, service, HsVersion::V2));
        assert_eq!(
            arena.circuits.get(client).unwrap().intro_client_sink,
            Some((service, HsVersion::V2))
        );
        clear_intro_client_sink(&mut arena, client);
        assert_eq!(arena.circuits.get(client).unwrap().intro_client_sink, None);
        assert!(!circuit_used_legacy_handshake(&arena, client));
    }
}
