//! Arena-owned circuits, OR connections, and exit streams.
//!
//! Instrumentation code never holds references to daemon entities. It holds
//! [`Handle`]s, small `(index, generation)` pairs that are resolved against an
//! [`EntityArena`] at the moment they are used. A handle to an entity that has
//! since been removed simply fails to resolve, even if its slot was reused.
//!
//! ```text
//!   EntityArena
//!   ├── circuits:    Arena<Circuit>       ◄── CircuitHandle
//!   ├── connections: Arena<OrConnection>  ◄── ConnectionHandle
//!   └── streams:     Arena<ExitStream>    ◄── StreamHandle
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::net::IpAddr;

use chrono::{DateTime, Utc};

use crate::cell_stats::{CellStatsEntry, CellStatsIdentity};

/// A stable reference into an [`Arena`].
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index, for diagnostics.
    pub fn index(self) -> u32 {
        self.index
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

/// Handle to a [`Circuit`].
pub type CircuitHandle = Handle<Circuit>;
/// Handle to an [`OrConnection`].
pub type ConnectionHandle = Handle<OrConnection>;
/// Handle to an [`ExitStream`].
pub type StreamHandle = Handle<ExitStream>;

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Generational slot storage.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> Arena<T> {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` and returns its handle.
    pub fn insert(&mut self, value: T) -> Handle<T> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.value = Some(value);
            return Handle::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Handle::new(index, 0)
    }

    /// Resolves a handle.
    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    /// Resolves a handle mutably.
    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    /// Removes and returns the entity; later lookups with `handle` fail.
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        self.free.push(handle.index);
        Some(value)
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }

    /// Whether the arena holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over live entities and their handles.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.value
                .as_ref()
                .map(|v| (Handle::new(i as u32, slot.generation), v))
        })
    }
}

/// Cell counters on one side of a circuit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CellCounters {
    /// Cells received on the previous-hop channel.
    pub received_from_previous: u64,
    /// Cells sent on the previous-hop channel.
    pub sent_to_previous: u64,
    /// Cells received on the next-hop channel.
    pub received_from_next: u64,
    /// Cells sent on the next-hop channel.
    pub sent_to_next: u64,
}

/// Byte and cell counters on a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteCounters {
    /// Bytes read.
    pub inbound_bytes: u64,
    /// Bytes written.
    pub outbound_bytes: u64,
}

/// Hidden-service protocol version of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HsVersion {
    /// Legacy onion services.
    V2,
    /// Next-generation onion services.
    V3,
}

impl HsVersion {
    /// Numeric version.
    pub fn number(self) -> u8 {
        match self {
            HsVersion::V2 => 2,
            HsVersion::V3 => 3,
        }
    }

    /// Maps a numeric version.
    pub fn from_number(version: u8) -> Option<HsVersion> {
        match version {
            2 => Some(HsVersion::V2),
            3 => Some(HsVersion::V3),
            _ => None,
        }
    }
}

/// Directory use observed on a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HsdirMark {
    /// Descriptor version.
    pub version: HsVersion,
    /// Upload rather than fetch.
    pub is_store: bool,
}

/// Where a circuit starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitOrigin {
    /// Built by this daemon.
    Origin,
    /// Extended through this daemon from a previous hop.
    Relay {
        /// Circuit id on the previous-hop channel.
        prev_circ_id: u32,
        /// The previous-hop channel, while it exists.
        prev_conn: Option<ConnectionHandle>,
    },
}

/// A circuit as seen by instrumentation.
#[derive(Debug, Clone)]
pub struct Circuit {
    /// Process-unique identifier.
    pub global_id: u32,
    /// Origin or relay, with the previous hop for relays.
    pub origin: CircuitOrigin,
    /// Circuit id and channel towards the next hop.
    pub next: Option<(u32, ConnectionHandle)>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Counts from the legacy counting points.
    pub legacy_cells: CellCounters,
    /// Counts from every counting point.
    pub all_cells: CellCounters,
    /// Queue operations awaiting the next `CELL_STATS` emission.
    pub cell_stats_entries: Vec<CellStatsEntry>,
    /// Set when the circuit carried a directory request.
    pub hsdir: Option<HsdirMark>,
    /// The circuit was created with a legacy (TAP/CREATE_FAST) handshake.
    pub used_legacy_handshake: bool,
    /// Service-side intro circuit this client intro circuit feeds, and the
    /// protocol version in use.
    pub intro_client_sink: Option<(CircuitHandle, HsVersion)>,
    /// Exit streams ever attached, excluding directory streams.
    pub exit_streams_seen: u64,
    /// Directory streams ever attached.
    pub dir_streams_seen: u64,
}

impl Circuit {
    fn new(global_id: u32, origin: CircuitOrigin) -> Self {
        Self {
            global_id,
            origin,
            next: None,
            created_at: Utc::now(),
            legacy_cells: CellCounters::default(),
            all_cells: CellCounters::default(),
            cell_stats_entries: Vec::new(),
            hsdir: None,
            used_legacy_handshake: false,
            intro_client_sink: None,
            exit_streams_seen: 0,
            dir_streams_seen: 0,
        }
    }

    /// Whether this daemon built the circuit.
    pub fn is_origin(&self) -> bool {
        matches!(self.origin, CircuitOrigin::Origin)
    }

    /// The previous-hop channel of a relay circuit.
    pub fn prev_conn(&self) -> Option<ConnectionHandle> {
        match self.origin {
            CircuitOrigin::Relay { prev_conn, .. } => prev_conn,
            CircuitOrigin::Origin => None,
        }
    }

    /// The next-hop channel, if extended.
    pub fn next_conn(&self) -> Option<ConnectionHandle> {
        self.next.map(|(_, conn)| conn)
    }
}

/// An OR connection (channel) to another relay or a client.
#[derive(Debug, Clone)]
pub struct OrConnection {
    /// Process-unique identifier.
    pub global_id: u64,
    /// Remote address.
    pub remote_address: IpAddr,
    /// Remote port.
    pub remote_port: u16,
    /// The peer did not authenticate as a relay.
    pub is_client: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Counts from the legacy counting points.
    pub legacy_bytes: ByteCounters,
    /// Counts from every counting point.
    pub all_bytes: ByteCounters,
}

/// A stream leaving the network at this exit.
#[derive(Debug, Clone)]
pub struct ExitStream {
    /// Stream id within its circuit.
    pub stream_id: u16,
    /// Owning circuit.
    pub circuit: CircuitHandle,
    /// Requested host name or address.
    pub remote_host: String,
    /// Requested port.
    pub remote_port: u16,
    /// Address the host resolved to.
    pub resolved_address: Option<IpAddr>,
    /// A directory request tunnelled over the circuit.
    pub is_dir: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Bytes moved in each direction.
    pub bytes: ByteCounters,
}

/// Owning collections for every instrumented entity.
#[derive(Debug, Default)]
pub struct EntityArena {
    /// All live circuits.
    pub circuits: Arena<Circuit>,
    /// All live OR connections.
    pub connections: Arena<OrConnection>,
    /// All live exit streams.
    pub streams: Arena<ExitStream>,
    next_circuit_id: u32,
    next_connection_id: u64,
}

impl EntityArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an OR connection.
    pub fn add_connection(
        &mut self,
        remote_address: IpAddr,
        remote_port: u16,
        is_client: bool,
    ) -> ConnectionHandle {
        self.next_connection_id += 1;
        self.connections.insert(OrConnection {
            global_id: self.next_connection_id,
            remote_address,
            remote_port,
            is_client,
            created_at: Utc::now(),
            legacy_bytes: ByteCounters::default(),
            all_bytes: ByteCounters::default(),
        })
    }

    /// Registers a circuit this daemon built.
    pub fn add_origin_circuit(&mut self) -> CircuitHandle {
        let id = self.allocate_circuit_id();
        self.circuits.insert(Circuit::new(id, CircuitOrigin::Origin))
    }

    /// Registers a circuit extended to us from `prev_conn`.
    pub fn add_relay_circuit(
        &mut self,
        prev_circ_id: u32,
        prev_conn: ConnectionHandle,
    ) -> CircuitHandle {
        let id = self.allocate_circuit_id();
        self.circuits.insert(Circuit::new(
            id,
            CircuitOrigin::Relay {
                prev_circ_id,
                prev_conn: Some(prev_conn),
            },
        ))
    }

    fn allocate_circuit_id(&mut self) -> u32 {
        self.next_circuit_id = self.next_circuit_id.wrapping_add(1);
        self.next_circuit_id
    }

    /// Records the next hop of a circuit. Returns `false` for a stale handle.
    pub fn set_next_hop(
        &mut self,
        circuit: CircuitHandle,
        next_circ_id: u32,
        next_conn: ConnectionHandle,
    ) -> bool {
        match self.circuits.get_mut(circuit) {
            Some(circ) => {
                circ.next = Some((next_circ_id, next_conn));
                true
            }
            None => false,
        }
    }

    /// Attaches an exit stream to a live circuit.
    pub fn add_exit_stream(
        &mut self,
        circuit: CircuitHandle,
        stream_id: u16,
        remote_host: &str,
        remote_port: u16,
        is_dir: bool,
    ) -> Option<StreamHandle> {
        let circ = self.circuits.get_mut(circuit)?;
        if is_dir {
            circ.dir_streams_seen += 1;
        } else {
            circ.exit_streams_seen += 1;
        }
        Some(self.streams.insert(ExitStream {
            stream_id,
            circuit,
            remote_host: remote_host.to_string(),
            remote_port,
            resolved_address: None,
            is_dir,
            created_at: Utc::now(),
            bytes: ByteCounters::default(),
        }))
    }

    /// Adds transferred bytes to a stream.
    pub fn record_stream_bytes(&mut self, stream: StreamHandle, amount: u64, is_outbound: bool) {
        if let Some(stream) = self.streams.get_mut(stream) {
            if is_outbound {
                stream.bytes.outbound_bytes += amount;
            } else {
                stream.bytes.inbound_bytes += amount;
            }
        }
    }

    /// Removes a connection and detaches it from every circuit using it.
    pub fn remove_connection(&mut self, conn: ConnectionHandle) -> Option<OrConnection> {
        let removed = self.connections.remove(conn)?;
        for slot in self.circuits.slots.iter_mut() {
            let Some(circ) = slot.value.as_mut() else {
                continue;
            };
            if let CircuitOrigin::Relay { prev_conn, .. } = &mut circ.origin {
                if *prev_conn == Some(conn) {
                    *prev_conn = None;
                }
            }
            if circ.next_conn() == Some(conn) {
                circ.next = None;
            }
        }
        Some(removed)
    }

    /// Removes a circuit along with its streams.
    pub fn remove_circuit(&mut self, circuit: CircuitHandle) -> Option<Circuit> {
        let removed = self.circuits.remove(circuit)?;
        let orphans: Vec<StreamHandle> = self
            .streams
            .iter()
            .filter(|(_, s)| s.circuit == circuit)
            .map(|(h, _)| h)
            .collect();
        for stream in orphans {
            self.streams.remove(stream);
        }
        Some(removed)
    }

    /// Global id of a connection, if it still exists.
    pub fn connection_id(&self, conn: Option<ConnectionHandle>) -> Option<u64> {
        conn.and_then(|c| self.connections.get(c))
            .map(|c| c.global_id)
    }

    /// The identity prefix for a circuit's `CELL_STATS` line.
    pub fn cell_stats_identity(&self, circuit: &Circuit) -> CellStatsIdentity {
        let mut identity = CellStatsIdentity::default();
        match circuit.origin {
            CircuitOrigin::Origin => identity.origin_id = Some(circuit.global_id),
            CircuitOrigin::Relay {
                prev_circ_id,
                prev_conn,
            } => {
                identity.inbound = self
                    .connection_id(prev_conn)
                    .map(|conn_id| (prev_circ_id, conn_id));
            }
        }
        if let Some((next_circ_id, next_conn)) = circuit.next {
            identity.outbound = self
                .connection_id(Some(next_conn))
                .map(|conn_id| (next_circ_id, conn_id));
        }
        identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn test_stale_handle_does_not_resolve() {
        let mut arena: Arena<&str> = Arena::new();
        let a = arena.insert("a");
        assert_eq!(arena.remove(a), Some("a"));
        let b = arena.insert("b");

        assert_eq!(a.index(), b.index());
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(b), Some(&"b"));
        assert!(arena.remove(a).is_none());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_stream_accounting() {
        let mut arena = EntityArena::new();
        let circ = arena.add_origin_circuit();
        let exit = arena.add_exit_stream(circ, 1, "example.com", 443, false).unwrap();
        arena.add_exit_stream(circ, 2, "", 0, true).unwrap();
        arena.record_stream_bytes(exit, 100, true);
        arena.record_stream_bytes(exit, 40, false);

        let circuit = arena.circuits.get(circ).unwrap();
        assert_eq!(circuit.exit_streams_seen, 1);
        assert_eq!(circuit.dir_streams_seen, 1);
        let stream = arena.streams.get(exit).unwrap();
        assert_eq!(stream.bytes.outbound_bytes, 100);
        assert_eq!(stream.bytes.inbound_bytes, 40);
    }

    #[test]
    fn test_remove_circuit_drops_streams() {
        let mut arena = EntityArena::new();
        let circ = arena.add_origin_circuit();
        let stream = arena.add_exit_stream(circ, 1, "a", 80, false).unwrap();
        arena.remove_circuit(circ).unwrap();
        assert!(arena.streams.get(stream).is_none());
        assert!(arena.add_exit_stream(circ, 2, "b", 80, false).is_none());
    }

    #[test]
    fn test_remove_connection_detaches_circuits() {
        let mut arena = EntityArena::new();
        let prev = arena.add_connection(localhost(), 9001, true);
        let next = arena.add_connection(localhost(), 9002, false);
        let circ = arena.add_relay_circuit(5, prev);
        arena.set_next_hop(circ, 6, next);

        arena.remove_connection(prev).unwrap();
        let circuit = arena.circuits.get(circ).unwrap();
        assert_eq!(circuit.prev_conn(), None);
        assert_eq!(circuit.next_conn(), Some(next));
    }

    #[test]
    fn test_cell_stats_identity() {
        let mut arena = EntityArena::new();
        let prev = arena.add_connection(localhost(), 9001, true);
        let next = arena.add_connection(localhost(), 9002, false);
        let relay = arena.add_relay_circuit(5, prev);
        arena.set_next_hop(relay, 6, next);
        let origin = arena.add_origin_circuit();

        let relay_circ = arena.circuits.get(relay).unwrap();
        let identity = arena.cell_stats_identity(relay_circ);
        assert_eq!(identity.origin_id, None);
        assert_eq!(identity.inbound, Some((5, 1)));
        assert_eq!(identity.outbound, Some((6, 2)));

        let origin_circ = arena.circuits.get(origin).unwrap();
        let identity = arena.cell_stats_identity(origin_circ);
        assert_eq!(identity.origin_id, Some(origin_circ.global_id));
        assert_eq!(identity.inbound, None);
    }

    #[test]
    fn test_hs_version_numbers() {
        assert_eq!(HsVersion::from_number(2), Some(HsVersion::V2));
        assert_eq!(HsVersion::V3.number(), 3);
        assert_eq!(HsVersion::from_number(4), None);
    }
}
