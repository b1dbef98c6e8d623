//! Per-circuit cell statistics for `CELL_STATS` events.
//!
//! A [`CellStats`] holds six counters per cell command. It is filled from a
//! circuit's recorded queue entries (or directly through
//! [`CellStats::record`]), formatted once, and dropped.
//!
//! # Wire Form
//!
//! ```text
//!   650 CELL_STATS ID=7 relay=added_cells_appward:3,removed_cells_appward:3,time_appward:40
//!                  └────┘ └───┘ └──────────────── non-zero counters only ─────────────────┘
//!                identity  command
//! ```
//!
//! Relay circuits carry `InboundQueue=`/`InboundConn=` instead of `ID=`, and
//! `OutboundQueue=`/`OutboundConn=` when a next hop exists. Commands whose
//! counters are all zero are left out entirely.

use std::time::Duration;

use crate::payload::Words;

/// Highest cell command code.
pub const CELL_COMMAND_MAX: usize = 132;

const SLOTS: usize = CELL_COMMAND_MAX + 1;

/// Stable counter key names, in rendering order.
pub const COUNTER_KEYS: [&str; 6] = [
    "added_cells_appward",
    "added_cells_exitward",
    "removed_cells_appward",
    "removed_cells_exitward",
    "time_appward",
    "time_exitward",
];

/// Control-protocol name of a cell command, if it is a known one.
pub fn cell_command_name(command: u8) -> Option<&'static str> {
    Some(match command {
        0 => "padding",
        1 => "create",
        2 => "created",
        3 => "relay",
        4 => "destroy",
        5 => "create_fast",
        6 => "created_fast",
        7 => "versions",
        8 => "netinfo",
        9 => "relay_early",
        10 => "create2",
        11 => "created2",
        12 => "padding_negotiate",
        128 => "vpadding",
        129 => "certs",
        130 => "auth_challenge",
        131 => "authenticate",
        132 => "authorize",
        _ => return None,
    })
}

/// Which way a cell travels along the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Towards the client.
    Appward,
    /// Towards the exit.
    Exitward,
}

/// What happened to a cell in a circuit queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellOp {
    /// Appended to the queue.
    Added,
    /// Taken off the queue and written out.
    Removed,
}

/// One recorded queue operation on a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellStatsEntry {
    /// Cell command code.
    pub command: u8,
    /// Queue direction.
    pub direction: Direction,
    /// Added or removed.
    pub op: CellOp,
    /// Time the cell spent queued; only meaningful for removals.
    pub waiting_time: Duration,
}

/// The circuit identity that prefixes a `CELL_STATS` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CellStatsIdentity {
    /// Global identifier of an origin circuit.
    pub origin_id: Option<u32>,
    /// Circuit id and connection id towards the previous hop.
    pub inbound: Option<(u32, u64)>,
    /// Circuit id and connection id towards the next hop.
    pub outbound: Option<(u32, u64)>,
}

/// Counters for one circuit, indexed by cell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellStats {
    added_appward: [u64; SLOTS],
    added_exitward: [u64; SLOTS],
    removed_appward: [u64; SLOTS],
    removed_exitward: [u64; SLOTS],
    time_appward: [u64; SLOTS],
    time_exitward: [u64; SLOTS],
}

impl Default for CellStats {
    fn default() -> Self {
        Self {
            added_appward: [0; SLOTS],
            added_exitward: [0; SLOTS],
            removed_appward: [0; SLOTS],
            removed_exitward: [0; SLOTS],
            time_appward: [0; SLOTS],
            time_exitward: [0; SLOTS],
        }
    }
}

impl CellStats {
    /// All-zero counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sums a circuit's recorded entries.
    pub fn from_entries(entries: &[CellStatsEntry]) -> Self {
        let mut stats = Self::new();
        for entry in entries {
            stats.record(entry.command, entry.direction, entry.op, entry.waiting_time);
        }
        stats
    }

    /// Counts one queue operation.
    ///
    /// Removals also add `queue_delay`, in milliseconds, to the direction's
    /// time total. Returns `false` and records nothing for command codes
    /// above [`CELL_COMMAND_MAX`].
    pub fn record(
        &mut self,
        command: u8,
        direction: Direction,
        op: CellOp,
        queue_delay: Duration,
    ) -> bool {
        let i = usize::from(command);
        if i > CELL_COMMAND_MAX {
            return false;
        }
        let delay_ms = u64::try_from(queue_delay.as_millis()).unwrap_or(u64::MAX);
        match (op, direction) {
            (CellOp::Added, Direction::Appward) => self.added_appward[i] += 1,
            (CellOp::Added, Direction::Exitward) => self.added_exitward[i] += 1,
            (CellOp::Removed, Direction::Appward) => {
                self.removed_appward[i] += 1;
                self.time_appward[i] = self.time_appward[i].saturating_add(delay_ms);
            }
            (CellOp::Removed, Direction::Exitward) => {
                self.removed_exitward[i] += 1;
                self.time_exitward[i] = self.time_exitward[i].saturating_add(delay_ms);
            }
        }
        true
    }

    /// The six counters for `command`, in [`COUNTER_KEYS`] order.
    pub fn counters(&self, command: u8) -> [u64; 6] {
        let i = usize::from(command);
        if i > CELL_COMMAND_MAX {
            return [0; 6];
        }
        [
            self.added_appward[i],
            self.added_exitward[i],
            self.removed_appward[i],
            self.removed_exitward[i],
            self.time_appward[i],
            self.time_exitward[i],
        ]
    }

    /// Whether every counter is zero.
    pub fn is_empty(&self) -> bool {
        (0..=CELL_COMMAND_MAX as u8).all(|c| self.counters(c) == [0; 6])
    }

    /// Renders the per-command groups for every command with a non-zero
    /// counter.
    pub fn command_groups(&self) -> Vec<String> {
        (0..=CELL_COMMAND_MAX as u8)
            .filter_map(|command| {
                let counters = self.counters(command);
                let parts: Vec<String> = COUNTER_KEYS
                    .iter()
                    .zip(counters)
                    .filter(|(_, value)| *value != 0)
                    .map(|(key, value)| format!("{}:{}", key, value))
                    .collect();
                if parts.is_empty() {
                    return None;
                }
                let name = cell_command_name(command)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("cmd{}", command));
                Some(format!("{}={}", name, parts.join(",")))
            })
            .collect()
    }
}

/// Builds the `CELL_STATS` payload words for one circuit.
pub fn format_cell_stats(identity: &CellStatsIdentity, stats: &CellStats) -> Words {
    let mut words = Words::new();
    if let Some(id) = identity.origin_id {
        words = words.pair("ID", id);
    } else if let Some((circ_id, conn_id)) = identity.inbound {
        words = words
            .pair("InboundQueue", circ_id)
            .pair("InboundConn", conn_id);
    }
    if let Some((circ_id, conn_id)) = identity.outbound {
        words = words
            .pair("OutboundQueue", circ_id)
            .pair("OutboundConn", conn_id);
    }
    for group in stats.command_groups() {
        words = words.word(group);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    const RELAY: u8 = 3;
    const CREATE_FAST: u8 = 5;

    #[test]
    fn test_single_increment_emits_one_key() {
        let mut stats = CellStats::new();
        stats.record(RELAY, Direction::Appward, CellOp::Added, Duration::ZERO);
        assert_eq!(stats.command_groups(), vec!["relay=added_cells_appward:1"]);
    }

    #[test]
    fn test_empty_stats_emit_nothing() {
        let stats = CellStats::new();
        assert!(stats.is_empty());
        assert!(stats.command_groups().is_empty());
        let words = format_cell_stats(&CellStatsIdentity::default(), &stats);
        assert_eq!(words.render(), "");
    }

    #[test]
    fn test_removal_accumulates_time() {
        let mut stats = CellStats::new();
        stats.record(RELAY, Direction::Exitward, CellOp::Removed, Duration::from_millis(30));
        stats.record(RELAY, Direction::Exitward, CellOp::Removed, Duration::from_millis(12));
        assert_eq!(stats.counters(RELAY), [0, 0, 0, 2, 0, 42]);
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut stats = CellStats::new();
        assert!(!stats.record(200, Direction::Appward, CellOp::Added, Duration::ZERO));
        assert!(stats.is_empty());
    }

    #[test]
    fn test_from_entries() {
        let entries = [
            CellStatsEntry {
                command: CREATE_FAST,
                direction: Direction::Exitward,
                op: CellOp::Added,
                waiting_time: Duration::ZERO,
            },
            CellStatsEntry {
                command: RELAY,
                direction: Direction::Appward,
                op: CellOp::Added,
                waiting_time: Duration::ZERO,
            },
            CellStatsEntry {
                command: RELAY,
                direction: Direction::Appward,
                op: CellOp::Removed,
                waiting_time: Duration::from_millis(20),
            },
        ];
        let stats = CellStats::from_entries(&entries);
        assert_eq!(
            stats.command_groups(),
            vec![
                "relay=added_cells_appward:1,removed_cells_appward:1,time_appward:20",
                "create_fast=added_cells_exitward:1",
            ]
        );
    }

    #[test]
    fn test_origin_identity() {
        let mut stats = CellStats::new();
        stats.record(RELAY, Direction::Appward, CellOp::Added, Duration::ZERO);
        let identity = CellStatsIdentity {
            origin_id: Some(7),
            inbound: None,
            outbound: Some((12, 4)),
        };
        assert_eq!(
            format_cell_stats(&identity, &stats).render(),
            "ID=7 OutboundQueue=12 OutboundConn=4 relay=added_cells_appward:1"
        );
    }

    #[test]
    fn test_relay_identity() {
        let identity = CellStatsIdentity {
            origin_id: None,
            inbound: Some((99, 2)),
            outbound: None,
        };
        assert_eq!(
            format_cell_stats(&identity, &CellStats::new()).render(),
            "InboundQueue=99 InboundConn=2"
        );
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn op_strategy() -> impl Strategy<Value = (u8, Direction, CellOp, u64)> {
        (
            prop::sample::select(vec![0u8, 1, 3, 5, 9, 128, 132]),
            prop_oneof![Just(Direction::Appward), Just(Direction::Exitward)],
            prop_oneof![Just(CellOp::Added), Just(CellOp::Removed)],
            0u64..500,
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn only_active_commands_are_rendered(ops in prop::collection::vec(op_strategy(), 0..50)) {
            let mut stats = CellStats::new();
            for (command, direction, op, delay) in &ops {
                stats.record(*command, *direction, *op, Duration::from_millis(*delay));
            }
            let groups = stats.command_groups();

            for command in 0..=CELL_COMMAND_MAX as u8 {
                let Some(name) = cell_command_name(command) else { continue };
                let prefix = format!("{}=", name);
                let rendered = groups.iter().find(|g| g.starts_with(&prefix));
                let touched = ops.iter().any(|(c, ..)| *c == command);
                prop_assert_eq!(rendered.is_some(), touched);

                if let Some(group) = rendered {
                    for part in group[prefix.len()..].split(',') {
                        let (key, value) = part.split_once(':').unwrap();
                        prop_assert!(COUNTER_KEYS.contains(&key));
                        prop_assert_ne!(value, "0");
                    }
                }
            }
        }
    }
}
