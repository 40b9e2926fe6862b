//! Byte counters and the injectable metrics seam.
//!
//! Node-wide counters mirror the per-entity counters: every send/receive
//! updates both in a single place inside the community, and removal
//! flushes nothing (the node-wide sums already include destroyed
//! entities).

use std::time::Duration;

use umbra_wire::StatsMap;

/// The three entity kinds the data plane manages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityKind {
    Circuit,
    Relay,
    ExitSocket,
}

/// Traffic direction as seen from this node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteDirection {
    Up,
    Down,
}

/// Injectable metrics sink. Each hook is invoked from exactly one place.
pub trait Metrics {
    fn on_created(&mut self, _kind: EntityKind) {}
    fn on_removed(&mut self, _kind: EntityKind) {}
    fn on_bytes(&mut self, _kind: EntityKind, _direction: ByteDirection, _bytes: u64) {}
}

/// A metrics sink that records nothing.
pub struct NoMetrics;

impl Metrics for NoMetrics {}

/// Node-wide tunnel byte counters.
#[derive(Clone, Debug, Default)]
pub struct TunnelStats {
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub bytes_relay_up: u64,
    pub bytes_relay_down: u64,
    pub bytes_exit: u64,
    pub bytes_enter: u64,
}

impl TunnelStats {
    /// Snapshot into the wire representation used by `stats-response`.
    pub fn snapshot(&self, uptime: Duration) -> StatsMap {
        StatsMap {
            bytes_up: self.bytes_up,
            bytes_down: self.bytes_down,
            bytes_relay_up: self.bytes_relay_up,
            bytes_relay_down: self.bytes_relay_down,
            bytes_exit: self.bytes_exit,
            bytes_enter: self.bytes_enter,
            uptime_secs: uptime.as_secs(),
        }
    }
}
