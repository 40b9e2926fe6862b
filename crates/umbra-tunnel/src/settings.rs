//! Tunable limits and caps for the tunnel data plane.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Node-level tunnel settings. Every field has the protocol default, so a
/// config file only needs to name what it changes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// Readiness floor: `tunnels_ready` reports 1.0 once this many data
    /// circuits of the requested length are ready.
    #[serde(default = "default_min_circuits")]
    pub min_circuits: usize,

    /// Upper target for the number of data circuits per hop count.
    #[serde(default = "default_max_circuits")]
    pub max_circuits: usize,

    /// `create` cells are ignored once this many relays plus exit sockets
    /// exist.
    #[serde(default = "default_max_relays_or_exits")]
    pub max_relays_or_exits: usize,

    /// Hard age cap, in seconds, for circuits, relays and exit sockets.
    #[serde(default = "default_max_time_secs")]
    pub max_time_secs: u64,

    /// Idle cap, in seconds, for circuits and relays; `last_incoming`
    /// governs.
    #[serde(default = "default_max_time_inactive_secs")]
    pub max_time_inactive_secs: u64,

    /// Byte cap (up + down) for circuits, relays and exit sockets.
    #[serde(default = "default_max_traffic")]
    pub max_traffic: u64,

    /// Exit abuse threshold: outbound packets to one destination IP
    /// without any reply.
    #[serde(default = "default_max_packets_without_reply")]
    pub max_packets_without_reply: u32,

    /// Interval, in seconds, between liveness pings on ready circuits.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Local SOCKS5 ingress ports (owned by the external gateway; carried
    /// here so one config section describes the tunnel stack).
    #[serde(default = "default_socks_listen_ports")]
    pub socks_listen_ports: Vec<u16>,

    /// Node-level opt-in to exit application traffic.
    #[serde(default)]
    pub become_exitnode: bool,

    /// Member ids (BLAKE3 of the signing key) allowed to crawl stats.
    #[serde(default)]
    pub crawler_member_ids: Vec<[u8; 32]>,
}

fn default_min_circuits() -> usize {
    4
}

fn default_max_circuits() -> usize {
    8
}

fn default_max_relays_or_exits() -> usize {
    100
}

fn default_max_time_secs() -> u64 {
    10 * 60
}

fn default_max_time_inactive_secs() -> u64 {
    20
}

fn default_max_traffic() -> u64 {
    55 * 1024 * 1024
}

fn default_max_packets_without_reply() -> u32 {
    50
}

fn default_ping_interval_secs() -> u64 {
    15
}

fn default_socks_listen_ports() -> Vec<u16> {
    (1080..1085).collect()
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            min_circuits: default_min_circuits(),
            max_circuits: default_max_circuits(),
            max_relays_or_exits: default_max_relays_or_exits(),
            max_time_secs: default_max_time_secs(),
            max_time_inactive_secs: default_max_time_inactive_secs(),
            max_traffic: default_max_traffic(),
            max_packets_without_reply: default_max_packets_without_reply(),
            ping_interval_secs: default_ping_interval_secs(),
            socks_listen_ports: default_socks_listen_ports(),
            become_exitnode: false,
            crawler_member_ids: Vec::new(),
        }
    }
}

impl TunnelSettings {
    pub fn max_time(&self) -> Duration {
        Duration::from_secs(self.max_time_secs)
    }

    pub fn max_time_inactive(&self) -> Duration {
        Duration::from_secs(self.max_time_inactive_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Timeout applied to ping correlation entries.
    pub fn ping_timeout(&self) -> Duration {
        self.ping_interval() + Duration::from_secs(5)
    }
}
