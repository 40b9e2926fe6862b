//! Configuration file management.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use umbra_tunnel::settings::TunnelSettings;

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Network settings.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Tunnel data-plane settings.
    #[serde(default)]
    pub tunnel: TunnelSettings,
    /// Advanced settings.
    #[serde(default)]
    pub advanced: AdvancedConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// 0 = OS-assigned ephemeral port.
    #[serde(default)]
    pub listen_port: u16,
    /// Statically configured peers standing in for the discovery
    /// overlay.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    /// Hop count the node keeps data circuits ready for.
    #[serde(default = "default_hops")]
    pub default_hops: u8,
}

/// One statically configured peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Transport address, e.g. "198.51.100.1:4433".
    pub address: SocketAddr,
    /// Hex-encoded X25519 tunnel public key (32 bytes).
    pub tunnel_key: String,
    /// Hex-encoded member id (32 bytes), when known.
    #[serde(default)]
    pub member_id: Option<String>,
    /// Whether the peer advertises willingness to exit.
    #[serde(default)]
    pub exit: bool,
    /// Whether the peer is reachable without NAT assistance.
    #[serde(default = "default_true")]
    pub connectable: bool,
}

/// Advanced configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedConfig {
    /// Log level: "debug" | "info" | "warn" | "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_hops() -> u8 {
    1
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            peers: Vec::new(),
            default_hops: default_hops(),
        }
    }
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the default config file location.
    ///
    /// Falls back to defaults if the file does not exist.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: DaemonConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Get the data directory path.
    pub fn data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("UMBRA_DATA_DIR") {
            return PathBuf::from(dir);
        }
        std::env::var("HOME")
            .map(|h| PathBuf::from(h).join(".umbra"))
            .unwrap_or_else(|_| PathBuf::from("/tmp/umbra"))
    }

    fn config_path() -> PathBuf {
        Self::data_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.network.listen_port, 0);
        assert_eq!(config.network.default_hops, 1);
        assert!(config.network.peers.is_empty());
        assert_eq!(config.tunnel.min_circuits, 4);
        assert_eq!(config.advanced.log_level, "info");
    }

    #[test]
    fn test_config_serialization() {
        let config = DaemonConfig::default();
        let toml_str = toml::to_string(&config).expect("serialize");
        let _parsed: DaemonConfig = toml::from_str(&toml_str).expect("parse");
    }

    #[test]
    fn test_peer_section_parses() {
        let toml_str = r#"
            [[network.peers]]
            address = "198.51.100.1:4433"
            tunnel_key = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
            exit = true

            [tunnel]
            become_exitnode = true
            max_circuits = 2
        "#;
        let config: DaemonConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.network.peers.len(), 1);
        assert!(config.network.peers[0].exit);
        assert!(config.network.peers[0].connectable);
        assert!(config.tunnel.become_exitnode);
        assert_eq!(config.tunnel.max_circuits, 2);
        // Unnamed tunnel fields keep their defaults.
        assert_eq!(config.tunnel.max_relays_or_exits, 100);
    }
}
