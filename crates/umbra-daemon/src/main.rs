//! umbra-daemon: one Umbra tunnel node.
//!
//! Single OS process running a Tokio runtime. The tunnel community is
//! owned by the main task and driven by a `select!` loop over the UDP
//! socket, the maintenance and ping timers, and the exit-datagram queue;
//! every handler runs to completion before the next event is taken.

mod config;
mod node;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{info, warn};

use umbra_crypto::tunnel::NodeIdentity;
use umbra_tunnel::community::TunnelCommunity;
use umbra_tunnel::stats::NoMetrics;

use crate::config::DaemonConfig;
use crate::node::{LogGateway, StaticOverlay, UdpEndpoint};

/// Load the node's keys from disk, generating them on first start.
fn load_identity(data_dir: &std::path::Path) -> anyhow::Result<NodeIdentity> {
    let key_path = data_dir.join("umbra.key");
    if key_path.exists() {
        let bytes = std::fs::read(&key_path)?;
        let raw: [u8; 64] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("corrupt key file {}", key_path.display()))?;
        let tunnel: [u8; 32] = raw[..32].try_into()?;
        let signing: [u8; 32] = raw[32..].try_into()?;
        return Ok(NodeIdentity::from_bytes(tunnel, &signing));
    }

    let identity = NodeIdentity::generate();
    std::fs::write(&key_path, identity.to_bytes())?;
    Ok(identity)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DaemonConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("umbra={}", config.advanced.log_level).parse()?),
        )
        .init();

    info!("umbra daemon starting");

    let data_dir = DaemonConfig::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let identity = load_identity(&data_dir)?;
    info!("node id {}", hex::encode(identity.node_id()));

    let socket = Arc::new(
        UdpSocket::bind(("0.0.0.0", config.network.listen_port)).await?,
    );
    info!("listening on {}", socket.local_addr()?);

    let overlay = StaticOverlay::from_config(&config.network.peers);
    let seeded: Vec<_> = overlay
        .candidates()
        .iter()
        .cloned()
        .zip(config.network.peers.iter().map(|p| p.exit))
        .collect();

    let (mut community, mut exit_rx) = TunnelCommunity::new(
        identity,
        config.tunnel.clone(),
        Box::new(UdpEndpoint::new(socket.clone())),
        Box::new(overlay),
        Box::new(LogGateway),
        Box::new(NoMetrics),
    );
    for (candidate, exit) in &seeded {
        community.on_candidate(candidate, *exit);
    }
    community.tunnels_ready(config.network.default_hops);

    let mut maintenance = tokio::time::interval(Duration::from_secs(5));
    let mut ping = tokio::time::interval(community.settings().ping_interval());
    let mut buf = vec![0u8; 65535];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, source)) => community.on_packet(source, &buf[..len]),
                Err(e) => warn!("endpoint receive failed: {e}"),
            },
            _ = maintenance.tick() => community.on_tick(),
            _ = ping.tick() => community.on_ping_tick(),
            Some(datagram) = exit_rx.recv() => community.on_exit_datagram(datagram),
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, shutting down");
                break;
            }
        }
    }

    community.unload();
    info!("daemon stopped");
    Ok(())
}
