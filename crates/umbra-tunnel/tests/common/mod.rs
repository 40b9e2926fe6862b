//! In-memory multi-node harness.
//!
//! Nodes exchange frames through captured outboxes instead of real
//! sockets; `pump` drains every outbox and delivers to the addressed
//! node until the network is quiet.

// Not every test target exercises every harness feature.
#![allow(dead_code)]

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedReceiver;

use umbra_crypto::tunnel::NodeIdentity;
use umbra_crypto::x25519::X25519PublicKey;
use umbra_tunnel::community::TunnelCommunity;
use umbra_tunnel::exit::ExitDatagram;
use umbra_tunnel::external::{Candidate, Endpoint, Overlay, SocksGateway};
use umbra_tunnel::settings::TunnelSettings;
use umbra_tunnel::stats::NoMetrics;
use umbra_wire::Address;

pub type Outbox = Arc<Mutex<Vec<(SocketAddr, Vec<u8>)>>>;

pub struct MemEndpoint {
    outbox: Outbox,
}

impl Endpoint for MemEndpoint {
    fn send_packet(&mut self, addr: SocketAddr, packet: &[u8]) -> io::Result<()> {
        self.outbox
            .lock()
            .expect("outbox lock")
            .push((addr, packet.to_vec()));
        Ok(())
    }
}

/// One shared candidate list; each node's overlay view excludes itself.
#[derive(Clone, Default)]
pub struct SharedCandidates(Arc<Mutex<Vec<Candidate>>>);

impl SharedCandidates {
    pub fn push(&self, candidate: Candidate) {
        self.0.lock().expect("candidates lock").push(candidate);
    }

    pub fn remove(&self, address: SocketAddr) {
        self.0
            .lock()
            .expect("candidates lock")
            .retain(|c| c.address != address);
    }
}

pub struct TestOverlay {
    candidates: SharedCandidates,
    own: SocketAddr,
}

impl Overlay for TestOverlay {
    fn verified_candidates(&self) -> Vec<Candidate> {
        self.candidates
            .0
            .lock()
            .expect("candidates lock")
            .iter()
            .filter(|c| c.address != self.own)
            .cloned()
            .collect()
    }
}

/// Captures everything the SOCKS gateway would see.
#[derive(Clone, Default)]
pub struct GatewayLog {
    pub received: Arc<Mutex<Vec<(u32, Address, Vec<u8>, bool)>>>,
    pub dead: Arc<Mutex<Vec<u32>>>,
}

pub struct TestGateway(GatewayLog);

impl SocksGateway for TestGateway {
    fn on_incoming_from_tunnel(
        &mut self,
        circuit_id: u32,
        origin: &Address,
        data: &[u8],
        anon_seed: bool,
    ) {
        self.0
            .received
            .lock()
            .expect("gateway lock")
            .push((circuit_id, origin.clone(), data.to_vec(), anon_seed));
    }

    fn circuit_dead(&mut self, circuit_id: u32) -> HashSet<SocketAddr> {
        self.0.dead.lock().expect("gateway lock").push(circuit_id);
        HashSet::new()
    }
}

pub struct NodeSpec {
    pub settings: TunnelSettings,
    pub willing_exit: bool,
}

impl NodeSpec {
    pub fn plain() -> Self {
        Self {
            settings: TunnelSettings::default(),
            willing_exit: false,
        }
    }

    pub fn exit() -> Self {
        Self {
            settings: TunnelSettings {
                become_exitnode: true,
                ..TunnelSettings::default()
            },
            willing_exit: true,
        }
    }
}

pub struct TestNode {
    pub addr: SocketAddr,
    pub public_key: X25519PublicKey,
    pub community: TunnelCommunity,
    pub outbox: Outbox,
    pub exit_rx: UnboundedReceiver<ExitDatagram>,
    pub gateway: GatewayLog,
}

pub struct Harness {
    pub nodes: Vec<TestNode>,
    pub candidates: SharedCandidates,
}

impl Harness {
    pub fn new(specs: Vec<NodeSpec>) -> Self {
        let identities: Vec<NodeIdentity> =
            specs.iter().map(|_| NodeIdentity::generate()).collect();
        let addrs: Vec<SocketAddr> = (0..specs.len())
            .map(|i| SocketAddr::from(([127, 0, 0, 1], 5001 + i as u16)))
            .collect();

        let candidates = SharedCandidates::default();
        for (i, identity) in identities.iter().enumerate() {
            candidates.push(Candidate {
                address: addrs[i],
                public_key: identity.tunnel_public(),
                member_id: Some(identity.member_id()),
                connectable: true,
            });
        }
        let willing: Vec<bool> = specs.iter().map(|s| s.willing_exit).collect();

        let mut nodes = Vec::new();
        for (i, (spec, identity)) in specs.into_iter().zip(identities).enumerate() {
            let public_key = identity.tunnel_public();
            let outbox: Outbox = Outbox::default();
            let gateway = GatewayLog::default();
            let (mut community, exit_rx) = TunnelCommunity::new(
                identity,
                spec.settings,
                Box::new(MemEndpoint {
                    outbox: outbox.clone(),
                }),
                Box::new(TestOverlay {
                    candidates: candidates.clone(),
                    own: addrs[i],
                }),
                Box::new(TestGateway(gateway.clone())),
                Box::new(NoMetrics),
            );
            // Feed the overlay introduction exchange.
            for (j, cand) in candidates
                .0
                .lock()
                .expect("candidates lock")
                .iter()
                .enumerate()
            {
                if j != i {
                    community.on_candidate(cand, willing[j]);
                }
            }
            nodes.push(TestNode {
                addr: addrs[i],
                public_key,
                community,
                outbox,
                exit_rx,
                gateway,
            });
        }
        Harness { nodes, candidates }
    }

    /// Deliver queued frames until the network is quiet.
    pub fn pump(&mut self) {
        for _ in 0..1000 {
            let mut delivered = false;
            for i in 0..self.nodes.len() {
                let from = self.nodes[i].addr;
                let outgoing: Vec<(SocketAddr, Vec<u8>)> = self.nodes[i]
                    .outbox
                    .lock()
                    .expect("outbox lock")
                    .drain(..)
                    .collect();
                for (to, packet) in outgoing {
                    delivered = true;
                    if let Some(target) = self.nodes.iter_mut().find(|n| n.addr == to) {
                        target.community.on_packet(from, &packet);
                    }
                }
            }
            if !delivered {
                return;
            }
        }
        panic!("network never went quiet");
    }

    pub fn node(&mut self, i: usize) -> &mut TestNode {
        &mut self.nodes[i]
    }
}
