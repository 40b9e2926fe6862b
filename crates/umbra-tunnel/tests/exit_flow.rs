//! Exit-socket scenarios: real UDP egress, the return path, and the
//! per-destination abuse counter.

mod common;

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use common::{Harness, NodeSpec};

use umbra_tunnel::circuit::CircuitType;
use umbra_tunnel::community::CircuitOptions;
use umbra_tunnel::settings::TunnelSettings;
use umbra_wire::Address;

const DHT_PING: &[u8] = b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe";

fn one_hop_pair(exit_settings: TunnelSettings) -> (Harness, u32) {
    let mut harness = Harness::new(vec![
        NodeSpec::plain(),
        NodeSpec {
            settings: TunnelSettings {
                become_exitnode: true,
                ..exit_settings
            },
            willing_exit: true,
        },
    ]);
    let circuit_id = harness
        .node(0)
        .community
        .create_circuit(1, CircuitType::Data, CircuitOptions::default())
        .expect("create circuit");
    harness.pump();
    assert!(harness.nodes[0].community.circuits()[&circuit_id].is_ready());
    (harness, circuit_id)
}

#[tokio::test]
async fn datagram_exits_to_the_internet_and_returns() {
    let (mut harness, circuit_id) = one_hop_pair(TunnelSettings::default());

    // A stand-in for a remote BitTorrent peer.
    let remote = tokio::net::UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("bind remote");
    let remote_port = remote.local_addr().expect("addr").port();

    harness.node(0).community.tunnel_data_to_end(
        &Address::V4(Ipv4Addr::LOCALHOST, remote_port),
        DHT_PING,
        circuit_id,
    );
    harness.pump();

    let mut buf = [0u8; 2048];
    let (len, exit_addr) = tokio::time::timeout(Duration::from_secs(2), remote.recv_from(&mut buf))
        .await
        .expect("timely egress")
        .expect("recv");
    assert_eq!(&buf[..len], DHT_PING);

    let exit = &harness.nodes[1].community;
    let exit_port = exit
        .exit_sockets()
        .get(&circuit_id)
        .and_then(|e| e.local_port())
        .expect("enabled exit socket");
    assert_eq!(exit_addr.port(), exit_port);
    assert!(exit.stats().bytes_exit > 0);

    // The remote answers; the exit wraps it back into the circuit.
    let reply = b"d1:rd2:id20:abcdefghij0123456789e1:t2:aa1:y1:re";
    remote
        .send_to(reply, SocketAddr::from(([127, 0, 0, 1], exit_port)))
        .await
        .expect("send reply");
    let datagram = tokio::time::timeout(
        Duration::from_secs(2),
        harness.nodes[1].exit_rx.recv(),
    )
    .await
    .expect("timely ingress")
    .expect("open channel");
    harness.node(1).community.on_exit_datagram(datagram);
    harness.pump();

    let received = harness.nodes[0].gateway.received.lock().expect("lock");
    assert_eq!(received.len(), 1);
    let (cid, origin, data, anon_seed) = &received[0];
    assert_eq!(*cid, circuit_id);
    assert_eq!(data.as_slice(), reply);
    assert_eq!(*origin, Address::V4(Ipv4Addr::LOCALHOST, remote.local_addr().expect("addr").port()));
    assert!(!anon_seed);
}

#[tokio::test]
async fn refused_exit_drops_application_traffic() {
    // The terminal hop did not opt in to exiting.
    let mut harness = Harness::new(vec![
        NodeSpec::plain(),
        NodeSpec {
            settings: TunnelSettings::default(),
            willing_exit: true,
        },
    ]);
    let circuit_id = harness
        .node(0)
        .community
        .create_circuit(1, CircuitType::Data, CircuitOptions::default())
        .expect("create circuit");
    harness.pump();

    harness.node(0).community.tunnel_data_to_end(
        &Address::V4(Ipv4Addr::LOCALHOST, 9999),
        DHT_PING,
        circuit_id,
    );
    harness.pump();

    let exit = &harness.nodes[1].community;
    let socket = exit.exit_sockets().get(&circuit_id).expect("latent socket");
    assert!(!socket.enabled());
    assert_eq!(exit.stats().bytes_exit, 0);
}

#[tokio::test]
async fn abuse_counter_destroys_the_exit_socket() {
    let (mut harness, circuit_id) = one_hop_pair(TunnelSettings {
        max_packets_without_reply: 2,
        ..TunnelSettings::default()
    });

    // Destination 9 is the discard port; nothing ever answers.
    let destination = Address::V4(Ipv4Addr::LOCALHOST, 9);
    for _ in 0..3 {
        harness
            .node(0)
            .community
            .tunnel_data_to_end(&destination, DHT_PING, circuit_id);
        harness.pump();
    }

    // The third packet tripped the counter: socket destroyed, destroy
    // propagated back, initiator circuit gone.
    assert!(harness.nodes[1].community.exit_sockets().is_empty());
    assert!(!harness.nodes[0].community.circuits().contains_key(&circuit_id));
}

#[tokio::test]
async fn exit_socket_survives_up_to_the_threshold() {
    let (mut harness, circuit_id) = one_hop_pair(TunnelSettings {
        max_packets_without_reply: 2,
        ..TunnelSettings::default()
    });

    let destination = Address::V4(Ipv4Addr::LOCALHOST, 9);
    for _ in 0..2 {
        harness
            .node(0)
            .community
            .tunnel_data_to_end(&destination, DHT_PING, circuit_id);
        harness.pump();
    }
    assert!(harness.nodes[1].community.exit_sockets().contains_key(&circuit_id));
}
