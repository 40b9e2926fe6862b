//! Circuit lifecycle scenarios over an in-memory network.

mod common;

use std::sync::{Arc, Mutex};

use common::{Harness, NodeSpec};

use umbra_crypto::tunnel::{generate_diffie_secret, SessionKeys};
use umbra_tunnel::circuit::{CircuitType, RequiredEndpoint};
use umbra_tunnel::community::CircuitOptions;
use umbra_tunnel::selection::{circuit_id_to_ip, CIRCUIT_ID_PORT};
use umbra_wire::cell::{self, CellBody};
use umbra_wire::Address;

/// Node layout used by most tests: 0 is the initiator, 1 is a willing
/// exit, 2 and 3 are plain relays.
fn four_nodes() -> Harness {
    Harness::new(vec![
        NodeSpec::plain(),
        NodeSpec::exit(),
        NodeSpec::plain(),
        NodeSpec::plain(),
    ])
}

#[test]
fn three_hop_data_circuit_becomes_ready() {
    let mut harness = four_nodes();
    let exit_pk = harness.node(1).public_key;

    let ready: Arc<Mutex<Vec<u32>>> = Arc::default();
    let ready_clone = ready.clone();
    let circuit_id = harness
        .node(0)
        .community
        .create_circuit(
            3,
            CircuitType::Data,
            CircuitOptions {
                callback: Some(Box::new(move |id| {
                    ready_clone.lock().expect("lock").push(id);
                })),
                ..CircuitOptions::default()
            },
        )
        .expect("create circuit");
    harness.pump();

    let initiator = &harness.nodes[0].community;
    let circuit = initiator.circuits().get(&circuit_id).expect("circuit");
    assert!(circuit.is_ready());
    assert_eq!(circuit.hops.len(), 3);
    // The terminal hop is the willing exit; the first hop is someone else.
    assert_eq!(circuit.hops[2].public_key, exit_pk);
    assert_ne!(circuit.first_hop, harness.nodes[1].addr);
    assert_eq!(*ready.lock().expect("lock"), vec![circuit_id]);

    // Every middle node carries a relay pair with direction tags; the
    // exit holds a latent exit socket.
    let middles: usize = harness
        .nodes
        .iter()
        .skip(2)
        .map(|n| n.community.relays().len())
        .sum();
    assert_eq!(middles, 4);
    for node in harness.nodes.iter().skip(2) {
        for id in node.community.relays().keys() {
            assert!(node.community.direction_of(*id).is_some());
        }
    }
    let exit_node = &harness.nodes[1].community;
    assert_eq!(exit_node.exit_sockets().len(), 1);
    for id in exit_node.exit_sockets().keys() {
        assert!(exit_node.direction_of(*id).is_some());
    }
}

#[test]
fn ping_is_answered_by_the_terminal_hop() {
    let mut harness = four_nodes();
    harness
        .node(0)
        .community
        .create_circuit(3, CircuitType::Data, CircuitOptions::default())
        .expect("create circuit");
    harness.pump();

    harness.node(0).community.on_ping_tick();
    assert_eq!(harness.node(0).community.outstanding_pings(), 1);
    harness.pump();
    assert_eq!(harness.node(0).community.outstanding_pings(), 0);
}

#[test]
fn round_robin_cycles_over_ready_circuits() {
    let mut harness = Harness::new(vec![NodeSpec::plain(), NodeSpec::exit()]);
    let first = harness
        .node(0)
        .community
        .create_circuit(1, CircuitType::Data, CircuitOptions::default())
        .expect("first circuit");
    let second = harness
        .node(0)
        .community
        .create_circuit(1, CircuitType::Data, CircuitOptions::default())
        .expect("second circuit");
    harness.pump();

    let low = first.min(second);
    let high = first.max(second);
    let community = &mut harness.nodes[0].community;
    assert_eq!(community.select_circuit(None, Some(1)), Some(low));
    assert_eq!(community.select_circuit(None, Some(1)), Some(high));
    assert_eq!(community.select_circuit(None, Some(1)), Some(low));
    // No circuits of another length exist.
    assert_eq!(community.select_circuit(None, Some(2)), None);
}

#[test]
fn create_flood_is_rejected_at_the_relay_cap() {
    let mut harness = Harness::new(vec![NodeSpec {
        settings: umbra_tunnel::settings::TunnelSettings {
            max_relays_or_exits: 2,
            ..Default::default()
        },
        willing_exit: false,
    }]);
    let node = harness.node(0);
    let node_id = node.community.identity().node_id();
    let node_pk = node.community.identity().tunnel_public().to_bytes();

    for i in 0..3u32 {
        let handshake = generate_diffie_secret();
        let packet = cell::encode_cell(
            100 + i,
            &CellBody::Create(cell::CreatePayload {
                node_id,
                node_public_key: node_pk,
                key: handshake.first_part.to_bytes(),
            }),
        )
        .expect("encode create");
        let source = std::net::SocketAddr::from(([10, 0, 0, 1], 7000 + i as u16));
        node.community.on_packet(source, &packet);
    }

    // The third create is ignored with no state change.
    assert_eq!(node.community.exit_sockets().len(), 2);
}

#[test]
fn destroy_is_only_accepted_from_the_first_hop() {
    let mut harness = Harness::new(vec![NodeSpec::plain(), NodeSpec::exit()]);
    let circuit_id = harness
        .node(0)
        .community
        .create_circuit(1, CircuitType::Data, CircuitOptions::default())
        .expect("create circuit");
    harness.pump();
    assert!(harness.nodes[0].community.circuits()[&circuit_id].is_ready());

    // A forged destroy from a stranger is refused even when the
    // signature itself is valid.
    let stranger = umbra_crypto::tunnel::NodeIdentity::generate();
    let signature = stranger.sign(&cell::destroy_signed_bytes(circuit_id, 0));
    let forged = cell::encode_cell(
        circuit_id,
        &CellBody::Destroy(cell::DestroyPayload {
            reason: 0,
            public_key: stranger.verifying_key().to_bytes(),
            signature: signature.to_bytes().to_vec(),
        }),
    )
    .expect("encode destroy");
    let bogus_source = std::net::SocketAddr::from(([10, 9, 9, 9], 9999));
    harness.node(0).community.on_packet(bogus_source, &forged);
    assert!(harness.nodes[0].community.circuits().contains_key(&circuit_id));

    // The exit tearing down announces a destroy that the initiator
    // accepts from its first hop.
    harness
        .node(1)
        .community
        .remove_exit_socket(circuit_id, "test teardown", true);
    harness.pump();
    assert!(!harness.nodes[0].community.circuits().contains_key(&circuit_id));
    assert_eq!(*harness.nodes[0].gateway.dead.lock().expect("lock"), vec![circuit_id]);
}

#[test]
fn circuit_is_removed_when_no_candidates_remain() {
    // Only three nodes: the extension candidate list collapses to peers
    // already in the circuit or ourselves.
    let mut harness = Harness::new(vec![NodeSpec::plain(), NodeSpec::exit(), NodeSpec::plain()]);
    let circuit_id = harness
        .node(0)
        .community
        .create_circuit(3, CircuitType::Data, CircuitOptions::default())
        .expect("create circuit");
    harness.pump();

    assert!(!harness.nodes[0].community.circuits().contains_key(&circuit_id));
}

#[test]
fn rendezvous_bridge_delivers_end_to_end() {
    // Initiators 0 and 2 both land on rendezvous point 1.
    let mut harness = Harness::new(vec![NodeSpec::plain(), NodeSpec::plain(), NodeSpec::plain()]);
    let rp_addr = harness.nodes[1].addr;
    let rp_pk = harness.nodes[1].public_key;
    let pin = || CircuitOptions {
        required_endpoint: Some(RequiredEndpoint {
            address: rp_addr,
            public_key: rp_pk,
        }),
        ..CircuitOptions::default()
    };

    let circuit_a = harness
        .node(0)
        .community
        .create_circuit(1, CircuitType::Rendezvous, pin())
        .expect("circuit a");
    let circuit_b = harness
        .node(2)
        .community
        .create_circuit(1, CircuitType::Rp, pin())
        .expect("circuit b");
    harness.pump();
    assert!(harness.nodes[0].community.circuits()[&circuit_a].is_ready());
    assert!(harness.nodes[2].community.circuits()[&circuit_b].is_ready());

    harness
        .node(1)
        .community
        .link_rendezvous(circuit_a, circuit_b)
        .expect("link rendezvous");

    // Both initiators share end-to-end session keys negotiated out of
    // band by the hidden-services layer.
    let e2e_secret = [9u8; 32];
    assert!(harness
        .node(0)
        .community
        .set_hs_session_keys(circuit_a, SessionKeys::derive(&e2e_secret)));
    assert!(harness
        .node(2)
        .community
        .set_hs_session_keys(circuit_b, SessionKeys::derive(&e2e_secret)));

    let destination = Address::V4(circuit_id_to_ip(circuit_b), CIRCUIT_ID_PORT);
    let payload = b"d1:q4:pinge".to_vec();
    harness
        .node(0)
        .community
        .tunnel_data_to_end(&destination, &payload, circuit_a);
    harness.pump();

    let received = harness.nodes[2].gateway.received.lock().expect("lock");
    assert_eq!(received.len(), 1);
    let (circuit, _origin, data, anon_seed) = &received[0];
    assert_eq!(*circuit, circuit_b);
    assert_eq!(data, &payload);
    // The RP side treats the stream as an anonymous seed.
    assert!(*anon_seed);
}

#[test]
fn rendezvous_circuit_is_selected_by_sentinel_address() {
    let mut harness = Harness::new(vec![NodeSpec::plain(), NodeSpec::plain()]);
    let endpoint = RequiredEndpoint {
        address: harness.nodes[1].addr,
        public_key: harness.nodes[1].public_key,
    };
    let circuit_id = harness
        .node(0)
        .community
        .create_circuit(
            1,
            CircuitType::Rendezvous,
            CircuitOptions {
                required_endpoint: Some(endpoint),
                ..CircuitOptions::default()
            },
        )
        .expect("create circuit");
    harness.pump();

    let destination = Address::V4(circuit_id_to_ip(circuit_id), CIRCUIT_ID_PORT);
    let community = &mut harness.nodes[0].community;
    assert_eq!(community.select_circuit(Some(&destination), None), Some(circuit_id));
    // Rendezvous circuits never serve plain data selection.
    assert_eq!(community.select_circuit(None, None), None);
}

#[test]
fn stats_crawl_requires_the_allow_list() {
    let mut harness = Harness::new(vec![NodeSpec::plain(), NodeSpec::plain()]);
    let peer = harness.nodes[1].addr;

    // Unauthorized crawl: the responder does not know this member id.
    let answer: Arc<Mutex<Option<umbra_wire::StatsMap>>> = Arc::default();
    let answer_clone = answer.clone();
    harness.node(0).community.do_stats(
        peer,
        Box::new(move |_peer, stats| {
            *answer_clone.lock().expect("lock") = Some(stats);
        }),
    );
    harness.pump();
    assert!(answer.lock().expect("lock").is_none());

    // Allow-list the crawler and ask again.
    let crawler_member = harness.nodes[0].community.identity().member_id();
    harness
        .node(1)
        .community
        .settings_mut()
        .crawler_member_ids
        .push(crawler_member);

    let answer_clone = answer.clone();
    harness.node(0).community.do_stats(
        peer,
        Box::new(move |_peer, stats| {
            *answer_clone.lock().expect("lock") = Some(stats);
        }),
    );
    harness.pump();
    let stats = answer.lock().expect("lock").clone().expect("stats response");
    // The responder has relayed our two signed cells at most; counters
    // are present even when zero.
    assert_eq!(stats.bytes_relay_up, 0);
}
