//! Exit sockets: egress and ingress of user datagrams at the last hop.
//!
//! An exit socket is created latent when a node accepts a `create`, and
//! binds an ephemeral UDP port only on the first outbound datagram.
//! Datagrams arriving from the Internet are pushed onto the community's
//! event queue by a per-socket reader task.
//!
//! Each socket keeps a small per-destination-IP counter that trips once
//! too many packets go out without a single reply; `-1` marks a
//! destination that has replied and is uncapped thereafter.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use umbra_wire::data::is_allowed;
use umbra_wire::Address;

/// A datagram received from the public Internet on an exit socket,
/// delivered to the community's event loop.
#[derive(Debug)]
pub struct ExitDatagram {
    pub circuit_id: u32,
    pub source: SocketAddr,
    pub data: Vec<u8>,
}

/// Abuse-counter verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitDecision {
    Allow,
    /// Too many packets to this destination without a reply; the socket
    /// must be destroyed.
    Exceeded,
}

/// Outcome of one egress attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Datagram sent; carries the byte count for accounting.
    Sent(usize),
    /// The abuse counter tripped; the socket must be destroyed.
    AbuseTripped,
    /// Dropped without state change (whitelist, resolution or I/O).
    Dropped,
}

/// The exit endpoint of one circuit.
pub struct ExitSocket {
    pub circuit_id: u32,
    /// The previous hop on this circuit; datagrams from the Internet are
    /// tunnelled back through it.
    pub origin: SocketAddr,
    /// Member id of the previous hop, when known. Kept for audit.
    pub member_id: Option<[u8; 32]>,
    pub creation_time: Instant,
    pub bytes_up: u64,
    pub bytes_down: u64,
    ips: HashMap<IpAddr, i64>,
    socket: Option<Arc<UdpSocket>>,
    reader: Option<JoinHandle<()>>,
}

impl ExitSocket {
    pub fn new(circuit_id: u32, origin: SocketAddr, member_id: Option<[u8; 32]>) -> Self {
        Self {
            circuit_id,
            origin,
            member_id,
            creation_time: Instant::now(),
            bytes_up: 0,
            bytes_down: 0,
            ips: HashMap::new(),
            socket: None,
            reader: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.socket.is_some()
    }

    /// Bind the ephemeral UDP port and start the reader task. Idempotent.
    pub fn enable(&mut self, events: UnboundedSender<ExitDatagram>) -> io::Result<()> {
        if self.enabled() {
            return Ok(());
        }
        let std_socket = std::net::UdpSocket::bind(("0.0.0.0", 0))?;
        std_socket.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);

        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| io::Error::other("exit sockets require a tokio runtime"))?;
        let reader = handle.spawn(Self::read_loop(socket.clone(), self.circuit_id, events));

        debug!(
            circuit_id = self.circuit_id,
            port = socket.local_addr().map(|a| a.port()).unwrap_or(0),
            "enabled exit socket"
        );
        self.socket = Some(socket);
        self.reader = Some(reader);
        Ok(())
    }

    async fn read_loop(
        socket: Arc<UdpSocket>,
        circuit_id: u32,
        events: UnboundedSender<ExitDatagram>,
    ) {
        let mut buf = vec![0u8; 65535];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, source)) => {
                    let datagram = ExitDatagram {
                        circuit_id,
                        source,
                        data: buf[..len].to_vec(),
                    };
                    if events.send(datagram).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(circuit_id, "exit socket read failed: {e}");
                    break;
                }
            }
        }
    }

    /// The bound UDP port, once enabled.
    pub fn local_port(&self) -> Option<u16> {
        self.socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
    }

    /// Stop listening and drop the socket.
    pub fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.socket = None;
    }

    /// The per-destination abuse counter. A destination that has replied
    /// once (`-1`) is uncapped; otherwise outbound packets count up and
    /// trip at the threshold (one higher on the inbound side).
    pub fn check_num_packets(&mut self, ip: IpAddr, incoming: bool, max: u32) -> ExitDecision {
        let counter = self.ips.entry(ip).or_insert(0);
        if *counter < 0 {
            return ExitDecision::Allow;
        }
        let limit = if incoming {
            i64::from(max) + 1
        } else {
            i64::from(max)
        };
        if *counter >= limit {
            return ExitDecision::Exceeded;
        }
        if incoming {
            *counter = -1;
        } else {
            *counter += 1;
        }
        ExitDecision::Allow
    }

    /// Send one datagram to the public Internet: resolve the destination,
    /// apply the abuse counter and the payload whitelist, then write.
    pub fn send_to(&mut self, data: &[u8], destination: &Address, max: u32) -> SendOutcome {
        let resolved = match resolve(destination) {
            Some(addr) => addr,
            None => {
                error!(
                    circuit_id = self.circuit_id,
                    "cannot resolve exit destination {destination}"
                );
                return SendOutcome::Dropped;
            }
        };

        if self.check_num_packets(resolved.ip(), false, max) == ExitDecision::Exceeded {
            return SendOutcome::AbuseTripped;
        }

        if !is_allowed(data) {
            error!(
                circuit_id = self.circuit_id,
                "dropping forbidden packet from exit socket"
            );
            return SendOutcome::Dropped;
        }

        let Some(socket) = self.socket.as_ref() else {
            error!(circuit_id = self.circuit_id, "exit socket not enabled");
            return SendOutcome::Dropped;
        };
        match socket.try_send_to(data, resolved) {
            Ok(sent) => SendOutcome::Sent(sent),
            Err(e) => {
                error!(
                    circuit_id = self.circuit_id,
                    "failed to write to exit transport: {e}"
                );
                SendOutcome::Dropped
            }
        }
    }
}

/// Resolve an address, blocking on DNS for hostnames. Best effort; a
/// failure drops this packet only.
fn resolve(destination: &Address) -> Option<SocketAddr> {
    match destination {
        Address::V4(ip, port) => Some(SocketAddr::new(IpAddr::V4(*ip), *port)),
        Address::Domain(host, port) => (host.as_str(), *port)
            .to_socket_addrs()
            .ok()?
            .find(|a| a.is_ipv4()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_socket() -> ExitSocket {
        ExitSocket::new(7, "127.0.0.1:4000".parse().expect("addr"), None)
    }

    #[test]
    fn test_counter_trips_at_threshold() {
        let mut exit = make_socket();
        let ip: IpAddr = "198.51.100.7".parse().expect("ip");

        for _ in 0..50 {
            assert_eq!(exit.check_num_packets(ip, false, 50), ExitDecision::Allow);
        }
        // The 51st outbound packet trips the counter.
        assert_eq!(exit.check_num_packets(ip, false, 50), ExitDecision::Exceeded);
    }

    #[test]
    fn test_reply_uncaps_destination() {
        let mut exit = make_socket();
        let ip: IpAddr = "198.51.100.7".parse().expect("ip");

        for _ in 0..10 {
            assert_eq!(exit.check_num_packets(ip, false, 50), ExitDecision::Allow);
        }
        // One reply sets the sentinel.
        assert_eq!(exit.check_num_packets(ip, true, 50), ExitDecision::Allow);
        for _ in 0..1000 {
            assert_eq!(exit.check_num_packets(ip, false, 50), ExitDecision::Allow);
        }
    }

    #[test]
    fn test_incoming_threshold_is_one_higher() {
        let mut exit = make_socket();
        let ip: IpAddr = "198.51.100.7".parse().expect("ip");

        for _ in 0..50 {
            exit.check_num_packets(ip, false, 50);
        }
        // Outbound is exhausted, but one more inbound still passes (and
        // uncaps).
        assert_eq!(exit.check_num_packets(ip, true, 50), ExitDecision::Allow);
        assert_eq!(exit.check_num_packets(ip, false, 50), ExitDecision::Allow);
    }

    #[test]
    fn test_counters_are_per_destination() {
        let mut exit = make_socket();
        let a: IpAddr = "198.51.100.7".parse().expect("ip");
        let b: IpAddr = "198.51.100.8".parse().expect("ip");

        for _ in 0..50 {
            exit.check_num_packets(a, false, 50);
        }
        assert_eq!(exit.check_num_packets(a, false, 50), ExitDecision::Exceeded);
        assert_eq!(exit.check_num_packets(b, false, 50), ExitDecision::Allow);
    }

    #[test]
    fn test_resolve_literal() {
        let addr = resolve(&Address::V4("10.0.0.1".parse().expect("ip"), 80));
        assert_eq!(addr, Some("10.0.0.1:80".parse().expect("addr")));
    }

    #[tokio::test]
    async fn test_enable_close_lifecycle() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut exit = make_socket();
        assert!(!exit.enabled());

        exit.enable(tx).expect("enable");
        assert!(exit.enabled());
        assert!(exit.local_port().is_some());

        exit.close();
        assert!(!exit.enabled());
    }
}
