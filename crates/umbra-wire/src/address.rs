//! Destination/origin addresses carried inside data frames.
//!
//! The null address `0.0.0.0:0` is a sentinel: "from me" on outbound frames
//! at the initiator, "to me" on frames travelling back to it.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use serde::{Deserialize, Serialize};

use crate::{Result, WireError};

const TAG_V4: u8 = 0x01;
const TAG_DOMAIN: u8 = 0x02;

/// A datagram endpoint: either a literal IPv4 socket address or a hostname
/// still to be resolved at the exit.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Address {
    V4(Ipv4Addr, u16),
    Domain(String, u16),
}

impl Address {
    /// The `0.0.0.0:0` sentinel.
    pub const NULL: Address = Address::V4(Ipv4Addr::UNSPECIFIED, 0);

    pub fn is_null(&self) -> bool {
        *self == Address::NULL
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::V4(_, port) | Address::Domain(_, port) => *port,
        }
    }

    /// Append the wire encoding to `buf`.
    pub fn write(&self, buf: &mut Vec<u8>) {
        match self {
            Address::V4(ip, port) => {
                buf.push(TAG_V4);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::Domain(host, port) => {
                buf.push(TAG_DOMAIN);
                let host = &host.as_bytes()[..host.len().min(255)];
                buf.push(host.len() as u8);
                buf.extend_from_slice(host);
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
    }

    /// Parse one address from the front of `buf`, returning it and the
    /// number of bytes consumed.
    pub fn read(buf: &[u8]) -> Result<(Address, usize)> {
        let short = || WireError::InvalidFrame("truncated address".into());
        match *buf.first().ok_or_else(short)? {
            TAG_V4 => {
                let octets: [u8; 4] = buf.get(1..5).and_then(|s| s.try_into().ok()).ok_or_else(short)?;
                let port: [u8; 2] = buf.get(5..7).and_then(|s| s.try_into().ok()).ok_or_else(short)?;
                Ok((
                    Address::V4(Ipv4Addr::from(octets), u16::from_be_bytes(port)),
                    7,
                ))
            }
            TAG_DOMAIN => {
                let len = *buf.get(1).ok_or_else(short)? as usize;
                let host = buf.get(2..2 + len).ok_or_else(short)?;
                let host = std::str::from_utf8(host)
                    .map_err(|_| WireError::InvalidFrame("non-UTF8 hostname".into()))?;
                let port: [u8; 2] = buf
                    .get(2 + len..4 + len)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(short)?;
                Ok((
                    Address::Domain(host.to_string(), u16::from_be_bytes(port)),
                    4 + len,
                ))
            }
            tag => Err(WireError::InvalidFrame(format!("unknown address tag {tag}"))),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::V4(*v4.ip(), v4.port()),
            // The overlay is IPv4-only; mapped V6 addresses are unwrapped.
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(ip) => Address::V4(ip, v6.port()),
                None => Address::V4(Ipv4Addr::UNSPECIFIED, v6.port()),
            },
        }
    }
}

impl TryFrom<&Address> for SocketAddr {
    type Error = WireError;

    fn try_from(addr: &Address) -> Result<SocketAddr> {
        match addr {
            Address::V4(ip, port) => Ok(SocketAddr::V4(SocketAddrV4::new(*ip, *port))),
            Address::Domain(host, _) => Err(WireError::InvalidFrame(format!(
                "unresolved hostname {host}"
            ))),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::V4(ip, port) => write!(f, "{ip}:{port}"),
            Address::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}
