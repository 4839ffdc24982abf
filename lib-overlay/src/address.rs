//! Transport addresses
//!
//! A thin wrapper over `SocketAddr` with a canonical ordering and a
//! compact wire encoding. Ordering is (family, address bytes, port) so
//! IPv4 and IPv6 addresses never interleave and the order is stable
//! across hosts.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddr(pub SocketAddr);

impl NodeAddr {
    /// Wire encoding: `family(1) | port(2 LE) | address bytes`
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self.0.ip() {
            IpAddr::V4(ip) => {
                out.push(4);
                out.extend_from_slice(&self.0.port().to_le_bytes());
                out.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                out.push(6);
                out.extend_from_slice(&self.0.port().to_le_bytes());
                out.extend_from_slice(&ip.octets());
            }
        }
    }

    /// Decode one address, returning it and the bytes consumed
    pub fn decode(input: &[u8]) -> Option<(Self, usize)> {
        let family = *input.first()?;
        match family {
            4 => {
                if input.len() < 7 {
                    return None;
                }
                let port = u16::from_le_bytes([input[1], input[2]]);
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&input[3..7]);
                Some((NodeAddr(SocketAddr::new(Ipv4Addr::from(octets).into(), port)), 7))
            }
            6 => {
                if input.len() < 19 {
                    return None;
                }
                let port = u16::from_le_bytes([input[1], input[2]]);
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&input[3..19]);
                Some((NodeAddr(SocketAddr::new(Ipv6Addr::from(octets).into(), port)), 19))
            }
            _ => None,
        }
    }

    fn sort_key(&self) -> (u8, Vec<u8>, u16) {
        match self.0.ip() {
            IpAddr::V4(ip) => (4, ip.octets().to_vec(), self.0.port()),
            IpAddr::V6(ip) => (6, ip.octets().to_vec(), self.0.port()),
        }
    }
}

impl Ord for NodeAddr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for NodeAddr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SocketAddr> for NodeAddr {
    fn from(addr: SocketAddr) -> Self {
        NodeAddr(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_v4() {
        let addr = NodeAddr("127.0.0.1:8080".parse().unwrap());
        let mut buf = Vec::new();
        addr.encode(&mut buf);
        let (decoded, used) = NodeAddr::decode(&buf).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(used, buf.len());
    }

    #[test]
    fn test_encode_decode_v6() {
        let addr = NodeAddr("[::1]:443".parse().unwrap());
        let mut buf = Vec::new();
        addr.encode(&mut buf);
        let (decoded, used) = NodeAddr::decode(&buf).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(used, buf.len());
    }

    #[test]
    fn test_family_orders_first() {
        let v4 = NodeAddr("255.255.255.255:1".parse().unwrap());
        let v6 = NodeAddr("[::1]:1".parse().unwrap());
        assert!(v4 < v6);
    }

    #[test]
    fn test_truncated_rejected() {
        let addr = NodeAddr("10.0.0.1:9000".parse().unwrap());
        let mut buf = Vec::new();
        addr.encode(&mut buf);
        assert!(NodeAddr::decode(&buf[..buf.len() - 1]).is_none());
    }
}
