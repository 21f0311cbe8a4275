use std::fmt;
use std::net::IpAddr;

use crate::packet::TcpSegment;

/// One side of a TCP connection.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

/// Normalized connection key (lower IP/port first for consistent lookup).
///
/// Both directions of a connection map to the same key, so it can be used
/// directly as the session cache key.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct ConnectionKey {
    a: Endpoint,
    b: Endpoint,
}

impl ConnectionKey {
    /// Create a normalized connection key.
    /// Ensures (ip_a, port_a) <= (ip_b, port_b) lexicographically.
    pub fn new(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> Self {
        let src = Endpoint::new(src_ip, src_port);
        let dst = Endpoint::new(dst_ip, dst_port);
        if src <= dst {
            Self { a: src, b: dst }
        } else {
            Self { a: dst, b: src }
        }
    }

    /// Key for the connection a segment belongs to.
    pub fn from_segment(segment: &TcpSegment<'_>) -> Self {
        Self::new(
            segment.src_ip,
            segment.src_port,
            segment.dst_ip,
            segment.dst_port,
        )
    }

    /// The two endpoints, lower first.
    pub fn endpoints(&self) -> (Endpoint, Endpoint) {
        (self.a, self.b)
    }

    /// Whether the endpoint is one side of this connection.
    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.a == *endpoint || self.b == *endpoint
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.a, self.b)
    }
}

/// Which side of a connection sent a segment.
///
/// The initiator is the endpoint that sent the first SYN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Initiator,
    Responder,
}

impl Direction {
    /// The opposite direction.
    pub fn peer(self) -> Self {
        match self {
            Direction::Initiator => Direction::Responder,
            Direction::Responder => Direction::Initiator,
        }
    }

    /// Slot index for per-direction arrays.
    pub fn index(self) -> usize {
        match self {
            Direction::Initiator => 0,
            Direction::Responder => 1,
        }
    }

    /// Return a string representation of the direction.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Initiator => "initiator",
            Direction::Responder => "responder",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    // Test 1: Connection key normalization
    #[test]
    fn test_connection_key_normalization() {
        let key1 = ConnectionKey::new(ip(192, 168, 1, 1), 54321, ip(192, 168, 1, 2), 80);
        let key2 = ConnectionKey::new(ip(192, 168, 1, 2), 80, ip(192, 168, 1, 1), 54321);
        assert_eq!(key1, key2);

        let mut set = std::collections::HashSet::new();
        set.insert(key1);
        assert!(set.contains(&key2));
    }

    // Test 2: Same addresses, different ports are different connections
    #[test]
    fn test_connection_key_distinct_ports() {
        let key1 = ConnectionKey::new(ip(10, 0, 0, 1), 40000, ip(10, 0, 0, 2), 443);
        let key2 = ConnectionKey::new(ip(10, 0, 0, 1), 40001, ip(10, 0, 0, 2), 443);
        assert_ne!(key1, key2);
    }

    // Test 3: Key from a parsed segment
    #[test]
    fn test_connection_key_from_segment() {
        let segment = TcpSegment {
            src_ip: ip(10, 0, 0, 2),
            src_port: 443,
            dst_ip: ip(10, 0, 0, 1),
            dst_port: 40000,
            seq: 1,
            ack: 1,
            flags: Default::default(),
            tsval: None,
            payload: &[],
        };
        let key = ConnectionKey::from_segment(&segment);
        assert_eq!(
            key,
            ConnectionKey::new(ip(10, 0, 0, 1), 40000, ip(10, 0, 0, 2), 443)
        );
        assert!(key.contains(&Endpoint::new(ip(10, 0, 0, 2), 443)));
        assert!(!key.contains(&Endpoint::new(ip(10, 0, 0, 2), 80)));
    }

    // Test 4: Direction helpers
    #[test]
    fn test_direction_peer_and_index() {
        assert_eq!(Direction::Initiator.peer(), Direction::Responder);
        assert_eq!(Direction::Responder.peer(), Direction::Initiator);
        assert_eq!(Direction::Initiator.index(), 0);
        assert_eq!(Direction::Responder.index(), 1);
        assert_eq!(Direction::Responder.as_str(), "responder");
    }

    // Test 5: Endpoint display
    #[test]
    fn test_endpoint_display() {
        let endpoint = Endpoint::new(ip(192, 168, 1, 1), 8443);
        assert_eq!(endpoint.to_string(), "192.168.1.1:8443");
    }
}
