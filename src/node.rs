//! Node identifiers, the XOR distance metric, and peer references.

use std::fmt;
use std::net::SocketAddr;

use rand::Rng as _;
use sha1::{Digest, Sha1};

use crate::error::KadError;

/// A 160-bit identifier in the DHT key space.
///
/// Node ids and storage keys live in the same space; a key is simply the
/// SHA-1 digest of whatever the application names its value. The canonical
/// textual form is 40 lowercase hex characters. Lexicographic order on the
/// bytes is unsigned big-endian order on the 160-bit integer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub const MIN: NodeId = NodeId([0x00; 20]);
    pub const MAX: NodeId = NodeId([0xff; 20]);

    /// SHA-1 of arbitrary input; the routing key for stored values.
    pub fn digest(input: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(input);
        Self(hasher.finalize().into())
    }

    /// Generates an id by hashing cryptographically random bytes, giving a
    /// uniform distribution over the key space.
    pub fn random() -> Self {
        let mut seed = [0u8; 20];
        rand::rng().fill(&mut seed);
        Self::digest(&seed)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KadError> {
        if bytes.len() != 20 {
            return Err(KadError::InvalidNodeId);
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    /// Parses the canonical 40-character hex form.
    pub fn from_hex(s: &str) -> Result<Self, KadError> {
        if s.len() != 40 || !s.is_ascii() {
            return Err(KadError::InvalidNodeId);
        }
        let mut id = [0u8; 20];
        for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
            let hi = (chunk[0] as char)
                .to_digit(16)
                .ok_or(KadError::InvalidNodeId)?;
            let lo = (chunk[1] as char)
                .to_digit(16)
                .ok_or(KadError::InvalidNodeId)?;
            id[i] = (hi * 16 + lo) as u8;
        }
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut dist = [0u8; 20];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        Distance(dist)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// XOR distance between two ids, ordered as an unsigned 160-bit integer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance(pub [u8; 20]);

impl Distance {
    /// Number of leading zero bits, i.e. the length of the bit prefix the
    /// two ids share.
    pub fn leading_zeros(&self) -> usize {
        for (i, &byte) in self.0.iter().enumerate() {
            if byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        160
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

/// A known peer: id plus UDP address.
///
/// Routing equality is by id. Two nodes are *same-home* when their socket
/// addresses match, whatever their ids claim.
#[derive(Clone, Copy, Debug)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    /// True when `other` lives at the same host and port.
    pub fn same_home_as(&self, other: &Node) -> bool {
        self.addr == other.addr
    }

    pub fn distance_to(&self, target: &NodeId) -> Distance {
        self.id.distance(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_digest_deterministic() {
        let a = NodeId::digest(b"bandwidth-report-A");
        let b = NodeId::digest(b"bandwidth-report-A");
        assert_eq!(a, b);
        assert_eq!(a.as_bytes().len(), 20);
        assert_ne!(a, NodeId::digest(b"bandwidth-report-B"));
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(NodeId::random(), NodeId::random());
    }

    #[test]
    fn test_distance_symmetric_and_zero() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), Distance([0u8; 20]));
    }

    #[test]
    fn test_distance_ordering() {
        let zero = NodeId::MIN;
        let mut one = [0u8; 20];
        one[19] = 1;
        let mut two = [0u8; 20];
        two[19] = 2;
        let mut high = [0u8; 20];
        high[0] = 1;
        assert!(zero.distance(&NodeId(one)) < zero.distance(&NodeId(two)));
        assert!(zero.distance(&NodeId(two)) < zero.distance(&NodeId(high)));
    }

    #[test]
    fn test_leading_zeros() {
        assert_eq!(Distance([0u8; 20]).leading_zeros(), 160);
        let mut d = [0u8; 20];
        d[0] = 0x80;
        assert_eq!(Distance(d).leading_zeros(), 0);
        let mut d = [0u8; 20];
        d[1] = 0x10;
        assert_eq!(Distance(d).leading_zeros(), 11);
    }

    #[test]
    fn test_hex_round_trip() {
        let id = NodeId::random();
        let hex = id.to_string();
        assert_eq!(hex.len(), 40);
        assert_eq!(NodeId::from_hex(&hex).unwrap(), id);
        assert!(NodeId::from_hex("zz").is_err());
        assert!(NodeId::from_hex(&"g".repeat(40)).is_err());
    }

    #[test]
    fn test_same_home() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8468);
        let a = Node::new(NodeId::random(), addr);
        let b = Node::new(NodeId::random(), addr);
        assert!(a.same_home_as(&b));
        let c = Node::new(a.id, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8469));
        assert!(!a.same_home_as(&c));
    }
}
