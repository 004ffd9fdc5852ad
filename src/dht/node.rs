//! DHT node module
//!
//! Identifiers, the XOR metric, and the record kept for every known peer.

use crate::error::DhtError;
use crate::transport::{Multiaddr, MultiaddrExt};
use libp2p_identity::PeerId;
use multihash::Multihash;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Instant;

/// Width of the key space in bytes
pub const ID_LEN: usize = 32;

/// Width of the key space in bits
pub const ID_BITS: usize = ID_LEN * 8;

/// Multihash code for a digest stored as-is
const IDENTITY_CODE: u64 = 0x00;

/// DHT node identifier (256 bits)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; ID_LEN]);

impl NodeId {
    /// Create a new NodeId from bytes
    pub fn new(id: [u8; ID_LEN]) -> Self {
        Self(id)
    }

    /// Generate a random NodeId
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Build a NodeId from a slice, which must be exactly [`ID_LEN`] bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DhtError> {
        let id: [u8; ID_LEN] = bytes.try_into().map_err(|_| {
            DhtError::invalid_identifier(format!("expected {} bytes, got {}", ID_LEN, bytes.len()))
        })?;
        Ok(Self(id))
    }

    /// Parse a NodeId from a hex string
    pub fn from_hex(hex_str: &str) -> Result<Self, DhtError> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| DhtError::invalid_identifier_with_source("malformed hex node id", e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Get the NodeId as bytes
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Get the NodeId as a hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The libp2p peer id inlining this identifier, as used in `/p2p/`
    pub fn to_peer_id(&self) -> Result<PeerId, DhtError> {
        let hash = Multihash::<64>::wrap(IDENTITY_CODE, &self.0)
            .map_err(|e| DhtError::invalid_identifier_with_source("cannot wrap node id", e.to_string()))?;
        PeerId::from_multihash(hash).map_err(|_| DhtError::invalid_identifier("node id does not form a peer id"))
    }

    /// Recover the identifier from a peer id built by [`NodeId::to_peer_id`]
    pub fn from_peer_id(peer: &PeerId) -> Result<Self, DhtError> {
        let hash = Multihash::<64>::from_bytes(&peer.to_bytes())
            .map_err(|e| DhtError::invalid_identifier_with_source("malformed peer id", e.to_string()))?;
        if hash.code() != IDENTITY_CODE {
            return Err(DhtError::invalid_identifier_with_source(
                "peer id does not inline a node id",
                peer.to_base58(),
            ));
        }
        Self::from_slice(hash.digest())
    }

    /// Base58 peer id, the form printed for users
    pub fn to_base58(&self) -> Result<String, DhtError> {
        Ok(self.to_peer_id()?.to_base58())
    }

    /// XOR distance to another identifier
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut distance = [0u8; ID_LEN];
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(distance)
    }

    /// Index of the bucket `other` belongs to, seen from `self`.
    ///
    /// `None` when both identifiers are equal.
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        self.distance(other).highest_bit()
    }

    /// A random identifier whose distance to `self` lands in bucket `index`
    pub fn random_in_bucket(&self, index: usize) -> NodeId {
        debug_assert!(index < ID_BITS);
        let mut distance: [u8; ID_LEN] = rand::random();

        // Big-endian: bit `index` lives in byte ID_LEN - 1 - index / 8.
        let byte = ID_LEN - 1 - index / 8;
        let bit = index % 8;
        for b in distance.iter_mut().take(byte) {
            *b = 0;
        }
        let keep_below = (1u8 << bit).wrapping_sub(1);
        distance[byte] = (distance[byte] & keep_below) | (1u8 << bit);

        let mut id = self.0;
        for (i, b) in id.iter_mut().enumerate() {
            *b ^= distance[i];
        }
        NodeId(id)
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// XOR distance between two identifiers, ordered as a big-endian integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance(pub [u8; ID_LEN]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; ID_LEN]);

    /// Position of the highest set bit, counted from the least significant bit
    pub fn highest_bit(&self) -> Option<usize> {
        self.0.iter().enumerate().find(|(_, b)| **b != 0).map(|(i, b)| {
            let bit_in_byte = 7 - b.leading_zeros() as usize;
            (ID_LEN - 1 - i) * 8 + bit_in_byte
        })
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

/// Free-function form of [`NodeId::distance`]
pub fn distance(a: &NodeId, b: &NodeId) -> Distance {
    a.distance(b)
}

/// Free-function form of [`NodeId::bucket_index`]
pub fn bucket_index(local: &NodeId, other: &NodeId) -> Option<usize> {
    local.bucket_index(other)
}

/// Represents a known peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Node identifier
    pub id: NodeId,
    /// Addresses the peer can be dialled on
    pub addrs: BTreeSet<Multiaddr>,
    /// When the peer was last heard from
    pub last_seen: Instant,
}

impl PeerRecord {
    /// Create a new record, stripping any `/p2p/` suffix from the addresses
    pub fn new(id: NodeId, addrs: impl IntoIterator<Item = Multiaddr>) -> Self {
        Self {
            id,
            addrs: addrs.into_iter().map(|a| a.without_p2p()).collect(),
            last_seen: Instant::now(),
        }
    }

    /// Create a record with a single address
    pub fn with_addr(id: NodeId, addr: Multiaddr) -> Self {
        Self::new(id, std::iter::once(addr))
    }

    /// Update last seen timestamp
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Fold a fresher sighting of the same peer into this record
    pub fn merge(&mut self, other: PeerRecord) {
        debug_assert_eq!(self.id, other.id);
        self.addrs.extend(other.addrs);
        self.last_seen = self.last_seen.max(other.last_seen);
    }

    /// First address, used when dialling
    pub fn primary_addr(&self) -> Option<&Multiaddr> {
        self.addrs.iter().next()
    }
}

impl PartialEq for PeerRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerRecord {}

impl std::hash::Hash for PeerRecord {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_last_byte(b: u8) -> NodeId {
        let mut id = [0u8; ID_LEN];
        id[ID_LEN - 1] = b;
        NodeId::new(id)
    }

    #[test]
    fn test_node_id_random() {
        assert_ne!(NodeId::random(), NodeId::random());
    }

    #[test]
    fn test_node_id_hex() {
        let node_id = NodeId::new([0xABu8; ID_LEN]);
        let hex_str = node_id.to_hex();
        assert_eq!(hex_str.len(), ID_LEN * 2);
        assert_eq!(NodeId::from_hex(&hex_str).unwrap(), node_id);
    }

    #[test]
    fn test_from_slice_rejects_wrong_width() {
        let err = NodeId::from_slice(&[0u8; 20]).unwrap_err();
        assert!(matches!(err, DhtError::InvalidIdentifier { .. }));
        assert!(NodeId::from_hex(&"ab".repeat(20)).is_err());
        assert!(NodeId::from_hex("zz").is_err());
    }

    #[test]
    fn test_distance_symmetric_and_zero_on_self() {
        for _ in 0..64 {
            let a = NodeId::random();
            let b = NodeId::random();
            assert_eq!(distance(&a, &b), distance(&b, &a));
            assert!(distance(&a, &a).is_zero());
        }
    }

    #[test]
    fn test_distance_orders_as_integer() {
        let zero = NodeId::new([0u8; ID_LEN]);
        let near = id_with_last_byte(0xFF);
        let mut far_bytes = [0u8; ID_LEN];
        far_bytes[0] = 0x01;
        let far = NodeId::new(far_bytes);
        assert!(zero.distance(&near) < zero.distance(&far));
    }

    #[test]
    fn test_bucket_index() {
        let zero = NodeId::new([0u8; ID_LEN]);
        assert_eq!(zero.bucket_index(&zero), None);
        assert_eq!(zero.bucket_index(&id_with_last_byte(1)), Some(0));
        assert_eq!(zero.bucket_index(&id_with_last_byte(0x80)), Some(7));

        let mut top = [0u8; ID_LEN];
        top[0] = 0x80;
        assert_eq!(zero.bucket_index(&NodeId::new(top)), Some(ID_BITS - 1));
    }

    #[test]
    fn test_random_in_bucket() {
        let local = NodeId::random();
        for index in [0, 1, 7, 8, 100, 254, 255] {
            for _ in 0..16 {
                let id = local.random_in_bucket(index);
                assert_eq!(local.bucket_index(&id), Some(index));
            }
        }
    }

    #[test]
    fn test_peer_id_round_trip() {
        let id = NodeId::random();
        let peer = id.to_peer_id().unwrap();
        assert_eq!(NodeId::from_peer_id(&peer).unwrap(), id);
        assert_eq!(id.to_base58().unwrap(), peer.to_base58());
        assert_eq!(peer.to_base58().parse::<PeerId>().unwrap(), peer);
    }

    #[test]
    fn test_peer_record_strips_p2p() {
        let id = NodeId::random();
        let addr = "/ip4/127.0.0.1/tcp/4001".parse::<Multiaddr>().unwrap().with_node_id(id).unwrap();
        let record = PeerRecord::with_addr(id, addr);
        assert_eq!(record.primary_addr().unwrap().to_string(), "/ip4/127.0.0.1/tcp/4001");
    }

    #[test]
    fn test_peer_record_merge() {
        let id = NodeId::random();
        let mut a = PeerRecord::with_addr(id, "/ip4/10.0.0.1/tcp/1".parse().unwrap());
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = PeerRecord::with_addr(id, "/ip4/10.0.0.2/tcp/1".parse().unwrap());
        let newer = b.last_seen;
        a.merge(b);
        assert_eq!(a.addrs.len(), 2);
        assert_eq!(a.last_seen, newer);
    }
}
