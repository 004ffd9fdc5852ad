//! DHT routing table module
//!
//! Implements the Kademlia routing table: one k-bucket per bit of the key
//! space, each behind its own lock so that unrelated buckets can be updated
//! concurrently.

use crate::dht::node::{NodeId, PeerRecord, ID_BITS};
use crate::error::DhtError;
use async_trait::async_trait;
use std::cmp::Reverse;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Kademlia constant - default number of peers per bucket
pub const K: usize = 20;

/// Default time a least-recently-seen peer has to answer an eviction ping
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Liveness check used before evicting the oldest entry of a full bucket
#[async_trait]
pub trait Pinger: Send + Sync {
    /// Returns `true` if the peer answered
    async fn ping(&self, peer: &PeerRecord) -> bool;
}

/// What an insert did to the bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The peer was new and there was room
    Added,
    /// The peer was already known and moved to the most-recently-seen end
    Updated,
    /// The least-recently-seen peer did not answer and was replaced
    Replaced { evicted: PeerRecord },
    /// The peer is the local node
    Ignored,
}

/// A bucket in the routing table
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Peers, least-recently-seen first
    peers: Vec<PeerRecord>,
    /// Maximum number of peers
    capacity: usize,
    /// Position of this bucket in the table
    index: usize,
    /// When this bucket was last modified
    last_changed: Instant,
}

impl KBucket {
    /// Create a new KBucket; capacity is at least one
    pub fn new(index: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            peers: Vec::with_capacity(capacity),
            capacity,
            index,
            last_changed: Instant::now(),
        }
    }

    /// Add or refresh a peer.
    ///
    /// A full bucket pings its least-recently-seen entry; the new peer only
    /// gets in if that ping fails within `ping_timeout`.
    pub async fn insert(
        &mut self,
        peer: PeerRecord,
        pinger: &dyn Pinger,
        ping_timeout: Duration,
    ) -> Result<InsertOutcome, DhtError> {
        if let Some(pos) = self.position(&peer.id) {
            let mut existing = self.peers.remove(pos);
            existing.merge(peer);
            existing.touch();
            self.peers.push(existing);
            self.last_changed = Instant::now();
            return Ok(InsertOutcome::Updated);
        }

        if !self.is_full() {
            trace!("Bucket {}: adding {}", self.index, peer.id.short());
            self.peers.push(peer);
            self.last_changed = Instant::now();
            return Ok(InsertOutcome::Added);
        }

        let oldest = self.peers[0].clone();
        debug!(
            "Bucket {} full, pinging least-recently-seen {} before admitting {}",
            self.index,
            oldest.id.short(),
            peer.id.short()
        );
        let alive = tokio::time::timeout(ping_timeout, pinger.ping(&oldest))
            .await
            .unwrap_or(false);

        // The lock is held across the ping, so nothing else touched this bucket.
        let evicted = self.peers.remove(0);
        if alive {
            let mut refreshed = evicted;
            refreshed.touch();
            self.peers.push(refreshed);
            debug!("Bucket {}: {} still alive, discarding {}", self.index, oldest.id.short(), peer.id.short());
            return Err(DhtError::bucket_full_with_peer(self.index, peer.id.to_hex()));
        }

        debug!("Bucket {}: evicting unresponsive {}", self.index, evicted.id.short());
        self.peers.push(peer);
        self.last_changed = Instant::now();
        Ok(InsertOutcome::Replaced { evicted })
    }

    /// Remove a peer from the bucket
    pub fn remove(&mut self, id: &NodeId) -> Option<PeerRecord> {
        let pos = self.position(id)?;
        self.last_changed = Instant::now();
        Some(self.peers.remove(pos))
    }

    /// The `count` peers closest to `target`, ties broken by most recently seen
    pub fn nearest(&self, target: &NodeId, count: usize) -> Vec<PeerRecord> {
        let mut peers = self.peers.clone();
        sort_by_distance(&mut peers, target);
        peers.truncate(count);
        peers
    }

    /// Find a peer by ID
    pub fn get(&self, id: &NodeId) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| p.id == *id)
    }

    /// Peers, least-recently-seen first
    pub fn peers(&self) -> &[PeerRecord] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.capacity
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether the bucket went untouched for longer than `age`
    pub fn is_stale(&self, age: Duration) -> bool {
        self.last_changed.elapsed() > age
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.peers.iter().position(|p| p.id == *id)
    }
}

/// Sort by XOR distance to `target`, most recently seen first on ties
pub fn sort_by_distance(peers: &mut [PeerRecord], target: &NodeId) {
    peers.sort_by_key(|p| (p.id.distance(target), Reverse(p.last_seen)));
}

/// Routing table settings
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Bucket capacity
    pub k: usize,
    /// Eviction ping timeout
    pub ping_timeout: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            k: K,
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }
}

/// Kademlia routing table
pub struct RoutingTable {
    /// Our node ID
    local_id: NodeId,
    /// One bucket per bit of the key space
    buckets: Vec<Mutex<KBucket>>,
    config: RoutingConfig,
    pinger: std::sync::Arc<dyn Pinger>,
}

impl RoutingTable {
    /// Create a new routing table
    pub fn new(local_id: NodeId, mut config: RoutingConfig, pinger: std::sync::Arc<dyn Pinger>) -> Self {
        config.k = config.k.max(1);
        let buckets = (0..ID_BITS).map(|i| Mutex::new(KBucket::new(i, config.k))).collect();
        Self {
            local_id,
            buckets,
            config,
            pinger,
        }
    }

    /// Our node ID
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Bucket capacity
    pub fn k(&self) -> usize {
        self.config.k
    }

    /// Bucket a peer with this id belongs to, `None` for the local id
    pub fn bucket_of(&self, id: &NodeId) -> Option<usize> {
        self.local_id.bucket_index(id)
    }

    /// Insert or refresh a peer
    pub async fn update(&self, peer: PeerRecord) -> Result<InsertOutcome, DhtError> {
        let Some(index) = self.bucket_of(&peer.id) else {
            return Ok(InsertOutcome::Ignored);
        };
        let mut bucket = self.buckets[index].lock().await;
        bucket.insert(peer, self.pinger.as_ref(), self.config.ping_timeout).await
    }

    /// Remove a peer from the routing table
    pub async fn remove_peer(&self, id: &NodeId) -> Option<PeerRecord> {
        let index = self.bucket_of(id)?;
        self.buckets[index].lock().await.remove(id)
    }

    /// Find a peer by ID
    pub async fn get(&self, id: &NodeId) -> Option<PeerRecord> {
        let index = self.bucket_of(id)?;
        self.buckets[index].lock().await.get(id).cloned()
    }

    /// The `count` known peers closest to `target`.
    ///
    /// Visits the bucket `target` falls into first, then every lower bucket,
    /// then higher buckets one at a time, stopping once enough candidates are
    /// collected. Each step only reaches peers at least as far from `target`
    /// as everything gathered before it, so stopping early is exact.
    pub async fn find_closest(&self, target: &NodeId, count: usize) -> Vec<PeerRecord> {
        if count == 0 {
            return Vec::new();
        }

        let mut groups: Vec<Vec<usize>> = Vec::with_capacity(ID_BITS);
        match self.bucket_of(target) {
            Some(start) => {
                groups.push(vec![start]);
                if start > 0 {
                    groups.push((0..start).rev().collect());
                }
                groups.extend((start + 1..ID_BITS).map(|i| vec![i]));
            }
            None => groups.extend((0..ID_BITS).map(|i| vec![i])),
        }

        let mut candidates = Vec::with_capacity(count);
        for group in groups {
            for index in group {
                let bucket = self.buckets[index].lock().await;
                candidates.extend(bucket.nearest(target, count));
            }
            if candidates.len() >= count {
                break;
            }
        }

        sort_by_distance(&mut candidates, target);
        candidates.truncate(count);
        candidates
    }

    /// Snapshot of one bucket
    pub async fn bucket_peers(&self, index: usize) -> Vec<PeerRecord> {
        match self.buckets.get(index) {
            Some(bucket) => bucket.lock().await.peers().to_vec(),
            None => Vec::new(),
        }
    }

    /// Get all peers in the routing table
    pub async fn peers(&self) -> Vec<PeerRecord> {
        let mut all = Vec::new();
        for bucket in &self.buckets {
            all.extend(bucket.lock().await.peers().iter().cloned());
        }
        all
    }

    /// Get the number of peers in the routing table
    pub async fn len(&self) -> usize {
        let mut total = 0;
        for bucket in &self.buckets {
            total += bucket.lock().await.len();
        }
        total
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Non-empty buckets that have not changed for longer than `age`
    pub async fn stale_buckets(&self, age: Duration) -> Vec<usize> {
        let mut stale = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.lock().await;
            if !bucket.is_empty() && bucket.is_stale(age) {
                stale.push(bucket.index());
            }
        }
        stale
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("local_id", &self.local_id)
            .field("k", &self.config.k)
            .finish_non_exhaustive()
    }
}
