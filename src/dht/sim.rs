//! In-memory network for exercising lookups and bootstrap without sockets

use crate::dht::node::{NodeId, PeerRecord};
use crate::dht::routing::{sort_by_distance, Pinger};
use crate::dht::rpc::{DhtRpc, Identified};
use crate::error::DhtError;
use crate::transport::{Multiaddr, MultiaddrExt};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// How a simulated peer behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Online,
    /// Refuses every connection
    Offline,
    /// Accepts but never answers
    Hanging,
    /// Answers identify with an unusable peer id
    Misbehaving,
}

struct SimPeer {
    record: PeerRecord,
    neighbours: Vec<PeerRecord>,
    behaviour: Behaviour,
}

/// A fixed topology of peers answering identify, find_node and ping
#[derive(Default)]
pub struct SimNetwork {
    peers: HashMap<NodeId, SimPeer>,
    by_addr: HashMap<Multiaddr, NodeId>,
    /// Every dial attempt, by address
    identify_attempts: Mutex<HashMap<Multiaddr, usize>>,
    /// Every peer asked for nodes
    queried: Mutex<Vec<NodeId>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer; returns its record
    pub fn add(&mut self, index: u16, behaviour: Behaviour) -> PeerRecord {
        self.add_with_id(NodeId::random(), index, behaviour)
    }

    pub fn add_with_id(&mut self, id: NodeId, index: u16, behaviour: Behaviour) -> PeerRecord {
        let addr: Multiaddr = format!("/ip4/10.0.{}.{}/tcp/4001", index / 256, index % 256)
            .parse()
            .unwrap();
        let record = PeerRecord::with_addr(id, addr.clone());
        self.by_addr.insert(addr, id);
        self.peers.insert(
            id,
            SimPeer {
                record: record.clone(),
                neighbours: Vec::new(),
                behaviour,
            },
        );
        record
    }

    /// Make `from` know about `to`
    pub fn link(&mut self, from: &NodeId, to: &PeerRecord) {
        if let Some(peer) = self.peers.get_mut(from) {
            peer.neighbours.push(to.clone());
        }
    }

    /// Make every peer know every other peer
    pub fn link_all(&mut self) {
        let records: Vec<_> = self.peers.values().map(|p| p.record.clone()).collect();
        for peer in self.peers.values_mut() {
            peer.neighbours = records.iter().filter(|r| r.id != peer.record.id).cloned().collect();
        }
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.peers.keys().copied().collect()
    }

    pub fn identify_attempts(&self, addr: &Multiaddr) -> usize {
        self.identify_attempts.lock().unwrap().get(addr).copied().unwrap_or(0)
    }

    pub fn queried(&self) -> Vec<NodeId> {
        self.queried.lock().unwrap().clone()
    }

    pub fn queried_set(&self) -> HashSet<NodeId> {
        self.queried().into_iter().collect()
    }

    async fn reach(&self, id: &NodeId) -> Result<&SimPeer> {
        let peer = self
            .peers
            .get(id)
            .ok_or_else(|| DhtError::connection_error_with_address("No route", id.to_hex()))?;
        match peer.behaviour {
            Behaviour::Online => Ok(peer),
            Behaviour::Offline => Err(DhtError::connection_error_with_address("Connection refused", id.to_hex()).into()),
            Behaviour::Hanging => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(DhtError::connection_error("Hung up").into())
            }
            Behaviour::Misbehaving => Err(DhtError::invalid_identifier("expected 32 bytes, got 20").into()),
        }
    }
}

#[async_trait]
impl DhtRpc for SimNetwork {
    async fn identify(&self, addr: &Multiaddr) -> Result<Identified> {
        let addr = addr.without_p2p();
        *self.identify_attempts.lock().unwrap().entry(addr.clone()).or_default() += 1;
        let id = *self
            .by_addr
            .get(&addr)
            .ok_or_else(|| DhtError::connection_error_with_address("Connection refused", addr.to_string()))?;
        let peer = self.reach(&id).await?;
        Ok(Identified {
            peer: peer.record.clone(),
            observed: "/ip4/203.0.113.7/tcp/51000".parse().unwrap(),
        })
    }

    async fn find_node(&self, peer: &PeerRecord, target: NodeId) -> Result<Vec<PeerRecord>> {
        self.queried.lock().unwrap().push(peer.id);
        let peer = self.reach(&peer.id).await?;
        let mut neighbours = peer.neighbours.clone();
        sort_by_distance(&mut neighbours, &target);
        neighbours.truncate(crate::dht::routing::K);
        Ok(neighbours)
    }
}

#[async_trait]
impl Pinger for SimNetwork {
    async fn ping(&self, peer: &PeerRecord) -> bool {
        matches!(self.peers.get(&peer.id).map(|p| p.behaviour), Some(Behaviour::Online))
    }
}
