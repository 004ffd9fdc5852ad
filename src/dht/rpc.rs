//! DHT RPC module
//!
//! Outbound requests (identify, find_node, ping) over the transport stack.
//! Each request opens its own stream and waits for exactly one response.

use crate::dht::message::{DhtMessage, PeerInfo};
use crate::dht::node::{NodeId, PeerRecord};
use crate::dht::routing::Pinger;
use crate::error::DhtError;
use crate::transport::{Multiaddr, MultiaddrExt, Network};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Default time allowed for one request/response exchange
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of an identifier exchange with a seed
#[derive(Debug, Clone)]
pub struct Identified {
    /// The remote peer, reachable at the dialled address
    pub peer: PeerRecord,
    /// Our address as the remote saw it
    pub observed: Multiaddr,
}

/// The requests the bootstrap coordinator and lookups issue
#[async_trait]
pub trait DhtRpc: Send + Sync {
    /// Dial `addr` and exchange identifiers
    async fn identify(&self, addr: &Multiaddr) -> Result<Identified>;

    /// Ask `peer` for the peers it knows closest to `target`
    async fn find_node(&self, peer: &PeerRecord, target: NodeId) -> Result<Vec<PeerRecord>>;
}

/// [`DhtRpc`] over a [`Network`]
#[derive(Debug, Clone)]
pub struct RpcClient {
    local_id: NodeId,
    /// Addresses we advertise, filled in once the listener is bound
    advertised: Arc<RwLock<Vec<Multiaddr>>>,
    network: Network,
    request_timeout: Duration,
}

impl RpcClient {
    pub fn new(
        local_id: NodeId,
        advertised: Arc<RwLock<Vec<Multiaddr>>>,
        network: Network,
        request_timeout: Duration,
    ) -> Self {
        Self {
            local_id,
            advertised,
            network,
            request_timeout,
        }
    }

    async fn local_info(&self) -> PeerInfo {
        PeerInfo {
            id: self.local_id,
            addrs: self.advertised.read().await.clone(),
        }
    }

    /// Send one request to `addr` and read its response
    pub async fn request(&self, addr: &Multiaddr, request: &DhtMessage) -> Result<DhtMessage> {
        let exchange = async {
            let mut stream = self.network.open(addr).await?;
            request.write_to(&mut stream.io).await?;
            DhtMessage::read_from(&mut stream.io).await
        };

        let response = timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| DhtError::connection_error_with_address(format!("{} request timed out", request.kind()), addr.to_string()))??;

        if response.tx() != request.tx() {
            return Err(DhtError::protocol_error_with_source(
                "Transaction id mismatch",
                format!("sent {}, got {}", request.tx(), response.tx()),
            )
            .into());
        }

        if let DhtMessage::Error { code, message, .. } = &response {
            return Err(DhtError::protocol_error_with_source(
                format!("Remote error {}", code),
                message.clone(),
            )
            .into());
        }

        Ok(response)
    }

    /// Try each address of `peer` until one answers
    async fn request_peer(&self, peer: &PeerRecord, request: &DhtMessage) -> Result<DhtMessage> {
        let mut last_error = None;
        for addr in &peer.addrs {
            match self.request(addr, request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    trace!("{} to {} via {} failed: {}", request.kind(), peer.id.short(), addr, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            DhtError::connection_error_with_address("Peer has no known address", peer.id.to_hex()).into()
        }))
    }
}

fn unexpected(expected: &str, got: &DhtMessage) -> anyhow::Error {
    DhtError::protocol_error_with_source(format!("Expected {}", expected), got.kind()).into()
}

#[async_trait]
impl DhtRpc for RpcClient {
    async fn identify(&self, addr: &Multiaddr) -> Result<Identified> {
        let expected = addr.p2p_peer().map(|peer| NodeId::from_peer_id(&peer)).transpose()?;
        let request = DhtMessage::identify(self.local_info().await);
        let dial_addr = addr.without_p2p();

        match self.request(&dial_addr, &request).await? {
            DhtMessage::IdentifyAck { responder, observed, .. } => {
                if let Some(expected) = expected {
                    if expected != responder.id {
                        return Err(DhtError::protocol_error_with_source(
                            "Peer id mismatch",
                            format!("expected {}, got {}", expected, responder.id),
                        )
                        .into());
                    }
                }

                // The dialled address is proven; advertised ones may be wildcards.
                let addrs = responder
                    .addrs
                    .into_iter()
                    .filter(|a| !a.is_unspecified())
                    .chain(std::iter::once(dial_addr));
                let peer = PeerRecord::new(responder.id, addrs);
                debug!("Identified {} at {} (observed us as {})", peer.id.short(), addr, observed);
                Ok(Identified { peer, observed })
            }
            other => Err(unexpected("identify_ack", &other)),
        }
    }

    async fn find_node(&self, peer: &PeerRecord, target: NodeId) -> Result<Vec<PeerRecord>> {
        let request = DhtMessage::find_node(self.local_info().await, target);

        match self.request_peer(peer, &request).await? {
            DhtMessage::Nodes { id, peers, .. } => {
                if id != peer.id {
                    return Err(DhtError::protocol_error_with_source(
                        "Responder id mismatch",
                        format!("expected {}, got {}", peer.id, id),
                    )
                    .into());
                }
                Ok(peers
                    .into_iter()
                    .filter(|p| !p.addrs.is_empty())
                    .map(PeerInfo::into_record)
                    .collect())
            }
            other => Err(unexpected("nodes", &other)),
        }
    }
}

#[async_trait]
impl Pinger for RpcClient {
    async fn ping(&self, peer: &PeerRecord) -> bool {
        match self.request_peer(peer, &DhtMessage::ping()).await {
            Ok(DhtMessage::Pong { id, .. }) => id == peer.id,
            Ok(other) => {
                debug!("Unexpected {} in reply to ping from {}", other.kind(), peer.id.short());
                false
            }
            Err(e) => {
                debug!("Ping to {} failed: {}", peer.id.short(), e);
                false
            }
        }
    }
}
