//! Discovery events
//!
//! Peer connect/discovery notifications delivered on a bounded channel.
//! Emitting never waits: when the subscriber lags, events are dropped.

use crate::dht::bootstrap::BootstrapState;
use crate::dht::node::PeerRecord;
use crate::dht::routing::InsertOutcome;
use crate::transport::Multiaddr;
use tokio::sync::mpsc;
use tracing::trace;

/// Default capacity of the event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Something happened to the node's view of the network
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// The listener is bound
    Listening(Multiaddr),
    /// A seed answered the identifier exchange
    PeerConnected(PeerRecord),
    /// A new peer entered the routing table
    PeerDiscovered(PeerRecord),
    /// A peer was dropped from the routing table
    PeerEvicted(PeerRecord),
    /// The bootstrap coordinator moved to a new state
    StateChanged(BootstrapState),
}

/// Sending half of the event channel; a no-op when nobody subscribed
#[derive(Debug, Clone, Default)]
pub struct EventSender {
    tx: Option<mpsc::Sender<DiscoveryEvent>>,
}

impl EventSender {
    /// Create a connected sender/receiver pair
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DiscoveryEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A sender that discards everything
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: DiscoveryEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(event) {
            trace!("Dropping discovery event: {}", e);
        }
    }

    /// Translate a routing-table insert into events
    pub fn record_insert(&self, peer: &PeerRecord, outcome: &InsertOutcome) {
        match outcome {
            InsertOutcome::Added => self.emit(DiscoveryEvent::PeerDiscovered(peer.clone())),
            InsertOutcome::Replaced { evicted } => {
                self.emit(DiscoveryEvent::PeerEvicted(evicted.clone()));
                self.emit(DiscoveryEvent::PeerDiscovered(peer.clone()));
            }
            InsertOutcome::Updated | InsertOutcome::Ignored => {}
        }
    }
}
