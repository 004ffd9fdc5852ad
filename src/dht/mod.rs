//! DHT (Distributed Hash Table) module
//!
//! Kademlia-style peer discovery: identifiers and XOR distance, the
//! k-bucket routing table, iterative lookups and the bootstrap coordinator.

pub mod node;
pub mod routing;
pub mod message;
pub mod rpc;
pub mod lookup;
pub mod events;
pub mod bootstrap;
pub mod dht;

#[cfg(test)]
pub(crate) mod sim;

// Re-exports for convenience
pub use node::{bucket_index, distance, Distance, NodeId, PeerRecord, ID_BITS, ID_LEN};
pub use routing::{InsertOutcome, KBucket, Pinger, RoutingConfig, RoutingTable, K};
pub use message::{generate_transaction_id, DhtMessage, PeerInfo};
pub use rpc::{DhtRpc, Identified, RpcClient};
pub use lookup::{Lookup, LookupConfig};
pub use events::{DiscoveryEvent, EventSender};
pub use bootstrap::{BootstrapConfig, BootstrapReport, BootstrapState, Bootstrapper};
pub use dht::{Dht, DhtConfig, NodeStatus};
