//! dht-bootstrap
//!
//! A minimal Kademlia DHT node: joins a network through seed addresses and
//! reports the address it can be reached on.

pub mod dht;
pub mod transport;
pub mod cli;
pub mod error;

pub use error::DhtError;

pub use dht::{
    BootstrapConfig, BootstrapReport, BootstrapState, Bootstrapper, Dht, DhtConfig, DhtMessage,
    DhtRpc, DiscoveryEvent, Distance, InsertOutcome, KBucket, Lookup, LookupConfig, NodeId,
    NodeStatus, PeerRecord, Pinger, RoutingConfig, RoutingTable, RpcClient,
};
pub use transport::{parse_dialable, socket_multiaddr, Multiaddr, MultiaddrExt, Network};
pub use cli::{CliArgs, Config};
