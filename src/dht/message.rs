//! DHT message module
//!
//! Defines the request/response pairs exchanged between nodes and their
//! bencoded wire form.

use crate::dht::node::{NodeId, PeerRecord};
use crate::error::DhtError;
use crate::transport::{parse_dialable, read_frame_from, write_frame_to, Multiaddr};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

/// Error code for a request the responder could not parse
pub const ERROR_MALFORMED: u32 = 203;

/// Error code for a request kind the responder does not serve
pub const ERROR_UNSUPPORTED: u32 = 204;

/// A peer as carried inside messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: NodeId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerInfo {
    pub fn from_record(record: &PeerRecord) -> Self {
        Self {
            id: record.id,
            addrs: record.addrs.iter().cloned().collect(),
        }
    }

    /// Fresh routing-table record for this peer
    pub fn into_record(self) -> PeerRecord {
        PeerRecord::new(self.id, self.addrs)
    }
}

/// DHT message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtMessage {
    /// Liveness check
    Ping { tx: String },
    /// Answer to [`DhtMessage::Ping`]
    Pong { tx: String, id: NodeId },
    /// Ask for the peers closest to `target`
    FindNode {
        tx: String,
        sender: PeerInfo,
        target: NodeId,
    },
    /// Answer to [`DhtMessage::FindNode`]
    Nodes {
        tx: String,
        id: NodeId,
        peers: Vec<PeerInfo>,
    },
    /// Identifier exchange opening a session with a seed
    Identify { tx: String, sender: PeerInfo },
    /// Answer to [`DhtMessage::Identify`], echoing the address the request came from
    IdentifyAck {
        tx: String,
        responder: PeerInfo,
        observed: Multiaddr,
    },
    /// Request failed on the remote side
    Error { tx: String, code: u32, message: String },
}

/// Flat bencoded form of every message
#[derive(Debug, Default, Serialize, Deserialize)]
struct Envelope {
    t: String,
    y: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    addrs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    peers: Option<Vec<WirePeer>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    observed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    msg: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WirePeer {
    id: String,
    addrs: Vec<String>,
}

impl WirePeer {
    fn from_info(info: &PeerInfo) -> Self {
        Self {
            id: info.id.to_hex(),
            addrs: addrs_to_wire(&info.addrs),
        }
    }

    fn into_info(self) -> Result<PeerInfo> {
        Ok(PeerInfo {
            id: NodeId::from_hex(&self.id)?,
            addrs: addrs_from_wire(self.addrs),
        })
    }
}

fn addrs_to_wire(addrs: &[Multiaddr]) -> Vec<String> {
    addrs.iter().map(|a| a.to_string()).collect()
}

/// Unparsable addresses are dropped rather than failing the whole message.
fn addrs_from_wire(addrs: Vec<String>) -> Vec<Multiaddr> {
    addrs
        .into_iter()
        .filter_map(|a| match parse_dialable(&a) {
            Ok(addr) => Some(addr),
            Err(e) => {
                trace!("Dropping unparsable address '{}': {}", a, e);
                None
            }
        })
        .collect()
}

fn required<T>(value: Option<T>, field: &str, kind: &str) -> Result<T> {
    value.ok_or_else(|| {
        DhtError::protocol_error_with_source(format!("Missing field '{}'", field), kind.to_string()).into()
    })
}

impl DhtMessage {
    /// Transaction id shared by a request and its response
    pub fn tx(&self) -> &str {
        match self {
            DhtMessage::Ping { tx }
            | DhtMessage::Pong { tx, .. }
            | DhtMessage::FindNode { tx, .. }
            | DhtMessage::Nodes { tx, .. }
            | DhtMessage::Identify { tx, .. }
            | DhtMessage::IdentifyAck { tx, .. }
            | DhtMessage::Error { tx, .. } => tx,
        }
    }

    /// Get the message kind as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            DhtMessage::Ping { .. } => "ping",
            DhtMessage::Pong { .. } => "pong",
            DhtMessage::FindNode { .. } => "find_node",
            DhtMessage::Nodes { .. } => "nodes",
            DhtMessage::Identify { .. } => "identify",
            DhtMessage::IdentifyAck { .. } => "identify_ack",
            DhtMessage::Error { .. } => "error",
        }
    }

    /// Whether this is a request a node should answer
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            DhtMessage::Ping { .. } | DhtMessage::FindNode { .. } | DhtMessage::Identify { .. }
        )
    }

    /// Create a ping query
    pub fn ping() -> Self {
        DhtMessage::Ping {
            tx: generate_transaction_id(),
        }
    }

    /// Create a find_node query
    pub fn find_node(sender: PeerInfo, target: NodeId) -> Self {
        DhtMessage::FindNode {
            tx: generate_transaction_id(),
            sender,
            target,
        }
    }

    /// Create an identify query
    pub fn identify(sender: PeerInfo) -> Self {
        DhtMessage::Identify {
            tx: generate_transaction_id(),
            sender,
        }
    }

    /// Create an error response for `tx`
    pub fn error(tx: impl Into<String>, code: u32, message: impl Into<String>) -> Self {
        DhtMessage::Error {
            tx: tx.into(),
            code,
            message: message.into(),
        }
    }

    /// Serialize DHT message to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut env = Envelope {
            t: self.tx().to_string(),
            y: self.kind().to_string(),
            ..Default::default()
        };

        match self {
            DhtMessage::Ping { .. } => {}
            DhtMessage::Pong { id, .. } => env.id = Some(id.to_hex()),
            DhtMessage::FindNode { sender, target, .. } => {
                env.id = Some(sender.id.to_hex());
                env.addrs = Some(addrs_to_wire(&sender.addrs));
                env.target = Some(target.to_hex());
            }
            DhtMessage::Nodes { id, peers, .. } => {
                env.id = Some(id.to_hex());
                env.peers = Some(peers.iter().map(WirePeer::from_info).collect());
            }
            DhtMessage::Identify { sender, .. } => {
                env.id = Some(sender.id.to_hex());
                env.addrs = Some(addrs_to_wire(&sender.addrs));
            }
            DhtMessage::IdentifyAck {
                responder, observed, ..
            } => {
                env.id = Some(responder.id.to_hex());
                env.addrs = Some(addrs_to_wire(&responder.addrs));
                env.observed = Some(observed.to_string());
            }
            DhtMessage::Error { code, message, .. } => {
                env.code = Some(*code as i64);
                env.msg = Some(message.clone());
            }
        }

        serde_bencode::ser::to_bytes(&env)
            .map_err(|e| DhtError::protocol_error_with_source("Failed to serialize DHT message", e.to_string()).into())
    }

    /// Deserialize DHT message from bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        let env: Envelope = serde_bencode::de::from_bytes(data).map_err(DhtError::from)?;
        let kind = env.y.as_str();
        let tx = env.t;

        let message = match kind {
            "ping" => DhtMessage::Ping { tx },
            "pong" => DhtMessage::Pong {
                tx,
                id: NodeId::from_hex(&required(env.id, "id", kind)?)?,
            },
            "find_node" => DhtMessage::FindNode {
                tx,
                sender: PeerInfo {
                    id: NodeId::from_hex(&required(env.id, "id", kind)?)?,
                    addrs: addrs_from_wire(env.addrs.unwrap_or_default()),
                },
                target: NodeId::from_hex(&required(env.target, "target", kind)?)?,
            },
            "nodes" => DhtMessage::Nodes {
                tx,
                id: NodeId::from_hex(&required(env.id, "id", kind)?)?,
                peers: env
                    .peers
                    .unwrap_or_default()
                    .into_iter()
                    .map(WirePeer::into_info)
                    .collect::<Result<Vec<_>>>()?,
            },
            "identify" => DhtMessage::Identify {
                tx,
                sender: PeerInfo {
                    id: NodeId::from_hex(&required(env.id, "id", kind)?)?,
                    addrs: addrs_from_wire(env.addrs.unwrap_or_default()),
                },
            },
            "identify_ack" => DhtMessage::IdentifyAck {
                tx,
                responder: PeerInfo {
                    id: NodeId::from_hex(&required(env.id, "id", kind)?)?,
                    addrs: addrs_from_wire(env.addrs.unwrap_or_default()),
                },
                observed: parse_dialable(&required(env.observed, "observed", kind)?)?,
            },
            "error" => DhtMessage::Error {
                tx,
                code: u32::try_from(required(env.code, "code", kind)?)
                    .map_err(|e| DhtError::protocol_error_with_source("Invalid error code", e.to_string()))?,
                message: env.msg.unwrap_or_default(),
            },
            other => {
                return Err(DhtError::protocol_error(format!("Unknown message kind '{}'", other)).into());
            }
        };

        Ok(message)
    }

    /// Read one framed message from the stream
    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Self> {
        let frame = read_frame_from(reader).await?;
        let message = Self::decode(&frame)?;
        trace!("Received {} ({} bytes)", message.kind(), frame.len());
        Ok(message)
    }

    /// Write one framed message to the stream
    pub async fn write_to<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> Result<()> {
        let payload = self.encode()?;
        trace!("Sending {} ({} bytes)", self.kind(), payload.len());
        write_frame_to(writer, &payload).await
    }
}

/// Helper function to generate a random transaction ID
pub fn generate_transaction_id() -> String {
    hex::encode(rand::random::<u32>().to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(byte: u8) -> PeerInfo {
        PeerInfo {
            id: NodeId::new([byte; 32]),
            addrs: vec![format!("/ip4/10.0.0.{}/tcp/4001", byte).parse().unwrap()],
        }
    }

    #[test]
    fn test_transaction_id() {
        let tx = generate_transaction_id();
        assert_eq!(tx.len(), 8);
        assert!(tx.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_ping_pong() {
        let ping = DhtMessage::ping();
        assert!(ping.is_request());
        let decoded = DhtMessage::decode(&ping.encode().unwrap()).unwrap();
        assert_eq!(decoded, ping);

        let pong = DhtMessage::Pong { tx: ping.tx().to_string(), id: NodeId::new([7; 32]) };
        assert!(!pong.is_request());
        assert_eq!(DhtMessage::decode(&pong.encode().unwrap()).unwrap(), pong);
    }

    #[test]
    fn test_find_node_and_nodes() {
        let query = DhtMessage::find_node(info(1), NodeId::new([9; 32]));
        assert_eq!(DhtMessage::decode(&query.encode().unwrap()).unwrap(), query);

        let reply = DhtMessage::Nodes {
            tx: query.tx().to_string(),
            id: NodeId::new([2; 32]),
            peers: vec![info(3), info(4)],
        };
        assert_eq!(DhtMessage::decode(&reply.encode().unwrap()).unwrap(), reply);
    }

    #[test]
    fn test_identify_ack_carries_observed() {
        let ack = DhtMessage::IdentifyAck {
            tx: "abcd".into(),
            responder: info(5),
            observed: "/ip4/203.0.113.7/tcp/51000".parse().unwrap(),
        };
        match DhtMessage::decode(&ack.encode().unwrap()).unwrap() {
            DhtMessage::IdentifyAck { observed, .. } => {
                assert_eq!(observed.to_string(), "/ip4/203.0.113.7/tcp/51000")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_message() {
        let err = DhtMessage::error("ff", ERROR_UNSUPPORTED, "no");
        assert_eq!(DhtMessage::decode(&err.encode().unwrap()).unwrap(), err);
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let raw = b"d1:t2:ab1:y5:storee";
        let err = DhtMessage::decode(raw).unwrap_err();
        assert!(err.to_string().contains("store"));
    }

    #[test]
    fn test_decode_rejects_short_id() {
        let raw = format!("d2:id{}:{}1:t2:ab1:y4:ponge", 40, "ab".repeat(20));
        let err = DhtMessage::decode(raw.as_bytes()).unwrap_err();
        assert!(matches!(err.downcast_ref::<DhtError>(), Some(DhtError::InvalidIdentifier { .. })));
    }

    #[test]
    fn test_decode_rejects_missing_field() {
        let raw = b"d1:t2:ab1:y4:ponge";
        let err = DhtMessage::decode(raw).unwrap_err();
        assert!(matches!(err.downcast_ref::<DhtError>(), Some(DhtError::ProtocolError { .. })));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(DhtMessage::decode(b"not bencode").is_err());
    }

    #[test]
    fn test_nodes_drops_bad_addresses() {
        let raw = format!(
            "d2:id64:{id}5:peersld5:addrsl8:/bogus/118:/ip4/1.2.3.4/tcp/5e2:id64:{id}ee1:t2:ab1:y5:nodese",
            id = "cd".repeat(32)
        );
        match DhtMessage::decode(raw.as_bytes()).unwrap() {
            DhtMessage::Nodes { peers, .. } => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].addrs.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_framed_io() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let query = DhtMessage::identify(info(1));
        query.write_to(&mut a).await.unwrap();
        assert_eq!(DhtMessage::read_from(&mut b).await.unwrap(), query);
    }
}
