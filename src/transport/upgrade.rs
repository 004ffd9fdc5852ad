//! Connection upgrades
//!
//! The secure-channel and multiplexer layers. Encryption and real stream
//! multiplexing live outside this crate; the implementations here negotiate
//! a plaintext protocol id and hand out one stream per connection.

use super::{Connection, Stream};
use crate::error::DhtError;
use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

/// Protocol id exchanged by [`PlaintextChannel`]
pub const PLAINTEXT_PROTOCOL: &str = "/dht-bootstrap/plaintext/1.0.0";

/// Longest protocol line accepted during negotiation
const MAX_PROTOCOL_LINE: usize = 256;

/// Which side of the connection we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Dialer,
    Listener,
}

/// Secures a raw connection
#[async_trait]
pub trait SecureChannel: Send + Sync {
    async fn upgrade(&self, conn: Connection, role: Role) -> Result<Connection>;
}

/// Splits a secured connection into streams
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Open an outbound stream
    async fn open_stream(&self, conn: Connection) -> Result<Stream>;

    /// Accept the next inbound stream
    async fn accept_stream(&self, conn: Connection) -> Result<Stream>;
}

/// Unencrypted channel that only agrees on a protocol id
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextChannel;

impl PlaintextChannel {
    async fn read_protocol_line(conn: &mut Connection) -> Result<String> {
        let mut line = Vec::with_capacity(PLAINTEXT_PROTOCOL.len() + 1);
        loop {
            let byte = conn.io.read_u8().await?;
            if byte == b'\n' {
                break;
            }
            if line.len() >= MAX_PROTOCOL_LINE {
                return Err(DhtError::protocol_error("Protocol line too long").into());
            }
            line.push(byte);
        }
        String::from_utf8(line)
            .map_err(|e| DhtError::protocol_error_with_source("Protocol line is not UTF-8", e.to_string()).into())
    }
}

#[async_trait]
impl SecureChannel for PlaintextChannel {
    async fn upgrade(&self, mut conn: Connection, role: Role) -> Result<Connection> {
        trace!("Negotiating {} as {:?} with {}", PLAINTEXT_PROTOCOL, role, conn.remote_addr);
        conn.io.write_all(PLAINTEXT_PROTOCOL.as_bytes()).await?;
        conn.io.write_all(b"\n").await?;
        conn.io.flush().await?;

        let theirs = Self::read_protocol_line(&mut conn).await?;
        if theirs != PLAINTEXT_PROTOCOL {
            debug!("Protocol mismatch with {}: {}", conn.remote_addr, theirs);
            return Err(DhtError::protocol_error_with_source(
                "Protocol negotiation failed",
                format!("expected {}, got {}", PLAINTEXT_PROTOCOL, theirs),
            )
            .into());
        }
        Ok(conn)
    }
}

/// One stream per connection
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleStreamMultiplexer;

#[async_trait]
impl Multiplexer for SingleStreamMultiplexer {
    async fn open_stream(&self, conn: Connection) -> Result<Stream> {
        Ok(Stream {
            io: conn.io,
            remote_addr: conn.remote_addr,
        })
    }

    async fn accept_stream(&self, conn: Connection) -> Result<Stream> {
        self.open_stream(conn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Multiaddr;

    fn pair() -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(1024);
        let addr_a: Multiaddr = "/ip4/127.0.0.1/tcp/1".parse().unwrap();
        let addr_b: Multiaddr = "/ip4/127.0.0.1/tcp/2".parse().unwrap();
        (
            Connection { io: Box::new(a), local_addr: addr_a.clone(), remote_addr: addr_b.clone() },
            Connection { io: Box::new(b), local_addr: addr_b, remote_addr: addr_a },
        )
    }

    #[tokio::test]
    async fn test_plaintext_negotiation() {
        let (a, b) = pair();
        let channel = PlaintextChannel;
        let (ra, rb) = tokio::join!(channel.upgrade(a, Role::Dialer), channel.upgrade(b, Role::Listener));
        let mut a = ra.unwrap();
        let mut b = rb.unwrap();

        a.io.write_all(b"after").await.unwrap();
        let mut buf = [0u8; 5];
        b.io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"after");
    }

    #[tokio::test]
    async fn test_plaintext_mismatch() {
        let (a, mut b) = pair();
        b.io.write_all(b"/something/else/1.0.0\n").await.unwrap();
        let err = PlaintextChannel.upgrade(a, Role::Dialer).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<DhtError>(), Some(DhtError::ProtocolError { .. })));
    }

    #[tokio::test]
    async fn test_plaintext_rejects_endless_line() {
        let (a, mut b) = pair();
        b.io.write_all(&[b'x'; MAX_PROTOCOL_LINE + 1]).await.unwrap();
        assert!(PlaintextChannel.upgrade(a, Role::Dialer).await.is_err());
    }

    #[tokio::test]
    async fn test_single_stream_keeps_remote() {
        let (a, _b) = pair();
        let remote = a.remote_addr.clone();
        let stream = SingleStreamMultiplexer.open_stream(a).await.unwrap();
        assert_eq!(stream.remote_addr, remote);
    }
}
