//! Transport module
//!
//! Capability traits for the layers below the DHT (transport, secure
//! channel, stream multiplexer) and the plain TCP stack that implements them.

pub mod address;
pub mod tcp;
pub mod upgrade;
pub mod wire;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

// Re-export main types
pub use address::{check_dialable, parse_dialable, resolve, socket_multiaddr, Multiaddr, MultiaddrExt, Protocol};
pub use tcp::{TcpListenerStream, TcpTransport};
pub use upgrade::{Multiplexer, PlaintextChannel, Role, SecureChannel, SingleStreamMultiplexer, PLAINTEXT_PROTOCOL};
pub use wire::{read_frame_from, write_frame, write_frame_to, MAX_FRAME_LEN};

/// Any bidirectional byte stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// An established connection, before or after upgrade
pub struct Connection {
    pub io: Box<dyn AsyncStream>,
    pub local_addr: Multiaddr,
    pub remote_addr: Multiaddr,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local_addr", &self.local_addr.to_string())
            .field("remote_addr", &self.remote_addr.to_string())
            .finish()
    }
}

/// A logical stream opened over a connection
pub struct Stream {
    pub io: Box<dyn AsyncStream>,
    pub remote_addr: Multiaddr,
}

/// Dials and listens on raw connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish an outbound connection
    async fn dial(&self, addr: &Multiaddr) -> Result<Connection>;

    /// Start accepting inbound connections
    async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn Listener>>;
}

/// Source of inbound connections
#[async_trait]
pub trait Listener: Send {
    /// Wait for the next inbound connection
    async fn accept(&mut self) -> Result<Connection>;

    /// The address actually bound
    fn local_addr(&self) -> Multiaddr;
}

/// The full outbound/inbound pipeline: transport, secure channel, multiplexer
#[derive(Clone)]
pub struct Network {
    transport: Arc<dyn Transport>,
    secure: Arc<dyn SecureChannel>,
    muxer: Arc<dyn Multiplexer>,
}

impl Network {
    /// Assemble a pipeline from its layers
    pub fn new(
        transport: Arc<dyn Transport>,
        secure: Arc<dyn SecureChannel>,
        muxer: Arc<dyn Multiplexer>,
    ) -> Self {
        Self {
            transport,
            secure,
            muxer,
        }
    }

    /// Plain TCP with the plaintext upgrade and one stream per connection
    pub fn tcp(connect_timeout: Duration) -> Self {
        Self::new(
            Arc::new(TcpTransport::new(connect_timeout)),
            Arc::new(PlaintextChannel),
            Arc::new(SingleStreamMultiplexer),
        )
    }

    /// Dial, upgrade and open a stream
    pub async fn open(&self, addr: &Multiaddr) -> Result<Stream> {
        let conn = self.transport.dial(addr).await?;
        trace!("Dialled {}, upgrading", conn.remote_addr);
        let conn = self.secure.upgrade(conn, Role::Dialer).await?;
        self.muxer.open_stream(conn).await
    }

    /// Start listening
    pub async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn Listener>> {
        self.transport.listen(addr).await
    }

    /// Upgrade an accepted connection and take its first stream
    pub async fn accept_inbound(&self, conn: Connection) -> Result<Stream> {
        let conn = self.secure.upgrade(conn, Role::Listener).await?;
        self.muxer.accept_stream(conn).await
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network").finish_non_exhaustive()
    }
}
