//! TCP transport
//!
//! Dials and accepts plain TCP connections addressed by multiaddress.

use super::{resolve, socket_multiaddr, Connection, Listener, Multiaddr, MultiaddrExt, Transport};
use crate::error::DhtError;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default time allowed for a single TCP connect
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP implementation of [`Transport`]
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, addr: &Multiaddr) -> Result<Connection> {
        let candidates = resolve(addr).await?;
        let mut last_error = None;

        for socket_addr in candidates {
            debug!("Connecting to {} ({})", addr, socket_addr);
            let attempt = timeout(self.connect_timeout, TcpStream::connect(socket_addr)).await;
            let stream = match attempt {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!("Failed to connect to {}: {}", socket_addr, e);
                    last_error = Some(DhtError::connection_error_full("Failed to connect", addr.to_string(), e.to_string()));
                    continue;
                }
                Err(_) => {
                    warn!("Connection timeout to {}", socket_addr);
                    last_error = Some(DhtError::connection_error_with_address("Connection timeout", addr.to_string()));
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY on {}: {}", socket_addr, e);
            }
            let local_addr = stream
                .local_addr()
                .map_err(|e| DhtError::connection_error_full("Failed to get local address", addr.to_string(), e.to_string()))?;

            return Ok(Connection {
                io: Box::new(stream),
                local_addr: socket_multiaddr(local_addr),
                remote_addr: socket_multiaddr(socket_addr),
            });
        }

        Err(last_error
            .unwrap_or_else(|| DhtError::connection_error_with_address("No address to dial", addr.to_string()))
            .into())
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn Listener>> {
        let socket_addr = addr.socket_addr().ok_or_else(|| {
            DhtError::config_error_with_field(format!("Cannot listen on '{}': need an ip and tcp port", addr), "listen")
        })?;

        let listener = TcpListener::bind(socket_addr)
            .await
            .map_err(|e| DhtError::connection_error_full("Failed to bind listener", addr.to_string(), e.to_string()))?;
        let local_addr = socket_multiaddr(listener.local_addr()?);
        info!("Listening on {}", local_addr);

        Ok(Box::new(TcpListenerStream { listener, local_addr }))
    }
}

/// Inbound TCP connections
#[derive(Debug)]
pub struct TcpListenerStream {
    listener: TcpListener,
    local_addr: Multiaddr,
}

#[async_trait]
impl Listener for TcpListenerStream {
    async fn accept(&mut self) -> Result<Connection> {
        let (stream, remote) = self.listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", remote, e);
        }
        let local_addr = match stream.local_addr() {
            Ok(addr) => socket_multiaddr(addr),
            Err(_) => self.local_addr.clone(),
        };
        Ok(Connection {
            io: Box::new(stream),
            local_addr,
            remote_addr: socket_multiaddr(remote),
        })
    }

    fn local_addr(&self) -> Multiaddr {
        self.local_addr.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_listen_and_dial_loopback() {
        let transport = TcpTransport::default();
        let mut listener = transport.listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap()).await.unwrap();
        let bound = listener.local_addr();
        assert_ne!(bound.tcp_port(), Some(0));

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.io.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut conn = transport.dial(&bound).await.unwrap();
        assert_eq!(conn.remote_addr, bound);
        conn.io.write_all(b"hello").await.unwrap();
        assert_eq!(&server.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/{}", port).parse().unwrap();
        let err = TcpTransport::new(Duration::from_secs(2)).dial(&addr).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<DhtError>(), Some(DhtError::ConnectionError { .. })));
    }

    #[tokio::test]
    async fn test_listen_requires_ip() {
        let addr: Multiaddr = "/dns4/localhost/tcp/0".parse().unwrap();
        assert!(TcpTransport::default().listen(&addr).await.is_err());
    }
}
