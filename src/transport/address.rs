//! Address module
//!
//! Addresses are [`multiaddr::Multiaddr`]. The node only dials and listens on
//! `/<ip4|ip6|dns|dns4|dns6>/<host>/tcp/<port>`, optionally followed by
//! `/p2p/<peer-id>`; this module checks that shape and adds the accessors
//! the routing and transport layers need.

use crate::dht::node::NodeId;
use crate::error::DhtError;
use libp2p_identity::PeerId;
pub use multiaddr::{Multiaddr, Protocol};
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, trace};

/// `/ip4|ip6/<ip>/tcp/<port>` for a socket address
pub fn socket_multiaddr(addr: SocketAddr) -> Multiaddr {
    Multiaddr::empty()
        .with(Protocol::from(addr.ip()))
        .with(Protocol::Tcp(addr.port()))
}

/// Parse an address and check it has a shape the node can dial
pub fn parse_dialable(s: &str) -> Result<Multiaddr, DhtError> {
    let addr: Multiaddr = s
        .parse()
        .map_err(|e: multiaddr::Error| DhtError::parse_error_with_source(format!("Invalid multiaddr '{}'", s), e.to_string()))?;
    check_dialable(&addr)?;
    Ok(addr)
}

/// Accept `/<host>/tcp/<port>` with an optional trailing `/p2p/<peer-id>`
/// whose peer id carries a node id
pub fn check_dialable(addr: &Multiaddr) -> Result<(), DhtError> {
    let mut parts = addr.iter();
    let host_ok = matches!(
        parts.next(),
        Some(Protocol::Ip4(_) | Protocol::Ip6(_) | Protocol::Dns(_) | Protocol::Dns4(_) | Protocol::Dns6(_))
    );
    let tcp_ok = matches!(parts.next(), Some(Protocol::Tcp(_)));
    let tail_ok = match parts.next() {
        None => true,
        Some(Protocol::P2p(peer)) => {
            NodeId::from_peer_id(&peer).map_err(|e| e.with_context(addr.to_string()))?;
            parts.next().is_none()
        }
        Some(_) => false,
    };

    if host_ok && tcp_ok && tail_ok {
        Ok(())
    } else {
        Err(DhtError::parse_error_with_source(
            "Expected /<host>/tcp/<port>[/p2p/<peer-id>]",
            addr.to_string(),
        ))
    }
}

/// Accessors over the components the node cares about
pub trait MultiaddrExt {
    /// Peer id of a trailing `/p2p/` component
    fn p2p_peer(&self) -> Option<PeerId>;

    /// Copy with the `/p2p/` component set to `id`
    fn with_node_id(&self, id: NodeId) -> Result<Multiaddr, DhtError>;

    /// Copy without any `/p2p/` component
    fn without_p2p(&self) -> Multiaddr;

    fn tcp_port(&self) -> Option<u16>;

    /// IP address when the host component is a literal
    fn ip_addr(&self) -> Option<IpAddr>;

    /// Socket address without name resolution
    fn socket_addr(&self) -> Option<SocketAddr>;

    /// Whether the host is a wildcard such as `0.0.0.0` or `::`
    fn is_unspecified(&self) -> bool;

    /// Whether other hosts could plausibly reach this address
    fn is_public(&self) -> bool;
}

impl MultiaddrExt for Multiaddr {
    fn p2p_peer(&self) -> Option<PeerId> {
        match self.iter().last() {
            Some(Protocol::P2p(peer)) => Some(peer),
            _ => None,
        }
    }

    fn with_node_id(&self, id: NodeId) -> Result<Multiaddr, DhtError> {
        Ok(self.without_p2p().with(Protocol::P2p(id.to_peer_id()?)))
    }

    fn without_p2p(&self) -> Multiaddr {
        self.iter().filter(|p| !matches!(p, Protocol::P2p(_))).collect()
    }

    fn tcp_port(&self) -> Option<u16> {
        self.iter().find_map(|p| match p {
            Protocol::Tcp(port) => Some(port),
            _ => None,
        })
    }

    fn ip_addr(&self) -> Option<IpAddr> {
        self.iter().find_map(|p| match p {
            Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
            Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
            _ => None,
        })
    }

    fn socket_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.ip_addr()?, self.tcp_port()?))
    }

    fn is_unspecified(&self) -> bool {
        self.ip_addr().map(|ip| ip.is_unspecified()).unwrap_or(false)
    }

    fn is_public(&self) -> bool {
        match self.ip_addr() {
            Some(IpAddr::V4(ip)) => {
                !(ip.is_unspecified()
                    || ip.is_loopback()
                    || ip.is_private()
                    || ip.is_link_local()
                    || ip.is_broadcast()
                    || ip.is_documentation())
            }
            Some(IpAddr::V6(ip)) => {
                let segments = ip.segments();
                let unique_local = (segments[0] & 0xfe00) == 0xfc00;
                let link_local = (segments[0] & 0xffc0) == 0xfe80;
                !(ip.is_unspecified() || ip.is_loopback() || unique_local || link_local)
            }
            None => true,
        }
    }
}

/// Resolve an address to one or more socket addresses
pub async fn resolve(addr: &Multiaddr) -> Result<Vec<SocketAddr>, DhtError> {
    let port = addr
        .tcp_port()
        .ok_or_else(|| DhtError::parse_error_with_source("Missing tcp component", addr.to_string()))?;

    if let Some(socket_addr) = addr.socket_addr() {
        return Ok(vec![socket_addr]);
    }

    let (host, want_v4, want_v6) = match addr.iter().next() {
        Some(Protocol::Dns(host)) => (host.into_owned(), true, true),
        Some(Protocol::Dns4(host)) => (host.into_owned(), true, false),
        Some(Protocol::Dns6(host)) => (host.into_owned(), false, true),
        _ => {
            return Err(DhtError::parse_error_with_source("Missing host component", addr.to_string()));
        }
    };

    debug!("Resolving {}:{}", host, port);
    let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| DhtError::connection_error_full("Failed to resolve host", addr.to_string(), e.to_string()))?
        .filter(|a| (a.is_ipv4() && want_v4) || (a.is_ipv6() && want_v6))
        .collect();

    if resolved.is_empty() {
        return Err(DhtError::connection_error_with_address("Host resolved to no usable address", addr.to_string()));
    }
    trace!("Resolved {} to {:?}", addr, resolved);
    Ok(resolved)
}
