//! A `Peer` is a traffic-generation target: a host string, its resolved
//! IPv4 address, and a port. Immutable after construction and shared
//! behind `Arc` rather than cloned on every use.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    host: String,
    addr: Ipv4Addr,
    port: u16,
    display: String,
}

impl Peer {
    pub fn new(host: impl Into<String>, addr: Ipv4Addr, port: u16) -> Arc<Peer> {
        let host = host.into();
        let display = format!("{}:{}", host, port);
        Arc::new(Peer { host, addr, port, display })
    }

    /// Resolves `host:port` (or an IP literal) to a peer. `.onion`
    /// addresses are accepted without resolution and given an
    /// unspecified placeholder IPv4 address — the transport never uses
    /// the resolved address for an onion peer, it sends the hostname
    /// form in the SOCKS5 request instead.
    pub fn resolve(host: &str, port: u16) -> io::Result<Arc<Peer>> {
        if host.ends_with(".onion") {
            return Ok(Peer::new(host, Ipv4Addr::UNSPECIFIED, port));
        }

        if let Ok(addr) = host.parse::<Ipv4Addr>() {
            return Ok(Peer::new(host, addr, port));
        }

        let resolved = (host, port)
            .to_socket_addrs()?
            .find_map(|sa| match sa {
                SocketAddr::V4(v4) => Some(*v4.ip()),
                SocketAddr::V6(_) => None,
            })
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no A record for {}", host)))?;

        Ok(Peer::new(host, resolved, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn is_onion(&self) -> bool {
        self.host.ends_with(".onion")
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.addr, self.port))
    }

    /// Cached human-readable `host:port` form for log lines.
    pub fn display(&self) -> &str {
        &self.display
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_ip_literal_skips_dns() {
        let peer = Peer::resolve("127.0.0.1", 8080).unwrap();
        assert_eq!(peer.addr(), Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(peer.display(), "127.0.0.1:8080");
    }

    #[test]
    fn onion_peer_has_no_resolved_address() {
        let peer = Peer::resolve("facebookcorewwwi.onion", 80).unwrap();
        assert!(peer.is_onion());
        assert_eq!(peer.addr(), Ipv4Addr::UNSPECIFIED);
    }
}
