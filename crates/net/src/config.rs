//! Server configuration, assembled by the binary from CLI args and handed
//! to the reactor as a single value.
use std::net::{IpAddr, SocketAddr};

use crate::role::ServerRole;

/// Everything the event loop needs to know before it can start, mirroring
/// the CLI contract `<program> <peer_ip> <p2p_port> <client_listen_port>
/// <SS|SL>`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub role: ServerRole,
    /// Where this process accepts sensor connections.
    pub client_listen_addr: SocketAddr,
    /// Where this process listens for the peer's inbound P2P dial.
    pub p2p_listen_addr: SocketAddr,
    /// Address to dial at startup to reach the peer — the peer's own
    /// `p2p_listen_addr` on `peer_ip`.
    pub peer_addr: SocketAddr,
    /// Bound on the single synchronous read in the CHECKALERT rendezvous.
    pub checkalert_timeout: std::time::Duration,
}

impl ServerConfig {
    pub fn new(role: ServerRole, peer_ip: IpAddr, p2p_port: u16, client_listen_port: u16) -> Self {
        let unspecified: IpAddr = if peer_ip.is_ipv6() {
            "::".parse().unwrap()
        } else {
            "0.0.0.0".parse().unwrap()
        };

        Self {
            role,
            client_listen_addr: SocketAddr::new(unspecified, client_listen_port),
            p2p_listen_addr: SocketAddr::new(unspecified, p2p_port),
            peer_addr: SocketAddr::new(peer_ip, p2p_port),
            checkalert_timeout: std::time::Duration::from_secs(5),
        }
    }
}
