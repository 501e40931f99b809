use std::net::IpAddr;

use clap::Parser;
use sentrymesh_net::ServerRole;

/// Start a Status Server or Location Server process.
///
/// Mirrors the original command line verbatim: `<peer_ip> <p2p_port>
/// <client_listen_port> <SS|SL>`.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Address of the peer server, dialed on `p2p_port` at startup.
    pub peer_ip: IpAddr,

    /// Port this process listens on for the peer's P2P connection, and
    /// dials on the peer's address.
    pub p2p_port: u16,

    /// Port this process listens on for sensor connections.
    pub client_listen_port: u16,

    /// Which server this process is.
    pub role: ServerRole,
}
