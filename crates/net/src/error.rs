//! Crate-wide error type.
use std::io;

use thiserror::Error;

/// An error occurring in the reactor or one of the sub-protocols it drives.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Failed to bind or listen on a configured address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The server was asked to start with an inconsistent configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}
