//! Errors surfaced by the public sender and receiver APIs.
//!
//! Protocol-level conditions (bad checksum, out-of-order fragment, full
//! buffer, duplicate handshake) never reach this type: they are dropped
//! silently inside the engines. What remains is startup failure and
//! caller misuse.

use std::net::SocketAddr;

use thiserror::Error;

use crate::connection::ConnId;

#[derive(Debug, Error)]
pub enum MrtError {
    /// The datagram socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The identifier does not name an open sender connection.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnId),
    /// The address was never accepted by this receiver.
    #[error("peer {0} is not connected")]
    NotConnected(SocketAddr),
    /// The engine was closed while the call was waiting.
    #[error("engine is closed")]
    Closed,
}
