//! `mrt`: Mini Reliable Transport, connection-oriented in-order delivery
//! over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐   RCON / DATA / RCLS    ┌────────────┐
//!  │  Sender  │────────────────────────▶│  Receiver  │
//!  │ (1 conn  │                         │ (1 socket, │
//!  │ = 1 sock)│◀────────────────────────│  N peers)  │
//!  └────┬─────┘   ACON / ADAT / ACLS    └─────┬──────┘
//!       │                                     │
//!  Connection                               Peer
//!   ├── SendWindow (ring + acks)             ├── RecvBuffer
//!   └── Inactivity ◀── liveness ──▶          └── Inactivity
//!       │                                     │
//!  ┌────▼─────────────────────────────────────▼──┐
//!  │  Socket  (frame codec over tokio UdpSocket) │
//!  └─────────────────────────────────────────────┘
//! ```
//!
//! Modules:
//! - [`frame`]        wire format, checksum
//! - [`socket`]       async frame-oriented UDP socket
//! - [`config`]       timing and capacity parameters
//! - [`state`]        connection and peer state types
//! - [`liveness`]     inactivity counters and the checker task
//! - [`recv_buffer`]  per-peer in-order receive buffer
//! - [`send_window`]  per-connection fragment ring and ack state
//! - [`peer`]         receiver peer records and registry
//! - [`connection`]   sender connection records and table
//! - [`receiver`]     receiver engine
//! - [`sender`]       sender engine
//! - [`simulator`]    fault-injecting relay for testing

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod liveness;
pub mod peer;
pub mod receiver;
pub mod recv_buffer;
pub mod send_window;
pub mod sender;
pub mod simulator;
pub mod socket;
pub mod state;

pub use config::MrtConfig;
pub use connection::ConnId;
pub use error::MrtError;
pub use receiver::Receiver;
pub use sender::{SendStatus, Sender};
pub use state::{PeerState, SenderState};

/// Lock a record mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
