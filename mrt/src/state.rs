//! Connection and peer finite-state-machine types.
//!
//! Transitions are driven by the engines in [`crate::sender`] and
//! [`crate::receiver`]; this module only names the states so both engines
//! and their callers agree on them.

/// Lifecycle of one sender-side connection.
///
/// ```text
///  Handshaking ──ACON──▶ Connected ──disconnect()──▶ Draining
///       │                    │                          │
///       │                    └──────liveness expiry─────┤
///       │                                               ▼
///       └────────────────(never, unless dropped)────▶ Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SenderState {
    /// RCON is being retried until the first ACON arrives.
    #[default]
    Handshaking,
    /// Sender pump and liveness checker are running.
    Connected,
    /// `disconnect` is waiting for the outgoing ring to empty.
    Draining,
    /// Torn down by the liveness checker; the record is gone from the table.
    Closed,
}

/// Lifecycle of one peer as seen by the receiver.
///
/// ```text
///  Unseen ──RCON──▶ Pending ──accept──▶ Connected ──expiry / RCLS──▶ Closed
///                      │
///                      └──RCLS──▶ Unseen
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    #[default]
    Unseen,
    /// Handshake seen, not yet accepted by the application.
    Pending,
    /// Accepted; exchanging data.
    Connected,
    /// Was connected, since torn down.
    Closed,
}

impl std::fmt::Display for SenderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
