//! Timing and capacity parameters shared by both engines.

use std::time::Duration;

use crate::frame::MAX_PAYLOAD;

/// Number of payload fragments a sender connection may hold unacknowledged.
pub const SEND_RING_CAPACITY: usize = 10;

/// Adjustable protocol parameters.
///
/// The defaults match the reference deployment; tests shrink the periods
/// so timeouts fire in milliseconds instead of seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MrtConfig {
    /// Interval between liveness ticks.
    pub checker_period: Duration,
    /// Ticks of silence tolerated before a connection is declared dead.
    pub timeout_ticks: u32,
    /// Idle sleep of the sender pump between keep-alives.
    pub sender_period: Duration,
    /// Interval between handshake (RCON) retries.
    pub rcon_period: Duration,
    /// Time without acknowledgment progress before the sender rewinds and
    /// retransmits its whole unacknowledged window.
    pub resend_threshold: Duration,
    /// Bytes of buffering per receiver peer. Also the initial advertised window.
    pub receive_capacity: usize,
    /// Closed peer addresses a receiver remembers, so `receive_one` can
    /// report closure instead of "not connected". Oldest are forgotten first.
    pub retired_capacity: usize,
}

impl Default for MrtConfig {
    fn default() -> Self {
        Self {
            checker_period: Duration::from_millis(2000),
            timeout_ticks: 5,
            sender_period: Duration::from_millis(500),
            rcon_period: Duration::from_millis(500),
            resend_threshold: Duration::from_millis(1500),
            receive_capacity: MAX_PAYLOAD * 5,
            retired_capacity: 1024,
        }
    }
}

impl MrtConfig {
    /// Inactivity above which the liveness checker tears a record down.
    pub fn timeout_threshold(&self) -> Duration {
        self.checker_period * self.timeout_ticks
    }

    /// Receive capacity clamped into the signed window field.
    pub(crate) fn initial_window(&self) -> i32 {
        i32::try_from(self.receive_capacity).unwrap_or(i32::MAX)
    }
}
