//! Send-side fragment ring and acknowledgment state for one connection.
//!
//! [`SendWindow`] holds up to [`SEND_RING_CAPACITY`] buffered payload
//! fragments that the peer has not yet acknowledged.
//!
//! # Protocol contract
//!
//! - Fragments are numbered from 1 after the handshake; the slot at index
//!   `i` always holds fragment `last_acked + i + 1`.
//! - ADATs are **cumulative**: fragment `K` acknowledges every fragment up
//!   to and including `K`. An ack older than `last_acked` never moves it
//!   backwards.
//! - The send cursor (`last_sent`) advances one fragment per transmission.
//!   When nothing has been newly acknowledged for longer than the resend
//!   threshold it is rewound to `last_acked`, so the whole unacknowledged
//!   tail goes out again (no selective repeat).
//!
//! # Lock order
//!
//! Two locks guard this state: the acknowledgment lock and the ring lock.
//! Whenever both are held the acknowledgment lock comes first. This is
//! enforced by construction: the ring is only reachable through
//! [`WindowGuard::ring`], and a [`WindowGuard`] is only obtained by taking
//! the acknowledgment lock.
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::SEND_RING_CAPACITY;
use crate::lock;

/// Acknowledgment and flow-control state.
#[derive(Debug)]
pub struct AckState {
    /// Highest fragment acknowledged by the peer; −1 until the handshake
    /// completes.
    pub last_acked: i32,
    /// Largest receive window the peer has advertised.
    pub receiver_window: i32,
    /// Last time the acknowledgment point moved (or nothing was outstanding).
    last_progress: Instant,
}

/// Buffered fragments plus the send cursor.
#[derive(Debug)]
pub struct FragmentRing {
    slots: VecDeque<Vec<u8>>,
    /// Fragment number most recently transmitted.
    pub last_sent: i32,
    /// Highest fragment number ever transmitted; survives rewinds.
    pub highest_sent: i32,
}

impl FragmentRing {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= SEND_RING_CAPACITY
    }
}

/// Holds the acknowledgment lock; the only way to reach the ring.
pub struct WindowGuard<'a> {
    ack: MutexGuard<'a, AckState>,
    ring: &'a Mutex<FragmentRing>,
}

impl<'a> WindowGuard<'a> {
    pub fn ack(&self) -> &AckState {
        &self.ack
    }

    /// Take the ring lock while still holding the acknowledgment lock.
    pub fn ring(&self) -> MutexGuard<'a, FragmentRing> {
        lock(self.ring)
    }
}

/// What the sender pump should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpAction {
    /// Transmit this fragment.
    Transmit { fragment: i32, payload: Vec<u8> },
    /// Nothing sendable: emit a keep-alive and sleep. `rewound` is set when
    /// this call moved the cursor back to the last acknowledged fragment.
    Idle { rewound: bool },
}

/// Outgoing ring plus acknowledgment state for one sender connection.
#[derive(Debug)]
pub struct SendWindow {
    ack: Mutex<AckState>,
    ring: Mutex<FragmentRing>,
}

impl Default for SendWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl SendWindow {
    pub fn new() -> Self {
        Self {
            ack: Mutex::new(AckState {
                last_acked: -1,
                receiver_window: 0,
                last_progress: Instant::now(),
            }),
            ring: Mutex::new(FragmentRing {
                slots: VecDeque::with_capacity(SEND_RING_CAPACITY),
                last_sent: -1,
                highest_sent: -1,
            }),
        }
    }

    /// Acquire the acknowledgment lock.
    pub fn lock(&self) -> WindowGuard<'_> {
        WindowGuard {
            ack: lock(&self.ack),
            ring: &self.ring,
        }
    }

    /// First ACON: acknowledgment point becomes fragment 0.
    ///
    /// Returns `true` only for the first call; later ACONs are ignored.
    pub fn on_handshake(&self, window: i32) -> bool {
        let mut guard = self.lock();
        if guard.ack.last_acked >= 0 {
            return false;
        }
        guard.ack.last_acked = 0;
        guard.ack.receiver_window = guard.ack.receiver_window.max(window);
        guard.ack.last_progress = Instant::now();
        let mut ring = guard.ring();
        ring.last_sent = 0;
        ring.highest_sent = 0;
        true
    }

    pub fn is_established(&self) -> bool {
        self.lock().ack.last_acked >= 0
    }

    /// Process an ADAT. Returns the number of fragments newly acknowledged
    /// (and released from the ring).
    ///
    /// An ack at least as new as the current one may raise the known
    /// window; an older one changes nothing. Acks for fragments never
    /// transmitted are ignored.
    pub fn on_ack(&self, fragment: i32, window: i32) -> usize {
        let mut guard = self.lock();
        if guard.ack.last_acked < 0 {
            return 0;
        }
        let highest_sent = guard.ring().highest_sent;
        let advance = fragment.wrapping_sub(guard.ack.last_acked);
        if advance < 0 || fragment.wrapping_sub(highest_sent) > 0 {
            return 0;
        }

        guard.ack.last_acked = fragment;
        if window > guard.ack.receiver_window {
            guard.ack.receiver_window = window;
        }
        if advance == 0 {
            return 0;
        }
        guard.ack.last_progress = Instant::now();

        let mut ring = guard.ring();
        let released = (advance as usize).min(ring.slots.len());
        ring.slots.drain(..released);
        released
    }

    /// Buffer one payload fragment if there is room.
    ///
    /// Returns the fragment number it will be sent as, or `None` when the
    /// ring is full.
    pub fn push(&self, payload: Vec<u8>) -> Option<i32> {
        let guard = self.lock();
        let mut ring = guard.ring();
        if ring.is_full() {
            return None;
        }
        ring.slots.push_back(payload);
        let index = ring.slots.len() as i32;
        Some(guard.ack.last_acked.wrapping_add(index))
    }

    /// Decide the sender pump's next step, advancing or rewinding the cursor.
    pub fn next_action(
        &self,
        now: Instant,
        min_window: i32,
        resend_threshold: Duration,
    ) -> PumpAction {
        let mut guard = self.lock();
        let last_acked = guard.ack.last_acked;
        let window = guard.ack.receiver_window;
        let mut ring = guard.ring();

        if ring.last_sent.wrapping_sub(last_acked) < 0 {
            ring.last_sent = last_acked;
        }
        let index = ring.last_sent.wrapping_sub(last_acked) as usize;

        if window >= min_window && index < ring.slots.len() {
            let payload = ring.slots[index].clone();
            ring.last_sent = ring.last_sent.wrapping_add(1);
            if ring.last_sent.wrapping_sub(ring.highest_sent) > 0 {
                ring.highest_sent = ring.last_sent;
            }
            return PumpAction::Transmit {
                fragment: ring.last_sent,
                payload,
            };
        }

        let outstanding = ring.last_sent != last_acked;
        drop(ring);
        if !outstanding {
            guard.ack.last_progress = now;
            return PumpAction::Idle { rewound: false };
        }
        if now.saturating_duration_since(guard.ack.last_progress) > resend_threshold {
            guard.ack.last_progress = now;
            guard.ring().last_sent = last_acked;
            return PumpAction::Idle { rewound: true };
        }
        PumpAction::Idle { rewound: false }
    }

    /// `true` once every buffered fragment has been acknowledged.
    pub fn is_drained(&self) -> bool {
        self.lock().ring().is_empty()
    }

    pub fn is_acked(&self, fragment: i32) -> bool {
        let guard = self.lock();
        guard.ack.last_acked >= 0 && fragment.wrapping_sub(guard.ack.last_acked) <= 0
    }

    pub fn last_acked(&self) -> i32 {
        self.lock().ack.last_acked
    }

    pub fn receiver_window(&self) -> i32 {
        self.lock().ack.receiver_window
    }
}
