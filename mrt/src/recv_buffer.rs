//! Receive-side fragment acceptance and buffering for one peer.
//!
//! [`RecvBuffer`] implements the receiver's half of the data exchange:
//!
//! - A fragment is accepted only if it is **exactly** the next expected one
//!   and the buffer has room for its whole payload.
//! - Anything else (gap, duplicate, keep-alive, overflow) is dropped
//!   without buffering. The sender's timeout-driven resend recovers it.
//! - After every DATA frame, accepted or not, the caller replies with an
//!   ADAT carrying [`RecvBuffer::last_accepted`] and [`RecvBuffer::window`].
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility.

use std::collections::VecDeque;

/// Bounded in-order byte buffer plus the next expected fragment number.
#[derive(Debug)]
pub struct RecvBuffer {
    /// Accepted bytes not yet read by the application.
    data: VecDeque<u8>,
    capacity: usize,
    next_frag: i32,
}

impl RecvBuffer {
    /// `initial_frag` is the fragment number proposed in the peer's RCON.
    pub fn new(initial_frag: i32, capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity,
            next_frag: initial_frag.wrapping_add(1),
        }
    }

    /// Offer one DATA fragment. Returns `true` if it was appended.
    pub fn on_fragment(&mut self, fragment: i32, payload: &[u8]) -> bool {
        if fragment != self.next_frag || payload.len() > self.free() {
            return false;
        }
        self.data.extend(payload.iter().copied());
        self.next_frag = self.next_frag.wrapping_add(1);
        true
    }

    pub fn next_frag(&self) -> i32 {
        self.next_frag
    }

    /// Fragment number to acknowledge: everything up to it has been accepted.
    pub fn last_accepted(&self) -> i32 {
        self.next_frag.wrapping_sub(1)
    }

    pub fn unread(&self) -> usize {
        self.data.len()
    }

    pub fn free(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Free space in the signed on-wire representation.
    pub fn window(&self) -> i32 {
        i32::try_from(self.free()).unwrap_or(i32::MAX)
    }

    /// Move up to `buf.len()` buffered bytes into `buf`; the remainder
    /// shifts to the front. Returns the number of bytes copied.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.data.len());
        for (dst, src) in buf[..n].iter_mut().zip(self.data.drain(..n)) {
            *dst = src;
        }
        n
    }
}
