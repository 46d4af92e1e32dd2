//! Receiver-side peer records and the registry that indexes them.
//!
//! A [`Peer`] is created on the first valid RCON from an unseen address and
//! lives in the [`PeerRegistry`]'s *pending* queue until the application
//! accepts it, then in the *connected* map until its liveness checker tears
//! it down. A torn-down peer that still holds unread bytes stays *retired*
//! until `receive_one` drains it; after that only a closed marker for its
//! address remains. Markers are bounded, oldest evicted first.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::MrtConfig;
use crate::liveness::Inactivity;
use crate::lock;
use crate::recv_buffer::RecvBuffer;
use crate::state::PeerState;

/// Everything the receiver knows about one remote sender.
#[derive(Debug)]
pub struct Peer {
    pub addr: SocketAddr,
    buffer: Mutex<RecvBuffer>,
    pub(crate) inactivity: Arc<Inactivity>,
    /// Set by RCLS; later DATA no longer refreshes liveness.
    close_requested: AtomicBool,
    closed: AtomicBool,
    /// Signalled when bytes are buffered and when the peer is torn down.
    pub(crate) readable: Notify,
    liveness: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    pub fn new(addr: SocketAddr, initial_frag: i32, config: &MrtConfig) -> Self {
        Self {
            addr,
            buffer: Mutex::new(RecvBuffer::new(initial_frag, config.receive_capacity)),
            inactivity: Arc::new(Inactivity::new(config.timeout_threshold())),
            close_requested: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            readable: Notify::new(),
            liveness: Mutex::new(None),
        }
    }

    pub fn buffer(&self) -> MutexGuard<'_, RecvBuffer> {
        lock(&self.buffer)
    }

    /// Hand teardown to the liveness checker.
    pub(crate) fn request_close(&self) {
        self.close_requested.store(true, Ordering::Release);
        self.inactivity.force_expire();
    }

    pub fn is_closing(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the peer dead and wake every blocked reader.
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.readable.notify_waiters();
    }

    pub(crate) fn set_liveness(&self, handle: JoinHandle<()>) {
        *lock(&self.liveness) = Some(handle);
    }

    /// Cancel the liveness checker without running its finaliser.
    pub(crate) fn abort_liveness(&self) {
        if let Some(handle) = lock(&self.liveness).take() {
            handle.abort();
        }
    }
}

/// What a read from a given address can expect.
#[derive(Debug)]
pub enum Readable {
    /// Connected, or retired with bytes still buffered.
    Live(Arc<Peer>),
    /// Torn down and fully drained.
    Closed,
    /// Never accepted, or forgotten.
    Unknown,
}

/// A torn-down peer, kept only while it has something to tell a reader.
#[derive(Debug)]
enum Retired {
    Unread(Arc<Peer>),
    Drained,
}

/// Pending and connected peers, keyed by address.
///
/// Guarded by a single lock in the receiver; never held across an await.
#[derive(Debug)]
pub struct PeerRegistry {
    pending: VecDeque<Arc<Peer>>,
    connected: HashMap<SocketAddr, Arc<Peer>>,
    retired: HashMap<SocketAddr, Retired>,
    /// Retirement order, oldest first.
    retired_order: VecDeque<SocketAddr>,
    retired_capacity: usize,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new(MrtConfig::default().retired_capacity)
    }
}

impl PeerRegistry {
    pub fn new(retired_capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            connected: HashMap::new(),
            retired: HashMap::new(),
            retired_order: VecDeque::new(),
            retired_capacity,
        }
    }

    pub fn state(&self, addr: &SocketAddr) -> PeerState {
        if self.connected.contains_key(addr) {
            PeerState::Connected
        } else if self.pending.iter().any(|p| p.addr == *addr) {
            PeerState::Pending
        } else if self.retired.contains_key(addr) {
            PeerState::Closed
        } else {
            PeerState::Unseen
        }
    }

    /// Queue a freshly handshaken peer behind any already waiting.
    pub fn enqueue_pending(&mut self, peer: Arc<Peer>) {
        if self.retired.remove(&peer.addr).is_some() {
            self.retired_order.retain(|a| *a != peer.addr);
        }
        self.pending.push_back(peer);
    }

    /// Move the oldest pending peer straight into the connected map.
    ///
    /// One step under one lock: the address is always either pending or
    /// connected, so a retried RCON cannot queue a second record for it.
    pub fn accept_next(&mut self) -> Option<Arc<Peer>> {
        let peer = self.pending.pop_front()?;
        peer.inactivity.reset();
        self.connected.insert(peer.addr, Arc::clone(&peer));
        Some(peer)
    }

    pub fn remove_pending(&mut self, addr: &SocketAddr) -> Option<Arc<Peer>> {
        let index = self.pending.iter().position(|p| p.addr == *addr)?;
        self.pending.remove(index)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn connected(&self, addr: &SocketAddr) -> Option<Arc<Peer>> {
        self.connected.get(addr).cloned()
    }

    pub fn connected_len(&self) -> usize {
        self.connected.len()
    }

    /// Take a connected peer out of service.
    ///
    /// The record itself is kept only if a reader has bytes left to drain.
    pub fn retire(&mut self, addr: &SocketAddr) -> Option<Arc<Peer>> {
        let peer = self.connected.remove(addr)?;
        let entry = if peer.buffer().unread() > 0 {
            Retired::Unread(Arc::clone(&peer))
        } else {
            Retired::Drained
        };
        self.retired.insert(*addr, entry);
        self.retired_order.push_back(*addr);
        while self.retired_order.len() > self.retired_capacity {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
        Some(peer)
    }

    /// Drop the record of a retired peer whose bytes have all been read,
    /// leaving the closed marker.
    pub fn forget_drained(&mut self, peer: &Arc<Peer>) {
        if let Some(entry) = self.retired.get_mut(&peer.addr) {
            if matches!(entry, Retired::Unread(p) if Arc::ptr_eq(p, peer)) {
                *entry = Retired::Drained;
            }
        }
    }

    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }

    pub fn readable(&self, addr: &SocketAddr) -> Readable {
        if let Some(peer) = self.connected.get(addr) {
            return Readable::Live(Arc::clone(peer));
        }
        match self.retired.get(addr) {
            Some(Retired::Unread(peer)) => Readable::Live(Arc::clone(peer)),
            Some(Retired::Drained) => Readable::Closed,
            None => Readable::Unknown,
        }
    }

    /// Empty the registry, returning `(pending, connected)` peers.
    pub fn drain(&mut self) -> (Vec<Arc<Peer>>, Vec<Arc<Peer>>) {
        self.retired.clear();
        self.retired_order.clear();
        let pending = self.pending.drain(..).collect();
        let connected = self.connected.drain().map(|(_, p)| p).collect();
        (pending, connected)
    }
}
