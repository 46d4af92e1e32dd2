//! Receiver Connection Engine.
//!
//! One [`Receiver`] owns one datagram socket and serves any number of
//! remote senders on it, each identified by its source address.
//!
//! ```text
//!   socket ──▶ inbound handler ──RCON──▶ pending queue ──accept──▶ connected
//!                    │                                                │
//!                    ├──DATA──▶ peer RecvBuffer ──receive_one──▶ app  │
//!                    │            └─ADAT (last accepted, free window) │
//!                    └──RCLS──▶ force expiry ──▶ liveness checker ────┘
//! ```
//!
//! Tasks: one inbound handler for the whole receiver, plus one liveness
//! checker per connected peer. Application calls (`accept_one`,
//! `receive_one`) suspend on [`Notify`] until the handler makes progress
//! for them.

use std::net::{Ipv4Addr, SocketAddr};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::MrtConfig;
use crate::error::MrtError;
use crate::frame::{FrameType, Header, HEADER_LEN, MAX_FRAME};
use crate::liveness::spawn_checker;
use crate::lock;
use crate::peer::{Peer, PeerRegistry, Readable};
use crate::socket::{recv_backoff, Socket, SocketError};
use crate::state::PeerState;

/// Accepting side of MRT.
///
/// Dropping a `Receiver` without calling [`Receiver::close`] still stops
/// its background tasks.
pub struct Receiver {
    shared: Arc<Shared>,
    handler: Mutex<Option<JoinHandle<()>>>,
}

/// State shared between the caller-facing API and the background tasks.
struct Shared {
    socket: Socket,
    config: MrtConfig,
    registry: Mutex<PeerRegistry>,
    /// Signalled when a peer joins the pending queue, and on close.
    pending_ready: Notify,
    closing: AtomicBool,
    shutdown: Notify,
}

impl Receiver {
    /// Bind `0.0.0.0:port` and start the inbound handler.
    pub async fn open(port: u16, config: MrtConfig) -> Result<Self, MrtError> {
        Self::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), config).await
    }

    /// Bind an explicit local address and start the inbound handler.
    pub async fn bind(addr: SocketAddr, config: MrtConfig) -> Result<Self, MrtError> {
        let socket = Socket::bind(addr)
            .await
            .map_err(|source| MrtError::Bind { addr, source })?;
        log::info!("[receiver] listening on {}", socket.local_addr);

        let registry = PeerRegistry::new(config.retired_capacity);
        let shared = Arc::new(Shared {
            socket,
            config,
            registry: Mutex::new(registry),
            pending_ready: Notify::new(),
            closing: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        let handler = tokio::spawn(handle_inbound(Arc::clone(&shared)));

        Ok(Self {
            shared,
            handler: Mutex::new(Some(handler)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.socket.local_addr
    }

    /// Wait for a pending peer, accept the oldest, and return its address.
    pub async fn accept_one(&self) -> Result<SocketAddr, MrtError> {
        loop {
            let mut notified = pin!(self.shared.pending_ready.notified());
            notified.as_mut().enable();

            if self.shared.is_closing() {
                return Err(MrtError::Closed);
            }
            let next = lock(&self.shared.registry).accept_next();
            if let Some(peer) = next {
                let addr = peer.addr;
                admit(&self.shared, peer).await;
                return Ok(addr);
            }
            notified.await;
        }
    }

    /// Accept every currently pending peer without waiting for more.
    pub async fn accept_all(&self) -> Result<Vec<SocketAddr>, MrtError> {
        if self.shared.is_closing() {
            return Err(MrtError::Closed);
        }
        let peers: Vec<Arc<Peer>> = {
            let mut registry = lock(&self.shared.registry);
            std::iter::from_fn(|| registry.accept_next()).collect()
        };
        let mut accepted = Vec::with_capacity(peers.len());
        for peer in peers {
            accepted.push(peer.addr);
            admit(&self.shared, peer).await;
        }
        Ok(accepted)
    }

    /// Read up to `buf.len()` bytes delivered by `peer`.
    ///
    /// Waits until at least one byte is available. Returns `Ok(0)` once the
    /// peer's connection has been torn down and its buffer is empty, and
    /// `Err(NotConnected)` for an address that was never accepted.
    pub async fn receive_one(&self, peer: SocketAddr, buf: &mut [u8]) -> Result<usize, MrtError> {
        if self.shared.is_closing() {
            return Err(MrtError::Closed);
        }
        let readable = lock(&self.shared.registry).readable(&peer);
        let record = match readable {
            Readable::Live(record) => record,
            Readable::Closed => return Ok(0),
            Readable::Unknown => return Err(MrtError::NotConnected(peer)),
        };
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let mut notified = pin!(record.readable.notified());
            notified.as_mut().enable();

            let n = record.buffer().read(buf);
            if n > 0 {
                log::trace!("[receiver] {peer}: delivered {n} bytes");
                return Ok(n);
            }
            if record.is_closed() {
                lock(&self.shared.registry).forget_drained(&record);
                return Ok(0);
            }
            if self.shared.is_closing() {
                return Ok(0);
            }
            notified.await;
        }
    }

    /// First peer in `peers` with unread data, without waiting.
    pub fn probe(&self, peers: &[SocketAddr]) -> Option<SocketAddr> {
        let records: Vec<Arc<Peer>> = {
            let registry = lock(&self.shared.registry);
            peers.iter().filter_map(|addr| registry.connected(addr)).collect()
        };
        records
            .into_iter()
            .find(|record| record.buffer().unread() > 0)
            .map(|record| record.addr)
    }

    pub fn peer_state(&self, peer: SocketAddr) -> PeerState {
        lock(&self.shared.registry).state(&peer)
    }

    /// Stop the receiver: drop pending peers, cancel every connected peer's
    /// liveness checker and wake all blocked callers.
    pub async fn close(&self) {
        if !self.shared.begin_close() {
            return;
        }
        let handler = lock(&self.handler).take();
        if let Some(handler) = handler {
            let _ = handler.await;
        }
        log::info!("[receiver] {} closed", self.local_addr());
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.shared.begin_close();
    }
}

impl Shared {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Flip the close flag. Returns `false` if it was already set.
    fn begin_close(&self) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        // `notify_one` stores a permit if the handler is between awaits.
        self.shutdown.notify_one();
        self.pending_ready.notify_waiters();
        true
    }

    /// Runs once, as the inbound handler exits.
    fn release_peers(&self) {
        let (pending, connected) = lock(&self.registry).drain();
        log::debug!(
            "[receiver] dropping {} pending and {} connected peer(s)",
            pending.len(),
            connected.len()
        );
        for peer in connected {
            peer.abort_liveness();
            peer.mark_closed();
        }
    }
}

/// Send an accepted peer its ACON and start its liveness checker. The
/// peer is already in the connected map.
async fn admit(shared: &Arc<Shared>, peer: Arc<Peer>) {
    let addr = peer.addr;
    let fragment = peer.buffer().last_accepted();

    shared
        .socket
        .send_or_log(
            FrameType::Acon,
            fragment,
            shared.config.initial_window(),
            &[],
            addr,
        )
        .await;

    let finalizer_shared = Arc::clone(shared);
    let finalizer_peer = Arc::clone(&peer);
    let handle = spawn_checker(
        format!("peer {addr}"),
        Arc::clone(&peer.inactivity),
        shared.config.checker_period,
        move || {
            let mut registry = lock(&finalizer_shared.registry);
            let current = registry.connected(&finalizer_peer.addr);
            if current.is_some_and(|p| Arc::ptr_eq(&p, &finalizer_peer)) {
                registry.retire(&finalizer_peer.addr);
            }
            drop(registry);
            finalizer_peer.mark_closed();
        },
    );
    peer.set_liveness(handle);
    log::info!("[receiver] accepted {addr}");
}

/// The inbound handler: validates and dispatches every datagram.
async fn handle_inbound(shared: Arc<Shared>) {
    let mut buf = [0u8; MAX_FRAME];
    let mut failures = 0u32;
    loop {
        if shared.is_closing() {
            break;
        }
        let received = tokio::select! {
            r = shared.socket.recv_frame(&mut buf) => r,
            _ = shared.shutdown.notified() => break,
        };
        if shared.is_closing() {
            break;
        }

        let (header, payload_len, from) = match received {
            Ok(v) => v,
            Err(SocketError::Frame(e)) => {
                failures = 0;
                log::debug!("[receiver] discarded datagram: {e}");
                continue;
            }
            Err(SocketError::Io(e)) => {
                failures = failures.saturating_add(1);
                let pause = recv_backoff(failures);
                log::warn!("[receiver] recv failed ({failures} in a row): {e}; retrying in {pause:?}");
                tokio::select! {
                    _ = tokio::time::sleep(pause) => continue,
                    _ = shared.shutdown.notified() => break,
                }
            }
        };
        failures = 0;
        let payload = &buf[HEADER_LEN..HEADER_LEN + payload_len];

        match header.kind {
            FrameType::Rcon => on_rcon(&shared, from, header).await,
            FrameType::Data => on_data(&shared, from, header, payload).await,
            FrameType::Rcls => on_rcls(&shared, from).await,
            other => log::trace!("[receiver] dropped {other} from {from}"),
        }
    }
    shared.release_peers();
}

async fn on_rcon(shared: &Shared, from: SocketAddr, header: Header) {
    let duplicate_ack = {
        let mut registry = lock(&shared.registry);
        match registry.state(&from) {
            PeerState::Connected => registry.connected(&from).map(|peer| {
                let buffer = peer.buffer();
                (buffer.last_accepted(), buffer.window())
            }),
            PeerState::Pending => {
                log::trace!("[receiver] {from} already pending; RCON ignored");
                return;
            }
            PeerState::Unseen | PeerState::Closed => {
                let peer = Peer::new(from, header.fragment, &shared.config);
                registry.enqueue_pending(Arc::new(peer));
                log::debug!(
                    "[receiver] ← RCON from {from} frag={}; pending={}",
                    header.fragment,
                    registry.pending_len()
                );
                None
            }
        }
    };

    match duplicate_ack {
        Some((fragment, window)) => {
            log::debug!("[receiver] ← RCON from connected {from}; → duplicate ACON");
            shared
                .socket
                .send_or_log(FrameType::Acon, fragment, window, &[], from)
                .await;
        }
        None => shared.pending_ready.notify_waiters(),
    }
}

async fn on_data(shared: &Shared, from: SocketAddr, header: Header, payload: &[u8]) {
    let known = lock(&shared.registry).connected(&from);
    let Some(peer) = known else {
        log::trace!("[receiver] DATA from unknown {from} dropped");
        return;
    };
    if peer.is_closing() {
        return;
    }

    let (accepted, ack, window) = {
        let mut buffer = peer.buffer();
        let accepted = buffer.on_fragment(header.fragment, payload);
        (accepted, buffer.last_accepted(), buffer.window())
    };
    peer.inactivity.reset();
    if accepted {
        peer.readable.notify_waiters();
        log::debug!(
            "[receiver] ← DATA {from} frag={} len={}; → ADAT frag={ack} win={window}",
            header.fragment,
            payload.len()
        );
    }

    shared
        .socket
        .send_or_log(FrameType::Adat, ack, window, &[], from)
        .await;
}

async fn on_rcls(shared: &Shared, from: SocketAddr) {
    let connected = {
        let mut registry = lock(&shared.registry);
        match registry.connected(&from) {
            Some(peer) => Some(peer),
            None => {
                if registry.remove_pending(&from).is_some() {
                    log::debug!("[receiver] ← RCLS from pending {from}; dropped");
                }
                None
            }
        }
    };

    if let Some(peer) = connected {
        log::debug!("[receiver] ← RCLS from {from}; → ACLS");
        peer.request_close();
        shared
            .socket
            .send_or_log(FrameType::Acls, 0, 0, &[], from)
            .await;
    }
}
