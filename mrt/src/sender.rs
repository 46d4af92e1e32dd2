//! Sender Connection Engine.
//!
//! Each [`Sender::connect`] binds its own datagram socket and spawns three
//! tasks for the resulting connection:
//!
//! ```text
//!   inbound handler ◀── ACON / ADAT / ACLS ── socket
//!        │ on first ACON
//!        ├──▶ sender pump ── DATA (ring slot or keep-alive) ──▶ socket
//!        └──▶ liveness checker ── expiry ──▶ remove from table, abort tasks
//! ```
//!
//! `send` and `disconnect` never touch the socket for data: they fill and
//! wait on the connection's [`SendWindow`](crate::send_window::SendWindow)
//! while the pump does the transmitting.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::MrtConfig;
use crate::connection::{ConnId, Connection, ConnectionTable};
use crate::error::MrtError;
use crate::frame::{FrameType, Header, KEEPALIVE_FRAGMENT, MAX_FRAME, MAX_PAYLOAD};
use crate::liveness::spawn_checker;
use crate::lock;
use crate::send_window::PumpAction;
use crate::socket::{recv_backoff, Socket, SocketError};
use crate::state::SenderState;

/// Outcome of a [`Sender::send`] call on a known connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Every fragment of the buffer was acknowledged.
    Delivered,
    /// The connection was torn down before the last fragment was acknowledged.
    Dropped,
}

/// Connecting side of MRT.
///
/// Dropping a `Sender` tears down every connection it still owns.
pub struct Sender {
    inner: Arc<Inner>,
}

struct Inner {
    config: MrtConfig,
    table: Mutex<ConnectionTable>,
}

impl Default for Sender {
    fn default() -> Self {
        Self::new(MrtConfig::default())
    }
}

impl Sender {
    pub fn new(config: MrtConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                table: Mutex::new(ConnectionTable::default()),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Open a connection to `remote_addr:remote_port` from `local_port`
    /// (0 for an ephemeral port).
    ///
    /// Retries RCON every `rcon_period` until the receiver accepts; there is
    /// no timeout. Fails only if the local socket cannot be bound.
    pub async fn connect(
        &self,
        local_port: u16,
        remote_port: u16,
        remote_addr: IpAddr,
    ) -> Result<ConnId, MrtError> {
        let local = match remote_addr {
            IpAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, local_port)),
            IpAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, local_port)),
        };
        let socket = Socket::bind(local)
            .await
            .map_err(|source| MrtError::Bind { addr: local, source })?;
        let remote = SocketAddr::new(remote_addr, remote_port);

        let conn = {
            let mut table = lock(&self.inner.table);
            let id = table.allocate_id();
            let conn = Arc::new(Connection::new(id, socket, remote, &self.inner.config));
            table.insert(Arc::clone(&conn));
            conn
        };
        conn.add_task(tokio::spawn(handle_inbound(
            Arc::clone(&self.inner),
            Arc::clone(&conn),
        )));
        log::info!(
            "[sender] {} {} → {remote}: handshaking",
            conn.id,
            conn.local_addr()
        );

        let mut retry = tokio::time::interval(self.inner.config.rcon_period);
        loop {
            let mut established = pin!(conn.progress.notified());
            established.as_mut().enable();

            if conn.window.is_established() {
                break;
            }
            if conn.is_closed() {
                return Err(MrtError::Closed);
            }
            tokio::select! {
                _ = retry.tick() => {
                    log::debug!("[sender] {} → RCON frag=0", conn.id);
                    conn.socket
                        .send_or_log(FrameType::Rcon, 0, 0, &[], remote)
                        .await;
                }
                _ = established.as_mut() => {}
            }
        }

        log::info!("[sender] {} connected to {remote}", conn.id);
        Ok(conn.id)
    }

    /// Deliver `data` over connection `id`.
    ///
    /// The buffer is split into fragments of at most [`MAX_PAYLOAD`] bytes and
    /// queued as ring space frees up. Returns once the final fragment is
    /// acknowledged, or `Dropped` if the connection dies first.
    pub async fn send(&self, id: ConnId, data: &[u8]) -> Result<SendStatus, MrtError> {
        let conn = self.established(id)?;
        if data.is_empty() {
            return Ok(SendStatus::Delivered);
        }

        let mut last_fragment = 0;
        for chunk in data.chunks(MAX_PAYLOAD) {
            loop {
                let mut progress = pin!(conn.progress.notified());
                progress.as_mut().enable();

                if conn.is_closed() {
                    return Ok(SendStatus::Dropped);
                }
                if let Some(fragment) = conn.window.push(chunk.to_vec()) {
                    log::trace!("[sender] {id} queued frag={fragment} len={}", chunk.len());
                    last_fragment = fragment;
                    break;
                }
                progress.await;
            }
        }

        loop {
            let mut progress = pin!(conn.progress.notified());
            progress.as_mut().enable();

            if conn.window.is_acked(last_fragment) {
                return Ok(SendStatus::Delivered);
            }
            if conn.is_closed() {
                log::debug!("[sender] {id} closed before frag={last_fragment} was acknowledged");
                return Ok(SendStatus::Dropped);
            }
            progress.await;
        }
    }

    /// Wait for every queued fragment to be acknowledged, send one RCLS and
    /// hand the connection to its liveness checker for teardown.
    pub async fn disconnect(&self, id: ConnId) -> Result<(), MrtError> {
        let conn = self.established(id)?;
        if conn.is_closing() {
            return Ok(());
        }
        conn.set_state(SenderState::Draining);
        log::debug!("[sender] {id} draining");

        loop {
            let mut progress = pin!(conn.progress.notified());
            progress.as_mut().enable();

            if conn.is_closed() {
                return Ok(());
            }
            if conn.window.is_drained() {
                break;
            }
            progress.await;
        }

        log::debug!("[sender] {id} → RCLS");
        conn.socket
            .send_or_log(FrameType::Rcls, 0, 0, &[], conn.remote_addr)
            .await;
        conn.request_close();
        Ok(())
    }

    /// Tear down every connection immediately, without draining.
    pub fn close(&self) {
        let conns = lock(&self.inner.table).drain();
        for conn in conns {
            log::info!("[sender] {} closed by owner", conn.id);
            conn.request_close();
            conn.abort_tasks();
            conn.mark_closed();
        }
    }

    // -----------------------------------------------------------------------
    // Observability
    // -----------------------------------------------------------------------

    /// `None` once the connection has been torn down (or never existed).
    pub fn state(&self, id: ConnId) -> Option<SenderState> {
        self.lookup(id).map(|conn| conn.state())
    }

    pub fn local_addr(&self, id: ConnId) -> Option<SocketAddr> {
        self.lookup(id).map(|conn| conn.local_addr())
    }

    /// Number of connections still in the table.
    pub fn connection_count(&self) -> usize {
        lock(&self.inner.table).len()
    }

    fn lookup(&self, id: ConnId) -> Option<Arc<Connection>> {
        lock(&self.inner.table).get(id)
    }

    /// A connection whose handshake has completed.
    fn established(&self, id: ConnId) -> Result<Arc<Connection>, MrtError> {
        self.lookup(id)
            .filter(|conn| conn.window.is_established())
            .ok_or(MrtError::UnknownConnection(id))
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Per-connection tasks
// ---------------------------------------------------------------------------

async fn handle_inbound(inner: Arc<Inner>, conn: Arc<Connection>) {
    let mut buf = [0u8; MAX_FRAME];
    let mut failures = 0u32;
    loop {
        let (header, _, from) = match conn.socket.recv_frame(&mut buf).await {
            Ok(v) => v,
            Err(SocketError::Frame(e)) => {
                failures = 0;
                log::debug!("[sender] {} discarded datagram: {e}", conn.id);
                continue;
            }
            Err(SocketError::Io(e)) => {
                failures = failures.saturating_add(1);
                let pause = recv_backoff(failures);
                log::warn!(
                    "[sender] {} recv failed ({failures} in a row): {e}; retrying in {pause:?}",
                    conn.id
                );
                tokio::time::sleep(pause).await;
                continue;
            }
        };
        failures = 0;
        if from != conn.remote_addr {
            log::trace!("[sender] {} ignored frame from stranger {from}", conn.id);
            continue;
        }

        match header.kind {
            FrameType::Acon => on_acon(&inner, &conn, header),
            FrameType::Adat => on_adat(&conn, header),
            FrameType::Acls => {
                log::debug!("[sender] {} ← ACLS", conn.id);
                conn.request_close();
            }
            other => log::trace!("[sender] {} dropped {other}", conn.id),
        }
    }
}

fn on_acon(inner: &Arc<Inner>, conn: &Arc<Connection>, header: Header) {
    if !conn.window.on_handshake(header.window) {
        log::trace!("[sender] {} duplicate ACON ignored", conn.id);
        return;
    }
    log::debug!(
        "[sender] {} ← ACON frag={} win={}",
        conn.id,
        header.fragment,
        header.window
    );
    conn.inactivity.reset();
    conn.set_state(SenderState::Connected);

    conn.add_task(tokio::spawn(pump(
        Arc::clone(conn),
        inner.config.clone(),
    )));

    let table_owner = Arc::clone(inner);
    let finalized = Arc::clone(conn);
    // Not kept in `conn`'s task list: this is the task that aborts that list.
    spawn_checker(
        format!("connection {}", conn.id),
        Arc::clone(&conn.inactivity),
        inner.config.checker_period,
        move || {
            lock(&table_owner.table).remove(finalized.id);
            finalized.mark_closed();
            finalized.abort_tasks();
        },
    );

    conn.progress.notify_waiters();
}

fn on_adat(conn: &Connection, header: Header) {
    if !conn.is_closing() {
        conn.inactivity.reset();
    }
    let released = conn.window.on_ack(header.fragment, header.window);
    if released > 0 {
        log::debug!(
            "[sender] {} ← ADAT frag={} win={} (released {released})",
            conn.id,
            header.fragment,
            header.window
        );
        conn.progress.notify_waiters();
    }
}

/// Transmit buffered fragments while the peer's window allows, otherwise
/// send a keep-alive and sleep for one sender period.
async fn pump(conn: Arc<Connection>, config: MrtConfig) {
    let min_window = MAX_PAYLOAD as i32;
    while !conn.is_closing() && !conn.is_closed() {
        match conn
            .window
            .next_action(Instant::now(), min_window, config.resend_threshold)
        {
            PumpAction::Transmit { fragment, payload } => {
                log::debug!(
                    "[sender] {} → DATA frag={fragment} len={}",
                    conn.id,
                    payload.len()
                );
                conn.socket
                    .send_or_log(FrameType::Data, fragment, 0, &payload, conn.remote_addr)
                    .await;
            }
            PumpAction::Idle { rewound } => {
                if rewound {
                    log::debug!(
                        "[sender] {} no progress; resending from frag={}",
                        conn.id,
                        conn.window.last_acked().wrapping_add(1)
                    );
                }
                conn.socket
                    .send_or_log(
                        FrameType::Data,
                        KEEPALIVE_FRAGMENT,
                        0,
                        &[],
                        conn.remote_addr,
                    )
                    .await;
                tokio::time::sleep(config.sender_period).await;
            }
        }
    }
    log::trace!("[sender] {} pump stopped", conn.id);
}
