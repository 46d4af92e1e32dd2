//! Sender-side connection records and the table that indexes them.
//!
//! A [`Connection`] owns the complete state for one outbound MRT
//! connection: its socket, its [`SendWindow`], its inactivity counter and
//! the handles of the tasks that drive it. Records are shared as
//! `Arc<Connection>` between the caller-facing API, the inbound handler,
//! the sender pump and the liveness checker; the [`ConnectionTable`] is the
//! lookup by identifier.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::MrtConfig;
use crate::liveness::Inactivity;
use crate::lock;
use crate::send_window::SendWindow;
use crate::socket::Socket;
use crate::state::SenderState;

/// Locally assigned connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u32);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One outbound connection.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnId,
    pub remote_addr: SocketAddr,
    pub(crate) socket: Socket,
    pub(crate) window: SendWindow,
    pub(crate) inactivity: Arc<Inactivity>,
    state: Mutex<SenderState>,
    /// Set by `disconnect` or ACLS: the pump stops and ADATs no longer
    /// refresh liveness.
    close_requested: AtomicBool,
    closed: AtomicBool,
    /// Signalled on handshake completion, acknowledgment progress and teardown.
    pub(crate) progress: Notify,
    /// Inbound handler and sender pump. The liveness checker is not kept
    /// here: it is the task that aborts these.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(id: ConnId, socket: Socket, remote_addr: SocketAddr, config: &MrtConfig) -> Self {
        Self {
            id,
            remote_addr,
            socket,
            window: SendWindow::new(),
            inactivity: Arc::new(Inactivity::new(config.timeout_threshold())),
            state: Mutex::new(SenderState::Handshaking),
            close_requested: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            progress: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    pub fn state(&self) -> SenderState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, state: SenderState) {
        *lock(&self.state) = state;
    }

    /// Hand teardown to the liveness checker.
    pub(crate) fn request_close(&self) {
        self.close_requested.store(true, Ordering::Release);
        self.inactivity.force_expire();
        self.progress.notify_waiters();
    }

    pub fn is_closing(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Final transition; wakes every caller blocked on this connection.
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.set_state(SenderState::Closed);
        self.progress.notify_waiters();
    }

    pub(crate) fn add_task(&self, handle: JoinHandle<()>) {
        lock(&self.tasks).push(handle);
    }

    pub(crate) fn abort_tasks(&self) {
        for handle in lock(&self.tasks).drain(..) {
            handle.abort();
        }
    }
}

/// Open connections by identifier.
///
/// The map is released when the last connection leaves and rebuilt on the
/// next insert, so an idle process holds no table at all.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    conns: Option<HashMap<ConnId, Arc<Connection>>>,
    last_id: u32,
}

impl ConnectionTable {
    pub fn allocate_id(&mut self) -> ConnId {
        self.last_id = self.last_id.wrapping_add(1);
        ConnId(self.last_id)
    }

    pub fn insert(&mut self, conn: Arc<Connection>) {
        self.conns.get_or_insert_with(HashMap::new).insert(conn.id, conn);
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.conns.as_ref()?.get(&id).cloned()
    }

    pub fn remove(&mut self, id: ConnId) -> Option<Arc<Connection>> {
        let conns = self.conns.as_mut()?;
        let removed = conns.remove(&id);
        if conns.is_empty() {
            self.conns = None;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.conns.as_ref().map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` while the backing map exists.
    pub fn is_allocated(&self) -> bool {
        self.conns.is_some()
    }

    /// Every open connection, for shutdown.
    pub fn drain(&mut self) -> Vec<Arc<Connection>> {
        self.conns
            .take()
            .map(|conns| conns.into_values().collect())
            .unwrap_or_default()
    }
}
