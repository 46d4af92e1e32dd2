//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! MRT frames instead of raw bytes. All protocol logic lives elsewhere; this
//! module owns only byte I/O.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::frame::{self, FrameError, FrameType, Header, MAX_FRAME};

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The received datagram could not be decoded as a valid frame.
    #[error("frame decode error: {0}")]
    Frame(#[from] FrameError),
}

/// Pause after the first failed receive; doubles per consecutive failure.
const RECV_BACKOFF_BASE: Duration = Duration::from_millis(5);
const RECV_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay before retrying a receive after `failures` consecutive I/O errors.
pub fn recv_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    RECV_BACKOFF_BASE
        .saturating_mul(1 << shift)
        .min(RECV_BACKOFF_MAX)
}

/// An async, frame-oriented UDP socket.
///
/// All methods are `&self` so the socket can be shared across tasks.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after the OS assigns an
    /// ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing port 0 lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> std::io::Result<Self> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Encode a frame and send it as a single datagram to `dest`.
    pub async fn send_frame(
        &self,
        kind: FrameType,
        fragment: i32,
        window: i32,
        payload: &[u8],
        dest: SocketAddr,
    ) -> Result<(), SocketError> {
        let bytes = frame::encode(kind, fragment, window, payload);
        self.inner.send_to(&bytes, dest).await?;
        Ok(())
    }

    /// Send a frame, logging instead of failing.
    ///
    /// A failed send is treated like a lost datagram.
    pub async fn send_or_log(
        &self,
        kind: FrameType,
        fragment: i32,
        window: i32,
        payload: &[u8],
        dest: SocketAddr,
    ) {
        if let Err(e) = self.send_frame(kind, fragment, window, payload, dest).await {
            log::warn!("[mrt] send {kind} to {dest} failed: {e}");
        }
    }

    /// Receive the next datagram into `buf` and decode its header.
    ///
    /// Returns `(header, payload_len, sender_address)`; the payload occupies
    /// `buf[HEADER_LEN..HEADER_LEN + payload_len]`. Datagrams that fail to
    /// decode are returned as `Err(SocketError::Frame)`; the caller
    /// discards them and keeps reading.
    pub async fn recv_frame(
        &self,
        buf: &mut [u8; MAX_FRAME],
    ) -> Result<(Header, usize, SocketAddr), SocketError> {
        let (n, addr) = self.inner.recv_from(buf).await?;
        let frame = frame::decode(&buf[..n])?;
        Ok((frame.header, frame.payload.len(), addr))
    }
}
