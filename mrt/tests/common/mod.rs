//! Shared helpers for the integration tests.
//!
//! [`FakePeer`] is a raw UDP socket that speaks MRT frames through the
//! public codec, so a test can script one side of the protocol exactly and
//! observe every frame the real engine emits.

#![allow(dead_code)]

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use mrt::frame::{self, FrameType, Header, KEEPALIVE_FRAGMENT, MAX_FRAME};
use mrt::{MrtConfig, PeerState, Receiver};
use tokio::net::UdpSocket;

/// Upper bound on any single awaited step.
pub const DEADLINE: Duration = Duration::from_secs(10);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn loopback() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// Millisecond-scale periods; a silent record dies after 100 ms.
pub fn fast_config() -> MrtConfig {
    MrtConfig {
        checker_period: Duration::from_millis(20),
        timeout_ticks: 5,
        sender_period: Duration::from_millis(10),
        rcon_period: Duration::from_millis(10),
        resend_threshold: Duration::from_millis(40),
        ..MrtConfig::default()
    }
}

/// Fast sender periods with a two-second liveness threshold, for scripts
/// whose fake peer does not answer every keep-alive.
pub fn patient_config() -> MrtConfig {
    MrtConfig {
        checker_period: Duration::from_millis(200),
        timeout_ticks: 10,
        ..fast_config()
    }
}

pub async fn within<F: Future>(what: &str, fut: F) -> F::Output {
    tokio::time::timeout(DEADLINE, fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

pub async fn receiver(config: MrtConfig) -> Receiver {
    Receiver::bind("127.0.0.1:0".parse().unwrap(), config)
        .await
        .expect("bind receiver")
}

/// Poll until the receiver reports `want` for `peer`.
pub async fn wait_peer_state(rx: &Receiver, peer: SocketAddr, want: PeerState) {
    within(&format!("{peer} to become {want}"), async {
        while rx.peer_state(peer) != want {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
}

/// One decoded inbound frame.
#[derive(Debug, Clone)]
pub struct Seen {
    pub header: Header,
    pub payload: Vec<u8>,
    pub from: SocketAddr,
}

impl Seen {
    pub fn is_keepalive(&self) -> bool {
        self.header.kind == FrameType::Data && self.header.fragment == KEEPALIVE_FRAGMENT
    }
}

pub struct FakePeer {
    socket: UdpSocket,
    pub addr: SocketAddr,
}

impl FakePeer {
    pub async fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind fake peer");
        let addr = socket.local_addr().unwrap();
        Self { socket, addr }
    }

    pub async fn send(&self, kind: FrameType, fragment: i32, window: i32, payload: &[u8], dest: SocketAddr) {
        let bytes = frame::encode(kind, fragment, window, payload);
        self.send_raw(&bytes, dest).await;
    }

    pub async fn send_raw(&self, bytes: &[u8], dest: SocketAddr) {
        self.socket.send_to(bytes, dest).await.expect("fake peer send");
    }

    /// Next valid frame, or `None` if nothing arrives within `wait`.
    pub async fn recv_within(&self, wait: Duration) -> Option<Seen> {
        let mut buf = [0u8; MAX_FRAME];
        tokio::time::timeout(wait, async {
            loop {
                let (n, from) = self.socket.recv_from(&mut buf).await.expect("fake peer recv");
                if let Ok(f) = frame::decode(&buf[..n]) {
                    return Seen {
                        header: f.header,
                        payload: f.payload.to_vec(),
                        from,
                    };
                }
            }
        })
        .await
        .ok()
    }

    pub async fn recv(&self) -> Seen {
        within("a frame", async {
            loop {
                if let Some(seen) = self.recv_within(DEADLINE).await {
                    return seen;
                }
            }
        })
        .await
    }

    /// Skip frames until one satisfies `pred`.
    pub async fn recv_matching(&self, what: &str, pred: impl Fn(&Seen) -> bool) -> Seen {
        within(what, async {
            loop {
                let seen = self.recv().await;
                if pred(&seen) {
                    return seen;
                }
            }
        })
        .await
    }

    pub async fn recv_kind(&self, kind: FrameType) -> Seen {
        self.recv_matching(&format!("{kind}"), |s| s.header.kind == kind).await
    }

    /// Every frame that arrives during `span`.
    pub async fn collect_for(&self, span: Duration) -> Vec<Seen> {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + span;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if left.is_zero() {
                return seen;
            }
            match self.recv_within(left).await {
                Some(s) => seen.push(s),
                None => return seen,
            }
        }
    }
}
