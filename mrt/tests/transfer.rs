//! End-to-end data transfer between a real sender and a real receiver,
//! directly and through the fault-injecting relay.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::{fast_config, init_logging, receiver, within};
use mrt::frame::MAX_PAYLOAD;
use mrt::simulator::{Simulator, SimulatorConfig};
use mrt::{ConnId, MrtConfig, MrtError, PeerState, Receiver, SendStatus, Sender};

/// Deterministic, non-repeating-looking test data.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Connect `tx` to `rx` and return the connection plus the peer address the
/// receiver assigned to it.
async fn pair(tx: &Sender, rx: &Arc<Receiver>, target: SocketAddr) -> (ConnId, SocketAddr) {
    let acceptor = {
        let rx = Arc::clone(rx);
        tokio::spawn(async move { rx.accept_one().await })
    };
    let id = within("connect", tx.connect(0, target.port(), target.ip()))
        .await
        .unwrap();
    let peer = within("accept", acceptor).await.unwrap().unwrap();
    (id, peer)
}

/// Read from `peer` until `len` bytes have arrived.
async fn read_exactly(rx: &Receiver, peer: SocketAddr, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut buf = [0u8; 1000];
    while out.len() < len {
        let n = rx.receive_one(peer, &mut buf).await.unwrap();
        assert!(n > 0, "connection closed after {} of {len} bytes", out.len());
        out.extend_from_slice(&buf[..n]);
    }
    out
}

/// Read from `peer` until the connection reports closed.
async fn read_to_close(rx: &Receiver, peer: SocketAddr) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 1000];
    loop {
        match rx.receive_one(peer, &mut buf).await.unwrap() {
            0 => return out,
            n => out.extend_from_slice(&buf[..n]),
        }
    }
}

#[tokio::test]
async fn small_message_is_delivered() {
    init_logging();
    let rx = Arc::new(receiver(fast_config()).await);
    let tx = Sender::new(fast_config());
    let (id, peer) = pair(&tx, &rx, rx.local_addr()).await;

    let status = within("send", tx.send(id, b"hello, mrt")).await.unwrap();
    assert_eq!(status, SendStatus::Delivered);
    assert_eq!(within("read", read_exactly(&rx, peer, 10)).await, b"hello, mrt");
}

#[tokio::test]
async fn large_buffer_spans_many_fragments_in_order() {
    init_logging();
    let rx = Arc::new(receiver(fast_config()).await);
    let tx = Sender::new(fast_config());
    let (id, peer) = pair(&tx, &rx, rx.local_addr()).await;

    // More than the ring and more than the receive buffer hold at once.
    let data = pattern(MAX_PAYLOAD * 25 + 17);
    let reader = {
        let rx = Arc::clone(&rx);
        let len = data.len();
        tokio::spawn(async move { read_exactly(&rx, peer, len).await })
    };

    let status = within("send", tx.send(id, &data)).await.unwrap();
    assert_eq!(status, SendStatus::Delivered);
    assert_eq!(within("reader", reader).await.unwrap(), data);
}

#[tokio::test]
async fn consecutive_sends_preserve_order() {
    init_logging();
    let rx = Arc::new(receiver(fast_config()).await);
    let tx = Sender::new(fast_config());
    let (id, peer) = pair(&tx, &rx, rx.local_addr()).await;

    let mut expected = Vec::new();
    for line in 0..20 {
        let msg = format!("line {line}\n");
        expected.extend_from_slice(msg.as_bytes());
        assert_eq!(
            within("send", tx.send(id, msg.as_bytes())).await.unwrap(),
            SendStatus::Delivered
        );
    }
    within("disconnect", tx.disconnect(id)).await.unwrap();
    assert_eq!(within("read", read_to_close(&rx, peer)).await, expected);
}

#[tokio::test]
async fn disconnect_closes_both_sides() {
    init_logging();
    let rx = Arc::new(receiver(fast_config()).await);
    let tx = Sender::new(fast_config());
    let (id, peer) = pair(&tx, &rx, rx.local_addr()).await;

    within("send", tx.send(id, b"bye")).await.unwrap();
    within("disconnect", tx.disconnect(id)).await.unwrap();

    // Buffered bytes are still readable before closure is reported.
    assert_eq!(within("read", read_to_close(&rx, peer)).await, b"bye");
    assert_eq!(rx.peer_state(peer), PeerState::Closed);

    within("sender teardown", async {
        while tx.state(id).is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert_eq!(tx.connection_count(), 0);
    assert!(matches!(
        tx.send(id, b"late").await,
        Err(MrtError::UnknownConnection(_))
    ));
}

#[tokio::test]
async fn several_senders_share_one_receiver() {
    init_logging();
    let rx = Arc::new(receiver(fast_config()).await);
    let tx = Arc::new(Sender::new(fast_config()));

    let mut conns = Vec::new();
    for _ in 0..3 {
        conns.push(pair(&tx, &rx, rx.local_addr()).await);
    }

    let mut senders = Vec::new();
    for (n, &(id, _)) in conns.iter().enumerate() {
        let tx = Arc::clone(&tx);
        let data = vec![b'a' + n as u8; MAX_PAYLOAD * 3];
        senders.push(tokio::spawn(async move { tx.send(id, &data).await }));
    }
    for (n, &(_, peer)) in conns.iter().enumerate() {
        let got = within("read", read_exactly(&rx, peer, MAX_PAYLOAD * 3)).await;
        assert!(got.iter().all(|&b| b == b'a' + n as u8));
    }
    for s in senders {
        assert_eq!(
            within("send", s).await.unwrap().unwrap(),
            SendStatus::Delivered
        );
    }
}

#[tokio::test]
async fn probe_finds_peer_with_unread_data() {
    init_logging();
    let rx = Arc::new(receiver(fast_config()).await);
    let tx = Sender::new(fast_config());
    let (idle, idle_peer) = pair(&tx, &rx, rx.local_addr()).await;
    let (busy, busy_peer) = pair(&tx, &rx, rx.local_addr()).await;

    assert_eq!(rx.probe(&[idle_peer, busy_peer]), None);
    within("send", tx.send(busy, b"x")).await.unwrap();
    assert_eq!(rx.probe(&[idle_peer, busy_peer]), Some(busy_peer));
    assert_eq!(tx.state(idle), Some(mrt::SenderState::Connected));
}

#[tokio::test]
async fn misuse_is_reported_not_fatal() {
    init_logging();
    let rx = receiver(fast_config()).await;
    let tx = Sender::new(fast_config());
    let stranger: SocketAddr = "127.0.0.1:9".parse().unwrap();

    assert!(matches!(
        tx.send(ConnId(99), b"x").await,
        Err(MrtError::UnknownConnection(ConnId(99)))
    ));
    assert!(matches!(
        tx.disconnect(ConnId(99)).await,
        Err(MrtError::UnknownConnection(_))
    ));
    let mut buf = [0u8; 8];
    assert!(matches!(
        rx.receive_one(stranger, &mut buf).await,
        Err(MrtError::NotConnected(_))
    ));
    assert_eq!(tx.state(ConnId(99)), None);
}

#[tokio::test]
async fn empty_send_is_delivered_immediately() {
    init_logging();
    let rx = Arc::new(receiver(fast_config()).await);
    let tx = Sender::new(fast_config());
    let (id, _) = pair(&tx, &rx, rx.local_addr()).await;
    assert_eq!(tx.send(id, &[]).await.unwrap(), SendStatus::Delivered);
}

#[tokio::test]
async fn closing_receiver_drops_senders() {
    init_logging();
    let rx = Arc::new(receiver(fast_config()).await);
    let tx = Sender::new(fast_config());
    let (id, peer) = pair(&tx, &rx, rx.local_addr()).await;

    within("close", rx.close()).await;
    let mut buf = [0u8; 8];
    assert!(matches!(
        rx.receive_one(peer, &mut buf).await,
        Err(MrtError::Closed)
    ));

    // The receiver stops answering; the sender's liveness checker gives up.
    let status = within("send", tx.send(id, b"into the void")).await.unwrap();
    assert_eq!(status, SendStatus::Dropped);
    assert_eq!(tx.state(id), None);
}

// ---------------------------------------------------------------------------
// Through the fault-injecting relay
// ---------------------------------------------------------------------------

/// Longer liveness so a run of lost keep-alives does not end the test.
fn lossy_config() -> MrtConfig {
    MrtConfig {
        checker_period: Duration::from_millis(100),
        timeout_ticks: 10,
        ..fast_config()
    }
}

#[tokio::test]
async fn lossy_network_still_delivers_everything_in_order() {
    init_logging();
    let rx = Arc::new(receiver(lossy_config()).await);
    let sim = Simulator::start(
        "127.0.0.1:0".parse().unwrap(),
        rx.local_addr(),
        SimulatorConfig {
            loss_rate: 0.15,
            duplicate_rate: 0.1,
            corrupt_rate: 0.1,
            seed: 0x5eed,
            ..SimulatorConfig::default()
        },
    )
    .await
    .unwrap();
    let tx = Sender::new(lossy_config());
    let (id, peer) = pair(&tx, &rx, sim.local_addr).await;

    let data = pattern(MAX_PAYLOAD * 12 + 5);
    let reader = {
        let rx = Arc::clone(&rx);
        let len = data.len();
        tokio::spawn(async move { read_exactly(&rx, peer, len).await })
    };
    let status = within("send", tx.send(id, &data)).await.unwrap();
    assert_eq!(status, SendStatus::Delivered);
    assert_eq!(within("reader", reader).await.unwrap(), data);

    let stats = sim.stats();
    use std::sync::atomic::Ordering::Relaxed;
    assert!(stats.dropped.load(Relaxed) > 0);
    assert!(stats.corrupted.load(Relaxed) > 0);
}
