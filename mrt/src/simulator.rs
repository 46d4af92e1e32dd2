//! Fault-injecting datagram relay for exercising MRT over a bad network.
//!
//! A [`Simulator`] sits between one client and one upstream address:
//!
//! ```text
//!   client ──▶ front socket ─┐         ┌─▶ back socket ──▶ upstream
//!                            FaultModel
//!   client ◀── front socket ◀┘         └── back socket ◀── upstream
//! ```
//!
//! Both directions pass through the same [`FaultModel`]:
//!
//! | Fault       | Effect                                              |
//! |-------------|-----------------------------------------------------|
//! | Loss        | Datagram is not forwarded.                          |
//! | Duplication | Datagram is forwarded twice.                        |
//! | Corruption  | One random bit of the datagram is flipped.          |
//! | Delay       | Datagram is forwarded after `delay`, so later ones   |
//! |             | may overtake it.                                    |
//!
//! The model draws from a seeded [`StdRng`], so a run with a given seed
//! and the same datagram sequence makes the same decisions.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// Largest datagram the relay will carry.
const RELAY_BUF: usize = 65_536;

/// Fault probabilities, each in `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub loss_rate: f64,
    pub duplicate_rate: f64,
    pub corrupt_rate: f64,
    pub delay_rate: f64,
    /// Hold time applied to delayed datagrams.
    pub delay: Duration,
    pub seed: u64,
}

impl Default for SimulatorConfig {
    /// Transparent pass-through.
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            corrupt_rate: 0.0,
            delay_rate: 0.0,
            delay: Duration::ZERO,
            seed: 0,
        }
    }
}

/// What to do with one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Drop,
    Deliver {
        copies: usize,
        delay: Option<Duration>,
    },
}

/// Counters of injected faults, shared with the relay task.
#[derive(Debug, Default)]
pub struct FaultStats {
    pub forwarded: AtomicU64,
    pub dropped: AtomicU64,
    pub duplicated: AtomicU64,
    pub corrupted: AtomicU64,
    pub delayed: AtomicU64,
}

impl FaultStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Seeded per-datagram fault decisions.
#[derive(Debug)]
pub struct FaultModel {
    config: SimulatorConfig,
    rng: StdRng,
    stats: Arc<FaultStats>,
}

impl FaultModel {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            stats: Arc::new(FaultStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<FaultStats> {
        Arc::clone(&self.stats)
    }

    /// Decide the fate of `datagram`, corrupting it in place if chosen.
    pub fn apply(&mut self, datagram: &mut [u8]) -> Verdict {
        if self.roll(self.config.loss_rate) {
            FaultStats::bump(&self.stats.dropped);
            return Verdict::Drop;
        }
        if !datagram.is_empty() && self.roll(self.config.corrupt_rate) {
            let byte = self.rng.random_range(0..datagram.len());
            let bit = self.rng.random_range(0..8u32);
            datagram[byte] ^= 1 << bit;
            FaultStats::bump(&self.stats.corrupted);
        }
        let copies = if self.roll(self.config.duplicate_rate) {
            FaultStats::bump(&self.stats.duplicated);
            2
        } else {
            1
        };
        let delay = if self.roll(self.config.delay_rate) {
            FaultStats::bump(&self.stats.delayed);
            Some(self.config.delay)
        } else {
            None
        };
        FaultStats::bump(&self.stats.forwarded);
        Verdict::Deliver { copies, delay }
    }

    fn roll(&mut self, rate: f64) -> bool {
        rate > 0.0 && self.rng.random_bool(rate.min(1.0))
    }
}

/// A running relay. Dropping it stops the relay task.
pub struct Simulator {
    /// Address clients should send to.
    pub local_addr: SocketAddr,
    stats: Arc<FaultStats>,
    task: JoinHandle<()>,
}

impl Simulator {
    /// Bind `listen` for the client side and an ephemeral socket for the
    /// upstream side, then start relaying.
    pub async fn start(
        listen: SocketAddr,
        upstream: SocketAddr,
        config: SimulatorConfig,
    ) -> std::io::Result<Self> {
        let front = Arc::new(UdpSocket::bind(listen).await?);
        let back_addr = if upstream.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let back = Arc::new(UdpSocket::bind(back_addr).await?);
        let local_addr = front.local_addr()?;

        log::info!("[sim] relaying {local_addr} → {upstream} ({config:?})");
        let model = FaultModel::new(config);
        let stats = model.stats();
        let task = tokio::spawn(relay(front, back, upstream, model));
        Ok(Self {
            local_addr,
            stats,
            task,
        })
    }

    pub fn stats(&self) -> &FaultStats {
        &self.stats
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn relay(front: Arc<UdpSocket>, back: Arc<UdpSocket>, upstream: SocketAddr, mut model: FaultModel) {
    let mut client = None;
    let mut up = vec![0u8; RELAY_BUF];
    let mut down = vec![0u8; RELAY_BUF];
    loop {
        tokio::select! {
            r = front.recv_from(&mut up) => match r {
                Ok((n, from)) => {
                    client = Some(from);
                    forward(&mut model, &back, up[..n].to_vec(), upstream).await;
                }
                Err(e) => log::warn!("[sim] client side recv failed: {e}"),
            },
            r = back.recv_from(&mut down) => match r {
                Ok((n, _)) => match client {
                    Some(client) => forward(&mut model, &front, down[..n].to_vec(), client).await,
                    None => log::trace!("[sim] upstream datagram before any client; dropped"),
                },
                Err(e) => log::warn!("[sim] upstream side recv failed: {e}"),
            },
        }
    }
}

async fn forward(model: &mut FaultModel, socket: &Arc<UdpSocket>, mut datagram: Vec<u8>, dest: SocketAddr) {
    match model.apply(&mut datagram) {
        Verdict::Drop => log::trace!("[sim] dropped {} bytes for {dest}", datagram.len()),
        Verdict::Deliver { copies, delay: None } => {
            for _ in 0..copies {
                if let Err(e) = socket.send_to(&datagram, dest).await {
                    log::warn!("[sim] forward to {dest} failed: {e}");
                }
            }
        }
        Verdict::Deliver {
            copies,
            delay: Some(delay),
        } => {
            let socket = Arc::clone(socket);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                for _ in 0..copies {
                    let _ = socket.send_to(&datagram, dest).await;
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{self, FrameError, FrameType};

    fn model(config: SimulatorConfig) -> FaultModel {
        FaultModel::new(config)
    }

    #[test]
    fn default_config_passes_everything_untouched() {
        let mut m = model(SimulatorConfig::default());
        let original = frame::encode(FrameType::Data, 1, 0, b"payload");
        for _ in 0..100 {
            let mut d = original.clone();
            assert_eq!(
                m.apply(&mut d),
                Verdict::Deliver {
                    copies: 1,
                    delay: None
                }
            );
            assert_eq!(d, original);
        }
        assert_eq!(m.stats().forwarded.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn full_loss_drops_everything() {
        let mut m = model(SimulatorConfig {
            loss_rate: 1.0,
            ..SimulatorConfig::default()
        });
        for _ in 0..20 {
            assert_eq!(m.apply(&mut [1, 2, 3]), Verdict::Drop);
        }
        assert_eq!(m.stats().dropped.load(Ordering::Relaxed), 20);
    }

    #[test]
    fn corruption_is_caught_by_checksum() {
        let mut m = model(SimulatorConfig {
            corrupt_rate: 1.0,
            seed: 7,
            ..SimulatorConfig::default()
        });
        for _ in 0..50 {
            let mut d = frame::encode(FrameType::Adat, 3, 900, b"abc");
            m.apply(&mut d);
            assert!(matches!(
                frame::decode(&d),
                Err(FrameError::ChecksumMismatch { .. })
            ));
        }
    }

    #[test]
    fn duplication_and_delay() {
        let mut m = model(SimulatorConfig {
            duplicate_rate: 1.0,
            delay_rate: 1.0,
            delay: Duration::from_millis(5),
            ..SimulatorConfig::default()
        });
        assert_eq!(
            m.apply(&mut [0]),
            Verdict::Deliver {
                copies: 2,
                delay: Some(Duration::from_millis(5))
            }
        );
    }

    #[test]
    fn same_seed_same_decisions() {
        let config = SimulatorConfig {
            loss_rate: 0.3,
            duplicate_rate: 0.2,
            seed: 42,
            ..SimulatorConfig::default()
        };
        let mut a = model(config.clone());
        let mut b = model(config);
        for _ in 0..200 {
            assert_eq!(a.apply(&mut [9; 4]), b.apply(&mut [9; 4]));
        }
    }

    #[tokio::test]
    async fn relays_both_directions() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sim = Simulator::start(
            "127.0.0.1:0".parse().unwrap(),
            upstream.local_addr().unwrap(),
            SimulatorConfig::default(),
        )
        .await
        .unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client.send_to(b"ping", sim.local_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, relay_back) = upstream.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        upstream.send_to(b"pong", relay_back).await.unwrap();
        let (n, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(from, sim.local_addr);
    }
}
