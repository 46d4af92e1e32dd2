//! Entry point for `mrt`.
//!
//! Command-line harnesses around the library: a line-oriented sender, a
//! receiver that prints what N senders deliver, a number generator to feed
//! the sender, and a fault-injecting relay to put between them. All
//! protocol work is delegated to library modules; `main.rs` owns only
//! process setup (logging, argument parsing).

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use mrt::simulator::{Simulator, SimulatorConfig};
use mrt::{MrtConfig, Receiver, SendStatus, Sender};
use tokio::io::AsyncBufReadExt;

const DEFAULT_PORT: u16 = 4242;
const READ_CHUNK: usize = 1000;

/// Mini Reliable Transport over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    timing: Timing,

    #[command(subcommand)]
    mode: Mode,
}

/// Protocol timing overrides, in milliseconds.
#[derive(Args)]
struct Timing {
    /// Liveness checker period.
    #[arg(long, global = true, default_value_t = 2000)]
    checker_ms: u64,
    /// Checker periods of silence before a connection is dropped.
    #[arg(long, global = true, default_value_t = 5)]
    timeout_ticks: u32,
    /// Sender idle period between keep-alives.
    #[arg(long, global = true, default_value_t = 500)]
    sender_ms: u64,
    /// Handshake retry period.
    #[arg(long, global = true, default_value_t = 500)]
    rcon_ms: u64,
    /// Time without acknowledgment progress before resending.
    #[arg(long, global = true, default_value_t = 1500)]
    resend_ms: u64,
}

impl Timing {
    fn config(&self) -> MrtConfig {
        MrtConfig {
            checker_period: Duration::from_millis(self.checker_ms),
            timeout_ticks: self.timeout_ticks,
            sender_period: Duration::from_millis(self.sender_ms),
            rcon_period: Duration::from_millis(self.rcon_ms),
            resend_threshold: Duration::from_millis(self.resend_ms),
            ..MrtConfig::default()
        }
    }
}

#[derive(Subcommand)]
enum Mode {
    /// Send stdin, line by line, over one connection, then disconnect.
    Sender {
        /// Receiver address.
        #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
        remote: IpAddr,
        /// Receiver port.
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Local port (0 = ephemeral).
        #[arg(short, long, default_value_t = 0)]
        local_port: u16,
    },
    /// Accept N connections, then print each one's data in accept order.
    Receiver {
        /// Number of senders to wait for.
        connections: usize,
        /// Port to listen on.
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Print the numbers 0..=max, one per line or comma separated.
    Numbers {
        max: u64,
        #[arg(long)]
        comma: bool,
    },
    /// Relay datagrams between a client and an upstream, injecting faults.
    Relay {
        #[arg(long)]
        listen: SocketAddr,
        #[arg(long)]
        upstream: SocketAddr,
        #[arg(long, default_value_t = 0.0)]
        loss: f64,
        #[arg(long, default_value_t = 0.0)]
        duplicate: f64,
        #[arg(long, default_value_t = 0.0)]
        corrupt: f64,
        #[arg(long, default_value_t = 0.0)]
        delay_rate: f64,
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.timing.config();

    match cli.mode {
        Mode::Sender {
            remote,
            port,
            local_port,
        } => run_sender(config, remote, port, local_port).await,
        Mode::Receiver { connections, port } => run_receiver(config, connections, port).await,
        Mode::Numbers { max, comma } => write_numbers(max, comma),
        Mode::Relay {
            listen,
            upstream,
            loss,
            duplicate,
            corrupt,
            delay_rate,
            delay_ms,
            seed,
        } => {
            let sim = Simulator::start(
                listen,
                upstream,
                SimulatorConfig {
                    loss_rate: loss,
                    duplicate_rate: duplicate,
                    corrupt_rate: corrupt,
                    delay_rate,
                    delay: Duration::from_millis(delay_ms),
                    seed,
                },
            )
            .await
            .with_context(|| format!("starting relay on {listen}"))?;
            log::info!("Relay up on {}; Ctrl-C to stop", sim.local_addr);
            tokio::signal::ctrl_c().await?;
            Ok(())
        }
    }
}

async fn run_sender(config: MrtConfig, remote: IpAddr, port: u16, local_port: u16) -> anyhow::Result<()> {
    let sender = Sender::new(config);
    let id = sender
        .connect(local_port, port, remote)
        .await
        .context("mrt connect failed")?;
    log::info!("Connected as {id}");

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut data = line.into_bytes();
        data.push(b'\n');
        for chunk in data.chunks(READ_CHUNK) {
            if sender.send(id, chunk).await? == SendStatus::Dropped {
                anyhow::bail!("connection {id} dropped by the receiver");
            }
        }
    }

    eprintln!("[EOF received; ending data collection...]");
    sender.disconnect(id).await?;
    Ok(())
}

async fn run_receiver(config: MrtConfig, connections: usize, port: u16) -> anyhow::Result<()> {
    let receiver = Receiver::open(port, config)
        .await
        .context("mrt open failed")?;

    let mut peers = Vec::with_capacity(connections);
    for _ in 0..connections {
        peers.push(receiver.accept_one().await?);
    }

    let mut buf = [0u8; READ_CHUNK];
    let stdout = std::io::stdout();
    for peer in peers {
        log::info!("Reading from {peer}");
        loop {
            let n = receiver.receive_one(peer, &mut buf).await?;
            if n == 0 {
                break;
            }
            let mut out = stdout.lock();
            out.write_all(&buf[..n])?;
            out.flush()?;
        }
    }

    receiver.close().await;
    Ok(())
}

fn write_numbers(max: u64, comma: bool) -> anyhow::Result<()> {
    let delimiter = if comma { ", " } else { "\n" };
    let mut out = std::io::BufWriter::new(std::io::stdout().lock());
    for i in 0..=max {
        write!(out, "{i}{delimiter}")?;
    }
    out.flush()?;
    Ok(())
}
