//! Entry point for `microtcp`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client** mode.
//! All actual protocol work is delegated to library modules; `main.rs` owns only
//! process setup (logging, argument parsing, file I/O).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncWriteExt;

use microtcp::{Config, Connection, Simulator, SimulatorConfig, Stats};

/// Reliable byte stream over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    #[command(flatten)]
    tuning: Tuning,
}

#[derive(Subcommand)]
enum Mode {
    /// Accept one connection and write everything it sends.
    Server {
        /// Local address to bind.
        #[arg(short, long, default_value = "0.0.0.0:54321")]
        bind: SocketAddr,
        /// Write the received stream here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Connect to a server, send a file or a message, then close.
    Client {
        /// Remote server address.
        #[arg(short, long, default_value = "127.0.0.1:54321")]
        server: SocketAddr,
        /// File to send.
        #[arg(short, long, conflicts_with = "message")]
        file: Option<PathBuf>,
        /// Text to send.
        #[arg(short, long)]
        message: Option<String>,
    },
}

#[derive(Args)]
struct Tuning {
    /// Maximum segment payload in bytes.
    #[arg(long, global = true, default_value_t = microtcp::config::DEFAULT_MSS)]
    mss: usize,
    /// Receive buffer (and advertised window) in bytes.
    #[arg(long, global = true, default_value_t = microtcp::config::DEFAULT_RECV_BUF_LEN)]
    recv_buf: usize,
    /// Initial retransmission timeout in milliseconds.
    #[arg(long, global = true, default_value_t = 200)]
    ack_timeout_ms: u64,
    /// Probability of dropping an outgoing segment.
    #[arg(long, global = true, default_value_t = 0.0)]
    loss: f64,
    /// Probability of corrupting an outgoing segment.
    #[arg(long, global = true, default_value_t = 0.0)]
    corrupt: f64,
    /// Seed for the fault simulator.
    #[arg(long, global = true, default_value_t = 0)]
    seed: u64,
}

impl Tuning {
    fn config(&self) -> Config {
        let mut config = Config::default().with_mss(self.mss);
        config.recv_buf_len = self.recv_buf;
        config.init_ssthresh = self.recv_buf;
        config.timer.initial_rto = Duration::from_millis(self.ack_timeout_ms);
        config
    }

    fn simulator(&self) -> Option<Simulator> {
        if self.loss <= 0.0 && self.corrupt <= 0.0 {
            return None;
        }
        Some(Simulator::new(SimulatorConfig {
            loss_rate: self.loss,
            corrupt_rate: self.corrupt,
            seed: self.seed,
            ..SimulatorConfig::default()
        }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let mut conn = Connection::open(cli.tuning.config()).context("invalid configuration")?;
    conn.set_simulator(cli.tuning.simulator());

    match cli.mode {
        Mode::Server { bind, output } => run_server(conn, bind, output).await,
        Mode::Client {
            server,
            file,
            message,
        } => run_client(conn, server, file, message).await,
    }
}

async fn run_server(mut conn: Connection, bind: SocketAddr, output: Option<PathBuf>) -> Result<()> {
    conn.bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    log::info!("Listening on {bind}");
    conn.accept().await.context("accepting a connection")?;
    log::info!("Connection from {:?}", conn.peer_addr());

    let mut sink: Box<dyn tokio::io::AsyncWrite + Unpin> = match &output {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("creating {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let mut buf = vec![0u8; conn.config().recv_buf_len];
    let mut total = 0usize;
    loop {
        let n = conn.recv(&mut buf).await.context("receiving")?;
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n]).await?;
        total += n;
    }
    sink.flush().await?;
    log::info!("Peer finished after {total} bytes");

    let stats = conn.stats();
    conn.shutdown().await.context("closing")?;
    report(&stats);
    Ok(())
}

async fn run_client(
    mut conn: Connection,
    server: SocketAddr,
    file: Option<PathBuf>,
    message: Option<String>,
) -> Result<()> {
    let data = match (file, message) {
        (Some(path), _) => tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?,
        (None, Some(text)) => text.into_bytes(),
        (None, None) => b"Hello from microtcp!".to_vec(),
    };

    conn.connect(server)
        .await
        .with_context(|| format!("connecting to {server}"))?;
    log::info!("Connected to {server}");

    let started = std::time::Instant::now();
    let sent = conn.send(&data).await.context("sending")?;
    let elapsed = started.elapsed();
    log::info!("Sent {sent} bytes in {elapsed:?}");

    let stats = conn.stats();
    conn.shutdown().await.context("closing")?;
    report(&stats);
    Ok(())
}

fn report(stats: &Stats) {
    println!(
        "packets sent {} / received {} / lost {}",
        stats.packets_sent, stats.packets_received, stats.packets_lost
    );
    println!(
        "bytes   sent {} / received {} / lost {}",
        stats.bytes_sent, stats.bytes_received, stats.bytes_lost
    );
}
