//! Entry point for `reliable-udp`.
//!
//! Parses CLI arguments and dispatches into either **server** (echo) or
//! **client** mode.  All protocol work is delegated to library modules;
//! `main.rs` owns only process setup (logging, argument parsing) and the
//! event loop.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use reliable_udp::{Config, ConnectionState, Context, Message, ReliableOwner, ReliableUdp};

/// Reliable, ordered messaging over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Listen for peers and echo every sequenced message back.
    Server {
        /// Local UDP port to bind on all interfaces.
        #[arg(short, long, default_value_t = 9000)]
        port: u16,
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Connect to a server and send each line of stdin as a message.
    Client {
        /// Server host name or address.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Server UDP port.
        #[arg(short, long, default_value_t = 9000)]
        port: u16,
        #[command(flatten)]
        tuning: Tuning,
    },
}

#[derive(Args)]
struct Tuning {
    /// Go-Back-N window size (messages in flight).
    #[arg(long)]
    window: Option<usize>,
    /// Retransmission interval in milliseconds.
    #[arg(long)]
    rto_ms: Option<u64>,
    /// Timeouts without progress before a peer is dropped (0 = never).
    #[arg(long)]
    max_retries: Option<u32>,
}

impl Tuning {
    fn into_config(self) -> Config {
        let mut config = Config::default();
        if let Some(window) = self.window {
            config.gbn.window_size = window;
        }
        if let Some(ms) = self.rto_ms {
            config.gbn.retransmit_interval = Duration::from_millis(ms);
        }
        if let Some(n) = self.max_retries {
            config.gbn.max_retries = (n > 0).then_some(n);
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let ctx = Context::new();

    let result = match cli.mode {
        Mode::Server { port, tuning } => server(&ctx, port, tuning.into_config()).await,
        Mode::Client { host, port, tuning } => {
            client(&ctx, &host, port, tuning.into_config()).await
        }
    };
    ctx.shutdown().await;
    result
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

struct Echo;

impl ReliableOwner for Echo {
    fn accept_event(&mut self, conn: &mut ReliableUdp) {
        if let Some(peer) = conn.accept() {
            log::info!("peer {} connected", peer.peer());
        }
    }

    fn read_event(&mut self, conn: &mut ReliableUdp, msg: Message, from: SocketAddr) {
        if let Message::Sequenced(payload) = msg {
            if let Err(e) = conn.send_to_addr(Message::Sequenced(payload), from) {
                log::warn!("echo to {from} failed: {e}");
            }
        }
    }

    fn disconnect_event(&mut self, _conn: &mut ReliableUdp, peer: Option<SocketAddr>) {
        match peer {
            Some(peer) => log::info!("peer {peer} lost"),
            None => log::error!("listener socket failed"),
        }
    }
}

async fn server(ctx: &Context, port: u16, config: Config) -> anyhow::Result<()> {
    let mut conn = ReliableUdp::listen(ctx, port, config)
        .with_context(|| format!("listening on port {port}"))?;
    log::info!("echo server on {:?}", conn.local_addr());

    let mut echo = Echo;
    while conn.state() == ConnectionState::Listening {
        tokio::select! {
            _ = conn.run_once(&mut echo) => {}
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    conn.disconnect();
    Ok(())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Printer {
    connected: bool,
    replies: usize,
}

impl ReliableOwner for Printer {
    fn connect_event(&mut self, conn: &mut ReliableUdp) {
        self.connected = true;
        log::info!("connected to {:?}", conn.remote_addr());
    }

    fn read_event(&mut self, _conn: &mut ReliableUdp, msg: Message, _from: SocketAddr) {
        self.replies += 1;
        println!("{}", String::from_utf8_lossy(msg.payload()));
    }

    fn disconnect_event(&mut self, _conn: &mut ReliableUdp, _peer: Option<SocketAddr>) {
        log::error!("connection lost");
    }
}

async fn client(ctx: &Context, host: &str, port: u16, config: Config) -> anyhow::Result<()> {
    let mut conn = ReliableUdp::connect(ctx, host, port, config)
        .with_context(|| format!("connecting to {host}:{port}"))?;

    let (line_tx, mut line_rx) = mpsc::unbounded_channel();
    ctx.spawn("stdin", async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    let mut printer = Printer::default();
    let mut stdin_open = true;
    let mut sent = 0;
    while conn.state().is_open() {
        tokio::select! {
            _ = conn.run_once(&mut printer) => {}
            line = line_rx.recv(), if stdin_open => match line {
                Some(line) => {
                    conn.send(Message::sequenced(line))?;
                    sent += 1;
                }
                None => stdin_open = false,
            },
        }
        // Every line has been echoed back.
        if !stdin_open && printer.connected && printer.replies >= sent {
            break;
        }
    }
    conn.disconnect();
    Ok(())
}
