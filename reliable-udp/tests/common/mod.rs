//! Shared helpers for the loopback integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use reliable_udp::config::{Config, GbnConfig, HandshakeConfig};
use reliable_udp::{Accepted, Message, ReliableOwner, ReliableUdp};

/// Timings short enough for loopback tests.
pub fn fast_config() -> Config {
    Config {
        gbn: GbnConfig {
            window_size: 8,
            retransmit_interval: Duration::from_millis(20),
            max_retries: Some(20),
        },
        handshake: HandshakeConfig {
            retry_interval: Duration::from_millis(20),
            max_attempts: 10,
        },
    }
}

pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Owner that records every event, optionally echoing sequenced messages.
#[derive(Default)]
pub struct Recorder {
    pub echo: bool,
    pub connects: usize,
    pub accepted: Vec<Accepted>,
    pub reads: Vec<(Message, SocketAddr)>,
    pub disconnects: Vec<Option<SocketAddr>>,
}

impl Recorder {
    pub fn echoing() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    /// Payloads of sequenced messages received from `from`, in order.
    pub fn sequenced_from(&self, from: SocketAddr) -> Vec<Vec<u8>> {
        self.reads
            .iter()
            .filter(|(m, f)| *f == from && matches!(m, Message::Sequenced(_)))
            .map(|(m, _)| m.payload().to_vec())
            .collect()
    }
}

impl ReliableOwner for Recorder {
    fn connect_event(&mut self, _conn: &mut ReliableUdp) {
        self.connects += 1;
    }

    fn accept_event(&mut self, conn: &mut ReliableUdp) {
        let accepted = conn.accept().expect("accept_event without a pending peer");
        assert!(conn.accept().is_none(), "pending peer retrievable twice");
        self.accepted.push(accepted);
    }

    fn read_event(&mut self, conn: &mut ReliableUdp, msg: Message, from: SocketAddr) {
        if self.echo {
            if let Message::Sequenced(payload) = &msg {
                conn.send_to_addr(Message::Sequenced(payload.clone()), from)
                    .expect("echo");
            }
        }
        self.reads.push((msg, from));
    }

    fn disconnect_event(&mut self, _conn: &mut ReliableUdp, peer: Option<SocketAddr>) {
        self.disconnects.push(peer);
    }
}

/// A connection together with the owner receiving its events.
pub struct Node {
    pub conn: ReliableUdp,
    pub rec: Recorder,
}

impl Node {
    pub fn new(conn: ReliableUdp, rec: Recorder) -> Self {
        Self { conn, rec }
    }

    pub fn port(&self) -> u16 {
        self.conn.local_addr().expect("bound").port()
    }
}

/// Drive every node until `until` holds.  Panics after five seconds.
pub async fn pump(nodes: &mut [&mut Node], until: impl Fn(&[&mut Node]) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        for node in nodes.iter_mut() {
            node.conn.dispatch(&mut node.rec);
        }
        if until(nodes) {
            return;
        }
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Drive every node for `period` regardless of state.
pub async fn pump_for(nodes: &mut [&mut Node], period: Duration) {
    let end = Instant::now() + period;
    while Instant::now() < end {
        for node in nodes.iter_mut() {
            node.conn.dispatch(&mut node.rec);
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
