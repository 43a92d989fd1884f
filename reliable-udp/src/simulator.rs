//! Deterministic network simulator for exercising the ARQ engine.
//!
//! Real networks drop, reorder, and duplicate packets.  To exercise the
//! reliability mechanisms without depending on actual network conditions,
//! this module provides a [`Link`] that carries [`Packet`]s one way and
//! applies a configurable fault model, and a [`Duplex`] that wires two
//! [`GoBackN`] engines together through a pair of links:
//!
//! | Fault            | Description                                       |
//! |------------------|---------------------------------------------------|
//! | Packet loss      | Drop a packet with probability `loss_rate`.       |
//! | Reordering       | Let a packet overtake the one queued before it.   |
//! | Duplication      | Deliver a packet twice.                           |
//! | Scripted drop    | Drop the next DATA packet with a given sequence.  |
//!
//! Randomness comes from a seeded [`StdRng`], so a failing run can be
//! replayed from its seed.  Time does not pass inside the simulator: the
//! test decides when a retransmission timeout happens by calling
//! [`Duplex::timeout_a`] / [`Duplex::timeout_b`].

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::gbn::{GoBackN, Output};
use crate::packet::{Packet, PacketKind};

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that any given packet is silently dropped.
    pub loss_rate: f64,
    /// Probability that a packet is swapped with the one queued before it.
    pub reorder_rate: f64,
    /// Probability that a packet is duplicated.
    pub duplicate_rate: f64,
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default: the link is a transparent FIFO.
        Self {
            loss_rate: 0.0,
            reorder_rate: 0.0,
            duplicate_rate: 0.0,
            seed: 0,
        }
    }
}

/// Fault counters for one link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub sent: usize,
    pub dropped: usize,
    pub duplicated: usize,
    pub reordered: usize,
}

/// One direction of a simulated network.
#[derive(Debug)]
pub struct Link {
    config: SimulatorConfig,
    rng: StdRng,
    queue: VecDeque<Packet>,
    scripted_drops: Vec<u32>,
    pub stats: LinkStats,
}

impl Link {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            queue: VecDeque::new(),
            scripted_drops: Vec::new(),
            stats: LinkStats::default(),
        }
    }

    /// A link that delivers everything once, in order.
    pub fn lossless() -> Self {
        Self::new(SimulatorConfig::default())
    }

    /// Drop the next DATA packet carrying `seq`, once.
    pub fn drop_data_once(&mut self, seq: u32) {
        self.scripted_drops.push(seq);
    }

    /// Put a packet on the wire, applying the fault model.
    pub fn send(&mut self, packet: Packet) {
        self.stats.sent += 1;

        if packet.kind() == Some(PacketKind::Data) {
            if let Some(i) = self.scripted_drops.iter().position(|s| *s == packet.header.seq) {
                self.scripted_drops.swap_remove(i);
                self.stats.dropped += 1;
                return;
            }
        }
        if self.roll(self.config.loss_rate) {
            self.stats.dropped += 1;
            return;
        }
        if self.roll(self.config.duplicate_rate) {
            self.stats.duplicated += 1;
            self.enqueue(packet.clone());
        }
        self.enqueue(packet);
    }

    fn enqueue(&mut self, packet: Packet) {
        self.queue.push_back(packet);
        let n = self.queue.len();
        if n >= 2 && self.roll(self.config.reorder_rate) {
            self.stats.reordered += 1;
            self.queue.swap(n - 1, n - 2);
        }
    }

    fn roll(&mut self, p: f64) -> bool {
        p > 0.0 && self.rng.random_bool(p.min(1.0))
    }

    /// Take the next packet off the wire.
    pub fn recv(&mut self) -> Option<Packet> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Two engines, `a` and `b`, connected by one link in each direction.
#[derive(Debug)]
pub struct Duplex {
    pub a: GoBackN,
    pub b: GoBackN,
    pub a_to_b: Link,
    pub b_to_a: Link,
    /// Payloads delivered to `a`'s application, in delivery order.
    pub delivered_a: Vec<Vec<u8>>,
    pub delivered_b: Vec<Vec<u8>>,
    pub failed: bool,
}

impl Duplex {
    pub fn new(a: GoBackN, b: GoBackN, a_to_b: Link, b_to_a: Link) -> Self {
        Self {
            a,
            b,
            a_to_b,
            b_to_a,
            delivered_a: Vec::new(),
            delivered_b: Vec::new(),
            failed: false,
        }
    }

    pub fn send_a(&mut self, payload: Vec<u8>) {
        let out = self.a.send(payload);
        Self::absorb(out, &mut self.a_to_b, &mut self.delivered_a, &mut self.failed);
    }

    pub fn send_b(&mut self, payload: Vec<u8>) {
        let out = self.b.send(payload);
        Self::absorb(out, &mut self.b_to_a, &mut self.delivered_b, &mut self.failed);
    }

    pub fn timeout_a(&mut self) {
        let out = self.a.on_timeout();
        Self::absorb(out, &mut self.a_to_b, &mut self.delivered_a, &mut self.failed);
    }

    pub fn timeout_b(&mut self) {
        let out = self.b.on_timeout();
        Self::absorb(out, &mut self.b_to_a, &mut self.delivered_b, &mut self.failed);
    }

    /// Deliver packets in both directions until both links are empty.
    /// Returns the number of packets delivered.
    pub fn settle(&mut self) -> usize {
        let mut moved = 0;
        loop {
            let mut progressed = false;
            if let Some(packet) = self.a_to_b.recv() {
                let out = self.b.recv(&packet);
                Self::absorb(out, &mut self.b_to_a, &mut self.delivered_b, &mut self.failed);
                progressed = true;
            }
            if let Some(packet) = self.b_to_a.recv() {
                let out = self.a.recv(&packet);
                Self::absorb(out, &mut self.a_to_b, &mut self.delivered_a, &mut self.failed);
                progressed = true;
            }
            if !progressed {
                return moved;
            }
            moved += 1;
        }
    }

    /// Alternate settling and timeouts until both engines are idle or
    /// `max_rounds` timeouts have passed.  Returns `true` when idle.
    pub fn run(&mut self, max_rounds: usize) -> bool {
        for _ in 0..max_rounds {
            self.settle();
            if self.a.is_idle() && self.b.is_idle() {
                return true;
            }
            if self.failed {
                return false;
            }
            self.timeout_a();
            self.timeout_b();
        }
        self.settle();
        self.a.is_idle() && self.b.is_idle()
    }

    fn absorb(out: Output, link: &mut Link, delivered: &mut Vec<Vec<u8>>, failed: &mut bool) {
        for packet in out.transmit {
            link.send(packet);
        }
        delivered.extend(out.deliver);
        *failed |= out.failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lossless_link_is_fifo() {
        let mut link = Link::lossless();
        for seq in 0..5 {
            link.send(Packet::data(seq, 0, vec![]));
        }
        let seqs: Vec<u32> = std::iter::from_fn(|| link.recv()).map(|p| p.header.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        assert_eq!(link.stats.dropped, 0);
    }

    #[test]
    fn scripted_drop_fires_once() {
        let mut link = Link::lossless();
        link.drop_data_once(1);
        link.send(Packet::data(1, 0, vec![]));
        link.send(Packet::data(1, 0, vec![]));
        assert_eq!(link.stats.dropped, 1);
        assert!(link.recv().is_some());
        assert!(link.is_empty());
    }

    #[test]
    fn same_seed_same_faults() {
        let config = SimulatorConfig {
            loss_rate: 0.3,
            duplicate_rate: 0.2,
            reorder_rate: 0.2,
            seed: 42,
        };
        let run = |config: SimulatorConfig| {
            let mut link = Link::new(config);
            for seq in 0..100 {
                link.send(Packet::data(seq, 0, vec![]));
            }
            std::iter::from_fn(|| link.recv())
                .map(|p| p.header.seq)
                .collect::<Vec<_>>()
        };
        assert_eq!(run(config.clone()), run(config));
    }
}
