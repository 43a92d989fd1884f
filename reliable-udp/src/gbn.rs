//! Go-Back-N ARQ engine for one peer.
//!
//! [`GoBackN`] ties a [`GbnSender`], a [`GbnReceiver`] and a retransmission
//! [`Timer`] together.  It never touches a socket: every call returns an
//! [`Output`] listing the packets to put on the wire and the payloads to hand
//! to the application, and the caller does the I/O.
//!
//! ```text
//!   send(payload) ──▶ backlog ──▶ window ──▶ Output.transmit (DATA)
//!   recv(packet)  ──▶ ack ──▶ slide window ──▶ Output.transmit (backlog DATA)
//!                 └─▶ data ──▶ receiver ──▶ Output.deliver + Output.transmit (ACK)
//!   on_timeout()  ──▶ Output.transmit (whole window again)
//! ```
//!
//! The timer is armed while anything is in flight and restarted whenever an
//! ACK makes progress.  When `max_retries` consecutive timeouts pass without
//! progress, [`Output::failed`] is set and the engine stops retransmitting.

use crate::config::GbnConfig;
use crate::gbn_receiver::{GbnReceiver, Segment};
use crate::gbn_sender::GbnSender;
use crate::packet::{Packet, PacketKind};
use crate::scheduler::{Timer, TimerId};

/// Work produced by one engine call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Output {
    /// Packets to send to the peer, in order.
    pub transmit: Vec<Packet>,
    /// Payloads now deliverable to the application, in sequence order.
    pub deliver: Vec<Vec<u8>>,
    /// The retry budget ran out; the peer should be considered lost.
    pub failed: bool,
}

impl Output {
    pub fn is_empty(&self) -> bool {
        self.transmit.is_empty() && self.deliver.is_empty() && !self.failed
    }
}

/// Sender, receiver and retransmission timer for one peer.
#[derive(Debug)]
pub struct GoBackN {
    config: GbnConfig,
    sender: GbnSender,
    receiver: GbnReceiver,
    timer: Timer,
    /// Consecutive timeouts without ACK progress.
    retries: u32,
    failed: bool,
}

impl GoBackN {
    pub fn new(timer: Timer, config: GbnConfig) -> Self {
        Self {
            sender: GbnSender::new(config.window_size),
            receiver: GbnReceiver::new(config.window_size),
            config,
            timer,
            retries: 0,
            failed: false,
        }
    }

    pub fn config(&self) -> &GbnConfig {
        &self.config
    }

    pub fn sender(&self) -> &GbnSender {
        &self.sender
    }

    pub fn receiver(&self) -> &GbnReceiver {
        &self.receiver
    }

    pub fn timer_id(&self) -> TimerId {
        self.timer.id()
    }

    pub fn timer_armed(&self) -> bool {
        self.timer.is_armed()
    }

    /// Nothing in flight and nothing queued.
    pub fn is_idle(&self) -> bool {
        !self.sender.has_unacked() && self.sender.backlog_len() == 0
    }

    /// `true` once the retry budget has been exhausted.
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Accept a payload for reliable, ordered delivery.
    ///
    /// It is transmitted immediately when the window has room, otherwise it
    /// waits in the backlog.
    pub fn send(&mut self, payload: Vec<u8>) -> Output {
        let mut out = Output::default();
        if self.failed {
            log::debug!("[gbn] send after failure dropped");
            return out;
        }
        self.sender.push(payload);
        self.fill(&mut out);
        out
    }

    /// Process an inbound DATA or ACK packet.  Other kinds are ignored.
    pub fn recv(&mut self, packet: &Packet) -> Output {
        let mut out = Output::default();
        if self.failed {
            return out;
        }

        if packet.has_ack() {
            self.on_ack(packet.header.ack);
        }

        if packet.kind() == Some(PacketKind::Data) {
            let seq = packet.header.seq;
            let seg = self.receiver.on_segment(seq, packet.payload.clone());
            log::trace!("[gbn] data seq={seq} -> {seg:?}");
            if seg.needs_ack() {
                out.transmit.push(Packet::ack(self.receiver.ack_number()));
            }
            if let Segment::Delivered(payloads) = seg {
                out.deliver = payloads;
            }
        }

        self.fill(&mut out);
        out
    }

    /// Handle expiry of the retransmission timer.
    pub fn on_timeout(&mut self) -> Output {
        let mut out = Output::default();
        if self.failed || !self.sender.has_unacked() {
            return out;
        }

        self.retries += 1;
        if let Some(max) = self.config.max_retries {
            if self.retries > max {
                log::warn!(
                    "[gbn] giving up after {max} retransmissions of seq {}",
                    self.sender.send_base
                );
                self.failed = true;
                self.abandon();
                out.failed = true;
                return out;
            }
        }

        out.transmit = self.sender.retransmit(self.receiver.ack_number());
        log::debug!(
            "[gbn] timeout: resending {} from seq {} (retry {})",
            out.transmit.len(),
            self.sender.send_base,
            self.retries
        );
        self.timer.start(self.config.retransmit_interval);
        out
    }

    /// Stop the timer and discard everything in flight or queued.
    pub fn abandon(&mut self) {
        self.timer.stop();
        self.sender.clear();
    }

    fn on_ack(&mut self, ack: u32) {
        let acked = self.sender.on_ack(ack);
        if acked == 0 {
            return;
        }
        log::trace!("[gbn] ack {ack} released {acked}");
        self.retries = 0;
        if self.sender.has_unacked() {
            self.timer.start(self.config.retransmit_interval);
        } else {
            self.timer.stop();
        }
    }

    /// Move backlog into the window and arm the timer if it was idle.
    fn fill(&mut self, out: &mut Output) {
        let fresh = self.sender.fill(self.receiver.ack_number());
        if fresh.is_empty() {
            return;
        }
        if !self.timer.is_armed() {
            self.timer.start(self.config.retransmit_interval);
        }
        out.transmit.extend(fresh);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::time::Duration;

    fn engine(scheduler: &Scheduler, window_size: usize, max_retries: Option<u32>) -> GoBackN {
        let config = GbnConfig {
            window_size,
            retransmit_interval: Duration::from_millis(100),
            max_retries,
        };
        GoBackN::new(scheduler.timer(), config)
    }

    fn data_seqs(out: &Output) -> Vec<u32> {
        out.transmit
            .iter()
            .filter(|p| p.kind() == Some(PacketKind::Data))
            .map(|p| p.header.seq)
            .collect()
    }

    #[tokio::test]
    async fn send_arms_timer_and_ack_disarms() {
        let s = Scheduler::new();
        let mut a = engine(&s, 4, None);
        let out = a.send(b"x".to_vec());
        assert_eq!(data_seqs(&out), vec![0]);
        assert!(a.timer_armed());

        a.recv(&Packet::ack(1));
        assert!(!a.timer_armed());
        assert!(a.is_idle());
    }

    #[tokio::test]
    async fn backlog_drains_as_acks_arrive() {
        let s = Scheduler::new();
        let mut a = engine(&s, 2, None);
        let mut sent = Vec::new();
        for i in 0..5u8 {
            sent.extend(data_seqs(&a.send(vec![i])));
        }
        assert_eq!(sent, vec![0, 1]);
        assert_eq!(a.sender().backlog_len(), 3);

        assert_eq!(data_seqs(&a.recv(&Packet::ack(2))), vec![2, 3]);
        assert!(a.timer_armed());
    }

    #[tokio::test]
    async fn data_is_acked_and_delivered() {
        let s = Scheduler::new();
        let mut b = engine(&s, 4, None);
        let out = b.recv(&Packet::data(0, 0, b"hi".to_vec()));
        assert_eq!(out.deliver, vec![b"hi".to_vec()]);
        assert_eq!(out.transmit, vec![Packet::ack(1)]);
    }

    #[tokio::test]
    async fn out_of_window_data_gets_no_ack() {
        let s = Scheduler::new();
        let mut b = engine(&s, 2, None);
        let out = b.recv(&Packet::data(5, 0, vec![5]));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn timeout_resends_whole_window() {
        let s = Scheduler::new();
        let mut a = engine(&s, 4, None);
        for i in 0..3u8 {
            a.send(vec![i]);
        }
        a.recv(&Packet::ack(1));

        let out = a.on_timeout();
        assert_eq!(data_seqs(&out), vec![1, 2]);
        assert!(a.timer_armed());
    }

    #[tokio::test]
    async fn timeout_with_empty_window_is_noop() {
        let s = Scheduler::new();
        let mut a = engine(&s, 4, Some(0));
        assert!(a.on_timeout().is_empty());
        assert!(!a.has_failed());
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_fails() {
        let s = Scheduler::new();
        let mut a = engine(&s, 4, Some(2));
        a.send(vec![0]);

        assert!(!a.on_timeout().failed);
        assert!(!a.on_timeout().failed);
        let out = a.on_timeout();
        assert!(out.failed);
        assert!(out.transmit.is_empty());
        assert!(!a.timer_armed());
        assert!(a.send(vec![1]).transmit.is_empty());
    }

    #[tokio::test]
    async fn progress_resets_retry_budget() {
        let s = Scheduler::new();
        let mut a = engine(&s, 4, Some(1));
        a.send(vec![0]);
        a.send(vec![1]);

        assert!(!a.on_timeout().failed);
        a.recv(&Packet::ack(1));
        assert!(!a.on_timeout().failed);
        assert!(a.on_timeout().failed);
    }
}
