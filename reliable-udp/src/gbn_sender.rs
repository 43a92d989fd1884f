//! Go-Back-N send-side state machine.
//!
//! [`GbnSender`] keeps a sliding window of up to `N` unacknowledged messages
//! and an unbounded backlog of payloads waiting for a free slot.
//!
//! # Protocol contract
//!
//! - Sequence numbers count **messages**, not bytes.  The first message is 0
//!   and numbers wrap around at `u32::MAX`.
//! - At most `window_size` messages are in flight at once.
//! - ACKs are **cumulative**: `ack_num = K` means the peer has delivered every
//!   message before `K` and expects `K` next.
//! - On timeout the caller retransmits **every** in-flight message, oldest
//!   first (go back N).
//! - Wrap-around comparisons treat two sequence numbers as "close" when their
//!   difference is less than `u32::MAX / 2`.
//!
//! This module only manages state; all socket I/O is the caller's responsibility.

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::packet::Packet;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Returns `true` when sequence number `a` is ≤ `b` in wrap-around space.
#[inline]
pub(crate) fn seq_le(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) <= (u32::MAX / 2)
}

// ---------------------------------------------------------------------------
// GbnEntry
// ---------------------------------------------------------------------------

/// A single in-flight message occupying one slot in the retransmit window.
#[derive(Debug, Clone)]
pub struct GbnEntry {
    pub seq: u32,
    pub payload: Vec<u8>,
    /// Total number of times this message has been transmitted.
    pub tx_count: u32,
    /// Time of the most recent transmission.
    pub sent_at: Instant,
}

// ---------------------------------------------------------------------------
// GbnSender
// ---------------------------------------------------------------------------

/// Go-Back-N send-side state for one peer.
///
/// # Sequence-number layout
///
/// ```text
///  send_base          next_seq
///      │                  │
///  ────┼──────────────────┼──────────────────▶ seq space
///      │ <── in flight ──▶│ <── backlog ─────▶
/// ```
#[derive(Debug)]
pub struct GbnSender {
    /// Sequence number of the **oldest** unacked message (left window edge).
    pub send_base: u32,

    /// Sequence number for the **next** message to enter the window.
    pub next_seq: u32,

    /// Maximum number of messages that may be in flight simultaneously (N).
    window_size: usize,

    /// In-flight messages ordered by sequence number (front = oldest).
    window: VecDeque<GbnEntry>,

    /// Payloads accepted from the application but not yet sent.
    backlog: VecDeque<Vec<u8>>,
}

impl GbnSender {
    /// Create a sender whose first message is numbered 0.
    ///
    /// A `window_size` of 0 is treated as 1.
    pub fn new(window_size: usize) -> Self {
        Self::with_start(0, window_size)
    }

    /// Create a sender whose first message is numbered `seq_start`.
    pub fn with_start(seq_start: u32, window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            send_base: seq_start,
            next_seq: seq_start,
            window_size,
            window: VecDeque::with_capacity(window_size),
            backlog: VecDeque::new(),
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// `true` when there is room for at least one more in-flight message.
    pub fn can_send(&self) -> bool {
        self.window.len() < self.window_size
    }

    /// Number of messages currently awaiting acknowledgement.
    pub fn in_flight(&self) -> usize {
        self.window.len()
    }

    /// `true` when at least one message is awaiting acknowledgement.
    pub fn has_unacked(&self) -> bool {
        !self.window.is_empty()
    }

    /// Number of payloads waiting for window space.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Queue a payload behind everything already accepted.
    pub fn push(&mut self, payload: Vec<u8>) {
        self.backlog.push_back(payload);
    }

    /// Move backlog entries into the window while it has room.
    ///
    /// Returns the DATA packets to transmit, each carrying `ack` as the
    /// piggybacked cumulative acknowledgement.
    pub fn fill(&mut self, ack: u32) -> Vec<Packet> {
        let now = Instant::now();
        let mut out = Vec::new();
        while self.can_send() {
            let Some(payload) = self.backlog.pop_front() else {
                break;
            };
            let seq = self.next_seq;
            out.push(Packet::data(seq, ack, payload.clone()));
            self.window.push_back(GbnEntry {
                seq,
                payload,
                tx_count: 1,
                sent_at: now,
            });
            self.next_seq = self.next_seq.wrapping_add(1);
        }
        out
    }

    /// Process a cumulative ACK.
    ///
    /// Removes every window entry before `ack_num`, advances `send_base`, and
    /// returns the number of newly-acknowledged messages.  Returns `0` for a
    /// duplicate or out-of-range ACK.
    pub fn on_ack(&mut self, ack_num: u32) -> usize {
        // Reject ACKs that are behind send_base or beyond next_seq.
        if !seq_le(self.send_base, ack_num) || !seq_le(ack_num, self.next_seq) {
            return 0;
        }

        let acked = ack_num.wrapping_sub(self.send_base) as usize;
        self.window.drain(..acked);
        self.send_base = ack_num;
        acked
    }

    /// Iterate over all in-flight messages from oldest to newest.
    pub fn window_entries(&self) -> impl Iterator<Item = &GbnEntry> {
        self.window.iter()
    }

    /// Rebuild every in-flight message for retransmission with a fresh
    /// piggybacked `ack`, bumping each entry's transmission count.
    pub fn retransmit(&mut self, ack: u32) -> Vec<Packet> {
        let now = Instant::now();
        self.window
            .iter_mut()
            .map(|entry| {
                entry.tx_count += 1;
                entry.sent_at = now;
                Packet::data(entry.seq, ack, entry.payload.clone())
            })
            .collect()
    }

    /// Time when the oldest in-flight message was last sent.
    ///
    /// Returns `None` when the window is empty (sender is idle).
    pub fn oldest_sent_at(&self) -> Option<Instant> {
        self.window.front().map(|e| e.sent_at)
    }

    /// Forget everything in flight and queued.
    pub fn clear(&mut self) {
        self.window.clear();
        self.backlog.clear();
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
