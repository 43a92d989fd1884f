//! Go-Back-N receive-side state machine.
//!
//! [`GbnReceiver`] delivers messages strictly in sequence order:
//!
//! - A message with seq == `rcv_nxt` is delivered, together with any buffered
//!   successors that are now contiguous.
//! - A message ahead of `rcv_nxt` but inside the window is held until the gap
//!   closes.
//! - Anything behind `rcv_nxt` is a duplicate and is discarded.
//! - Anything at or beyond `rcv_nxt + window` is dropped without an ACK.
//!
//! For every segment inside the window the caller sends a cumulative ACK
//! carrying [`GbnReceiver::ack_number`].
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility.

use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Segment
// ---------------------------------------------------------------------------

/// What the receiver did with one inbound DATA segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// In order.  Payloads to hand to the application, oldest first.
    Delivered(Vec<Vec<u8>>),
    /// Held until the missing predecessors arrive.
    Buffered,
    /// Already delivered or already buffered.
    Duplicate,
    /// Outside the receive window; discarded without acknowledgement.
    OutOfWindow,
}

impl Segment {
    /// Whether the caller should answer with a cumulative ACK.
    pub fn needs_ack(&self) -> bool {
        !matches!(self, Segment::OutOfWindow)
    }
}

// ---------------------------------------------------------------------------
// GbnReceiver
// ---------------------------------------------------------------------------

/// Go-Back-N receive-side state for one peer.
#[derive(Debug)]
pub struct GbnReceiver {
    /// Next expected sequence number.
    pub rcv_nxt: u32,

    /// Out-of-order messages keyed by sequence number.
    held: HashMap<u32, Vec<u8>>,

    /// How far past `rcv_nxt` a message may be held.
    window_size: usize,
}

impl GbnReceiver {
    /// Create a receiver expecting message 0 first.
    pub fn new(window_size: usize) -> Self {
        Self::with_start(0, window_size)
    }

    pub fn with_start(rcv_nxt: u32, window_size: usize) -> Self {
        Self {
            rcv_nxt,
            held: HashMap::new(),
            window_size: window_size.max(1),
        }
    }

    /// Process an inbound DATA segment.
    pub fn on_segment(&mut self, seq: u32, payload: Vec<u8>) -> Segment {
        let ahead = seq.wrapping_sub(self.rcv_nxt);

        if ahead == 0 {
            let mut delivered = vec![payload];
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            while let Some(next) = self.held.remove(&self.rcv_nxt) {
                delivered.push(next);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            }
            return Segment::Delivered(delivered);
        }

        // Behind rcv_nxt in wrap-around space.
        if ahead > u32::MAX / 2 {
            return Segment::Duplicate;
        }

        if ahead as usize >= self.window_size {
            return Segment::OutOfWindow;
        }

        if self.held.contains_key(&seq) {
            return Segment::Duplicate;
        }
        self.held.insert(seq, payload);
        Segment::Buffered
    }

    /// Cumulative ACK number to place in the next outbound packet.
    ///
    /// Tells the sender "I have delivered every message before this one."
    pub fn ack_number(&self) -> u32 {
        self.rcv_nxt
    }

    /// Number of out-of-order messages being held.
    pub fn held(&self) -> usize {
        self.held.len()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn delivered(seg: Segment) -> Vec<Vec<u8>> {
        match seg {
            Segment::Delivered(v) => v,
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[test]
    fn initial_state() {
        let r = GbnReceiver::new(8);
        assert_eq!(r.rcv_nxt, 0);
        assert_eq!(r.ack_number(), 0);
        assert_eq!(r.held(), 0);
    }

    #[test]
    fn in_order_segment_delivered() {
        let mut r = GbnReceiver::new(8);
        assert_eq!(delivered(r.on_segment(0, b"hello".to_vec())), vec![b"hello".to_vec()]);
        assert_eq!(r.ack_number(), 1);
    }

    #[test]
    fn gap_is_held_then_flushed_in_order() {
        let mut r = GbnReceiver::new(8);
        assert_eq!(r.on_segment(2, vec![2]), Segment::Buffered);
        assert_eq!(r.on_segment(1, vec![1]), Segment::Buffered);
        assert_eq!(r.ack_number(), 0);

        assert_eq!(delivered(r.on_segment(0, vec![0])), vec![vec![0], vec![1], vec![2]]);
        assert_eq!(r.ack_number(), 3);
        assert_eq!(r.held(), 0);
    }

    #[test]
    fn duplicate_segment_discarded() {
        let mut r = GbnReceiver::new(8);
        delivered(r.on_segment(0, vec![0]));
        assert_eq!(r.on_segment(0, vec![0]), Segment::Duplicate);
        assert_eq!(r.ack_number(), 1);
    }

    #[test]
    fn duplicate_of_held_segment_discarded() {
        let mut r = GbnReceiver::new(8);
        assert_eq!(r.on_segment(3, vec![3]), Segment::Buffered);
        assert_eq!(r.on_segment(3, vec![3]), Segment::Duplicate);
        assert_eq!(r.held(), 1);
    }

    #[test]
    fn beyond_window_dropped_without_ack() {
        let mut r = GbnReceiver::new(4);
        let seg = r.on_segment(4, vec![4]);
        assert_eq!(seg, Segment::OutOfWindow);
        assert!(!seg.needs_ack());
        assert_eq!(r.held(), 0);

        assert_eq!(r.on_segment(3, vec![3]), Segment::Buffered);
    }

    #[test]
    fn seq_wrap_around() {
        let mut r = GbnReceiver::with_start(u32::MAX, 4);
        assert_eq!(r.on_segment(0, vec![1]), Segment::Buffered);
        assert_eq!(delivered(r.on_segment(u32::MAX, vec![0])), vec![vec![0], vec![1]]);
        assert_eq!(r.ack_number(), 1);
        assert_eq!(r.on_segment(u32::MAX, vec![0]), Segment::Duplicate);
    }
}
