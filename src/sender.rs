//! Send-side sliding window.
//!
//! [`Sender`] tracks every segment that has been sent but not yet
//! acknowledged, and classifies incoming acknowledgements.  It does **not**
//! touch the socket or the congestion window; the transfer engine in
//! [`crate::transfer`] owns the loop and decides what to do with each
//! [`AckOutcome`].
//!
//! # Contract
//!
//! - ACKs are **cumulative**: `ack = K` means every byte before `K` arrived.
//! - On loss only the **earliest** outstanding segment is retransmitted.
//! - A pure ACK repeating `send_base` with an unchanged window while data
//!   is outstanding is a duplicate; the third one in a row signals loss
//!   (fast retransmit).  A window update is not a duplicate.
//!
//! ```text
//!  send_base          next_seq
//!      │                  │
//!  ────┼──────────────────┼──────────────────▶ seq space
//!      │ <── in flight ──▶│ <── sendable ───▶
//! ```

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::packet::{flags, Header, Packet};
use crate::seq::{seq_distance, seq_gt, seq_le, seq_lt};

/// Duplicate ACKs that trigger a fast retransmit.
pub const DUP_ACK_THRESHOLD: u32 = 3;

/// A segment occupying part of the send window.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub packet: Packet,
    /// Total number of times this segment has been transmitted.
    pub tx_count: u32,
    /// Time of the most recent transmission.
    pub sent_at: Instant,
}

impl InFlight {
    fn end(&self) -> u32 {
        self.packet
            .header
            .seq
            .wrapping_add(self.packet.payload.len() as u32)
    }
}

/// What a received acknowledgement meant for the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// New bytes were acknowledged.
    Advanced {
        bytes: usize,
        segments: usize,
        /// RTT of the newest fully acknowledged segment, if it was sent once.
        rtt_sample: Option<Duration>,
    },
    /// The ACK repeated `send_base` and the window while data is
    /// outstanding.
    Duplicate { count: u32 },
    /// Old, out-of-range or otherwise uninformative.
    Stale,
}

/// Send-side window state for one connection.
#[derive(Debug)]
pub struct Sender {
    /// Oldest unacknowledged sequence number (left window edge).
    pub send_base: u32,
    /// Sequence number for the next new byte.
    pub next_seq: u32,
    window: VecDeque<InFlight>,
    dup_acks: u32,
    /// Receive window the peer advertised with its latest acceptable ACK.
    peer_window: u16,
}

impl Sender {
    /// `seq_start` is the first data sequence number (our ISN + 1);
    /// `peer_window` the window the peer advertised during the handshake.
    pub fn new(seq_start: u32, peer_window: u16) -> Self {
        Self {
            send_base: seq_start,
            next_seq: seq_start,
            window: VecDeque::new(),
            dup_acks: 0,
            peer_window,
        }
    }

    pub fn has_unacked(&self) -> bool {
        !self.window.is_empty()
    }

    /// Number of segments awaiting acknowledgement.
    pub fn in_flight(&self) -> usize {
        self.window.len()
    }

    /// Bytes sent but not yet acknowledged.
    pub fn bytes_in_flight(&self) -> usize {
        seq_distance(self.send_base, self.next_seq)
    }

    /// Build a data segment at `next_seq`.
    ///
    /// Call [`Sender::record_sent`] with the result to claim the sequence
    /// space.
    pub fn build_data_packet(&self, payload: Vec<u8>, ack: u32, window: u16) -> Packet {
        Packet {
            header: Header {
                seq: self.next_seq,
                ack,
                control: flags::ACK,
                window,
                ..Header::default()
            },
            payload,
        }
    }

    /// Place a segment into the window and advance `next_seq`.
    pub fn record_sent(&mut self, packet: Packet, now: Instant) {
        debug_assert_eq!(packet.header.seq, self.next_seq);
        self.next_seq = self.next_seq.wrapping_add(packet.payload.len() as u32);
        self.window.push_back(InFlight {
            packet,
            tx_count: 1,
            sent_at: now,
        });
    }

    /// Process an acknowledgement number and the window advertised with it.
    ///
    /// `pure` marks a segment with no payload and no SYN/FIN; only those can
    /// count as duplicate ACKs.
    pub fn on_ack(&mut self, ack: u32, peer_window: u16, pure: bool, now: Instant) -> AckOutcome {
        // Reject ACKs behind send_base or beyond anything we sent.
        if seq_lt(ack, self.send_base) || seq_gt(ack, self.next_seq) {
            return AckOutcome::Stale;
        }
        let window_changed = peer_window != self.peer_window;
        self.peer_window = peer_window;

        if ack == self.send_base {
            if pure && self.has_unacked() && !window_changed {
                self.dup_acks += 1;
                return AckOutcome::Duplicate {
                    count: self.dup_acks,
                };
            }
            return AckOutcome::Stale;
        }

        let bytes = seq_distance(self.send_base, ack);
        self.send_base = ack;
        self.dup_acks = 0;

        let mut segments = 0;
        let mut rtt_sample = None;
        while let Some(front) = self.window.front() {
            if !seq_le(front.end(), ack) {
                // Partially covered segment stays queued; retransmitting it
                // whole is harmless, the receiver trims the overlap.
                break;
            }
            if front.tx_count == 1 {
                rtt_sample = Some(now.saturating_duration_since(front.sent_at));
            }
            self.window.pop_front();
            segments += 1;
        }

        AckOutcome::Advanced {
            bytes,
            segments,
            rtt_sample,
        }
    }

    /// The earliest unacknowledged segment.
    pub fn earliest(&self) -> Option<&Packet> {
        self.window.front().map(|e| &e.packet)
    }

    /// Mark the earliest segment as retransmitted and return a copy of it
    /// refreshed with the current `ack` and `window`.
    pub fn retransmit_earliest(&mut self, ack: u32, window: u16, now: Instant) -> Option<Packet> {
        let entry = self.window.front_mut()?;
        entry.tx_count += 1;
        entry.sent_at = now;
        entry.packet.header.ack = ack;
        entry.packet.header.window = window;
        self.dup_acks = 0;
        Some(entry.packet.clone())
    }

    /// Iterate over all in-flight segments from oldest to newest.
    pub fn window_entries(&self) -> impl Iterator<Item = &InFlight> {
        self.window.iter()
    }
}
