//! Inbound segment reassembly and receive-window management.
//!
//! The [`Receiver`] owns the connection's receive buffer: a fixed-capacity
//! byte array whose first `fill` bytes are received, in order, and not yet
//! read by the application.  It is responsible for:
//! - Accepting in-order payload into the buffer and advancing `rcv_nxt`.
//! - Holding out-of-order segments that fit in the window until the gap
//!   before them is filled.
//! - Recognising duplicates of already-acknowledged data.
//! - Computing the ACK number and advertised window for outbound segments.
//!
//! The receiver never sends anything; [`crate::transfer`] turns each
//! [`SegmentOutcome`] into a cumulative or duplicate ACK.

use std::collections::BTreeMap;

use crate::seq::{seq_distance, seq_le, seq_lt};

/// What happened to one inbound data segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// In order; this many new bytes became readable (including any
    /// out-of-order data the segment made contiguous).
    Accepted(usize),
    /// Ahead of `rcv_nxt`; stored for reassembly.
    Buffered,
    /// Entirely before `rcv_nxt`.
    Duplicate,
    /// No room in the window.
    Dropped,
}

/// Receive-side state for one connection.
#[derive(Debug)]
pub struct Receiver {
    /// Next expected sequence number (`RCV.NXT`).
    pub rcv_nxt: u32,
    buf: Box<[u8]>,
    fill: usize,
    out_of_order: BTreeMap<u32, Vec<u8>>,
}

impl Receiver {
    #[cfg(test)]
    fn new(rcv_nxt: u32, capacity: usize) -> Self {
        Self::from_buffer(rcv_nxt, vec![0u8; capacity].into_boxed_slice())
    }

    /// Build a receiver around an already allocated buffer.
    pub fn from_buffer(rcv_nxt: u32, buf: Box<[u8]>) -> Self {
        Self {
            rcv_nxt,
            buf,
            fill: 0,
            out_of_order: BTreeMap::new(),
        }
    }

    /// Bytes buffered and ready for the application.
    pub fn fill_level(&self) -> usize {
        self.fill
    }

    pub fn is_empty(&self) -> bool {
        self.fill == 0
    }

    /// Bytes the peer may still send beyond `rcv_nxt`.
    pub fn free_space(&self) -> usize {
        self.buf.len() - self.fill
    }

    /// Number of segments held for reassembly.
    pub fn out_of_order_segments(&self) -> usize {
        self.out_of_order.len()
    }

    /// Process the payload of an inbound segment starting at `seq`.
    pub fn on_segment(&mut self, seq: u32, payload: &[u8]) -> SegmentOutcome {
        let end = seq.wrapping_add(payload.len() as u32);
        if payload.is_empty() || seq_le(end, self.rcv_nxt) {
            return SegmentOutcome::Duplicate;
        }

        if seq_le(seq, self.rcv_nxt) {
            // Trim any prefix we already hold.
            let fresh = &payload[seq_distance(seq, self.rcv_nxt)..];
            if self.free_space() == 0 {
                return SegmentOutcome::Dropped;
            }
            let mut accepted = self.append(fresh);
            if accepted == fresh.len() {
                accepted += self.drain_out_of_order();
            }
            return SegmentOutcome::Accepted(accepted);
        }

        let offset = seq_distance(self.rcv_nxt, seq);
        if offset + payload.len() > self.free_space() {
            return SegmentOutcome::Dropped;
        }
        self.store_out_of_order(offset, payload);
        SegmentOutcome::Buffered
    }

    /// Consume the sequence number of a FIN at `fin_seq`.
    ///
    /// Returns `false` (and changes nothing) when the FIN is not the next
    /// expected sequence number.
    pub fn on_fin(&mut self, fin_seq: u32) -> bool {
        if fin_seq != self.rcv_nxt {
            return false;
        }
        self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
        self.out_of_order.clear();
        true
    }

    /// Cumulative ACK number to place in the next outbound segment.
    pub fn ack_number(&self) -> u32 {
        self.rcv_nxt
    }

    /// Advertised receive window.
    pub fn window_size(&self) -> u16 {
        self.free_space().min(u16::MAX as usize) as u16
    }

    /// Copy up to `out.len()` buffered bytes into `out`, shifting the rest to
    /// the front.  Returns the number of bytes copied.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.fill);
        out[..n].copy_from_slice(&self.buf[..n]);
        self.buf.copy_within(n..self.fill, 0);
        self.fill -= n;
        n
    }

    fn append(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free_space());
        self.buf[self.fill..self.fill + n].copy_from_slice(&data[..n]);
        self.fill += n;
        self.rcv_nxt = self.rcv_nxt.wrapping_add(n as u32);
        n
    }

    /// Park the parts of `payload` (starting `offset` bytes past `rcv_nxt`)
    /// that no stored segment covers yet.  Stored bytes never overlap, so the
    /// store holds at most one window of data.
    fn store_out_of_order(&mut self, offset: usize, payload: &[u8]) {
        let base = self.rcv_nxt;
        let end = offset + payload.len();
        let mut covered: Vec<(usize, usize)> = self
            .out_of_order
            .iter()
            .map(|(&key, data)| {
                let start = seq_distance(base, key);
                (start, start + data.len())
            })
            .filter(|&(start, stop)| start < end && stop > offset)
            .collect();
        covered.sort_unstable();
        covered.push((end, end));

        let mut cursor = offset;
        for (start, stop) in covered {
            if start > cursor {
                let piece = &payload[cursor - offset..start - offset];
                self.out_of_order
                    .insert(base.wrapping_add(cursor as u32), piece.to_vec());
            }
            cursor = cursor.max(stop);
            if cursor >= end {
                break;
            }
        }
    }

    /// Move stored segments that are now contiguous into the buffer.
    fn drain_out_of_order(&mut self) -> usize {
        let mut total = 0;
        loop {
            let rcv_nxt = self.rcv_nxt;
            let Some(key) = self
                .out_of_order
                .keys()
                .copied()
                .find(|&k| seq_le(k, rcv_nxt))
            else {
                break;
            };
            let Some(data) = self.out_of_order.remove(&key) else {
                break;
            };
            let end = key.wrapping_add(data.len() as u32);
            if !seq_lt(rcv_nxt, end) {
                continue;
            }
            let fresh = &data[seq_distance(key, rcv_nxt)..];
            let n = self.append(fresh);
            total += n;
            if n < fresh.len() {
                break;
            }
        }
        total
    }
}
