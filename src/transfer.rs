//! Reliable data transfer: `send` and `recv`.
//!
//! # Send path
//!
//! `send` cuts the caller's bytes into segments of at most
//! `min(MSS, peer window)` and keeps transmitting while the bytes in flight
//! stay under `min(cwnd, peer window)`.  It returns once every byte has been
//! acknowledged.  While waiting it reacts to:
//! - a new cumulative ACK: slide the window, grow `cwnd`, sample the RTT;
//! - the third duplicate ACK: fast retransmit of the earliest segment;
//! - RTO expiry: retransmit the earliest segment and back the timer off.
//!
//! Both losses collapse `cwnd` to one segment and halve `ssthresh`.
//!
//! If nothing is in flight and the peer advertises a zero window, a single
//! byte is sent anyway as a window probe.
//!
//! # Receive path
//!
//! `recv` hands out already reassembled bytes first.  Otherwise it waits for
//! segments: in-order data is appended and cumulatively acknowledged,
//! out-of-order data is parked and answered with a duplicate ACK, and old
//! data is dropped and answered with a duplicate ACK.  The peer's FIN moves
//! the connection to CLOSING_BY_PEER and makes `recv` return `0`.

use std::time::Instant;

use crate::connection::{ConnError, Connection};
use crate::packet::{flags, Packet};
use crate::receiver::SegmentOutcome;
use crate::sender::{AckOutcome, Sender, DUP_ACK_THRESHOLD};
use crate::seq::seq_lt;
use crate::state::ConnectionState;

/// What one inbound segment did for the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Inbound {
    /// New bytes became readable.
    Data(usize),
    /// The peer's FIN was accepted.
    Fin,
    Other,
}

/// How far one `send` has got.  Lives outside the connection so a send can
/// be driven in steps with the connection lock released in between.
#[derive(Debug, Default)]
pub(crate) struct SendProgress {
    started: bool,
    offset: usize,
    retries: u32,
}

impl Connection {
    /// Reliably deliver `data` to the peer.
    ///
    /// Returns the number of bytes sent (always `data.len()` on success) once
    /// the peer has acknowledged all of them.
    pub async fn send(&mut self, data: &[u8]) -> Result<usize, ConnError> {
        let mut progress = SendProgress::default();
        while !self.send_step(data, &mut progress, None).await? {}
        log::debug!("[transfer] {} bytes delivered", data.len());
        Ok(data.len())
    }

    /// Push `data` forward once: fill the window, then handle at most one
    /// inbound segment or timer expiry, waiting no later than `slice_end`.
    ///
    /// Returns `true` once every byte has been sent and acknowledged.
    pub(crate) async fn send_step(
        &mut self,
        data: &[u8],
        progress: &mut SendProgress,
        slice_end: Option<Instant>,
    ) -> Result<bool, ConnError> {
        if progress.started {
            // A FIN from the peer does not stop our half of the stream.
            self.expect_state(
                "send",
                &[ConnectionState::Established, ConnectionState::ClosingByPeer],
            )?;
        } else {
            self.expect_state("send", &[ConnectionState::Established])?;
            progress.started = true;
        }

        progress.offset += self.fill_window(&data[progress.offset..]).await?;
        let unacked = self.sender.as_ref().is_some_and(Sender::has_unacked);
        if progress.offset == data.len() && !unacked {
            return Ok(true);
        }

        let wait = match (self.timer.deadline(), slice_end) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        match self.recv_from_peer(wait).await? {
            Some(pkt) => {
                progress.retries = 0;
                self.on_inbound(pkt).await?;
            }
            None if self.timer.expired(Instant::now()) => {
                progress.retries += 1;
                if progress.retries > self.max_retries() {
                    log::debug!(
                        "[transfer] peer silent after {} retransmissions",
                        progress.retries - 1
                    );
                    return Err(ConnError::Timeout);
                }
                self.on_retransmit_timeout().await?;
            }
            None => {}
        }
        Ok(false)
    }

    /// Receive up to `buf.len()` bytes, waiting at most the configured
    /// `recv_timeout`.
    ///
    /// Returns `Ok(0)` once the peer has closed its side and everything it
    /// sent has been read.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, ConnError> {
        let deadline = self.config.recv_timeout.map(|t| Instant::now() + t);
        self.recv_until(buf, deadline).await
    }

    /// [`Connection::recv`] with an explicit deadline (`None` waits forever).
    pub async fn recv_until(
        &mut self,
        buf: &mut [u8],
        deadline: Option<Instant>,
    ) -> Result<usize, ConnError> {
        self.expect_state(
            "recv",
            &[ConnectionState::Established, ConnectionState::ClosingByPeer],
        )?;

        loop {
            let n = self.drain(buf).await?;
            if n > 0 || buf.is_empty() {
                return Ok(n);
            }
            if self.state == ConnectionState::ClosingByPeer {
                return Ok(0);
            }

            let wait = match (deadline, self.timer.deadline()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            match self.recv_from_peer(wait).await? {
                Some(pkt) => {
                    if let Inbound::Data(n) = self.on_inbound(pkt).await? {
                        log::trace!("[transfer] {n} bytes now readable");
                    }
                }
                None => {
                    let now = Instant::now();
                    if self.timer.expired(now) {
                        self.on_retransmit_timeout().await?;
                    }
                    if deadline.is_some_and(|d| now >= d) {
                        return Err(ConnError::Timeout);
                    }
                }
            }
        }
    }

    /// Transmit as much of `rest` as the windows allow.  Returns bytes sent.
    async fn fill_window(&mut self, rest: &[u8]) -> Result<usize, ConnError> {
        let mut sent = 0;
        while sent < rest.len() {
            let ack = self.ack_number;
            let window = self.local_window();
            let peer_window = self.curr_win_size as usize;
            let budget = self.congestion.send_budget(peer_window);
            let Some(sender) = self.sender.as_mut() else {
                return Err(self.bad_state("send"));
            };

            let in_flight = sender.bytes_in_flight();
            let mut chunk = self.config.mss.min(peer_window).min(rest.len() - sent);
            if in_flight > 0 {
                if in_flight >= budget {
                    break;
                }
                chunk = chunk.min(budget - in_flight);
            }
            // Zero window with nothing outstanding: probe with one byte.
            let chunk = chunk.max(1);

            let now = Instant::now();
            let pkt = sender.build_data_packet(rest[sent..sent + chunk].to_vec(), ack, window);
            sender.record_sent(pkt.clone(), now);
            self.seq_number = sender.next_seq;
            if !self.timer.is_armed() {
                self.timer.arm(now);
            }
            log::debug!(
                "[transfer] → DATA seq={} len={} cwnd={} peer_win={} in_flight={}",
                pkt.header.seq,
                chunk,
                self.congestion.cwnd(),
                peer_window,
                in_flight + chunk
            );
            self.transmit(&pkt).await?;
            sent += chunk;
        }
        Ok(sent)
    }

    /// Hand buffered bytes to the application, announcing a reopened window.
    async fn drain(&mut self, buf: &mut [u8]) -> Result<usize, ConnError> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Ok(0);
        };
        if receiver.is_empty() {
            return Ok(0);
        }
        let was_closed = receiver.window_size() == 0;
        let n = receiver.read(buf);
        if was_closed && n > 0 {
            log::debug!("[transfer] window reopened to {}", self.local_window());
            self.send_ack().await?;
        }
        Ok(n)
    }

    /// Process one segment from the peer while connected.
    pub(crate) async fn on_inbound(&mut self, pkt: Packet) -> Result<Inbound, ConnError> {
        let h = pkt.header;

        if h.has(flags::RST) {
            log::debug!("[transfer] ← RST; connection reset");
            self.release();
            return Err(ConnError::Reset);
        }

        if h.has(flags::SYN) {
            // Our final handshake ACK got lost; the peer repeats its SYN+ACK.
            if h.has(flags::ACK) && seq_lt(h.seq, self.ack_number) {
                log::debug!("[handshake] ← duplicate SYN+ACK; re-sending ACK");
                self.send_ack().await?;
            }
            return Ok(Inbound::Other);
        }

        if h.has(flags::ACK) {
            self.curr_win_size = h.window;
            let pure = pkt.payload.is_empty() && !h.has(flags::FIN);
            self.on_ack(h.ack, pure).await?;
        }

        let mut outcome = Inbound::Other;
        let mut reply = false;

        if !pkt.payload.is_empty() {
            if let Some(n) = self.accept_payload(h.seq, &pkt.payload) {
                outcome = Inbound::Data(n);
            }
            reply = true;
        }

        if h.has(flags::FIN) {
            let fin_seq = h.seq.wrapping_add(pkt.payload.len() as u32);
            if self.accept_fin(fin_seq) {
                if self.state == ConnectionState::Established {
                    self.state = ConnectionState::ClosingByPeer;
                }
                log::debug!("[transfer] ← FIN seq={fin_seq}; peer finished sending");
                outcome = Inbound::Fin;
            }
            reply = true;
        }

        if reply {
            self.send_ack().await?;
        }
        Ok(outcome)
    }

    /// Feed inbound payload to the receiver.  Returns the number of newly
    /// readable bytes when the segment was in order.
    pub(crate) fn accept_payload(&mut self, seq: u32, payload: &[u8]) -> Option<usize> {
        let receiver = self.receiver.as_mut()?;
        let outcome = receiver.on_segment(seq, payload);
        self.ack_number = receiver.ack_number();
        match outcome {
            SegmentOutcome::Accepted(n) => {
                self.stats.bytes_received += n as u64;
                log::debug!(
                    "[transfer] ← DATA seq={seq} len={} accepted={n} ack={}",
                    payload.len(),
                    self.ack_number
                );
                Some(n)
            }
            SegmentOutcome::Buffered => {
                log::debug!("[transfer] ← DATA seq={seq} out of order; expecting {}", self.ack_number);
                None
            }
            SegmentOutcome::Duplicate => {
                log::trace!("[transfer] ← DATA seq={seq} already acknowledged");
                None
            }
            SegmentOutcome::Dropped => {
                log::debug!("[transfer] ← DATA seq={seq} dropped, receive window full");
                None
            }
        }
    }

    /// Consume the peer's FIN if it is the next thing expected.
    pub(crate) fn accept_fin(&mut self, fin_seq: u32) -> bool {
        let Some(receiver) = self.receiver.as_mut() else {
            return false;
        };
        let accepted = receiver.on_fin(fin_seq);
        self.ack_number = receiver.ack_number();
        accepted
    }

    /// Apply a cumulative acknowledgement to the send window.
    pub(crate) async fn on_ack(&mut self, ack: u32, pure: bool) -> Result<(), ConnError> {
        let now = Instant::now();
        let Some(sender) = self.sender.as_mut() else {
            return Ok(());
        };
        match sender.on_ack(ack, self.curr_win_size, pure, now) {
            AckOutcome::Advanced {
                bytes,
                segments,
                rtt_sample,
            } => {
                let unacked = sender.has_unacked();
                if let Some(rtt) = rtt_sample {
                    self.timer.record_rtt_sample(rtt);
                }
                self.congestion.on_ack(self.curr_win_size as usize);
                if unacked {
                    self.timer.arm(now);
                } else {
                    self.timer.cancel();
                }
                log::debug!(
                    "[transfer] ← ACK ack={ack} acked={bytes}B/{segments}seg cwnd={} ssthresh={} rto={:?}",
                    self.congestion.cwnd(),
                    self.congestion.ssthresh(),
                    self.timer.current_rto
                );
            }
            AckOutcome::Duplicate { count } => {
                log::trace!("[transfer] ← duplicate ACK #{count} ack={ack}");
                if count == DUP_ACK_THRESHOLD {
                    self.congestion.on_loss();
                    log::debug!(
                        "[transfer] fast retransmit at {ack}; cwnd={} ssthresh={}",
                        self.congestion.cwnd(),
                        self.congestion.ssthresh()
                    );
                    self.retransmit_earliest(now).await?;
                }
            }
            AckOutcome::Stale => {}
        }
        Ok(())
    }

    /// The retransmission timer fired.
    pub(crate) async fn on_retransmit_timeout(&mut self) -> Result<(), ConnError> {
        self.timer.back_off();
        self.congestion.on_loss();
        log::debug!(
            "[transfer] RTO expired; cwnd={} ssthresh={} rto={:?}",
            self.congestion.cwnd(),
            self.congestion.ssthresh(),
            self.timer.current_rto
        );
        self.retransmit_earliest(Instant::now()).await
    }

    async fn retransmit_earliest(&mut self, now: Instant) -> Result<(), ConnError> {
        let ack = self.ack_number;
        let window = self.local_window();
        let Some(pkt) = self
            .sender
            .as_mut()
            .and_then(|s| s.retransmit_earliest(ack, window, now))
        else {
            self.timer.cancel();
            return Ok(());
        };
        self.stats.packets_lost += 1;
        self.stats.bytes_lost += pkt.payload.len() as u64;
        log::debug!(
            "[transfer] ↻ DATA seq={} len={}",
            pkt.header.seq,
            pkt.payload.len()
        );
        self.transmit(&pkt).await?;
        self.timer.arm(now);
        Ok(())
    }
}
