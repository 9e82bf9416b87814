//! Three-way connection establishment.
//!
//! ```text
//!  initiator (connect)                       acceptor (accept)
//!        │ ── SYN seq=x ───────────────────────▶ │  LISTEN
//!        │ ◀──────────── SYN+ACK seq=y ack=x+1 ── │
//!        │ ── ACK seq=x+1 ack=y+1 ────────────▶ │
//!   ESTABLISHED                             ESTABLISHED
//! ```
//!
//! SYN and SYN+ACK are retransmitted with exponential back-off until the
//! expected reply arrives or the retry budget runs out.  A reply with the
//! wrong flags or acknowledgement number aborts the attempt and the peer is
//! sent an RST.

use std::net::SocketAddr;
use std::time::Instant;

use rand::RngCore;

use crate::connection::{ConnError, Connection};
use crate::packet::{flags, Packet};
use crate::state::ConnectionState;

/// How a handshake step judges one inbound segment.
enum Verdict {
    /// The reply we were waiting for.
    Accept,
    /// A retransmission of the peer's previous step; repeat ours now.
    Resend,
    /// Irrelevant; keep waiting.
    Ignore,
    /// Abort the handshake.
    Violation(&'static str),
}

impl Connection {
    /// Actively open a connection to `peer`.
    ///
    /// Legal from CLOSED (an ephemeral socket is bound) or LISTEN.  On
    /// failure the state is left as it was.
    pub async fn connect(&mut self, peer: SocketAddr) -> Result<(), ConnError> {
        self.expect_state("connect", &[ConnectionState::Closed, ConnectionState::Listen])?;
        let prior = self.state;
        self.ensure_socket(peer).await?;

        let isn = self.rng.next_u32();
        let expected_ack = isn.wrapping_add(1);
        let syn = Packet::control(isn, 0, flags::SYN, self.local_window());
        log::debug!("[handshake] → SYN seq={isn} to {peer}");

        let reply = self
            .exchange(&syn, peer, |pkt| {
                let h = &pkt.header;
                if h.control != flags::SYN | flags::ACK {
                    Verdict::Violation("expected SYN+ACK")
                } else if h.ack != expected_ack {
                    Verdict::Violation("SYN+ACK acknowledges the wrong sequence number")
                } else {
                    Verdict::Accept
                }
            })
            .await;
        let reply = match reply {
            Ok(pkt) => pkt,
            Err(e) => {
                log::debug!("[handshake] connect to {peer} failed: {e}");
                self.state = prior;
                return Err(e);
            }
        };

        let h = reply.header;
        log::debug!("[handshake] ← SYN+ACK seq={} ack={} win={}", h.seq, h.ack, h.window);
        self.seq_number = h.ack;
        self.ack_number = h.seq.wrapping_add(1);
        self.init_win_size = h.window;
        self.curr_win_size = h.window;
        self.peer = Some(peer);

        self.send_ack().await?;
        log::debug!(
            "[handshake] → ACK seq={} ack={}",
            self.seq_number,
            self.ack_number
        );

        if let Err(e) = self.establish(peer) {
            self.send_reset(&reply, peer).await;
            self.peer = None;
            self.state = prior;
            return Err(e);
        }
        log::debug!("[handshake] established with {peer}");
        Ok(())
    }

    /// Wait for a peer to connect.  Requires LISTEN.
    ///
    /// On failure the connection stays in LISTEN and `accept` may be called
    /// again.
    pub async fn accept(&mut self) -> Result<(), ConnError> {
        self.expect_state("accept", &[ConnectionState::Listen])?;
        let deadline = self.config.accept_timeout.map(|t| Instant::now() + t);

        let (syn, peer) = match self.recv_segment(deadline).await? {
            Some(v) => v,
            None => return Err(ConnError::Timeout),
        };
        if syn.header.control != flags::SYN {
            if !syn.header.has(flags::RST) {
                self.send_reset(&syn, peer).await;
            }
            return Err(ConnError::ProtocolViolation("expected SYN"));
        }
        log::debug!(
            "[handshake] ← SYN seq={} win={} from {peer}",
            syn.header.seq,
            syn.header.window
        );

        let isn = self.rng.next_u32();
        self.seq_number = isn;
        self.ack_number = syn.header.seq.wrapping_add(1);
        self.init_win_size = syn.header.window;
        self.curr_win_size = syn.header.window;

        let expected_ack = isn.wrapping_add(1);
        let expected_seq = self.ack_number;
        let syn_ack = Packet::control(
            isn,
            self.ack_number,
            flags::SYN | flags::ACK,
            self.local_window(),
        );
        log::debug!("[handshake] → SYN+ACK seq={isn} ack={expected_seq}");

        let reply = self
            .exchange(&syn_ack, peer, |pkt| {
                let h = &pkt.header;
                if h.has(flags::SYN) {
                    if h.seq.wrapping_add(1) == expected_seq {
                        Verdict::Resend
                    } else {
                        Verdict::Ignore
                    }
                } else if !h.has(flags::ACK) {
                    Verdict::Violation("expected ACK")
                } else if h.ack != expected_ack {
                    Verdict::Violation("ACK acknowledges the wrong sequence number")
                } else if h.seq != expected_seq {
                    Verdict::Violation("ACK carries an unexpected sequence number")
                } else {
                    Verdict::Accept
                }
            })
            .await;
        let reply = match reply {
            Ok(pkt) => pkt,
            Err(e) => {
                log::debug!("[handshake] accept from {peer} failed: {e}");
                self.state = ConnectionState::Listen;
                return Err(e);
            }
        };
        log::debug!("[handshake] ← ACK seq={} ack={}", reply.header.seq, reply.header.ack);

        self.seq_number = expected_ack;
        self.curr_win_size = reply.header.window;
        if let Err(e) = self.establish(peer) {
            self.send_reset(&reply, peer).await;
            self.state = ConnectionState::Listen;
            return Err(e);
        }
        log::debug!("[handshake] established with {peer}");

        // The completing ACK may already carry data or even a FIN.
        if !reply.payload.is_empty() || reply.header.has(flags::FIN) {
            self.on_inbound(reply).await?;
        }
        Ok(())
    }

    /// Send `request` to `dest` and wait for a reply that `classify` accepts,
    /// retransmitting on every RTO expiry.
    ///
    /// An RST from `dest` ends the exchange with [`ConnError::Reset`]; a
    /// violation sends `dest` an RST and ends it with
    /// [`ConnError::ProtocolViolation`].
    async fn exchange<F>(
        &mut self,
        request: &Packet,
        dest: SocketAddr,
        mut classify: F,
    ) -> Result<Packet, ConnError>
    where
        F: FnMut(&Packet) -> Verdict,
    {
        self.timer.reset();
        self.transmit_to(request, dest).await?;
        let sent_at = Instant::now();
        self.timer.arm(sent_at);
        let mut retries = 0u32;

        loop {
            let Some((pkt, addr)) = self.recv_segment(self.timer.deadline()).await? else {
                retries += 1;
                if retries > self.max_retries() {
                    self.timer.cancel();
                    return Err(ConnError::Timeout);
                }
                self.timer.back_off();
                self.stats.packets_lost += 1;
                log::debug!(
                    "[handshake] no reply, retransmitting (attempt {retries}, rto {:?})",
                    self.timer.current_rto
                );
                self.transmit_to(request, dest).await?;
                self.timer.arm(Instant::now());
                continue;
            };
            if addr != dest {
                log::trace!("[handshake] ignoring segment from {addr}");
                continue;
            }
            if pkt.header.has(flags::RST) {
                self.timer.cancel();
                return Err(ConnError::Reset);
            }
            match classify(&pkt) {
                Verdict::Accept => {
                    if retries == 0 {
                        self.timer.record_rtt_sample(sent_at.elapsed());
                    }
                    self.timer.cancel();
                    return Ok(pkt);
                }
                Verdict::Resend => {
                    log::debug!("[handshake] peer repeated itself, resending");
                    self.transmit_to(request, dest).await?;
                }
                Verdict::Ignore => {}
                Verdict::Violation(reason) => {
                    self.timer.cancel();
                    log::debug!("[handshake] {reason}; sending RST");
                    self.send_reset(&pkt, dest).await;
                    return Err(ConnError::ProtocolViolation(reason));
                }
            }
        }
    }
}
