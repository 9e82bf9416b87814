//! Connection teardown.
//!
//! ```text
//!  active side (shutdown from ESTABLISHED)      passive side
//!        │ ── FIN+ACK seq=u ──────────────────────▶ │
//!        │ ◀──────────────────── ACK ack=u+1 ────── │ CLOSING_BY_PEER (recv → 0)
//!  CLOSING_BY_HOST                                  │
//!        │ ◀──────────── FIN+ACK seq=v ack=u+1 ──── │ (shutdown)
//!        │ ── ACK seq=u+1 ack=v+1 ────────────────▶ │
//!     CLOSED                                      CLOSED
//! ```
//!
//! The FIN is retransmitted on RTO expiry.  Data or a repeated FIN from the
//! peer while closing is acknowledged so the peer can make progress.  The
//! passive side gives up on a missing final ACK after the retry budget and
//! closes anyway; the active side fails with a timeout if the peer's FIN does
//! not show up within `fin_wait_timeout`.

use std::time::Instant;

use crate::connection::{ConnError, Connection};
use crate::packet::{flags, Packet};
use crate::sender::Sender;
use crate::state::ConnectionState;

impl Connection {
    /// Close the connection.
    ///
    /// From ESTABLISHED this is an active close; from CLOSING_BY_PEER (after
    /// `recv` reported the peer's FIN) it completes a passive close.  Any other
    /// state, including CLOSED after a previous `shutdown`, is an error.
    pub async fn shutdown(&mut self) -> Result<(), ConnError> {
        let passive = match self.state {
            ConnectionState::Established => false,
            ConnectionState::ClosingByPeer => true,
            state => {
                return Err(ConnError::BadState {
                    op: "shutdown",
                    state,
                })
            }
        };

        let fin_seq = self.seq_number;
        let fin = Packet::control(
            fin_seq,
            self.ack_number,
            flags::FIN | flags::ACK,
            self.local_window(),
        );
        log::debug!(
            "[teardown] → FIN seq={fin_seq} ({})",
            if passive { "passive" } else { "active" }
        );
        self.timer.reset();
        self.transmit(&fin).await?;
        self.seq_number = fin_seq.wrapping_add(1);
        self.timer.arm(Instant::now());

        let mut fin_acked = false;
        let mut peer_fin = passive;
        let mut linger: Option<Instant> = None;
        let mut retries = 0u32;

        while !(fin_acked && peer_fin) {
            let deadline = if fin_acked { linger } else { self.timer.deadline() };
            let Some(pkt) = self.recv_from_peer(deadline).await? else {
                if fin_acked {
                    log::debug!("[teardown] peer FIN did not arrive in time");
                    return Err(ConnError::Timeout);
                }
                retries += 1;
                if retries > self.max_retries() {
                    if passive {
                        log::warn!("[teardown] final ACK never arrived; closing anyway");
                        self.release();
                        return Ok(());
                    }
                    self.timer.cancel();
                    return Err(ConnError::Timeout);
                }
                self.retransmit_closing(&fin).await?;
                continue;
            };
            retries = 0;
            let h = pkt.header;

            if h.has(flags::RST) {
                log::debug!("[teardown] ← RST");
                self.release();
                return Err(ConnError::Reset);
            }

            if h.has(flags::ACK) {
                self.curr_win_size = h.window;
                if !fin_acked && h.ack == self.seq_number {
                    fin_acked = true;
                    self.timer.cancel();
                    log::debug!("[teardown] ← ACK of FIN");
                    if !passive {
                        self.state = ConnectionState::ClosingByHost;
                        linger = Some(Instant::now() + self.config.fin_wait_timeout);
                    }
                } else if !fin_acked {
                    // Acknowledges data sent before the FIN.
                    self.on_ack(h.ack, false).await?;
                    if !self.timer.is_armed() {
                        self.timer.arm(Instant::now());
                    }
                }
            }

            let mut reply = false;
            if !pkt.payload.is_empty() {
                self.accept_payload(h.seq, &pkt.payload);
                reply = true;
            }
            if h.has(flags::FIN) {
                let peer_fin_seq = h.seq.wrapping_add(pkt.payload.len() as u32);
                if self.accept_fin(peer_fin_seq) {
                    log::debug!("[teardown] ← FIN seq={peer_fin_seq}");
                    peer_fin = true;
                } else {
                    log::debug!("[teardown] ← repeated FIN seq={peer_fin_seq}; re-acknowledging");
                }
                reply = true;
            }
            if reply {
                self.send_ack().await?;
            }
        }

        log::debug!(
            "[teardown] closed (seq={} ack={})",
            self.seq_number,
            self.ack_number
        );
        self.release();
        Ok(())
    }

    /// Retransmit whatever the peer is missing: unacknowledged data first,
    /// otherwise the FIN itself.
    async fn retransmit_closing(&mut self, fin: &Packet) -> Result<(), ConnError> {
        if self.sender.as_ref().is_some_and(Sender::has_unacked) {
            return self.on_retransmit_timeout().await;
        }
        self.timer.back_off();
        self.stats.packets_lost += 1;
        log::debug!(
            "[teardown] ↻ FIN seq={} rto={:?}",
            fin.header.seq,
            self.timer.current_rto
        );
        self.transmit(fin).await?;
        self.timer.arm(Instant::now());
        Ok(())
    }
}
