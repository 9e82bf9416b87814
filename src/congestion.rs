//! Congestion window management.
//!
//! One scheme only: slow start while `cwnd < ssthresh`, additive increase
//! afterwards, and on any detected loss halve the threshold and collapse the
//! window to a single segment.  The window is never allowed past the peer's
//! advertised receive window, and never below one segment.

/// Sender-side congestion state, in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CongestionControl {
    cwnd: usize,
    ssthresh: usize,
    mss: usize,
}

impl CongestionControl {
    pub fn new(init_cwnd: usize, init_ssthresh: usize, mss: usize) -> Self {
        Self {
            cwnd: init_cwnd.max(mss),
            ssthresh: init_ssthresh.max(mss),
            mss,
        }
    }

    pub fn cwnd(&self) -> usize {
        self.cwnd
    }

    pub fn ssthresh(&self) -> usize {
        self.ssthresh
    }

    pub fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    /// Bytes that may be outstanding given the peer's advertised window.
    pub fn send_budget(&self, peer_window: usize) -> usize {
        self.cwnd.min(peer_window)
    }

    /// Keep `cwnd` within the peer's advertised window (floor one segment).
    pub fn clamp(&mut self, peer_window: usize) {
        self.cwnd = self.cwnd.min(peer_window.max(self.mss));
    }

    /// A cumulative ACK acknowledged new data.
    pub fn on_ack(&mut self, peer_window: usize) {
        if self.in_slow_start() {
            self.cwnd += self.mss;
        } else {
            self.cwnd += (self.mss * self.mss / self.cwnd).max(1);
        }
        self.clamp(peer_window);
    }

    /// A segment was lost (timeout or triple duplicate ACK).
    pub fn on_loss(&mut self) {
        self.ssthresh = (self.cwnd / 2).max(self.mss);
        self.cwnd = self.mss;
    }
}
