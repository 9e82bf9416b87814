//! Retransmission timer.
//!
//! Reliable delivery requires that unacknowledged segments are re-sent if no
//! ACK arrives within a bounded time.  [`RetransmitTimer`] is a single
//! per-connection timer: it is *armed* with a deadline when the oldest
//! outstanding segment is sent, and the connection checks that deadline every
//! time it waits for the socket.  There is no background task.
//!
//! RTO is computed using Jacobson's algorithm (RFC 6298):
//!   `RTO = SRTT + 4 × RTTVAR`
//! and doubles on each consecutive timeout (exponential back-off) up to a
//! configurable maximum.

use std::time::{Duration, Instant};

/// Adjustable timeout parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerConfig {
    /// RTO before any RTT sample is available.
    pub initial_rto: Duration,
    /// Lower bound for a computed RTO.
    pub min_rto: Duration,
    /// Maximum RTO after repeated back-off.
    pub max_rto: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_millis(200),
            min_rto: Duration::from_millis(20),
            max_rto: Duration::from_secs(5),
        }
    }
}

/// The retransmit timer for one connection.
#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    pub config: TimerConfig,
    /// Current RTO, updated after each RTT sample.
    pub current_rto: Duration,
    /// Smoothed RTT estimate (SRTT).
    pub srtt: Option<Duration>,
    /// RTT variance estimate (RTTVAR).
    pub rttvar: Option<Duration>,
    deadline: Option<Instant>,
}

impl Default for RetransmitTimer {
    fn default() -> Self {
        Self::new(TimerConfig::default())
    }
}

impl RetransmitTimer {
    pub fn new(config: TimerConfig) -> Self {
        let rto = config.initial_rto;
        Self {
            config,
            current_rto: rto,
            srtt: None,
            rttvar: None,
            deadline: None,
        }
    }

    /// Record a new RTT sample and update SRTT / RTTVAR / RTO (RFC 6298 §2).
    ///
    /// On the first sample:  SRTT = R,  RTTVAR = R/2.
    /// Subsequent samples:   RTTVAR = 3/4·RTTVAR + 1/4·|SRTT − R|
    ///                       SRTT   = 7/8·SRTT   + 1/8·R
    pub fn record_rtt_sample(&mut self, sample: Duration) {
        match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => {
                let diff = sample.abs_diff(srtt);
                self.rttvar = Some(rttvar * 3 / 4 + diff / 4);
                self.srtt = Some(srtt * 7 / 8 + sample / 8);
            }
            _ => {
                self.srtt = Some(sample);
                self.rttvar = Some(sample / 2);
            }
        }
        self.reset();
    }

    /// Double the RTO on retransmit timeout (RFC 6298 §5.5), capped at
    /// `config.max_rto`.
    pub fn back_off(&mut self) {
        self.current_rto = (self.current_rto * 2).min(self.config.max_rto);
    }

    /// Restore `current_rto` from the current SRTT / RTTVAR estimates.
    ///
    /// Falls back to `initial_rto` before the first RTT sample is available.
    pub fn reset(&mut self) {
        self.current_rto = match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => (srtt + rttvar * 4)
                .clamp(self.config.min_rto, self.config.max_rto),
            _ => self.config.initial_rto,
        };
    }

    /// Start (or restart) the timer so it expires one RTO after `now`.
    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.current_rto);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// `true` when the timer is armed and its deadline has passed.
    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer() -> RetransmitTimer {
        RetransmitTimer::new(TimerConfig {
            initial_rto: Duration::from_millis(100),
            min_rto: Duration::from_millis(10),
            max_rto: Duration::from_millis(800),
        })
    }

    #[test]
    fn starts_at_initial_rto_and_disarmed() {
        let t = timer();
        assert_eq!(t.current_rto, Duration::from_millis(100));
        assert!(!t.is_armed());
        assert!(!t.expired(Instant::now()));
    }

    #[test]
    fn back_off_doubles_up_to_max() {
        let mut t = timer();
        t.back_off();
        assert_eq!(t.current_rto, Duration::from_millis(200));
        for _ in 0..10 {
            t.back_off();
        }
        assert_eq!(t.current_rto, Duration::from_millis(800));
        t.reset();
        assert_eq!(t.current_rto, Duration::from_millis(100));
    }

    #[test]
    fn first_sample_sets_srtt_and_rto() {
        let mut t = timer();
        t.record_rtt_sample(Duration::from_millis(40));
        assert_eq!(t.srtt, Some(Duration::from_millis(40)));
        assert_eq!(t.rttvar, Some(Duration::from_millis(20)));
        // 40 + 4 * 20
        assert_eq!(t.current_rto, Duration::from_millis(120));
    }

    #[test]
    fn rto_is_clamped_to_min() {
        let mut t = timer();
        t.record_rtt_sample(Duration::from_micros(100));
        assert_eq!(t.current_rto, Duration::from_millis(10));
    }

    #[test]
    fn arm_and_expire() {
        let mut t = timer();
        let now = Instant::now();
        t.arm(now);
        assert_eq!(t.deadline(), Some(now + Duration::from_millis(100)));
        assert!(!t.expired(now));
        assert!(t.expired(now + Duration::from_millis(100)));
        t.cancel();
        assert!(!t.expired(now + Duration::from_secs(1)));
    }
}
