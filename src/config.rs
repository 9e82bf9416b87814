//! Tunable connection parameters.
//!
//! Defaults follow the classic microTCP constants: a 1400-byte MSS, an
//! 8 KiB receive buffer that doubles as the advertised window, an initial
//! congestion window of three segments and a 200 ms ACK timeout.

use std::time::Duration;

use thiserror::Error;

use crate::packet::MAX_PAYLOAD;
use crate::timer::TimerConfig;

/// Default maximum segment payload.
pub const DEFAULT_MSS: usize = 1400;

/// Default receive buffer capacity (and therefore advertised window).
pub const DEFAULT_RECV_BUF_LEN: usize = 8192;

/// Default number of consecutive retransmissions before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 6;

/// Per-connection configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum payload bytes per segment.
    pub mss: usize,
    /// Receive buffer capacity in bytes.
    pub recv_buf_len: usize,
    /// Congestion window right after the handshake, in bytes.
    pub init_cwnd: usize,
    /// Slow-start threshold right after the handshake, in bytes.
    pub init_ssthresh: usize,
    /// Retransmission timer parameters.
    pub timer: TimerConfig,
    /// Consecutive timeouts tolerated before an operation fails.
    pub max_retries: u32,
    /// How long `recv` blocks for a segment; `None` waits forever.
    pub recv_timeout: Option<Duration>,
    /// How long `accept` waits for a SYN; `None` waits forever.
    pub accept_timeout: Option<Duration>,
    /// How long an active close waits for the peer's FIN once ours is acked.
    pub fin_wait_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mss: DEFAULT_MSS,
            recv_buf_len: DEFAULT_RECV_BUF_LEN,
            init_cwnd: 3 * DEFAULT_MSS,
            init_ssthresh: DEFAULT_RECV_BUF_LEN,
            timer: TimerConfig::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            recv_timeout: None,
            accept_timeout: None,
            fin_wait_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Set the MSS, keeping the initial congestion window at three segments.
    pub fn with_mss(mut self, mss: usize) -> Self {
        self.mss = mss;
        self.init_cwnd = 3 * mss;
        self
    }

    /// Check that the parameters describe a usable connection.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mss == 0 || self.mss > MAX_PAYLOAD {
            return Err(ConfigError::Mss(self.mss));
        }
        if self.recv_buf_len == 0 {
            return Err(ConfigError::EmptyReceiveBuffer);
        }
        if self.init_cwnd < self.mss {
            return Err(ConfigError::InitialWindow {
                cwnd: self.init_cwnd,
                mss: self.mss,
            });
        }
        if self.timer.initial_rto.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    /// Window advertised before the receive buffer exists.
    pub(crate) fn advertised_window(&self) -> u16 {
        self.recv_buf_len.min(u16::MAX as usize) as u16
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("mss {0} must be between 1 and the largest segment payload")]
    Mss(usize),
    #[error("receive buffer must hold at least one byte")]
    EmptyReceiveBuffer,
    #[error("initial cwnd {cwnd} is smaller than one segment ({mss})")]
    InitialWindow { cwnd: usize, mss: usize },
    #[error("initial retransmission timeout must be non-zero")]
    ZeroTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.init_cwnd, 3 * cfg.mss);
        assert_eq!(cfg.advertised_window(), 8192);
    }

    #[test]
    fn with_mss_rescales_initial_window() {
        let cfg = Config::default().with_mss(512);
        assert_eq!(cfg.mss, 512);
        assert_eq!(cfg.init_cwnd, 1536);
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(
            Config::default().with_mss(0).validate(),
            Err(ConfigError::Mss(0))
        );
        let cfg = Config {
            recv_buf_len: 0,
            ..Config::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::EmptyReceiveBuffer));
        let cfg = Config {
            init_cwnd: 10,
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InitialWindow { .. })));
    }

    #[test]
    fn advertised_window_saturates() {
        let cfg = Config {
            recv_buf_len: 1 << 20,
            ..Config::default()
        };
        assert_eq!(cfg.advertised_window(), u16::MAX);
    }
}
