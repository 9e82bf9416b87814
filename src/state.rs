//! Connection finite-state machine (FSM) types.
//!
//! Transitions are driven by [`crate::handshake`], [`crate::teardown`] and
//! the passive-close path in [`crate::transfer`]; this module only names the
//! states.
//!
//! ```text
//!  CLOSED ──bind──▶ LISTEN ──accept──┐
//!    │                               ▼
//!    └──────────connect───────▶ ESTABLISHED
//!                                 │        │
//!                   shutdown      │        │  peer FIN (recv)
//!                 (FIN acked)     ▼        ▼
//!                  CLOSING_BY_HOST   CLOSING_BY_PEER
//!                       │  peer FIN         │  shutdown (FIN acked)
//!                       ▼                   ▼
//!                     CLOSED              CLOSED
//! ```
//!
//! `connect` is also legal from LISTEN.

use std::fmt;

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; initial and final state.
    #[default]
    Closed,
    /// Bound to a local address, waiting for a SYN.
    Listen,
    /// Handshake complete; data transfer allowed.
    Established,
    /// Our FIN has been acknowledged; waiting for the peer's FIN.
    ClosingByHost,
    /// The peer's FIN has been received and acknowledged.
    ClosingByPeer,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::Established => "ESTABLISHED",
            Self::ClosingByHost => "CLOSING_BY_HOST",
            Self::ClosingByPeer => "CLOSING_BY_PEER",
        };
        f.write_str(name)
    }
}
