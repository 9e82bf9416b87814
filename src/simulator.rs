//! Optional network simulator for deterministic testing.
//!
//! Loopback never loses anything.  To exercise the reliability mechanisms
//! without depending on actual network conditions, a [`Simulator`] can be
//! attached to a [`crate::socket::Socket`]; it intercepts every outgoing
//! datagram and applies a configurable fault model:
//!
//! | Fault        | Description                                           |
//! |--------------|-------------------------------------------------------|
//! | Loss         | Drop the datagram with probability `loss_rate`.       |
//! | Corruption   | Flip one random bit with probability `corrupt_rate`.  |
//! | Duplication  | Deliver twice with probability `duplicate_rate`.      |
//! | Reordering   | Hold the datagram back until the next one has gone.   |
//!
//! Faults are drawn from a seeded `StdRng`, so a failing run can be replayed.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    pub loss_rate: f64,
    pub corrupt_rate: f64,
    pub duplicate_rate: f64,
    pub reorder_rate: f64,
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default; the simulator is a transparent pass-through.
        Self {
            loss_rate: 0.0,
            corrupt_rate: 0.0,
            duplicate_rate: 0.0,
            reorder_rate: 0.0,
            seed: 0,
        }
    }
}

#[derive(Debug)]
struct SimState {
    rng: StdRng,
    held: Option<Vec<u8>>,
}

/// A fault-injecting stage on the send path.
#[derive(Debug)]
pub struct Simulator {
    pub config: SimulatorConfig,
    state: Mutex<SimState>,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            state: Mutex::new(SimState { rng, held: None }),
        }
    }

    /// Apply the fault model to one outgoing datagram.
    ///
    /// Returns the datagrams that should actually hit the wire, in order:
    /// possibly none, possibly the same bytes twice, possibly a datagram held
    /// back by an earlier call.
    pub fn disrupt(&self, mut datagram: Vec<u8>) -> Vec<Vec<u8>> {
        let mut st = self.state.lock();
        let mut out = Vec::with_capacity(3);

        if st.rng.gen_bool(self.config.loss_rate.clamp(0.0, 1.0)) {
            log::trace!("[sim] dropping {} byte datagram", datagram.len());
            out.extend(st.held.take());
            return out;
        }

        if !datagram.is_empty() && st.rng.gen_bool(self.config.corrupt_rate.clamp(0.0, 1.0)) {
            let bit = st.rng.gen_range(0..datagram.len() * 8);
            datagram[bit / 8] ^= 1 << (bit % 8);
            log::trace!("[sim] flipped bit {bit}");
        }

        let duplicate = st.rng.gen_bool(self.config.duplicate_rate.clamp(0.0, 1.0));

        if st.held.is_none() && st.rng.gen_bool(self.config.reorder_rate.clamp(0.0, 1.0)) {
            log::trace!("[sim] holding datagram back");
            if duplicate {
                out.push(datagram.clone());
            }
            st.held = Some(datagram);
            return out;
        }

        if duplicate {
            out.push(datagram.clone());
        }
        out.push(datagram);
        out.extend(st.held.take());
        out
    }
}
