//! `microtcp`: a small connection-oriented, reliable byte stream over UDP.
//!
//! # Architecture
//!
//! ```text
//!   application: open / bind / connect / accept / send / recv / shutdown
//!        │
//!  ┌─────▼──────────────────────────────────────────────┐
//!  │                    Connection                      │
//!  │  handshake ─ transfer ─ teardown   (state machine) │
//!  │     │            │                                  │
//!  │     │     ┌──────┴──────┬────────────┬──────────┐   │
//!  │     │     │   Sender    │  Receiver  │Congestion│   │
//!  │     │     └─────────────┴────────────┴──────────┘   │
//!  │     └──────── RetransmitTimer (explicit deadline)   │
//!  └─────┬──────────────────────────────────────────────┘
//!        │ Packet (20-byte header + payload, CRC-32C)
//!  ┌─────▼─────┐   optional   ┌───────────┐
//!  │  Socket   │─────────────▶│ Simulator │  (loss / corruption / dup / reorder)
//!  └───────────┘              └───────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]      wire format (serialise / deserialise / verify)
//! - [`seq`]         wrap-around sequence number comparisons
//! - [`state`]       finite-state-machine states
//! - [`config`]      tunables and their defaults
//! - [`timer`]       RTO estimation and the retransmission deadline
//! - [`congestion`]  slow start / congestion avoidance
//! - [`sender`]      outbound window and ACK classification
//! - [`receiver`]    receive buffer and out-of-order reassembly
//! - [`socket`]      async UDP socket abstraction
//! - [`simulator`]   optional lossy network layer for testing
//! - [`connection`]  the connection record and shared I/O helpers
//! - [`handshake`]   three-way open
//! - [`transfer`]    reliable `send` / `recv`
//! - [`teardown`]    active and passive close
//! - [`shared`]      one connection used from several tasks
//!
//! ```ignore
//! let mut server = Connection::open(Config::default())?;
//! server.bind("0.0.0.0:54321".parse()?).await?;
//! server.accept().await?;
//! let mut buf = [0u8; 4096];
//! while server.recv(&mut buf).await? > 0 { /* ... */ }
//! server.shutdown().await?;
//! ```

pub mod config;
pub mod congestion;
pub mod connection;
pub mod handshake;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod seq;
pub mod shared;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod teardown;
pub mod timer;
pub mod transfer;

pub use config::Config;
pub use connection::{ConnError, Connection, Stats};
pub use shared::SharedConnection;
pub use simulator::{Simulator, SimulatorConfig};
pub use state::ConnectionState;
