//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! [`crate::packet::Packet`] instead of raw bytes.  All protocol logic lives
//! elsewhere; this module owns only byte I/O.  An optional
//! [`Simulator`] sits between the encoder and the kernel on the send path.

use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::packet::{Packet, PacketError};
use crate::simulator::Simulator;

/// Maximum UDP payload size (theoretical limit; in practice kept much smaller).
const MAX_DATAGRAM: usize = 65_535;

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The datagram could not be encoded, or a received one failed to decode.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
}

/// An async, packet-oriented UDP socket.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
    simulator: Option<Simulator>,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing `0.0.0.0:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self {
            local_addr,
            inner,
            simulator: None,
        })
    }

    /// Route every outgoing datagram through `simulator` (or stop doing so).
    pub fn set_simulator(&mut self, simulator: Option<Simulator>) {
        self.simulator = simulator;
    }

    /// Encode `packet` and send it as a single UDP datagram to `dest`.
    ///
    /// Returns the encoded length.  With a simulator attached the datagram
    /// may be dropped, corrupted, duplicated or held back; the caller sees
    /// the same result either way.
    pub async fn send_to(&self, packet: &Packet, dest: SocketAddr) -> Result<usize, SocketError> {
        let bytes = packet.encode()?;
        let len = bytes.len();
        match &self.simulator {
            None => {
                self.inner.send_to(&bytes, dest).await?;
            }
            Some(sim) => {
                for datagram in sim.disrupt(bytes) {
                    self.inner.send_to(&datagram, dest).await?;
                }
            }
        }
        Ok(len)
    }

    /// Receive the next datagram and decode it into a [`Packet`].
    ///
    /// Returns `(packet, sender_address)`.  Datagrams that fail to decode are
    /// returned as [`SocketError::Packet`]; the caller decides whether to
    /// retry.
    pub async fn recv_from(&self) -> Result<(Packet, SocketAddr), SocketError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        let packet = Packet::decode(&buf[..n])?;
        Ok((packet, addr))
    }
}
