//! Per-connection lifecycle manager.
//!
//! A [`Connection`] owns the complete state for one logical peer-to-peer
//! session.  Its responsibilities are split over several modules, each
//! adding an `impl Connection` block:
//! - this module: creation, `bind`, accessors and the I/O helpers every
//!   phase shares (transmit, receive with a deadline, RST, release);
//! - [`crate::handshake`]: `connect` / `accept`;
//! - [`crate::transfer`]: `send` / `recv`;
//! - [`crate::teardown`]: `shutdown`.
//!
//! The connection never spawns a task.  Every wait is a receive bounded by
//! an explicit deadline taken from the retransmission timer or the caller.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use thiserror::Error;

use crate::config::{Config, ConfigError};
use crate::congestion::CongestionControl;
use crate::packet::{flags, Packet};
use crate::receiver::Receiver;
use crate::sender::Sender;
use crate::simulator::Simulator;
use crate::socket::{Socket, SocketError};
use crate::state::ConnectionState;
use crate::timer::RetransmitTimer;

/// Errors surfaced by connection operations.
#[derive(Debug, Error)]
pub enum ConnError {
    /// The peer sent something the handshake or teardown does not allow.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    /// No acceptable segment arrived in time (after any retries).
    #[error("timed out waiting for the peer")]
    Timeout,
    /// The operation is not legal in the current lifecycle state.
    #[error("{op} is not allowed in state {state}")]
    BadState {
        op: &'static str,
        state: ConnectionState,
    },
    /// The peer reset the connection.
    #[error("connection reset by peer")]
    Reset,
    /// The receive buffer could not be allocated.
    #[error("could not allocate a {0}-byte receive buffer")]
    Resource(usize),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Socket(#[from] SocketError),
}

impl ConnError {
    /// `true` when retrying the same operation may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Traffic counters.  Diagnostics only; they never decrease.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Segments written to the socket, retransmissions included.
    pub packets_sent: u64,
    /// Payload bytes written to the socket, retransmissions included.
    pub bytes_sent: u64,
    /// Well-formed segments read from the socket.
    pub packets_received: u64,
    /// New in-order payload bytes accepted.
    pub bytes_received: u64,
    /// Segments retransmitted after a timeout or duplicate ACKs.
    pub packets_lost: u64,
    /// Payload bytes of those retransmissions.
    pub bytes_lost: u64,
}

/// One endpoint of a microTCP connection.
pub struct Connection {
    pub(crate) state: ConnectionState,
    pub(crate) socket: Option<Socket>,
    pub(crate) peer: Option<SocketAddr>,
    /// Next sequence number we will use.
    pub(crate) seq_number: u32,
    /// Next sequence number expected from the peer.
    pub(crate) ack_number: u32,
    /// Peer's most recently advertised window.
    pub(crate) curr_win_size: u16,
    /// Peer's window as learned during the handshake.
    pub(crate) init_win_size: u16,
    pub(crate) congestion: CongestionControl,
    pub(crate) timer: RetransmitTimer,
    pub(crate) sender: Option<Sender>,
    pub(crate) receiver: Option<Receiver>,
    pub(crate) stats: Stats,
    pub(crate) config: Config,
    pub(crate) rng: Box<dyn RngCore + Send + Sync>,
    /// Simulator waiting for a socket to attach to.
    pending_simulator: Option<Simulator>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("seq_number", &self.seq_number)
            .field("ack_number", &self.ack_number)
            .field("curr_win_size", &self.curr_win_size)
            .field("cwnd", &self.congestion.cwnd())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a connection in [`ConnectionState::Closed`] with ISNs drawn
    /// from an entropy-seeded generator.
    pub fn open(config: Config) -> Result<Self, ConnError> {
        Self::open_with_rng(config, Box::new(StdRng::from_entropy()))
    }

    /// Like [`Connection::open`] but with an injected random source for the
    /// initial sequence number.
    pub fn open_with_rng(
        config: Config,
        rng: Box<dyn RngCore + Send + Sync>,
    ) -> Result<Self, ConnError> {
        config.validate()?;
        let window = config.advertised_window();
        Ok(Self {
            state: ConnectionState::Closed,
            socket: None,
            peer: None,
            seq_number: 0,
            ack_number: 0,
            curr_win_size: window,
            init_win_size: window,
            congestion: CongestionControl::new(config.init_cwnd, config.init_ssthresh, config.mss),
            timer: RetransmitTimer::new(config.timer.clone()),
            sender: None,
            receiver: None,
            stats: Stats::default(),
            config,
            rng,
            pending_simulator: None,
        })
    }

    /// Bind the local endpoint and start listening.  CLOSED → LISTEN.
    pub async fn bind(&mut self, addr: SocketAddr) -> Result<(), ConnError> {
        self.expect_state("bind", &[ConnectionState::Closed])?;
        let mut socket = Socket::bind(addr).await?;
        socket.set_simulator(self.pending_simulator.take());
        log::debug!("[handshake] listening on {}", socket.local_addr);
        self.socket = Some(socket);
        self.state = ConnectionState::Listen;
        Ok(())
    }

    /// Attach a fault simulator to the send path (or detach it with `None`).
    ///
    /// Before the socket exists the simulator is kept and attached when it is
    /// created.
    pub fn set_simulator(&mut self, simulator: Option<Simulator>) {
        match self.socket.as_mut() {
            Some(socket) => socket.set_simulator(simulator),
            None => self.pending_simulator = simulator,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn seq_number(&self) -> u32 {
        self.seq_number
    }

    pub fn ack_number(&self) -> u32 {
        self.ack_number
    }

    /// Peer's most recently advertised receive window.
    pub fn peer_window(&self) -> u16 {
        self.curr_win_size
    }

    pub fn init_win_size(&self) -> u16 {
        self.init_win_size
    }

    pub fn cwnd(&self) -> usize {
        self.congestion.cwnd()
    }

    pub fn ssthresh(&self) -> usize {
        self.congestion.ssthresh()
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bytes received and waiting to be read.
    pub fn buffered(&self) -> usize {
        self.receiver.as_ref().map_or(0, Receiver::fill_level)
    }

    /// `true` while a receive buffer is allocated.
    pub fn has_receive_buffer(&self) -> bool {
        self.receiver.is_some()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().map(|s| s.local_addr)
    }

    // -----------------------------------------------------------------------
    // Helpers shared by the protocol phases
    // -----------------------------------------------------------------------

    pub(crate) fn expect_state(
        &self,
        op: &'static str,
        allowed: &[ConnectionState],
    ) -> Result<(), ConnError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ConnError::BadState {
                op,
                state: self.state,
            })
        }
    }

    pub(crate) fn bad_state(&self, op: &'static str) -> ConnError {
        ConnError::BadState {
            op,
            state: self.state,
        }
    }

    pub(crate) fn connected_peer(&self) -> Result<SocketAddr, ConnError> {
        self.peer.ok_or_else(|| self.bad_state("transmit"))
    }

    /// Make sure a socket exists, binding an ephemeral one of the same
    /// address family as `peer` if needed.
    pub(crate) async fn ensure_socket(&mut self, peer: SocketAddr) -> Result<(), ConnError> {
        if self.socket.is_some() {
            return Ok(());
        }
        let any: SocketAddr = if peer.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let mut socket = Socket::bind(any).await?;
        socket.set_simulator(self.pending_simulator.take());
        self.socket = Some(socket);
        Ok(())
    }

    /// Our receive window as it should be advertised right now.
    pub(crate) fn local_window(&self) -> u16 {
        self.receiver
            .as_ref()
            .map_or_else(|| self.config.advertised_window(), Receiver::window_size)
    }

    /// A pure ACK carrying the current sequence and acknowledgement numbers.
    pub(crate) fn ack_packet(&self) -> Packet {
        Packet::control(self.seq_number, self.ack_number, flags::ACK, self.local_window())
    }

    /// Send `packet` to `dest` and count it.
    pub(crate) async fn transmit_to(
        &mut self,
        packet: &Packet,
        dest: SocketAddr,
    ) -> Result<(), ConnError> {
        let socket = self.socket.as_ref().ok_or_else(|| self.bad_state("transmit"))?;
        socket.send_to(packet, dest).await?;
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += packet.payload.len() as u64;
        log::trace!(
            "→ seq={} ack={} ctl={:#06b} win={} len={}",
            packet.header.seq,
            packet.header.ack,
            packet.header.control,
            packet.header.window,
            packet.payload.len()
        );
        Ok(())
    }

    /// Send `packet` to the connected peer.
    pub(crate) async fn transmit(&mut self, packet: &Packet) -> Result<(), ConnError> {
        let peer = self.connected_peer()?;
        self.transmit_to(packet, peer).await
    }

    /// Send a pure ACK to the connected peer.
    pub(crate) async fn send_ack(&mut self) -> Result<(), ConnError> {
        let ack = self.ack_packet();
        self.transmit(&ack).await
    }

    /// Tell `dest` to abandon the exchange that produced `offending`.
    /// Best effort: failures are ignored.
    pub(crate) async fn send_reset(&mut self, offending: &Packet, dest: SocketAddr) {
        let h = &offending.header;
        let rst = Packet::control(h.ack, h.seq.wrapping_add(1), flags::RST, 0);
        if let Err(e) = self.transmit_to(&rst, dest).await {
            log::trace!("RST to {dest} not sent: {e}");
        }
    }

    /// Wait for the next well-formed segment from anyone.
    ///
    /// Returns `Ok(None)` once `deadline` passes.  Datagrams that fail to
    /// decode (bad checksum, truncated) are dropped here and never reach the
    /// protocol logic.
    pub(crate) async fn recv_segment(
        &mut self,
        deadline: Option<Instant>,
    ) -> Result<Option<(Packet, SocketAddr)>, ConnError> {
        loop {
            let socket = self.socket.as_ref().ok_or_else(|| self.bad_state("receive"))?;
            let result = match deadline {
                Some(d) => {
                    let d = tokio::time::Instant::from_std(d);
                    match tokio::time::timeout_at(d, socket.recv_from()).await {
                        Ok(r) => r,
                        Err(_elapsed) => return Ok(None),
                    }
                }
                None => socket.recv_from().await,
            };
            match result {
                Ok((packet, addr)) => {
                    self.stats.packets_received += 1;
                    log::trace!(
                        "← seq={} ack={} ctl={:#06b} win={} len={} from {addr}",
                        packet.header.seq,
                        packet.header.ack,
                        packet.header.control,
                        packet.header.window,
                        packet.payload.len()
                    );
                    return Ok(Some((packet, addr)));
                }
                Err(SocketError::Packet(e)) => {
                    log::trace!("dropping malformed datagram: {e}");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Like [`Connection::recv_segment`] but only for the connected peer.
    pub(crate) async fn recv_from_peer(
        &mut self,
        deadline: Option<Instant>,
    ) -> Result<Option<Packet>, ConnError> {
        let peer = self.connected_peer()?;
        loop {
            match self.recv_segment(deadline).await? {
                None => return Ok(None),
                Some((packet, addr)) if addr == peer => return Ok(Some(packet)),
                Some((_, addr)) => log::trace!("ignoring segment from stranger {addr}"),
            }
        }
    }

    /// Enter ESTABLISHED with `peer`: allocate the receive buffer and set up
    /// the send window from the current sequence numbers.
    pub(crate) fn establish(&mut self, peer: SocketAddr) -> Result<(), ConnError> {
        let len = self.config.recv_buf_len;
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| ConnError::Resource(len))?;
        buf.resize(len, 0);

        self.receiver = Some(Receiver::from_buffer(self.ack_number, buf.into_boxed_slice()));
        self.sender = Some(Sender::new(self.seq_number, self.curr_win_size));
        self.congestion = CongestionControl::new(
            self.config.init_cwnd,
            self.config.init_ssthresh,
            self.config.mss,
        );
        self.congestion.clamp(self.curr_win_size as usize);
        self.timer.cancel();
        self.peer = Some(peer);
        self.state = ConnectionState::Established;
        Ok(())
    }

    /// Enter CLOSED, dropping the receive buffer and the socket.
    pub(crate) fn release(&mut self) {
        self.timer.cancel();
        self.sender = None;
        if self.receiver.take().is_some() {
            log::debug!("[teardown] receive buffer released");
        }
        self.socket = None;
        self.state = ConnectionState::Closed;
    }

    /// Retry budget shared by every phase.
    pub(crate) fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.timer.current_rto
    }
}
