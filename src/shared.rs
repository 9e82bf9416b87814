//! A connection shared between tasks.
//!
//! [`SharedConnection`] puts the whole [`Connection`] behind one
//! `tokio::sync::Mutex`, so a sending task and a receiving task can use the
//! same connection.  Both `send` and `recv` work in short slices and release
//! the lock between them: a reader can drain the receive buffer (and reopen
//! our window) while a send waits for ACKs, and an idle reader never starves
//! a pending send.
//!
//! ```ignore
//! let shared = SharedConnection::new(conn);
//! let reader = shared.clone();
//! tokio::spawn(async move {
//!     let mut buf = [0u8; 1024];
//!     while reader.recv(&mut buf).await? > 0 {}
//!     Ok::<_, ConnError>(())
//! });
//! shared.send(b"hello").await?;
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::connection::{ConnError, Connection, Stats};
use crate::state::ConnectionState;
use crate::transfer::SendProgress;

/// How long `send` or `recv` holds the lock while nothing arrives.
const RECV_SLICE: Duration = Duration::from_millis(10);

/// Cloneable handle to one [`Connection`].
#[derive(Debug, Clone)]
pub struct SharedConnection {
    inner: Arc<Mutex<Connection>>,
}

impl SharedConnection {
    pub fn new(conn: Connection) -> Self {
        Self {
            inner: Arc::new(Mutex::new(conn)),
        }
    }

    /// See [`Connection::send`].
    pub async fn send(&self, data: &[u8]) -> Result<usize, ConnError> {
        let mut progress = SendProgress::default();
        loop {
            let done = {
                let mut conn = self.inner.lock().await;
                conn.send_step(data, &mut progress, Some(Instant::now() + RECV_SLICE))
                    .await?
            };
            if done {
                return Ok(data.len());
            }
            tokio::task::yield_now().await;
        }
    }

    /// See [`Connection::recv`].  Honours the connection's `recv_timeout`.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize, ConnError> {
        let timeout = self.inner.lock().await.config().recv_timeout;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let slice_end = Instant::now() + RECV_SLICE;
            let until = deadline.map_or(slice_end, |d| d.min(slice_end));
            let result = {
                let mut conn = self.inner.lock().await;
                conn.recv_until(buf, Some(until)).await
            };
            match result {
                Err(ConnError::Timeout) if deadline.map_or(true, |d| Instant::now() < d) => {
                    tokio::task::yield_now().await;
                }
                other => return other,
            }
        }
    }

    /// See [`Connection::shutdown`].
    pub async fn shutdown(&self) -> Result<(), ConnError> {
        self.inner.lock().await.shutdown().await
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state()
    }

    pub async fn stats(&self) -> Stats {
        self.inner.lock().await.stats()
    }

    /// Take the connection back if this is the last handle.
    pub fn into_inner(self) -> Option<Connection> {
        Arc::try_unwrap(self.inner).ok().map(Mutex::into_inner)
    }
}
