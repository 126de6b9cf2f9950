//! Connection handles for Parley.
//!
//! A [`Connection`] wraps the write half of one client's stream. The read
//! half stays with the connection's handler task; everything else (the
//! registry, the broadcaster, the shutdown path) only ever holds an
//! `Arc<Connection>` and writes whole frames through it.

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Counter backing [`ConnectionId::next`].
static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
///
/// Identifiers are allocated in accept order, so sorting by id sorts by age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next process-wide connection ID.
    #[must_use]
    pub fn next() -> Self {
        Self(ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw numeric ID.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl From<u64> for ConnectionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection is no longer active.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Protocol error on the inbound stream.
    #[error("Protocol error: {0}")]
    Protocol(#[from] parley_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionClosed => "closed",
            Self::Protocol(_) => "protocol",
            Self::Io(_) => "io",
        }
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Registered or registrable; frames may be written.
    Active = 0,
    /// Teardown has started; writes are refused.
    Closing = 1,
    /// The handler has finished.
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Outcome of delivering one frame to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The frame was written.
    Written,
    /// The record was already sent to this connection during history replay.
    Skipped,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of a connection, guarded by the connection's writer lock.
pub struct ConnectionWriter {
    sink: BoxedWriter,
    /// Highest sequence index sent as part of history replay.
    replayed_through: u64,
    shut_down: bool,
}

impl ConnectionWriter {
    /// Write one pre-encoded frame and flush it.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.sink.write_all(frame).await?;
        self.sink.flush().await?;
        Ok(())
    }

    /// Record that history up to and including `seq` has been replayed.
    pub fn mark_replayed(&mut self, seq: u64) {
        self.replayed_through = self.replayed_through.max(seq);
    }

    /// Highest sequence index covered by history replay.
    #[must_use]
    pub fn replayed_through(&self) -> u64 {
        self.replayed_through
    }
}

/// A live client connection.
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    writer: Mutex<ConnectionWriter>,
    state: AtomicU8,
    close_signal: CancellationToken,
}

impl Connection {
    /// Create a new connection around the write half of a stream.
    pub fn new<W>(id: ConnectionId, peer: Option<SocketAddr>, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id,
            peer,
            writer: Mutex::new(ConnectionWriter {
                sink: Box::new(writer),
                replayed_through: 0,
                shut_down: false,
            }),
            state: AtomicU8::new(ConnectionState::Active as u8),
            close_signal: CancellationToken::new(),
        }
    }

    /// Get the connection's unique identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the remote address, if known.
    #[must_use]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Get the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Check if frames may still be written.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Acquire the writer lock.
    ///
    /// Holding the guard keeps every other writer (including broadcasts)
    /// waiting, so frames written through it stay contiguous.
    pub async fn lock_writer(&self) -> MutexGuard<'_, ConnectionWriter> {
        self.writer.lock().await
    }

    /// Send a pre-encoded frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the connection is no
    /// longer active, or the underlying write error.
    pub async fn send(&self, frame: &Bytes) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        if !self.is_active() {
            return Err(TransportError::ConnectionClosed);
        }
        writer.write_frame(frame).await
    }

    /// Deliver the pre-encoded frame of log record `seq`.
    ///
    /// Records that this connection already received through history replay
    /// are skipped instead of being sent twice.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the write fails.
    pub async fn deliver(&self, seq: u64, frame: &Bytes) -> Result<Delivery, TransportError> {
        let mut writer = self.writer.lock().await;
        if !self.is_active() {
            return Err(TransportError::ConnectionClosed);
        }
        if seq <= writer.replayed_through {
            return Ok(Delivery::Skipped);
        }
        writer.write_frame(frame).await?;
        Ok(Delivery::Written)
    }

    /// Send a last frame, then refuse further writes and wake the handler.
    ///
    /// The connection leaves `Active` before the writer lock is released,
    /// so nothing queued behind this frame reaches the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the write fails.
    pub async fn send_final(&self, frame: &Bytes) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        if !self.is_active() {
            return Err(TransportError::ConnectionClosed);
        }
        let result = writer.write_frame(frame).await;
        self.begin_close();
        result
    }

    /// Start teardown: refuse further writes and wake the handler.
    ///
    /// Returns `true` if this call moved the connection out of `Active`.
    pub fn begin_close(&self) -> bool {
        let moved = self
            .state
            .compare_exchange(
                ConnectionState::Active as u8,
                ConnectionState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        self.close_signal.cancel();
        moved
    }

    /// Close the connection: stop writes, wake the handler, and shut down
    /// the write half of the stream. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport-level shutdown fails.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.begin_close();
        let mut writer = self.writer.lock().await;
        if writer.shut_down {
            return Ok(());
        }
        writer.shut_down = true;
        writer.sink.shutdown().await?;
        Ok(())
    }

    /// Mark the connection as fully closed.
    pub fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::SeqCst);
        self.close_signal.cancel();
    }

    /// Wait until someone requests this connection be closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.close_signal.cancelled()
    }

    /// Check if a close has been requested.
    #[must_use]
    pub fn is_close_requested(&self) -> bool {
        self.close_signal.is_cancelled()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_protocol::codec;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_connection_id_allocation() {
        let id1 = ConnectionId::next();
        let id2 = ConnectionId::next();
        assert!(id2 > id1);
        assert!(id1.to_string().starts_with("conn-"));
    }

    #[tokio::test]
    async fn test_send_writes_whole_frame() {
        let (client, server) = tokio::io::duplex(1024);
        let (_read, write) = tokio::io::split(server);
        let conn = Connection::new(ConnectionId::next(), None, write);

        conn.send(&codec::encode(b"alice: hi")).await.unwrap();

        let mut client = client;
        let mut buf = vec![0u8; codec::HEADER_SIZE + 9];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(codec::decode(&buf).unwrap(), "alice: hi");
    }

    #[tokio::test]
    async fn test_deliver_skips_replayed_records() {
        let (_client, server) = tokio::io::duplex(1024);
        let (_read, write) = tokio::io::split(server);
        let conn = Connection::new(ConnectionId::next(), None, write);

        conn.lock_writer().await.mark_replayed(3);

        let frame = codec::encode(b"x: y");
        assert_eq!(conn.deliver(2, &frame).await.unwrap(), Delivery::Skipped);
        assert_eq!(conn.deliver(3, &frame).await.unwrap(), Delivery::Skipped);
        assert_eq!(conn.deliver(4, &frame).await.unwrap(), Delivery::Written);
    }

    #[tokio::test]
    async fn test_close_refuses_writes() {
        let (_client, server) = tokio::io::duplex(1024);
        let (_read, write) = tokio::io::split(server);
        let conn = Connection::new(ConnectionId::next(), None, write);

        assert!(conn.is_active());
        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert!(conn.is_close_requested());
        assert!(!conn.begin_close());
        conn.close().await.unwrap();

        let frame = codec::encode(b"late");
        assert!(matches!(
            conn.send(&frame).await,
            Err(TransportError::ConnectionClosed)
        ));

        conn.mark_closed();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_send_final_is_the_last_frame() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (_read, write) = tokio::io::split(server);
        let conn = Connection::new(ConnectionId::next(), None, write);

        conn.send_final(&codec::encode(b"!DISCONNECT")).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert!(conn.is_close_requested());
        assert!(matches!(
            conn.deliver(1, &codec::encode(b"late: line")).await,
            Err(TransportError::ConnectionClosed)
        ));

        let mut buf = vec![0u8; codec::HEADER_SIZE + 11];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(codec::decode(&buf).unwrap(), "!DISCONNECT");
    }
}
