//! Per-connection control loop.
//!
//! Each accepted connection is driven by one [`ConnectionHandler`] running
//! in its own task:
//!
//! ```text
//! New ──▶ Replaying ──▶ Active ──▶ Closing ──▶ Closed
//!             │            │          ▲
//!             └────────────┴──────────┘  (error, EOF, sentinel, eviction)
//! ```
//!
//! The handler registers the connection, replays the message log, then
//! relays every chat line the peer sends until the peer leaves, the stream
//! fails, or someone else closes the connection.

use crate::connection::{Connection, ConnectionId, TransportError};
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::relay::Relay;
use bytes::BytesMut;
use futures_util::StreamExt;
use parley_protocol::{codec, FrameCodec, Payload, ProtocolError, DISCONNECT_MESSAGE};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, trace, warn};

/// Handler lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Accepted, not yet registered.
    New,
    /// Registered; history is being sent.
    Replaying,
    /// Relaying inbound messages.
    Active,
    /// Unregistering and closing the stream.
    Closing,
    /// Done.
    Closed,
}

/// Why a connection ended.
#[derive(Debug)]
pub enum Disconnect {
    /// The peer sent the disconnect sentinel.
    Graceful,
    /// The peer closed the stream.
    PeerClosed,
    /// The server closed the connection (shutdown or failed delivery).
    Evicted,
    /// The stream failed or carried a malformed frame.
    Failed(TransportError),
}

impl Disconnect {
    /// Check if the connection ended because of a fault.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graceful => write!(f, "disconnected"),
            Self::PeerClosed => write!(f, "peer closed"),
            Self::Evicted => write!(f, "closed by server"),
            Self::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// Result of a finished handler.
#[derive(Debug)]
pub struct HandlerOutcome {
    /// The connection that ended.
    pub connection: ConnectionId,
    /// Remote address, if known.
    pub peer: Option<SocketAddr>,
    /// Why it ended.
    pub reason: Disconnect,
    /// Chat lines relayed from this peer.
    pub messages: u64,
}

/// Drives one connection from accept to close.
pub struct ConnectionHandler<R> {
    relay: Arc<Relay>,
    conn: Arc<Connection>,
    frames: FramedRead<R, FrameCodec>,
    state: HandlerState,
    messages: u64,
}

impl<R> ConnectionHandler<R>
where
    R: AsyncRead + Unpin,
{
    /// Create a handler for a freshly accepted stream, split into halves.
    pub fn new<W>(
        relay: Arc<Relay>,
        id: ConnectionId,
        peer: Option<SocketAddr>,
        reader: R,
        writer: W,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            relay,
            conn: Arc::new(Connection::new(id, peer, writer)),
            frames: FramedRead::new(reader, FrameCodec::new()),
            state: HandlerState::New,
            messages: 0,
        }
    }

    /// Get the connection driven by this handler.
    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> HandlerState {
        self.state
    }

    fn transition(&mut self, next: HandlerState) {
        trace!(connection = %self.conn.id(), from = ?self.state, to = ?next, "Handler state");
        self.state = next;
    }

    /// Run the connection to completion.
    pub async fn run(mut self) -> HandlerOutcome {
        let _metrics_guard = ConnectionMetricsGuard::new();
        let id = self.conn.id();
        let peer = self.conn.peer();

        debug!(connection = %id, peer = ?peer, "Connection accepted");

        let reason = match self.replay().await {
            Ok(Some(count)) => {
                debug!(connection = %id, replayed = count, "History replayed");
                self.transition(HandlerState::Active);
                self.read_loop().await
            }
            Ok(None) => Disconnect::Evicted,
            Err(e) => Disconnect::Failed(e),
        };

        self.teardown(&reason).await;

        HandlerOutcome {
            connection: id,
            peer,
            reason,
            messages: self.messages,
        }
    }

    /// Register the connection and send it the full history.
    ///
    /// The writer lock is taken before registering, so a broadcast that
    /// finds this connection in a snapshot waits until the replay is
    /// written, and records covered by the replay are not sent again.
    ///
    /// Returns `Ok(None)` if the server is already shutting down.
    async fn replay(&mut self) -> Result<Option<usize>, TransportError> {
        let conn = Arc::clone(&self.conn);
        let mut writer = conn.lock_writer().await;

        if !self.relay.registry().register(Arc::clone(&conn)) {
            // Registry closed: the shutdown broadcast has already gone out.
            let _ = writer
                .write_frame(&codec::encode(DISCONNECT_MESSAGE.as_bytes()))
                .await;
            return Ok(None);
        }
        self.transition(HandlerState::Replaying);

        let history = self.relay.log().replay();
        let Some(last) = history.last() else {
            return Ok(Some(0));
        };

        let mut buf = BytesMut::new();
        for record in &history {
            codec::encode_into(record.text().as_bytes(), &mut buf);
        }
        writer.write_frame(&buf).await?;
        writer.mark_replayed(last.seq());

        metrics::record_message(buf.len(), "replay");
        Ok(Some(history.len()))
    }

    async fn read_loop(&mut self) -> Disconnect {
        let id = self.conn.id();

        loop {
            let next = tokio::select! {
                biased;
                () = self.conn.closed() => return Disconnect::Evicted,
                next = self.frames.next() => next,
            };

            let payload = match next {
                Some(Ok(payload)) => payload,
                Some(Err(ProtocolError::Io(e))) => return Disconnect::Failed(e.into()),
                Some(Err(e)) => return Disconnect::Failed(e.into()),
                None => return Disconnect::PeerClosed,
            };

            metrics::record_message(payload.len(), "inbound");

            match Payload::classify(&payload) {
                Ok(Payload::Disconnect) => return Disconnect::Graceful,
                Ok(Payload::Chat(text)) => {
                    self.messages += 1;
                    let (record, report) = self.relay.publish(text).await;
                    debug!(
                        connection = %id,
                        seq = record.seq(),
                        delivered = report.delivered,
                        failed = report.failed,
                        "Relayed message"
                    );
                }
                Err(e) => return Disconnect::Failed(e.into()),
            }
        }
    }

    async fn teardown(&mut self, reason: &Disconnect) {
        let id = self.conn.id();
        self.transition(HandlerState::Closing);

        // Unregister before the stream closes so no broadcast targets it.
        self.relay.registry().unregister(id);

        match reason {
            Disconnect::Failed(e) => {
                warn!(connection = %id, error = %e, kind = e.kind(), "Connection dropped");
                metrics::record_error(e.kind());
            }
            Disconnect::Graceful => info!(connection = %id, "Client disconnected"),
            other => debug!(connection = %id, reason = %other, "Connection ended"),
        }

        if let Err(e) = self.conn.close().await {
            trace!(connection = %id, error = %e, "Stream shutdown failed");
        }

        self.conn.mark_closed();
        self.transition(HandlerState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn spawn_handler(relay: &Arc<Relay>) -> (tokio::task::JoinHandle<HandlerOutcome>, DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(server);
        let handler = ConnectionHandler::new(
            Arc::clone(relay),
            ConnectionId::next(),
            None,
            reader,
            writer,
        );
        assert_eq!(handler.state(), HandlerState::New);
        (tokio::spawn(handler.run()), client)
    }

    async fn send(client: &mut DuplexStream, text: &str) {
        client.write_all(&codec::encode(text.as_bytes())).await.unwrap();
    }

    async fn recv(client: &mut DuplexStream) -> String {
        let mut header = [0u8; codec::HEADER_SIZE];
        client.read_exact(&mut header).await.unwrap();
        let mut payload = vec![0u8; codec::decode_header(&header).unwrap()];
        client.read_exact(&mut payload).await.unwrap();
        String::from_utf8(payload).unwrap()
    }

    #[tokio::test]
    async fn test_message_is_logged_and_echoed() {
        let relay = Arc::new(Relay::new());
        let (task, mut client) = spawn_handler(&relay);

        send(&mut client, "alice: hi").await;
        assert_eq!(recv(&mut client).await, "alice: hi");

        send(&mut client, DISCONNECT_MESSAGE).await;
        let outcome = task.await.unwrap();

        assert!(matches!(outcome.reason, Disconnect::Graceful));
        assert_eq!(outcome.messages, 1);

        let texts: Vec<String> = relay
            .log()
            .replay()
            .iter()
            .map(|r| r.text().to_string())
            .collect();
        assert_eq!(texts, vec!["alice: hi"]);
        assert!(relay.registry().is_empty());
    }

    #[tokio::test]
    async fn test_new_connection_gets_history_first() {
        let relay = Arc::new(Relay::new());
        relay.log().append("alice: one");
        relay.log().append("alice: two");

        let (_task, mut client) = spawn_handler(&relay);

        assert_eq!(recv(&mut client).await, "alice: one");
        assert_eq!(recv(&mut client).await, "alice: two");

        send(&mut client, "bob: three").await;
        assert_eq!(recv(&mut client).await, "bob: three");
        assert_eq!(relay.log().len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_header_drops_connection() {
        let relay = Arc::new(Relay::new());
        let (task, mut client) = spawn_handler(&relay);

        client.write_all(&[b'x'; codec::HEADER_SIZE]).await.unwrap();
        let outcome = task.await.unwrap();

        assert!(matches!(
            outcome.reason,
            Disconnect::Failed(TransportError::Protocol(ProtocolError::InvalidHeader(_)))
        ));
        assert!(outcome.reason.is_error());
        assert!(relay.log().is_empty());
        assert!(relay.registry().is_empty());
    }

    #[tokio::test]
    async fn test_peer_close_is_not_an_error() {
        let relay = Arc::new(Relay::new());
        let (task, client) = spawn_handler(&relay);

        drop(client);
        let outcome = task.await.unwrap();

        assert!(!outcome.reason.is_error());
        assert!(relay.registry().is_empty());
    }

    #[tokio::test]
    async fn test_close_signal_unblocks_read() {
        let relay = Arc::new(Relay::new());
        let (task, mut client) = spawn_handler(&relay);

        // Wait until the handler is registered and reading.
        send(&mut client, "carol: ping").await;
        assert_eq!(recv(&mut client).await, "carol: ping");

        for conn in relay.registry().close() {
            conn.begin_close();
        }

        let outcome = task.await.unwrap();
        assert!(matches!(outcome.reason, Disconnect::Evicted));
    }
}
