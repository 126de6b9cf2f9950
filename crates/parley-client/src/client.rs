//! Connection to a Parley server.
//!
//! [`ChatClient::connect`] splits the stream: the write half stays with the
//! client for [`ChatClient::send`], and a background task decodes inbound
//! frames into the [`Inbox`].

use crate::error::ClientError;
use futures_util::StreamExt;
use parley_protocol::{chat_line, codec, FrameCodec, Payload, DISCONNECT_MESSAGE};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long [`ChatClient::disconnect`] waits for the server to close.
const DISCONNECT_WAIT: Duration = Duration::from_secs(1);

/// Something that arrived from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A relayed chat line, including this client's own lines.
    Message(String),
    /// The session ended. Always the last notification.
    Closed,
}

/// Ordered queue of inbound notifications.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl Inbox {
    /// Wait for the next notification.
    ///
    /// Returns `None` once [`Notification::Closed`] has been taken and the
    /// receive task is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    /// Take the next notification if one is already queued.
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }
}

/// A connected chat session.
pub struct ChatClient {
    nickname: String,
    peer: SocketAddr,
    writer: OwnedWriteHalf,
    running: CancellationToken,
    receiver: JoinHandle<()>,
}

impl ChatClient {
    /// Connect to a server and start receiving.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connect`] if the server cannot be reached.
    pub async fn connect<A>(
        addr: A,
        nickname: impl Into<String>,
    ) -> Result<(Self, Inbox), ClientError>
    where
        A: ToSocketAddrs + fmt::Display,
    {
        let target = addr.to_string();
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: target,
                source,
            })?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        let running = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let receiver = tokio::spawn(receive_loop(
            FramedRead::new(reader, FrameCodec),
            tx,
            running.clone(),
        ));

        let nickname = nickname.into();
        debug!(peer = %peer, nickname = %nickname, "Connected");

        Ok((
            Self {
                nickname,
                peer,
                writer,
                running,
                receiver,
            },
            Inbox { rx },
        ))
    }

    /// Get the name prefixed to every sent line.
    #[must_use]
    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Get the server address.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Check if the session is still up.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.running.is_cancelled()
    }

    /// Send `text` as `"<nickname>: <text>"`.
    ///
    /// Blank text is not sent and yields `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Disconnected`] after the session has ended, or
    /// the write error.
    pub async fn send(&mut self, text: &str) -> Result<bool, ClientError> {
        if !self.is_running() {
            return Err(ClientError::Disconnected);
        }
        if text.trim().is_empty() {
            return Ok(false);
        }
        let line = chat_line(&self.nickname, text);
        self.write_frame(line.as_bytes()).await?;
        Ok(true)
    }

    /// Leave the chat.
    ///
    /// Sends the disconnect sentinel, waits briefly for the server to close
    /// the stream, then shuts the socket down. Failures are logged, not
    /// returned.
    pub async fn disconnect(mut self) {
        let was_running = self.is_running();
        self.running.cancel();

        if was_running {
            if let Err(e) = self.write_frame(DISCONNECT_MESSAGE.as_bytes()).await {
                debug!(error = %e, "Failed to send disconnect");
            }
        }

        match tokio::time::timeout(DISCONNECT_WAIT, &mut self.receiver).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Receive task failed"),
            Err(_) => {
                debug!("Server did not close in time");
                self.receiver.abort();
            }
        }

        if let Err(e) = self.writer.shutdown().await {
            debug!(error = %e, "Socket shutdown failed");
        }
        debug!(peer = %self.peer, "Disconnected");
    }

    async fn write_frame(&mut self, payload: &[u8]) -> Result<(), ClientError> {
        self.writer.write_all(&codec::encode(payload)).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

impl fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatClient")
            .field("nickname", &self.nickname)
            .field("peer", &self.peer)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

async fn receive_loop(
    mut frames: FramedRead<OwnedReadHalf, FrameCodec>,
    tx: mpsc::UnboundedSender<Notification>,
    running: CancellationToken,
) {
    while let Some(frame) = frames.next().await {
        let payload = match frame.and_then(|bytes| Payload::classify(&bytes)) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Dropping connection after bad frame");
                break;
            }
        };

        match payload {
            Payload::Disconnect => {
                debug!("Server requested disconnect");
                break;
            }
            Payload::Chat(line) => {
                // A dropped inbox just means nobody is listening.
                let _ = tx.send(Notification::Message(line));
            }
        }
    }

    running.cancel();
    let _ = tx.send(Notification::Closed);
}
