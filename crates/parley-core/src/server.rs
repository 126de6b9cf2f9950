//! Listener and shutdown coordination.
//!
//! [`ChatServer`] owns the listening socket. It accepts connections, spawns
//! one [`ConnectionHandler`] task per connection, and on shutdown tells
//! every client to disconnect, closes their streams, and releases the
//! socket.

use crate::connection::ConnectionId;
use crate::handler::{ConnectionHandler, HandlerOutcome};
use crate::metrics;
use crate::relay::Relay;
use parley_protocol::DISCONNECT_MESSAGE;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 5050;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be bound.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Longest single wait for a connection before the accept loop
    /// re-checks its state.
    pub accept_timeout: Duration,
    /// How long shutdown waits for notifications, stream closes, and
    /// handler tasks before giving up on them.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            accept_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// What shutdown accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections that received the disconnect sentinel.
    pub notified: usize,
    /// Connections whose streams were closed.
    pub closed: usize,
    /// Handler tasks that had to be aborted after the grace period.
    pub aborted: usize,
}

/// Cloneable handle for observing and stopping a running server.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    relay: Arc<Relay>,
    shutdown: CancellationToken,
}

impl ServerHandle {
    /// Ask the server to shut down.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Check if shutdown has been requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.relay.registry().len()
    }

    /// Number of messages in the history.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.relay.log().len()
    }

    /// Get the shared relay state.
    #[must_use]
    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }
}

/// The chat relay server.
pub struct ChatServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    relay: Arc<Relay>,
    config: ServerConfig,
    shutdown: CancellationToken,
    handlers: JoinSet<HandlerOutcome>,
}

impl ChatServer {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!("Parley server listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            relay: Arc::new(Relay::new()),
            config,
            shutdown: CancellationToken::new(),
            handlers: JoinSet::new(),
        })
    }

    /// Get the address the server is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get a handle for stopping and observing the server.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            relay: Arc::clone(&self.relay),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Run until [`ServerHandle::shutdown`] is called.
    pub async fn run(self) -> ShutdownReport {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run until `signal` completes or [`ServerHandle::shutdown`] is called,
    /// then shut down.
    pub async fn run_until<F>(mut self, signal: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(signal);

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                () = &mut signal => {
                    info!("Shutdown signal received");
                    break;
                }
                accepted = tokio::time::timeout(self.config.accept_timeout, self.listener.accept()) => {
                    match accepted {
                        Ok(Ok((stream, peer))) => self.spawn_handler(stream, peer),
                        Ok(Err(e)) => {
                            warn!(error = %e, "Failed to accept connection");
                            metrics::record_error("accept");
                        }
                        Err(_) => {}
                    }
                    self.reap_finished();
                }
            }
        }

        self.shutdown().await
    }

    fn spawn_handler(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let id = ConnectionId::next();
        let (reader, writer) = stream.into_split();
        let handler = ConnectionHandler::new(Arc::clone(&self.relay), id, Some(peer), reader, writer);
        self.handlers.spawn(handler.run());

        info!(connection = %id, peer = %peer, "New connection");
        debug!(active = self.handlers.len(), "Active handlers");
    }

    fn reap_finished(&mut self) {
        while let Some(result) = self.handlers.try_join_next() {
            log_outcome(result);
        }
    }

    async fn shutdown(self) -> ShutdownReport {
        let Self {
            listener,
            relay,
            config,
            shutdown,
            mut handlers,
            ..
        } = self;

        info!("Shutting down");
        shutdown.cancel();

        let grace = config.shutdown_grace;
        let mut report = shutdown_connections(&relay, grace).await;

        // Stop accepting and release the socket before waiting on handlers.
        drop(listener);

        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = handlers.join_next().await {
                log_outcome(result);
            }
        })
        .await;

        if drained.is_err() {
            report.aborted = handlers.len();
            warn!(remaining = report.aborted, "Aborting handlers after grace period");
            handlers.shutdown().await;
        }

        info!(
            notified = report.notified,
            closed = report.closed,
            aborted = report.aborted,
            "Server shut down"
        );
        report
    }
}

/// Tell every registered connection to disconnect, then close them all.
///
/// The registry is closed first, so every connection is either in the
/// drained list and gets the sentinel here, or fails to register and sends
/// the sentinel itself. Individual failures are ignored so shutdown always
/// completes; each send and each close is bounded by `grace` in case a peer
/// has stopped reading.
pub async fn shutdown_connections(relay: &Relay, grace: Duration) -> ShutdownReport {
    let connections = relay.registry().close();

    let sent = relay
        .broadcaster()
        .broadcast_final(&connections, DISCONNECT_MESSAGE.as_bytes(), grace)
        .await;
    if sent.failed > 0 {
        warn!(failed = sent.failed, "Some clients were not notified of shutdown");
    }

    let mut report = ShutdownReport {
        notified: sent.delivered,
        ..ShutdownReport::default()
    };

    for conn in connections {
        match tokio::time::timeout(grace, conn.close()).await {
            Ok(Ok(())) => report.closed += 1,
            Ok(Err(e)) => debug!(connection = %conn.id(), error = %e, "Close failed"),
            Err(_) => debug!(connection = %conn.id(), "Close timed out"),
        }
    }

    report
}

fn log_outcome(result: Result<HandlerOutcome, tokio::task::JoinError>) {
    match result {
        Ok(outcome) => debug!(
            connection = %outcome.connection,
            reason = %outcome.reason,
            messages = outcome.messages,
            "Handler finished"
        ),
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!(error = %e, "Handler task panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            accept_timeout: Duration::from_millis(50),
            shutdown_grace: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.accept_timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let server = ChatServer::bind(local_config()).await.unwrap();
        let taken = ServerConfig {
            bind_addr: server.local_addr(),
            ..local_config()
        };

        match ChatServer::bind(taken).await {
            Err(ServerError::Bind { addr, .. }) => assert_eq!(addr, server.local_addr()),
            other => panic!("Expected bind error, got {:?}", other.map(|s| s.local_addr())),
        }
    }

    #[tokio::test]
    async fn test_shutdown_releases_socket() {
        let server = ChatServer::bind(local_config()).await.unwrap();
        let addr = server.local_addr();
        let handle = server.handle();

        let task = tokio::spawn(server.run());
        handle.shutdown();
        let report = task.await.unwrap();

        assert_eq!(report, ShutdownReport::default());
        assert!(handle.is_shutting_down());

        // The port can be bound again once the listener is gone.
        let rebound = ChatServer::bind(ServerConfig {
            bind_addr: addr,
            ..local_config()
        })
        .await;
        assert!(rebound.is_ok());
    }

    async fn read_frame(client: &mut tokio::io::DuplexStream) -> Option<String> {
        use tokio::io::AsyncReadExt;

        let mut header = [0u8; parley_protocol::HEADER_SIZE];
        client.read_exact(&mut header).await.ok()?;
        let mut payload = vec![0u8; parley_protocol::decode_header(&header).ok()?];
        client.read_exact(&mut payload).await.ok()?;
        String::from_utf8(payload).ok()
    }

    #[tokio::test]
    async fn test_connection_arriving_during_shutdown_is_notified() {
        use crate::connection::Connection;
        use crate::handler::Disconnect;

        let relay = Arc::new(Relay::new());

        let (mut first_client, first_server) = tokio::io::duplex(4096);
        let (_, first_write) = tokio::io::split(first_server);
        let first = Arc::new(Connection::new(ConnectionId::next(), None, first_write));
        assert!(relay.registry().register(Arc::clone(&first)));

        // Keep the sentinel pass waiting on the first connection.
        let held = first.lock_writer().await;
        let coordinator = {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move { shutdown_connections(&relay, Duration::from_secs(2)).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while !relay.registry().is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // A handler starts while the pass is still blocked.
        let (mut late_client, late_server) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(late_server);
        let handler = ConnectionHandler::new(
            Arc::clone(&relay),
            ConnectionId::next(),
            None,
            reader,
            writer,
        );
        let late = tokio::spawn(handler.run());

        drop(held);
        let report = coordinator.await.unwrap();
        let outcome = late.await.unwrap();

        assert_eq!(report.notified, 1);
        assert!(matches!(outcome.reason, Disconnect::Evicted));
        assert_eq!(read_frame(&mut first_client).await.as_deref(), Some(DISCONNECT_MESSAGE));
        assert_eq!(read_frame(&mut late_client).await.as_deref(), Some(DISCONNECT_MESSAGE));
        // Nothing follows the sentinel.
        assert_eq!(read_frame(&mut late_client).await, None);
        assert!(relay.registry().is_empty());
    }
}
