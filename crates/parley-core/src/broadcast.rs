//! Fan-out of relayed messages to every registered connection.

use crate::connection::{Connection, Delivery, TransportError};
use crate::log::MessageRecord;
use crate::metrics;
use crate::registry::ConnectionRegistry;
use bytes::Bytes;
use futures_util::future::join_all;
use parley_protocol::codec;
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// Summary of one delivery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the frame was written to.
    pub delivered: usize,
    /// Connections that already had the record from history replay.
    pub skipped: usize,
    /// Connections already on their way out when the pass reached them.
    pub closing: usize,
    /// Connections whose delivery failed; these were pruned.
    pub failed: usize,
}

impl BroadcastReport {
    /// Number of connections the pass worked on.
    #[must_use]
    pub fn targets(&self) -> usize {
        self.delivered + self.skipped + self.closing + self.failed
    }
}

/// Delivers frames to a snapshot of the connection registry.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    /// Create a broadcaster over a registry.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver a log record to every registered connection.
    ///
    /// A failed write never stops delivery to the remaining connections.
    /// After the pass, each failed connection is removed from the registry
    /// and its handler is woken so it can finish its own teardown.
    /// Connections already closing are passed over quietly.
    pub async fn broadcast(&self, record: &MessageRecord) -> BroadcastReport {
        let frame = codec::encode(record.text().as_bytes());
        let targets = self.registry.snapshot();
        let mut report = BroadcastReport::default();
        let mut failed: Vec<Arc<Connection>> = Vec::new();

        for conn in targets {
            match conn.deliver(record.seq(), &frame).await {
                Ok(Delivery::Written) => {
                    report.delivered += 1;
                    metrics::record_message(frame.len(), "outbound");
                }
                Ok(Delivery::Skipped) => report.skipped += 1,
                Err(TransportError::ConnectionClosed) => {
                    trace!(connection = %conn.id(), "Skipping closing connection");
                    report.closing += 1;
                }
                Err(e) => {
                    warn!(connection = %conn.id(), error = %e, "Delivery failed");
                    failed.push(conn);
                }
            }
        }

        report.failed = failed.len();
        metrics::record_delivery_failures(failed.len());

        for conn in failed {
            self.registry.unregister(conn.id());
            conn.begin_close();
        }

        trace!(seq = record.seq(), ?report, "Broadcast record");
        report
    }

    /// Send a last payload (the disconnect sentinel) to each of `targets`.
    ///
    /// Every target is written concurrently with its own `wait` bound, so
    /// one stalled peer cannot hold up the rest. Afterwards no target
    /// accepts further writes.
    pub async fn broadcast_final(
        &self,
        targets: &[Arc<Connection>],
        payload: &[u8],
        wait: Duration,
    ) -> BroadcastReport {
        let frame = codec::encode(payload);
        let sends = targets.iter().map(|conn| {
            let frame = &frame;
            async move {
                let result = tokio::time::timeout(wait, conn.send_final(frame)).await;
                conn.begin_close();
                (conn, result)
            }
        });

        let mut report = BroadcastReport::default();
        for (conn, result) in join_all(sends).await {
            match result {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(TransportError::ConnectionClosed)) => report.closing += 1,
                Ok(Err(e)) => {
                    trace!(connection = %conn.id(), error = %e, "Final send failed");
                    report.failed += 1;
                }
                Err(_) => {
                    trace!(connection = %conn.id(), "Final send timed out");
                    report.failed += 1;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionId;
    use crate::log::MessageLog;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn attach(registry: &ConnectionRegistry) -> (Arc<Connection>, DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        let (_, write) = tokio::io::split(server);
        let conn = Arc::new(Connection::new(ConnectionId::next(), None, write));
        registry.register(conn.clone());
        (conn, client)
    }

    async fn read_payload(client: &mut DuplexStream) -> String {
        let mut header = [0u8; codec::HEADER_SIZE];
        client.read_exact(&mut header).await.unwrap();
        let len = codec::decode_header(&header).unwrap();
        let mut payload = vec![0u8; len];
        client.read_exact(&mut payload).await.unwrap();
        String::from_utf8(payload).unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone() {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Broadcaster::new(registry.clone());
        let log = MessageLog::new();

        let (_a, mut client_a) = attach(&registry);
        let (_b, mut client_b) = attach(&registry);

        let record = log.append("alice: hi");
        let report = broadcaster.broadcast(&record).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(read_payload(&mut client_a).await, "alice: hi");
        assert_eq!(read_payload(&mut client_b).await, "alice: hi");
    }

    #[tokio::test]
    async fn test_failed_delivery_prunes_only_that_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Broadcaster::new(registry.clone());
        let log = MessageLog::new();

        let (dead, dead_client) = attach(&registry);
        let (alive, mut alive_client) = attach(&registry);
        drop(dead_client);

        let record = log.append("bob: still here?");
        let report = broadcaster.broadcast(&record).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.targets(), 2);
        assert!(!registry.contains(dead.id()));
        assert!(dead.is_close_requested());
        assert!(registry.contains(alive.id()));
        assert_eq!(read_payload(&mut alive_client).await, "bob: still here?");
    }

    #[tokio::test]
    async fn test_broadcast_skips_replayed_records() {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Broadcaster::new(registry.clone());
        let log = MessageLog::new();

        let (conn, mut client) = attach(&registry);
        let first = log.append("a: 1");
        let second = log.append("a: 2");
        conn.lock_writer().await.mark_replayed(first.seq());

        let report = broadcaster.broadcast(&first).await;
        assert_eq!(report.skipped, 1);
        assert_eq!(report.delivered, 0);

        broadcaster.broadcast(&second).await;
        assert_eq!(read_payload(&mut client).await, "a: 2");
    }

    #[tokio::test]
    async fn test_closing_connection_is_not_a_failure() {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Broadcaster::new(registry.clone());
        let log = MessageLog::new();

        let (leaving, _leaving_client) = attach(&registry);
        let (_alive, mut alive_client) = attach(&registry);
        // Handler has started teardown but not unregistered yet.
        leaving.begin_close();

        let report = broadcaster.broadcast(&log.append("erin: bye?")).await;

        assert_eq!(report.closing, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.delivered, 1);
        assert_eq!(read_payload(&mut alive_client).await, "erin: bye?");
    }

    #[tokio::test]
    async fn test_broadcast_final_sends_sentinel_last() {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Broadcaster::new(registry.clone());
        let log = MessageLog::new();

        let (conn, mut client) = attach(&registry);
        let targets = registry.close();
        let report = broadcaster
            .broadcast_final(
                &targets,
                parley_protocol::DISCONNECT_MESSAGE.as_bytes(),
                Duration::from_secs(1),
            )
            .await;

        assert_eq!(report.delivered, 1);
        assert_eq!(read_payload(&mut client).await, "!DISCONNECT");
        assert!(!conn.is_active());
        assert!(matches!(
            conn.deliver(1, &codec::encode(log.append("late: line").text().as_bytes()))
                .await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_stalled_peer_does_not_hold_up_final_pass() {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Broadcaster::new(registry.clone());

        let (stalled, _stalled_client) = attach(&registry);
        let (_ready, mut ready_client) = attach(&registry);
        let targets = registry.close();

        // The stalled connection is first in line and never frees its writer.
        let _held = stalled.lock_writer().await;
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            broadcaster.broadcast_final(
                &targets,
                parley_protocol::DISCONNECT_MESSAGE.as_bytes(),
                Duration::from_millis(200),
            ),
        )
        .await
        .unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(read_payload(&mut ready_client).await, "!DISCONNECT");
        assert!(stalled.is_close_requested());
    }
}
