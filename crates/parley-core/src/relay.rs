//! Shared relay state.

use crate::broadcast::{BroadcastReport, Broadcaster};
use crate::log::{MessageLog, MessageRecord};
use crate::metrics;
use crate::registry::ConnectionRegistry;
use std::sync::Arc;
use tokio::sync::Mutex;

/// State shared by every connection handler of one server.
#[derive(Debug)]
pub struct Relay {
    registry: Arc<ConnectionRegistry>,
    log: MessageLog,
    broadcaster: Broadcaster,
    /// Held from append until the record's delivery pass ends, so every
    /// connection sees live records in sequence order.
    publish_order: Mutex<()>,
}

impl Relay {
    /// Create an empty relay.
    #[must_use]
    pub fn new() -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        Self {
            broadcaster: Broadcaster::new(registry.clone()),
            registry,
            log: MessageLog::new(),
            publish_order: Mutex::new(()),
        }
    }

    /// Get the connection registry.
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Get the message log.
    #[must_use]
    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    /// Get the broadcaster.
    #[must_use]
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Append a chat line to the log and broadcast it to every connection.
    pub async fn publish(&self, text: impl Into<Arc<str>>) -> (MessageRecord, BroadcastReport) {
        let _order = self.publish_order.lock().await;
        let record = self.log.append(text);
        metrics::set_log_length(record.seq());
        let report = self.broadcaster.broadcast(&record).await;
        (record, report)
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}
