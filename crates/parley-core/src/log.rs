//! Append-only message log.
//!
//! Every chat line relayed since the server started is kept here, in the
//! order it won the log's lock. New connections receive a replay of the
//! whole log before joining live traffic.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// A relayed message and its position in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    seq: u64,
    /// Sender-prefixed text (shared so replays don't copy it).
    text: Arc<str>,
}

impl MessageRecord {
    /// Get the sequence index, starting at 1.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Get the message text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for MessageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.seq, self.text)
    }
}

/// Thread-safe, ordered record of all messages since process start.
#[derive(Debug, Default)]
pub struct MessageLog {
    records: Mutex<Vec<MessageRecord>>,
}

impl MessageLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<MessageRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message, assigning it the next sequence index.
    pub fn append(&self, text: impl Into<Arc<str>>) -> MessageRecord {
        let record = {
            let mut records = self.lock();
            let record = MessageRecord {
                seq: records.len() as u64 + 1,
                text: text.into(),
            };
            records.push(record.clone());
            record
        };
        trace!(seq = record.seq, "Appended message");
        record
    }

    /// Take a snapshot of the full history, in sequence order.
    #[must_use]
    pub fn replay(&self) -> Vec<MessageRecord> {
        self.lock().clone()
    }

    /// Get the number of logged messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if nothing has been logged yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
