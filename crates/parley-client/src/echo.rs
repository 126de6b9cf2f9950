//! Display-side echo suppression.

use parley_protocol::DISCONNECT_MESSAGE;

/// Hides the server's echo of a line this client just sent.
///
/// The relay sends every line back to its author. A terminal that already
/// printed the line when it was typed uses this filter to skip the first
/// identical inbound copy. Only the most recent sent line is remembered.
#[derive(Debug, Default)]
pub struct EchoFilter {
    pending: Option<String>,
}

impl EchoFilter {
    /// Create an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a line that was just sent and shown locally.
    pub fn sent(&mut self, line: impl Into<String>) {
        self.pending = Some(line.into());
    }

    /// Decide whether an inbound line should be shown.
    ///
    /// Sentinels are never shown. A line equal to the remembered one is
    /// suppressed once.
    pub fn should_display(&mut self, line: &str) -> bool {
        if line == DISCONNECT_MESSAGE {
            return false;
        }
        if self.pending.as_deref() == Some(line) {
            self.pending = None;
            return false;
        }
        true
    }
}
