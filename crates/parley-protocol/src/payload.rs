//! Payload types carried inside frames.
//!
//! A payload is UTF-8 text: either a chat line of the form
//! `"<name>: <text>"` or the reserved disconnect sentinel.

use crate::codec::ProtocolError;

/// Reserved payload signalling an intentional disconnect.
pub const DISCONNECT_MESSAGE: &str = "!DISCONNECT";

/// Separator between the sender name and the text of a chat line.
pub const SENDER_SEPARATOR: &str = ": ";

/// A decoded frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A chat line to be logged and relayed.
    Chat(String),
    /// The disconnect sentinel.
    Disconnect,
}

impl Payload {
    /// Classify raw payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidUtf8`] if the bytes are not UTF-8.
    pub fn classify(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes)?;
        if text == DISCONNECT_MESSAGE {
            Ok(Self::Disconnect)
        } else {
            Ok(Self::Chat(text.to_string()))
        }
    }
}

/// Build a sender-prefixed chat line.
#[must_use]
pub fn chat_line(name: &str, text: &str) -> String {
    format!("{name}{SENDER_SEPARATOR}{text}")
}

/// Split a chat line into sender name and text at the first separator.
#[must_use]
pub fn split_sender(line: &str) -> Option<(&str, &str)> {
    line.split_once(SENDER_SEPARATOR)
        .map(|(name, text)| (name.trim(), text))
}
