//! Client error types.

use thiserror::Error;

/// Errors returned by [`ChatClient`](crate::ChatClient).
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server could not be reached.
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        /// Address that was dialed.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// I/O error on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The session has already ended.
    #[error("Disconnected from server")]
    Disconnected,
}
