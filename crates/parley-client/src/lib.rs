//! # parley-client
//!
//! Client side of the Parley chat relay.
//!
//! - **ChatClient** - Sends chat lines and the disconnect sentinel
//! - **Inbox** - Ordered queue of inbound lines, ending with `Closed`
//! - **EchoFilter** - Hides the server's echo of a line shown locally
//!
//! ```no_run
//! use parley_client::{ChatClient, Notification};
//!
//! # async fn demo() -> Result<(), parley_client::ClientError> {
//! let (mut client, mut inbox) = ChatClient::connect("127.0.0.1:5050", "alice").await?;
//! client.send("hi").await?;
//!
//! while let Some(Notification::Message(line)) = inbox.recv().await {
//!     println!("{line}");
//! }
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

mod client;
mod echo;
mod error;

pub use client::{ChatClient, Inbox, Notification};
pub use echo::EchoFilter;
pub use error::ClientError;

/// Default server address.
pub const DEFAULT_SERVER: &str = "127.0.0.1:5050";
