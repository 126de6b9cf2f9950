//! # parley-core
//!
//! Connection and broadcast engine for the Parley chat relay.
//!
//! This crate provides the server-side building blocks:
//!
//! - **ConnectionRegistry** - Set of live connections, iterated via snapshots
//! - **MessageLog** - Ordered history of every relayed message
//! - **ConnectionHandler** - Per-connection replay and relay loop
//! - **Broadcaster** - Delivers a message to every registered connection
//! - **ChatServer** - Accept loop and shutdown coordination
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ spawn ┌───────────────────┐ append ┌─────────────┐
//! │ ChatServer  │──────▶│ ConnectionHandler │───────▶│ MessageLog  │
//! └─────────────┘       └───────────────────┘        └─────────────┘
//!        │                    │ register
//!        │ shutdown           ▼
//!        │            ┌───────────────────┐ snapshot ┌─────────────┐
//!        └───────────▶│ConnectionRegistry │◀─────────│ Broadcaster │
//!                     └───────────────────┘          └─────────────┘
//! ```
//!
//! The registry and the log each sit behind their own mutex. Neither lock
//! is held across network I/O and they are never nested.

pub mod broadcast;
pub mod connection;
pub mod handler;
pub mod log;
pub mod metrics;
pub mod registry;
pub mod relay;
pub mod server;

pub use broadcast::{BroadcastReport, Broadcaster};
pub use connection::{Connection, ConnectionId, ConnectionState, Delivery, TransportError};
pub use handler::{ConnectionHandler, Disconnect, HandlerOutcome, HandlerState};
pub use log::{MessageLog, MessageRecord};
pub use registry::ConnectionRegistry;
pub use relay::Relay;
pub use server::{ChatServer, ServerConfig, ServerError, ServerHandle, ShutdownReport, DEFAULT_PORT};
