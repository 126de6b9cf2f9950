//! # parley-protocol
//!
//! Wire protocol definitions for the Parley chat relay.
//!
//! A frame is a 64-byte ASCII header holding the decimal payload length,
//! left-aligned and padded with spaces, followed by the UTF-8 payload.
//!
//! ## Payloads
//!
//! - Chat lines of the form `"<name>: <text>"`
//! - The disconnect sentinel `"!DISCONNECT"`
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, Payload};
//!
//! let encoded = codec::encode(b"alice: hi");
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(Payload::classify(&decoded).unwrap(), Payload::Chat("alice: hi".into()));
//! ```

pub mod codec;
pub mod payload;

pub use codec::{decode, decode_header, encode, FrameCodec, ProtocolError, HEADER_SIZE};
pub use payload::{chat_line, split_sender, Payload, DISCONNECT_MESSAGE};
