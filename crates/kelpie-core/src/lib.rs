//! # Kelpie Core
//!
//! Message model and binary codec for the Kelpie CoAP endpoint library.
//!
//! This crate provides:
//! - The [`Message`] model (header fields, token, options, payload, plus
//!   runtime routing metadata)
//! - RFC 7252 §3 serialization and deserialization
//! - Block descriptors for block-wise transfers
//! - Length-prefix framing for stream transports
//!
//! ## Wire layout
//!
//! ```text
//! ┌─────┬──────┬─────┬──────┬────────────┬───────┬─────────┬──────┬─────────┐
//! │ ver │ type │ tkl │ code │ message id │ token │ options │ 0xFF │ payload │
//! │  2b │  2b  │ 4b  │  8b  │    16b     │ 0..8B │   ...   │  8b  │   ...   │
//! └─────┴──────┴─────┴──────┴────────────┴───────┴─────────┴──────┴─────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod codec;
pub mod error;
pub mod framing;
pub mod message;
pub mod option;

pub use block::{BlockOption, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
pub use codec::{deserialize, serialize};
pub use error::{CodecError, FrameError};
pub use message::{Code, Message, MessageOption, MessageType, Scheme};
pub use option::HandshakeType;

use std::time::Duration;

/// Protocol version carried in the two top bits of the first header byte.
pub const COAP_VERSION: u8 = 1;

/// Fixed message header size in bytes.
pub const HEADER_SIZE: usize = 4;

/// Largest payload carried by a single message; anything bigger is split
/// into block-wise transfer.
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Maximum datagram size accepted from the wire.
pub const MTU: usize = 1500;

/// How long a sender waits for an acknowledgement before retransmitting.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Content-Format value marking an encrypted (opaque) payload.
pub const MEDIA_TYPE_OCTET_STREAM: u32 = 42;
