//! # Kelpie
//!
//! A CoAP endpoint library with end-to-end encryption, reliable
//! block-wise transfer over unreliable datagrams, symmetric
//! request/response roles, and cross-transport proxying. A single
//! process can initiate requests, serve resources identified by
//! path+method, and relay messages between peers on different links.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                         Endpoint                                │
//! │   (resource table, listen loops, proxy tables, backward chan)  │
//! ├────────────────────────────────────────────────────────────────┤
//! │                  Local state · Security layer                   │
//! │   (per-(peer,token) reassembly, handshake dispatch, AEAD)      │
//! ├────────────────────────────────────────────────────────────────┤
//! │                         Exchange                                │
//! │   (CON retransmission, Block1 upload, Block2 download)         │
//! ├────────────────────────────────────────────────────────────────┤
//! │                       Codec · Links                             │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use kelpie::{Client, Endpoint, EndpointConfig, ResourceResult};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), kelpie::Error> {
//! let endpoint = Arc::new(Endpoint::new(EndpointConfig::default()));
//! endpoint.get("/info", |_req| ResourceResult::content(b"ok".to_vec()));
//! tokio::spawn({
//!     let endpoint = endpoint.clone();
//!     async move { endpoint.listen("127.0.0.1:5683").await }
//! });
//!
//! let client = Client::new();
//! let response = client.get("coap://127.0.0.1:5683/info").await?;
//! assert_eq!(response.body, b"ok");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backward;
pub mod cache;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub(crate) mod exchange;
pub mod resource;
pub(crate) mod security;
pub(crate) mod state;
pub(crate) mod store;

pub use client::{Client, Response};
pub use config::EndpointConfig;
pub use endpoint::Endpoint;
pub use error::Error;
pub use resource::ResourceResult;

pub use kelpie_core::{
    option, Code, Message, MessageType, Scheme, ACK_TIMEOUT, MAX_PAYLOAD_SIZE, MTU,
};

use std::time::Duration;

/// Default number of blocks a sender keeps in flight.
pub const DEFAULT_WINDOW_SIZE: usize = 16;

/// Lower bound for a negotiated window.
pub const MIN_WINDOW_SIZE: usize = 4;

/// Upper bound for a negotiated window.
pub const MAX_WINDOW_SIZE: usize = 64;

/// Total send attempts for one confirmable message or block.
pub const MAX_SEND_ATTEMPTS: u32 = 3;

/// Wall-clock ceiling for a block-wise transfer, and the idle lifetime of
/// per-exchange reassembly state.
pub const SUM_TIME_ATTEMPTS: Duration = Duration::from_secs(
    ACK_TIMEOUT.as_secs() * MAX_SEND_ATTEMPTS as u64 * DEFAULT_WINDOW_SIZE as u64,
);

/// Idle lifetime of a secured session.
pub const SESSION_TTL: Duration = Duration::from_secs(249);

/// Lifetime of a proxy forwarding note, refreshed on each traversal.
pub const PROXY_NOTE_TTL: Duration = Duration::from_secs(60);

/// How long a backward-channel read waits for its response.
pub const BACKWARD_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Resend cadence for server-pushed response blocks.
pub(crate) const BLOCK_RESEND_INTERVAL: Duration = Duration::from_millis(500);

/// Default cap on concurrently dispatched inbound messages.
pub const DEFAULT_MAX_PARALLEL: usize = 256;
