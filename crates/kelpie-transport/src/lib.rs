//! # Kelpie Transport
//!
//! Socket acquisition for the Kelpie CoAP endpoint library: async UDP
//! bind/dial and framed TCP connections behind one [`Link`] trait, so the
//! protocol machinery is agnostic to what carries its datagrams.
//!
//! A `Link` is bound to one socket — either a UDP socket (connected for
//! dialed peers, unconnected for listeners) or a single TCP connection
//! whose reads and writes move whole length-prefixed frames.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod link;
pub mod tcp;
pub mod udp;

pub use link::{Link, LinkError, LinkResult};
pub use tcp::TcpLink;
pub use udp::UdpLink;
