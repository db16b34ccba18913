//! The link abstraction over datagram and stream sockets.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;

/// Link layer errors.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// I/O error from the underlying socket.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The socket or connection is closed.
    #[error("link closed")]
    Closed,

    /// Address binding failed.
    #[error("failed to bind: {0}")]
    BindFailed(String),

    /// Dialing the remote failed.
    #[error("failed to connect: {0}")]
    ConnectFailed(String),

    /// The receive buffer is smaller than an inbound frame.
    #[error("short buffer: frame of {expected} bytes, buffer of {actual}")]
    ShortBuffer {
        /// Frame size announced by the prefix
        expected: usize,
        /// Capacity of the caller's buffer
        actual: usize,
    },

    /// A stream frame prefix could not be decoded.
    #[error("invalid frame")]
    InvalidFrame,

    /// The operation needs a connected peer and the link has none.
    #[error("link has no peer")]
    NoPeer,
}

/// Result alias for link operations.
pub type LinkResult<T> = Result<T, LinkError>;

/// One socket: a connected or listening UDP socket, or a TCP connection.
///
/// For stream links a `recv` yields exactly one framed message and a
/// `send` writes one whole frame; partial frames never cross this
/// boundary.
#[async_trait]
pub trait Link: Send + Sync {
    /// Send to the connected peer.
    async fn send(&self, buf: &[u8]) -> LinkResult<usize>;

    /// Send to an explicit address. Point-to-point links ignore the
    /// address.
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> LinkResult<usize>;

    /// Receive one message from the connected peer.
    async fn recv(&self, buf: &mut [u8]) -> LinkResult<usize>;

    /// Receive one message and its sender address.
    async fn recv_from(&self, buf: &mut [u8]) -> LinkResult<(usize, SocketAddr)>;

    /// Local bound address.
    fn local_addr(&self) -> LinkResult<SocketAddr>;

    /// Remote address, when the link is connected.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Grow the kernel receive buffer; a no-op where it does not apply.
    fn set_recv_buffer(&self, _bytes: usize) {}
}
