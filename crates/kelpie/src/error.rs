//! Endpoint-level error types.

use thiserror::Error;

/// Everything that can go wrong in an exchange.
#[derive(Debug, Error)]
pub enum Error {
    /// A confirmable message or block exhausted its send attempts.
    #[error("max send attempts reached")]
    MaxAttempts,

    /// An inbound message could not be decoded.
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] kelpie_core::CodecError),

    /// The URI scheme is not one this endpoint speaks.
    #[error("unsupported scheme")]
    UnsupportedScheme,

    /// The message type cannot be sent through this operation.
    #[error("unsupported message type")]
    UnsupportedMessageType,

    /// No secured session exists for the peer.
    #[error("session not found")]
    SessionNotFound,

    /// The secured session for the peer is stale.
    #[error("session expired")]
    SessionExpired,

    /// The key exchange could not be completed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The peer returned a public key that fails the application pin.
    #[error("expected and current peer public keys do not match")]
    KeysDoNotMatch,

    /// An operation ran out of time.
    #[error("timeout")]
    Timeout,

    /// The underlying socket is closed.
    #[error("socket closed")]
    SocketClosed,

    /// Cryptographic failure.
    #[error(transparent)]
    Crypto(#[from] kelpie_crypto::CryptoError),

    /// Link-layer failure.
    #[error(transparent)]
    Link(kelpie_transport::LinkError),

    /// I/O failure outside the link layer.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<kelpie_transport::LinkError> for Error {
    fn from(e: kelpie_transport::LinkError) -> Self {
        match e {
            kelpie_transport::LinkError::Closed => Error::SocketClosed,
            other => Error::Link(other),
        }
    }
}

/// Result alias for endpoint operations.
pub type Result<T> = std::result::Result<T, Error>;
