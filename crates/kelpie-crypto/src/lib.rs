//! # Kelpie Crypto
//!
//! Key agreement, key derivation, and authenticated encryption for the
//! Kelpie CoAP endpoint library.
//!
//! A secured session is established by exchanging ephemeral Curve25519
//! public keys, hashing the shared secret into a signature both peers can
//! compare, and deriving two AEAD halves so that one side's send keys are
//! the other side's receive keys:
//!
//! ```text
//! Initiator                         Responder
//!     |                                 |
//!     |---- ClientHello (pub key) ----->|
//!     |                                 |
//!     |<---- PeerHello (pub key) -------|
//!     |                                 |
//!     | shared = X25519(priv, peer)     | shared = X25519(priv, peer)
//!     | install (peer, my) key order    | install (my, peer) key order
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod derive;
pub mod error;
pub mod session;
pub mod x25519;

pub use aead::{AeadPair, IV_SIZE, KEY_SIZE, TAG_SIZE};
pub use derive::{derive_keys, DerivedKeys};
pub use error::CryptoError;
pub use session::SecuredSession;
pub use x25519::{PrivateKey, PublicKey, SharedSecret};

/// Size of a Curve25519 public key and of a handshake signature.
pub const PUBLIC_KEY_SIZE: usize = 32;
