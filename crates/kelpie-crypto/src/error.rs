//! Error types for the crypto layer.

use thiserror::Error;

/// Cryptographic failures.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key material has the wrong length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected size in bytes
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// The Diffie-Hellman exchange produced a low-order result.
    #[error("key exchange produced a low-order shared secret")]
    LowOrderSharedSecret,

    /// No peer public key is available for the operation.
    #[error("no peer public key")]
    NoPeerKey,

    /// The peer's signature does not match ours.
    #[error("shared-secret signatures do not match")]
    SignatureMismatch,

    /// Key derivation failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// AEAD encryption failed.
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption or authentication failed.
    #[error("decryption failed")]
    DecryptionFailed,
}
