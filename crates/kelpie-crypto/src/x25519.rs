//! X25519 Diffie-Hellman key exchange (RFC 7748).
//!
//! Provides curve25519-based key exchange with low-order point rejection,
//! automatic key clamping, and zeroization of sensitive data. A private
//! key is either freshly random (ephemeral sessions) or derived from a
//! configured long-term key by hashing it into the scalar.

use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// X25519 private key (32 bytes).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey(x25519_dalek::StaticSecret);

/// X25519 public key (32 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(x25519_dalek::PublicKey);

/// X25519 shared secret (32 bytes).
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(x25519_dalek::SharedSecret);

impl PrivateKey {
    /// Generate a new random private key.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(rng))
    }

    /// Derive a static private key from a long-term secret by hashing it
    /// into the scalar.
    #[must_use]
    pub fn from_long_term_key(secret: &[u8]) -> Self {
        let digest: [u8; 32] = Sha256::digest(secret).into();
        Self(x25519_dalek::StaticSecret::from(digest))
    }

    /// Import from raw scalar bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::StaticSecret::from(bytes))
    }

    /// Derive the public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0))
    }

    /// Perform the Diffie-Hellman exchange.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::LowOrderSharedSecret` if the peer key is a
    /// low-order point.
    pub fn exchange(&self, peer_public: &PublicKey) -> Result<SharedSecret, CryptoError> {
        let shared = self.0.diffie_hellman(&peer_public.0);
        if shared.as_bytes() == &[0u8; 32] {
            return Err(CryptoError::LowOrderSharedSecret);
        }
        Ok(SharedSecret(shared))
    }
}

impl PublicKey {
    /// Import from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }

    /// Import from a slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` unless the slice is 32
    /// bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = slice
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: 32,
                actual: slice.len(),
            })?;
        Ok(Self::from_bytes(bytes))
    }

    /// Export as bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        *self.0.as_bytes()
    }

    /// Bytes as a slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl SharedSecret {
    /// Shared secret bytes; feed these to the KDF, never use directly as
    /// a key.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_key_generation() {
        let private = PrivateKey::generate(&mut OsRng);
        assert_ne!(private.public_key().to_bytes(), [0u8; 32]);
    }

    #[test]
    fn test_exchange_commutes() {
        let a = PrivateKey::generate(&mut OsRng);
        let b = PrivateKey::generate(&mut OsRng);

        let ab = a.exchange(&b.public_key()).unwrap();
        let ba = b.exchange(&a.public_key()).unwrap();
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_reject_low_order_point() {
        let private = PrivateKey::generate(&mut OsRng);
        let zero = PublicKey::from_bytes([0u8; 32]);
        assert!(matches!(
            private.exchange(&zero),
            Err(CryptoError::LowOrderSharedSecret)
        ));
    }

    #[test]
    fn test_long_term_key_is_deterministic() {
        let a = PrivateKey::from_long_term_key(b"device secret");
        let b = PrivateKey::from_long_term_key(b"device secret");
        assert_eq!(a.public_key().to_bytes(), b.public_key().to_bytes());

        let c = PrivateKey::from_long_term_key(b"other secret");
        assert_ne!(a.public_key().to_bytes(), c.public_key().to_bytes());
    }

    #[test]
    fn test_public_key_from_slice() {
        let private = PrivateKey::generate(&mut OsRng);
        let bytes = private.public_key().to_bytes();
        let restored = PublicKey::from_slice(&bytes).unwrap();
        assert_eq!(restored.to_bytes(), bytes);

        assert!(matches!(
            PublicKey::from_slice(&bytes[..16]),
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 16
            })
        ));
    }
}
