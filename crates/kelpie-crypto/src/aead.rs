//! AES-256-GCM authenticated encryption for message payloads.
//!
//! Each session direction holds a key plus a base IV. The per-message
//! nonce mixes the base IV with the message id and token, so a
//! retransmitted message reuses its nonce and produces identical
//! ciphertext — retransmission is idempotent at the encryption layer.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// AEAD key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

/// Base IV and nonce size (12 bytes / 96 bits).
pub const IV_SIZE: usize = 12;

/// Authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// One encryption direction: key plus base IV.
#[derive(Clone, ZeroizeOnDrop)]
struct DirectionKey {
    key: [u8; KEY_SIZE],
    #[zeroize(skip)]
    iv: [u8; IV_SIZE],
}

impl DirectionKey {
    fn nonce(&self, message_id: u16, token: &[u8]) -> [u8; IV_SIZE] {
        let mut nonce = self.iv;
        for (i, b) in token.iter().take(8).enumerate() {
            nonce[i] ^= b;
        }
        let id = message_id.to_be_bytes();
        nonce[IV_SIZE - 2] ^= id[0];
        nonce[IV_SIZE - 1] ^= id[1];
        nonce
    }
}

/// Bidirectional AEAD state for an established session.
#[derive(Clone)]
pub struct AeadPair {
    send: DirectionKey,
    recv: DirectionKey,
}

impl AeadPair {
    /// Assemble from derived key material; `send` is the half this side
    /// encrypts with.
    #[must_use]
    pub fn new(
        send_key: [u8; KEY_SIZE],
        recv_key: [u8; KEY_SIZE],
        send_iv: [u8; IV_SIZE],
        recv_iv: [u8; IV_SIZE],
    ) -> Self {
        Self {
            send: DirectionKey {
                key: send_key,
                iv: send_iv,
            },
            recv: DirectionKey {
                key: recv_key,
                iv: recv_iv,
            },
        }
    }

    /// Encrypt a payload for the wire. The ciphertext carries its
    /// authentication tag at the end.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` on AEAD failure.
    pub fn seal(
        &self,
        message_id: u16,
        token: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.send.key));
        let nonce = self.send.nonce(message_id, token);
        cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: token,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt and authenticate a payload from the wire.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` when authentication fails.
    pub fn open(
        &self,
        message_id: u16,
        token: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.recv.key));
        let nonce = self.recv.nonce(message_id, token);
        cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: token,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
