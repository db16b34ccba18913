//! Secured-session lifecycle.

use std::time::Instant;

use crate::aead::AeadPair;
use crate::derive::derive_keys;
use crate::error::CryptoError;
use crate::x25519::{PrivateKey, PublicKey};

use rand_core::OsRng;
use sha2::{Digest, Sha256};

/// One end of a secured session.
///
/// Created on the first handshake exchange with a peer; the AEAD halves
/// appear once the peer's public key is known and the signatures agree.
#[derive(Clone)]
pub struct SecuredSession {
    private: PrivateKey,
    public: PublicKey,
    /// Peer public key, learned from the handshake.
    pub peer_public_key: Option<[u8; 32]>,
    aead: Option<AeadPair>,
    /// Last time the session carried traffic.
    pub updated_at: Instant,
}

impl SecuredSession {
    /// Create a session keypair. With a long-term key the private scalar
    /// is derived from it; otherwise the keypair is ephemeral.
    #[must_use]
    pub fn new(long_term_key: Option<&[u8]>) -> Self {
        let private = match long_term_key {
            Some(key) if !key.is_empty() => PrivateKey::from_long_term_key(key),
            _ => PrivateKey::generate(&mut OsRng),
        };
        let public = private.public_key();
        Self {
            private,
            public,
            peer_public_key: None,
            aead: None,
            updated_at: Instant::now(),
        }
    }

    /// Our public key bytes, sent in hello messages.
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Whether the AEAD halves are installed.
    #[must_use]
    pub fn established(&self) -> bool {
        self.aead.is_some()
    }

    /// The AEAD state, once established.
    #[must_use]
    pub fn aead(&self) -> Option<&AeadPair> {
        self.aead.as_ref()
    }

    /// Refresh the idle timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Instant::now();
    }

    /// SHA-256 of the shared secret. Both peers compute this
    /// independently; equality proves they agree on the secret.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::NoPeerKey` before the peer key is known, or
    /// a key-exchange error.
    pub fn signature(&self) -> Result<[u8; 32], CryptoError> {
        let shared = self.shared_secret()?;
        Ok(Sha256::digest(shared.as_bytes()).into())
    }

    /// Initiator-side confirmation: compare signatures and install the
    /// derived keys in `(peer, my)` send/receive order.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::SignatureMismatch` on disagreement — the
    /// peer is not who it handshook as — or a derivation error.
    pub fn verify(&mut self, peer_signature: &[u8; 32]) -> Result<(), CryptoError> {
        self.check_signature(peer_signature)?;
        let keys = derive_keys(&self.shared_secret()?)?;
        self.aead = Some(AeadPair::new(
            keys.peer_key,
            keys.my_key,
            keys.peer_iv,
            keys.my_iv,
        ));
        self.touch();
        Ok(())
    }

    /// Responder-side confirmation: compare signatures and install the
    /// mirror ordering, so this side's receive keys are the initiator's
    /// send keys.
    ///
    /// # Errors
    ///
    /// Same as [`SecuredSession::verify`].
    pub fn peer_verify(&mut self, peer_signature: &[u8; 32]) -> Result<(), CryptoError> {
        self.check_signature(peer_signature)?;
        let keys = derive_keys(&self.shared_secret()?)?;
        self.aead = Some(AeadPair::new(
            keys.my_key,
            keys.peer_key,
            keys.my_iv,
            keys.peer_iv,
        ));
        self.touch();
        Ok(())
    }

    fn check_signature(&self, peer_signature: &[u8; 32]) -> Result<(), CryptoError> {
        if &self.signature()? != peer_signature {
            return Err(CryptoError::SignatureMismatch);
        }
        Ok(())
    }

    fn shared_secret(&self) -> Result<crate::x25519::SharedSecret, CryptoError> {
        let peer = self.peer_public_key.ok_or(CryptoError::NoPeerKey)?;
        self.private.exchange(&PublicKey::from_bytes(peer))
    }
}
