//! Key derivation from the handshake shared secret.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::aead::{IV_SIZE, KEY_SIZE};
use crate::error::CryptoError;
use crate::x25519::SharedSecret;

const HKDF_INFO: &[u8] = b"kelpie session keys";

/// The four values derived from one shared secret.
///
/// The initiator installs `(peer_key, my_key, peer_iv, my_iv)` as its
/// (send, receive) halves; the responder installs the mirror, which makes
/// the initiator's send keys equal the responder's receive keys.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeys {
    /// Key the peer encrypts with.
    pub peer_key: [u8; KEY_SIZE],
    /// Key we encrypt with.
    pub my_key: [u8; KEY_SIZE],
    /// Base IV for the peer's direction.
    pub peer_iv: [u8; IV_SIZE],
    /// Base IV for our direction.
    pub my_iv: [u8; IV_SIZE],
}

/// Expand a shared secret into the session key material with HKDF-SHA256.
///
/// # Errors
///
/// Returns `CryptoError::KeyDerivationFailed` if HKDF expansion fails.
pub fn derive_keys(shared: &SharedSecret) -> Result<DerivedKeys, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = [0u8; 2 * KEY_SIZE + 2 * IV_SIZE];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;

    let mut keys = DerivedKeys {
        peer_key: [0u8; KEY_SIZE],
        my_key: [0u8; KEY_SIZE],
        peer_iv: [0u8; IV_SIZE],
        my_iv: [0u8; IV_SIZE],
    };
    let (peer_key, rest) = okm.split_at(KEY_SIZE);
    let (my_key, rest) = rest.split_at(KEY_SIZE);
    let (peer_iv, my_iv) = rest.split_at(IV_SIZE);
    keys.peer_key.copy_from_slice(peer_key);
    keys.my_key.copy_from_slice(my_key);
    keys.peer_iv.copy_from_slice(peer_iv);
    keys.my_iv.copy_from_slice(my_iv);
    okm.zeroize();

    Ok(keys)
}
