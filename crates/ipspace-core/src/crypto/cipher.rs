//! Envelope payload sealing
//!
//! Every [`SealedEnvelope`](super::SealedEnvelope) carries its own
//! single-use [`ContentKey`]. The payload is sealed under that key with
//! ChaCha20-Poly1305, and the envelope header (version byte followed by the
//! wrapped key) is bound as associated data, so a payload only opens inside
//! the envelope it was sealed for.
//!
//! ```text
//! payload = [nonce (12 bytes)] + ciphertext + tag (16 bytes)
//! ```

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

use crate::error::{SpaceError, SpaceResult};

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Content key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// Authentication tag appended by the AEAD
pub const TAG_SIZE: usize = 16;

/// Per-envelope symmetric key. Wrapped with RSA-OAEP for the recipient.
#[derive(Clone)]
pub struct ContentKey([u8; KEY_SIZE]);

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ContentKey(..)")
    }
}

impl ContentKey {
    /// Fresh random key for a new envelope.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Rebuild a key from the output of RSA unwrapping.
    pub fn from_unwrapped(bytes: &[u8]) -> SpaceResult<Self> {
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            SpaceError::DecryptionFailed(format!(
                "Unwrapped content key is {} bytes, expected {}",
                bytes.len(),
                KEY_SIZE
            ))
        })?;
        Ok(Self(key))
    }

    /// Raw key bytes, for wrapping.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new((&self.0).into())
    }

    /// Seal `plaintext` for the envelope described by `header`.
    pub fn seal(&self, header: &[u8], plaintext: &[u8]) -> SpaceResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher()
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: header,
                },
            )
            .map_err(|e| SpaceError::Crypto(format!("Payload sealing failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a payload sealed by [`ContentKey::seal`] with the same header.
    pub fn open(&self, header: &[u8], sealed: &[u8]) -> SpaceResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(SpaceError::DecryptionFailed(
                "Payload too short for nonce and tag".to_string(),
            ));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher()
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map_err(|_| {
                SpaceError::DecryptionFailed("Payload does not match its envelope".to_string())
            })
    }
}
