// AEAD primitives protecting frame bodies, PING/PONG and wrapped keys.
// crypto/aead.rs

use chacha20poly1305::{
    aead::{Aead, Payload},
    KeyInit, XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Authentication tag length appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Nonce size for XChaCha20-Poly1305.
pub const XCHACHA20_NONCE_LEN: usize = 24;

/// 256-bit XChaCha20-Poly1305 key, wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; 32]);

impl AeadKey {
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AeadKey(..)")
    }
}

/// Extended nonce for XChaCha20-Poly1305.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce([u8; XCHACHA20_NONCE_LEN]);

impl Nonce {
    #[must_use]
    pub const fn new(bytes: [u8; XCHACHA20_NONCE_LEN]) -> Self {
        Self(bytes)
    }

    /// Fresh random nonce; 192 bits make collisions negligible.
    pub fn random() -> Self {
        let mut bytes = [0u8; XCHACHA20_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Takes the leading nonce bytes of a longer digest.
    pub fn from_prefix(digest: &[u8]) -> Option<Self> {
        let prefix = digest.get(..XCHACHA20_NONCE_LEN)?;
        let mut bytes = [0u8; XCHACHA20_NONCE_LEN];
        bytes.copy_from_slice(prefix);
        Some(Self(bytes))
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; XCHACHA20_NONCE_LEN] {
        &self.0
    }
}

/// Errors returned by AEAD helpers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AeadError {
    /// Encryption failed.
    #[error("encryption failed")]
    Encrypt,
    /// Decryption or tag verification failed.
    #[error("decryption failed")]
    Decrypt,
}

/// Encrypts `plaintext`, returning ciphertext concatenated with the authentication tag.
pub fn seal(key: &AeadKey, nonce: &Nonce, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, AeadError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .encrypt(
            XNonce::from_slice(nonce.as_bytes()),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| AeadError::Encrypt)
}

/// Decrypts ciphertext+tag produced by [`seal`].
pub fn open(key: &AeadKey, nonce: &Nonce, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, AeadError> {
    if ciphertext.len() < TAG_LEN {
        return Err(AeadError::Decrypt);
    }
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .decrypt(
            XNonce::from_slice(nonce.as_bytes()),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| AeadError::Decrypt)
}
