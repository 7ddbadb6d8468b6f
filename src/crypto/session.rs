// crypto/session.rs - per-direction session keys and the frame cipher

use thiserror::Error;
use zeroize::Zeroizing;

use super::{
    aead::{self, AeadError, AeadKey, Nonce},
    hkdf::{self, HkdfError},
    hmac::{self, IntegrityError, IntegrityKey, INTEGRITY_HASH_LEN},
};
use crate::clock::Timestamp;

/// Length of the raw symmetric session key carried in SET_KEY.
pub const SESSION_KEY_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("key derivation failed: {0}")]
    Kdf(#[from] HkdfError),
    #[error("aead failure: {0}")]
    Aead(#[from] AeadError),
    #[error("integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),
}

/// Symmetric key for one direction of a session plus its creation time.
///
/// The creation time salts the subkey derivation, so a re-sent SET_KEY with the
/// same key and timestamp yields identical subkeys on both ends.
pub struct SessionKey {
    material: Zeroizing<[u8; SESSION_KEY_LEN]>,
    created: Timestamp,
    frame_key: AeadKey,
    integrity_key: IntegrityKey,
}

impl SessionKey {
    /// Generates a fresh random key stamped with `created`.
    pub fn generate(created: Timestamp) -> Result<Self, SessionError> {
        use rand::RngCore;

        let mut material = Zeroizing::new([0u8; SESSION_KEY_LEN]);
        rand::thread_rng().fill_bytes(&mut material[..]);
        Self::from_material(material, created)
    }

    /// Rebuilds a key received from a peer.
    pub fn from_material(
        material: Zeroizing<[u8; SESSION_KEY_LEN]>,
        created: Timestamp,
    ) -> Result<Self, SessionError> {
        let salt = created.as_millis().to_be_bytes();
        let frame_key = hkdf::derive_frame_key(&material[..], &salt)?;
        let integrity_key = hkdf::derive_integrity_key(&material[..], &salt)?;
        Ok(Self {
            material,
            created,
            frame_key,
            integrity_key,
        })
    }

    pub fn material(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.material
    }

    pub fn created(&self) -> Timestamp {
        self.created
    }

    /// Encrypts an encrypted-frame body.
    ///
    /// Returns the integrity hash, whose first 24 bytes double as the nonce,
    /// and the ciphertext with its tag.
    pub fn seal_body(
        &self,
        aad: &[u8],
        body: &[u8],
    ) -> Result<([u8; INTEGRITY_HASH_LEN], Vec<u8>), SessionError> {
        let hash = hmac::compute(&self.integrity_key, body);
        let nonce = Nonce::from_prefix(&hash).ok_or(AeadError::Encrypt)?;
        let ciphertext = aead::seal(&self.frame_key, &nonce, aad, body)?;
        Ok((hash, ciphertext))
    }

    /// Decrypts a body sealed by [`SessionKey::seal_body`] and re-checks its integrity hash.
    pub fn open_body(&self, aad: &[u8], hash: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let nonce = Nonce::from_prefix(hash).ok_or(AeadError::Decrypt)?;
        let body = aead::open(&self.frame_key, &nonce, aad, ciphertext)?;
        hmac::verify(&self.integrity_key, &body, hash)?;
        Ok(body)
    }

    /// Encrypts a PING/PONG payload under a random nonce.
    pub fn seal_control(&self, aad: &[u8], plaintext: &[u8]) -> Result<(Nonce, Vec<u8>), SessionError> {
        let nonce = Nonce::random();
        let ciphertext = aead::seal(&self.frame_key, &nonce, aad, plaintext)?;
        Ok((nonce, ciphertext))
    }

    pub fn open_control(&self, aad: &[u8], nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        Ok(aead::open(&self.frame_key, nonce, aad, ciphertext)?)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}
