// HKDF-based key schedule helpers.
// crypto/hkdf.rs

use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

use super::{aead::AeadKey, hmac::IntegrityKey};

/// Info label for the AEAD key protecting frames and PING/PONG.
pub const INFO_FRAME_KEY: &[u8] = b"peercore/frame";

/// Info label for the integrity hash key.
pub const INFO_INTEGRITY_KEY: &[u8] = b"peercore/integrity";

/// Info label for the key-encryption key used when wrapping session keys.
pub const INFO_WRAP_KEY: &[u8] = b"peercore/wrap";

/// HKDF errors surfaced by helper functions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HkdfError {
    /// Requested output was too long for the underlying HKDF.
    #[error("hkdf output length invalid")]
    InvalidLength,
}

/// Derives keying material of the requested length.
pub fn derive(ikm: &[u8], salt: &[u8], info: &[u8], out_len: usize) -> Result<Vec<u8>, HkdfError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; out_len];
    hk.expand(info, &mut okm)
        .map_err(|_| HkdfError::InvalidLength)?;
    Ok(okm)
}

fn derive_32(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; 32], HkdfError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|_| HkdfError::InvalidLength)?;
    Ok(okm)
}

/// Derives the frame [`AeadKey`] from a session key.
pub fn derive_frame_key(session_key: &[u8], salt: &[u8]) -> Result<AeadKey, HkdfError> {
    derive_32(session_key, salt, INFO_FRAME_KEY).map(AeadKey::new)
}

/// Derives the [`IntegrityKey`] from a session key.
pub fn derive_integrity_key(session_key: &[u8], salt: &[u8]) -> Result<IntegrityKey, HkdfError> {
    derive_32(session_key, salt, INFO_INTEGRITY_KEY).map(IntegrityKey::new)
}

/// Derives the key-encryption key from an X25519 shared secret.
pub fn derive_wrap_key(shared_secret: &[u8], salt: &[u8]) -> Result<AeadKey, HkdfError> {
    derive_32(shared_secret, salt, INFO_WRAP_KEY).map(AeadKey::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_key_derivation() {
        let ikm = b"session secret";
        let salt = b"1700000000000";
        let frame = derive_frame_key(ikm, salt).expect("frame key");
        let integrity = derive_integrity_key(ikm, salt).expect("integrity key");

        assert_eq!(frame, derive_frame_key(ikm, salt).unwrap());
        assert_eq!(integrity, derive_integrity_key(ikm, salt).unwrap());
        assert_ne!(frame.as_bytes(), integrity.as_bytes());
    }

    #[test]
    fn oversized_output_is_rejected() {
        assert_eq!(
            derive(b"k", b"s", b"i", 255 * 32 + 1),
            Err(HkdfError::InvalidLength)
        );
    }
}
