// Integrity hash over decrypted frame bodies (HMAC-SHA256).
// crypto/hmac.rs

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of the integrity hash carried in the cleartext frame header.
pub const INTEGRITY_HASH_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Key used to compute integrity hashes for one direction of a session.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct IntegrityKey([u8; 32]);

impl IntegrityKey {
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for IntegrityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IntegrityKey(..)")
    }
}

/// Errors returned by integrity verification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntegrityError {
    /// The provided hash length does not match [`INTEGRITY_HASH_LEN`].
    #[error("invalid integrity hash length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    /// Recomputed hash did not match the header.
    #[error("integrity hash mismatch")]
    Mismatch,
}

/// Computes the integrity hash of `body`.
#[must_use]
pub fn compute(key: &IntegrityKey, body: &[u8]) -> [u8; INTEGRITY_HASH_LEN] {
    // HMAC accepts keys of any length; 32 bytes never hits the error path.
    let mut mac = match HmacSha256::new_from_slice(key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return [0u8; INTEGRITY_HASH_LEN],
    };
    mac.update(body);
    let mut out = [0u8; INTEGRITY_HASH_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Recomputes the hash of `body` and compares it against `expected` in constant time.
pub fn verify(key: &IntegrityKey, body: &[u8], expected: &[u8]) -> Result<(), IntegrityError> {
    if expected.len() != INTEGRITY_HASH_LEN {
        return Err(IntegrityError::InvalidLength {
            expected: INTEGRITY_HASH_LEN,
            actual: expected.len(),
        });
    }
    let actual = compute(key, body);
    if actual.as_slice().ct_eq(expected).into() {
        Ok(())
    } else {
        Err(IntegrityError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_and_verifies() {
        let key = IntegrityKey::new([7u8; 32]);
        let hash = compute(&key, b"body");
        assert!(verify(&key, b"body", &hash).is_ok());
    }

    #[test]
    fn rejects_wrong_length() {
        let key = IntegrityKey::new([1u8; 32]);
        assert_eq!(
            verify(&key, b"test", &[0u8; 8]),
            Err(IntegrityError::InvalidLength {
                expected: INTEGRITY_HASH_LEN,
                actual: 8,
            })
        );
    }

    #[test]
    fn rejects_modified_body() {
        let key = IntegrityKey::new([2u8; 32]);
        let hash = compute(&key, b"seq=1");
        assert_eq!(verify(&key, b"seq=2", &hash), Err(IntegrityError::Mismatch));
    }
}
