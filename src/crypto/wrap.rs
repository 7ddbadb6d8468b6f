// Asymmetric wrapping of session keys to a peer's X25519 static key.
// crypto/wrap.rs

use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey as ExchangePublic, StaticSecret};
use zeroize::Zeroizing;

use super::{
    aead::{self, AeadError, Nonce, TAG_LEN, XCHACHA20_NONCE_LEN},
    hkdf::{self, HkdfError},
};

/// Length of a wrapped 32-byte key: ephemeral public key, nonce, ciphertext and tag.
pub const WRAPPED_KEY_LEN: usize = 32 + XCHACHA20_NONCE_LEN + 32 + TAG_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WrapError {
    #[error("wrapped key has invalid length {0}")]
    InvalidLength(usize),
    #[error("key derivation failed: {0}")]
    Kdf(#[from] HkdfError),
    #[error("key unwrap failed: {0}")]
    Aead(#[from] AeadError),
}

fn kdf_salt(ephemeral: &ExchangePublic, recipient: &ExchangePublic) -> [u8; 64] {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral.as_bytes());
    salt[32..].copy_from_slice(recipient.as_bytes());
    salt
}

/// Seals `key` so that only the holder of `recipient`'s static secret can recover it.
pub fn wrap(recipient: &ExchangePublic, key: &[u8; 32]) -> Result<[u8; WRAPPED_KEY_LEN], WrapError> {
    let ephemeral = EphemeralSecret::random_from_rng(rand::thread_rng());
    let ephemeral_public = ExchangePublic::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);
    let kek = hkdf::derive_wrap_key(shared.as_bytes(), &kdf_salt(&ephemeral_public, recipient))?;

    let nonce = Nonce::random();
    let sealed = aead::seal(&kek, &nonce, ephemeral_public.as_bytes(), key)?;

    let mut out = [0u8; WRAPPED_KEY_LEN];
    out[..32].copy_from_slice(ephemeral_public.as_bytes());
    out[32..32 + XCHACHA20_NONCE_LEN].copy_from_slice(nonce.as_bytes());
    out[32 + XCHACHA20_NONCE_LEN..].copy_from_slice(&sealed);
    Ok(out)
}

/// Recovers a key sealed by [`wrap`] using the local static secret.
pub fn unwrap(secret: &StaticSecret, wrapped: &[u8]) -> Result<Zeroizing<[u8; 32]>, WrapError> {
    if wrapped.len() != WRAPPED_KEY_LEN {
        return Err(WrapError::InvalidLength(wrapped.len()));
    }
    let mut ephemeral = [0u8; 32];
    ephemeral.copy_from_slice(&wrapped[..32]);
    let ephemeral = ExchangePublic::from(ephemeral);
    let nonce = Nonce::from_prefix(&wrapped[32..]).ok_or(WrapError::InvalidLength(wrapped.len()))?;
    let recipient = ExchangePublic::from(secret);

    let shared = secret.diffie_hellman(&ephemeral);
    let kek = hkdf::derive_wrap_key(shared.as_bytes(), &kdf_salt(&ephemeral, &recipient))?;
    let plain = Zeroizing::new(aead::open(
        &kek,
        &nonce,
        ephemeral.as_bytes(),
        &wrapped[32 + XCHACHA20_NONCE_LEN..],
    )?);
    if plain.len() != 32 {
        return Err(WrapError::InvalidLength(wrapped.len()));
    }
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&plain);
    Ok(key)
}
