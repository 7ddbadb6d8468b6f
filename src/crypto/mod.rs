// Cryptographic primitives: frame cipher, key schedule, identities and key wrapping.
// crypto/mod.rs

pub mod aead;
pub mod hkdf;
pub mod hmac;
pub mod identity;
pub mod session;
pub mod wrap;
