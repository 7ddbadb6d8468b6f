// Long-term peer identities: Ed25519 for signatures, X25519 for key wrapping.
// crypto/identity.rs

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;
use x25519_dalek::{PublicKey as ExchangePublic, StaticSecret};

/// Length of an encoded [`PeerKey`].
pub const PEER_KEY_LEN: usize = 64;

/// Length of a [`PeerId`].
pub const PEER_ID_LEN: usize = 32;

/// Length of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("malformed verifying key")]
    MalformedKey,
    #[error("signature verification failed")]
    BadSignature,
}

/// Stable peer identity: BLAKE3 of the peer's public key pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    pub const fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

/// Public half of a peer's long-term identity, as returned by the directory.
#[derive(Clone, PartialEq, Eq)]
pub struct PeerKey {
    verifying: VerifyingKey,
    exchange: ExchangePublic,
}

impl PeerKey {
    pub fn new(verifying: VerifyingKey, exchange: ExchangePublic) -> Self {
        Self {
            verifying,
            exchange,
        }
    }

    /// Identity derived from this key; directory answers are checked against it.
    pub fn id(&self) -> PeerId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.verifying.as_bytes());
        hasher.update(self.exchange.as_bytes());
        PeerId(*hasher.finalize().as_bytes())
    }

    pub fn exchange_key(&self) -> &ExchangePublic {
        &self.exchange
    }

    pub fn to_bytes(&self) -> [u8; PEER_KEY_LEN] {
        let mut out = [0u8; PEER_KEY_LEN];
        out[..32].copy_from_slice(self.verifying.as_bytes());
        out[32..].copy_from_slice(self.exchange.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; PEER_KEY_LEN]) -> Result<Self, IdentityError> {
        let mut verifying = [0u8; 32];
        verifying.copy_from_slice(&bytes[..32]);
        let mut exchange = [0u8; 32];
        exchange.copy_from_slice(&bytes[32..]);
        let verifying =
            VerifyingKey::from_bytes(&verifying).map_err(|_| IdentityError::MalformedKey)?;
        Ok(Self {
            verifying,
            exchange: ExchangePublic::from(exchange),
        })
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_LEN]) -> Result<(), IdentityError> {
        let signature = Signature::from_bytes(signature);
        self.verifying
            .verify(message, &signature)
            .map_err(|_| IdentityError::BadSignature)
    }
}

impl fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerKey").field("id", &self.id()).finish()
    }
}

/// Local long-term identity. Secret halves never leave this struct.
pub struct Identity {
    signing: SigningKey,
    exchange: StaticSecret,
    public: PeerKey,
    id: PeerId,
}

impl Identity {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let signing = SigningKey::generate(&mut rng);
        let exchange = StaticSecret::random_from_rng(&mut rng);
        Self::from_parts(signing, exchange)
    }

    pub fn from_secret_bytes(signing: [u8; 32], exchange: [u8; 32]) -> Self {
        Self::from_parts(SigningKey::from_bytes(&signing), StaticSecret::from(exchange))
    }

    fn from_parts(signing: SigningKey, exchange: StaticSecret) -> Self {
        let public = PeerKey::new(signing.verifying_key(), ExchangePublic::from(&exchange));
        let id = public.id();
        Self {
            signing,
            exchange,
            public,
            id,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn public_key(&self) -> &PeerKey {
        &self.public
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }

    pub(crate) fn exchange_secret(&self) -> &StaticSecret {
        &self.exchange
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_key_round_trips_and_keeps_id() {
        let identity = Identity::generate();
        let bytes = identity.public_key().to_bytes();
        let decoded = PeerKey::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded.id(), identity.id());
    }

    #[test]
    fn signatures_verify_only_for_signed_message() {
        let identity = Identity::generate();
        let sig = identity.sign(b"set-key");
        assert!(identity.public_key().verify(b"set-key", &sig).is_ok());
        assert_eq!(
            identity.public_key().verify(b"set-kez", &sig),
            Err(IdentityError::BadSignature)
        );
    }

    #[test]
    fn deterministic_identity_from_secret_bytes() {
        let a = Identity::from_secret_bytes([1; 32], [2; 32]);
        let b = Identity::from_secret_bytes([1; 32], [2; 32]);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), Identity::from_secret_bytes([3; 32], [2; 32]).id());
    }
}
