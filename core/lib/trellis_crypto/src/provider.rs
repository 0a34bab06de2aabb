use secp256k1::{
    ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey, SECP256K1,
};
use serde::Serialize;

use crate::digest::{canonical_digest, Digest};

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("malformed signature: {0}")]
    MalformedSignature(#[source] secp256k1::Error),
    #[error("malformed public key: {0}")]
    MalformedKey(#[source] secp256k1::Error),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Signing and verification over canonical-encoded payloads. The payload is
/// serialized, hashed with SHA-256, and the digest is signed.
pub trait CryptoProvider: Send + Sync {
    fn sign_digest(&self, digest: &Digest, secret_key: &SecretKey) -> Vec<u8>;

    fn verify_digest(&self, digest: &Digest, signature: &[u8], public_key: &[u8])
        -> CryptoResult<bool>;

    fn sign<T: Serialize>(&self, payload: &T, secret_key: &SecretKey) -> Vec<u8>
    where
        Self: Sized,
    {
        self.sign_digest(&canonical_digest(payload), secret_key)
    }

    fn verify<T: Serialize>(
        &self,
        payload: &T,
        signature: &[u8],
        public_key: &[u8],
    ) -> CryptoResult<bool>
    where
        Self: Sized,
    {
        self.verify_digest(&canonical_digest(payload), signature, public_key)
    }
}

/// ECDSA over secp256k1 with compact 64-byte signatures.
#[derive(Debug, Default, Clone, Copy)]
pub struct Secp256k1Provider;

impl CryptoProvider for Secp256k1Provider {
    fn sign_digest(&self, digest: &Digest, secret_key: &SecretKey) -> Vec<u8> {
        let message =
            Message::from_slice(digest.as_bytes()).expect("digest is exactly 32 bytes");
        SECP256K1
            .sign_ecdsa(&message, secret_key)
            .serialize_compact()
            .to_vec()
    }

    fn verify_digest(
        &self,
        digest: &Digest,
        signature: &[u8],
        public_key: &[u8],
    ) -> CryptoResult<bool> {
        let message =
            Message::from_slice(digest.as_bytes()).expect("digest is exactly 32 bytes");
        let signature =
            Signature::from_compact(signature).map_err(CryptoError::MalformedSignature)?;
        let public_key =
            PublicKey::from_slice(public_key).map_err(CryptoError::MalformedKey)?;
        Ok(SECP256K1
            .verify_ecdsa(&message, &signature, &public_key)
            .is_ok())
    }
}

/// A peer's signing identity.
#[derive(Debug, Clone)]
pub struct Keypair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut secp256k1::rand::thread_rng());
        Self {
            secret_key,
            public_key,
        }
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public_key.serialize().to_vec()
    }
}
