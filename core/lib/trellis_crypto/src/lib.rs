//! Digest and signing primitives: canonical byte encoding, SHA-256 digests,
//! and the provider peers sign cluster promises and commits with.

pub mod digest;
pub mod provider;

pub use digest::{canonical_bytes, canonical_digest, sha256, Digest, DIGEST_WIDTH};
pub use provider::{CryptoError, CryptoProvider, CryptoResult, Keypair, Secp256k1Provider};
