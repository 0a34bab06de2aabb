use std::fmt;

use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Width of every digest in the system, in bytes.
pub const DIGEST_WIDTH: usize = 32;

/// A SHA-256 digest. Raw bytes on the wire; base64url without padding for
/// presentation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; DIGEST_WIDTH]);

impl Digest {
    pub fn as_bytes(&self) -> &[u8; DIGEST_WIDTH] {
        &self.0
    }

    pub fn to_base64url(&self) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64url())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", hex::encode(&self.0[..8]))
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

pub fn sha256(bytes: &[u8]) -> Digest {
    let hash = Sha256::digest(bytes);
    let mut out = [0u8; DIGEST_WIDTH];
    out.copy_from_slice(hash.as_ref());
    Digest(out)
}

/// Canonical byte form of a serde value: bincode with its fixed field order
/// and fixed-width integers, identical across peers for identical values.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("value is bincode-serializable")
}

/// Digest of the canonical byte form.
pub fn canonical_digest<T: Serialize>(value: &T) -> Digest {
    sha256(&canonical_bytes(value))
}
