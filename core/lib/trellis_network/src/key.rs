use std::fmt;

use serde::{Deserialize, Serialize};
use trellis_crypto::{sha256, DIGEST_WIDTH};
use trellis_types::{BlockId, PeerId};

/// Coordinate in the 256-bit key space. Blocks and peers both map into it
/// through SHA-256 of their id bytes; responsibility follows XOR proximity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(pub [u8; DIGEST_WIDTH]);

impl Key {
    pub fn for_block(id: &BlockId) -> Self {
        Self(sha256(id.as_bytes()).0)
    }

    pub fn for_peer(id: &PeerId) -> Self {
        Self(sha256(id.as_bytes()).0)
    }

    /// XOR distance to another key; compares lexicographically, so the
    /// nearer key is the one with the longer shared prefix.
    pub fn distance(&self, other: &Key) -> [u8; DIGEST_WIDTH] {
        let mut out = [0u8; DIGEST_WIDTH];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
