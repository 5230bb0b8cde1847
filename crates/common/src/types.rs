//! The content hash that addresses bucket state.
//!
//! Buckets are named by the SHA-256 of their exact byte stream: the hash
//! doubles as the file name on disk and the integrity check on read.
//! Level and list hashes fold bucket hashes together with the same
//! function, which is what ledger headers ultimately commit to. The zero
//! hash never names a file; it is reserved as the empty-bucket sentinel.

use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte SHA-256 content hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash256([u8; 32]);

impl Hash256 {
    /// The empty-bucket sentinel: all zeroes, never a real digest.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Hash a complete byte slice in one shot.
    pub fn hash(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Finish a streaming digest, as built up by a bucket writer hashing
    /// records while it emits them.
    pub fn from_digest(hasher: Sha256) -> Self {
        Self(hasher.finalize().into())
    }

    /// The raw digest bytes, for feeding into a parent digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse the 64-character lowercase hex form used in bucket file
    /// names. Rejects any other length.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }

    /// The 64-character hex form, as embedded in bucket file names.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Whether this is the empty-bucket sentinel.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

// Debug output abbreviates: full 64-character digests drown out the rest
// of a trace line, and eight characters are plenty to correlate against
// file names.
impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
