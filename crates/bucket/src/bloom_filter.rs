//! Binary fuse filter for fast negative lookups in bucket indexes.
//!
//! A probabilistic membership structure over the keys present in one
//! bucket: a negative answer is definitive (no false negatives), a
//! positive answer may be a false positive at a rate of ~1/65536
//! (BinaryFuse16, ~18 bits per key).
//!
//! Keys are hashed with SipHash-2-4 over their XDR bytes, seeded with a
//! per-process 128-bit key so an adversary cannot precompute colliding
//! ledger keys.

use siphasher::sip::SipHasher24;
use std::hash::Hasher;
use stellar_xdr::curr::{LedgerKey, Limits, WriteXdr};
use xorf::{BinaryFuse16, Filter};

use crate::{BucketError, Result};

/// Size of the SipHash key in bytes (128 bits).
pub const HASH_KEY_BYTES: usize = 16;

/// Hash seed used for bloom filter key hashing.
pub type HashSeed = [u8; HASH_KEY_BYTES];

/// A binary fuse filter over the keys of one bucket.
///
/// Construction requires at least 2 distinct key hashes; buckets smaller
/// than that skip the filter entirely (every probe falls through to the
/// index).
#[derive(Clone)]
pub struct BucketBloomFilter {
    filter: BinaryFuse16,
    seed: HashSeed,
}

impl BucketBloomFilter {
    /// Build a filter from pre-computed key hashes.
    ///
    /// Duplicate hashes are removed before construction; the underlying
    /// binary fuse construction rejects duplicate inputs.
    pub fn from_hashes(key_hashes: &[u64], seed: &HashSeed) -> Result<Self> {
        if key_hashes.len() < 2 {
            return Err(BucketError::BloomFilter(
                "bloom filter requires at least 2 elements".to_string(),
            ));
        }

        let mut hashes = key_hashes.to_vec();
        hashes.sort_unstable();
        hashes.dedup();

        let filter = BinaryFuse16::try_from(hashes.as_slice()).map_err(|e| {
            BucketError::BloomFilter(format!("failed to construct bloom filter: {:?}", e))
        })?;

        Ok(Self {
            filter,
            seed: *seed,
        })
    }

    /// SipHash-2-4 hash of a ledger key's XDR bytes.
    pub fn hash_key(key: &LedgerKey, seed: &HashSeed) -> u64 {
        let key_bytes = key.to_xdr(Limits::none()).unwrap_or_default();
        Self::hash_bytes(&key_bytes, seed)
    }

    /// SipHash-2-4 hash of raw bytes.
    pub fn hash_bytes(bytes: &[u8], seed: &HashSeed) -> u64 {
        let mut hasher = SipHasher24::new_with_key(seed);
        hasher.write(bytes);
        hasher.finish()
    }

    /// Whether the key might be present. `false` is definitive.
    pub fn may_contain(&self, key: &LedgerKey) -> bool {
        self.may_contain_hash(Self::hash_key(key, &self.seed))
    }

    /// Whether a pre-computed key hash might be present.
    pub fn may_contain_hash(&self, hash: u64) -> bool {
        self.filter.contains(&hash)
    }

    /// The hash seed used during construction.
    pub fn seed(&self) -> &HashSeed {
        &self.seed
    }

    /// Approximate filter size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.filter.len() * std::mem::size_of::<u16>()
    }
}

impl std::fmt::Debug for BucketBloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketBloomFilter")
            .field("fingerprints", &self.filter.len())
            .field("size_bytes", &self.size_bytes())
            .finish()
    }
}
