//! The bucket handle: an immutable sorted run on disk plus its index.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use meridian_common::{BucketIndexConfig, Hash256};

use crate::bloom_filter::HashSeed;
use crate::entry::BucketKind;
use crate::index::BucketIndex;
use crate::Result;

/// An immutable record set on disk in strict ascending key order,
/// addressed by the content hash of its byte stream.
///
/// Buckets are shared freely (snapshots, in-flight merges, the bucket
/// list itself all hold `Arc<Bucket>`); the file lives as long as its
/// longest holder plus the manager's retention policy. The empty bucket
/// is represented by the absence of a file and the zero-hash sentinel.
pub struct Bucket {
    path: Option<PathBuf>,
    hash: Hash256,
    kind: BucketKind,
    size: u64,
    index: OnceLock<Arc<BucketIndex>>,
    // Carried from the adopting manager so lazy index construction on
    // the read path needs no manager handle.
    index_config: BucketIndexConfig,
    bloom_seed: HashSeed,
}

impl Bucket {
    /// The empty-bucket sentinel: no file, zero hash.
    pub fn empty(kind: BucketKind) -> Self {
        Self {
            path: None,
            hash: Hash256::ZERO,
            kind,
            size: 0,
            index: OnceLock::new(),
            index_config: BucketIndexConfig::default(),
            bloom_seed: [0u8; 16],
        }
    }

    pub(crate) fn new(
        path: PathBuf,
        hash: Hash256,
        kind: BucketKind,
        size: u64,
        index: Option<BucketIndex>,
        index_config: BucketIndexConfig,
        bloom_seed: HashSeed,
    ) -> Self {
        let cell = OnceLock::new();
        if let Some(index) = index {
            let _ = cell.set(Arc::new(index));
        }
        Self {
            path: Some(path),
            hash,
            kind,
            size,
            index: cell,
            index_config,
            bloom_seed,
        }
    }

    /// Whether this is the empty sentinel.
    pub fn is_empty(&self) -> bool {
        self.path.is_none()
    }

    /// The bucket's content hash (zero for the empty sentinel).
    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    /// The bucket form (live or hot archive).
    pub fn kind(&self) -> BucketKind {
        self.kind
    }

    /// On-disk size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path of the adopted file, or `None` for the empty sentinel.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether an index has been built for this bucket.
    pub fn is_indexed(&self) -> bool {
        self.index.get().is_some()
    }

    /// The bucket's index, if one has been built.
    pub fn index(&self) -> Option<Arc<BucketIndex>> {
        self.index.get().cloned()
    }

    /// The bucket's index, building it on first use.
    ///
    /// The index is built once and shared; concurrent callers racing on
    /// an unindexed bucket may build twice but observe one winner.
    pub fn ensure_index(&self) -> Result<Arc<BucketIndex>> {
        if let Some(index) = self.index.get() {
            return Ok(Arc::clone(index));
        }
        let path = self
            .path
            .as_ref()
            .expect("empty bucket has no index to build");
        let built = BucketIndex::build(path, self.kind, &self.index_config, &self.bloom_seed)?;
        let _ = self.index.set(Arc::new(built));
        Ok(Arc::clone(self.index.get().expect("index just set")))
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("hash", &self.hash)
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("indexed", &self.is_indexed())
            .finish()
    }
}
