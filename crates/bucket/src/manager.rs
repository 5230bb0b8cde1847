//! BucketManager: the authoritative registry of bucket files on disk.
//!
//! Once a file is adopted under a content hash, all future handles for
//! that hash alias the same [`Bucket`]. Writers stream into randomly
//! named files in the manager's temp directory and hand them over through
//! [`adopt_file_as_bucket`](BucketManager::adopt_file_as_bucket);
//! post-adoption names are derived from the hash.
//!
//! # File layout
//!
//! ```text
//! <bucket_dir>/
//!   bucket-<hex hash>.xdr
//!   ...
//!   tmp/
//!     tmp-bucket-<random>.xdr     (writers in flight)
//! ```
//!
//! # Empty merge memoization
//!
//! A merge whose output contained zero records produces no file; the
//! manager records the merge key so the scheduler can resolve the same
//! merge to the empty sentinel without redoing it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::Rng;

use meridian_common::{BucketIndexConfig, Hash256};

use crate::bloom_filter::{HashSeed, HASH_KEY_BYTES};
use crate::bucket::Bucket;
use crate::entry::BucketKind;
use crate::index::BucketIndex;
use crate::{BucketError, Result};

/// Generate a random not-yet-adopted bucket file path in `dir`.
pub(crate) fn random_bucket_path(dir: &Path) -> PathBuf {
    let nonce: u128 = rand::thread_rng().gen();
    dir.join(format!("tmp-bucket-{:032x}.xdr", nonce))
}

/// A deterministic identifier of the inputs that produced a merge.
///
/// Used to memoize empty merge outputs: two merges over the same inputs
/// with the same tombstone policy produce the same bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MergeKey {
    /// Whether the merge kept tombstone records.
    pub keep_tombstones: bool,
    /// Hash of the newer input bucket.
    pub input_curr: Hash256,
    /// Hash of the older input bucket.
    pub input_snap: Hash256,
}

/// Registry and lifecycle authority for bucket files under one directory.
pub struct BucketManager {
    bucket_dir: PathBuf,
    tmp_dir: PathBuf,
    buckets: RwLock<HashMap<Hash256, Arc<Bucket>>>,
    empty_merges: Mutex<HashSet<MergeKey>>,
    index_config: BucketIndexConfig,
    bloom_seed: HashSeed,
}

impl BucketManager {
    /// Create a manager over `bucket_dir`, creating the directory and its
    /// `tmp/` subdirectory as needed.
    pub fn new(bucket_dir: PathBuf) -> Result<Self> {
        Self::with_config(bucket_dir, BucketIndexConfig::default())
    }

    /// Create a manager with explicit index configuration.
    pub fn with_config(bucket_dir: PathBuf, index_config: BucketIndexConfig) -> Result<Self> {
        let tmp_dir = bucket_dir.join("tmp");
        std::fs::create_dir_all(&tmp_dir)?;

        let mut bloom_seed = [0u8; HASH_KEY_BYTES];
        rand::thread_rng().fill(&mut bloom_seed);

        Ok(Self {
            bucket_dir,
            tmp_dir,
            buckets: RwLock::new(HashMap::new()),
            empty_merges: Mutex::new(HashSet::new()),
            index_config,
            bloom_seed,
        })
    }

    /// The directory adopted bucket files live in.
    pub fn bucket_dir(&self) -> &Path {
        &self.bucket_dir
    }

    /// The directory writers stream temporary files into.
    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// The index configuration buckets under this manager are built with.
    pub fn index_config(&self) -> &BucketIndexConfig {
        &self.index_config
    }

    /// The process-wide bloom seed for bucket indexes.
    pub fn bloom_seed(&self) -> &HashSeed {
        &self.bloom_seed
    }

    /// The canonical path for a bucket with the given hash.
    pub fn bucket_path(&self, hash: &Hash256) -> PathBuf {
        self.bucket_dir.join(format!("bucket-{}.xdr", hash.to_hex()))
    }

    /// Adopt a finished temporary file as the bucket with the given hash.
    ///
    /// Idempotent: if the hash is already registered the temporary file is
    /// deleted and the existing handle returned. Otherwise the file is
    /// durably renamed to its hash-derived name and registered. A supplied
    /// `index` is attached to a newly registered bucket.
    pub fn adopt_file_as_bucket(
        &self,
        path: &Path,
        hash: Hash256,
        kind: BucketKind,
        merge_key: Option<&MergeKey>,
        index: Option<BucketIndex>,
    ) -> Result<Arc<Bucket>> {
        if hash.is_zero() {
            return Err(BucketError::ProtocolViolation(
                "cannot adopt a file under the empty-bucket sentinel hash".to_string(),
            ));
        }

        if let Some(existing) = self.get_bucket_if_exists(&hash) {
            tracing::trace!(%hash, "bucket already adopted, discarding duplicate file");
            remove_if_present(path)?;
            return Ok(existing);
        }

        let final_path = self.bucket_path(&hash);
        if final_path.exists() {
            // File survives from an earlier run or a racing writer; ours
            // is a byte-identical duplicate.
            remove_if_present(path)?;
        } else {
            self.rename_into_bucket_dir(path, &final_path)?;
        }
        let size = std::fs::metadata(&final_path)?.len();

        let mut buckets = self.buckets.write();
        let bucket = match buckets.entry(hash) {
            std::collections::hash_map::Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            std::collections::hash_map::Entry::Vacant(vacant) => {
                tracing::debug!(%hash, size, "adopted bucket file");
                Arc::clone(vacant.insert(Arc::new(Bucket::new(
                    final_path,
                    hash,
                    kind,
                    size,
                    index,
                    self.index_config.clone(),
                    self.bloom_seed,
                ))))
            }
        };
        drop(buckets);

        if let Some(merge_key) = merge_key {
            // A non-empty output supersedes any stale empty memo for
            // these inputs.
            self.empty_merges.lock().remove(merge_key);
        }

        Ok(bucket)
    }

    // Move a finished temp file to its hash-derived name. The rename is
    // atomic but its directory entry may still sit in the page cache, so
    // the bucket directory is fsynced before adoption is reported; a
    // crash must not leave the registry pointing at a name that never
    // reached disk.
    fn rename_into_bucket_dir(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        std::fs::rename(from, to)?;
        std::fs::File::open(&self.bucket_dir)?.sync_all()?;
        Ok(())
    }

    /// Look up a registered bucket by hash. The zero hash resolves to a
    /// fresh empty sentinel of live form.
    pub fn get_bucket_if_exists(&self, hash: &Hash256) -> Option<Arc<Bucket>> {
        self.buckets.read().get(hash).cloned()
    }

    /// Content hashes of the bucket files present in the bucket
    /// directory, recovered from their hash-derived names. Temp files and
    /// foreign names are skipped. Used on startup to reconcile disk state
    /// against the retention sweep.
    pub fn scan_bucket_dir(&self) -> Result<Vec<Hash256>> {
        let mut hashes = Vec::new();
        for entry in std::fs::read_dir(&self.bucket_dir)? {
            let name = entry?.file_name();
            let hex = match name
                .to_str()
                .and_then(|n| n.strip_prefix("bucket-"))
                .and_then(|n| n.strip_suffix(".xdr"))
            {
                Some(hex) => hex,
                None => continue,
            };
            if let Ok(hash) = Hash256::from_hex(hex) {
                hashes.push(hash);
            }
        }
        Ok(hashes)
    }

    /// Record that the merge identified by `merge_key` produced an empty
    /// bucket.
    pub fn note_empty_merge_output(&self, merge_key: &MergeKey) {
        tracing::trace!(?merge_key, "memoizing empty merge output");
        self.empty_merges.lock().insert(merge_key.clone());
    }

    /// Whether `merge_key` is memoized as producing the empty bucket.
    pub fn is_known_empty_merge(&self, merge_key: &MergeKey) -> bool {
        self.empty_merges.lock().contains(merge_key)
    }

    /// Number of buckets currently registered.
    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    /// Drop and delete registered buckets not in `keep` that have no
    /// other holder. Returns the number of files deleted.
    ///
    /// A bucket still referenced by a snapshot or an in-flight merge is
    /// retained regardless of `keep`; lifetime equals the longest holder.
    pub fn retain_buckets(&self, keep: &[Hash256]) -> Result<usize> {
        let keep: HashSet<&Hash256> = keep.iter().collect();
        let mut deleted = 0;
        let mut buckets = self.buckets.write();
        let doomed: Vec<Hash256> = buckets
            .iter()
            .filter(|(hash, bucket)| !keep.contains(hash) && Arc::strong_count(bucket) == 1)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in doomed {
            if let Some(bucket) = buckets.remove(&hash) {
                if let Some(path) = bucket.path() {
                    remove_if_present(path)?;
                    deleted += 1;
                }
                tracing::debug!(%hash, "deleted unreferenced bucket");
            }
        }
        Ok(deleted)
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

impl std::fmt::Debug for BucketManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketManager")
            .field("bucket_dir", &self.bucket_dir)
            .field("buckets", &self.bucket_count())
            .finish()
    }
}
