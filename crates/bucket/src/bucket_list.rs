//! The bucket list: a fixed-height sequence of levels.
//!
//! Each level holds two buckets: `curr` accumulates recent merges and
//! `snap` is the material scheduled to flow into the next level. Lower
//! levels are smaller and update frequently; each deeper level is 4x
//! larger and spills 4x less often:
//!
//! | Level | Size | Half | Spill period |
//! |-------|------|------|--------------|
//! | 0     | 4    | 2    | 2 ledgers    |
//! | 1     | 16   | 8    | 8 ledgers    |
//! | 2     | 64   | 32   | 32 ledgers   |
//!
//! Existing buckets are never edited; every mutation produces new buckets
//! through the streaming merge. The bottom level elides tombstones (there
//! is nothing below to shadow).

use std::sync::Arc;

use sha2::{Digest, Sha256};
use stellar_xdr::curr::{LedgerEntry, LedgerKey};

use meridian_common::Hash256;

use crate::entry::{compare_entries, BucketEntry, BucketKind};
use crate::iterator::BucketOutputIterator;
use crate::manager::BucketManager;
use crate::merge::merge_buckets;
use crate::metrics::MergeCounters;
use crate::{Bucket, BucketError, Result};

/// Number of levels in a bucket list.
pub const BUCKET_LIST_LEVELS: usize = 11;

/// Target size of a level, in ledgers of history.
pub fn level_size(level: usize) -> u64 {
    4u64 << (2 * level as u32)
}

/// Half size of a level; the spill period.
pub fn level_half(level: usize) -> u64 {
    level_size(level) / 2
}

/// Whether `level` spills its curr into the next level when `ledger_seq`
/// closes.
pub fn level_should_spill(ledger_seq: u32, level: usize) -> bool {
    ledger_seq != 0 && u64::from(ledger_seq) % level_half(level) == 0
}

/// One level of the bucket list: the `(curr, snap)` bucket pair.
#[derive(Clone)]
pub struct BucketLevel {
    curr: Arc<Bucket>,
    snap: Arc<Bucket>,
}

impl BucketLevel {
    fn new(kind: BucketKind) -> Self {
        Self {
            curr: Arc::new(Bucket::empty(kind)),
            snap: Arc::new(Bucket::empty(kind)),
        }
    }

    /// The bucket accumulating recent merges.
    pub fn curr(&self) -> &Arc<Bucket> {
        &self.curr
    }

    /// The bucket scheduled to flow into the next level.
    pub fn snap(&self) -> &Arc<Bucket> {
        &self.snap
    }

    /// Hash identifying this level: `SHA256(curr_hash ‖ snap_hash)`.
    pub fn hash(&self) -> Hash256 {
        let mut hasher = Sha256::new();
        hasher.update(self.curr.hash().as_bytes());
        hasher.update(self.snap.hash().as_bytes());
        Hash256::from_digest(hasher)
    }
}

/// The live bucket list: [`BUCKET_LIST_LEVELS`] levels of bucket pairs.
pub struct BucketList {
    levels: Vec<BucketLevel>,
}

impl Default for BucketList {
    fn default() -> Self {
        Self::new()
    }
}

impl BucketList {
    /// A bucket list of empty levels.
    pub fn new() -> Self {
        Self {
            levels: (0..BUCKET_LIST_LEVELS)
                .map(|_| BucketLevel::new(BucketKind::Live))
                .collect(),
        }
    }

    /// Access one level; panics on an out-of-range index.
    pub fn get_level(&self, level: usize) -> &BucketLevel {
        &self.levels[level]
    }

    /// All levels, newest first.
    pub fn levels(&self) -> &[BucketLevel] {
        &self.levels
    }

    /// Merkle-style hash over all level hashes; this is what ledger
    /// headers commit to.
    pub fn hash(&self) -> Hash256 {
        let mut hasher = Sha256::new();
        for level in &self.levels {
            hasher.update(level.hash().as_bytes());
        }
        Hash256::from_digest(hasher)
    }

    /// Content hashes of every non-empty bucket in the list, for the
    /// manager's retention sweep.
    pub fn all_bucket_hashes(&self) -> Vec<Hash256> {
        self.levels
            .iter()
            .flat_map(|level| [level.curr.hash(), level.snap.hash()])
            .filter(|hash| !hash.is_zero())
            .collect()
    }

    /// Fold one closed ledger's entry changes into the list.
    ///
    /// Spills cascade from the deepest affected level upward, then the
    /// batch merges into level 0's curr. Each spill moves the source
    /// level's curr to its snap and merges the spilled material over the
    /// receiving level's curr; the receiving merge keeps tombstones
    /// except at the bottom level. Merges run synchronously.
    #[allow(clippy::too_many_arguments)]
    pub fn add_batch(
        &mut self,
        manager: &BucketManager,
        ledger_seq: u32,
        protocol_version: u32,
        init_entries: Vec<LedgerEntry>,
        live_entries: Vec<LedgerEntry>,
        dead_entries: Vec<LedgerKey>,
        counters: &Arc<MergeCounters>,
    ) -> Result<()> {
        if ledger_seq == 0 {
            return Err(BucketError::Merge(
                "cannot add batch for ledger 0".to_string(),
            ));
        }

        for i in (1..BUCKET_LIST_LEVELS).rev() {
            if !level_should_spill(ledger_seq, i - 1) {
                continue;
            }
            let spilled = Arc::clone(&self.levels[i - 1].curr);
            self.levels[i - 1].snap = Arc::clone(&spilled);
            self.levels[i - 1].curr = Arc::new(Bucket::empty(BucketKind::Live));

            let keep_tombstones = i < BUCKET_LIST_LEVELS - 1;
            self.levels[i].curr = merge_buckets(
                manager,
                &self.levels[i].curr,
                &spilled,
                protocol_version,
                keep_tombstones,
                counters,
                false,
            )?;
        }

        let batch = self.write_batch_bucket(
            manager,
            protocol_version,
            init_entries,
            live_entries,
            dead_entries,
            counters,
        )?;
        self.levels[0].curr = merge_buckets(
            manager,
            &self.levels[0].curr,
            &batch,
            protocol_version,
            true,
            counters,
            false,
        )?;

        Ok(())
    }

    fn write_batch_bucket(
        &self,
        manager: &BucketManager,
        protocol_version: u32,
        init_entries: Vec<LedgerEntry>,
        live_entries: Vec<LedgerEntry>,
        dead_entries: Vec<LedgerKey>,
        counters: &Arc<MergeCounters>,
    ) -> Result<Arc<Bucket>> {
        let mut entries: Vec<BucketEntry> = Vec::with_capacity(
            init_entries.len() + live_entries.len() + dead_entries.len(),
        );
        entries.extend(init_entries.into_iter().map(BucketEntry::Init));
        entries.extend(live_entries.into_iter().map(BucketEntry::Live));
        entries.extend(dead_entries.into_iter().map(BucketEntry::Dead));
        entries.sort_by(compare_entries);

        let meta = stellar_xdr::curr::BucketMetadata {
            ledger_version: protocol_version,
            ext: stellar_xdr::curr::BucketMetadataExt::V0,
        };
        let mut writer = BucketOutputIterator::new(
            manager.tmp_dir(),
            BucketKind::Live,
            true,
            meta,
            Arc::clone(counters),
            false,
        )?;
        for entry in entries {
            writer.put(entry)?;
        }
        writer.finalize(manager, true, None)
    }
}
