//! Pairwise bucket merging.
//!
//! Merging combines two sorted buckets into one, newer entries shadowing
//! older entries with the same key. The streams never materialize in
//! memory: two [`BucketInputIterator`]s advance in lockstep and survivors
//! flow through a [`BucketOutputIterator`], which applies the
//! level-dependent rewrite rules and produces the adopted result.
//!
//! # CAP-0020 resolution for equal keys
//!
//! - old `Dead` + new `Init` = `Live` (recreation cancels the tombstone)
//! - old `Init` + new `Live` = `Init` with the new value
//! - old `Init` + new `Dead` = nothing (both annihilated)
//! - anything else: the newer entry wins
//!
//! Init status is only meaningful relative to the buckets below the merge
//! output, which is why recreation downgrades to `Live` and why the
//! bottom level upgrades the other way (see the output iterator).

use std::sync::Arc;

use stellar_xdr::curr::{BucketListType, BucketMetadata, BucketMetadataExt};

use meridian_common::protocol::protocol_version_starts_from;

use crate::entry::{compare_entries, BucketEntry, BucketKind};
use crate::iterator::{BucketInputIterator, BucketOutputIterator};
use crate::manager::{BucketManager, MergeKey};
use crate::metrics::MergeCounters;
use crate::{Bucket, BucketError, Result, FIRST_PROTOCOL_SUPPORTING_PERSISTENT_EVICTION};

/// Merge `new_bucket` (newer, shadowing) over `old_bucket` (older) into a
/// freshly adopted bucket.
///
/// `keep_tombstones` is false only when the output lands on the bottom
/// level. Empty outputs are memoized under the inputs' [`MergeKey`], and
/// a memoized empty merge short-circuits without touching the disk.
pub fn merge_buckets(
    manager: &BucketManager,
    old_bucket: &Arc<Bucket>,
    new_bucket: &Arc<Bucket>,
    protocol_version: u32,
    keep_tombstones: bool,
    counters: &Arc<MergeCounters>,
    do_fsync: bool,
) -> Result<Arc<Bucket>> {
    if old_bucket.kind() != new_bucket.kind() {
        return Err(BucketError::Merge(
            "cannot merge buckets of different kinds".to_string(),
        ));
    }
    let kind = old_bucket.kind();

    let merge_key = MergeKey {
        keep_tombstones,
        input_curr: new_bucket.hash(),
        input_snap: old_bucket.hash(),
    };
    if manager.is_known_empty_merge(&merge_key) {
        tracing::trace!(?merge_key, "merge memoized as empty");
        return Ok(Arc::new(Bucket::empty(kind)));
    }

    tracing::trace!(
        old = %old_bucket.hash(),
        new = %new_bucket.hash(),
        protocol_version,
        keep_tombstones,
        "merge starting"
    );

    let mut meta = BucketMetadata {
        ledger_version: protocol_version,
        ext: BucketMetadataExt::V0,
    };
    if protocol_version_starts_from(protocol_version, FIRST_PROTOCOL_SUPPORTING_PERSISTENT_EVICTION)
    {
        meta.ext = BucketMetadataExt::V1(match kind {
            BucketKind::Live => BucketListType::Live,
            BucketKind::HotArchive => BucketListType::HotArchive,
        });
    }

    let mut out = BucketOutputIterator::new(
        manager.tmp_dir(),
        kind,
        keep_tombstones,
        meta,
        Arc::clone(counters),
        do_fsync,
    )?;

    let mut old_iter = BucketInputIterator::for_bucket(old_bucket);
    let mut new_iter = BucketInputIterator::for_bucket(new_bucket);

    loop {
        old_iter.ensure_loaded()?;
        new_iter.ensure_loaded()?;

        match (old_iter.peek(), new_iter.peek()) {
            (None, None) => break,
            (Some(old_entry), None) => {
                counters.record_old_entry_default_accepted();
                out.put(old_entry.clone())?;
                old_iter.next()?;
            }
            (None, Some(new_entry)) => {
                counters.record_new_entry_default_accepted();
                out.put(new_entry.clone())?;
                new_iter.next()?;
            }
            (Some(old_entry), Some(new_entry)) => {
                match compare_entries(old_entry, new_entry) {
                    std::cmp::Ordering::Less => {
                        counters.record_old_entry_default_accepted();
                        out.put(old_entry.clone())?;
                        old_iter.next()?;
                    }
                    std::cmp::Ordering::Greater => {
                        counters.record_new_entry_default_accepted();
                        out.put(new_entry.clone())?;
                        new_iter.next()?;
                    }
                    std::cmp::Ordering::Equal => {
                        if let Some(merged) =
                            merge_equal_keys(old_entry, new_entry, counters)
                        {
                            out.put(merged)?;
                        }
                        old_iter.next()?;
                        new_iter.next()?;
                    }
                }
            }
        }
    }

    let result = out.finalize(manager, true, Some(&merge_key))?;
    tracing::trace!(result = %result.hash(), "merge complete");
    Ok(result)
}

// Resolve two entries with the same key; `None` means both annihilate.
fn merge_equal_keys(
    old_entry: &BucketEntry,
    new_entry: &BucketEntry,
    counters: &MergeCounters,
) -> Option<BucketEntry> {
    match (old_entry, new_entry) {
        (BucketEntry::Dead(_), BucketEntry::Init(entry)) => {
            counters.record_new_init_merged_with_old_dead();
            Some(BucketEntry::Live(entry.clone()))
        }
        (BucketEntry::Init(_), BucketEntry::Live(entry)) => {
            counters.record_old_init_merged_with_new_live();
            Some(BucketEntry::Init(entry.clone()))
        }
        (BucketEntry::Init(_), BucketEntry::Dead(_)) => {
            counters.record_old_init_merged_with_new_dead();
            None
        }
        _ => Some(new_entry.clone()),
    }
}
