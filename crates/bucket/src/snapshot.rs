//! Immutable bucket list snapshots and the query engine.
//!
//! A [`BucketListSnapshot`] captures the full level structure at one
//! ledger sequence by sharing bucket handles; it never changes after
//! capture, so any number of readers can query concurrently without
//! locking. Each reader wraps its snapshot in a
//! [`SearchableBucketListSnapshot`], which owns a lazily-opened file
//! stream per bucket it touches; there is no shared mutable state on the
//! read path.
//!
//! # Traversal order
//!
//! All queries walk levels newest-to-oldest, `curr` before `snap` within
//! a level, stopping at the first bucket that resolves a key. Shadow
//! semantics depend on this order: the newest record for a key decides
//! whether the key is live or deleted.
//!
//! # Snapshot refresh
//!
//! Every public query first invites the [`BucketSnapshotManager`] to swap
//! in a newer snapshot, then runs entirely against the (now stable)
//! snapshot it holds. Older snapshots remain valid until their last
//! holder drops them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::RwLock;
use stellar_xdr::curr::{
    AccountId, Asset, BucketEntry as XdrBucketEntry, HotArchiveBucketEntry, LedgerEntry,
    LedgerEntryData, LedgerKey, LedgerKeyTrustLine, PoolId, TrustLineAsset,
};

use meridian_common::XdrInputFileStream;

use crate::bucket_list::{BucketLevel, BucketList};
use crate::entry::{compare_keys, ledger_key_type, xdr_size, BucketEntry, BucketKind};
use crate::index::IndexCursor;
use crate::iterator::BucketInputIterator;
use crate::metrics::QueryMetrics;
use crate::meter::LedgerKeyMeter;
use crate::{Bucket, Result};

/// Reborrow a metering handle with a lifetime tied to `meter` itself
/// rather than to whatever lifetime the caller's `Option` was
/// originally parameterized over.
fn reborrow_meter<'a>(
    meter: &'a mut Option<&mut dyn LedgerKeyMeter>,
) -> Option<&'a mut dyn LedgerKeyMeter> {
    match meter {
        Some(m) => Some(&mut **m),
        None => None,
    }
}

/// Minimum account balance for an inflation vote to count: 10^9 stroops.
const MIN_INFLATION_VOTE_BALANCE: i64 = 1_000_000_000;

fn read_one_entry(
    stream: &mut XdrInputFileStream,
    kind: BucketKind,
) -> Result<Option<BucketEntry>> {
    Ok(match kind {
        BucketKind::Live => stream
            .read_one::<XdrBucketEntry>()?
            .map(BucketEntry::from_live_wire),
        BucketKind::HotArchive => stream
            .read_one::<HotArchiveBucketEntry>()?
            .map(BucketEntry::from_hot_archive_wire),
    })
}

// ============================================================================
// Per-bucket snapshot
// ============================================================================

/// A read-only view of one bucket with a reader-owned sequential stream.
///
/// Cloning shares the bucket handle but not the stream: each reader opens
/// its own file handle lazily on first need, so concurrent readers never
/// contend.
pub struct BucketSnapshot {
    bucket: Arc<Bucket>,
    stream: Option<XdrInputFileStream>,
}

impl Clone for BucketSnapshot {
    fn clone(&self) -> Self {
        Self {
            bucket: Arc::clone(&self.bucket),
            stream: None,
        }
    }
}

impl BucketSnapshot {
    /// Snapshot a shared bucket handle.
    pub fn new(bucket: Arc<Bucket>) -> Self {
        Self {
            bucket,
            stream: None,
        }
    }

    /// True iff the underlying bucket is the empty sentinel.
    pub fn is_empty(&self) -> bool {
        self.bucket.is_empty()
    }

    /// The underlying bucket handle.
    pub fn bucket(&self) -> &Arc<Bucket> {
        &self.bucket
    }

    fn stream(&mut self) -> Result<&mut XdrInputFileStream> {
        if self.stream.is_none() {
            let path = self.bucket.path().expect("empty bucket has no stream");
            self.stream = Some(XdrInputFileStream::open(path)?);
        }
        Ok(self.stream.as_mut().expect("stream just opened"))
    }

    /// Read the record for `key` at `offset`.
    ///
    /// With `page_size` 0 the offset addresses the record exactly; with a
    /// positive `page_size` up to that many bytes are scanned forward for
    /// the key. Failure to locate the record is a bloom false positive
    /// and is marked against the index.
    pub fn get_entry_at_offset(
        &mut self,
        key: &LedgerKey,
        offset: u64,
        page_size: u64,
    ) -> Result<Option<BucketEntry>> {
        if self.is_empty() {
            return Ok(None);
        }
        let kind = self.bucket.kind();
        let stream = self.stream()?;
        stream.seek(offset)?;

        if page_size == 0 {
            if let Some(entry) = read_one_entry(stream, kind)? {
                return Ok(Some(entry));
            }
        } else {
            let page_end = offset + page_size;
            while stream.pos() < page_end {
                let entry = match read_one_entry(stream, kind)? {
                    Some(entry) => entry,
                    None => break,
                };
                match entry.key() {
                    Some(entry_key) => match compare_keys(&entry_key, key) {
                        std::cmp::Ordering::Equal => return Ok(Some(entry)),
                        // Records are sorted; the key cannot appear later
                        // in the page.
                        std::cmp::Ordering::Greater => break,
                        std::cmp::Ordering::Less => continue,
                    },
                    None => continue,
                }
            }
        }

        if let Some(index) = self.bucket.index() {
            index.mark_bloom_miss();
        }
        Ok(None)
    }

    /// Look up the record for `key` through the bucket's index.
    pub fn get_bucket_entry(&mut self, key: &LedgerKey) -> Result<Option<BucketEntry>> {
        if self.is_empty() {
            return Ok(None);
        }
        let index = self.bucket.ensure_index()?;
        match index.lookup(key) {
            Some(offset) => self.get_entry_at_offset(key, offset, index.page_size()),
            None => Ok(None),
        }
    }

    /// The shadow-aware bulk reader.
    ///
    /// `keys` must be sorted ascending; the index cursor advances in
    /// lockstep with it. A key is removed from `keys` when it is resolved
    /// here: found live (appended to `result`, subject to metering),
    /// found dead (shadowed, known absent), or refused by the meter.
    /// Unresolved keys stay for older buckets.
    pub fn load_keys_with_limits(
        &mut self,
        keys: &mut Vec<LedgerKey>,
        result: &mut Vec<LedgerEntry>,
        mut meter: Option<&mut dyn LedgerKeyMeter>,
    ) -> Result<()> {
        if self.is_empty() || keys.is_empty() {
            return Ok(());
        }
        let index = self.bucket.ensure_index()?;
        let page_size = index.page_size();

        let mut remaining = Vec::with_capacity(keys.len());
        let mut cursor = IndexCursor::default();

        for key in keys.drain(..) {
            if let Some(meter) = meter.as_deref_mut() {
                // A key's serialized size is a lower bound on its entry's,
                // so an unaffordable key cannot be loaded at all. Charge it
                // anyway: the owning transactions are pinned at zero and
                // their remaining keys refuse up front.
                let key_size = xdr_size(&key)?;
                if !meter.can_load(&key, key_size) {
                    meter.update_read_quotas_for_key(&key, key_size);
                    continue;
                }
            }

            let (offset, next_cursor) = index.scan(cursor, &key);
            cursor = next_cursor;
            let entry = match offset {
                Some(offset) => self.get_entry_at_offset(&key, offset, page_size)?,
                None => None,
            };

            match entry {
                None => remaining.push(key),
                Some(entry) if entry.is_tombstone() => {
                    // Shadowed: the key is known absent below this bucket.
                }
                Some(entry) => {
                    if let Some(live) = entry.as_ledger_entry() {
                        let add = match meter.as_deref_mut() {
                            Some(meter) => {
                                let entry_size = xdr_size(live)?;
                                let add = meter.can_load(&key, entry_size);
                                meter.update_read_quotas_for_key(&key, entry_size);
                                add
                            }
                            None => true,
                        };
                        if add {
                            result.push(live.clone());
                        }
                    }
                }
            }
        }

        *keys = remaining;
        Ok(())
    }

    /// Pool ids whose pools contain `asset` in this bucket.
    pub fn get_pool_ids_by_asset(&self, asset: &Asset) -> Result<Vec<PoolId>> {
        if self.is_empty() {
            return Ok(Vec::new());
        }
        let index = self.bucket.ensure_index()?;
        Ok(index.get_pool_ids_by_asset(asset).to_vec())
    }
}

// ============================================================================
// Bucket list snapshot
// ============================================================================

/// Snapshot of one level's `(curr, snap)` pair.
#[derive(Clone)]
pub struct BucketLevelSnapshot {
    /// Current bucket snapshot.
    pub curr: BucketSnapshot,
    /// Snapshot bucket snapshot.
    pub snap: BucketSnapshot,
}

impl BucketLevelSnapshot {
    fn from_level(level: &BucketLevel) -> Self {
        Self {
            curr: BucketSnapshot::new(Arc::clone(level.curr())),
            snap: BucketSnapshot::new(Arc::clone(level.snap())),
        }
    }
}

/// An immutable view of the full bucket list at a specific ledger
/// sequence. Cheap to clone: levels share bucket handles.
#[derive(Clone)]
pub struct BucketListSnapshot {
    levels: Vec<BucketLevelSnapshot>,
    ledger_seq: u32,
}

impl BucketListSnapshot {
    /// Capture the bucket list as of `ledger_seq`.
    pub fn new(bucket_list: &BucketList, ledger_seq: u32) -> Self {
        Self {
            levels: bucket_list
                .levels()
                .iter()
                .map(BucketLevelSnapshot::from_level)
                .collect(),
            ledger_seq,
        }
    }

    /// The ledger sequence this snapshot was captured at.
    pub fn ledger_seq(&self) -> u32 {
        self.ledger_seq
    }

    /// The level snapshots, newest first.
    pub fn levels(&self) -> &[BucketLevelSnapshot] {
        &self.levels
    }
}

// Walk non-empty buckets newest-to-oldest, curr then snap. The callback
// returns true to short-circuit.
fn walk_buckets<F>(snapshot: &mut BucketListSnapshot, mut f: F) -> Result<()>
where
    F: FnMut(&mut BucketSnapshot) -> Result<bool>,
{
    for level in snapshot.levels.iter_mut() {
        for bucket in [&mut level.curr, &mut level.snap] {
            if bucket.is_empty() {
                continue;
            }
            if f(bucket)? {
                return Ok(());
            }
        }
    }
    Ok(())
}

// ============================================================================
// Snapshot manager
// ============================================================================

/// Publishes the current snapshot to readers and owns query metrics.
///
/// The main thread replaces the current snapshot as each ledger closes;
/// readers pick it up at their next query through
/// [`maybe_update_snapshot`](Self::maybe_update_snapshot). Certain
/// queries cooperate with single-threaded collaborators and assert they
/// run on the thread that created the manager.
pub struct BucketSnapshotManager {
    current: RwLock<BucketListSnapshot>,
    metrics: QueryMetrics,
    main_thread: ThreadId,
}

impl BucketSnapshotManager {
    /// Create a manager publishing `initial`; the calling thread becomes
    /// the designated main thread.
    pub fn new(initial: BucketListSnapshot) -> Self {
        Self {
            current: RwLock::new(initial),
            metrics: QueryMetrics::new(),
            main_thread: std::thread::current().id(),
        }
    }

    /// Ledger sequence of the published snapshot.
    pub fn current_ledger_seq(&self) -> u32 {
        self.current.read().ledger_seq()
    }

    /// Publish a new current snapshot. Main thread only.
    pub fn update_current_snapshot(&self, snapshot: BucketListSnapshot) {
        self.assert_main_thread("update_current_snapshot");
        let mut current = self.current.write();
        tracing::trace!(
            from = current.ledger_seq(),
            to = snapshot.ledger_seq(),
            "publishing bucket list snapshot"
        );
        *current = snapshot;
    }

    /// Swap `snapshot` for the published one if it is newer. Idempotent;
    /// returns whether a swap happened.
    pub fn maybe_update_snapshot(&self, snapshot: &mut BucketListSnapshot) -> bool {
        let current = self.current.read();
        if current.ledger_seq() > snapshot.ledger_seq() {
            *snapshot = current.clone();
            true
        } else {
            false
        }
    }

    /// A searchable reader over the published snapshot.
    pub fn copy_searchable_snapshot(self: &Arc<Self>) -> SearchableBucketListSnapshot {
        SearchableBucketListSnapshot {
            manager: Arc::clone(self),
            snapshot: self.current.read().clone(),
        }
    }

    /// Query metrics for this manager's readers.
    pub fn metrics(&self) -> &QueryMetrics {
        &self.metrics
    }

    /// Whether the calling thread is the designated main thread.
    pub fn is_main_thread(&self) -> bool {
        std::thread::current().id() == self.main_thread
    }

    fn assert_main_thread(&self, what: &str) {
        assert!(
            self.is_main_thread(),
            "{} must run on the main thread",
            what
        );
    }
}

// ============================================================================
// Searchable snapshot
// ============================================================================

/// An account that has received inflation votes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InflationWinner {
    /// The inflation destination receiving the votes.
    pub account_id: AccountId,
    /// Sum of balances of accounts voting for this destination.
    pub votes: i64,
}

/// A per-reader query handle over a bucket list snapshot.
///
/// Holds its own snapshot and, inside it, its own file streams; safe to
/// move to any thread, though the pool-share and inflation queries are
/// main-thread only.
pub struct SearchableBucketListSnapshot {
    manager: Arc<BucketSnapshotManager>,
    snapshot: BucketListSnapshot,
}

impl SearchableBucketListSnapshot {
    /// Ledger sequence of the snapshot currently held.
    pub fn ledger_seq(&self) -> u32 {
        self.snapshot.ledger_seq()
    }

    /// Point lookup: the live value of the newest record for `key`, or
    /// `None` if that record is a tombstone or no record exists.
    pub fn get_ledger_entry(&mut self, key: &LedgerKey) -> Result<Option<LedgerEntry>> {
        self.manager.maybe_update_snapshot(&mut self.snapshot);
        let manager = Arc::clone(&self.manager);
        let _timer = manager
            .is_main_thread()
            .then(|| manager.metrics().point_load_timer(ledger_key_type(key)));

        let mut result = None;
        walk_buckets(&mut self.snapshot, |bucket| {
            match bucket.get_bucket_entry(key)? {
                Some(entry) => {
                    if !entry.is_tombstone() {
                        result = entry.as_ledger_entry().cloned();
                    }
                    Ok(true)
                }
                None => Ok(false),
            }
        })?;
        Ok(result)
    }

    /// Bulk lookup with optional read metering.
    ///
    /// Equivalent to a point lookup per key when unmetered; with a meter,
    /// returns the subset of results whose transactions stayed within
    /// their read quotas. The input set is copied; duplicates are
    /// collapsed.
    pub fn load_keys_with_limits(
        &mut self,
        keys: &[LedgerKey],
        mut meter: Option<&mut dyn LedgerKeyMeter>,
    ) -> Result<Vec<LedgerEntry>> {
        self.manager.maybe_update_snapshot(&mut self.snapshot);
        let manager = Arc::clone(&self.manager);
        let tag = if meter.is_some() {
            "prefetch-soroban"
        } else {
            "prefetch-classic"
        };
        let _timer = manager
            .is_main_thread()
            .then(|| manager.metrics().bulk_load_timer(tag, keys.len()));

        self.load_keys_internal(keys, reborrow_meter(&mut meter))
    }

    fn load_keys_internal(
        &mut self,
        keys: &[LedgerKey],
        mut meter: Option<&mut dyn LedgerKeyMeter>,
    ) -> Result<Vec<LedgerEntry>> {
        // The traversal is destructive and cursor-coupled: work on a
        // sorted, deduplicated copy.
        let mut keys: Vec<LedgerKey> = keys.to_vec();
        keys.sort_by(compare_keys);
        keys.dedup();

        let mut entries = Vec::new();
        'walk: for level in self.snapshot.levels.iter_mut() {
            for bucket in [&mut level.curr, &mut level.snap] {
                if bucket.is_empty() {
                    continue;
                }
                bucket.load_keys_with_limits(&mut keys, &mut entries, reborrow_meter(&mut meter))?;
                if keys.is_empty() {
                    break 'walk;
                }
            }
        }
        Ok(entries)
    }

    /// Pool-share trustlines of `account_id` over pools containing
    /// `asset`.
    ///
    /// Two passes: union the asset→pool-id indexes of every bucket into a
    /// candidate pool set, then bulk-load the corresponding trustline
    /// keys. Main thread only (runs during transaction apply).
    pub fn load_pool_share_trust_lines_by_account_and_asset(
        &mut self,
        account_id: &AccountId,
        asset: &Asset,
    ) -> Result<Vec<LedgerEntry>> {
        self.manager
            .assert_main_thread("load_pool_share_trust_lines_by_account_and_asset");
        self.manager.maybe_update_snapshot(&mut self.snapshot);

        let mut seen: HashSet<PoolId> = HashSet::new();
        let mut pool_ids: Vec<PoolId> = Vec::new();
        walk_buckets(&mut self.snapshot, |bucket| {
            for pool_id in bucket.get_pool_ids_by_asset(asset)? {
                if seen.insert(pool_id.clone()) {
                    pool_ids.push(pool_id);
                }
            }
            Ok(false)
        })?;

        if pool_ids.is_empty() {
            return Ok(Vec::new());
        }

        let trustline_keys: Vec<LedgerKey> = pool_ids
            .into_iter()
            .map(|pool_id| {
                LedgerKey::Trustline(LedgerKeyTrustLine {
                    account_id: account_id.clone(),
                    asset: TrustLineAsset::PoolShare(pool_id),
                })
            })
            .collect();

        let manager = Arc::clone(&self.manager);
        let _timer = manager
            .metrics()
            .bulk_load_timer("poolshare-trustlines", trustline_keys.len());
        self.load_keys_internal(&trustline_keys, None)
    }

    /// Aggregate inflation votes across the whole snapshot.
    ///
    /// Scans every bucket sequentially; account records sort first within
    /// a bucket, so each per-bucket scan stops at the first non-account
    /// live record. An account counts once, at its newest record; a
    /// newest-record tombstone suppresses older copies. Main thread only
    /// (legacy query, runs during catchup).
    pub fn load_inflation_winners(
        &mut self,
        max_winners: usize,
        min_balance: i64,
    ) -> Result<Vec<InflationWinner>> {
        self.manager.assert_main_thread("load_inflation_winners");
        self.manager.maybe_update_snapshot(&mut self.snapshot);
        let manager = Arc::clone(&self.manager);
        let _timer = manager.metrics().bulk_load_timer("inflation-winners", 0);

        let mut seen: HashSet<AccountId> = HashSet::new();
        let mut vote_counts: HashMap<AccountId, i64> = HashMap::new();

        for level in self.snapshot.levels() {
            for bucket in [&level.curr, &level.snap] {
                if bucket.is_empty() {
                    continue;
                }
                let mut iter = BucketInputIterator::for_bucket(bucket.bucket());
                while let Some(entry) = iter.next()? {
                    match &entry {
                        BucketEntry::Dead(key) => {
                            if let LedgerKey::Account(k) = key {
                                seen.insert(k.account_id.clone());
                            }
                        }
                        BucketEntry::Live(le) | BucketEntry::Init(le) => {
                            let account = match &le.data {
                                LedgerEntryData::Account(account) => account,
                                // Accounts sort first: no accounts remain
                                // in this bucket.
                                _ => break,
                            };
                            if !seen.insert(account.account_id.clone()) {
                                continue;
                            }
                            if let Some(dest) = &account.inflation_dest {
                                if account.balance >= MIN_INFLATION_VOTE_BALANCE {
                                    *vote_counts.entry(dest.clone()).or_insert(0) +=
                                        account.balance;
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        let mut winners: Vec<InflationWinner> = vote_counts
            .into_iter()
            .filter(|(_, votes)| *votes >= min_balance)
            .map(|(account_id, votes)| InflationWinner { account_id, votes })
            .collect();
        // Descending by votes, account id breaking ties, so the result is
        // deterministic whether or not it is truncated.
        winners.sort_by(|a, b| {
            b.votes
                .cmp(&a.votes)
                .then_with(|| a.account_id.cmp(&b.account_id))
        });
        winners.truncate(max_winners);
        Ok(winners)
    }
}
