//! Per-bucket indexing.
//!
//! Every bucket is self-indexed: a [`BucketIndex`] maps each present key
//! to the byte offset of its record (or of the page holding it), backed
//! by a bloom filter for fast negative lookups and a reverse index from
//! pool-share asset to pool ids for trustline discovery.
//!
//! Two flavors exist, selected by bucket file size against
//! [`BucketIndexConfig`]:
//!
//! - **Individual-key**: one sorted `(key, offset)` entry per record;
//!   page size 0, reads decode exactly one record at the offset.
//! - **Page-based**: one `(key range, offset)` entry per `page_size`
//!   bytes of file; reads scan forward up to a page worth of records.
//!
//! The index is built once per bucket from a full file scan, shared via
//! `Arc`, and destroyed with its bucket.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use sha2::{Digest, Sha256};
use stellar_xdr::curr::{
    Asset, LedgerEntryData, LedgerKey, Limits, LiquidityPoolEntryBody, PoolId, WriteXdr,
};

use meridian_common::BucketIndexConfig;

use crate::bloom_filter::{BucketBloomFilter, HashSeed};
use crate::entry::{compare_keys, BucketEntry, BucketKind};
use crate::iterator::BucketInputIterator;
use crate::Result;

/// A range of keys covered by one page of the bucket file.
#[derive(Debug, Clone)]
struct RangeEntry {
    /// The lower bound key (inclusive).
    lower_bound: LedgerKey,
    /// The upper bound key (inclusive).
    upper_bound: LedgerKey,
}

impl RangeEntry {
    fn contains(&self, key: &LedgerKey) -> bool {
        compare_keys(key, &self.lower_bound) != std::cmp::Ordering::Less
            && compare_keys(key, &self.upper_bound) != std::cmp::Ordering::Greater
    }
}

/// Maps assets to the liquidity pool ids whose pools contain them.
///
/// Lets "find all pool share trustlines for an account and asset" queries
/// identify candidate pools without scanning the bucket.
#[derive(Debug, Default)]
pub struct AssetPoolIdMap {
    asset_to_pools: HashMap<[u8; 32], Vec<PoolId>>,
}

impl AssetPoolIdMap {
    /// Record a pool under both of its constituent assets.
    fn add_pool(&mut self, pool_id: PoolId, asset_a: &Asset, asset_b: &Asset) {
        self.asset_to_pools
            .entry(Self::hash_asset(asset_a))
            .or_default()
            .push(pool_id.clone());
        let b_entry = self
            .asset_to_pools
            .entry(Self::hash_asset(asset_b))
            .or_default();
        if !b_entry.contains(&pool_id) {
            b_entry.push(pool_id);
        }
    }

    /// All pool ids containing the given asset; empty slice if none.
    pub fn get(&self, asset: &Asset) -> &[PoolId] {
        self.asset_to_pools
            .get(&Self::hash_asset(asset))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of distinct assets tracked.
    pub fn num_assets(&self) -> usize {
        self.asset_to_pools.len()
    }

    // Assets are variable-size XDR unions; a digest of the serialized
    // form gives a fixed-width map key.
    fn hash_asset(asset: &Asset) -> [u8; 32] {
        let asset_bytes = asset.to_xdr(Limits::none()).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&asset_bytes);
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        hash
    }
}

/// A resumable forward cursor into an index.
///
/// Bulk lookups walk their sorted key set and the index in lockstep: the
/// cursor returned by one [`BucketIndex::scan`] call is handed to the
/// next, so N probes against M index entries cost O(N+M) rather than
/// N binary searches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexCursor(usize);

#[derive(Debug)]
enum IndexKeys {
    /// Sorted `(key, record offset)` pairs; page size 0.
    Individual(Vec<(LedgerKey, u64)>),
    /// Sorted `(key range, page offset)` pairs.
    Pages(Vec<(RangeEntry, u64)>),
}

/// The in-memory index of one bucket file.
#[derive(Debug)]
pub struct BucketIndex {
    keys: IndexKeys,
    page_size: u64,
    bloom: Option<BucketBloomFilter>,
    bloom_seed: HashSeed,
    asset_to_pool_id: AssetPoolIdMap,
    entry_count: u64,
    bloom_misses: AtomicU64,
}

impl BucketIndex {
    /// Build an index by scanning the bucket file at `path`.
    ///
    /// The index flavor is chosen by comparing the file size against the
    /// configured cutoff; `seed` keys the bloom filter hashes.
    pub fn build(
        path: &Path,
        kind: BucketKind,
        config: &BucketIndexConfig,
        seed: &HashSeed,
    ) -> Result<Self> {
        let file_size = std::fs::metadata(path)?.len();
        let page_size = if file_size < config.index_cutoff_bytes() {
            0
        } else {
            config.page_size_bytes()
        };

        let mut individual: Vec<(LedgerKey, u64)> = Vec::new();
        let mut pages: Vec<(RangeEntry, u64)> = Vec::new();
        let mut bloom_hashes: Vec<u64> = Vec::new();
        let mut asset_to_pool_id = AssetPoolIdMap::default();
        let mut entry_count = 0u64;
        let mut page_upper_bound = 0u64;

        let mut iter = BucketInputIterator::open(path.to_path_buf(), kind);
        while let Some((entry, offset)) = iter.next_with_offset()? {
            let key = match entry.key() {
                Some(key) => key,
                None => continue,
            };
            entry_count += 1;
            bloom_hashes.push(BucketBloomFilter::hash_key(&key, seed));

            if page_size == 0 {
                individual.push((key.clone(), offset));
            } else if pages.is_empty() || offset >= page_upper_bound {
                // Start a new page at the next page-aligned boundary.
                page_upper_bound = (offset & !(page_size - 1)) + page_size;
                pages.push((
                    RangeEntry {
                        lower_bound: key.clone(),
                        upper_bound: key.clone(),
                    },
                    offset,
                ));
            } else {
                pages.last_mut().unwrap().0.upper_bound = key.clone();
            }

            if let BucketEntry::Live(e) | BucketEntry::Init(e) = &entry {
                if let LedgerEntryData::LiquidityPool(pool) = &e.data {
                    let LiquidityPoolEntryBody::LiquidityPoolConstantProduct(cp) = &pool.body;
                    asset_to_pool_id.add_pool(
                        pool.liquidity_pool_id.clone(),
                        &cp.params.asset_a,
                        &cp.params.asset_b,
                    );
                }
            }
        }

        let bloom = if bloom_hashes.len() >= 2 {
            BucketBloomFilter::from_hashes(&bloom_hashes, seed).ok()
        } else {
            None
        };

        let keys = if page_size == 0 {
            IndexKeys::Individual(individual)
        } else {
            IndexKeys::Pages(pages)
        };

        Ok(Self {
            keys,
            page_size,
            bloom,
            bloom_seed: *seed,
            asset_to_pool_id,
            entry_count,
            bloom_misses: AtomicU64::new(0),
        })
    }

    /// The page size readers must scan at offsets returned by this index;
    /// 0 means each offset addresses exactly one record.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Number of keyed records indexed.
    pub fn len(&self) -> u64 {
        self.entry_count
    }

    /// Whether the index covers no records.
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Look up the offset for a key.
    ///
    /// A bloom filter miss is definitive and counted; a bloom pass
    /// followed by an absent key is a false positive and returns `None`.
    pub fn lookup(&self, key: &LedgerKey) -> Option<u64> {
        if let Some(bloom) = &self.bloom {
            if !bloom.may_contain(key) {
                self.mark_bloom_miss();
                return None;
            }
        }

        match &self.keys {
            IndexKeys::Individual(entries) => entries
                .binary_search_by(|(k, _)| compare_keys(k, key))
                .ok()
                .map(|i| entries[i].1),
            IndexKeys::Pages(pages) => {
                let idx = pages.partition_point(|(range, _)| {
                    compare_keys(&range.upper_bound, key) == std::cmp::Ordering::Less
                });
                if idx < pages.len() && pages[idx].0.contains(key) {
                    Some(pages[idx].1)
                } else {
                    None
                }
            }
        }
    }

    /// Resume a forward scan at `cursor`, looking for `key`.
    ///
    /// Returns the key's offset (exact or page start) if it can still lie
    /// at or after the cursor, plus the cursor to hand to the next probe.
    /// Probes must arrive in ascending key order.
    pub fn scan(&self, cursor: IndexCursor, key: &LedgerKey) -> (Option<u64>, IndexCursor) {
        if let Some(bloom) = &self.bloom {
            if !bloom.may_contain(key) {
                self.mark_bloom_miss();
                return (None, cursor);
            }
        }

        let mut i = cursor.0;
        match &self.keys {
            IndexKeys::Individual(entries) => {
                while i < entries.len()
                    && compare_keys(&entries[i].0, key) == std::cmp::Ordering::Less
                {
                    i += 1;
                }
                if i < entries.len() && compare_keys(&entries[i].0, key) == std::cmp::Ordering::Equal
                {
                    (Some(entries[i].1), IndexCursor(i))
                } else {
                    (None, IndexCursor(i))
                }
            }
            IndexKeys::Pages(pages) => {
                while i < pages.len()
                    && compare_keys(&pages[i].0.upper_bound, key) == std::cmp::Ordering::Less
                {
                    i += 1;
                }
                if i < pages.len() && pages[i].0.contains(key) {
                    (Some(pages[i].1), IndexCursor(i))
                } else {
                    (None, IndexCursor(i))
                }
            }
        }
    }

    /// Pool ids whose pools contain `asset`; stable empty slice if none.
    pub fn get_pool_ids_by_asset(&self, asset: &Asset) -> &[PoolId] {
        self.asset_to_pool_id.get(asset)
    }

    /// The asset→pool-id reverse index.
    pub fn asset_to_pool_id(&self) -> &AssetPoolIdMap {
        &self.asset_to_pool_id
    }

    /// Record a miss attributed to the bloom filter (fast negative or
    /// false positive detected at read time).
    pub fn mark_bloom_miss(&self) {
        self.bloom_misses.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Number of bloom misses recorded so far.
    pub fn bloom_misses(&self) -> u64 {
        self.bloom_misses.load(AtomicOrdering::Relaxed)
    }

    /// The bloom seed this index hashes keys with.
    pub fn bloom_seed(&self) -> &HashSeed {
        &self.bloom_seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::BucketOutputIterator;
    use crate::metrics::MergeCounters;
    use crate::BucketEntry;
    use std::sync::Arc;
    use stellar_xdr::curr::*;

    fn make_account_id(byte: u8) -> AccountId {
        AccountId(PublicKey::PublicKeyTypeEd25519(Uint256([byte; 32])))
    }

    fn make_account_entry(byte: u8) -> LedgerEntry {
        LedgerEntry {
            last_modified_ledger_seq: 1,
            data: LedgerEntryData::Account(AccountEntry {
                account_id: make_account_id(byte),
                balance: byte as i64 * 100,
                seq_num: SequenceNumber(1),
                num_sub_entries: 0,
                inflation_dest: None,
                flags: 0,
                home_domain: String32::default(),
                thresholds: Thresholds([1, 0, 0, 0]),
                signers: Vec::new().try_into().unwrap(),
                ext: AccountEntryExt::V0,
            }),
            ext: LedgerEntryExt::V0,
        }
    }

    fn make_account_key(byte: u8) -> LedgerKey {
        LedgerKey::Account(LedgerKeyAccount {
            account_id: make_account_id(byte),
        })
    }

    fn make_pool_entry(pool_byte: u8, asset_a: Asset, asset_b: Asset) -> LedgerEntry {
        LedgerEntry {
            last_modified_ledger_seq: 1,
            data: LedgerEntryData::LiquidityPool(LiquidityPoolEntry {
                liquidity_pool_id: PoolId(Hash([pool_byte; 32])),
                body: LiquidityPoolEntryBody::LiquidityPoolConstantProduct(
                    LiquidityPoolEntryConstantProduct {
                        params: LiquidityPoolConstantProductParameters {
                            asset_a,
                            asset_b,
                            fee: 30,
                        },
                        reserve_a: 1000,
                        reserve_b: 1000,
                        total_pool_shares: 100,
                        pool_shares_trust_line_count: 1,
                    },
                ),
            }),
            ext: LedgerEntryExt::V0,
        }
    }

    fn usd_asset() -> Asset {
        Asset::CreditAlphanum4(AlphaNum4 {
            asset_code: AssetCode4(*b"USD\0"),
            issuer: make_account_id(99),
        })
    }

    // Write a bucket containing the given sorted entries and return the
    // adopted file's path.
    fn write_bucket_file(dir: &Path, entries: Vec<BucketEntry>) -> std::path::PathBuf {
        let manager = crate::BucketManager::new(dir.join("buckets")).unwrap();
        let meta = BucketMetadata {
            ledger_version: 25,
            ext: BucketMetadataExt::V0,
        };
        let counters = Arc::new(MergeCounters::new());
        let mut writer = BucketOutputIterator::new(
            manager.tmp_dir(),
            BucketKind::Live,
            true,
            meta,
            counters,
            false,
        )
        .unwrap();
        for entry in entries {
            writer.put(entry).unwrap();
        }
        let bucket = writer.finalize(&manager, false, None).unwrap();
        bucket.path().unwrap().to_path_buf()
    }

    fn seed() -> HashSeed {
        [7u8; 16]
    }

    fn individual_config() -> BucketIndexConfig {
        BucketIndexConfig::default()
    }

    fn paged_config() -> BucketIndexConfig {
        // Cutoff 0 forces the page-based flavor even for tiny files.
        BucketIndexConfig {
            index_cutoff_mb: 0,
            page_size_exponent: 8,
        }
    }

    #[test]
    fn test_individual_index_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let entries: Vec<BucketEntry> = (0..10u8)
            .map(|i| BucketEntry::Live(make_account_entry(i)))
            .collect();
        let path = write_bucket_file(dir.path(), entries);

        let index =
            BucketIndex::build(&path, BucketKind::Live, &individual_config(), &seed()).unwrap();
        assert_eq!(index.page_size(), 0);
        assert_eq!(index.len(), 10);

        for i in 0..10u8 {
            assert!(index.lookup(&make_account_key(i)).is_some());
        }
        assert!(index.lookup(&make_account_key(100)).is_none());
    }

    #[test]
    fn test_paged_index_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let entries: Vec<BucketEntry> = (0..50u8)
            .map(|i| BucketEntry::Live(make_account_entry(i)))
            .collect();
        let path = write_bucket_file(dir.path(), entries);

        let index = BucketIndex::build(&path, BucketKind::Live, &paged_config(), &seed()).unwrap();
        assert_eq!(index.page_size(), 256);

        for i in 0..50u8 {
            assert!(
                index.lookup(&make_account_key(i)).is_some(),
                "key {} should land in a page",
                i
            );
        }
        assert!(index.lookup(&make_account_key(200)).is_none());
    }

    #[test]
    fn test_scan_cursor_advances_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let entries: Vec<BucketEntry> = (0..20u8)
            .map(|i| BucketEntry::Live(make_account_entry(i * 2)))
            .collect();
        let path = write_bucket_file(dir.path(), entries);
        let index =
            BucketIndex::build(&path, BucketKind::Live, &individual_config(), &seed()).unwrap();

        let mut cursor = IndexCursor::default();
        // Present key, absent key, later present key.
        let (off, c) = index.scan(cursor, &make_account_key(4));
        assert!(off.is_some());
        cursor = c;

        let (off, c) = index.scan(cursor, &make_account_key(5));
        assert!(off.is_none());
        cursor = c;

        let (off, _) = index.scan(cursor, &make_account_key(6));
        assert!(off.is_some());
    }

    #[test]
    fn test_bloom_miss_counter() {
        let dir = tempfile::tempdir().unwrap();
        let entries: Vec<BucketEntry> = (0..10u8)
            .map(|i| BucketEntry::Live(make_account_entry(i)))
            .collect();
        let path = write_bucket_file(dir.path(), entries);
        let index =
            BucketIndex::build(&path, BucketKind::Live, &individual_config(), &seed()).unwrap();

        assert_eq!(index.bloom_misses(), 0);
        // Probe many absent keys; nearly all should be definitive bloom
        // misses (false positive rate ~1/65536).
        for i in 100..140u8 {
            index.lookup(&make_account_key(i));
        }
        assert!(index.bloom_misses() >= 35);
    }

    #[test]
    fn test_pool_id_reverse_index() {
        let dir = tempfile::tempdir().unwrap();
        let usd = usd_asset();
        let entries = vec![
            BucketEntry::Live(make_pool_entry(1, Asset::Native, usd.clone())),
            BucketEntry::Live(make_pool_entry(2, Asset::Native, usd.clone())),
        ];
        let path = write_bucket_file(dir.path(), entries);
        let index =
            BucketIndex::build(&path, BucketKind::Live, &individual_config(), &seed()).unwrap();

        let native_pools = index.get_pool_ids_by_asset(&Asset::Native);
        assert_eq!(native_pools.len(), 2);
        let usd_pools = index.get_pool_ids_by_asset(&usd);
        assert_eq!(usd_pools.len(), 2);

        let other = Asset::CreditAlphanum4(AlphaNum4 {
            asset_code: AssetCode4(*b"EUR\0"),
            issuer: make_account_id(98),
        });
        assert!(index.get_pool_ids_by_asset(&other).is_empty());
    }

    #[test]
    fn test_paged_scan_finds_page() {
        let dir = tempfile::tempdir().unwrap();
        let entries: Vec<BucketEntry> = (0..50u8)
            .map(|i| BucketEntry::Live(make_account_entry(i)))
            .collect();
        let path = write_bucket_file(dir.path(), entries);
        let index = BucketIndex::build(&path, BucketKind::Live, &paged_config(), &seed()).unwrap();

        let mut cursor = IndexCursor::default();
        for i in [3u8, 17, 42] {
            let (off, c) = index.scan(cursor, &make_account_key(i));
            assert!(off.is_some(), "key {} should be found via scan", i);
            cursor = c;
        }
    }
}
