//! Bucket storage core for the meridian ledger node.
//!
//! Ledger state is persisted as a sequence of sorted, immutable,
//! content-addressed files ("buckets") organized into a fixed-height list
//! of levels, LSM-style. This crate provides:
//!
//! - The bucket entry model and on-disk record codec ([`BucketEntry`],
//!   XDR with record marks, hashed as written)
//! - Streaming readers and writers ([`BucketInputIterator`],
//!   [`BucketOutputIterator`]); the writer applies the level-dependent
//!   rewrite rules (tombstone elision, live-to-init conversion, meta
//!   framing, deduplication)
//! - Per-bucket indexing with bloom-filter support and an asset→pool
//!   reverse index ([`BucketIndex`])
//! - The [`BucketList`] level structure and the pairwise streaming merge
//!   that maintains it
//! - Immutable snapshots and the shadow-aware query engine
//!   ([`SearchableBucketListSnapshot`]) with per-transaction read
//!   metering
//!
//! # Structure
//!
//! The bucket list has 11 levels (0-10), each holding two buckets:
//! `curr` accumulates recent merges, `snap` is the material scheduled to
//! spill into the next level. Lower levels update more often; higher
//! levels hold older data. Queries walk newest-to-oldest, `curr` then
//! `snap`, so a newer record shadows any older record with the same key.
//!
//! # Entry types
//!
//! Live buckets hold `METAENTRY` / `INITENTRY` / `LIVEENTRY` / `DEADENTRY`
//! records; hot-archive buckets hold `HOT_ARCHIVE_METAENTRY` /
//! `HOT_ARCHIVE_ARCHIVED` / `HOT_ARCHIVE_LIVE`. Both forms share one
//! writer whose validation rules fork on the variant tag.
//!
//! # Immutability and sharing
//!
//! A bucket is never edited after adoption; it is shared by reference
//! count between the bucket list, in-flight merges, and any number of
//! snapshots. The [`BucketManager`] is the authoritative registry mapping
//! content hash to bucket handle.

mod bloom_filter;
mod bucket;
mod bucket_list;
mod entry;
mod index;
mod iterator;
mod manager;
mod merge;
mod meter;
mod metrics;
pub mod snapshot;

mod error;

pub use bloom_filter::{BucketBloomFilter, HashSeed, HASH_KEY_BYTES};
pub use bucket::Bucket;
pub use bucket_list::{
    level_half, level_should_spill, level_size, BucketLevel, BucketList, BUCKET_LIST_LEVELS,
};
pub use entry::{
    compare_entries, compare_keys, is_soroban_entry, is_soroban_key, ledger_entry_to_key,
    xdr_size, BucketEntry, BucketKind,
};
pub use error::BucketError;
pub use index::{AssetPoolIdMap, BucketIndex, IndexCursor};
pub use iterator::{BucketInputIterator, BucketOutputIterator};
pub use manager::{BucketManager, MergeKey};
pub use merge::merge_buckets;
pub use meter::{LedgerKeyMeter, TxReadMeter};
pub use metrics::{
    MergeCounters, MergeCountersSnapshot, QueryMetrics, QueryMetricsSnapshot, TimerScope,
};
pub use snapshot::{
    BucketLevelSnapshot, BucketListSnapshot, BucketSnapshot, BucketSnapshotManager,
    InflationWinner, SearchableBucketListSnapshot,
};

use meridian_common::protocol::ProtocolVersion;

/// First protocol version supporting INITENTRY and METAENTRY (CAP-0020).
pub const FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY: ProtocolVersion =
    ProtocolVersion::V11;

/// First protocol version supporting persistent eviction and hot archive
/// buckets.
pub const FIRST_PROTOCOL_SUPPORTING_PERSISTENT_EVICTION: ProtocolVersion = ProtocolVersion::V23;

/// First protocol version converting bottom-level LIVEENTRY records to
/// INITENTRY. At the bottom level there is no older bucket, so every live
/// entry is by definition initial (CAP-0020).
pub const FIRST_PROTOCOL_CONVERTING_BOTTOM_LEVEL_LIVE_TO_INIT: ProtocolVersion =
    ProtocolVersion::V23;

/// Result type for bucket operations.
pub type Result<T> = std::result::Result<T, BucketError>;
