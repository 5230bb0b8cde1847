//! Streaming bucket iterators.
//!
//! - [`BucketInputIterator`]: sequential reader over a bucket file, used
//!   by merges, index construction, and full scans.
//! - [`BucketOutputIterator`]: the central merge writer. Absorbs entries
//!   in sorted order, applies the level-dependent rewrite rules, hashes
//!   every byte as it is written, and finalizes into an adopted bucket.
//!
//! Both hold one record at a time; bucket size never affects memory use.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use stellar_xdr::curr::{
    BucketEntry as XdrBucketEntry, BucketMetadata, HotArchiveBucketEntry,
};

use meridian_common::protocol::protocol_version_starts_from;
use meridian_common::{Hash256, XdrInputFileStream, XdrOutputFileStream};

use crate::entry::{
    compare_entries, is_soroban_entry, is_soroban_key, BucketEntry, BucketKind, WireEntry,
};
use crate::index::BucketIndex;
use crate::manager::{random_bucket_path, BucketManager, MergeKey};
use crate::metrics::MergeCounters;
use crate::{
    Bucket, BucketError, Result, FIRST_PROTOCOL_CONVERTING_BOTTOM_LEVEL_LIVE_TO_INIT,
    FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY,
    FIRST_PROTOCOL_SUPPORTING_PERSISTENT_EVICTION,
};

// ============================================================================
// Bucket input iterator
// ============================================================================

/// A streaming reader over the records of a bucket file, in on-disk order.
///
/// The underlying file is opened lazily on the first advance. A leading
/// META record is absorbed into [`metadata`](Self::metadata) and never
/// yielded; exhaustion is signaled by `Ok(None)`, not an error.
pub struct BucketInputIterator {
    path: Option<PathBuf>,
    kind: BucketKind,
    stream: Option<XdrInputFileStream>,
    started: bool,
    current: Option<BucketEntry>,
    current_offset: u64,
    metadata: Option<BucketMetadata>,
    seen_metadata: bool,
    seen_other_entries: bool,
    entries_read: u64,
}

impl BucketInputIterator {
    /// Iterate over the bucket file at `path`.
    pub fn open(path: PathBuf, kind: BucketKind) -> Self {
        Self {
            path: Some(path),
            kind,
            stream: None,
            started: false,
            current: None,
            current_offset: 0,
            metadata: None,
            seen_metadata: false,
            seen_other_entries: false,
            entries_read: 0,
        }
    }

    /// An iterator over no records (the empty bucket).
    pub fn empty(kind: BucketKind) -> Self {
        Self {
            path: None,
            ..Self::open(PathBuf::new(), kind)
        }
    }

    /// Iterate over a bucket's records; empty buckets yield nothing.
    pub fn for_bucket(bucket: &Bucket) -> Self {
        match bucket.path() {
            Some(path) => Self::open(path.to_path_buf(), bucket.kind()),
            None => Self::empty(bucket.kind()),
        }
    }

    /// Open the file and position on the first data record, if not done
    /// yet. Idempotent.
    pub fn ensure_loaded(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        if let Some(path) = &self.path {
            self.stream = Some(XdrInputFileStream::open(path)?);
            self.load_entry()?;
        }
        Ok(())
    }

    fn load_entry(&mut self) -> Result<()> {
        let stream = match &mut self.stream {
            Some(stream) => stream,
            None => {
                self.current = None;
                return Ok(());
            }
        };

        loop {
            let offset = stream.pos();
            let entry = match self.kind {
                BucketKind::Live => stream
                    .read_one::<XdrBucketEntry>()?
                    .map(BucketEntry::from_live_wire),
                BucketKind::HotArchive => stream
                    .read_one::<HotArchiveBucketEntry>()?
                    .map(BucketEntry::from_hot_archive_wire),
            };

            match entry {
                None => {
                    self.current = None;
                    return Ok(());
                }
                Some(entry) if entry.is_metadata() => {
                    if self.seen_metadata {
                        return Err(BucketError::Serialization(
                            "multiple META records in bucket".to_string(),
                        ));
                    }
                    if self.seen_other_entries {
                        return Err(BucketError::Serialization(
                            "META record must be the first record".to_string(),
                        ));
                    }
                    self.seen_metadata = true;
                    self.metadata = entry.metadata().cloned();
                }
                Some(entry) => {
                    self.seen_other_entries = true;
                    self.entries_read += 1;
                    self.current_offset = offset;
                    self.current = Some(entry);
                    return Ok(());
                }
            }
        }
    }

    /// The next record, or `Ok(None)` when the bucket is exhausted.
    pub fn next(&mut self) -> Result<Option<BucketEntry>> {
        Ok(self.next_with_offset()?.map(|(entry, _)| entry))
    }

    /// The next record together with the byte offset of its record mark,
    /// as used by index construction.
    pub fn next_with_offset(&mut self) -> Result<Option<(BucketEntry, u64)>> {
        self.ensure_loaded()?;
        let current = self.current.take();
        match current {
            Some(entry) => {
                let offset = self.current_offset;
                self.load_entry()?;
                Ok(Some((entry, offset)))
            }
            None => Ok(None),
        }
    }

    /// The current record without advancing. `None` before the first
    /// [`ensure_loaded`](Self::ensure_loaded) or after exhaustion.
    pub fn peek(&self) -> Option<&BucketEntry> {
        self.current.as_ref()
    }

    /// Whether a META record has been absorbed.
    pub fn seen_metadata(&self) -> bool {
        self.seen_metadata
    }

    /// The bucket's metadata, if the file carried a META record.
    pub fn metadata(&self) -> Option<&BucketMetadata> {
        self.metadata.as_ref()
    }

    /// Number of data records read so far.
    pub fn entries_read(&self) -> u64 {
        self.entries_read
    }
}

impl std::fmt::Debug for BucketInputIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketInputIterator")
            .field("path", &self.path)
            .field("entries_read", &self.entries_read)
            .field("has_current", &self.current.is_some())
            .finish()
    }
}

// ============================================================================
// Bucket output iterator
// ============================================================================

/// Streaming writer that absorbs sorted bucket entries into a temporary
/// file and produces an adopted [`Bucket`] on finalize.
///
/// # Contract
///
/// [`put`](Self::put) must be called in non-decreasing key order; ties
/// mean "same identity, replace". The iterator applies, in order:
///
/// 1. META framing: a single META record emitted at construction when the
///    protocol supports it. Caller-supplied META records are rejected.
/// 2. Tombstone elision when `keep_tombstones` is false (bottom level).
/// 3. Deduplication through a one-entry buffer: an equal-identity record
///    replaces the buffer, a greater one flushes it.
/// 4. Bottom-level LIVEENTRY→INITENTRY rewrite when the protocol version
///    is at or past the conversion floor.
///
/// A writer that produced zero data records deletes its file and returns
/// the empty-bucket sentinel, notifying the manager when the output was a
/// memoizable merge.
pub struct BucketOutputIterator {
    filename: PathBuf,
    out: Option<XdrOutputFileStream>,
    kind: BucketKind,
    keep_tombstones: bool,
    meta: BucketMetadata,
    put_meta: bool,
    buf: Option<BucketEntry>,
    hasher: Sha256,
    objects_put: u64,
    bytes_put: u64,
    counters: Arc<MergeCounters>,
    finalized: bool,
}

impl BucketOutputIterator {
    /// Open a writer on a fresh random temp file in `tmp_dir`.
    ///
    /// `keep_tombstones` is false only for the bottom level of a bucket
    /// list. `meta.ledger_version` gates META framing and the rewrite
    /// rules; a hot-archive writer below the hot-archive protocol floor
    /// is a protocol violation.
    pub fn new(
        tmp_dir: &Path,
        kind: BucketKind,
        keep_tombstones: bool,
        meta: BucketMetadata,
        counters: Arc<MergeCounters>,
        do_fsync: bool,
    ) -> Result<Self> {
        let filename = random_bucket_path(tmp_dir);
        tracing::trace!(file = %filename.display(), "opening bucket output file");
        let out = XdrOutputFileStream::open(&filename, do_fsync)?;

        let mut iter = Self {
            filename,
            out: Some(out),
            kind,
            keep_tombstones,
            meta,
            put_meta: false,
            buf: None,
            hasher: Sha256::new(),
            objects_put: 0,
            bytes_put: 0,
            counters,
            finalized: false,
        };

        if protocol_version_starts_from(
            iter.meta.ledger_version,
            FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY,
        ) {
            if iter.kind == BucketKind::HotArchive
                && !protocol_version_starts_from(
                    iter.meta.ledger_version,
                    FIRST_PROTOCOL_SUPPORTING_PERSISTENT_EVICTION,
                )
            {
                return Err(BucketError::ProtocolViolation(format!(
                    "hot archive bucket requires protocol {}, got {}",
                    FIRST_PROTOCOL_SUPPORTING_PERSISTENT_EVICTION.as_u32(),
                    iter.meta.ledger_version
                )));
            }
            iter.write_metadata()?;
            iter.put_meta = true;
        }

        Ok(iter)
    }

    // The META record bypasses the dedup buffer and the data-record
    // counters: the empty-output check is over data records only.
    fn write_metadata(&mut self) -> Result<()> {
        let entry = match self.kind {
            BucketKind::Live => BucketEntry::Metadata(self.meta.clone()),
            BucketKind::HotArchive => BucketEntry::HotArchiveMetadata(self.meta.clone()),
        };
        let out = self.out.as_mut().expect("stream open");
        match entry.to_wire() {
            WireEntry::Live(wire) => out.write_one(&wire, Some(&mut self.hasher), None)?,
            WireEntry::HotArchive(wire) => out.write_one(&wire, Some(&mut self.hasher), None)?,
        }
        Ok(())
    }

    fn write_record(&mut self, entry: &BucketEntry) -> Result<()> {
        let out = self.out.as_mut().expect("stream open");
        match entry.to_wire() {
            WireEntry::Live(wire) => {
                out.write_one(&wire, Some(&mut self.hasher), Some(&mut self.bytes_put))?
            }
            WireEntry::HotArchive(wire) => {
                out.write_one(&wire, Some(&mut self.hasher), Some(&mut self.bytes_put))?
            }
        }
        self.objects_put += 1;
        self.counters.record_actual_write();
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if let Some(entry) = self.buf.take() {
            self.write_record(&entry)?;
        }
        Ok(())
    }

    fn check_protocol_legality(&self, entry: &BucketEntry) -> Result<()> {
        if entry.kind() != self.kind {
            return Err(BucketError::ProtocolViolation(
                "entry form does not match bucket kind".to_string(),
            ));
        }

        match entry {
            BucketEntry::Metadata(_) | BucketEntry::HotArchiveMetadata(_) => {
                // The iterator owns META framing; any caller-supplied
                // META record is late or illegal.
                Err(BucketError::ProtocolViolation(
                    "putting META record in bucket after initial record".to_string(),
                ))
            }
            BucketEntry::Init(_)
                if !protocol_version_starts_from(
                    self.meta.ledger_version,
                    FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY,
                ) =>
            {
                Err(BucketError::ProtocolViolation(format!(
                    "INITENTRY not supported before protocol {}",
                    FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY.as_u32()
                )))
            }
            BucketEntry::HotArchiveArchived(entry) if !is_soroban_entry(entry) => {
                Err(BucketError::ProtocolViolation(
                    "putting non-soroban entry in hot archive bucket".to_string(),
                ))
            }
            BucketEntry::HotArchiveLive(key) if !is_soroban_key(key) => {
                Err(BucketError::ProtocolViolation(
                    "putting non-soroban key in hot archive bucket".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Absorb one entry. Entries must arrive in non-decreasing key order;
    /// a strict decrease is a protocol violation and the writer must be
    /// discarded.
    pub fn put(&mut self, entry: BucketEntry) -> Result<()> {
        self.check_protocol_legality(&entry)?;

        if !self.keep_tombstones && entry.is_tombstone() {
            self.counters.record_tombstone_elision();
            return Ok(());
        }

        let mut replaced = false;
        if let Some(buffered) = &self.buf {
            match compare_entries(buffered, &entry) {
                std::cmp::Ordering::Less => {
                    // Greater identity: the buffered record is final.
                    self.flush_buffer()?;
                }
                std::cmp::Ordering::Equal => {
                    replaced = true;
                }
                std::cmp::Ordering::Greater => {
                    return Err(BucketError::ProtocolViolation(
                        "entries put to bucket writer out of order".to_string(),
                    ));
                }
            }
        }

        // At the bottom level there is no older bucket, so every live
        // entry is by definition initial (CAP-0020).
        let entry = if self.kind == BucketKind::Live
            && !self.keep_tombstones
            && entry.is_live()
            && protocol_version_starts_from(
                self.meta.ledger_version,
                FIRST_PROTOCOL_CONVERTING_BOTTOM_LEVEL_LIVE_TO_INIT,
            ) {
            self.counters.record_live_to_init_rewrite();
            match entry {
                BucketEntry::Live(inner) => BucketEntry::Init(inner),
                _ => unreachable!(),
            }
        } else {
            entry
        };

        if replaced {
            self.counters.record_buffer_update();
        }
        self.buf = Some(entry);
        Ok(())
    }

    /// Number of data records flushed to disk so far.
    pub fn entries_written(&self) -> u64 {
        self.objects_put
    }

    /// Number of data bytes written so far (META framing excluded).
    pub fn bytes_written(&self) -> u64 {
        self.bytes_put
    }

    /// The temporary file this writer is producing.
    pub fn path(&self) -> &Path {
        &self.filename
    }

    /// Flush, close, hash, and adopt the finished bucket.
    ///
    /// With `index_now` set the bucket is indexed synchronously unless the
    /// manager already holds an indexed bucket under the same hash. A
    /// writer that produced no data records deletes its file, memoizes the
    /// empty merge when `merge_key` is supplied, and returns the
    /// empty-bucket sentinel.
    pub fn finalize(
        mut self,
        manager: &BucketManager,
        index_now: bool,
        merge_key: Option<&MergeKey>,
    ) -> Result<Arc<Bucket>> {
        self.flush_buffer()?;
        let out = self.out.take().expect("stream open");
        out.close()?;

        if self.objects_put == 0 || self.bytes_put == 0 {
            if self.objects_put != 0 || self.bytes_put != 0 {
                return Err(BucketError::ProtocolViolation(format!(
                    "inconsistent empty output: {} records, {} bytes",
                    self.objects_put, self.bytes_put
                )));
            }
            tracing::debug!(file = %self.filename.display(), "deleting empty bucket file");
            std::fs::remove_file(&self.filename)?;
            self.finalized = true;
            if let Some(merge_key) = merge_key {
                manager.note_empty_merge_output(merge_key);
            }
            return Ok(Arc::new(Bucket::empty(self.kind)));
        }

        let hash = Hash256::from_digest(std::mem::take(&mut self.hasher));

        // Either this is a new bucket or we just reconstructed one we
        // already have; only build an index when no indexed copy exists.
        let index = if index_now {
            match manager.get_bucket_if_exists(&hash) {
                Some(existing) if existing.is_indexed() => None,
                _ => Some(BucketIndex::build(
                    &self.filename,
                    self.kind,
                    manager.index_config(),
                    manager.bloom_seed(),
                )?),
            }
        } else {
            None
        };

        let bucket =
            manager.adopt_file_as_bucket(&self.filename, hash, self.kind, merge_key, index)?;
        self.finalized = true;
        Ok(bucket)
    }
}

impl Drop for BucketOutputIterator {
    fn drop(&mut self) {
        // A writer abandoned before adoption leaves no stale file behind.
        if !self.finalized {
            let _ = std::fs::remove_file(&self.filename);
        }
    }
}

impl std::fmt::Debug for BucketOutputIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketOutputIterator")
            .field("filename", &self.filename)
            .field("kind", &self.kind)
            .field("entries_written", &self.objects_put)
            .field("bytes_written", &self.bytes_put)
            .field("has_buffer", &self.buf.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BucketEntry; // Shadow the XDR union of the same name.
    use stellar_xdr::curr::*;

    fn make_account_id(bytes: [u8; 32]) -> AccountId {
        AccountId(PublicKey::PublicKeyTypeEd25519(Uint256(bytes)))
    }

    fn make_account_entry(bytes: [u8; 32], balance: i64) -> LedgerEntry {
        LedgerEntry {
            last_modified_ledger_seq: 1,
            data: LedgerEntryData::Account(AccountEntry {
                account_id: make_account_id(bytes),
                balance,
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

    fn make_account_key(bytes: [u8; 32]) -> LedgerKey {
        LedgerKey::Account(LedgerKeyAccount {
            account_id: make_account_id(bytes),
        })
    }

    fn make_contract_code_entry(seed: u8) -> LedgerEntry {
        LedgerEntry {
            last_modified_ledger_seq: 1,
            data: LedgerEntryData::ContractCode(ContractCodeEntry {
                ext: ContractCodeEntryExt::V0,
                hash: Hash([seed; 32]),
                code: vec![0u8; 32].try_into().unwrap(),
            }),
            ext: LedgerEntryExt::V0,
        }
    }

    fn make_meta(version: u32) -> BucketMetadata {
        BucketMetadata {
            ledger_version: version,
            ext: BucketMetadataExt::V0,
        }
    }

    fn make_writer(
        manager: &BucketManager,
        kind: BucketKind,
        keep_tombstones: bool,
        version: u32,
    ) -> (BucketOutputIterator, Arc<MergeCounters>) {
        let counters = Arc::new(MergeCounters::new());
        let writer = BucketOutputIterator::new(
            manager.tmp_dir(),
            kind,
            keep_tombstones,
            make_meta(version),
            Arc::clone(&counters),
            false,
        )
        .unwrap();
        (writer, counters)
    }

    fn collect_bucket(bucket: &Bucket) -> Vec<BucketEntry> {
        let mut iter = BucketInputIterator::for_bucket(bucket);
        let mut entries = Vec::new();
        while let Some(entry) = iter.next().unwrap() {
            entries.push(entry);
        }
        entries
    }

    #[test]
    fn test_dedup_later_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();
        // Pre-meta protocol so only data records land in the file.
        let (mut writer, counters) = make_writer(&manager, BucketKind::Live, true, 10);

        writer
            .put(BucketEntry::Live(make_account_entry([1u8; 32], 100)))
            .unwrap();
        writer
            .put(BucketEntry::Live(make_account_entry([1u8; 32], 200)))
            .unwrap();
        writer
            .put(BucketEntry::Live(make_account_entry([2u8; 32], 300)))
            .unwrap();

        let bucket = writer.finalize(&manager, false, None).unwrap();
        let entries = collect_bucket(&bucket);
        assert_eq!(entries.len(), 2);

        if let BucketEntry::Live(le) = &entries[0] {
            if let LedgerEntryData::Account(acc) = &le.data {
                assert_eq!(acc.balance, 200, "later writer must win");
            }
        } else {
            panic!("expected live entry");
        }

        let snap = counters.snapshot();
        assert_eq!(snap.actual_writes, 2);
        assert_eq!(snap.buffer_updates, 1);
    }

    #[test]
    fn test_bottom_level_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();
        let (mut writer, counters) = make_writer(&manager, BucketKind::Live, false, 25);

        writer
            .put(BucketEntry::Live(make_account_entry([1u8; 32], 100)))
            .unwrap();
        writer
            .put(BucketEntry::Dead(make_account_key([2u8; 32])))
            .unwrap();

        let bucket = writer.finalize(&manager, false, None).unwrap();
        let entries = collect_bucket(&bucket);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_init(), "LIVE must become INIT at the bottom");

        let snap = counters.snapshot();
        assert_eq!(snap.tombstone_elisions, 1);
        assert_eq!(snap.live_to_init_rewrites, 1);
    }

    #[test]
    fn test_no_conversion_before_floor() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();
        let (mut writer, counters) = make_writer(&manager, BucketKind::Live, false, 20);

        writer
            .put(BucketEntry::Live(make_account_entry([1u8; 32], 100)))
            .unwrap();

        let bucket = writer.finalize(&manager, false, None).unwrap();
        let entries = collect_bucket(&bucket);
        assert!(entries[0].is_live(), "no rewrite before the version floor");
        assert_eq!(counters.snapshot().live_to_init_rewrites, 0);
    }

    #[test]
    fn test_meta_framing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();
        let (mut writer, _) = make_writer(&manager, BucketKind::Live, true, 25);

        writer
            .put(BucketEntry::Live(make_account_entry([1u8; 32], 100)))
            .unwrap();
        let bucket = writer.finalize(&manager, false, None).unwrap();

        let mut iter = BucketInputIterator::for_bucket(&bucket);
        iter.ensure_loaded().unwrap();
        assert!(iter.seen_metadata());
        assert_eq!(iter.metadata().unwrap().ledger_version, 25);
    }

    #[test]
    fn test_no_meta_before_protocol_11() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();
        let (mut writer, _) = make_writer(&manager, BucketKind::Live, true, 10);

        writer
            .put(BucketEntry::Live(make_account_entry([1u8; 32], 100)))
            .unwrap();
        let bucket = writer.finalize(&manager, false, None).unwrap();

        let mut iter = BucketInputIterator::for_bucket(&bucket);
        iter.ensure_loaded().unwrap();
        assert!(!iter.seen_metadata());
    }

    #[test]
    fn test_late_meta_is_protocol_violation() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();
        let (mut writer, _) = make_writer(&manager, BucketKind::Live, true, 25);

        let err = writer
            .put(BucketEntry::Metadata(make_meta(25)))
            .unwrap_err();
        assert!(matches!(err, BucketError::ProtocolViolation(_)));
    }

    #[test]
    fn test_out_of_order_is_protocol_violation() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();
        let (mut writer, _) = make_writer(&manager, BucketKind::Live, true, 25);

        writer
            .put(BucketEntry::Live(make_account_entry([5u8; 32], 100)))
            .unwrap();
        let err = writer
            .put(BucketEntry::Live(make_account_entry([1u8; 32], 100)))
            .unwrap_err();
        assert!(matches!(err, BucketError::ProtocolViolation(_)));
    }

    #[test]
    fn test_init_entry_illegal_before_protocol_11() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();
        let (mut writer, _) = make_writer(&manager, BucketKind::Live, true, 10);

        let err = writer
            .put(BucketEntry::Init(make_account_entry([1u8; 32], 100)))
            .unwrap_err();
        assert!(matches!(err, BucketError::ProtocolViolation(_)));
    }

    #[test]
    fn test_hot_archive_rejects_non_soroban() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();
        let (mut writer, _) = make_writer(&manager, BucketKind::HotArchive, true, 25);

        let err = writer
            .put(BucketEntry::HotArchiveArchived(make_account_entry(
                [1u8; 32],
                100,
            )))
            .unwrap_err();
        assert!(matches!(err, BucketError::ProtocolViolation(_)));

        let err = writer
            .put(BucketEntry::HotArchiveLive(make_account_key([1u8; 32])))
            .unwrap_err();
        assert!(matches!(err, BucketError::ProtocolViolation(_)));
    }

    #[test]
    fn test_hot_archive_requires_protocol_floor() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();
        let counters = Arc::new(MergeCounters::new());
        let err = BucketOutputIterator::new(
            manager.tmp_dir(),
            BucketKind::HotArchive,
            true,
            make_meta(22),
            counters,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, BucketError::ProtocolViolation(_)));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();
        let (mut writer, _) = make_writer(&manager, BucketKind::Live, true, 25);

        let err = writer
            .put(BucketEntry::HotArchiveArchived(make_contract_code_entry(1)))
            .unwrap_err();
        assert!(matches!(err, BucketError::ProtocolViolation(_)));
    }

    #[test]
    fn test_hot_archive_accepts_soroban_and_elides_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();
        let (mut writer, counters) = make_writer(&manager, BucketKind::HotArchive, false, 25);

        writer
            .put(BucketEntry::HotArchiveArchived(make_contract_code_entry(1)))
            .unwrap();
        writer
            .put(BucketEntry::HotArchiveLive(LedgerKey::ContractCode(
                LedgerKeyContractCode {
                    hash: Hash([2u8; 32]),
                },
            )))
            .unwrap();

        let bucket = writer.finalize(&manager, false, None).unwrap();
        let entries = collect_bucket(&bucket);
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0], BucketEntry::HotArchiveArchived(_)));
        assert_eq!(counters.snapshot().tombstone_elisions, 1);
    }

    #[test]
    fn test_empty_output_returns_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();
        let (writer, _) = make_writer(&manager, BucketKind::Live, true, 25);
        let temp_path = writer.path().to_path_buf();

        let merge_key = MergeKey {
            keep_tombstones: true,
            input_curr: Hash256::hash(b"curr"),
            input_snap: Hash256::hash(b"snap"),
        };
        let bucket = writer.finalize(&manager, false, Some(&merge_key)).unwrap();

        assert!(bucket.is_empty());
        assert!(bucket.hash().is_zero());
        assert!(!temp_path.exists(), "empty bucket file must not persist");
        assert!(manager.is_known_empty_merge(&merge_key));
    }

    #[test]
    fn test_all_tombstones_elided_is_empty_output() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();
        let (mut writer, _) = make_writer(&manager, BucketKind::Live, false, 25);

        writer
            .put(BucketEntry::Dead(make_account_key([1u8; 32])))
            .unwrap();
        writer
            .put(BucketEntry::Dead(make_account_key([2u8; 32])))
            .unwrap();

        let bucket = writer.finalize(&manager, false, None).unwrap();
        assert!(bucket.is_empty());
    }

    #[test]
    fn test_hash_stability() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();

        let produce = |manager: &BucketManager| {
            let (mut writer, _) = make_writer(manager, BucketKind::Live, true, 25);
            for i in 1..=5u8 {
                writer
                    .put(BucketEntry::Live(make_account_entry([i; 32], i as i64)))
                    .unwrap();
            }
            writer.finalize(manager, false, None).unwrap()
        };

        let first = produce(&manager);
        let second = produce(&manager);
        assert_eq!(first.hash(), second.hash());
        // Idempotent adoption: same hash aliases the same bucket.
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_hash_matches_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();
        let (mut writer, _) = make_writer(&manager, BucketKind::Live, true, 25);
        writer
            .put(BucketEntry::Live(make_account_entry([1u8; 32], 100)))
            .unwrap();
        let bucket = writer.finalize(&manager, false, None).unwrap();

        let file_bytes = std::fs::read(bucket.path().unwrap()).unwrap();
        assert_eq!(bucket.hash(), Hash256::hash(&file_bytes));
    }

    #[test]
    fn test_dropped_writer_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();
        let (mut writer, _) = make_writer(&manager, BucketKind::Live, true, 25);
        writer
            .put(BucketEntry::Live(make_account_entry([1u8; 32], 100)))
            .unwrap();
        let temp_path = writer.path().to_path_buf();
        drop(writer);
        assert!(!temp_path.exists());
    }

    #[test]
    fn test_input_iterator_offsets_are_seekable() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();
        let (mut writer, _) = make_writer(&manager, BucketKind::Live, true, 25);
        for i in 1..=4u8 {
            writer
                .put(BucketEntry::Live(make_account_entry([i; 32], i as i64)))
                .unwrap();
        }
        let bucket = writer.finalize(&manager, false, None).unwrap();

        // Collect offsets, then re-read the third record by seeking.
        let mut iter = BucketInputIterator::for_bucket(&bucket);
        let mut offsets = Vec::new();
        while let Some((_, offset)) = iter.next_with_offset().unwrap() {
            offsets.push(offset);
        }
        assert_eq!(offsets.len(), 4);

        let mut stream = XdrInputFileStream::open(bucket.path().unwrap()).unwrap();
        stream.seek(offsets[2]).unwrap();
        let wire: XdrBucketEntry = stream.read_one().unwrap().unwrap();
        let entry = BucketEntry::from_live_wire(wire);
        assert_eq!(entry.key().unwrap(), make_account_key([3u8; 32]));
    }

    #[test]
    fn test_input_iterator_empty_bucket() {
        let mut iter = BucketInputIterator::empty(BucketKind::Live);
        assert!(iter.next().unwrap().is_none());
        assert!(!iter.seen_metadata());
    }
}
