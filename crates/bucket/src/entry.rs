//! Bucket entry model and key ordering.
//!
//! A [`BucketEntry`] is one record of a bucket file. Two families share
//! the type: live-bucket records (`Metadata` / `Init` / `Live` / `Dead`)
//! and hot-archive records (`HotArchiveMetadata` / `HotArchiveArchived` /
//! `HotArchiveLive`). The families never mix within one file; the writer
//! and reader fork on [`BucketKind`].
//!
//! # Key ordering
//!
//! Entries in a bucket are sorted by key. The ordering is entry-type
//! discriminant first (Account < Trustline < Offer < ...), then the
//! type-specific fields in XDR field order. [`compare_keys`] must produce
//! the same ordering as every other node or bucket hashes diverge.
//!
//! # Merge semantics (CAP-0020)
//!
//! | Old entry | New entry | Result                         |
//! |-----------|-----------|--------------------------------|
//! | `Init`    | `Dead`    | Nothing (both annihilated)     |
//! | `Dead`    | `Init`    | `Live` (recreation)            |
//! | `Init`    | `Live`    | `Init` with new value          |
//! | `Live`    | `Dead`    | `Dead` (if keeping tombstones) |
//! | `Live`    | `Live`    | Newer `Live` wins              |

use std::cmp::Ordering;

use stellar_xdr::curr::{
    BucketEntry as XdrBucketEntry, BucketMetadata, HotArchiveBucketEntry, LedgerEntry,
    LedgerEntryData, LedgerEntryType, LedgerKey, Limits, WriteXdr,
};

use crate::{BucketError, Result};

/// The two on-disk bucket forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    /// The live bucket list: current ledger state.
    Live,
    /// The hot archive bucket list: evicted persistent soroban state.
    HotArchive,
}

/// An entry stored in a bucket.
///
/// Live and hot-archive variants serialize through different XDR unions
/// (`BucketEntry` and `HotArchiveBucketEntry` respectively) but share the
/// writer, index, and iterator machinery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketEntry {
    /// Bucket metadata header (protocol version); unique first record.
    Metadata(BucketMetadata),
    /// A live entry known to have no predecessor in any older bucket.
    Init(LedgerEntry),
    /// A live ledger entry, predecessor status unknown.
    Live(LedgerEntry),
    /// A tombstone marking that this key has been deleted.
    Dead(LedgerKey),
    /// Hot-archive bucket metadata header.
    HotArchiveMetadata(BucketMetadata),
    /// An archived persistent soroban entry with its full payload.
    HotArchiveArchived(LedgerEntry),
    /// A marker that the key is no longer archived (restored to the live
    /// state); the hot-archive tombstone form.
    HotArchiveLive(LedgerKey),
}

/// Wire form of an entry, picking the XDR union by bucket kind.
pub(crate) enum WireEntry {
    Live(XdrBucketEntry),
    HotArchive(HotArchiveBucketEntry),
}

impl BucketEntry {
    /// The bucket form this entry belongs to.
    pub fn kind(&self) -> BucketKind {
        match self {
            BucketEntry::Metadata(_)
            | BucketEntry::Init(_)
            | BucketEntry::Live(_)
            | BucketEntry::Dead(_) => BucketKind::Live,
            BucketEntry::HotArchiveMetadata(_)
            | BucketEntry::HotArchiveArchived(_)
            | BucketEntry::HotArchiveLive(_) => BucketKind::HotArchive,
        }
    }

    /// Get the LedgerKey for this entry.
    ///
    /// Returns `None` for metadata entries since they don't have a key.
    pub fn key(&self) -> Option<LedgerKey> {
        match self {
            BucketEntry::Init(entry)
            | BucketEntry::Live(entry)
            | BucketEntry::HotArchiveArchived(entry) => Some(ledger_entry_to_key(entry)),
            BucketEntry::Dead(key) | BucketEntry::HotArchiveLive(key) => Some(key.clone()),
            BucketEntry::Metadata(_) | BucketEntry::HotArchiveMetadata(_) => None,
        }
    }

    /// Check if this entry is a metadata entry (either form).
    pub fn is_metadata(&self) -> bool {
        matches!(
            self,
            BucketEntry::Metadata(_) | BucketEntry::HotArchiveMetadata(_)
        )
    }

    /// Check if this entry is a tombstone (`Dead` in live buckets,
    /// `HotArchiveLive` in hot-archive buckets).
    pub fn is_tombstone(&self) -> bool {
        matches!(self, BucketEntry::Dead(_) | BucketEntry::HotArchiveLive(_))
    }

    /// Check if this is a live-form LIVEENTRY.
    pub fn is_live(&self) -> bool {
        matches!(self, BucketEntry::Live(_))
    }

    /// Check if this is a live-form INITENTRY.
    pub fn is_init(&self) -> bool {
        matches!(self, BucketEntry::Init(_))
    }

    /// Get the carried ledger entry, if any.
    pub fn as_ledger_entry(&self) -> Option<&LedgerEntry> {
        match self {
            BucketEntry::Init(entry)
            | BucketEntry::Live(entry)
            | BucketEntry::HotArchiveArchived(entry) => Some(entry),
            _ => None,
        }
    }

    /// Get the carried metadata, if any.
    pub fn metadata(&self) -> Option<&BucketMetadata> {
        match self {
            BucketEntry::Metadata(meta) | BucketEntry::HotArchiveMetadata(meta) => Some(meta),
            _ => None,
        }
    }

    /// Convert to the wire union matching this entry's kind.
    pub(crate) fn to_wire(&self) -> WireEntry {
        match self {
            BucketEntry::Metadata(meta) => {
                WireEntry::Live(XdrBucketEntry::Metaentry(meta.clone()))
            }
            BucketEntry::Init(entry) => WireEntry::Live(XdrBucketEntry::Initentry(entry.clone())),
            BucketEntry::Live(entry) => WireEntry::Live(XdrBucketEntry::Liveentry(entry.clone())),
            BucketEntry::Dead(key) => WireEntry::Live(XdrBucketEntry::Deadentry(key.clone())),
            BucketEntry::HotArchiveMetadata(meta) => {
                WireEntry::HotArchive(HotArchiveBucketEntry::Metaentry(meta.clone()))
            }
            BucketEntry::HotArchiveArchived(entry) => {
                WireEntry::HotArchive(HotArchiveBucketEntry::Archived(entry.clone()))
            }
            BucketEntry::HotArchiveLive(key) => {
                WireEntry::HotArchive(HotArchiveBucketEntry::Live(key.clone()))
            }
        }
    }

    /// Convert from the live-bucket wire union.
    pub(crate) fn from_live_wire(wire: XdrBucketEntry) -> Self {
        match wire {
            XdrBucketEntry::Metaentry(meta) => BucketEntry::Metadata(meta),
            XdrBucketEntry::Initentry(entry) => BucketEntry::Init(entry),
            XdrBucketEntry::Liveentry(entry) => BucketEntry::Live(entry),
            XdrBucketEntry::Deadentry(key) => BucketEntry::Dead(key),
        }
    }

    /// Convert from the hot-archive wire union.
    pub(crate) fn from_hot_archive_wire(wire: HotArchiveBucketEntry) -> Self {
        match wire {
            HotArchiveBucketEntry::Metaentry(meta) => BucketEntry::HotArchiveMetadata(meta),
            HotArchiveBucketEntry::Archived(entry) => BucketEntry::HotArchiveArchived(entry),
            HotArchiveBucketEntry::Live(key) => BucketEntry::HotArchiveLive(key),
        }
    }
}

/// Serialized XDR size of a value, in bytes.
///
/// Used by read metering: a key's serialized size is a lower bound on its
/// entry's size.
pub fn xdr_size<T: WriteXdr>(value: &T) -> Result<u64> {
    let bytes = value
        .to_xdr(Limits::none())
        .map_err(|e| BucketError::Serialization(format!("failed to serialize: {}", e)))?;
    Ok(bytes.len() as u64)
}

/// Extract a LedgerKey from a LedgerEntry.
pub fn ledger_entry_to_key(entry: &LedgerEntry) -> LedgerKey {
    use stellar_xdr::curr::*;

    match &entry.data {
        LedgerEntryData::Account(account) => LedgerKey::Account(LedgerKeyAccount {
            account_id: account.account_id.clone(),
        }),
        LedgerEntryData::Trustline(trustline) => LedgerKey::Trustline(LedgerKeyTrustLine {
            account_id: trustline.account_id.clone(),
            asset: trustline.asset.clone(),
        }),
        LedgerEntryData::Offer(offer) => LedgerKey::Offer(LedgerKeyOffer {
            seller_id: offer.seller_id.clone(),
            offer_id: offer.offer_id,
        }),
        LedgerEntryData::Data(data) => LedgerKey::Data(LedgerKeyData {
            account_id: data.account_id.clone(),
            data_name: data.data_name.clone(),
        }),
        LedgerEntryData::ClaimableBalance(cb) => {
            LedgerKey::ClaimableBalance(LedgerKeyClaimableBalance {
                balance_id: cb.balance_id.clone(),
            })
        }
        LedgerEntryData::LiquidityPool(pool) => LedgerKey::LiquidityPool(LedgerKeyLiquidityPool {
            liquidity_pool_id: pool.liquidity_pool_id.clone(),
        }),
        LedgerEntryData::ContractData(contract_data) => {
            LedgerKey::ContractData(LedgerKeyContractData {
                contract: contract_data.contract.clone(),
                key: contract_data.key.clone(),
                durability: contract_data.durability,
            })
        }
        LedgerEntryData::ContractCode(contract_code) => {
            LedgerKey::ContractCode(LedgerKeyContractCode {
                hash: contract_code.hash.clone(),
            })
        }
        LedgerEntryData::ConfigSetting(config) => LedgerKey::ConfigSetting(LedgerKeyConfigSetting {
            config_setting_id: config.discriminant(),
        }),
        LedgerEntryData::Ttl(ttl) => LedgerKey::Ttl(LedgerKeyTtl {
            key_hash: ttl.key_hash.clone(),
        }),
    }
}

/// The entry type discriminant for a ledger key.
pub(crate) fn ledger_key_type(key: &LedgerKey) -> LedgerEntryType {
    match key {
        LedgerKey::Account(_) => LedgerEntryType::Account,
        LedgerKey::Trustline(_) => LedgerEntryType::Trustline,
        LedgerKey::Offer(_) => LedgerEntryType::Offer,
        LedgerKey::Data(_) => LedgerEntryType::Data,
        LedgerKey::ClaimableBalance(_) => LedgerEntryType::ClaimableBalance,
        LedgerKey::LiquidityPool(_) => LedgerEntryType::LiquidityPool,
        LedgerKey::ContractData(_) => LedgerEntryType::ContractData,
        LedgerKey::ContractCode(_) => LedgerEntryType::ContractCode,
        LedgerKey::ConfigSetting(_) => LedgerEntryType::ConfigSetting,
        LedgerKey::Ttl(_) => LedgerEntryType::Ttl,
    }
}

/// Compare two LedgerKeys for ordering.
///
/// Keys are sorted first by type discriminant, then by type-specific
/// fields. This ordering agrees with the on-disk sort order of bucket
/// records and must be identical across nodes for bucket hashes to match.
pub fn compare_keys(a: &LedgerKey, b: &LedgerKey) -> Ordering {
    let a_type = ledger_key_type(a);
    let b_type = ledger_key_type(b);
    match a_type.cmp(&b_type) {
        Ordering::Equal => compare_keys_same_type(a, b),
        other => other,
    }
}

fn compare_keys_same_type(a: &LedgerKey, b: &LedgerKey) -> Ordering {
    match (a, b) {
        (LedgerKey::Account(a), LedgerKey::Account(b)) => a.account_id.cmp(&b.account_id),
        (LedgerKey::Trustline(a), LedgerKey::Trustline(b)) => a
            .account_id
            .cmp(&b.account_id)
            .then_with(|| a.asset.cmp(&b.asset)),
        (LedgerKey::Offer(a), LedgerKey::Offer(b)) => a
            .seller_id
            .cmp(&b.seller_id)
            .then_with(|| a.offer_id.cmp(&b.offer_id)),
        (LedgerKey::Data(a), LedgerKey::Data(b)) => a
            .account_id
            .cmp(&b.account_id)
            .then_with(|| a.data_name.cmp(&b.data_name)),
        (LedgerKey::ClaimableBalance(a), LedgerKey::ClaimableBalance(b)) => {
            a.balance_id.cmp(&b.balance_id)
        }
        (LedgerKey::LiquidityPool(a), LedgerKey::LiquidityPool(b)) => {
            a.liquidity_pool_id.cmp(&b.liquidity_pool_id)
        }
        (LedgerKey::ContractData(a), LedgerKey::ContractData(b)) => a
            .contract
            .cmp(&b.contract)
            .then_with(|| a.key.cmp(&b.key))
            .then_with(|| a.durability.cmp(&b.durability)),
        (LedgerKey::ContractCode(a), LedgerKey::ContractCode(b)) => a.hash.cmp(&b.hash),
        (LedgerKey::ConfigSetting(a), LedgerKey::ConfigSetting(b)) => {
            a.config_setting_id.cmp(&b.config_setting_id)
        }
        (LedgerKey::Ttl(a), LedgerKey::Ttl(b)) => a.key_hash.cmp(&b.key_hash),
        _ => Ordering::Equal,
    }
}

/// Compare two BucketEntry values by key.
///
/// Metadata entries sort first; two metadata entries compare equal.
pub fn compare_entries(a: &BucketEntry, b: &BucketEntry) -> Ordering {
    match (a.key(), b.key()) {
        (Some(key_a), Some(key_b)) => compare_keys(&key_a, &key_b),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Check if a ledger entry is a soroban entry (ContractData or
/// ContractCode). Only soroban entries may appear in hot archive buckets.
pub fn is_soroban_entry(entry: &LedgerEntry) -> bool {
    matches!(
        entry.data,
        LedgerEntryData::ContractData(_) | LedgerEntryData::ContractCode(_)
    )
}

/// Check if a ledger key references a soroban entry.
pub fn is_soroban_key(key: &LedgerKey) -> bool {
    matches!(key, LedgerKey::ContractData(_) | LedgerKey::ContractCode(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BucketEntry;
    use stellar_xdr::curr::*;

    fn make_account_id(bytes: [u8; 32]) -> AccountId {
        AccountId(PublicKey::PublicKeyTypeEd25519(Uint256(bytes)))
    }

    fn make_account_entry(bytes: [u8; 32]) -> LedgerEntry {
        LedgerEntry {
            last_modified_ledger_seq: 1,
            data: LedgerEntryData::Account(AccountEntry {
                account_id: make_account_id(bytes),
                balance: 100,
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

    #[test]
    fn test_bucket_entry_key() {
        let entry = make_account_entry([1u8; 32]);
        let bucket_entry = BucketEntry::Live(entry);

        let key = bucket_entry.key().unwrap();
        if let LedgerKey::Account(account_key) = key {
            assert_eq!(account_key.account_id, make_account_id([1u8; 32]));
        } else {
            panic!("Expected Account key");
        }
    }

    #[test]
    fn test_bucket_entry_predicates() {
        let live = BucketEntry::Live(make_account_entry([1u8; 32]));
        let dead = BucketEntry::Dead(LedgerKey::Account(LedgerKeyAccount {
            account_id: make_account_id([1u8; 32]),
        }));
        let init = BucketEntry::Init(make_account_entry([1u8; 32]));
        let meta = BucketEntry::Metadata(BucketMetadata {
            ledger_version: 25,
            ext: BucketMetadataExt::V0,
        });

        assert!(live.is_live() && !live.is_tombstone() && !live.is_metadata());
        assert!(dead.is_tombstone() && !dead.is_live());
        assert!(init.is_init() && !init.is_tombstone());
        assert!(meta.is_metadata() && meta.key().is_none());
    }

    #[test]
    fn test_hot_archive_tombstone_identity() {
        let key = LedgerKey::ContractCode(LedgerKeyContractCode {
            hash: Hash([7u8; 32]),
        });
        let restored = BucketEntry::HotArchiveLive(key.clone());
        let archived = BucketEntry::HotArchiveArchived(make_contract_code_entry(7));

        assert!(restored.is_tombstone());
        assert!(!archived.is_tombstone());
        assert_eq!(restored.kind(), BucketKind::HotArchive);
        assert_eq!(restored.key().unwrap(), key);
        assert_eq!(archived.key().unwrap(), key);
    }

    #[test]
    fn test_compare_keys_same_type() {
        let key1 = LedgerKey::Account(LedgerKeyAccount {
            account_id: make_account_id([1u8; 32]),
        });
        let key2 = LedgerKey::Account(LedgerKeyAccount {
            account_id: make_account_id([2u8; 32]),
        });

        assert_eq!(compare_keys(&key1, &key2), Ordering::Less);
        assert_eq!(compare_keys(&key2, &key1), Ordering::Greater);
        assert_eq!(compare_keys(&key1, &key1), Ordering::Equal);
    }

    #[test]
    fn test_compare_keys_different_types() {
        // Type discriminant dominates the field comparison.
        let account_key = LedgerKey::Account(LedgerKeyAccount {
            account_id: make_account_id([255u8; 32]),
        });
        let trustline_key = LedgerKey::Trustline(LedgerKeyTrustLine {
            account_id: make_account_id([0u8; 32]),
            asset: TrustLineAsset::Native,
        });

        assert_eq!(compare_keys(&account_key, &trustline_key), Ordering::Less);
        assert_eq!(
            compare_keys(&trustline_key, &account_key),
            Ordering::Greater
        );
    }

    #[test]
    fn test_compare_entries_metadata_first() {
        let meta = BucketEntry::Metadata(BucketMetadata {
            ledger_version: 25,
            ext: BucketMetadataExt::V0,
        });
        let live = BucketEntry::Live(make_account_entry([0u8; 32]));

        assert_eq!(compare_entries(&meta, &live), Ordering::Less);
        assert_eq!(compare_entries(&live, &meta), Ordering::Greater);
        assert_eq!(compare_entries(&meta, &meta), Ordering::Equal);
    }

    #[test]
    fn test_ledger_entry_type_discriminants() {
        // Sorting depends on these discriminant values matching the XDR
        // definition in Stellar-ledger-entries.x.
        assert_eq!(LedgerEntryType::Account as i32, 0);
        assert_eq!(LedgerEntryType::Trustline as i32, 1);
        assert_eq!(LedgerEntryType::Offer as i32, 2);
        assert_eq!(LedgerEntryType::Data as i32, 3);
        assert_eq!(LedgerEntryType::ClaimableBalance as i32, 4);
        assert_eq!(LedgerEntryType::LiquidityPool as i32, 5);
        assert_eq!(LedgerEntryType::ContractData as i32, 6);
        assert_eq!(LedgerEntryType::ContractCode as i32, 7);
        assert_eq!(LedgerEntryType::ConfigSetting as i32, 8);
        assert_eq!(LedgerEntryType::Ttl as i32, 9);
    }

    #[test]
    fn test_is_soroban_entry() {
        assert!(is_soroban_entry(&make_contract_code_entry(1)));
        assert!(!is_soroban_entry(&make_account_entry([1u8; 32])));

        let code_key = LedgerKey::ContractCode(LedgerKeyContractCode {
            hash: Hash([1u8; 32]),
        });
        let account_key = LedgerKey::Account(LedgerKeyAccount {
            account_id: make_account_id([1u8; 32]),
        });
        assert!(is_soroban_key(&code_key));
        assert!(!is_soroban_key(&account_key));
    }

    #[test]
    fn test_xdr_size_key_bounds_entry() {
        let entry = make_account_entry([3u8; 32]);
        let key = ledger_entry_to_key(&entry);
        let key_size = xdr_size(&key).unwrap();
        let entry_size = xdr_size(&entry).unwrap();
        assert!(key_size > 0);
        assert!(key_size <= entry_size);
    }
}
