//! Per-transaction read metering for bulk lookups.
//!
//! Soroban transactions declare read budgets; the bucket query engine
//! consults a [`LedgerKeyMeter`] before and after loading each key so a
//! transaction over budget stops consuming disk reads. A refused key is
//! charged anyway, pinning the offending transactions at zero quota so
//! their remaining keys are refused up front.

use std::collections::HashMap;

use stellar_xdr::curr::LedgerKey;

/// Read-quota oracle consulted by `load_keys_with_limits`.
///
/// Quota exhaustion is not an error: the key is silently dropped from the
/// lookup and the quota charged regardless.
pub trait LedgerKeyMeter {
    /// Whether every transaction reading `key` can still afford
    /// `n_bytes` more.
    fn can_load(&self, key: &LedgerKey, n_bytes: u64) -> bool;

    /// Charge `n_bytes` against every transaction reading `key`,
    /// saturating at zero.
    fn update_read_quotas_for_key(&mut self, key: &LedgerKey, n_bytes: u64);
}

/// Concrete meter mapping keys to the transactions that read them.
///
/// Keys not registered with any transaction are unmetered and always
/// loadable.
#[derive(Debug, Default)]
pub struct TxReadMeter {
    tx_quotas: Vec<u64>,
    key_to_txs: HashMap<LedgerKey, Vec<usize>>,
}

impl TxReadMeter {
    /// Create a meter with one read quota per transaction.
    pub fn new(tx_quotas: Vec<u64>) -> Self {
        Self {
            tx_quotas,
            key_to_txs: HashMap::new(),
        }
    }

    /// Register that transaction `tx_index` reads `key`.
    pub fn add_key(&mut self, key: LedgerKey, tx_index: usize) {
        assert!(tx_index < self.tx_quotas.len(), "unknown transaction");
        self.key_to_txs.entry(key).or_default().push(tx_index);
    }

    /// Remaining quota of one transaction.
    pub fn remaining_quota(&self, tx_index: usize) -> u64 {
        self.tx_quotas[tx_index]
    }
}

impl LedgerKeyMeter for TxReadMeter {
    fn can_load(&self, key: &LedgerKey, n_bytes: u64) -> bool {
        match self.key_to_txs.get(key) {
            Some(txs) => txs.iter().all(|&tx| self.tx_quotas[tx] >= n_bytes),
            None => true,
        }
    }

    fn update_read_quotas_for_key(&mut self, key: &LedgerKey, n_bytes: u64) {
        if let Some(txs) = self.key_to_txs.get(key) {
            for &tx in txs {
                self.tx_quotas[tx] = self.tx_quotas[tx].saturating_sub(n_bytes);
            }
        }
    }
}
