//! Merge and query counters.
//!
//! Fine-grained counters for tracking events during merges and snapshot
//! queries. These are plain atomics rather than an external metrics
//! registry: merges must run as fast as possible, and this granularity is
//! only consumed by tests and debug logging. The node's exporter samples
//! them through the snapshot structs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use std::collections::HashMap;
use stellar_xdr::curr::LedgerEntryType;

/// Counters for events observed while producing buckets.
///
/// Shared between the merge driver and the output iterators it spawns via
/// `Arc`; all updates are relaxed since the fields are independent tallies.
#[derive(Debug, Default)]
pub struct MergeCounters {
    output_iterator_tombstone_elisions: AtomicU64,
    output_iterator_buffer_updates: AtomicU64,
    output_iterator_actual_writes: AtomicU64,
    output_iterator_live_to_init_rewrites: AtomicU64,

    new_init_entries_merged_with_old_dead: AtomicU64,
    old_init_entries_merged_with_new_live: AtomicU64,
    old_init_entries_merged_with_new_dead: AtomicU64,
    old_entries_default_accepted: AtomicU64,
    new_entries_default_accepted: AtomicU64,
}

impl MergeCounters {
    /// Create a fresh set of counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_tombstone_elision(&self) {
        self.output_iterator_tombstone_elisions
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_buffer_update(&self) {
        self.output_iterator_buffer_updates
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_actual_write(&self) {
        self.output_iterator_actual_writes
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_live_to_init_rewrite(&self) {
        self.output_iterator_live_to_init_rewrites
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_new_init_merged_with_old_dead(&self) {
        self.new_init_entries_merged_with_old_dead
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_old_init_merged_with_new_live(&self) {
        self.old_init_entries_merged_with_new_live
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_old_init_merged_with_new_dead(&self) {
        self.old_init_entries_merged_with_new_dead
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_old_entry_default_accepted(&self) {
        self.old_entries_default_accepted
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_new_entry_default_accepted(&self) {
        self.new_entries_default_accepted
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of all counters.
    pub fn snapshot(&self) -> MergeCountersSnapshot {
        MergeCountersSnapshot {
            tombstone_elisions: self.output_iterator_tombstone_elisions.load(Ordering::Relaxed),
            buffer_updates: self.output_iterator_buffer_updates.load(Ordering::Relaxed),
            actual_writes: self.output_iterator_actual_writes.load(Ordering::Relaxed),
            live_to_init_rewrites: self
                .output_iterator_live_to_init_rewrites
                .load(Ordering::Relaxed),
            new_init_entries_merged_with_old_dead: self
                .new_init_entries_merged_with_old_dead
                .load(Ordering::Relaxed),
            old_init_entries_merged_with_new_live: self
                .old_init_entries_merged_with_new_live
                .load(Ordering::Relaxed),
            old_init_entries_merged_with_new_dead: self
                .old_init_entries_merged_with_new_dead
                .load(Ordering::Relaxed),
            old_entries_default_accepted: self
                .old_entries_default_accepted
                .load(Ordering::Relaxed),
            new_entries_default_accepted: self
                .new_entries_default_accepted
                .load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`MergeCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeCountersSnapshot {
    /// Tombstones dropped by bottom-level output iterators.
    pub tombstone_elisions: u64,
    /// Buffered-entry replacements in output iterators.
    pub buffer_updates: u64,
    /// Records actually flushed to disk by output iterators.
    pub actual_writes: u64,
    /// LIVEENTRY records rewritten to INITENTRY at the bottom level.
    pub live_to_init_rewrites: u64,
    /// INIT+DEAD annihilations during merges.
    pub new_init_entries_merged_with_old_dead: u64,
    /// INIT entries updated in place by a newer LIVE during merges.
    pub old_init_entries_merged_with_new_live: u64,
    /// DEAD+INIT recreations resolved to LIVE during merges.
    pub old_init_entries_merged_with_new_dead: u64,
    /// Old-side entries accepted without a matching new-side key.
    pub old_entries_default_accepted: u64,
    /// New-side entries accepted without a matching old-side key.
    pub new_entries_default_accepted: u64,
}

#[derive(Debug, Default)]
struct TypeTimer {
    count: AtomicU64,
    total_ns: AtomicU64,
}

#[derive(Debug, Default, Clone)]
struct BulkStats {
    calls: u64,
    keys: u64,
    total_ns: u64,
}

/// Counters and timers for snapshot queries.
///
/// Point loads are broken down by entry type; bulk loads by a static tag
/// naming the query shape.
#[derive(Debug, Default)]
pub struct QueryMetrics {
    point_loads: [TypeTimer; 10],
    bulk_loads: Mutex<HashMap<&'static str, BulkStats>>,
}

fn type_slot(entry_type: LedgerEntryType) -> usize {
    entry_type as usize
}

impl QueryMetrics {
    /// Create a fresh set of query metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing a point load of the given entry type.
    pub fn point_load_timer(&self, entry_type: LedgerEntryType) -> TimerScope<'_> {
        TimerScope {
            metrics: self,
            target: TimerTarget::Point(entry_type),
            start: Instant::now(),
        }
    }

    /// Record a bulk load of `n_keys` keys under `tag` and start timing it.
    pub fn bulk_load_timer(&self, tag: &'static str, n_keys: usize) -> TimerScope<'_> {
        {
            let mut bulk = self.bulk_loads.lock();
            let stats = bulk.entry(tag).or_default();
            stats.calls += 1;
            stats.keys += n_keys as u64;
        }
        TimerScope {
            metrics: self,
            target: TimerTarget::Bulk(tag),
            start: Instant::now(),
        }
    }

    /// Take a point-in-time copy of all query metrics.
    pub fn snapshot(&self) -> QueryMetricsSnapshot {
        let point_loads = self
            .point_loads
            .iter()
            .map(|t| t.count.load(Ordering::Relaxed))
            .sum();
        let point_load_ns = self
            .point_loads
            .iter()
            .map(|t| t.total_ns.load(Ordering::Relaxed))
            .sum();
        let bulk_loads = self
            .bulk_loads
            .lock()
            .iter()
            .map(|(tag, stats)| (*tag, stats.calls, stats.keys, stats.total_ns))
            .collect();
        QueryMetricsSnapshot {
            point_loads,
            point_load_ns,
            bulk_loads,
        }
    }

    /// Point load count for a single entry type.
    pub fn point_loads_for_type(&self, entry_type: LedgerEntryType) -> u64 {
        self.point_loads[type_slot(entry_type)]
            .count
            .load(Ordering::Relaxed)
    }
}

/// Point-in-time copy of [`QueryMetrics`].
#[derive(Debug, Clone, Default)]
pub struct QueryMetricsSnapshot {
    /// Total point loads across all entry types.
    pub point_loads: u64,
    /// Total nanoseconds spent in point loads.
    pub point_load_ns: u64,
    /// Per-tag bulk load stats: (tag, calls, keys, total_ns).
    pub bulk_loads: Vec<(&'static str, u64, u64, u64)>,
}

enum TimerTarget {
    Point(LedgerEntryType),
    Bulk(&'static str),
}

/// RAII timer: records elapsed time into its metrics slot on drop.
pub struct TimerScope<'a> {
    metrics: &'a QueryMetrics,
    target: TimerTarget,
    start: Instant,
}

impl Drop for TimerScope<'_> {
    fn drop(&mut self) {
        let elapsed_ns = self.start.elapsed().as_nanos() as u64;
        match self.target {
            TimerTarget::Point(entry_type) => {
                let timer = &self.metrics.point_loads[type_slot(entry_type)];
                timer.count.fetch_add(1, Ordering::Relaxed);
                timer.total_ns.fetch_add(elapsed_ns, Ordering::Relaxed);
            }
            TimerTarget::Bulk(tag) => {
                let mut bulk = self.metrics.bulk_loads.lock();
                if let Some(stats) = bulk.get_mut(tag) {
                    stats.total_ns += elapsed_ns;
                }
            }
        }
    }
}
