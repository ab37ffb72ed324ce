//! Counters for merge, classification and coalescing work.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::Serialize;

/// Snapshot of [`KeyStats`] at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeyStatsSnapshot {
    /// Keys rejected by the structural check.
    pub invalid_keys: u64,
    /// Keys classified bad.
    pub bad_keys: u64,
    /// Pointers found behind their bucket generation.
    pub stale_pointers: u64,
    /// Deep GC-mark checks that ran.
    pub deep_checks: u64,
    /// Deep checks skipped because the bucket lock was contended.
    pub deep_checks_skipped: u64,
    /// Inconsistencies handed to the diagnostic sink.
    pub inconsistencies: u64,
    /// Keys discarded by merge fixup.
    pub fixup_dropped: u64,
    /// Keys trimmed in place by merge fixup.
    pub fixup_trimmed: u64,
    /// Extents absorbed by a left neighbour.
    pub keys_merged: u64,
    /// Merges cut short by the size limit.
    pub partial_merges: u64,
}

/// Thread-safe counters owned by a [`crate::CacheSet`].
#[derive(Default, Debug)]
pub struct KeyStats {
    invalid_keys: AtomicU64,
    bad_keys: AtomicU64,
    stale_pointers: AtomicU64,
    deep_checks: AtomicU64,
    deep_checks_skipped: AtomicU64,
    inconsistencies: AtomicU64,
    fixup_dropped: AtomicU64,
    fixup_trimmed: AtomicU64,
    keys_merged: AtomicU64,
    partial_merges: AtomicU64,
}

macro_rules! counter {
    ($get:ident, $inc:ident) => {
        #[doc = concat!("Current value of `", stringify!($get), "`.")]
        pub fn $get(&self) -> u64 {
            self.$get.load(AtomicOrdering::Relaxed)
        }

        pub(crate) fn $inc(&self) {
            self.$get.fetch_add(1, AtomicOrdering::Relaxed);
        }
    };
}

impl KeyStats {
    counter!(invalid_keys, inc_invalid_keys);
    counter!(bad_keys, inc_bad_keys);
    counter!(stale_pointers, inc_stale_pointers);
    counter!(deep_checks, inc_deep_checks);
    counter!(deep_checks_skipped, inc_deep_checks_skipped);
    counter!(inconsistencies, inc_inconsistencies);
    counter!(fixup_dropped, inc_fixup_dropped);
    counter!(fixup_trimmed, inc_fixup_trimmed);
    counter!(keys_merged, inc_keys_merged);
    counter!(partial_merges, inc_partial_merges);

    /// Creates a snapshot of all counters.
    pub fn snapshot(&self) -> KeyStatsSnapshot {
        KeyStatsSnapshot {
            invalid_keys: self.invalid_keys(),
            bad_keys: self.bad_keys(),
            stale_pointers: self.stale_pointers(),
            deep_checks: self.deep_checks(),
            deep_checks_skipped: self.deep_checks_skipped(),
            inconsistencies: self.inconsistencies(),
            fixup_dropped: self.fixup_dropped(),
            fixup_trimmed: self.fixup_trimmed(),
            keys_merged: self.keys_merged(),
            partial_merges: self.partial_merges(),
        }
    }

    /// Emits current counters to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "cachekeys::stats",
            invalid_keys = snapshot.invalid_keys,
            bad_keys = snapshot.bad_keys,
            stale_pointers = snapshot.stale_pointers,
            deep_checks = snapshot.deep_checks,
            deep_checks_skipped = snapshot.deep_checks_skipped,
            inconsistencies = snapshot.inconsistencies,
            fixup_dropped = snapshot.fixup_dropped,
            fixup_trimmed = snapshot.fixup_trimmed,
            keys_merged = snapshot.keys_merged,
            partial_merges = snapshot.partial_merges,
            "key stats snapshot"
        );
    }
}
