//! Runs of keys and the passes that merge them.
//!
//! A node keeps its keys in several runs, oldest first. Each run is sorted on
//! its own; [`MergeIter`] produces one merged, overlap-free stream from all of
//! them. [`sort_fixup`] and [`resort`] collapse a node back to a single run.

mod iter;

use serde::{Deserialize, Serialize};

pub use iter::MergeIter;

use crate::cache::CacheSet;
use crate::classify::{is_bad, is_invalid};
use crate::coalesce::try_merge;
use crate::key::order::{sort_pos, KeyKind};
use crate::key::Key;

/// Keys produced by one insertion batch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    seq: u64,
    keys: Vec<Key>,
}

impl Run {
    /// Wraps keys that are already sorted.
    pub fn new(seq: u64, keys: Vec<Key>) -> Self {
        Self { seq, keys }
    }

    /// Settles an insertion batch into a run: keys are sorted and overlaps
    /// inside the batch are fixed up with later keys winning, exactly as
    /// overlaps between runs are.
    pub fn from_batch(kind: KeyKind, seq: u64, keys: Vec<Key>) -> Self {
        let mut singles: Vec<Run> = keys
            .into_iter()
            .enumerate()
            .map(|(slot, key)| Run::new(slot as u64, vec![key]))
            .collect();
        let keys = MergeIter::detached(kind, &mut singles).collect();
        Self { seq, keys }
    }

    /// Creation sequence number; larger is newer.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Keys in merge order.
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// Consumes the run.
    pub fn into_keys(self) -> Vec<Key> {
        self.keys
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the run holds no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Whether the keys are in non-decreasing sort position.
    pub fn is_sorted(&self, kind: KeyKind) -> bool {
        self.keys
            .windows(2)
            .all(|pair| sort_pos(kind, &pair[0]) <= sort_pos(kind, &pair[1]))
    }
}

/// Which keys a [`resort`] pass throws away.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    /// Keep everything the merge emits.
    KeepAll,
    /// Drop structurally invalid keys; used on node read.
    Invalid,
    /// Drop bad keys, stale pointers included; used by GC and node rewrite.
    Bad,
}

/// Counts from one [`resort`] pass.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ResortSummary {
    /// Keys across all runs before the pass.
    pub keys_in: usize,
    /// Keys in the resulting run.
    pub keys_out: usize,
    /// Keys removed by the filter.
    pub filtered: usize,
    /// Keys absorbed into their left neighbour.
    pub coalesced: usize,
}

fn newest_seq(runs: &[Run]) -> u64 {
    runs.iter().map(Run::seq).max().unwrap_or_default()
}

/// Merges every run through fixup and replaces them with one run carrying the
/// newest sequence number. Running it again on the result changes nothing.
pub fn sort_fixup(kind: KeyKind, runs: &mut Vec<Run>, cache: &CacheSet) {
    if runs.is_empty() {
        return;
    }
    let seq = newest_seq(runs);
    let merged: Vec<Key> = MergeIter::new(kind, runs, cache).collect();
    tracing::debug!(
        ?kind,
        runs = runs.len(),
        keys = merged.len(),
        "cachekeys.merge.sort_fixup"
    );
    runs.clear();
    runs.push(Run::new(seq, merged));
}

/// Full node pass: merge with fixup, drop keys rejected by `filter`, and fold
/// adjacent extents together. Leaves a single run behind.
pub fn resort(
    kind: KeyKind,
    runs: &mut Vec<Run>,
    cache: &CacheSet,
    filter: Filter,
) -> ResortSummary {
    let mut summary = ResortSummary {
        keys_in: runs.iter().map(Run::len).sum(),
        ..ResortSummary::default()
    };
    if runs.is_empty() {
        return summary;
    }
    let seq = newest_seq(runs);
    let mut out: Vec<Key> = Vec::with_capacity(summary.keys_in);
    for mut key in MergeIter::new(kind, runs, cache) {
        let rejected = match filter {
            Filter::KeepAll => false,
            Filter::Invalid => is_invalid(cache, kind, &key),
            Filter::Bad => is_bad(cache, kind, &key),
        };
        if rejected {
            summary.filtered += 1;
            continue;
        }
        if kind == KeyKind::Extent {
            if let Some(last) = out.last_mut() {
                if try_merge(cache, last, &mut key) {
                    summary.coalesced += 1;
                    continue;
                }
            }
        }
        out.push(key);
    }
    summary.keys_out = out.len();
    tracing::debug!(
        ?kind,
        ?filter,
        keys_in = summary.keys_in,
        keys_out = summary.keys_out,
        filtered = summary.filtered,
        coalesced = summary.coalesced,
        "cachekeys.merge.resort"
    );
    runs.clear();
    runs.push(Run::new(seq, out));
    summary
}

/// The runs of one btree node.
#[derive(Clone, Debug)]
pub struct RunSet {
    kind: KeyKind,
    runs: Vec<Run>,
    next_seq: u64,
}

impl RunSet {
    /// Creates an empty node of the given kind.
    pub fn new(kind: KeyKind) -> Self {
        Self {
            kind,
            runs: Vec::new(),
            next_seq: 0,
        }
    }

    /// Key family held by this node.
    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    /// Settles an insertion batch (see [`Run::from_batch`]) and appends it as
    /// the newest run. Returns the run's sequence number.
    pub fn push_run(&mut self, keys: Vec<Key>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.runs.push(Run::from_batch(self.kind, seq, keys));
        seq
    }

    /// Runs, oldest first.
    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    /// Number of runs.
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Whether the node has no runs.
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Keys across all runs.
    pub fn key_count(&self) -> usize {
        self.runs.iter().map(Run::len).sum()
    }

    /// Lazily merges the runs.
    pub fn iter<'a>(&'a mut self, cache: &'a CacheSet) -> MergeIter<'a> {
        MergeIter::new(self.kind, &mut self.runs, cache)
    }

    /// See [`sort_fixup`].
    pub fn sort_fixup(&mut self, cache: &CacheSet) {
        sort_fixup(self.kind, &mut self.runs, cache);
    }

    /// See [`resort`].
    pub fn resort(&mut self, cache: &CacheSet, filter: Filter) -> ResortSummary {
        resort(self.kind, &mut self.runs, cache, filter)
    }
}
