//! Strict weak orders over keys with a recency tie-break.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::{Key, Pos};

/// Which family of keys a node holds.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    /// Interior nodes: pointers to child btree nodes, ordered by end position.
    BtreePtr,
    /// Leaf nodes: cached data ranges, ordered by start position.
    Extent,
}

/// Insertion order token: later runs and later slots are newer.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Recency {
    /// Creation sequence number of the run.
    pub run_seq: u64,
    /// Slot within the run.
    pub slot: u32,
}

impl Recency {
    /// Creates a recency token.
    pub const fn new(run_seq: u64, slot: u32) -> Self {
        Self { run_seq, slot }
    }
}

/// A key together with its recency.
#[derive(Copy, Clone, Debug)]
pub struct KeyRef<'a> {
    /// The key.
    pub key: &'a Key,
    /// Where the key came from.
    pub recency: Recency,
}

impl<'a> KeyRef<'a> {
    /// Pairs a key with its recency.
    pub const fn new(key: &'a Key, recency: Recency) -> Self {
        Self { key, recency }
    }
}

/// Position a comparator of `kind` sorts `key` by.
pub fn sort_pos(kind: KeyKind, key: &Key) -> Pos {
    match kind {
        KeyKind::BtreePtr => key.pos(),
        KeyKind::Extent => key.start_pos(),
    }
}

/// Orders two keys for merging: `Less` means `l` is emitted first.
///
/// Keys at the same sort position order newest first.
pub fn compare(kind: KeyKind, l: KeyRef<'_>, r: KeyRef<'_>) -> Ordering {
    sort_pos(kind, l.key)
        .cmp(&sort_pos(kind, r.key))
        .then_with(|| r.recency.cmp(&l.recency))
}
