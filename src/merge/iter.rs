use crate::cache::CacheSet;
use crate::diag::Inconsistency;
use crate::key::order::{compare, KeyKind, KeyRef, Recency};
use crate::key::Key;

use super::Run;

#[derive(Copy, Clone, Debug)]
struct Cursor {
    run: usize,
    pos: usize,
    seq: u64,
}

impl Cursor {
    fn recency(&self) -> Recency {
        Recency::new(self.seq, self.pos as u32)
    }
}

/// Lazy k-way merge over a node's runs.
///
/// Keeps one cursor per non-empty run in a binary min-heap. Before every
/// emission the top two entries are fixed up: duplicate btree pointers lose
/// their older copy, overlapping extents are trimmed, split or dropped so the
/// newer data wins. Fixup edits keys inside the run buffers, which is why the
/// iterator borrows them mutably.
pub struct MergeIter<'a> {
    kind: KeyKind,
    runs: &'a mut [Run],
    heap: Vec<Cursor>,
    cache: Option<&'a CacheSet>,
}

impl<'a> MergeIter<'a> {
    /// Starts a merge. Every run must already be sorted for `kind`.
    pub fn new(kind: KeyKind, runs: &'a mut [Run], cache: &'a CacheSet) -> Self {
        Self::build(kind, runs, Some(cache))
    }

    /// Merge that neither counts nor reports; used to settle a batch before it
    /// becomes a run.
    pub(super) fn detached(kind: KeyKind, runs: &'a mut [Run]) -> Self {
        Self::build(kind, runs, None)
    }

    fn build(kind: KeyKind, runs: &'a mut [Run], cache: Option<&'a CacheSet>) -> Self {
        let heap = runs
            .iter()
            .enumerate()
            .filter(|(_, run)| !run.is_empty())
            .map(|(run, r)| Cursor {
                run,
                pos: 0,
                seq: r.seq(),
            })
            .collect();
        let mut iter = Self {
            kind,
            runs,
            heap,
            cache,
        };
        for idx in (0..iter.heap.len() / 2).rev() {
            iter.sift_down(idx);
        }
        iter
    }

    /// Runs that still have keys to emit.
    pub fn live_runs(&self) -> usize {
        self.heap.len()
    }

    fn key(&self, cursor: Cursor) -> &Key {
        &self.runs[cursor.run].keys[cursor.pos]
    }

    fn key_mut(&mut self, cursor: Cursor) -> &mut Key {
        &mut self.runs[cursor.run].keys[cursor.pos]
    }

    fn precedes(&self, a: usize, b: usize) -> bool {
        let (ca, cb) = (self.heap[a], self.heap[b]);
        compare(
            self.kind,
            KeyRef::new(self.key(ca), ca.recency()),
            KeyRef::new(self.key(cb), cb.recency()),
        )
        .is_lt()
    }

    fn sift_down(&mut self, mut idx: usize) {
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            let mut min = idx;
            if left < self.heap.len() && self.precedes(left, min) {
                min = left;
            }
            if right < self.heap.len() && self.precedes(right, min) {
                min = right;
            }
            if min == idx {
                return;
            }
            self.heap.swap(idx, min);
            idx = min;
        }
    }

    /// Moves the cursor at heap slot `idx` past its key, retiring it when
    /// the run is exhausted.
    fn advance(&mut self, idx: usize) {
        let cursor = &mut self.heap[idx];
        cursor.pos += 1;
        if cursor.pos == self.runs[cursor.run].keys.len() {
            self.heap.swap_remove(idx);
        }
        if idx < self.heap.len() {
            self.sift_down(idx);
        }
    }

    /// Heap slot of the entry that follows the top in merge order.
    fn second(&self) -> usize {
        if self.heap.len() > 2 && self.precedes(2, 1) {
            2
        } else {
            1
        }
    }

    fn discard(&mut self, idx: usize) {
        if let Some(cache) = self.cache {
            cache.stats().inc_fixup_dropped();
        }
        tracing::trace!(key = %self.key(self.heap[idx]), "cachekeys.merge.drop");
        self.advance(idx);
    }

    fn note_trimmed(&self) {
        if let Some(cache) = self.cache {
            cache.stats().inc_fixup_trimmed();
        }
    }

    fn btree_ptr_fixup(&mut self) {
        while self.heap.len() > 1 {
            let idx = self.second();
            let top = self.key(self.heap[0]);
            // legacy freeing keys are never deduplicated
            if top.is_zero_pos() {
                break;
            }
            if top.pos() != self.key(self.heap[idx]).pos() {
                break;
            }
            // ties sort newest first, so the runner-up is the overwritten copy
            self.discard(idx);
        }
    }

    /// Resolves overlaps between the top and its runner-up. Returns a key to
    /// emit ahead of the top when an older key had to be split around a newer
    /// one.
    fn extent_fixup(&mut self) -> Option<Key> {
        while self.heap.len() > 1 {
            let idx = self.second();
            let (top_c, next_c) = (self.heap[0], self.heap[idx]);
            let (top, next) = (self.key(top_c), self.key(next_c));

            if next.size == 0 {
                self.discard(idx);
                continue;
            }
            if top.pos() <= next.start_pos() {
                break;
            }

            if top_c.recency() > next_c.recency() {
                if top.pos() >= next.pos() {
                    self.discard(idx);
                } else {
                    let at = top.pos();
                    self.key_mut(next_c).cut_front(at);
                    self.note_trimmed();
                    self.sift_down(idx);
                }
            } else {
                // the comparator orders the newer key first on equal starts
                if top.start_pos() == next.start_pos() {
                    let event = Inconsistency::FixupOrder {
                        top: top.to_string(),
                        next: next.to_string(),
                    };
                    match self.cache {
                        Some(cache) => cache.report(event),
                        None => tracing::error!(%event, "cachekeys.merge.fixup_order"),
                    }
                }
                if top.pos() > next.pos() {
                    // split: the front goes out now, the tail past the newer
                    // key stays in the heap
                    let (cut, resume) = (next.start_pos(), next.pos());
                    let mut front = top.clone();
                    front.cut_back(cut);
                    self.key_mut(top_c).cut_front(resume);
                    self.note_trimmed();
                    self.sift_down(0);
                    if front.size > 0 {
                        return Some(front);
                    }
                } else {
                    let at = next.start_pos();
                    self.key_mut(top_c).cut_back(at);
                    self.note_trimmed();
                }
            }
        }
        None
    }

    fn fixup(&mut self) -> Option<Key> {
        match self.kind {
            KeyKind::BtreePtr => {
                self.btree_ptr_fixup();
                None
            }
            KeyKind::Extent => self.extent_fixup(),
        }
    }
}

impl Iterator for MergeIter<'_> {
    type Item = Key;

    fn next(&mut self) -> Option<Key> {
        loop {
            if let Some(front) = self.fixup() {
                return Some(front);
            }
            let top = *self.heap.first()?;
            // empty extents carry no data once they reach the top
            if self.kind == KeyKind::Extent && self.key(top).size == 0 {
                self.discard(0);
                continue;
            }
            let key = self.key(top).clone();
            self.advance(0);
            return Some(key);
        }
    }
}
