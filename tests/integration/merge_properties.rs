#![allow(missing_docs)]

use cachekeys::{CacheSet, CacheSetOptions, Key, KeyKind, Pointer, RunSet};
use proptest::prelude::*;

const SPAN: usize = 1024;

/// Sorted, disjoint extents for one batch. The pointer generation carries the
/// batch number so the winner of every sector can be traced back.
fn arb_batch() -> impl Strategy<Value = Vec<(u64, u64)>> {
    prop::collection::vec((0u64..24, 1u64..40), 0..12).prop_map(|spans| {
        let mut cursor = 0;
        spans
            .into_iter()
            .map(|(gap, len)| {
                let start = cursor + gap;
                cursor = start + len;
                (start, cursor)
            })
            .collect()
    })
}

fn arb_batches() -> impl Strategy<Value = Vec<Vec<(u64, u64)>>> {
    prop::collection::vec(arb_batch(), 1..6)
}

/// Arbitrary spans in insertion order; they may overlap each other.
fn arb_overlapping_batch() -> impl Strategy<Value = Vec<(u64, u64)>> {
    prop::collection::vec((0u64..400, 1u64..80), 0..12).prop_map(|spans| {
        spans
            .into_iter()
            .map(|(start, len)| (start, start + len))
            .collect()
    })
}

fn extent_set(batches: &[Vec<(u64, u64)>]) -> RunSet {
    let mut set = RunSet::new(KeyKind::Extent);
    for (tag, batch) in batches.iter().enumerate() {
        let keys = batch
            .iter()
            .map(|&(start, end)| {
                Key::extent(start, end).with_ptr(Pointer::new(0, 4096 + start, tag as u8))
            })
            .collect();
        set.push_run(keys);
    }
    set
}

/// Newest batch covering each sector, if any.
fn newest_cover(batches: &[Vec<(u64, u64)>]) -> Vec<Option<u8>> {
    let mut cover = vec![None; SPAN];
    for (tag, batch) in batches.iter().enumerate() {
        for &(start, end) in batch {
            for sector in start..end {
                cover[sector as usize] = Some(tag as u8);
            }
        }
    }
    cover
}

fn cache() -> CacheSet {
    CacheSet::new(&CacheSetOptions::default()).unwrap()
}

/// Like [`extent_set`], but the generation tags batch and slot so later keys
/// inside one batch are distinguishable from earlier ones.
fn slotted_extent_set(batches: &[Vec<(u64, u64)>]) -> (RunSet, Vec<Option<u8>>) {
    let mut set = RunSet::new(KeyKind::Extent);
    let mut cover = vec![None; SPAN];
    for (batch_idx, batch) in batches.iter().enumerate() {
        let mut keys = Vec::with_capacity(batch.len());
        for (slot, &(start, end)) in batch.iter().enumerate() {
            let tag = (batch_idx * 16 + slot) as u8;
            for sector in start..end {
                cover[sector as usize] = Some(tag);
            }
            keys.push(Key::extent(start, end).with_ptr(Pointer::new(0, 4096 + start, tag)));
        }
        set.push_run(keys);
    }
    (set, cover)
}

proptest! {
    #[test]
    fn prop_merged_extents_are_sorted_and_disjoint(batches in arb_batches()) {
        let cache = cache();
        let mut set = extent_set(&batches);
        let out: Vec<Key> = set.iter(&cache).collect();

        for key in &out {
            prop_assert!(key.size > 0, "empty key emitted: {key}");
        }
        for pair in out.windows(2) {
            prop_assert!(
                pair[0].end() <= pair[1].start(),
                "{} overlaps {}", pair[0], pair[1]
            );
        }
    }

    #[test]
    fn prop_newest_batch_wins_every_sector(batches in arb_batches()) {
        let cache = cache();
        let cover = newest_cover(&batches);
        let mut set = extent_set(&batches);

        for key in set.iter(&cache) {
            let tag = key.ptrs[0].gen;
            // pointers move with the trimmed front
            prop_assert_eq!(key.ptrs[0].offset, 4096 + key.start());
            for sector in key.start()..key.end() {
                prop_assert_eq!(cover[sector as usize], Some(tag), "sector {}", sector);
            }
        }
    }

    #[test]
    fn prop_sort_fixup_is_idempotent(batches in arb_batches()) {
        let cache = cache();
        let mut set = extent_set(&batches);
        set.sort_fixup(&cache);
        prop_assert_eq!(set.len(), 1);
        let once = set.runs().to_vec();

        set.sort_fixup(&cache);
        prop_assert_eq!(set.runs(), &once[..]);
        prop_assert!(set.runs()[0].is_sorted(KeyKind::Extent));
    }

    #[test]
    fn prop_btree_pointers_keep_newest_copy(
        batches in prop::collection::vec(prop::collection::btree_set(0u64..32, 0..10), 1..5)
    ) {
        let cache = cache();
        let mut set = RunSet::new(KeyKind::BtreePtr);
        let mut newest = [None; 32];
        for (tag, slots) in batches.iter().enumerate() {
            let keys = slots
                .iter()
                .map(|&slot| {
                    newest[slot as usize] = Some(tag as u8);
                    Key::new(1, (slot + 1) * 64, 64)
                        .with_ptr(Pointer::new(0, 8192 + slot * 64, tag as u8))
                })
                .collect();
            set.push_run(keys);
        }

        let out: Vec<Key> = set.iter(&cache).collect();
        for pair in out.windows(2) {
            prop_assert!(pair[0].pos() < pair[1].pos());
        }
        let expected: Vec<u8> = newest.iter().flatten().copied().collect();
        let tags: Vec<u8> = out.iter().map(|k| k.ptrs[0].gen).collect();
        prop_assert_eq!(tags, expected);
    }

    #[test]
    fn prop_overlapping_batches_merge_newest_first(
        batches in prop::collection::vec(arb_overlapping_batch(), 1..5)
    ) {
        let cache = cache();
        let (mut set, cover) = slotted_extent_set(&batches);
        for run in set.runs() {
            prop_assert!(run.is_sorted(KeyKind::Extent));
            for pair in run.keys().windows(2) {
                prop_assert!(pair[0].end() <= pair[1].start(), "{} overlaps {}", pair[0], pair[1]);
            }
        }

        let out: Vec<Key> = set.iter(&cache).collect();
        for pair in out.windows(2) {
            prop_assert!(pair[0].end() <= pair[1].start(), "{} overlaps {}", pair[0], pair[1]);
        }
        for key in &out {
            prop_assert!(key.size > 0);
            prop_assert_eq!(key.ptrs[0].offset, 4096 + key.start());
            for sector in key.start()..key.end() {
                prop_assert_eq!(cover[sector as usize], Some(key.ptrs[0].gen), "sector {}", sector);
            }
        }
    }
}
