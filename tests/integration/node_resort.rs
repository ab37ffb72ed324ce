#![allow(missing_docs)]

use std::sync::{Arc, Barrier, Once};
use std::thread;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use cachekeys::cache::DeviceBounds;
use cachekeys::diag::{Inconsistency, RecordingSink};
use cachekeys::{
    is_bad, BucketMeta, CacheSet, CacheSetOptions, Filter, GcMark, Key, KeyKind, Pointer,
    PtrStatus, RunSet,
};
use tracing_subscriber::EnvFilter;

const BUCKET: u64 = 1024;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("cachekeys=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn setup(options: CacheSetOptions) -> (CacheSet, Arc<RecordingSink>) {
    init_tracing();
    let sink = Arc::new(RecordingSink::new());
    let mut cache = CacheSet::with_sink(&options, sink.clone()).expect("cache set");
    cache
        .add_device(DeviceBounds {
            first_bucket: 1,
            nbuckets: 128,
        })
        .expect("add device");
    (cache, sink)
}

fn ptr(bucket: u64, within: u64, gen: u8) -> Pointer {
    Pointer::new(0, bucket * BUCKET + within, gen)
}

#[test]
fn gc_resort_drops_bad_keys_and_coalesces_the_rest() {
    let (cache, sink) = setup(CacheSetOptions::default());
    cache.set_bucket_gen(0, 5, 200).unwrap();
    cache.set_bucket_gen(0, 6, 4).unwrap();
    cache.set_bucket_gen(0, 7, 10).unwrap();

    let mut node = RunSet::new(KeyKind::Extent);
    node.push_run(vec![
        Key::extent(0, 64).with_ptr(ptr(2, 0, 0)),
        Key::extent(64, 128).with_ptr(ptr(2, 64, 0)),
        // far past the generation tolerance
        Key::extent(200, 232).with_ptr(ptr(5, 0, 0)).with_cached(true),
        // dirty data must never be stale
        Key::extent(300, 310).with_ptr(ptr(6, 0, 3)),
        // cached and slightly stale is still usable
        Key::extent(400, 410).with_ptr(ptr(7, 0, 9)).with_cached(true),
    ]);
    node.push_run(vec![Key::extent(500, 510)
        .with_ptr(ptr(8, 0, 0))
        .with_deleted(true)]);

    let summary = node.resort(&cache, Filter::Bad);
    assert_eq!(summary.keys_in, 6);
    assert_eq!(summary.filtered, 3);
    assert_eq!(summary.coalesced, 1);
    assert_eq!(summary.keys_out, 2);

    assert_eq!(node.len(), 1);
    assert_eq!(node.runs()[0].seq(), 1);
    let keys = node.runs()[0].keys();
    assert_eq!((keys[0].start(), keys[0].end()), (0, 128));
    assert_eq!(keys[0].ptrs[0], ptr(2, 0, 0));
    assert_eq!((keys[1].start(), keys[1].end()), (400, 410));

    let events = sink.take();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], Inconsistency::TooStale { stale: 200, .. }));
    assert!(matches!(events[1], Inconsistency::StaleDirty { stale: 1, .. }));

    let stats = cache.stats().snapshot();
    assert_eq!(stats.bad_keys, 3);
    assert_eq!(stats.stale_pointers, 3);
    assert_eq!(stats.keys_merged, 1);
    assert_eq!(stats.inconsistencies, 2);
}

#[test]
fn read_resort_drops_only_malformed_keys() {
    let (cache, sink) = setup(CacheSetOptions::default());
    cache.set_bucket_gen(0, 3, 50).unwrap();

    let mut node = RunSet::new(KeyKind::Extent);
    node.push_run(vec![
        Key::extent(0, 16).with_ptr(ptr(0, 0, 0)),
        Key::extent(32, 48).with_ptr(ptr(3, 0, 0)),
        Key::extent(64, 80).with_ptr(ptr(4, 0, 0)).with_deleted(true),
    ]);

    let summary = node.resort(&cache, Filter::Invalid);
    assert_eq!(summary.filtered, 1);
    assert_eq!(summary.keys_out, 2);
    let starts: Vec<u64> = node.runs()[0].keys().iter().map(Key::start).collect();
    assert_eq!(starts, vec![32, 64]);

    let events = sink.take();
    assert_eq!(events.len(), 1);
    match &events[0] {
        Inconsistency::InvalidKey { kind, status, .. } => {
            assert_eq!(*kind, KeyKind::Extent);
            assert_eq!(*status, PtrStatus::ShortOffset);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(cache.stats().invalid_keys(), 1);
}

#[test]
fn deep_check_skips_while_gc_holds_the_bucket_lock() {
    let (cache, sink) = setup(CacheSetOptions::default().expensive_checks(true));
    cache.set_gc_marks_valid(true);
    cache
        .set_bucket(
            0,
            9,
            BucketMeta {
                gen: 0,
                gc_mark: GcMark::Cached,
                pin: 2,
                prio: 7,
            },
        )
        .unwrap();
    let dirty = Key::extent(0, 32).with_ptr(ptr(9, 0, 0));

    let held = Barrier::new(2);
    let release = Barrier::new(2);
    thread::scope(|scope| {
        scope.spawn(|| {
            let _marks = cache.lock_buckets();
            held.wait();
            release.wait();
        });
        held.wait();
        assert!(!is_bad(&cache, KeyKind::Extent, &dirty));
        release.wait();
    });
    assert_eq!(cache.stats().deep_checks_skipped(), 1);
    assert!(sink.is_empty());

    assert!(is_bad(&cache, KeyKind::Extent, &dirty));
    assert_eq!(cache.stats().deep_checks(), 1);
    match sink.take().as_slice() {
        [Inconsistency::BadPointer {
            mark, pin, prio, bucket, ..
        }] => {
            assert_eq!(*mark, GcMark::Cached);
            assert_eq!((*bucket, *pin, *prio), (9, 2, 7));
        }
        other => panic!("unexpected events {other:?}"),
    }
}

#[test]
fn deep_check_needs_valid_gc_marks() {
    let (cache, sink) = setup(CacheSetOptions::default().expensive_checks(true));
    let btree = Key::new(1, 4096, 256).with_ptr(ptr(11, 0, 0));

    assert!(!is_bad(&cache, KeyKind::BtreePtr, &btree));
    assert_eq!(cache.stats().deep_checks(), 0);

    cache.set_gc_marks_valid(true);
    assert!(is_bad(&cache, KeyKind::BtreePtr, &btree));
    cache
        .set_bucket(
            0,
            11,
            BucketMeta {
                gc_mark: GcMark::Metadata,
                ..BucketMeta::default()
            },
        )
        .unwrap();
    assert!(!is_bad(&cache, KeyKind::BtreePtr, &btree));
    assert_eq!(sink.len(), 1);
}

#[test]
fn disabled_merging_keeps_neighbours_apart() {
    let (cache, _) = setup(CacheSetOptions::default().key_merging_disabled(true));
    let mut node = RunSet::new(KeyKind::Extent);
    node.push_run(vec![
        Key::extent(0, 8).with_ptr(ptr(2, 0, 0)),
        Key::extent(8, 16).with_ptr(ptr(2, 8, 0)),
    ]);
    let summary = node.resort(&cache, Filter::KeepAll);
    assert_eq!(summary.coalesced, 0);
    assert_eq!(node.key_count(), 2);
}

#[test]
fn repeated_batches_converge_to_newest_data() {
    let (cache, _) = setup(CacheSetOptions::default());
    let mut node = RunSet::new(KeyKind::Extent);
    for round in 0..4u8 {
        let base = u64::from(round) * 16;
        node.push_run(vec![Key::extent(base, base + 64).with_ptr(ptr(20, base, round))]);
    }
    node.sort_fixup(&cache);
    let spans: Vec<(u64, u64, u8)> = node.runs()[0]
        .keys()
        .iter()
        .map(|k| (k.start(), k.end(), k.ptrs[0].gen))
        .collect();
    assert_eq!(spans, vec![(0, 16, 0), (16, 32, 1), (32, 48, 2), (48, 112, 3)]);
    assert_eq!(node.runs()[0].seq(), 3);
}

#[test]
fn seeded_resort_is_stable_on_its_own_output() {
    let (cache, _) = setup(CacheSetOptions::default());
    let mut rng = ChaCha8Rng::seed_from_u64(0xcac4e);
    for _ in 0..32 {
        let mut node = RunSet::new(KeyKind::Extent);
        for _ in 0..rng.gen_range(1..6) {
            let mut cursor = rng.gen_range(0..256u64);
            let mut batch = Vec::new();
            for _ in 0..rng.gen_range(0..24) {
                cursor += rng.gen_range(0..8u64);
                let len = rng.gen_range(1..32u64);
                // sequential writes land back to back in bucket 40
                let within = cursor.min(BUCKET - len);
                batch.push(Key::extent(cursor, cursor + len).with_ptr(ptr(40, within, 0)));
                cursor += len;
            }
            node.push_run(batch);
        }

        node.resort(&cache, Filter::KeepAll);
        let once = node.runs().to_vec();
        for pair in once[0].keys().windows(2) {
            assert!(pair[0].end() <= pair[1].start(), "{} overlaps {}", pair[0], pair[1]);
        }

        let again = node.resort(&cache, Filter::KeepAll);
        assert_eq!(again.coalesced, 0);
        assert_eq!(node.runs(), &once[..]);
    }
}
