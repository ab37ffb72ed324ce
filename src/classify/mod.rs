//! Structural and GC-aware key classification.
//!
//! [`is_invalid`] is cheap and purely structural. [`is_bad`] adds device
//! availability, generation staleness and, when expensive checks are enabled,
//! a GC-mark check that only runs if the bucket lock is free.

use std::fmt;

use serde::Serialize;

use crate::cache::{CacheSet, GcMark};
use crate::diag::Inconsistency;
use crate::key::order::KeyKind;
use crate::key::{Key, MAX_PTRS};

/// Generation distance past which a pointer is treated as reused no matter
/// what it points at.
pub const STALE_TOLERANCE: u8 = 96;

/// First problem found on a key, for diagnostics.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PtrStatus {
    /// Nothing wrong.
    Ok,
    /// Key runs past the end of the bucket its pointer starts in.
    LengthTooBig,
    /// Pointer targets a bucket before the device's first bucket.
    ShortOffset,
    /// Pointer targets a bucket past the end of the device.
    OffsetPastEnd,
    /// Bucket generation moved past the pointer.
    Stale,
    /// Key sits at the zero position.
    NullKey,
    /// Key has no pointers.
    NoPointers,
    /// Key has size 0.
    Zeroed,
}

impl PtrStatus {
    /// Short description used in log lines.
    pub fn as_str(self) -> &'static str {
        match self {
            PtrStatus::Ok => "",
            PtrStatus::LengthTooBig => "bad, length too big",
            PtrStatus::ShortOffset => "bad, short offset",
            PtrStatus::OffsetPastEnd => "bad, offset past end of device",
            PtrStatus::Stale => "stale",
            PtrStatus::NullKey => "bad, null key",
            PtrStatus::NoPointers => "bad, no pointers",
            PtrStatus::Zeroed => "zeroed key",
        }
    }
}

impl fmt::Display for PtrStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Describes the first problem with `key`.
pub fn ptr_status(cache: &CacheSet, key: &Key) -> PtrStatus {
    let geometry = cache.geometry();
    for ptr in &key.ptrs {
        let Some(bounds) = cache.device(ptr.dev) else {
            continue;
        };
        let bucket = geometry.bucket(ptr.offset);
        let remainder = geometry.remainder(ptr.offset);
        if u64::from(key.size) + remainder > u64::from(geometry.bucket_size()) {
            return PtrStatus::LengthTooBig;
        }
        if bucket < bounds.first_bucket {
            return PtrStatus::ShortOffset;
        }
        if bucket >= bounds.nbuckets {
            return PtrStatus::OffsetPastEnd;
        }
        if cache.ptr_stale(ptr).is_some_and(|stale| stale > 0) {
            return PtrStatus::Stale;
        }
    }
    if key.is_zero_pos() {
        return PtrStatus::NullKey;
    }
    if key.ptrs.is_empty() {
        return PtrStatus::NoPointers;
    }
    if key.size == 0 {
        return PtrStatus::Zeroed;
    }
    PtrStatus::Ok
}

/// Whether any attached pointer falls outside its device or bucket.
fn ptr_invalid(cache: &CacheSet, key: &Key) -> bool {
    let geometry = cache.geometry();
    key.ptrs.iter().any(|ptr| {
        cache.device(ptr.dev).is_some_and(|bounds| {
            let bucket = geometry.bucket(ptr.offset);
            u64::from(key.size) + geometry.remainder(ptr.offset)
                > u64::from(geometry.bucket_size())
                || bucket < bounds.first_bucket
                || bucket >= bounds.nbuckets
        })
    })
}

fn spotted(cache: &CacheSet, kind: KeyKind, key: &Key) {
    cache.stats().inc_invalid_keys();
    cache.report(Inconsistency::InvalidKey {
        kind,
        key: key.to_string(),
        status: ptr_status(cache, key),
    });
}

fn btree_ptr_invalid(cache: &CacheSet, key: &Key) -> bool {
    let malformed = key.ptrs.len() > MAX_PTRS
        || key.cached
        || (!key.deleted && key.ptrs.is_empty())
        // legacy freeing keys only ever sit at the zero position
        || (!key.is_zero_pos() && key.size == 0)
        || ptr_invalid(cache, key);
    if malformed {
        spotted(cache, KeyKind::BtreePtr, key);
    }
    malformed
}

fn extent_invalid(cache: &CacheSet, key: &Key) -> bool {
    if key.size == 0 {
        return true;
    }
    let malformed = key.ptrs.len() > MAX_PTRS
        || u64::from(key.size) > key.offset
        || ptr_invalid(cache, key);
    if malformed {
        spotted(cache, KeyKind::Extent, key);
    }
    malformed
}

/// Structural check. Every hit other than a size-0 extent is reported.
pub fn is_invalid(cache: &CacheSet, kind: KeyKind, key: &Key) -> bool {
    match kind {
        KeyKind::BtreePtr => btree_ptr_invalid(cache, key),
        KeyKind::Extent => extent_invalid(cache, key),
    }
}

/// Whether a key must not be used: deleted, invalid, pointing at a missing
/// device, stale, or (with expensive checks) contradicting the GC marks.
pub fn is_bad(cache: &CacheSet, kind: KeyKind, key: &Key) -> bool {
    let bad = match kind {
        KeyKind::BtreePtr => btree_ptr_bad(cache, key),
        KeyKind::Extent => extent_bad(cache, key),
    };
    if bad {
        cache.stats().inc_bad_keys();
        tracing::trace!(key = %key, ?kind, "cachekeys.classify.bad");
    }
    bad
}

fn btree_ptr_bad(cache: &CacheSet, key: &Key) -> bool {
    if key.deleted || key.is_zero_pos() || btree_ptr_invalid(cache, key) {
        return true;
    }
    if !key.ptrs.iter().all(|ptr| cache.ptr_available(ptr)) {
        return true;
    }
    if has_stale_ptr(cache, key) {
        return true;
    }
    cache.expensive_checks() && marks_disagree(cache, KeyKind::BtreePtr, key)
}

fn extent_bad(cache: &CacheSet, key: &Key) -> bool {
    if key.deleted || key.ptrs.is_empty() || extent_invalid(cache, key) {
        return true;
    }
    if !key.ptrs.iter().all(|ptr| cache.ptr_available(ptr)) {
        return true;
    }
    if has_stale_ptr(cache, key) {
        return true;
    }
    cache.expensive_checks() && marks_disagree(cache, KeyKind::Extent, key)
}

/// Cached keys tolerate up to [`STALE_TOLERANCE`] generations; keys holding
/// the only copy of their data tolerate none.
fn has_stale_ptr(cache: &CacheSet, key: &Key) -> bool {
    for (idx, ptr) in key.ptrs.iter().enumerate() {
        let Some(stale) = cache.ptr_stale(ptr) else {
            return true;
        };
        if stale == 0 {
            continue;
        }
        cache.stats().inc_stale_pointers();
        if stale > STALE_TOLERANCE {
            cache.report(Inconsistency::TooStale {
                key: key.to_string(),
                ptr: idx,
                stale,
            });
            return true;
        }
        if !key.cached && key.size > 0 {
            cache.report(Inconsistency::StaleDirty {
                key: key.to_string(),
                ptr: idx,
                stale,
            });
            return true;
        }
    }
    false
}

fn mark_allowed(kind: KeyKind, key: &Key, mark: GcMark) -> bool {
    match kind {
        KeyKind::BtreePtr => mark == GcMark::Metadata,
        KeyKind::Extent if key.cached => matches!(mark, GcMark::Dirty | GcMark::Cached),
        KeyKind::Extent => mark == GcMark::Dirty,
    }
}

/// Checks every pointer's bucket mark against the key's role. Skipped when the
/// marks are not valid yet or the bucket lock is contended.
fn marks_disagree(cache: &CacheSet, kind: KeyKind, key: &Key) -> bool {
    if !cache.gc_marks_valid() {
        return false;
    }
    let Some(marks) = cache.try_lock_buckets() else {
        cache.stats().inc_deep_checks_skipped();
        return false;
    };
    cache.stats().inc_deep_checks();
    let mismatch = key.ptrs.iter().enumerate().find_map(|(idx, ptr)| {
        let bucket = cache.ptr_bucket(ptr);
        let mark = *marks.get(ptr.dev, bucket)?;
        (!mark_allowed(kind, key, mark.gc_mark)).then_some((idx, ptr, bucket, mark))
    });
    drop(marks);

    let Some((idx, ptr, bucket, mark)) = mismatch else {
        return false;
    };
    cache.report(Inconsistency::BadPointer {
        kind,
        key: key.to_string(),
        ptr: idx,
        bucket,
        mark: mark.gc_mark,
        gen: cache.bucket_gen(ptr.dev, bucket).unwrap_or_default(),
        pin: mark.pin,
        prio: mark.prio,
    });
    true
}
