//! Coalescing of adjacent extents.

use crate::cache::CacheSet;
use crate::key::{Key, MAX_KEY_SIZE};

fn merge_checksums(l: u64, r: u64) -> u64 {
    l.wrapping_add(r) & !(1u64 << 63)
}

/// Tries to fold `r` into `l`.
///
/// Both keys must share flags and pointer count, `r` must start where `l`
/// ends, and every pointer of `r` must continue the matching pointer of `l`
/// inside the same bucket. Returns `true` when `l` absorbed `r` and the caller
/// should discard `r`.
///
/// When the combined size would not fit in a key, `l` grows to
/// [`MAX_KEY_SIZE`], `r` loses the sectors `l` took over, and `false` is
/// returned with both keys still in use.
pub fn try_merge(cache: &CacheSet, l: &mut Key, r: &mut Key) -> bool {
    if cache.key_merging_disabled() {
        return false;
    }
    if l.ptrs.len() != r.ptrs.len()
        || l.deleted != r.deleted
        || l.cached != r.cached
        || l.pos() != r.start_pos()
    {
        return false;
    }

    let geometry = cache.geometry();
    let contiguous = l.ptrs.iter().zip(&r.ptrs).all(|(lp, rp)| {
        lp.advanced(u64::from(l.size)) == *rp
            && geometry.bucket(lp.offset) == geometry.bucket(rp.offset)
    });
    if !contiguous {
        return false;
    }

    // keys without pointers are not confined to one bucket and can overflow
    let total = u32::from(l.size) + u32::from(r.size);
    if total > u32::from(MAX_KEY_SIZE) {
        l.offset += u64::from(MAX_KEY_SIZE - l.size);
        l.size = MAX_KEY_SIZE;
        r.cut_front(l.pos());
        cache.stats().inc_partial_merges();
        return false;
    }

    if let Some(lsum) = l.checksum {
        l.checksum = r.checksum.map(|rsum| merge_checksums(lsum, rsum));
    }
    l.offset += u64::from(r.size);
    l.size = total as u16;
    cache.stats().inc_keys_merged();
    true
}
