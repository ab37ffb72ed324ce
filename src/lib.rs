//! Extent and key algebra for a bucket-based block cache.
//!
//! Btree leaf nodes keep several batches ("runs") of keys instead of one fully
//! sorted array. This crate merges those runs while resolving duplicates and
//! overlaps, classifies keys against bucket generations and GC marks, and
//! coalesces adjacent extents.

#![warn(missing_docs)]

pub mod cache;
pub mod classify;
pub mod coalesce;
pub mod diag;
mod error;
pub mod key;
pub mod merge;
pub mod stats;

pub use cache::{BucketMeta, CacheSet, CacheSetOptions, GcMark};
pub use classify::{is_bad, is_invalid, ptr_status, PtrStatus, STALE_TOLERANCE};
pub use coalesce::try_merge;
pub use error::{Error, Result};
pub use key::order::{compare, KeyKind, KeyRef, Recency};
pub use key::{Key, Pointer, Pos, MAX_KEY_SIZE, MAX_PTRS, ZERO_KEY};
pub use merge::{resort, sort_fixup, Filter, MergeIter, ResortSummary, Run, RunSet};
