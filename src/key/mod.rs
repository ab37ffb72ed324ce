//! Keys, pointers and positions.
//!
//! A [`Key`] names the half-open logical range `[offset - size, offset)` of one
//! backing inode and carries up to [`MAX_PTRS`] replica [`Pointer`]s into cache
//! buckets. Size-0 keys are tombstones in extent trees and legacy freeing keys
//! in btree-pointer trees.

/// Fixed 64-bit word encoding.
pub mod codec;
/// Comparators used to drive run merging.
pub mod order;

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Maximum number of replica pointers a key may carry.
pub const MAX_PTRS: usize = 7;
/// Largest representable key size in sectors.
pub const MAX_KEY_SIZE: u16 = u16::MAX;
/// Largest inode number the header bitfield can hold.
pub const MAX_INODE: u64 = (1 << 20) - 1;
/// Largest device id a pointer can hold.
pub const MAX_PTR_DEV: u16 = (1 << 12) - 1;
/// Largest device sector a pointer can hold.
pub const MAX_PTR_OFFSET: u64 = (1 << 43) - 1;

/// Position of the legacy "freeing" key.
pub const ZERO_KEY: Pos = Pos::new(0, 0);

/// A point in the logical address space, ordered inode first.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct Pos {
    /// Backing inode.
    pub inode: u64,
    /// Sector offset within the inode.
    pub offset: u64,
}

impl Pos {
    /// Creates a position.
    pub const fn new(inode: u64, offset: u64) -> Self {
        Self { inode, offset }
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.inode, self.offset)
    }
}

/// One replica location of a key's data.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct Pointer {
    /// Cache device id.
    pub dev: u16,
    /// Device sector where the first sector of the key lives.
    pub offset: u64,
    /// Bucket generation observed when the pointer was written.
    pub gen: u8,
}

impl Pointer {
    /// Creates a pointer.
    pub const fn new(dev: u16, offset: u64, gen: u8) -> Self {
        Self { dev, offset, gen }
    }

    /// Returns the same pointer moved `sectors` further into the device.
    pub const fn advanced(self, sectors: u64) -> Self {
        Self {
            offset: self.offset + sectors,
            ..self
        }
    }

    /// Generations the bucket has moved past this pointer, modulo 256.
    pub const fn stale_distance(&self, bucket_gen: u8) -> u8 {
        bucket_gen.wrapping_sub(self.gen)
    }
}

/// A cache index entry.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct Key {
    /// Backing inode.
    pub inode: u64,
    /// Logical end of the range (exclusive).
    pub offset: u64,
    /// Length in sectors; the range starts at `offset - size`.
    pub size: u16,
    /// Data is a disposable copy of backing-store content.
    #[serde(default)]
    pub cached: bool,
    /// Key is logically deleted.
    #[serde(default)]
    pub deleted: bool,
    /// Replica pointers.
    #[serde(default)]
    pub ptrs: SmallVec<[Pointer; 2]>,
    /// Data checksum; its presence is the checksum flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<u64>,
}

impl Key {
    /// Creates a dirty key without pointers.
    pub fn new(inode: u64, offset: u64, size: u16) -> Self {
        Self {
            inode,
            offset,
            size,
            ..Self::default()
        }
    }

    /// Creates a dirty inode-0 extent covering `[start, end)`.
    ///
    /// # Panics
    ///
    /// Panics if the range is reversed or longer than [`MAX_KEY_SIZE`].
    pub fn extent(start: u64, end: u64) -> Self {
        assert!(start <= end, "extent range reversed");
        let size = u16::try_from(end - start).expect("extent longer than MAX_KEY_SIZE");
        Self::new(0, end, size)
    }

    /// Appends a pointer.
    pub fn with_ptr(mut self, ptr: Pointer) -> Self {
        self.ptrs.push(ptr);
        self
    }

    /// Sets the cached flag.
    pub fn with_cached(mut self, cached: bool) -> Self {
        self.cached = cached;
        self
    }

    /// Sets the deleted flag.
    pub fn with_deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }

    /// Attaches a checksum.
    pub fn with_checksum(mut self, checksum: u64) -> Self {
        self.checksum = Some(checksum);
        self
    }

    /// End position of the key.
    pub fn pos(&self) -> Pos {
        Pos::new(self.inode, self.offset)
    }

    /// Start position of the key.
    pub fn start_pos(&self) -> Pos {
        Pos::new(self.inode, self.start())
    }

    /// Logical start sector. Saturates at zero for structurally invalid keys.
    pub fn start(&self) -> u64 {
        self.offset.saturating_sub(u64::from(self.size))
    }

    /// Logical end sector (exclusive).
    pub fn end(&self) -> u64 {
        self.offset
    }

    /// Whether the key sits at the legacy freeing-key position.
    pub fn is_zero_pos(&self) -> bool {
        self.pos() == ZERO_KEY
    }

    /// Whether the checksum flag is set.
    pub fn checksum_present(&self) -> bool {
        self.checksum.is_some()
    }

    fn set_pos(&mut self, pos: Pos) {
        self.inode = pos.inode;
        self.offset = pos.offset;
    }

    /// Drops everything in front of `at`, advancing the pointers to match.
    ///
    /// Returns `false` when `at` does not lie past the key's start. If `at` is
    /// at or beyond the end the key collapses to size 0 at `at`.
    pub fn cut_front(&mut self, at: Pos) -> bool {
        if at <= self.start_pos() {
            return false;
        }
        let len = if at < self.pos() {
            self.offset - at.offset
        } else {
            self.set_pos(at);
            0
        };
        let removed = u64::from(self.size) - len;
        for ptr in &mut self.ptrs {
            ptr.offset += removed;
        }
        self.size = len as u16;
        true
    }

    /// Drops everything at and after `at`.
    ///
    /// Returns `false` when `at` is at or past the key's end. If `at` is at or
    /// before the start the key collapses to size 0 at `at`.
    pub fn cut_back(&mut self, at: Pos) -> bool {
        if at >= self.pos() {
            return false;
        }
        debug_assert_eq!(at.inode, self.inode, "cut_back across inodes");
        let len = if at > self.start_pos() {
            at.offset - self.start()
        } else {
            0
        };
        self.set_pos(at);
        self.size = len as u16;
        true
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} len {} -> [", self.inode, self.offset, self.size)?;
        for (idx, ptr) in self.ptrs.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}:{} gen {}", ptr.dev, ptr.offset, ptr.gen)?;
        }
        f.write_str("]")?;
        f.write_str(if self.cached { " cached" } else { " dirty" })?;
        if self.deleted {
            f.write_str(" deleted")?;
        }
        if let Some(csum) = self.checksum {
            write!(f, " cs{csum:x}")?;
        }
        Ok(())
    }
}
