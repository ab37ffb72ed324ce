//! In-memory model of the bucket state owned by the allocator and the
//! garbage collector.
//!
//! The key algebra only reads from here: bucket generations (lock-free),
//! device bounds, GC marks (behind the bucket lock) and the global flags.

mod options;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

pub use options::CacheSetOptions;

use crate::diag::{DiagnosticSink, Inconsistency, TracingSink};
use crate::key::{Pointer, MAX_PTR_DEV};
use crate::stats::KeyStats;
use crate::{Error, Result};

/// Garbage collector's classification of a bucket's contents.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcMark {
    /// Unused.
    #[default]
    Free,
    /// Holds btree nodes.
    Metadata,
    /// Holds data not yet written back.
    Dirty,
    /// Holds clean, reclaimable data.
    Cached,
}

impl fmt::Display for GcMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GcMark::Free => "free",
            GcMark::Metadata => "metadata",
            GcMark::Dirty => "dirty",
            GcMark::Cached => "cached",
        })
    }
}

/// GC-owned state of one bucket, guarded by the bucket lock.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct BucketMark {
    /// Content role assigned by the last GC pass.
    #[serde(default)]
    pub gc_mark: GcMark,
    /// Outstanding references preventing reuse.
    #[serde(default)]
    pub pin: u32,
    /// Eviction priority.
    #[serde(default)]
    pub prio: u16,
}

/// Everything known about one bucket.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct BucketMeta {
    /// Generation counter; wraps at 256.
    pub gen: u8,
    /// Content role assigned by GC.
    #[serde(default)]
    pub gc_mark: GcMark,
    /// Outstanding references preventing reuse.
    #[serde(default)]
    pub pin: u32,
    /// Eviction priority.
    #[serde(default)]
    pub prio: u16,
}

impl BucketMeta {
    fn mark(&self) -> BucketMark {
        BucketMark {
            gc_mark: self.gc_mark,
            pin: self.pin,
            prio: self.prio,
        }
    }
}

/// Valid bucket range of one cache device.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeviceBounds {
    /// First bucket usable for data; earlier buckets hold the superblock.
    pub first_bucket: u64,
    /// Total bucket count.
    pub nbuckets: u64,
}

/// Sector-to-bucket arithmetic.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Geometry {
    bucket_size: u32,
    bucket_bits: u32,
}

impl Geometry {
    /// Creates a geometry for power-of-two `bucket_size` sectors.
    pub fn new(bucket_size: u32) -> Result<Self> {
        if bucket_size == 0 || !bucket_size.is_power_of_two() {
            return Err(Error::Invalid("bucket_size must be a power of two"));
        }
        Ok(Self {
            bucket_size,
            bucket_bits: bucket_size.trailing_zeros(),
        })
    }

    /// Bucket size in sectors.
    pub fn bucket_size(&self) -> u32 {
        self.bucket_size
    }

    /// Bucket holding device sector `offset`.
    pub fn bucket(&self, offset: u64) -> u64 {
        offset >> self.bucket_bits
    }

    /// Offset of `offset` within its bucket.
    pub fn remainder(&self, offset: u64) -> u64 {
        offset & (u64::from(self.bucket_size) - 1)
    }
}

struct Device {
    bounds: DeviceBounds,
    gens: Box<[AtomicU8]>,
}

/// GC marks of every bucket, indexed by device then bucket.
#[derive(Debug, Default)]
pub struct BucketMarks {
    devices: Vec<Vec<BucketMark>>,
}

impl BucketMarks {
    /// Mark of one bucket.
    pub fn get(&self, dev: u16, bucket: u64) -> Option<&BucketMark> {
        self.devices
            .get(usize::from(dev))?
            .get(usize::try_from(bucket).ok()?)
    }

    /// Mutable mark of one bucket.
    pub fn get_mut(&mut self, dev: u16, bucket: u64) -> Option<&mut BucketMark> {
        self.devices
            .get_mut(usize::from(dev))?
            .get_mut(usize::try_from(bucket).ok()?)
    }
}

/// The cache devices and the flags the key algebra consults.
pub struct CacheSet {
    geometry: Geometry,
    devices: Vec<Option<Device>>,
    bucket_lock: Mutex<BucketMarks>,
    expensive_checks: AtomicBool,
    key_merging_disabled: AtomicBool,
    gc_marks_valid: AtomicBool,
    diag: Arc<dyn DiagnosticSink>,
    stats: KeyStats,
}

impl fmt::Debug for CacheSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSet")
            .field("geometry", &self.geometry)
            .field("devices", &self.devices.len())
            .field("expensive_checks", &self.expensive_checks())
            .field("key_merging_disabled", &self.key_merging_disabled())
            .field("gc_marks_valid", &self.gc_marks_valid())
            .finish_non_exhaustive()
    }
}

impl CacheSet {
    /// Builds an empty cache set that logs diagnostics through `tracing`.
    pub fn new(options: &CacheSetOptions) -> Result<Self> {
        let sink = TracingSink::new(
            options.diag_burst,
            Duration::from_millis(options.diag_interval_ms),
        );
        Self::with_sink(options, Arc::new(sink))
    }

    /// Builds an empty cache set reporting to `sink`.
    pub fn with_sink(options: &CacheSetOptions, sink: Arc<dyn DiagnosticSink>) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            geometry: Geometry::new(options.bucket_size)?,
            devices: Vec::new(),
            bucket_lock: Mutex::new(BucketMarks::default()),
            expensive_checks: AtomicBool::new(options.expensive_checks),
            key_merging_disabled: AtomicBool::new(options.key_merging_disabled),
            gc_marks_valid: AtomicBool::new(false),
            diag: sink,
            stats: KeyStats::default(),
        })
    }

    /// Sector-to-bucket arithmetic.
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Attaches a device and returns its id.
    pub fn add_device(&mut self, bounds: DeviceBounds) -> Result<u16> {
        if bounds.first_bucket > bounds.nbuckets {
            return Err(Error::Invalid("first_bucket beyond nbuckets"));
        }
        let nbuckets = usize::try_from(bounds.nbuckets)
            .map_err(|_| Error::Invalid("nbuckets exceeds address space"))?;
        if self.devices.len() > usize::from(MAX_PTR_DEV) {
            return Err(Error::Invalid("too many cache devices"));
        }
        let dev = self.devices.len() as u16;
        let gens = (0..nbuckets).map(|_| AtomicU8::new(0)).collect();
        self.devices.push(Some(Device { bounds, gens }));
        let marks = &mut self.bucket_lock.get_mut().devices;
        marks.resize_with(self.devices.len(), Vec::new);
        marks[usize::from(dev)] = vec![BucketMark::default(); nbuckets];
        tracing::debug!(dev, first_bucket = bounds.first_bucket, nbuckets, "cachekeys.cache.add_device");
        Ok(dev)
    }

    /// Detaches a device; pointers into it become unavailable.
    pub fn remove_device(&mut self, dev: u16) -> Result<()> {
        let slot = self
            .devices
            .get_mut(usize::from(dev))
            .ok_or(Error::NotFound("device"))?;
        if slot.take().is_none() {
            return Err(Error::NotFound("device"));
        }
        self.bucket_lock.get_mut().devices[usize::from(dev)] = Vec::new();
        Ok(())
    }

    fn device_ref(&self, dev: u16) -> Option<&Device> {
        self.devices.get(usize::from(dev))?.as_ref()
    }

    fn gen_slot(&self, dev: u16, bucket: u64) -> Option<&AtomicU8> {
        self.device_ref(dev)?
            .gens
            .get(usize::try_from(bucket).ok()?)
    }

    /// Bucket bounds of an attached device.
    pub fn device(&self, dev: u16) -> Option<DeviceBounds> {
        self.device_ref(dev).map(|device| device.bounds)
    }

    /// Whether the device `ptr` refers to is attached.
    pub fn ptr_available(&self, ptr: &Pointer) -> bool {
        self.device_ref(ptr.dev).is_some()
    }

    /// Bucket number `ptr` points into.
    pub fn ptr_bucket(&self, ptr: &Pointer) -> u64 {
        self.geometry.bucket(ptr.offset)
    }

    /// Current generation of a bucket.
    pub fn bucket_gen(&self, dev: u16, bucket: u64) -> Option<u8> {
        self.gen_slot(dev, bucket)
            .map(|gen| gen.load(Ordering::Acquire))
    }

    /// Generations the bucket behind `ptr` has advanced since it was written.
    pub fn ptr_stale(&self, ptr: &Pointer) -> Option<u8> {
        self.bucket_gen(ptr.dev, self.ptr_bucket(ptr))
            .map(|gen| ptr.stale_distance(gen))
    }

    /// Overwrites a bucket generation.
    pub fn set_bucket_gen(&self, dev: u16, bucket: u64, gen: u8) -> Result<()> {
        self.gen_slot(dev, bucket)
            .ok_or(Error::NotFound("bucket"))?
            .store(gen, Ordering::Release);
        Ok(())
    }

    /// Advances a bucket generation, invalidating every pointer into it.
    pub fn inc_bucket_gen(&self, dev: u16, bucket: u64) -> Result<u8> {
        let slot = self.gen_slot(dev, bucket).ok_or(Error::NotFound("bucket"))?;
        Ok(slot.fetch_add(1, Ordering::AcqRel).wrapping_add(1))
    }

    /// Full metadata of one bucket. Blocks on the bucket lock.
    pub fn bucket(&self, dev: u16, bucket: u64) -> Option<BucketMeta> {
        let gen = self.bucket_gen(dev, bucket)?;
        let marks = self.bucket_lock.lock();
        let mark = marks.get(dev, bucket)?;
        Some(BucketMeta {
            gen,
            gc_mark: mark.gc_mark,
            pin: mark.pin,
            prio: mark.prio,
        })
    }

    /// Replaces the metadata of one bucket. Blocks on the bucket lock.
    pub fn set_bucket(&self, dev: u16, bucket: u64, meta: BucketMeta) -> Result<()> {
        self.set_bucket_gen(dev, bucket, meta.gen)?;
        let mut marks = self.bucket_lock.lock();
        *marks.get_mut(dev, bucket).ok_or(Error::NotFound("bucket"))? = meta.mark();
        Ok(())
    }

    /// Acquires the bucket lock, blocking. Used by the garbage collector.
    pub fn lock_buckets(&self) -> MutexGuard<'_, BucketMarks> {
        self.bucket_lock.lock()
    }

    /// Acquires the bucket lock only if it is free.
    pub fn try_lock_buckets(&self) -> Option<MutexGuard<'_, BucketMarks>> {
        self.bucket_lock.try_lock()
    }

    /// Whether expensive consistency checks are enabled.
    pub fn expensive_checks(&self) -> bool {
        self.expensive_checks.load(Ordering::Relaxed)
    }

    /// Enables or disables expensive consistency checks.
    pub fn set_expensive_checks(&self, enabled: bool) {
        self.expensive_checks.store(enabled, Ordering::Relaxed);
    }

    /// Whether extent coalescing is disabled.
    pub fn key_merging_disabled(&self) -> bool {
        self.key_merging_disabled.load(Ordering::Relaxed)
    }

    /// Enables or disables extent coalescing.
    pub fn set_key_merging_disabled(&self, disabled: bool) {
        self.key_merging_disabled.store(disabled, Ordering::Relaxed);
    }

    /// Whether GC marks reflect a completed marking pass.
    pub fn gc_marks_valid(&self) -> bool {
        self.gc_marks_valid.load(Ordering::Acquire)
    }

    /// Set by the garbage collector when marking finishes, cleared when it
    /// starts.
    pub fn set_gc_marks_valid(&self, valid: bool) {
        self.gc_marks_valid.store(valid, Ordering::Release);
    }

    /// Counters for work done against this cache set.
    pub fn stats(&self) -> &KeyStats {
        &self.stats
    }

    /// Where inconsistencies are reported.
    pub fn diag(&self) -> &dyn DiagnosticSink {
        self.diag.as_ref()
    }

    pub(crate) fn report(&self, event: Inconsistency) {
        self.stats.inc_inconsistencies();
        self.diag.report(&event);
    }
}
