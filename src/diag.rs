//! Fire-and-forget reporting of key inconsistencies.
//!
//! Nothing reported here is fatal to the caller. Keys that trip a report are
//! filtered from use and reclaimed by the next GC-driven node rewrite.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cache::GcMark;
use crate::classify::PtrStatus;
use crate::key::order::KeyKind;

/// One detected inconsistency.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inconsistency {
    /// A key failed the structural check.
    InvalidKey {
        /// Tree family the key was read from.
        kind: KeyKind,
        /// Rendered key.
        key: String,
        /// First pointer problem found.
        status: PtrStatus,
    },
    /// A pointer targets a bucket whose GC mark contradicts the key.
    BadPointer {
        /// Tree family the key was read from.
        kind: KeyKind,
        /// Rendered key.
        key: String,
        /// Index of the offending pointer.
        ptr: usize,
        /// Bucket the pointer targets.
        bucket: u64,
        /// Mark found on that bucket.
        mark: GcMark,
        /// Bucket generation.
        gen: u8,
        /// Bucket pin count.
        pin: u32,
        /// Bucket priority.
        prio: u16,
    },
    /// A pointer lags its bucket by more than the stale tolerance.
    TooStale {
        /// Rendered key.
        key: String,
        /// Index of the offending pointer.
        ptr: usize,
        /// Generation distance.
        stale: u8,
    },
    /// A pointer of a key holding the only copy of its data went stale.
    StaleDirty {
        /// Rendered key.
        key: String,
        /// Index of the offending pointer.
        ptr: usize,
        /// Generation distance.
        stale: u8,
    },
    /// An older key starts exactly where a newer one does but was ordered
    /// first during merging.
    FixupOrder {
        /// Rendered top-of-heap key.
        top: String,
        /// Rendered runner-up key.
        next: String,
    },
}

impl Inconsistency {
    /// Stable event name used in log output.
    pub fn event(&self) -> &'static str {
        match self {
            Inconsistency::InvalidKey { .. } => "cachekeys.classify.invalid_key",
            Inconsistency::BadPointer { .. } => "cachekeys.classify.bad_pointer",
            Inconsistency::TooStale { .. } => "cachekeys.classify.too_stale",
            Inconsistency::StaleDirty { .. } => "cachekeys.classify.stale_dirty",
            Inconsistency::FixupOrder { .. } => "cachekeys.merge.fixup_order",
        }
    }

    /// Whether the event means on-media state disagrees with the index, as
    /// opposed to a key that is merely malformed.
    pub fn is_hard(&self) -> bool {
        !matches!(self, Inconsistency::InvalidKey { .. })
    }
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inconsistency::InvalidKey { kind, key, status } => {
                let what = match kind {
                    KeyKind::BtreePtr => "btree ptr",
                    KeyKind::Extent => "extent",
                };
                write!(f, "spotted {what} {key}: {status}")
            }
            Inconsistency::BadPointer {
                kind,
                key,
                ptr,
                bucket,
                mark,
                gen,
                pin,
                prio,
            } => {
                let what = match kind {
                    KeyKind::BtreePtr => "btree pointer",
                    KeyKind::Extent => "extent pointer",
                };
                write!(
                    f,
                    "inconsistent {what} {key} (ptr {ptr}): bucket {bucket} pin {pin} prio {prio} gen {gen} mark {mark}"
                )
            }
            Inconsistency::TooStale { key, ptr, stale } => {
                write!(f, "key too stale: {stale} (ptr {ptr}) {key}")
            }
            Inconsistency::StaleDirty { key, ptr, stale } => {
                write!(f, "stale dirty pointer: {stale} (ptr {ptr}) {key}")
            }
            Inconsistency::FixupOrder { top, next } => {
                write!(f, "older key {top} sorted ahead of newer key {next} at the same start")
            }
        }
    }
}

/// Receiver for inconsistency reports. Must not block.
pub trait DiagnosticSink: Send + Sync {
    /// Records one inconsistency.
    fn report(&self, event: &Inconsistency);
}

/// Discards every report.
#[derive(Default, Debug)]
pub struct NoopSink;

impl DiagnosticSink for NoopSink {
    fn report(&self, _event: &Inconsistency) {}
}

/// Keeps every report in memory; handy for tests and offline inspection.
#[derive(Default, Debug)]
pub struct RecordingSink {
    events: Mutex<Vec<Inconsistency>>,
}

impl RecordingSink {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies out everything recorded so far.
    pub fn events(&self) -> Vec<Inconsistency> {
        self.events.lock().clone()
    }

    /// Drains everything recorded so far.
    pub fn take(&self) -> Vec<Inconsistency> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl DiagnosticSink for RecordingSink {
    fn report(&self, event: &Inconsistency) {
        self.events.lock().push(event.clone());
    }
}

/// Outcome of asking the rate limiter for permission to log.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Admit {
    /// Log; carries the number of events suppressed since the last window.
    Emit {
        /// Events dropped in earlier windows.
        suppressed: u64,
    },
    /// Drop this event.
    Suppress,
}

#[derive(Debug)]
struct Window {
    start: Instant,
    emitted: u32,
    suppressed: u64,
}

/// Allows `burst` events per `interval`.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    burst: u32,
    window: Mutex<Window>,
}

impl RateLimiter {
    /// Creates a limiter.
    pub fn new(burst: u32, interval: Duration) -> Self {
        Self {
            interval,
            burst,
            window: Mutex::new(Window {
                start: Instant::now(),
                emitted: 0,
                suppressed: 0,
            }),
        }
    }

    /// Decides whether an event occurring `now` may be logged.
    pub fn admit_at(&self, now: Instant) -> Admit {
        let Some(mut window) = self.window.try_lock() else {
            return Admit::Suppress;
        };
        if now.saturating_duration_since(window.start) >= self.interval {
            window.start = now;
            window.emitted = 0;
        }
        if window.emitted < self.burst {
            window.emitted += 1;
            Admit::Emit {
                suppressed: std::mem::take(&mut window.suppressed),
            }
        } else {
            window.suppressed += 1;
            Admit::Suppress
        }
    }

    /// Decides whether an event occurring now may be logged.
    pub fn admit(&self) -> Admit {
        self.admit_at(Instant::now())
    }
}

/// Logs reports through `tracing`, rate limited.
#[derive(Debug)]
pub struct TracingSink {
    limiter: RateLimiter,
}

impl TracingSink {
    /// Creates a sink logging at most `burst` reports per `interval`.
    pub fn new(burst: u32, interval: Duration) -> Self {
        Self {
            limiter: RateLimiter::new(burst, interval),
        }
    }
}

impl DiagnosticSink for TracingSink {
    fn report(&self, event: &Inconsistency) {
        let Admit::Emit { suppressed } = self.limiter.admit() else {
            return;
        };
        if event.is_hard() {
            tracing::error!(event = event.event(), suppressed, "{event}");
        } else {
            tracing::warn!(event = event.event(), suppressed, "{event}");
        }
    }
}
