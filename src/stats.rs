//! Recording statistics counters.
//!
//! All counters use `Relaxed` ordering — they are observational only and
//! never used for synchronization; the pools and the event mutex provide
//! the ordering guarantees for correctness.
//!
//! Code bumps counters through [`stat_bump!`](crate::stat_bump), which
//! erases itself unless the crate is built with the `stats` feature.
//! Obtain a [`Snapshot`] with [`snapshot()`]. Individual counter loads are
//! each atomic but the snapshot as a whole is not globally consistent.

#[cfg(feature = "stats")]
use core::sync::atomic::{AtomicU64, Ordering};

/// Bump a recording counter: `stat_bump!(lease_count)` increments by one,
/// `stat_bump!(drop_bytes, n)` adds `n`. Without the `stats` feature the
/// invocation compiles away entirely, amount expression included, so the
/// hot posting paths carry no counter cost by default.
#[macro_export]
macro_rules! stat_bump {
    ($counter:ident) => {
        $crate::stat_bump!($counter, 1u64);
    };
    ($counter:ident, $amount:expr) => {
        #[cfg(feature = "stats")]
        {
            use ::core::sync::atomic::Ordering::Relaxed;
            $crate::stats::STATS.$counter.fetch_add($amount as u64, Relaxed);
        }
    };
}

#[cfg(feature = "stats")]
pub(crate) struct Stats {
    // ---- posting ----
    /// Records successfully posted by application threads.
    pub post_count: AtomicU64,
    /// Bytes of records dropped (overflow and oversized posts).
    pub drop_bytes: AtomicU64,

    // ---- buffers ----
    /// Buffer leases handed out.
    pub lease_count: AtomicU64,
    /// Page commits performed on demand.
    pub commit_count: AtomicU64,
    /// Buffers uncommitted by the flush walk.
    pub uncommit_count: AtomicU64,
    /// Flush walks completed.
    pub flush_count: AtomicU64,
    /// Buffers deferred by a flush because their owner was still writing.
    pub deferred_count: AtomicU64,

    // ---- eviction ----
    /// Self-describing records written by the eviction protocol.
    pub blown_count: AtomicU64,
    /// Records rewritten to tombstones (flush delivery and eviction).
    pub tombstone_count: AtomicU64,

    // ---- events ----
    /// Events scheduled on the latch queue.
    pub event_count: AtomicU64,
}

#[cfg(feature = "stats")]
impl Stats {
    const fn new() -> Self {
        Self {
            post_count: AtomicU64::new(0),
            drop_bytes: AtomicU64::new(0),
            lease_count: AtomicU64::new(0),
            commit_count: AtomicU64::new(0),
            uncommit_count: AtomicU64::new(0),
            flush_count: AtomicU64::new(0),
            deferred_count: AtomicU64::new(0),
            blown_count: AtomicU64::new(0),
            tombstone_count: AtomicU64::new(0),
            event_count: AtomicU64::new(0),
        }
    }
}

#[cfg(feature = "stats")]
pub(crate) static STATS: Stats = Stats::new();

/// A point-in-time snapshot of all recording statistics.
#[cfg(feature = "stats")]
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    /// Records successfully posted by application threads.
    pub post_count: u64,
    /// Bytes of records dropped (overflow and oversized posts).
    pub drop_bytes: u64,
    /// Buffer leases handed out.
    pub lease_count: u64,
    /// Page commits performed on demand.
    pub commit_count: u64,
    /// Buffers uncommitted by the flush walk.
    pub uncommit_count: u64,
    /// Flush walks completed.
    pub flush_count: u64,
    /// Buffers deferred by a flush because their owner was still writing.
    pub deferred_count: u64,
    /// Self-describing records written by the eviction protocol.
    pub blown_count: u64,
    /// Records rewritten to tombstones.
    pub tombstone_count: u64,
    /// Events scheduled on the latch queue.
    pub event_count: u64,
}

/// Load all counters with `Relaxed` ordering and return a [`Snapshot`].
#[cfg(feature = "stats")]
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        post_count: s.post_count.load(Ordering::Relaxed),
        drop_bytes: s.drop_bytes.load(Ordering::Relaxed),
        lease_count: s.lease_count.load(Ordering::Relaxed),
        commit_count: s.commit_count.load(Ordering::Relaxed),
        uncommit_count: s.uncommit_count.load(Ordering::Relaxed),
        flush_count: s.flush_count.load(Ordering::Relaxed),
        deferred_count: s.deferred_count.load(Ordering::Relaxed),
        blown_count: s.blown_count.load(Ordering::Relaxed),
        tombstone_count: s.tombstone_count.load(Ordering::Relaxed),
        event_count: s.event_count.load(Ordering::Relaxed),
    }
}
