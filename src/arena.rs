//! Record arena: the allocator every message post-routine goes through.
//!
//! The arena fronts the buffer manager with a thread-indexed bump
//! allocator. The fast path is one atomic-free capacity check against the
//! thread's current buffer; the slow path leases (and, rarely, commits) a
//! fresh one. Exhaustion sets a sticky overflow flag that quietly drops
//! further posts until the next flush clears it and reports the damage.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::debug;
use parking_lot::Mutex;

use crate::error::CrsError;
use crate::manager::TlbManager;
use crate::record::{self, RecordSink};
use crate::runtime::CrsThread;
use crate::stat_bump;
use crate::tlb::{RefCategory, align_record};

/// What a flush accomplished.
#[derive(Clone, Copy, Debug, Default)]
pub struct FlushReport {
    /// Records delivered to the sink.
    pub delivered: usize,
    /// Bytes of records dropped since the previous flush (overflow and
    /// oversized posts).
    pub dropped_bytes: usize,
    /// Whether the overflow flag was set when this flush started.
    pub overflowed: bool,
}

pub struct RecordArena {
    manager: TlbManager,
    /// Sticky until the next flush; posts are refused while set.
    overflow: AtomicBool,
    dropped_bytes: AtomicUsize,
    /// Flushing leases buffers to a single dispatcher.
    flush_gate: Mutex<()>,
}

impl RecordArena {
    pub fn new(area_size: usize) -> Result<Self, CrsError> {
        Ok(Self {
            manager: TlbManager::new(area_size)?,
            overflow: AtomicBool::new(false),
            dropped_bytes: AtomicUsize::new(0),
            flush_gate: Mutex::new(()),
        })
    }

    #[inline]
    pub(crate) fn manager(&self) -> &TlbManager {
        &self.manager
    }

    #[inline]
    pub fn overflowed(&self) -> bool {
        self.overflow.load(Ordering::Relaxed)
    }

    /// Allocate `size` bytes in `thread`'s buffer, leasing one if needed.
    /// Returns `None` and accounts the drop when the arena is overflowed
    /// or the size can never fit.
    pub fn alloc(&self, size: usize, thread: &CrsThread) -> Option<NonNull<u8>> {
        // Capacity checks and the bump both work on the aligned size.
        let size = align_record(size);
        if !self.admit(size) {
            return None;
        }
        let (tlb, _) = match self.manager.ensure(thread, size) {
            Some(lease) => lease,
            None => return self.hit_overflow(size),
        };
        // ensure() guarantees capacity.
        unsafe { tlb.as_ref() }.alloc(size)
    }

    /// Reference-aware allocation for records that may back-reference an
    /// anchor of the same category in the same buffer.
    ///
    /// `is_new_reference` is in/out: the caller's payload comparison comes
    /// in; rotation to a different buffer forces it to true (the previous
    /// buffer's anchor is no longer reachable). On a new reference the
    /// allocation is `size_full` bytes and becomes the buffer's anchor;
    /// otherwise `size_short` bytes.
    pub fn alloc_reference(
        &self,
        cat: RefCategory,
        is_new_reference: &mut bool,
        size_short: usize,
        size_full: usize,
        thread: &CrsThread,
    ) -> Option<NonNull<u8>> {
        debug_assert!(size_short <= size_full);
        let size_short = align_record(size_short);
        let size_full = align_record(size_full);
        if !self.admit(size_full) {
            return None;
        }
        let (tlb, fresh) = match self.manager.ensure(thread, size_full) {
            Some(lease) => lease,
            None => return self.hit_overflow(size_full),
        };
        if fresh {
            *is_new_reference = true;
        }
        let size = if *is_new_reference { size_full } else { size_short };
        let tlb = unsafe { tlb.as_ref() };
        let p = tlb.alloc(size)?;
        if *is_new_reference {
            let offset = p.as_ptr() as usize - tlb.base() as usize;
            tlb.set_reference(cat, offset as u32);
        }
        Some(p)
    }

    /// Drop the thread's current buffer so the next flush can evacuate
    /// it. Called on thread exit and by safepoint release-all operations.
    pub fn release_thread(&self, thread: &CrsThread) {
        if let Some(tlb) = thread.current() {
            unsafe { tlb.as_ref() }.release();
            thread.clear();
        }
    }

    /// Two-stage flush: lease every evacuable buffer to this dispatcher,
    /// deliver its records to `sink`, recycle or uncommit the buffers
    /// against the smoothed demand goal, then clear overflow.
    pub fn flush(&self, sink: &mut dyn RecordSink) -> FlushReport {
        let _dispatcher = self.flush_gate.lock();

        let overflowed = self.overflow.load(Ordering::Relaxed);
        let goal = self.manager.take_committed_goal();

        let mut delivered = 0usize;
        self.manager.flush_buffers(
            &mut |tlb| {
                delivered += unsafe { record::process_buffer(tlb, sink) };
            },
            goal,
        );

        self.overflow.store(false, Ordering::Relaxed);
        let dropped = self.dropped_bytes.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            debug!("crs flush: {dropped} bytes of records lost to overflow");
        }
        FlushReport {
            delivered,
            dropped_bytes: dropped,
            overflowed,
        }
    }

    /// Pre-admission check: refuse while overflowed, and refuse sizes
    /// that can never fit a buffer (without poisoning the overflow flag).
    fn admit(&self, size: usize) -> bool {
        if size > self.manager.buffer_size() || size > u16::MAX as usize {
            debug!("crs: dropping oversized record ({size} bytes)");
            self.count_drop(size);
            return false;
        }
        if self.overflow.load(Ordering::Relaxed) {
            self.count_drop(size);
            return false;
        }
        true
    }

    #[cold]
    fn hit_overflow(&self, size: usize) -> Option<NonNull<u8>> {
        if !self.overflow.swap(true, Ordering::Relaxed) {
            debug!("crs: record arena overflow, dropping posts until next flush");
        }
        self.count_drop(size);
        None
    }

    fn count_drop(&self, size: usize) {
        self.dropped_bytes.fetch_add(size, Ordering::Relaxed);
        stat_bump!(drop_bytes, size);
    }
}
