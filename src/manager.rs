//! Buffer manager: owns the reserved region and the three buffer pools.
//!
//! One contiguous virtual range is reserved at init and sliced into equal
//! buffers. Buffers move between three lock-free pools:
//!
//! - **free**: committed, no owner
//! - **leased**: committed, owned by a thread or awaiting flush
//! - **uncommitted**: no physical pages
//!
//! The flush walk hands leased buffers to a visitor one at a time and then
//! recycles them, uncommitting down to a caller-supplied goal so committed
//! memory tracks demand. Buffers whose visit may be interrupted by a
//! safepoint are parked on a private `not_finished` list that the
//! safepoint-time enumerator also walks.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, warn};

use crate::alist::AList;
use crate::error::CrsError;
use crate::platform;
use crate::runtime::CrsThread;
use crate::tlb::Tlb;
use crate::stat_bump;
use crate::{INITIAL_COMMIT_ESTIMATE, MAX_BUFFER_SIZE, MIN_BUFFERS, NOMINAL_BUFFER_SIZE};

/// The reservation itself; releases the whole range on drop.
#[derive(Debug)]
struct Region {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: the region is plain address space handed out to Tlbs that the
// same manager owns.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { platform::release(self.base.as_ptr(), self.size) };
    }
}

#[derive(Debug)]
pub struct TlbManager {
    region: Region,
    buffers: Box<[Tlb]>,
    buffer_size: usize,

    free: AList,
    leased: AList,
    uncommitted: AList,
    /// Buffers deferred mid-flush (still owned) plus the one currently
    /// being visited. Touched only by the single flusher outside
    /// safepoints; read by the eviction enumerator inside them.
    not_finished: AList,

    /// Sum of `buffer_size` over leased buffers.
    bytes_used: AtomicUsize,
    /// High-water mark of `bytes_used` since the last flush.
    hwm: AtomicUsize,
    /// Buffers not on the uncommitted list.
    num_committed: AtomicUsize,
}

impl TlbManager {
    /// Reserve `area_size` bytes, slice it into buffers, and commit the
    /// initial estimate.
    pub fn new(area_size: usize) -> Result<Self, CrsError> {
        let page = platform::page_size();
        let buffer_size = choose_buffer_size(page);
        let count = area_size / buffer_size;
        if count < MIN_BUFFERS {
            return Err(CrsError::ArenaTooSmall(area_size));
        }
        let total = count * buffer_size;

        let base = unsafe { platform::reserve(total) };
        let base = NonNull::new(base).ok_or(CrsError::Reserve(total))?;
        let region = Region { base, size: total };

        let buffers: Box<[Tlb]> = (0..count)
            .map(|i| Tlb::new(unsafe { base.as_ptr().add(i * buffer_size) }, buffer_size))
            .collect();

        // Commit the first `estimate` buffers in one contiguous call.
        let estimate = (INITIAL_COMMIT_ESTIMATE / buffer_size).clamp(1, count);
        if !unsafe { platform::commit(base.as_ptr(), estimate * buffer_size) } {
            return Err(CrsError::InitialCommit);
        }

        let manager = Self {
            region,
            buffers,
            buffer_size,
            free: AList::new(),
            leased: AList::new(),
            uncommitted: AList::new(),
            not_finished: AList::new(),
            bytes_used: AtomicUsize::new(0),
            hwm: AtomicUsize::new(0),
            num_committed: AtomicUsize::new(estimate),
        };
        for tlb in manager.buffers[..estimate].iter() {
            manager.free.push(NonNull::from(tlb));
        }
        for tlb in manager.buffers[estimate..].iter() {
            manager.uncommitted.push(NonNull::from(tlb));
        }
        debug!(
            "crs buffer area: {} buffers of {} bytes, {} committed",
            count, buffer_size, estimate
        );
        Ok(manager)
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    #[inline]
    pub fn area_size(&self) -> usize {
        self.region.size
    }

    #[inline]
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    #[inline]
    pub fn bytes_used(&self) -> usize {
        self.bytes_used.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn num_committed(&self) -> usize {
        self.num_committed.load(Ordering::Relaxed)
    }

    /// Find or lease a buffer with at least `size` bytes free for
    /// `thread`. Returns the buffer and whether it is a fresh lease (the
    /// caller's previous buffer, if any, was released for flushing).
    /// `None` means the pools are exhausted: overflow.
    pub fn ensure(&self, thread: &CrsThread, size: usize) -> Option<(NonNull<Tlb>, bool)> {
        debug_assert!(size <= self.buffer_size);

        if let Some(cur) = thread.current() {
            if unsafe { cur.as_ref() }.remaining() >= size {
                return Some((cur, false));
            }
            // Full: give it up for the next flush. It stays on `leased`.
            unsafe { cur.as_ref() }.release();
            thread.clear();
        }

        let tlb = match self.free.pop() {
            Some(t) => t,
            None => {
                let t = self.uncommitted.pop()?;
                let tref = unsafe { t.as_ref() };
                if !unsafe { platform::commit(tref.base(), tref.size()) } {
                    warn!("crs buffer commit failed");
                    self.uncommitted.push(t);
                    return None;
                }
                stat_bump!(commit_count);
                self.num_committed.fetch_add(1, Ordering::Relaxed);
                t
            }
        };

        unsafe { tlb.as_ref() }.lease(thread.id());
        thread.set(tlb);
        self.leased.push(tlb);
        stat_bump!(lease_count);
        let used = self.bytes_used.fetch_add(self.buffer_size, Ordering::Relaxed) + self.buffer_size;
        self.hwm.fetch_max(used, Ordering::Relaxed);
        Some((tlb, true))
    }

    /// Compute the flush commit goal from the smoothed demand curve and
    /// reset the high-water mark for the next interval.
    pub fn take_committed_goal(&self) -> usize {
        let used = self.bytes_used.load(Ordering::Relaxed);
        let hwm = self.hwm.swap(used, Ordering::Relaxed);
        (hwm + used) / 2
    }

    /// Drain leased buffers through `visitor`, then recycle them, and
    /// uncommit down to `committed_goal` bytes.
    ///
    /// Still-owned buffers are deferred to the next flush. The buffer
    /// currently being visited is parked on `not_finished` so that a
    /// safepoint provoked by the visitor can still enumerate it.
    ///
    /// Single-dispatcher: callers must serialize flushes (the arena's
    /// flush gate does).
    pub fn flush_buffers(&self, visitor: &mut dyn FnMut(&Tlb), committed_goal: usize) {
        let goal_buffers = committed_goal / self.buffer_size;
        let mut to_uncommit = self
            .num_committed
            .load(Ordering::Relaxed)
            .saturating_sub(goal_buffers);
        // Chain of buffers uncommitted during this walk, pushed in one go
        // at the end.
        let mut uncommit_batch: Option<NonNull<Tlb>> = None;

        while let Some(tlb) = self.leased.pop() {
            let tref = unsafe { tlb.as_ref() };
            if tref.owner() != crate::tlb::NO_OWNER {
                // Thread is still writing; keep it discoverable and skip.
                self.not_finished.push(tlb);
                stat_bump!(deferred_count);
                continue;
            }

            // Park while visiting: the visitor may enter a safepoint, and
            // the eviction walk must be able to see this buffer.
            self.not_finished.push(tlb);
            visitor(tref);
            let parked = self.not_finished.pop();
            debug_assert_eq!(parked, Some(tlb));

            self.bytes_used.fetch_sub(self.buffer_size, Ordering::Relaxed);
            if to_uncommit > 0 && unsafe { platform::uncommit(tref.base(), tref.size()) } {
                stat_bump!(uncommit_count);
                self.num_committed.fetch_sub(1, Ordering::Relaxed);
                to_uncommit -= 1;
                chain_push(&mut uncommit_batch, tlb);
            } else {
                self.free.push(tlb);
            }
        }

        // Deferred buffers go back to leased for the next flush.
        if let Some(chain) = self.not_finished.take_all() {
            self.leased.push_list(chain);
        }

        // Still over the goal: shed free buffers too.
        while to_uncommit > 0 {
            let Some(tlb) = self.free.pop() else { break };
            let tref = unsafe { tlb.as_ref() };
            if unsafe { platform::uncommit(tref.base(), tref.size()) } {
                stat_bump!(uncommit_count);
                self.num_committed.fetch_sub(1, Ordering::Relaxed);
                to_uncommit -= 1;
                chain_push(&mut uncommit_batch, tlb);
            } else {
                self.free.push(tlb);
                break;
            }
        }

        if let Some(chain) = uncommit_batch {
            self.uncommitted.push_list(chain);
        }
        stat_bump!(flush_count);
    }

    /// Visit every buffer that may still hold live records: the leased
    /// pool plus the flusher's private `not_finished` list.
    ///
    /// # Safety
    /// Caller must run inside a safepoint (or otherwise exclude concurrent
    /// pool mutation and buffer writes).
    pub unsafe fn leased_buffers_do(&self, f: &mut dyn FnMut(&Tlb)) {
        unsafe {
            self.leased.for_each(f);
            self.not_finished.for_each(f);
        }
    }
}

fn chain_push(chain: &mut Option<NonNull<Tlb>>, tlb: NonNull<Tlb>) {
    let next = chain.map_or(core::ptr::null_mut(), NonNull::as_ptr);
    unsafe { tlb.as_ref() }.next.store(next, Ordering::Relaxed);
    *chain = Some(tlb);
}

/// Buffer size: the nominal 8 KiB target rounded up to a page multiple,
/// capped at 64 KiB (the 16-bit record length bounds buffer size).
fn choose_buffer_size(page: usize) -> usize {
    let b = NOMINAL_BUFFER_SIZE.max(page).div_ceil(page) * page;
    if b <= MAX_BUFFER_SIZE {
        b
    } else {
        (MAX_BUFFER_SIZE / page).max(1) * page
    }
}
