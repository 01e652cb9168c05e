//! Intrusive lock-free LIFO of buffers.
//!
//! A Treiber stack with one twist: `pop` swings the head to a per-list
//! sentinel address while it detaches the top node. Pushers and other
//! poppers spin while the sentinel is installed, which makes `pop`
//! ABA-safe without generation counters. Pushes are wait-free whenever no
//! pop is mid-flight.
//!
//! Items carry the link themselves (`Tlb::next`); a buffer must be on at
//! most one list at a time.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::tlb::Tlb;

#[derive(Debug)]
pub struct AList {
    head: AtomicPtr<Tlb>,
    /// Never linked or dereferenced; only its address is used as the
    /// pop-in-progress marker.
    sentinel: Tlb,
}

impl Default for AList {
    fn default() -> Self {
        Self::new()
    }
}

impl AList {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            sentinel: Tlb::sentinel(),
        }
    }

    #[inline]
    fn marker(&self) -> *mut Tlb {
        &self.sentinel as *const Tlb as *mut Tlb
    }

    /// Push one item. The item must not currently be on any list.
    pub fn push(&self, item: NonNull<Tlb>) {
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head == self.marker() {
                // A pop is detaching the top node; wait it out.
                core::hint::spin_loop();
                continue;
            }
            unsafe { item.as_ref() }.next.store(head, Ordering::Relaxed);
            if self
                .head
                .compare_exchange_weak(head, item.as_ptr(), Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Push an already-linked chain whose tail's `next` is null. The chain
    /// must not be reachable from any list.
    pub fn push_list(&self, chain: NonNull<Tlb>) {
        // Find the tail; chains here are short (deferred buffers, uncommit
        // batches).
        let mut tail = chain;
        loop {
            let next = unsafe { tail.as_ref() }.next.load(Ordering::Relaxed);
            match NonNull::new(next) {
                Some(n) => tail = n,
                None => break,
            }
        }
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head == self.marker() {
                core::hint::spin_loop();
                continue;
            }
            unsafe { tail.as_ref() }.next.store(head, Ordering::Relaxed);
            if self
                .head
                .compare_exchange_weak(head, chain.as_ptr(), Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Pop the most recently pushed item, or `None` if the list is
    /// observed empty. The returned item's link is cleared.
    pub fn pop(&self) -> Option<NonNull<Tlb>> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }
            if head == self.marker() {
                core::hint::spin_loop();
                continue;
            }
            // Install the marker: from here until the store below, no other
            // pop can run and no push can change `head`, so reading
            // `head.next` is race-free even if the node is concurrently
            // repushed elsewhere later.
            if self
                .head
                .compare_exchange_weak(head, self.marker(), Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            let item = unsafe { NonNull::new_unchecked(head) };
            let next = unsafe { item.as_ref() }.next.load(Ordering::Relaxed);
            self.head.store(next, Ordering::Release);
            unsafe { item.as_ref() }.next.store(ptr::null_mut(), Ordering::Relaxed);
            return Some(item);
        }
    }

    /// Detach the whole list and return its head chain (linked via `next`).
    pub fn take_all(&self) -> Option<NonNull<Tlb>> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }
            if head == self.marker() {
                core::hint::spin_loop();
                continue;
            }
            if self
                .head
                .compare_exchange_weak(head, ptr::null_mut(), Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(unsafe { NonNull::new_unchecked(head) });
            }
        }
    }

    /// Naked head read for safepoint-time enumeration.
    ///
    /// # Safety
    /// Caller must guarantee no concurrent `pop`/`take_all` (e.g. all
    /// mutators and the flusher are at a safepoint).
    pub unsafe fn head_naked(&self) -> *mut Tlb {
        let head = self.head.load(Ordering::Acquire);
        debug_assert!(head != self.marker(), "enumeration during pop");
        head
    }

    /// Visit every item currently on the list.
    ///
    /// # Safety
    /// Same precondition as [`AList::head_naked`]; additionally the links
    /// must not be mutated while iterating (pushes to the head are
    /// tolerated; newly pushed items are simply not visited).
    pub unsafe fn for_each(&self, f: &mut dyn FnMut(&Tlb)) {
        let mut cur = unsafe { self.head_naked() };
        while let Some(item) = NonNull::new(cur) {
            let item = unsafe { item.as_ref() };
            f(item);
            cur = item.next.load(Ordering::Relaxed);
        }
    }
}

// SAFETY: the sentinel is never handed out; all shared state is atomic.
unsafe impl Send for AList {}
unsafe impl Sync for AList {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn make_nodes(n: usize) -> Vec<Box<Tlb>> {
        (0..n).map(|_| Box::new(Tlb::new(ptr::null_mut(), 0))).collect()
    }

    fn nn(b: &Box<Tlb>) -> NonNull<Tlb> {
        NonNull::from(&**b)
    }

    #[test]
    fn push_pop_lifo() {
        let list = AList::new();
        let nodes = make_nodes(3);
        for n in &nodes {
            list.push(nn(n));
        }
        assert_eq!(list.pop().unwrap(), nn(&nodes[2]));
        assert_eq!(list.pop().unwrap(), nn(&nodes[1]));
        assert_eq!(list.pop().unwrap(), nn(&nodes[0]));
        assert!(list.pop().is_none());
    }

    #[test]
    fn push_list_chains() {
        let list = AList::new();
        let nodes = make_nodes(3);
        // Link 0 -> 1 -> 2 manually, then push the chain.
        nodes[0].next.store(nn(&nodes[1]).as_ptr(), Ordering::Relaxed);
        nodes[1].next.store(nn(&nodes[2]).as_ptr(), Ordering::Relaxed);
        list.push_list(nn(&nodes[0]));

        assert_eq!(list.pop().unwrap(), nn(&nodes[0]));
        assert_eq!(list.pop().unwrap(), nn(&nodes[1]));
        assert_eq!(list.pop().unwrap(), nn(&nodes[2]));
        assert!(list.pop().is_none());
    }

    #[test]
    fn take_all_detaches() {
        let list = AList::new();
        let nodes = make_nodes(2);
        list.push(nn(&nodes[0]));
        list.push(nn(&nodes[1]));
        let chain = list.take_all().unwrap();
        assert_eq!(chain, nn(&nodes[1]));
        assert!(list.pop().is_none());
        // The chain can be pushed back wholesale.
        list.push_list(chain);
        assert!(list.pop().is_some());
        assert!(list.pop().is_some());
        assert!(list.pop().is_none());
    }

    // Every pushed item must be returned by exactly one pop.
    #[test]
    fn concurrent_push_pop_unique_delivery() {
        const PER_THREAD: usize = 200;
        const THREADS: usize = 4;

        let list = Arc::new(AList::new());
        let nodes: Arc<Vec<Box<Tlb>>> = Arc::new(make_nodes(PER_THREAD * THREADS));
        let popped = Arc::new(AtomicUsize::new(0));
        let seen: Arc<Vec<AtomicUsize>> =
            Arc::new((0..nodes.len()).map(|_| AtomicUsize::new(0)).collect());

        let mut handles = Vec::new();
        for t in 0..THREADS {
            let list = Arc::clone(&list);
            let nodes = Arc::clone(&nodes);
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_THREAD {
                    list.push(nn(&nodes[t * PER_THREAD + i]));
                }
            }));
        }
        for _ in 0..2 {
            let list = Arc::clone(&list);
            let nodes = Arc::clone(&nodes);
            let popped = Arc::clone(&popped);
            let seen = Arc::clone(&seen);
            handles.push(std::thread::spawn(move || {
                while popped.load(Ordering::Relaxed) < nodes.len() {
                    if let Some(item) = list.pop() {
                        let idx = nodes
                            .iter()
                            .position(|n| nn(n) == item)
                            .expect("unknown node");
                        seen[idx].fetch_add(1, Ordering::Relaxed);
                        popped.fetch_add(1, Ordering::Relaxed);
                    } else {
                        std::hint::spin_loop();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for s in seen.iter() {
            assert_eq!(s.load(Ordering::Relaxed), 1);
        }
    }
}
