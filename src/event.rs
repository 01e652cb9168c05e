//! Event latch: the queue application threads use to wake the service
//! thread that performs upstream calls.
//!
//! A singly-linked FIFO guarded by a short-critical-section mutex, plus a
//! relaxed "should notify" flag the runtime's service loop polls cheaply.
//! `schedule` never suspends (the mutex hold is a pointer splice and the
//! lock never checks for safepoints); `notify_java` drains in FIFO order
//! and blocks on the condition variable between drains.

use core::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::error::UpstreamError;
use crate::runtime::UpcallArg;
use crate::stat_bump;

/// One upstream notification: a symbolic method, its signature, and the
/// arguments to pass. Destroyed after dispatch.
#[derive(Debug)]
pub struct Event {
    pub method: &'static str,
    pub signature: &'static str,
    pub args: Vec<UpcallArg>,
}

struct Node {
    event: Event,
    next: Option<Box<Node>>,
}

struct Queue {
    head: Option<Box<Node>>,
    /// The tail node, for O(1) append. Null when empty.
    tail: *mut Node,
    len: usize,
}

// SAFETY: the raw tail pointer always points into the box chain owned by
// `head`; the queue is only touched under the mutex.
unsafe impl Send for Queue {}

impl Queue {
    const fn new() -> Self {
        Self {
            head: None,
            tail: core::ptr::null_mut(),
            len: 0,
        }
    }

    fn push(&mut self, event: Event) {
        let mut node = Box::new(Node { event, next: None });
        let raw: *mut Node = &mut *node;
        if self.tail.is_null() {
            self.head = Some(node);
        } else {
            unsafe { (*self.tail).next = Some(node) };
        }
        self.tail = raw;
        self.len += 1;
    }

    fn take_all(&mut self) -> Option<Box<Node>> {
        self.tail = core::ptr::null_mut();
        self.len = 0;
        self.head.take()
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        // Unlink iteratively; a recursive Box-chain drop could blow the
        // stack on a very backed-up queue.
        let mut cur = self.head.take();
        while let Some(mut node) = cur {
            cur = node.next.take();
        }
    }
}

pub struct EventQueue {
    queue: Mutex<Queue>,
    available: Condvar,
    /// Cheap hint for the service thread's main loop.
    should_notify: AtomicBool,
    /// One-time init latch; signalling starts only once the subsystem is
    /// fully initialized.
    ready: AtomicBool,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Queue::new()),
            available: Condvar::new(),
            should_notify: AtomicBool::new(false),
            ready: AtomicBool::new(false),
        }
    }

    /// Mark one-time init complete; from now on `schedule` signals the
    /// condition variable.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
        self.available.notify_all();
    }

    /// Append an event and wake the service thread. Never suspends.
    pub fn schedule(&self, event: Event) {
        self.queue.lock().push(event);
        stat_bump!(event_count);
        self.should_notify.store(true, Ordering::Relaxed);
        if self.ready.load(Ordering::Acquire) {
            self.available.notify_one();
        }
    }

    /// Cheap poll for the service thread's main loop.
    #[inline]
    pub fn should_notify_java(&self) -> bool {
        self.should_notify.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain and dispatch everything in FIFO order through `invoke`.
    /// Repeats until the queue is observed empty, so events scheduled
    /// during a drain are delivered too. `keep_going` is checked between
    /// dispatches; when it turns false the remaining events are dropped
    /// (subsystem disabled). Returns the number of events dispatched.
    pub fn notify_java(
        &self,
        invoke: &mut dyn FnMut(&Event) -> Result<(), UpstreamError>,
        keep_going: &dyn Fn() -> bool,
    ) -> usize {
        let mut dispatched = 0usize;
        loop {
            let batch = self.queue.lock().take_all();
            let Some(mut node) = batch else {
                self.should_notify.store(false, Ordering::Relaxed);
                return dispatched;
            };
            loop {
                if !keep_going() {
                    // Remaining nodes (this chain and anything requeued)
                    // are dropped on the floor.
                    return dispatched;
                }
                if let Err(e) = invoke(&node.event) {
                    // The runtime has cleared its pending exception; the
                    // subsystem carries on.
                    debug!("crs upstream notification failed: {e}");
                }
                dispatched += 1;
                match node.next.take() {
                    Some(next) => node = next,
                    None => break,
                }
            }
        }
    }

    /// Park the service thread until an event arrives or `timeout`
    /// expires. Returns true when the queue is non-empty.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut q = self.queue.lock();
        if q.len > 0 {
            return true;
        }
        let _ = self.available.wait_for(&mut q, timeout);
        q.len > 0
    }
}
