//! The seam to the host runtime.
//!
//! The core consumes the runtime's machinery only through these types:
//! metadata tokens and their resolution, trace-id storage, upstream
//! invocation, and safepoint execution. The enclosing VM implements
//! [`RuntimeEnv`]; tests drive the core with a mock.

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::UpstreamError;
use crate::tlb::Tlb;

/// Opaque token for a loaded class. Valid until the class is evicted;
/// records holding one must be blown before that happens.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClassRef(pub u64);

/// Opaque token for a resolved method. Same validity rule as [`ClassRef`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MethodRef(pub u64);

/// Opaque token for a class loader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LoaderRef(pub u64);

/// Trace id value meaning "not assigned".
pub const TRACE_ID_NONE: u32 = 0;
/// Trace id stamped on anonymous classes.
pub const TRACE_ID_ANONYMOUS: u32 = u32::MAX;

/// One argument of an upstream invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpcallArg {
    Str(String),
    Bytes(Vec<u8>),
    Int(i64),
}

/// Everything the core needs from the enclosing runtime.
///
/// Metadata resolution returns raw bytes (the runtime extracts symbols and
/// class names as C strings; the core never re-encodes them). Resolution of
/// an evicted token is undefined; the eviction protocol guarantees the
/// core never asks.
pub trait RuntimeEnv: Send + Sync {
    fn class_name(&self, class: ClassRef) -> Option<Vec<u8>>;
    fn class_source(&self, class: ClassRef) -> Option<Vec<u8>>;
    fn class_loader(&self, class: ClassRef) -> LoaderRef;
    fn method_name(&self, method: MethodRef) -> Option<Vec<u8>>;
    fn method_signature(&self, method: MethodRef) -> Option<Vec<u8>>;
    fn method_holder(&self, method: MethodRef) -> ClassRef;

    /// Trace-id slots stamped into the metadata itself.
    fn class_trace_id(&self, class: ClassRef) -> u32;
    fn set_class_trace_id(&self, class: ClassRef, id: u32);
    fn loader_trace_id(&self, loader: LoaderRef) -> u32;
    fn set_loader_trace_id(&self, loader: LoaderRef, id: u32);

    /// Load the upstream agent and run its start method.
    fn start_agent(&self) -> Result<(), UpstreamError>;

    /// Invoke an upstream method by symbolic name and signature. On
    /// failure the runtime clears its pending-exception slot and returns
    /// the rendered message.
    fn invoke_upstream(
        &self,
        method: &str,
        signature: &str,
        args: &[UpcallArg],
    ) -> Result<(), UpstreamError>;

    /// Run `op` inside a safepoint: all mutator threads parked, metadata
    /// stable.
    fn run_at_safepoint(&self, op: &mut dyn FnMut());
}

/// Per-thread state the core keeps for each mutator: the current-buffer
/// slot. Written by the owning thread, or by a safepoint operation.
pub struct CrsThread {
    id: u64,
    buffer: AtomicPtr<Tlb>,
}

impl CrsThread {
    pub fn new(id: u64) -> Self {
        debug_assert_ne!(id, crate::tlb::NO_OWNER);
        Self {
            id,
            buffer: AtomicPtr::new(ptr::null_mut()),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn current(&self) -> Option<ptr::NonNull<Tlb>> {
        ptr::NonNull::new(self.buffer.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set(&self, tlb: ptr::NonNull<Tlb>) {
        self.buffer.store(tlb.as_ptr(), Ordering::Release);
    }

    #[inline]
    pub(crate) fn clear(&self) {
        self.buffer.store(ptr::null_mut(), Ordering::Release);
    }
}

/// Registry of live mutator threads, walked by safepoint operations that
/// must clear every current-buffer slot (forced flush, disable).
pub struct ThreadRegistry {
    threads: Mutex<Vec<Arc<CrsThread>>>,
    next_id: AtomicU64,
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self) -> Arc<CrsThread> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let thread = Arc::new(CrsThread::new(id));
        self.threads.lock().push(Arc::clone(&thread));
        thread
    }

    pub fn deregister(&self, thread: &CrsThread) {
        self.threads.lock().retain(|t| t.id() != thread.id());
    }

    pub fn for_each(&self, mut f: impl FnMut(&CrsThread)) {
        for t in self.threads.lock().iter() {
            f(t);
        }
    }
}
