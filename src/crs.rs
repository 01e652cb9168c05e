//! The facade: lifecycle and the operations exposed to the host runtime.
//!
//! `Crs::init` builds the arena and the event latch; `engage` starts the
//! upstream agent; the `notify_*` operations post records or run the
//! eviction protocol; `flush_buffers` drains the arena into notification
//! events; `notify_java` delivers them. No error crosses this boundary at
//! steady state: failures are absorbed or degrade the subsystem to
//! inert.

use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::arena::{FlushReport, RecordArena};
use crate::config::Options;
use crate::error::CrsError;
use crate::event::{Event, EventQueue};
use crate::evict;
use crate::record::{self, ClassLoadView, FirstCallView, RecordSink};
use crate::runtime::{
    ClassRef, CrsThread, LoaderRef, MethodRef, RuntimeEnv, ThreadRegistry, UpcallArg,
    TRACE_ID_ANONYMOUS, TRACE_ID_NONE,
};

const STATE_READY: u8 = 0;
const STATE_ENGAGED: u8 = 1;
const STATE_DISABLED: u8 = 2;

/// Upstream entry points, by symbolic name and signature.
const NOTIFY_CLASS_LOAD: (&str, &str) = (
    "notifyClassLoad",
    "(II[BLjava/lang/String;Ljava/lang/String;)V",
);
const NOTIFY_FIRST_CALL: (&str, &str) =
    ("notifyFirstCall", "(ILjava/lang/String;Ljava/lang/String;)V");

pub struct Crs {
    options: Options,
    runtime: Arc<dyn RuntimeEnv>,
    arena: RecordArena,
    queue: EventQueue,
    registry: ThreadRegistry,
    /// Slot used for safepoint-time allocations (blown records), so the
    /// eviction protocol never touches a mutator's buffer.
    vm_thread: CrsThread,
    state: AtomicU8,
    next_trace_id: AtomicU32,
}

impl Crs {
    /// Reserve the record region and ready the subsystem. The caller has
    /// already decided the options enable CRS.
    pub fn init(options: Options, runtime: Arc<dyn RuntimeEnv>) -> Result<Arc<Crs>, CrsError> {
        if !options.enabled() {
            return Err(CrsError::Disabled("useCRS not set".into()));
        }
        let arena = RecordArena::new(options.arena_size)?;
        let crs = Arc::new(Crs {
            options,
            runtime,
            arena,
            queue: EventQueue::new(),
            registry: ThreadRegistry::new(),
            // Mutator ids come from the registry (>= 1); the VM thread
            // gets a slot outside that range.
            vm_thread: CrsThread::new(u64::MAX),
            state: AtomicU8::new(STATE_READY),
            next_trace_id: AtomicU32::new(1),
        });
        crs.queue.set_ready();
        info!("crs core initialized, arena {} bytes", crs.options.arena_size);
        Ok(crs)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Load the upstream agent and run its start method. Irreversible on
    /// failure: the subsystem disables itself.
    pub fn engage(&self) -> Result<(), CrsError> {
        if self
            .state
            .compare_exchange(
                STATE_READY,
                STATE_ENGAGED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(CrsError::Disabled("engage after disable or re-engage".into()));
        }
        match self.runtime.start_agent() {
            Ok(()) => {
                info!("crs agent engaged");
                Ok(())
            }
            Err(e) => {
                self.disable(&format!("agent start failed: {e}"));
                Err(CrsError::Startup(e))
            }
        }
    }

    /// Irreversibly stop new posting. In-flight notification observes the
    /// flag and returns.
    pub fn disable(&self, reason: &str) {
        let prev = self.state.swap(STATE_DISABLED, Ordering::AcqRel);
        if prev != STATE_DISABLED {
            warn!("crs disabled: {reason}");
        }
    }

    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_DISABLED
    }

    #[inline]
    fn posting_allowed(&self) -> bool {
        !self.is_disabled()
    }

    // ---- threads ----

    /// Register a mutator thread; the handle carries its buffer slot.
    pub fn register_thread(&self) -> Arc<CrsThread> {
        self.registry.register()
    }

    /// Release the thread's buffer and forget the thread.
    pub fn notify_thread_exit(&self, thread: &CrsThread) {
        self.arena.release_thread(thread);
        self.registry.deregister(thread);
    }

    // ---- posting ----

    /// Post a class-load record. `hash` is the class-file digest, `source`
    /// the defining path bytes, both optional.
    pub fn notify_class_load(
        &self,
        thread: &CrsThread,
        class: ClassRef,
        hash: Option<&[u8; 32]>,
        source: Option<&[u8]>,
    ) {
        if !self.posting_allowed() {
            return;
        }
        let loader = self.runtime.class_loader(class);
        let loader_id = self.assign_trace_id_loader(loader);
        let class_id = self.assign_trace_id_class(class);
        record::post_class_load(&self.arena, thread, class, loader_id, class_id, hash, source);
    }

    /// Post a first-call record for a method entering execution for the
    /// first time.
    pub fn notify_first_call(&self, thread: &CrsThread, method: MethodRef) {
        if !self.posting_allowed() {
            return;
        }
        let holder = self.runtime.method_holder(method);
        let holder_id = self.assign_trace_id_class(holder);
        record::post_first_call(&self.arena, thread, method, holder_id);
    }

    // ---- eviction ----

    /// Blow every record pinning `class` or any method in `methods`.
    ///
    /// # Safety
    /// Must be called inside a safepoint, before the metadata is freed.
    pub unsafe fn notify_metaspace_eviction_class(&self, class: ClassRef, methods: &[MethodRef]) {
        unsafe {
            evict::evict_class(&self.arena, &*self.runtime, &self.vm_thread, class, methods);
        }
    }

    /// Blow every first-call record pinning `method`.
    ///
    /// # Safety
    /// Same precondition as [`Crs::notify_metaspace_eviction_class`].
    pub unsafe fn notify_metaspace_eviction_method(&self, method: MethodRef) {
        unsafe {
            evict::evict_method(&self.arena, &*self.runtime, &self.vm_thread, method);
        }
    }

    // ---- flushing ----

    /// Drain accumulated records into notification events. With `force`,
    /// a safepoint operation first releases every thread's current buffer
    /// so nothing stays deferred. With `and_stop`, posting is disabled
    /// afterwards.
    pub fn flush_buffers(&self, force: bool, and_stop: bool) -> FlushReport {
        if force {
            let registry = &self.registry;
            let arena = &self.arena;
            self.runtime.run_at_safepoint(&mut || {
                registry.for_each(|t| arena.release_thread(t));
            });
        }
        let mut sink = EventSink { crs: self };
        let report = self.arena.flush(&mut sink);
        debug!(
            "crs flush: {} records, {} bytes dropped",
            report.delivered, report.dropped_bytes
        );
        if and_stop {
            self.disable("flush_buffers(and_stop)");
        }
        report
    }

    // ---- event latch ----

    /// Enqueue an event for the service thread. Dropped when disabled.
    pub fn schedule(&self, event: Event) {
        if self.is_disabled() {
            return;
        }
        self.queue.schedule(event);
    }

    /// Drain the latch queue, invoking upstream in FIFO order. Returns
    /// the number of events delivered.
    pub fn notify_java(&self) -> usize {
        let runtime = &self.runtime;
        self.queue.notify_java(
            &mut |event| runtime.invoke_upstream(event.method, event.signature, &event.args),
            &|| !self.is_disabled(),
        )
    }

    /// Cheap poll for the runtime's service-thread main loop.
    #[inline]
    pub fn should_notify_java(&self) -> bool {
        self.queue.should_notify_java() && !self.is_disabled()
    }

    pub fn event_queue(&self) -> &EventQueue {
        &self.queue
    }

    // ---- trace ids ----

    /// Stamp (or fetch) the trace id naming `class` in records.
    pub fn assign_trace_id_class(&self, class: ClassRef) -> u32 {
        let id = self.runtime.class_trace_id(class);
        if id != TRACE_ID_NONE {
            return id;
        }
        let id = self.next_trace_id.fetch_add(1, Ordering::Relaxed);
        self.runtime.set_class_trace_id(class, id);
        id
    }

    /// Stamp (or fetch) the trace id naming `loader` in records.
    pub fn assign_trace_id_loader(&self, loader: LoaderRef) -> u32 {
        let id = self.runtime.loader_trace_id(loader);
        if id != TRACE_ID_NONE {
            return id;
        }
        let id = self.next_trace_id.fetch_add(1, Ordering::Relaxed);
        self.runtime.set_loader_trace_id(loader, id);
        id
    }

    /// Mark a class anonymous: its records carry the anonymous id and it
    /// never receives a real one.
    pub fn mark_anonymous(&self, class: ClassRef) {
        self.runtime.set_class_trace_id(class, TRACE_ID_ANONYMOUS);
    }
}

/// The production sink: records become latch events carrying only
/// strings, byte arrays and integers. Metadata for live records is
/// resolved here, on the flusher, which never safepoints mid-flush,
/// so the tokens are still valid.
struct EventSink<'a> {
    crs: &'a Crs,
}

impl RecordSink for EventSink<'_> {
    fn class_load(&mut self, view: ClassLoadView<'_>) {
        let name = match (view.name, view.class) {
            (Some(inline), _) => inline.to_vec(),
            (None, Some(class)) => self.crs.runtime.class_name(class).unwrap_or_default(),
            (None, None) => Vec::new(),
        };
        let (method, signature) = NOTIFY_CLASS_LOAD;
        self.crs.schedule(Event {
            method,
            signature,
            args: vec![
                UpcallArg::Int(view.loader_id as i64),
                UpcallArg::Int(view.class_id as i64),
                UpcallArg::Bytes(view.hash.map(|h| h.to_vec()).unwrap_or_default()),
                UpcallArg::Str(String::from_utf8_lossy(&name).into_owned()),
                UpcallArg::Str(
                    view.source
                        .map(|s| String::from_utf8_lossy(s).into_owned())
                        .unwrap_or_default(),
                ),
            ],
        });
    }

    fn first_call(&mut self, view: FirstCallView<'_>) {
        let (name, signature_bytes) = match (view.name, view.method) {
            (Some(inline), _) => (inline.to_vec(), view.signature.unwrap_or(&[]).to_vec()),
            (None, Some(method)) => (
                self.crs.runtime.method_name(method).unwrap_or_default(),
                self.crs.runtime.method_signature(method).unwrap_or_default(),
            ),
            (None, None) => (Vec::new(), Vec::new()),
        };
        let (method, signature) = NOTIFY_FIRST_CALL;
        self.crs.schedule(Event {
            method,
            signature,
            args: vec![
                UpcallArg::Int(view.holder_class_id as i64),
                UpcallArg::Str(String::from_utf8_lossy(&name).into_owned()),
                UpcallArg::Str(String::from_utf8_lossy(&signature_bytes).into_owned()),
            ],
        });
    }
}
