//! Boundary scenarios: write/flush/process, same-source interning,
//! rotation, overflow, eviction, and the event latch, driven end to end
//! through the public API with a mock runtime.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::MockRuntime;
use crs_core::arena::RecordArena;
use crs_core::record::{
    self, CLASS_LOAD_FIXED, ClassLoadView, FirstCallView, RecordSink,
};
use crs_core::runtime::CrsThread;
use crs_core::tlb::align_record;
use crs_core::{ClassRef, Crs, LoaderRef, MethodRef, Options, Origin, RuntimeEnv, UpcallArg};

/// Collects everything a flush delivers.
#[derive(Default)]
struct Collect {
    class_loads: Vec<(Option<u64>, u32, Option<String>, Option<String>)>,
    first_calls: Vec<(Option<u64>, u32, Option<String>)>,
}

impl Collect {
    fn text(bytes: Option<&[u8]>) -> Option<String> {
        bytes.map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

impl RecordSink for Collect {
    fn class_load(&mut self, v: ClassLoadView<'_>) {
        self.class_loads.push((
            v.class.map(|c| c.0),
            v.class_id,
            Self::text(v.source),
            Self::text(v.name),
        ));
    }
    fn first_call(&mut self, v: FirstCallView<'_>) {
        self.first_calls
            .push((v.method.map(|m| m.0), v.holder_class_id, Self::text(v.name)));
    }
}

fn arena() -> RecordArena {
    RecordArena::new(4 * 1024 * 1024).unwrap()
}

// Single-thread write, flush, process. Ten class-loads with
// the same source produce one inline record and nine back-references.
#[test]
fn single_thread_write_flush_process() {
    let arena = arena();
    let t = CrsThread::new(1);

    for i in 0..10u64 {
        assert!(record::post_class_load(
            &arena,
            &t,
            ClassRef(0xA0 + i),
            1,
            10 + i as u32,
            None,
            Some(b"file:/x"),
        ));
    }

    // One full record (inline "file:/x") plus nine short ones.
    let full = align_record(CLASS_LOAD_FIXED + 2 + 7);
    let short = align_record(CLASS_LOAD_FIXED);
    let tlb = t.current().unwrap();
    assert_eq!(unsafe { tlb.as_ref() }.pos(), full + 9 * short);

    arena.release_thread(&t);
    let mut sink = Collect::default();
    let report = arena.flush(&mut sink);
    assert_eq!(report.delivered, 10);
    assert!(!report.overflowed);

    assert_eq!(sink.class_loads.len(), 10);
    for (i, (class, class_id, source, name)) in sink.class_loads.iter().rev().enumerate() {
        // Every record resolves the shared source, inline or not.
        assert_eq!(source.as_deref(), Some("file:/x"));
        assert_eq!(*class, Some(0xA0 + 9 - i as u64));
        assert_eq!(*class_id, 10 + 9 - i as u32);
        assert!(name.is_none());
    }
}

// A rotation makes the previous buffer's anchor unreachable,
// so the first record in the fresh buffer carries the source inline again.
#[test]
fn rotation_forces_new_reference() {
    let arena = arena();
    let t = CrsThread::new(1);
    let source = vec![b's'; 4000];

    assert!(record::post_class_load(
        &arena,
        &t,
        ClassRef(1),
        1,
        1,
        None,
        Some(&source),
    ));
    let first = t.current().unwrap();
    let inline_size = align_record(CLASS_LOAD_FIXED + 2 + source.len());
    assert_eq!(unsafe { first.as_ref() }.pos(), inline_size);

    // Pad the buffer so not even a short class-load fits.
    while unsafe { first.as_ref() }.remaining() >= align_record(CLASS_LOAD_FIXED + 2 + source.len())
    {
        assert!(record::post_first_call(&arena, &t, MethodRef(7), 1));
    }

    assert!(record::post_class_load(
        &arena,
        &t,
        ClassRef(2),
        1,
        2,
        None,
        Some(&source),
    ));
    let second = t.current().unwrap();
    assert_ne!(first, second);
    // Inline again, not a 56-byte back-reference record.
    assert_eq!(unsafe { second.as_ref() }.pos(), inline_size);

    arena.release_thread(&t);
    let mut sink = Collect::default();
    arena.flush(&mut sink);
    for (_, _, src, _) in &sink.class_loads {
        assert_eq!(src.as_deref().map(str::len), Some(4000));
    }
}

// Eviction blows a same-source pair. The evicted class's slot
// becomes a tombstone, a self-describing record is appended, and the
// dependent back-reference record is blown eagerly too.
#[test]
fn eviction_blows_same_source_records() {
    let arena = arena();
    let runtime = MockRuntime::new();
    let loader = LoaderRef(0x10);
    let x = runtime.define_class(0xE0, "X", Some("s"), loader);
    let y = runtime.define_class(0xE1, "Y", Some("s"), loader);
    runtime.set_class_trace_id(x, 100);
    runtime.set_class_trace_id(y, 101);

    let t = CrsThread::new(1);
    let vm = CrsThread::new(u64::MAX);
    assert!(record::post_class_load(&arena, &t, x, 1, 100, None, Some(b"s")));
    assert!(record::post_class_load(&arena, &t, y, 1, 101, None, Some(b"s")));
    let tlb = t.current().unwrap();
    let pos_before = unsafe { tlb.as_ref() }.pos();

    let blown = unsafe { crs_core::evict::evict_class(&arena, &*runtime, &vm, x, &[]) };
    assert_eq!(blown, 2);
    // Tombstones preserve the original footprint.
    assert_eq!(unsafe { tlb.as_ref() }.pos(), pos_before);

    arena.release_thread(&t);
    let mut sink = Collect::default();
    let report = arena.flush(&mut sink);
    // Exactly the two blown records; the originals are tombstones.
    assert_eq!(report.delivered, 2);
    assert_eq!(sink.class_loads.len(), 2);
    for (class, class_id, source, name) in &sink.class_loads {
        assert!(class.is_none(), "no live record may pin evicted metadata");
        assert_eq!(source.as_deref(), Some("s"));
        match *class_id {
            100 => assert_eq!(name.as_deref(), Some("X")),
            101 => assert_eq!(name.as_deref(), Some("Y")),
            other => panic!("unexpected class id {other}"),
        }
    }
}

// Eviction is idempotent: a second pass finds only tombstones and blown
// records and does nothing.
#[test]
fn eviction_twice_equals_once() {
    let arena = arena();
    let runtime = MockRuntime::new();
    let x = runtime.define_class(0xE0, "X", Some("s"), LoaderRef(1));
    runtime.set_class_trace_id(x, 100);

    let t = CrsThread::new(1);
    let vm = CrsThread::new(u64::MAX);
    assert!(record::post_class_load(&arena, &t, x, 1, 100, None, Some(b"s")));

    let first = unsafe { crs_core::evict::evict_class(&arena, &*runtime, &vm, x, &[]) };
    let second = unsafe { crs_core::evict::evict_class(&arena, &*runtime, &vm, x, &[]) };
    assert_eq!(first, 1);
    assert_eq!(second, 0);

    arena.release_thread(&t);
    let mut sink = Collect::default();
    assert_eq!(arena.flush(&mut sink).delivered, 1);
}

// Eviction of a method array blows matching first-calls, by token and by
// holder id.
#[test]
fn eviction_blows_first_calls() {
    let arena = arena();
    let runtime = MockRuntime::new();
    let c = runtime.define_class(0xC0, "Holder", None, LoaderRef(1));
    runtime.set_class_trace_id(c, 50);
    let m1 = runtime.define_method(0x100, c, "run", "()V");
    let m2 = runtime.define_method(0x101, c, "call", "()I");
    let other = runtime.define_method(0x200, ClassRef(0xC1), "main", "()V");

    let t = CrsThread::new(1);
    let vm = CrsThread::new(u64::MAX);
    assert!(record::post_first_call(&arena, &t, m1, 50));
    assert!(record::post_first_call(&arena, &t, m2, 50));
    assert!(record::post_first_call(&arena, &t, other, 60));

    let blown = unsafe { crs_core::evict::evict_class(&arena, &*runtime, &vm, c, &[m1, m2]) };
    assert_eq!(blown, 2);

    arena.release_thread(&t);
    let mut sink = Collect::default();
    assert_eq!(arena.flush(&mut sink).delivered, 3);

    let live: Vec<_> = sink.first_calls.iter().filter(|(m, _, _)| m.is_some()).collect();
    let blown: Vec<_> = sink.first_calls.iter().filter(|(m, _, _)| m.is_none()).collect();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].0, Some(0x200));
    assert_eq!(blown.len(), 2);
    let mut names: Vec<_> = blown.iter().map(|(_, _, n)| n.clone().unwrap()).collect();
    names.sort();
    assert_eq!(names, vec!["call".to_string(), "run".to_string()]);
}

// Targeted method eviction leaves everything else alone.
#[test]
fn single_method_eviction() {
    let arena = arena();
    let runtime = MockRuntime::new();
    let c = runtime.define_class(0xC0, "Holder", None, LoaderRef(1));
    let m1 = runtime.define_method(0x100, c, "hot", "()V");
    let m2 = runtime.define_method(0x101, c, "cold", "()V");

    let t = CrsThread::new(1);
    let vm = CrsThread::new(u64::MAX);
    assert!(record::post_first_call(&arena, &t, m1, 50));
    assert!(record::post_first_call(&arena, &t, m2, 50));

    let blown = unsafe { crs_core::evict::evict_method(&arena, &*runtime, &vm, m1) };
    assert_eq!(blown, 1);

    arena.release_thread(&t);
    let mut sink = Collect::default();
    assert_eq!(arena.flush(&mut sink).delivered, 2);
    assert!(sink.first_calls.iter().any(|(m, _, _)| *m == Some(0x101)));
    assert!(
        sink.first_calls
            .iter()
            .any(|(m, _, n)| m.is_none() && n.as_deref() == Some("hot"))
    );
}

// ---- facade scenarios ----

fn facade() -> (Arc<Crs>, Arc<MockRuntime>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let runtime = MockRuntime::new();
    let options =
        Options::parse("useCRS=force,arenaSize=4194304,log+vm=debug", Origin::Flag).unwrap();
    let crs = Crs::init(options, runtime.clone()).unwrap();
    (crs, runtime)
}

#[test]
fn full_pipeline_class_load_to_upcall() {
    let (crs, runtime) = facade();
    crs.engage().unwrap();

    let loader = LoaderRef(0x10);
    let class = runtime.define_class(0xAA, "com/example/Main", Some("file:/app.jar"), loader);
    let method = runtime.define_method(0x500, class, "main", "([Ljava/lang/String;)V");

    let t = crs.register_thread();
    crs.notify_class_load(&t, class, Some(&[7u8; 32]), Some(b"file:/app.jar"));
    crs.notify_first_call(&t, method);
    crs.notify_thread_exit(&t);

    let report = crs.flush_buffers(false, false);
    assert_eq!(report.delivered, 2);

    assert!(crs.should_notify_java());
    assert_eq!(crs.notify_java(), 2);
    assert!(!crs.should_notify_java());

    let upcalls = runtime.upcalls.lock();
    assert_eq!(upcalls.len(), 2);
    let (m, args) = &upcalls[0];
    assert_eq!(m, "notifyClassLoad");
    assert_eq!(args[3], UpcallArg::Str("com/example/Main".into()));
    assert_eq!(args[4], UpcallArg::Str("file:/app.jar".into()));
    let (m, args) = &upcalls[1];
    assert_eq!(m, "notifyFirstCall");
    assert_eq!(args[1], UpcallArg::Str("main".into()));
    assert_eq!(args[2], UpcallArg::Str("([Ljava/lang/String;)V".into()));
}

// `force` runs a safepoint release-all so even held buffers drain.
#[test]
fn forced_flush_releases_held_buffers() {
    let (crs, runtime) = facade();
    let class = runtime.define_class(0xAB, "Held", None, LoaderRef(1));

    let t = crs.register_thread();
    crs.notify_class_load(&t, class, None, None);

    // Unforced: the owner still holds the buffer, nothing drains.
    assert_eq!(crs.flush_buffers(false, false).delivered, 0);

    // Forced: safepoint clears the slot, record drains.
    let report = crs.flush_buffers(true, false);
    assert_eq!(report.delivered, 1);
    assert_eq!(*runtime.safepoints.lock(), 1);
    assert!(t.current().is_none());
}

#[test]
fn and_stop_disables_posting() {
    let (crs, runtime) = facade();
    let class = runtime.define_class(0xAC, "Last", None, LoaderRef(1));

    let t = crs.register_thread();
    crs.notify_class_load(&t, class, None, None);
    crs.flush_buffers(true, true);

    assert!(crs.is_disabled());
    crs.notify_class_load(&t, class, None, None);
    assert_eq!(crs.flush_buffers(false, false).delivered, 0);
    // Scheduled events are dropped once disabled.
    assert_eq!(crs.notify_java(), 0);
}

#[test]
fn engage_failure_disables() {
    let runtime = MockRuntime::new();
    runtime.fail_agent.store(true, Ordering::Relaxed);
    let options = Options::parse("useCRS=force,arenaSize=4194304", Origin::Flag).unwrap();
    let crs = Crs::init(options, runtime.clone()).unwrap();

    assert!(crs.engage().is_err());
    assert!(crs.is_disabled());
}

// Strict FIFO through the facade, with a failing agent in the
// middle; the drain continues and order is preserved.
#[test]
fn event_fifo_through_facade() {
    let (crs, runtime) = facade();
    for i in 0..3 {
        crs.schedule(crs_core::Event {
            method: "notifyTest",
            signature: "(J)V",
            args: vec![UpcallArg::Int(i)],
        });
    }
    assert_eq!(crs.notify_java(), 3);
    let upcalls = runtime.upcalls.lock();
    let seen: Vec<_> = upcalls
        .iter()
        .map(|(_, args)| match args[0] {
            UpcallArg::Int(n) => n,
            _ => panic!("unexpected arg"),
        })
        .collect();
    assert_eq!(seen, vec![0, 1, 2]);
}

#[test]
fn upstream_failures_are_absorbed() {
    let (crs, runtime) = facade();
    runtime.fail_upcalls.store(true, Ordering::Relaxed);
    crs.schedule(crs_core::Event {
        method: "notifyTest",
        signature: "()V",
        args: vec![],
    });
    // The event is consumed, the failure logged and cleared, the
    // subsystem stays alive.
    assert_eq!(crs.notify_java(), 1);
    assert!(!crs.is_disabled());
}

#[test]
fn trace_ids_are_stable_and_anonymous_sticks() {
    let (crs, runtime) = facade();
    let class = runtime.define_class(0xAD, "Traced", None, LoaderRef(1));

    let id = crs.assign_trace_id_class(class);
    assert_ne!(id, 0);
    assert_eq!(crs.assign_trace_id_class(class), id);

    let anon = runtime.define_class(0xAE, "Anon", None, LoaderRef(1));
    crs.mark_anonymous(anon);
    assert_eq!(crs.assign_trace_id_class(anon), u32::MAX);
}
