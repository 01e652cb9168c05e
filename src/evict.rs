//! Metadata eviction: the "blow" protocol.
//!
//! When the runtime unloads a class or method, records still pinning that
//! metadata must become self-contained before it is freed. Inside the
//! unload safepoint, every enumerable buffer is walked in yield order and
//! its records in write order:
//!
//! - a class-load hit by the eviction is rewritten: a fully-inlined
//!   `ClassLoadBlown` record is allocated (possibly into another buffer)
//!   and the original slot becomes a tombstone of identical size;
//! - a first-call hit directly (method token), by holder trace id, or by
//!   membership in the evicted method array, is blown the same way;
//! - a same-source class-load whose anchor is no longer a live
//!   inline-source record is blown eagerly, so no surviving record ever
//!   depends on a tombstoned anchor.
//!
//! Strings are resolved from the metadata itself, which is still intact
//! for the duration of the safepoint. If allocating the blown record
//! fails (overflow), the original is tombstoned anyway: a dropped record
//! is acceptable, a dangling metadata pointer is not.

use core::mem::size_of;
use core::ptr;

use log::debug;

use crate::arena::RecordArena;
use crate::record::{
    self, ClassLoadRecord, FirstCallRecord, RecordHeader, Tag, flags,
};
use crate::runtime::{ClassRef, CrsThread, MethodRef, RuntimeEnv};
use crate::stat_bump;
use crate::tlb::{RefCategory, Tlb, align_record};

/// What is being evicted.
enum Target<'a> {
    Class {
        class: ClassRef,
        class_id: u32,
        methods: &'a [MethodRef],
    },
    Method(MethodRef),
}

/// Blow every record referencing `class` or any method in `methods`.
///
/// # Safety
/// Must run inside a safepoint: mutators parked, no concurrent flush pool
/// mutation, metadata still resolvable.
pub unsafe fn evict_class(
    arena: &RecordArena,
    runtime: &dyn RuntimeEnv,
    vm_thread: &CrsThread,
    class: ClassRef,
    methods: &[MethodRef],
) -> usize {
    let class_id = runtime.class_trace_id(class);
    unsafe {
        run(
            arena,
            runtime,
            vm_thread,
            &Target::Class {
                class,
                class_id,
                methods,
            },
        )
    }
}

/// Blow every first-call record pointing at `method`.
///
/// # Safety
/// Same precondition as [`evict_class`].
pub unsafe fn evict_method(
    arena: &RecordArena,
    runtime: &dyn RuntimeEnv,
    vm_thread: &CrsThread,
    method: MethodRef,
) -> usize {
    unsafe { run(arena, runtime, vm_thread, &Target::Method(method)) }
}

unsafe fn run(
    arena: &RecordArena,
    runtime: &dyn RuntimeEnv,
    vm_thread: &CrsThread,
    target: &Target<'_>,
) -> usize {
    let mut blown = 0usize;
    unsafe {
        arena.manager().leased_buffers_do(&mut |tlb| {
            blown += blow_buffer(tlb, target, arena, runtime, vm_thread);
        });
    }
    // Blown records landed in the VM thread's buffer; hand it to the next
    // flush rather than keeping it pinned forever.
    arena.release_thread(vm_thread);
    if blown > 0 {
        debug!("crs eviction blew {blown} records");
    }
    blown
}

unsafe fn blow_buffer(
    tlb: &Tlb,
    target: &Target<'_>,
    arena: &RecordArena,
    runtime: &dyn RuntimeEnv,
    vm_thread: &CrsThread,
) -> usize {
    let base = tlb.base();
    let end = tlb.pos();
    let mut off = 0usize;
    let mut blown = 0usize;
    // True while the most recent inline-source class-load is still live.
    // Walk order equals write order, so this is exactly the anchor any
    // later same-source record in this buffer resolves against.
    let mut anchor_live = false;

    while off + size_of::<RecordHeader>() <= end {
        let p = unsafe { base.add(off) };
        let hdr = unsafe { ptr::read(p as *const RecordHeader) };
        let size = hdr.size as usize;
        if size < size_of::<RecordHeader>() || off + size > end {
            debug_assert!(false, "corrupt record at offset {off}");
            break;
        }

        match Tag::from_u8(hdr.tag) {
            Some(Tag::ClassLoad) => unsafe {
                let rec = &*(p as *const ClassLoadRecord);
                let has_source = hdr.flags & flags::HAS_SOURCE != 0;
                let same_source = hdr.flags & flags::HAS_SAME_SOURCE != 0;
                let hit = matches!(target, Target::Class { class, .. } if class.0 == rec.class);

                if hit || (same_source && !anchor_live) {
                    blow_class_load(p, rec, &hdr, arena, runtime, vm_thread);
                    record::tombstone(p);
                    blown += 1;
                    if has_source {
                        // This slot can no longer anchor anything: blow
                        // later dependents and stop the writer from
                        // adding new ones.
                        anchor_live = false;
                        if tlb.reference(RefCategory::ClassLoadSource) == Some(off as u32) {
                            tlb.clear_reference(RefCategory::ClassLoadSource);
                        }
                    }
                } else if has_source {
                    anchor_live = true;
                }
            },
            Some(Tag::FirstCall) => unsafe {
                let rec = &*(p as *const FirstCallRecord);
                let hit = match target {
                    Target::Class {
                        class_id, methods, ..
                    } => {
                        rec.holder_class_id == *class_id
                            || methods.iter().any(|m| m.0 == rec.method)
                    }
                    Target::Method(m) => m.0 == rec.method,
                };
                if hit {
                    blow_first_call(rec, arena, runtime, vm_thread);
                    record::tombstone(p);
                    blown += 1;
                }
            },
            // Blown records are already self-contained; tombstones stay
            // dead; the reserved tag is never emitted.
            Some(Tag::ClassLoadBlown)
            | Some(Tag::FirstCallBlown)
            | Some(Tag::Tombstone)
            | Some(Tag::GcLog) => {}
            None => {
                debug_assert!(false, "unknown record tag {}", hdr.tag);
                break;
            }
        }

        off += align_record(size);
    }
    blown
}

unsafe fn blow_class_load(
    p: *const u8,
    rec: &ClassLoadRecord,
    hdr: &RecordHeader,
    arena: &RecordArena,
    runtime: &dyn RuntimeEnv,
    vm_thread: &CrsThread,
) {
    let class = ClassRef(rec.class);
    // Prefer the record's own inline bytes; otherwise ask the metadata,
    // which the safepoint keeps alive until we return.
    let inline;
    let resolved;
    let source: Option<&[u8]> = if hdr.flags & flags::HAS_SOURCE != 0 {
        inline = unsafe { record::inline_source(p) };
        Some(inline)
    } else {
        resolved = runtime.class_source(class);
        resolved.as_deref()
    };
    let name = runtime.class_name(class).unwrap_or_default();
    let hash = (hdr.flags & flags::HAS_HASH != 0).then_some(&rec.hash);

    let size = record::class_load_blown_size(source.map_or(0, <[u8]>::len), name.len());
    match arena.alloc(size, vm_thread) {
        Some(out) => unsafe {
            record::write_class_load_blown(
                out.as_ptr(),
                rec.loader_id,
                rec.class_id,
                hash,
                source,
                &name,
            );
            stat_bump!(blown_count);
        },
        None => debug!("crs eviction: blown class-load dropped (overflow)"),
    }
}

unsafe fn blow_first_call(
    rec: &FirstCallRecord,
    arena: &RecordArena,
    runtime: &dyn RuntimeEnv,
    vm_thread: &CrsThread,
) {
    let method = MethodRef(rec.method);
    let name = runtime.method_name(method).unwrap_or_default();
    let sig = runtime.method_signature(method).unwrap_or_default();

    let size = record::first_call_blown_size(name.len(), sig.len());
    match arena.alloc(size, vm_thread) {
        Some(out) => unsafe {
            record::write_first_call_blown(out.as_ptr(), rec.holder_class_id, &name, &sig);
            stat_bump!(blown_count);
        },
        None => debug!("crs eviction: blown first-call dropped (overflow)"),
    }
}
