//! The record family: variable-length tagged messages packed into buffers.
//!
//! Every record starts with a 4-byte header (`size`, `tag`, `flags`) at a
//! word-aligned offset and never straddles a buffer. `size` is the exact
//! byte length including the header; iteration steps by the size rounded
//! up to [`RECORD_ALIGN`], so rewriting a tag in place (tombstoning,
//! blowing) never disturbs the walk.
//!
//! A class-load record whose source string equals the source of the
//! previous class-load in the *same* buffer omits the string and sets
//! `HAS_SAME_SOURCE`; the buffer's back-reference slot points at the
//! anchor record carrying the inline bytes. Flush-side processing keeps
//! its own anchor while walking and resolves such records before
//! delivery.

use core::mem::size_of;
use core::ptr;
use core::slice;

use crate::arena::RecordArena;
use crate::runtime::{ClassRef, CrsThread, MethodRef};
use crate::stat_bump;
use crate::tlb::{RefCategory, Tlb};

/// Records start at this alignment inside a buffer. `u64` fields are read
/// in place, so word alignment is required even on 32-bit hosts.
pub const RECORD_ALIGN: usize = core::mem::align_of::<u64>();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    ClassLoad = 1,
    ClassLoadBlown = 2,
    FirstCall = 3,
    FirstCallBlown = 4,
    /// A record rewritten in place; its byte footprint (and content past
    /// the header) is preserved, only the tag changes.
    Tombstone = 5,
    /// Reserved tag value; never emitted.
    GcLog = 6,
}

impl Tag {
    pub(crate) fn from_u8(v: u8) -> Option<Tag> {
        match v {
            1 => Some(Tag::ClassLoad),
            2 => Some(Tag::ClassLoadBlown),
            3 => Some(Tag::FirstCall),
            4 => Some(Tag::FirstCallBlown),
            5 => Some(Tag::Tombstone),
            6 => Some(Tag::GcLog),
            _ => None,
        }
    }
}

pub mod flags {
    pub const HAS_HASH: u8 = 0x01;
    pub const HAS_SOURCE: u8 = 0x02;
    pub const HAS_SAME_SOURCE: u8 = 0x04;
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RecordHeader {
    pub size: u16,
    pub tag: u8,
    pub flags: u8,
}

/// Fixed part of a class-load record. The `class` token pins runtime
/// metadata until the record is processed or blown. When `HAS_SOURCE` is
/// set, a `u16` length plus the source bytes follow the fixed part.
#[repr(C)]
pub struct ClassLoadRecord {
    pub header: RecordHeader,
    pub loader_id: u32,
    pub class: u64,
    pub class_id: u32,
    pub hash: [u8; 32],
}

pub const CLASS_LOAD_FIXED: usize = size_of::<ClassLoadRecord>();

/// Self-describing variant written by the eviction protocol: source and
/// class name are inlined, no metadata token remains.
#[repr(C)]
pub struct ClassLoadBlownRecord {
    pub header: RecordHeader,
    pub loader_id: u32,
    pub class_id: u32,
    pub source_len: u16,
    pub name_len: u16,
    pub hash: [u8; 32],
}

pub const CLASS_LOAD_BLOWN_FIXED: usize = size_of::<ClassLoadBlownRecord>();

#[repr(C)]
pub struct FirstCallRecord {
    pub header: RecordHeader,
    pub holder_class_id: u32,
    pub method: u64,
}

pub const FIRST_CALL_FIXED: usize = size_of::<FirstCallRecord>();

#[repr(C)]
pub struct FirstCallBlownRecord {
    pub header: RecordHeader,
    pub holder_class_id: u32,
    pub name_len: u16,
    pub sig_len: u16,
}

pub const FIRST_CALL_BLOWN_FIXED: usize = size_of::<FirstCallBlownRecord>();

/// A processed class-load, as handed to the sink. Exactly one of `class`
/// (live record, metadata resolvable) and `name` (blown record, inlined)
/// is present.
pub struct ClassLoadView<'a> {
    pub class: Option<ClassRef>,
    pub loader_id: u32,
    pub class_id: u32,
    pub hash: Option<&'a [u8; 32]>,
    pub source: Option<&'a [u8]>,
    pub name: Option<&'a [u8]>,
}

/// A processed first-call. `method` for live records; inlined `name` and
/// `signature` for blown ones.
pub struct FirstCallView<'a> {
    pub method: Option<MethodRef>,
    pub holder_class_id: u32,
    pub name: Option<&'a [u8]>,
    pub signature: Option<&'a [u8]>,
}

/// Consumer of processed records; the production sink turns them into
/// upstream notification events.
pub trait RecordSink {
    fn class_load(&mut self, view: ClassLoadView<'_>);
    fn first_call(&mut self, view: FirstCallView<'_>);
}

// ---- posting ----

/// Post a class-load record for `class`. Returns false when the record
/// was dropped (overflow or oversized).
pub fn post_class_load(
    arena: &RecordArena,
    thread: &CrsThread,
    class: ClassRef,
    loader_id: u32,
    class_id: u32,
    hash: Option<&[u8; 32]>,
    source: Option<&[u8]>,
) -> bool {
    let Some(src) = source else {
        let Some(p) = arena.alloc(CLASS_LOAD_FIXED, thread) else {
            return false;
        };
        unsafe {
            write_class_load(p.as_ptr(), class, loader_id, class_id, hash, SourceEnc::None);
        }
        stat_bump!(post_count);
        return true;
    };

    let size_full = CLASS_LOAD_FIXED + 2 + src.len();
    if size_full > u16::MAX as usize {
        return false;
    }

    // New reference unless the current buffer's anchor carries identical
    // source bytes. Rotation inside the arena forces a new reference
    // regardless of what we decide here.
    let mut is_new = match thread.current() {
        Some(t) => !anchor_matches(unsafe { t.as_ref() }, src),
        None => true,
    };

    let Some(p) = arena.alloc_reference(
        RefCategory::ClassLoadSource,
        &mut is_new,
        CLASS_LOAD_FIXED,
        size_full,
        thread,
    ) else {
        return false;
    };

    let enc = if is_new { SourceEnc::Inline(src) } else { SourceEnc::Same };
    unsafe { write_class_load(p.as_ptr(), class, loader_id, class_id, hash, enc) };
    stat_bump!(post_count);
    true
}

/// Post a first-call record for `method`.
pub fn post_first_call(
    arena: &RecordArena,
    thread: &CrsThread,
    method: MethodRef,
    holder_class_id: u32,
) -> bool {
    let Some(p) = arena.alloc(FIRST_CALL_FIXED, thread) else {
        return false;
    };
    unsafe {
        let rec = p.as_ptr() as *mut FirstCallRecord;
        ptr::write(
            rec,
            FirstCallRecord {
                header: RecordHeader {
                    size: FIRST_CALL_FIXED as u16,
                    tag: Tag::FirstCall as u8,
                    flags: 0,
                },
                holder_class_id,
                method: method.0,
            },
        );
    }
    stat_bump!(post_count);
    true
}

/// Does the buffer's class-load anchor carry exactly `src`?
fn anchor_matches(tlb: &Tlb, src: &[u8]) -> bool {
    let Some(off) = tlb.reference(RefCategory::ClassLoadSource) else {
        return false;
    };
    unsafe {
        let p = tlb.base().add(off as usize);
        let hdr = ptr::read(p as *const RecordHeader);
        // The slot is cleared when its record is tombstoned, so a live
        // anchor is always a class-load with inline source.
        debug_assert_eq!(hdr.tag, Tag::ClassLoad as u8);
        debug_assert_ne!(hdr.flags & flags::HAS_SOURCE, 0);
        if hdr.tag != Tag::ClassLoad as u8 || hdr.flags & flags::HAS_SOURCE == 0 {
            return false;
        }
        inline_source(p) == src
    }
}

// ---- in-place encoding ----

pub(crate) enum SourceEnc<'a> {
    None,
    Inline(&'a [u8]),
    Same,
}

/// # Safety
/// `p` must point at a record-aligned allocation large enough for the
/// encoded record.
pub(crate) unsafe fn write_class_load(
    p: *mut u8,
    class: ClassRef,
    loader_id: u32,
    class_id: u32,
    hash: Option<&[u8; 32]>,
    source: SourceEnc<'_>,
) {
    let mut f = 0u8;
    let mut size = CLASS_LOAD_FIXED;
    if hash.is_some() {
        f |= flags::HAS_HASH;
    }
    match source {
        SourceEnc::None => {}
        SourceEnc::Inline(s) => {
            f |= flags::HAS_SOURCE;
            size += 2 + s.len();
        }
        SourceEnc::Same => f |= flags::HAS_SAME_SOURCE,
    }
    debug_assert!(size <= u16::MAX as usize);

    unsafe {
        let rec = p as *mut ClassLoadRecord;
        ptr::write(
            rec,
            ClassLoadRecord {
                header: RecordHeader {
                    size: size as u16,
                    tag: Tag::ClassLoad as u8,
                    flags: f,
                },
                loader_id,
                class: class.0,
                class_id,
                hash: hash.copied().unwrap_or([0; 32]),
            },
        );
        if let SourceEnc::Inline(s) = source {
            write_trailing(p.add(CLASS_LOAD_FIXED), s);
        }
    }
}

pub(crate) fn class_load_blown_size(source_len: usize, name_len: usize) -> usize {
    CLASS_LOAD_BLOWN_FIXED + source_len + name_len
}

/// # Safety
/// Same contract as [`write_class_load`].
pub(crate) unsafe fn write_class_load_blown(
    p: *mut u8,
    loader_id: u32,
    class_id: u32,
    hash: Option<&[u8; 32]>,
    source: Option<&[u8]>,
    name: &[u8],
) {
    let src = source.unwrap_or(&[]);
    let size = class_load_blown_size(src.len(), name.len());
    debug_assert!(size <= u16::MAX as usize);
    let mut f = 0u8;
    if hash.is_some() {
        f |= flags::HAS_HASH;
    }
    if source.is_some() {
        f |= flags::HAS_SOURCE;
    }
    unsafe {
        let rec = p as *mut ClassLoadBlownRecord;
        ptr::write(
            rec,
            ClassLoadBlownRecord {
                header: RecordHeader {
                    size: size as u16,
                    tag: Tag::ClassLoadBlown as u8,
                    flags: f,
                },
                loader_id,
                class_id,
                source_len: src.len() as u16,
                name_len: name.len() as u16,
                hash: hash.copied().unwrap_or([0; 32]),
            },
        );
        let var = p.add(CLASS_LOAD_BLOWN_FIXED);
        ptr::copy_nonoverlapping(src.as_ptr(), var, src.len());
        ptr::copy_nonoverlapping(name.as_ptr(), var.add(src.len()), name.len());
    }
}

pub(crate) fn first_call_blown_size(name_len: usize, sig_len: usize) -> usize {
    FIRST_CALL_BLOWN_FIXED + name_len + sig_len
}

/// # Safety
/// Same contract as [`write_class_load`].
pub(crate) unsafe fn write_first_call_blown(
    p: *mut u8,
    holder_class_id: u32,
    name: &[u8],
    sig: &[u8],
) {
    let size = first_call_blown_size(name.len(), sig.len());
    debug_assert!(size <= u16::MAX as usize);
    unsafe {
        let rec = p as *mut FirstCallBlownRecord;
        ptr::write(
            rec,
            FirstCallBlownRecord {
                header: RecordHeader {
                    size: size as u16,
                    tag: Tag::FirstCallBlown as u8,
                    flags: 0,
                },
                holder_class_id,
                name_len: name.len() as u16,
                sig_len: sig.len() as u16,
            },
        );
        let var = p.add(FIRST_CALL_BLOWN_FIXED);
        ptr::copy_nonoverlapping(name.as_ptr(), var, name.len());
        ptr::copy_nonoverlapping(sig.as_ptr(), var.add(name.len()), sig.len());
    }
}

/// Rewrite a record's tag to tombstone, leaving size, flags and content
/// bytes intact (back-reference arithmetic and anchor bytes survive).
///
/// # Safety
/// `p` must point at a live record header.
pub(crate) unsafe fn tombstone(p: *mut u8) {
    unsafe { (*(p as *mut RecordHeader)).tag = Tag::Tombstone as u8 };
    stat_bump!(tombstone_count);
}

unsafe fn write_trailing(p: *mut u8, bytes: &[u8]) {
    unsafe {
        ptr::write_unaligned(p as *mut u16, bytes.len() as u16);
        ptr::copy_nonoverlapping(bytes.as_ptr(), p.add(2), bytes.len());
    }
}

/// The inline source of a class-load record with `HAS_SOURCE`.
///
/// # Safety
/// `p` must point at such a record; the bytes survive tombstoning.
pub(crate) unsafe fn inline_source<'a>(p: *const u8) -> &'a [u8] {
    unsafe {
        let len = ptr::read_unaligned(p.add(CLASS_LOAD_FIXED) as *const u16) as usize;
        slice::from_raw_parts(p.add(CLASS_LOAD_FIXED + 2), len)
    }
}

// ---- processing ----

/// Walk every record in `tlb` in write order, deliver live ones to the
/// sink and tombstone them afterwards, resolving `HAS_SAME_SOURCE`
/// against the most recent inline source seen. Returns the number of
/// records delivered.
///
/// Tombstone-after-delivery is what keeps the round trip exactly-once: a
/// safepoint eviction between deliveries cannot blow a record that was
/// already handed to the sink.
///
/// # Safety
/// The buffer must be quiescent: unowned and held by the flush walk, or
/// inspected inside a safepoint.
pub unsafe fn process_buffer(tlb: &Tlb, sink: &mut dyn RecordSink) -> usize {
    let base = tlb.base();
    let end = tlb.pos();
    let mut off = 0usize;
    let mut delivered = 0usize;
    // Flush-side back-reference: (offset, len) of the last inline source.
    let mut anchor: Option<(usize, usize)> = None;

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
                let mut resolvable = true;
                let source = if hdr.flags & flags::HAS_SOURCE != 0 {
                    let s = inline_source(p);
                    anchor = Some((off + CLASS_LOAD_FIXED + 2, s.len()));
                    Some(s)
                } else if hdr.flags & flags::HAS_SAME_SOURCE != 0 {
                    match anchor {
                        Some((o, l)) => Some(slice::from_raw_parts(base.add(o), l)),
                        None => {
                            // Broken back-reference; skip rather than
                            // deliver a wrong source.
                            debug_assert!(false, "same-source record without anchor");
                            resolvable = false;
                            None
                        }
                    }
                } else {
                    None
                };
                if resolvable {
                    sink.class_load(ClassLoadView {
                        class: Some(ClassRef(rec.class)),
                        loader_id: rec.loader_id,
                        class_id: rec.class_id,
                        hash: (hdr.flags & flags::HAS_HASH != 0).then_some(&rec.hash),
                        source,
                        name: None,
                    });
                    delivered += 1;
                }
                tombstone(p);
            },
            Some(Tag::ClassLoadBlown) => unsafe {
                let rec = &*(p as *const ClassLoadBlownRecord);
                let var = p.add(CLASS_LOAD_BLOWN_FIXED);
                let src = slice::from_raw_parts(var, rec.source_len as usize);
                let name = slice::from_raw_parts(
                    var.add(rec.source_len as usize),
                    rec.name_len as usize,
                );
                sink.class_load(ClassLoadView {
                    class: None,
                    loader_id: rec.loader_id,
                    class_id: rec.class_id,
                    hash: (hdr.flags & flags::HAS_HASH != 0).then_some(&rec.hash),
                    source: (hdr.flags & flags::HAS_SOURCE != 0).then_some(src),
                    name: Some(name),
                });
                delivered += 1;
                tombstone(p);
            },
            Some(Tag::FirstCall) => unsafe {
                let rec = &*(p as *const FirstCallRecord);
                sink.first_call(FirstCallView {
                    method: Some(MethodRef(rec.method)),
                    holder_class_id: rec.holder_class_id,
                    name: None,
                    signature: None,
                });
                delivered += 1;
                tombstone(p);
            },
            Some(Tag::FirstCallBlown) => unsafe {
                let rec = &*(p as *const FirstCallBlownRecord);
                let var = p.add(FIRST_CALL_BLOWN_FIXED);
                let name = slice::from_raw_parts(var, rec.name_len as usize);
                let sig =
                    slice::from_raw_parts(var.add(rec.name_len as usize), rec.sig_len as usize);
                sink.first_call(FirstCallView {
                    method: None,
                    holder_class_id: rec.holder_class_id,
                    name: Some(name),
                    signature: Some(sig),
                });
                delivered += 1;
                tombstone(p);
            },
            Some(Tag::Tombstone) | Some(Tag::GcLog) => {}
            None => {
                debug_assert!(false, "unknown record tag {}", hdr.tag);
                break;
            }
        }

        off += crate::tlb::align_record(size);
    }
    delivered
}
