//! Unix virtual memory implementation using mmap/mprotect/madvise.

use core::ffi::c_void;
use core::ptr;

pub unsafe fn reserve(size: usize) -> *mut u8 {
    // PROT_NONE: address space only, and any stray access before commit
    // faults loudly.
    #[allow(unused_mut)]
    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    #[cfg(target_os = "linux")]
    {
        flags |= libc::MAP_NORESERVE;
    }
    let raw = unsafe { libc::mmap(ptr::null_mut(), size, libc::PROT_NONE, flags, -1, 0) };
    if raw == libc::MAP_FAILED {
        return ptr::null_mut();
    }
    raw as *mut u8
}

pub unsafe fn commit(ptr: *mut u8, size: usize) -> bool {
    unsafe { libc::mprotect(ptr as *mut c_void, size, libc::PROT_READ | libc::PROT_WRITE) == 0 }
}

pub unsafe fn uncommit(ptr: *mut u8, size: usize) -> bool {
    // DONTNEED drops the pages (anonymous private mappings read back as
    // zeroes); PROT_NONE re-arms the access fault until the next commit.
    unsafe {
        if libc::madvise(ptr as *mut c_void, size, libc::MADV_DONTNEED) != 0 {
            return false;
        }
        libc::mprotect(ptr as *mut c_void, size, libc::PROT_NONE) == 0
    }
}

pub unsafe fn release(ptr: *mut u8, size: usize) {
    unsafe { libc::munmap(ptr as *mut c_void, size) };
}

pub fn page_size() -> usize {
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ps <= 0 { 4096 } else { ps as usize }
}
