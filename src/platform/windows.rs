//! Windows virtual memory implementation using VirtualAlloc/VirtualFree.

use core::ffi::c_void;
use core::ptr;

const MEM_COMMIT: u32 = 0x1000;
const MEM_RESERVE: u32 = 0x2000;
const MEM_DECOMMIT: u32 = 0x4000;
const MEM_RELEASE: u32 = 0x8000;
const PAGE_NOACCESS: u32 = 0x01;
const PAGE_READWRITE: u32 = 0x04;

#[repr(C)]
struct SystemInfo {
    oem_id: u32,
    page_size: u32,
    min_application_address: *mut c_void,
    max_application_address: *mut c_void,
    active_processor_mask: usize,
    number_of_processors: u32,
    processor_type: u32,
    allocation_granularity: u32,
    processor_level: u16,
    processor_revision: u16,
}

unsafe extern "system" {
    #[link_name = "VirtualAlloc"]
    fn virtual_alloc(
        lp_address: *mut c_void,
        dw_size: usize,
        fl_allocation_type: u32,
        fl_protect: u32,
    ) -> *mut c_void;

    #[link_name = "VirtualFree"]
    fn virtual_free(lp_address: *mut c_void, dw_size: usize, dw_free_type: u32) -> i32;

    #[link_name = "GetSystemInfo"]
    fn get_system_info(info: *mut SystemInfo);
}

pub unsafe fn reserve(size: usize) -> *mut u8 {
    let raw = unsafe { virtual_alloc(ptr::null_mut(), size, MEM_RESERVE, PAGE_NOACCESS) };
    raw as *mut u8
}

pub unsafe fn commit(ptr: *mut u8, size: usize) -> bool {
    let raw = unsafe { virtual_alloc(ptr as *mut c_void, size, MEM_COMMIT, PAGE_READWRITE) };
    !raw.is_null()
}

pub unsafe fn uncommit(ptr: *mut u8, size: usize) -> bool {
    unsafe { virtual_free(ptr as *mut c_void, size, MEM_DECOMMIT) != 0 }
}

pub unsafe fn release(ptr: *mut u8, _size: usize) {
    // MEM_RELEASE requires dwSize = 0 (releases the entire reservation).
    unsafe { virtual_free(ptr as *mut c_void, 0, MEM_RELEASE) };
}

pub fn page_size() -> usize {
    let mut info = SystemInfo {
        oem_id: 0,
        page_size: 0,
        min_application_address: ptr::null_mut(),
        max_application_address: ptr::null_mut(),
        active_processor_mask: 0,
        number_of_processors: 0,
        processor_type: 0,
        allocation_granularity: 0,
        processor_level: 0,
        processor_revision: 0,
    };
    unsafe { get_system_info(&mut info) };
    info.page_size as usize
}
