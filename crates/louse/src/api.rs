//! The interposed entry points. Every function here reads the engine
//! state before anything else: the dynamic loader may call the allocator
//! while symbol resolution is still in flight, and those requests must
//! reach the bootstrap pool instead of the tracking core.

use crate::block::AccessKind;
use crate::bootstrap;
use crate::dispatch;
use crate::init::{self, STATE_TRACING, STATE_UNINITIALIZED};
use crate::printer;
use crate::tracker;
use core::ffi::c_void;
use core::ptr;
use libc::c_int;

/// Route an allocation by state: tracked once tracing, bootstrap pool
/// before that.
unsafe fn route_allocate(size: usize, kind: AccessKind) -> *mut c_void {
    if init::state() == STATE_UNINITIALIZED {
        init::initialize();
    }
    if init::state() == STATE_TRACING {
        tracker::allocate(size, kind)
    } else {
        bootstrap::allocate_untracked(size)
    }
}

unsafe fn route_free(pointer: *mut c_void, kind: AccessKind) {
    if pointer.is_null() {
        return;
    }
    if init::state() == STATE_UNINITIALIZED {
        init::initialize();
    }
    if init::state() == STATE_TRACING {
        tracker::free(pointer, kind);
    } else {
        bootstrap::free_untracked(pointer);
    }
}

unsafe fn set_oom_errno() {
    *libc::__errno_location() = libc::ENOMEM;
}

// ============================================================================
// Standard C allocator API
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    // malloc(0) is not treated specially; it gets a header and guard too
    let pointer = route_allocate(size, AccessKind::Malloc);
    if pointer.is_null() {
        set_oom_errno();
    }
    pointer
}

#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let total = match nmemb.checked_mul(size) {
        Some(total) => total,
        None => {
            set_oom_errno();
            return ptr::null_mut();
        }
    };

    let pointer = route_allocate(total, AccessKind::Malloc);
    if pointer.is_null() {
        set_oom_errno();
    } else {
        ptr::write_bytes(pointer as *mut u8, 0, total);
    }
    pointer
}

#[no_mangle]
pub unsafe extern "C" fn realloc(pointer: *mut c_void, size: usize) -> *mut c_void {
    if init::state() == STATE_UNINITIALIZED {
        init::initialize();
    }

    if pointer.is_null() {
        let memory = route_allocate(size, AccessKind::Malloc);
        if memory.is_null() {
            set_oom_errno();
        }
        return memory;
    }

    let old_size = tracker::size_of(pointer);
    if old_size >= size {
        // In-place shrink / no-op; the tail guard stays at its original
        // offset.
        return pointer;
    }

    let memory = route_allocate(size, AccessKind::Malloc);
    if memory.is_null() {
        set_oom_errno();
        return ptr::null_mut();
    }

    ptr::copy_nonoverlapping(pointer as *const u8, memory as *mut u8, old_size);
    tracker::free(pointer, AccessKind::Free);
    memory
}

#[no_mangle]
pub unsafe extern "C" fn free(pointer: *mut c_void) {
    route_free(pointer, AccessKind::Free);
}

// ============================================================================
// C++ operators, exported under their Itanium-mangled names so the
// preloaded object intercepts new/delete as well
// ============================================================================

/// operator new(size_t)
#[export_name = "_Znwm"]
pub unsafe extern "C" fn operator_new(size: usize) -> *mut c_void {
    let pointer = route_allocate(size, AccessKind::New);
    if pointer.is_null() {
        printer::fatal_abort("runtime", "out of memory in operator new");
    }
    pointer
}

/// operator new(size_t, nothrow)
#[export_name = "_ZnwmRKSt9nothrow_t"]
pub unsafe extern "C" fn operator_new_nothrow(size: usize, _tag: *const c_void) -> *mut c_void {
    route_allocate(size, AccessKind::New)
}

/// operator new[](size_t)
#[export_name = "_Znam"]
pub unsafe extern "C" fn operator_new_array(size: usize) -> *mut c_void {
    let pointer = route_allocate(size, AccessKind::NewArray);
    if pointer.is_null() {
        printer::fatal_abort("runtime", "out of memory in operator new[]");
    }
    pointer
}

/// operator new[](size_t, nothrow)
#[export_name = "_ZnamRKSt9nothrow_t"]
pub unsafe extern "C" fn operator_new_array_nothrow(
    size: usize,
    _tag: *const c_void,
) -> *mut c_void {
    route_allocate(size, AccessKind::NewArray)
}

/// operator delete(void*)
#[export_name = "_ZdlPv"]
pub unsafe extern "C" fn operator_delete(pointer: *mut c_void) {
    route_free(pointer, AccessKind::Delete);
}

/// operator delete(void*, nothrow)
#[export_name = "_ZdlPvRKSt9nothrow_t"]
pub unsafe extern "C" fn operator_delete_nothrow(pointer: *mut c_void, _tag: *const c_void) {
    route_free(pointer, AccessKind::Delete);
}

/// operator delete(void*, size_t)
#[export_name = "_ZdlPvm"]
pub unsafe extern "C" fn operator_delete_sized(pointer: *mut c_void, _size: usize) {
    route_free(pointer, AccessKind::Delete);
}

/// operator delete[](void*)
#[export_name = "_ZdaPv"]
pub unsafe extern "C" fn operator_delete_array(pointer: *mut c_void) {
    route_free(pointer, AccessKind::DeleteArray);
}

/// operator delete[](void*, nothrow)
#[export_name = "_ZdaPvRKSt9nothrow_t"]
pub unsafe extern "C" fn operator_delete_array_nothrow(
    pointer: *mut c_void,
    _tag: *const c_void,
) {
    route_free(pointer, AccessKind::DeleteArray);
}

/// operator delete[](void*, size_t)
#[export_name = "_ZdaPvm"]
pub unsafe extern "C" fn operator_delete_array_sized(pointer: *mut c_void, _size: usize) {
    route_free(pointer, AccessKind::DeleteArray);
}

// ============================================================================
// Aligned allocation -- unsupported, by design
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    _memptr: *mut *mut c_void,
    _alignment: usize,
    _size: usize,
) -> c_int {
    printer::fatal_abort("assertion", "posix_memalign() is not handled")
}

#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(_alignment: usize, _size: usize) -> *mut c_void {
    printer::fatal_abort("assertion", "aligned_alloc() is not handled")
}

// ============================================================================
// Termination -- the only chance to run the leak report
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn exit(status: c_int) -> ! {
    if init::state() == STATE_UNINITIALIZED {
        init::initialize();
    }
    if init::state() == STATE_TRACING {
        tracker::finalize();
    }
    dispatch::exit(status)
}

#[no_mangle]
pub unsafe extern "C" fn _exit(status: c_int) -> ! {
    if init::state() == STATE_UNINITIALIZED {
        init::initialize();
    }
    if init::state() == STATE_TRACING {
        tracker::finalize();
    }
    dispatch::exit_immediately(status)
}

#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn _Exit(status: c_int) -> ! {
    if init::state() == STATE_UNINITIALIZED {
        init::initialize();
    }
    if init::state() == STATE_TRACING {
        tracker::finalize();
    }
    dispatch::exit_immediately(status)
}
