//! The resolved entry points of the underlying allocator.
//!
//! Because this library exports `malloc`/`free` itself, calling
//! `libc::malloc` from inside it would recurse straight back into the
//! shims. Every internal allocation therefore goes through the function
//! pointers resolved here via dlsym(RTLD_NEXT).

use crate::printer::emit_error;
use core::ffi::{c_void, CStr};
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use libc::c_int;

type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type ExitFn = unsafe extern "C" fn(c_int);

static REAL_MALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_CALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_REALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_FREE: AtomicUsize = AtomicUsize::new(0);
static REAL_EXIT: AtomicUsize = AtomicUsize::new(0);
static REAL_EXIT_IMMEDIATE: AtomicUsize = AtomicUsize::new(0);

/// Resolve every wrapped symbol from the next object in the link chain.
/// A missing symbol is unrecoverable. Until this completes, the empty
/// slots act as stubs that refuse to allocate, so allocations arriving
/// mid-resolution are forced into the bootstrap pool.
///
/// # Safety
/// Must only be called from the INITIALIZING window of the state machine.
pub unsafe fn resolve() {
    REAL_MALLOC.store(must_resolve(c"malloc"), Ordering::Release);
    REAL_CALLOC.store(must_resolve(c"calloc"), Ordering::Release);
    REAL_REALLOC.store(must_resolve(c"realloc"), Ordering::Release);
    REAL_FREE.store(must_resolve(c"free"), Ordering::Release);
    REAL_EXIT.store(must_resolve(c"exit"), Ordering::Release);
    REAL_EXIT_IMMEDIATE.store(must_resolve(c"_exit"), Ordering::Release);
}

unsafe fn must_resolve(name: &CStr) -> usize {
    let pointer = libc::dlsym(libc::RTLD_NEXT, name.as_ptr());
    if pointer.is_null() {
        emit_error!("init", "cannot find {}()", name.to_str().unwrap_or("?"));
        libc::abort();
    }
    pointer as usize
}

/// # Safety
/// Caller must uphold the contract of the underlying malloc.
#[inline]
pub unsafe fn malloc(size: usize) -> *mut c_void {
    let f = REAL_MALLOC.load(Ordering::Acquire);
    if f == 0 {
        return ptr::null_mut();
    }
    let func: MallocFn = core::mem::transmute(f);
    func(size)
}

/// # Safety
/// Caller must uphold the contract of the underlying calloc.
#[inline]
pub unsafe fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let f = REAL_CALLOC.load(Ordering::Acquire);
    if f == 0 {
        return ptr::null_mut();
    }
    let func: CallocFn = core::mem::transmute(f);
    func(nmemb, size)
}

/// # Safety
/// Caller must uphold the contract of the underlying realloc.
#[inline]
pub unsafe fn realloc(pointer: *mut c_void, size: usize) -> *mut c_void {
    let f = REAL_REALLOC.load(Ordering::Acquire);
    if f == 0 {
        return ptr::null_mut();
    }
    let func: ReallocFn = core::mem::transmute(f);
    func(pointer, size)
}

/// # Safety
/// `pointer` must be null or a pointer obtained from the underlying
/// allocator.
#[inline]
pub unsafe fn free(pointer: *mut c_void) {
    let f = REAL_FREE.load(Ordering::Acquire);
    if f == 0 {
        return;
    }
    let func: FreeFn = core::mem::transmute(f);
    func(pointer);
}

/// Delegate to the underlying exit(); aborts if it ever returns.
///
/// # Safety
/// Never returns; atexit handlers of the host run.
pub unsafe fn exit(status: c_int) -> ! {
    let f = REAL_EXIT.load(Ordering::Acquire);
    if f != 0 {
        let func: ExitFn = core::mem::transmute(f);
        func(status);
    }
    libc::abort()
}

/// Delegate to the underlying _exit(); aborts if it ever returns.
///
/// # Safety
/// Never returns.
pub unsafe fn exit_immediately(status: c_int) -> ! {
    let f = REAL_EXIT_IMMEDIATE.load(Ordering::Acquire);
    if f != 0 {
        let func: ExitFn = core::mem::transmute(f);
        func(status);
    }
    libc::abort()
}
