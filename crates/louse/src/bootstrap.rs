//! Side table for allocations that arrive before the dispatch table is
//! populated and before the tracker starts tracing.
//!
//! The dynamic loader itself allocates during symbol resolution; those
//! requests land here. Entries carry an 8-byte size prefix in front of the
//! user pointer instead of a full block header. The pool is only touched
//! before the host's worker threads exist, so it is single-threaded by
//! construction.

use crate::dispatch;
use crate::printer;
use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::mem;
use core::ptr;

pub const CAPACITY: usize = 4096;

const SIZE_PREFIX: usize = mem::size_of::<usize>();

struct Pool {
    entries: [*mut c_void; CAPACITY],
    len: usize,
}

struct PoolHolder(UnsafeCell<Pool>);

unsafe impl Sync for PoolHolder {}

static POOL: PoolHolder = PoolHolder(UnsafeCell::new(Pool {
    entries: [ptr::null_mut(); CAPACITY],
    len: 0,
}));

/// Allocate untracked memory with a size prefix and record the user
/// pointer in the pool. Returns null while the dispatch table still
/// refuses to allocate.
///
/// # Safety
/// Single-threaded by construction (pre-main only).
pub unsafe fn allocate_untracked(size: usize) -> *mut c_void {
    let pool = &mut *POOL.0.get();
    if pool.len == CAPACITY {
        printer::fatal_abort("allocation", "malloc: out of initialization memory");
    }

    let raw = dispatch::malloc(size + SIZE_PREFIX);
    if raw.is_null() {
        return ptr::null_mut();
    }

    (raw as *mut usize).write(size);
    let user = (raw as *mut u8).add(SIZE_PREFIX) as *mut c_void;
    pool.entries[pool.len] = user;
    pool.len += 1;
    user
}

/// Release `pointer` if the pool owns it, compacting the table. Returns
/// false for pointers the pool has never seen.
///
/// # Safety
/// Single-threaded by construction.
pub unsafe fn free_untracked(pointer: *mut c_void) -> bool {
    let pool = &mut *POOL.0.get();
    for i in 0..pool.len {
        if pool.entries[i] == pointer {
            dispatch::free((pointer as *mut u8).sub(SIZE_PREFIX) as *mut c_void);
            pool.len -= 1;
            pool.entries.copy_within(i + 1..=pool.len, i);
            return true;
        }
    }
    false
}

/// The recorded size of a pool-owned pointer.
///
/// # Safety
/// Single-threaded by construction.
pub unsafe fn lookup_size(pointer: *mut c_void) -> Option<usize> {
    let pool = &*POOL.0.get();
    for i in 0..pool.len {
        if pool.entries[i] == pointer {
            return Some((pointer as *const u8).sub(SIZE_PREFIX).cast::<usize>().read());
        }
    }
    None
}

pub fn occupancy() -> usize {
    unsafe { (*POOL.0.get()).len }
}
