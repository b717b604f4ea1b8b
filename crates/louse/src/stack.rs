//! Bounded capture of raw return addresses at allocation and diagnostic
//! sites. Symbolization is deferred to the resolver; this path must stay
//! allocation-free apart from the dispatch-routed result array.

use crate::dispatch;
use core::ffi::c_void;
use core::mem;
use core::ptr;

/// Scratch slots for one walk; matches the depth the resolver will print.
const SCRATCH_SLOTS: usize = 32;

/// Capture up to `max_frames` return addresses into an array allocated
/// through the dispatch table. The walk requests two extra frames so the
/// capture helper itself can be trimmed. Returns null when fewer than two
/// frames could be unwound or the array allocation failed; the result is
/// terminated by a null sentinel and owned by the caller (release it via
/// the dispatch table).
///
/// # Safety
/// Must not be called concurrently with symbolization of the same frames.
pub unsafe fn capture(max_frames: usize) -> *mut *mut c_void {
    let mut scratch = [ptr::null_mut::<c_void>(); SCRATCH_SLOTS];
    let wanted = (max_frames + 2).min(SCRATCH_SLOTS);

    let mut taken = 0usize;
    backtrace::trace_unsynchronized(|frame| {
        scratch[taken] = frame.ip();
        taken += 1;
        taken < wanted
    });

    if taken < 2 {
        return ptr::null_mut();
    }

    let pcs = dispatch::malloc(taken * mem::size_of::<*mut c_void>()) as *mut *mut c_void;
    if pcs.is_null() {
        return ptr::null_mut();
    }

    for i in 1..taken {
        pcs.add(i - 1).write(scratch[i]);
    }
    pcs.add(taken - 1).write(ptr::null_mut());
    pcs
}

/// Capture into a caller-provided buffer with the same trimming
/// convention; a null terminator is written at the first unused slot.
/// Returns true iff at least one usable frame was stored.
///
/// # Safety
/// Same as `capture`.
pub unsafe fn capture_into(max_frames: usize, out: &mut [*mut c_void]) -> bool {
    if out.len() < 2 {
        return false;
    }
    let wanted = (max_frames + 2).min(out.len() - 1);

    let mut seen = 0usize;
    let mut stored = 0usize;
    backtrace::trace_unsynchronized(|frame| {
        if seen > 0 {
            out[stored] = frame.ip();
            stored += 1;
        }
        seen += 1;
        stored < wanted
    });

    out[stored] = ptr::null_mut();
    stored > 0
}
