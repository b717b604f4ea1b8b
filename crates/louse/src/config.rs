use core::ffi::CStr;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use libc::c_char;

/// Cached configuration values, read once at library startup.
static WITH_LEAKS: AtomicBool = AtomicBool::new(true);
static WITH_TRACES: AtomicBool = AtomicBool::new(true);
static MAX_FRAMES: AtomicUsize = AtomicUsize::new(16);
static MAX_LEAKS: AtomicUsize = AtomicUsize::new(100);
static SUPPRESS_FILTER: AtomicPtr<c_char> = AtomicPtr::new(ptr::null_mut());

/// Read configuration from the LOUSE_* environment variables.
///
/// # Safety
/// Must be called from a single-threaded context (the library constructor);
/// getenv is not thread-safe.
pub unsafe fn load_from_environment() {
    if let Some(value) = getenv_bytes(c"LOUSE_WITHLEAKS") {
        WITH_LEAKS.store(to_boolean(value, WITH_LEAKS.load(Ordering::Relaxed)), Ordering::Relaxed);
    }
    if let Some(value) = getenv_bytes(c"LOUSE_WITHTRACES") {
        WITH_TRACES.store(to_boolean(value, WITH_TRACES.load(Ordering::Relaxed)), Ordering::Relaxed);
    }
    let filter = libc::getenv(c"LOUSE_FILTER".as_ptr());
    if !filter.is_null() {
        SUPPRESS_FILTER.store(filter, Ordering::Relaxed);
    }
    if let Some(value) = getenv_bytes(c"LOUSE_MAXFRAMES") {
        MAX_FRAMES.store(to_number(value, MAX_FRAMES.load(Ordering::Relaxed)), Ordering::Relaxed);
    }
    if let Some(value) = getenv_bytes(c"LOUSE_MAXLEAKS") {
        MAX_LEAKS.store(to_number(value, MAX_LEAKS.load(Ordering::Relaxed)), Ordering::Relaxed);
    }
}

pub fn with_leaks() -> bool {
    WITH_LEAKS.load(Ordering::Relaxed)
}

pub fn with_traces() -> bool {
    WITH_TRACES.load(Ordering::Relaxed)
}

pub fn max_frames() -> usize {
    MAX_FRAMES.load(Ordering::Relaxed)
}

pub fn max_leaks() -> usize {
    MAX_LEAKS.load(Ordering::Relaxed)
}

/// The raw leak-suppression pattern, if one was configured. Points into the
/// process environment, so it stays valid for the process lifetime.
pub fn suppress_filter() -> Option<&'static CStr> {
    let pattern = SUPPRESS_FILTER.load(Ordering::Relaxed);
    if pattern.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(pattern) })
    }
}

unsafe fn getenv_bytes(key: &CStr) -> Option<&'static [u8]> {
    let value = libc::getenv(key.as_ptr());
    if value.is_null() {
        None
    } else {
        Some(CStr::from_ptr(value).to_bytes())
    }
}

/// "on/1/true/yes" and "off/0/false/no" are recognized; anything else keeps
/// the default.
fn to_boolean(value: &[u8], default: bool) -> bool {
    match value {
        b"on" | b"1" | b"true" | b"yes" => true,
        b"off" | b"0" | b"false" | b"no" => false,
        _ => default,
    }
}

/// Parse the leading integer of `value`, clamped to >= 1. Values without
/// any leading digits keep the default.
fn to_number(value: &[u8], default: usize) -> usize {
    let (negative, digits) = match value.first() {
        Some(b'-') => (true, &value[1..]),
        Some(b'+') => (false, &value[1..]),
        _ => (false, value),
    };

    let mut parsed: u64 = 0;
    let mut any = false;
    for &byte in digits {
        if !byte.is_ascii_digit() {
            break;
        }
        any = true;
        parsed = parsed
            .saturating_mul(10)
            .saturating_add((byte - b'0') as u64);
    }

    if !any {
        return default;
    }
    if negative || parsed < 1 {
        return 1;
    }
    parsed.min(usize::MAX as u64) as usize
}
