use crate::config;
use crate::dispatch;
use core::sync::atomic::{AtomicU8, Ordering};

pub const STATE_UNINITIALIZED: u8 = 0;
pub const STATE_INITIALIZING: u8 = 1;
pub const STATE_HOOKED: u8 = 2;
pub const STATE_TRACING: u8 = 3;

/// The engine state. Transitions are strictly forward:
/// UNINITIALIZED -> INITIALIZING -> HOOKED -> TRACING.
static STATE: AtomicU8 = AtomicU8::new(STATE_UNINITIALIZED);

#[inline(always)]
pub fn state() -> u8 {
    STATE.load(Ordering::Relaxed)
}

/// Resolve the underlying allocator and reach HOOKED. Idempotent and safe
/// to call from any interposed entry point that observes UNINITIALIZED;
/// the first allocation of the process usually arrives before the library
/// constructor has run.
///
/// # Safety
/// May abort the process when a required symbol cannot be resolved.
pub unsafe fn initialize() {
    match STATE.compare_exchange(
        STATE_UNINITIALIZED,
        STATE_INITIALIZING,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => {}
        Err(STATE_INITIALIZING) => {
            while STATE.load(Ordering::Acquire) == STATE_INITIALIZING {
                core::hint::spin_loop();
            }
            return;
        }
        Err(_) => return,
    }

    // While we resolve, the empty dispatch slots refuse to allocate, so
    // loader-triggered allocations route to the bootstrap pool.
    dispatch::resolve();

    STATE.store(STATE_HOOKED, Ordering::Release);
}

/// Library constructor -- called before main().
#[used]
#[cfg_attr(target_os = "linux", link_section = ".init_array")]
static CTOR: unsafe extern "C" fn() = {
    unsafe extern "C" fn init() {
        louse_init();
    }
    init
};

/// Read the configuration and start tracing. Allocations made before this
/// point stay in the bootstrap pool; everything after is tracked.
///
/// # Safety
/// Must run on the single pre-main thread.
pub unsafe fn louse_init() {
    config::load_from_environment();
    initialize();
    let _ = STATE.compare_exchange(
        STATE_HOOKED,
        STATE_TRACING,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
}
