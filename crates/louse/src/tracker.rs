//! The tracking core: wraps every allocation in a shadow header, keeps the
//! live registry, validates signatures on release, and drives the
//! teardown report.

use crate::block::{AccessKind, BlockHeader};
use crate::bootstrap;
use crate::config;
use crate::dispatch;
use crate::init;
use crate::printer::{self, emit_error, emit_line, FixedWriter};
use crate::registry::LiveRegistry;
use crate::report;
use crate::resolve::StackResolver;
use crate::stack;
use crate::sync::Latch;
use core::ffi::c_void;
use core::ptr;
use regex::Regex;

pub static LIVE: LiveRegistry = LiveRegistry::new();

static FINALIZED: Latch = Latch::new();

/// Frame slots for diagnostic-time captures; enough for the default depth
/// plus the trimming margin.
const DIAGNOSTIC_FRAMES: usize = 34;

/// Reserve a header + guarded user region, record the allocation site and
/// link the block into the registry. Falls back to handing out the raw
/// buffer when the engine is not (yet) tracing.
///
/// # Safety
/// Called from an interposed entry point; must not re-enter the shims.
pub unsafe fn allocate(size: usize, kind: AccessKind) -> *mut c_void {
    let actual = match size.checked_add(BlockHeader::total_overhead()) {
        Some(actual) => actual,
        None => return ptr::null_mut(),
    };

    let raw = dispatch::malloc(actual);
    if raw.is_null() || init::state() != init::STATE_TRACING {
        return raw;
    }

    let block = raw as *mut BlockHeader;
    (*block).init(size, kind);

    if config::with_traces() {
        (*block).stack = stack::capture(config::max_frames());
    }

    LIVE.add(block);
    (*block).user_ptr() as *mut c_void
}

/// Validate and release a tracked block, reporting invalid pointers,
/// mismatched release kinds and tail-guard overruns. Diagnostics never
/// stop the release: the block is unlinked and returned to the underlying
/// allocator regardless, so the host can keep running.
///
/// # Safety
/// Called from an interposed entry point; `pointer` is whatever user code
/// handed to the release primitive.
pub unsafe fn free(pointer: *mut c_void, kind: AccessKind) {
    if pointer.is_null() {
        return;
    }

    if bootstrap::occupancy() > 0 && bootstrap::free_untracked(pointer) {
        return;
    }

    if init::state() != init::STATE_TRACING {
        dispatch::free(pointer);
        return;
    }

    let block = BlockHeader::from_user_ptr(pointer);

    if !(*block).is_signature_valid() {
        emit_error!(
            "runtime",
            "{} called with invalid memory pointer {:p}",
            kind.name(),
            pointer
        );
        emit_current_stack();
    } else {
        let origin = (*block).kind();

        if kind != origin.matching_release() {
            emit_error!(
                "runtime",
                "trying to {} memory pointer {:p} that was originally allocated via {}",
                kind.name(),
                pointer,
                origin.name()
            );
            emit_current_stack();
            emit_allocation_site(pointer, origin, (*block).stack);
        }

        if !(*block).is_tail_valid() {
            emit_error!(
                "runtime",
                "buffer overrun after memory pointer {:p} of size {} that was originally allocated via {}",
                pointer,
                (*block).size,
                origin.name()
            );
            emit_current_stack();
            emit_allocation_site(pointer, origin, (*block).stack);
        }
    }

    LIVE.remove(block);
    (*block).wipe_signature();

    if !(*block).stack.is_null() {
        dispatch::free((*block).stack as *mut c_void);
    }
    dispatch::free(block as *mut c_void);
}

/// The user-region size of a pointer the engine knows about, 0 otherwise.
///
/// # Safety
/// `pointer` must be a pointer previously returned by an interposed entry
/// point (anything else reads garbage in front of it).
pub unsafe fn size_of(pointer: *mut c_void) -> usize {
    if let Some(size) = bootstrap::lookup_size(pointer) {
        return size;
    }

    let block = BlockHeader::from_user_ptr(pointer);
    if (*block).is_signature_valid() {
        (*block).size
    } else {
        // unknown pointer
        0
    }
}

/// Run the teardown report exactly once, however many termination paths
/// race into it.
///
/// # Safety
/// Must only run while the host is quiescing (termination interposers).
pub unsafe fn finalize() {
    if !FINALIZED.try_acquire() {
        return;
    }

    let filter = compile_filter();
    printer::ensure_writable_output();
    report::emit_results(LIVE.snapshot_head(), LIVE.totals(), filter.as_ref());
}

/// Compile the suppression pattern; failure silently disables the filter.
fn compile_filter() -> Option<Regex> {
    let raw = config::suppress_filter()?;
    let pattern = raw.to_str().ok()?;
    if pattern.is_empty() {
        return None;
    }
    Regex::new(pattern).ok()
}

unsafe fn emit_current_stack() {
    let mut frames = [ptr::null_mut::<c_void>(); DIAGNOSTIC_FRAMES];
    if !stack::capture_into(config::max_frames(), &mut frames) {
        return;
    }
    emit_stack(frames.as_ptr());
}

unsafe fn emit_allocation_site(pointer: *mut c_void, origin: AccessKind, site: *mut *mut c_void) {
    if site.is_null() {
        return;
    }
    emit_line!("");
    emit_line!(
        "original allocation site of memory pointer {:p} via {}:",
        pointer,
        origin.name()
    );
    emit_stack(site);
}

unsafe fn emit_stack(frames: *const *mut c_void) {
    let mut resolver = StackResolver::new();
    let mut buffer = FixedWriter::<4096>::new();
    if resolver.resolve(
        config::max_frames(),
        printer::use_colors(),
        &mut buffer,
        frames,
    ) {
        emit_line!("{}", buffer.as_str());
    }
}
