//! The shadow record placed in front of every tracked allocation.
//!
//! The record is never constructed or dropped; it is placement-initialized
//! inside the raw buffer obtained from the underlying allocator, and the
//! four tail bytes directly past the user region carry the overrun guard.

use crate::util::{align_up, MIN_ALIGN};
use core::ffi::c_void;
use core::mem;
use core::ptr;

/// Signature of a live, tracked block.
pub const ALIVE_SIGNATURE: u32 = 0xdead_cafe;
/// Signature stamped over a block the engine has released.
pub const WIPED_SIGNATURE: u32 = 0xbaad_c0de;
/// Guard value stored directly past the user region.
pub const TAIL_SIGNATURE: u32 = 0xdead_beef;

/// How a block entered or left the engine. Mismatched pairs are reported.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum AccessKind {
    Invalid = 0,
    New = 1,
    NewArray = 2,
    Malloc = 3,
    Delete = 4,
    DeleteArray = 5,
    Free = 6,
}

impl AccessKind {
    pub fn from_raw(raw: u32) -> AccessKind {
        match raw {
            1 => AccessKind::New,
            2 => AccessKind::NewArray,
            3 => AccessKind::Malloc,
            4 => AccessKind::Delete,
            5 => AccessKind::DeleteArray,
            6 => AccessKind::Free,
            _ => AccessKind::Invalid,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AccessKind::New => "new",
            AccessKind::NewArray => "new[]",
            AccessKind::Malloc => "malloc()",
            AccessKind::Delete => "delete",
            AccessKind::DeleteArray => "delete[]",
            AccessKind::Free => "free()",
            AccessKind::Invalid => "invalid",
        }
    }

    /// The release kind that legally pairs with this origin kind.
    pub fn matching_release(self) -> AccessKind {
        match self {
            AccessKind::New => AccessKind::Delete,
            AccessKind::NewArray => AccessKind::DeleteArray,
            AccessKind::Malloc => AccessKind::Free,
            _ => AccessKind::Invalid,
        }
    }
}

#[repr(C)]
pub struct BlockHeader {
    pub size: usize,
    /// Null-terminated array of return addresses, or null when stack
    /// capture is disabled or failed. Allocated through the dispatch table.
    pub stack: *mut *mut c_void,
    kind: u32,
    signature: u32,
    pub prev: *mut BlockHeader,
    pub next: *mut BlockHeader,
}

impl BlockHeader {
    /// Header size rounded up so the user pointer stays 16-byte aligned.
    pub const fn overhead() -> usize {
        align_up(mem::size_of::<BlockHeader>(), MIN_ALIGN)
    }

    /// Header overhead plus the tail guard.
    pub const fn total_overhead() -> usize {
        Self::overhead() + mem::size_of::<u32>()
    }

    /// Reinterpret a user pointer as its block header.
    ///
    /// # Safety
    /// `pointer` must point at least `overhead()` bytes into a mapped
    /// region. For untracked pointers the resulting header holds garbage;
    /// callers must validate the signature before trusting any field.
    pub unsafe fn from_user_ptr(pointer: *mut c_void) -> *mut BlockHeader {
        (pointer as *mut u8).sub(Self::overhead()) as *mut BlockHeader
    }

    /// Placement initialization; replaces the constructor that must never
    /// run on this type.
    ///
    /// # Safety
    /// `self` must front a buffer of at least `total_overhead() + size`
    /// bytes.
    pub unsafe fn init(&mut self, size: usize, kind: AccessKind) {
        self.size = size;
        self.stack = ptr::null_mut();
        self.kind = kind as u32;
        self.signature = ALIVE_SIGNATURE;
        self.prev = ptr::null_mut();
        self.next = ptr::null_mut();
        ptr::write_unaligned(self.tail_ptr() as *mut u32, TAIL_SIGNATURE);
    }

    pub fn wipe_signature(&mut self) {
        self.signature = WIPED_SIGNATURE;
    }

    /// The address handed out to user code.
    pub fn user_ptr(&self) -> *mut u8 {
        (self as *const BlockHeader as *mut u8).wrapping_add(Self::overhead())
    }

    /// The address of the tail guard, directly past the user region.
    pub fn tail_ptr(&self) -> *mut u8 {
        self.user_ptr().wrapping_add(self.size)
    }

    pub fn kind(&self) -> AccessKind {
        AccessKind::from_raw(self.kind)
    }

    pub fn is_signature_valid(&self) -> bool {
        self.signature == ALIVE_SIGNATURE
    }

    /// Whether the tail guard is intact.
    ///
    /// # Safety
    /// The block must have been initialized via `init` and `size` must
    /// still describe the user region.
    pub unsafe fn is_tail_valid(&self) -> bool {
        ptr::read_unaligned(self.tail_ptr() as *const u32) == TAIL_SIGNATURE
    }
}
