//! The set of all currently tracked blocks, kept as an intrusive doubly
//! linked list through the block headers so the allocation path never
//! allocates bookkeeping memory of its own.

use crate::block::BlockHeader;
use crate::sync::Mutex;
use core::ptr;

struct Inner {
    /// Most recently added block.
    head: *mut BlockHeader,
    count: u64,
    bytes: u64,
}

// Raw header pointers only ever travel between threads under the mutex.
unsafe impl Send for Inner {}

pub struct LiveRegistry {
    inner: Mutex<Inner>,
}

impl LiveRegistry {
    pub const fn new() -> Self {
        LiveRegistry {
            inner: Mutex::new(Inner {
                head: ptr::null_mut(),
                count: 0,
                bytes: 0,
            }),
        }
    }

    /// Link a freshly initialized block in front of the list.
    ///
    /// # Safety
    /// `block` must point to an initialized header not currently linked.
    pub unsafe fn add(&self, block: *mut BlockHeader) {
        let mut inner = self.inner.lock();
        (*block).prev = ptr::null_mut();
        (*block).next = inner.head;
        if !inner.head.is_null() {
            (*inner.head).prev = block;
        }
        inner.head = block;
        inner.count += 1;
        inner.bytes += (*block).size as u64;
    }

    /// Unlink a block. The counters are cumulative and intentionally stay
    /// untouched; the final report shows total allocation activity.
    ///
    /// # Safety
    /// `block` must point to a header previously linked via `add`.
    pub unsafe fn remove(&self, block: *mut BlockHeader) {
        let mut inner = self.inner.lock();
        if !(*block).prev.is_null() {
            (*(*block).prev).next = (*block).next;
        }
        if !(*block).next.is_null() {
            (*(*block).next).prev = (*block).prev;
        }
        if inner.head == block {
            inner.head = (*block).next;
        }
    }

    /// The current list head, for the teardown walk.
    pub fn snapshot_head(&self) -> *mut BlockHeader {
        self.inner.lock().head
    }

    /// Cumulative (count, bytes) of every allocation ever tracked.
    pub fn totals(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.count, inner.bytes)
    }

    /// Walk the chain from `start`; a live node without the alive
    /// signature means user code trampled the bookkeeping and the leak
    /// walk cannot be trusted.
    ///
    /// # Safety
    /// `start` must be null or a node of the list, and the list must not
    /// be mutated concurrently.
    pub unsafe fn is_corrupted(start: *const BlockHeader) -> bool {
        let mut node = start;
        while !node.is_null() {
            if !(*node).is_signature_valid() {
                return true;
            }
            node = (*node).next;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::AccessKind;

    #[repr(align(16))]
    struct Slot([u8; 128]);

    unsafe fn fabricate(slot: &mut Slot, size: usize) -> *mut BlockHeader {
        let header = slot.0.as_mut_ptr() as *mut BlockHeader;
        (*header).init(size, AccessKind::Malloc);
        header
    }

    #[test]
    fn add_and_remove_maintain_links() {
        let registry = LiveRegistry::new();
        let mut a = Slot([0; 128]);
        let mut b = Slot([0; 128]);
        let mut c = Slot([0; 128]);

        unsafe {
            let first = fabricate(&mut a, 10);
            let second = fabricate(&mut b, 20);
            let third = fabricate(&mut c, 30);

            registry.add(first);
            registry.add(second);
            registry.add(third);

            // Head is the most recent addition.
            assert_eq!(registry.snapshot_head(), third);
            assert_eq!((*third).next, second);
            assert_eq!((*second).prev, third);

            // Removing the middle node relinks its neighbors.
            registry.remove(second);
            assert_eq!((*third).next, first);
            assert_eq!((*first).prev, third);

            // Removing the head advances it.
            registry.remove(third);
            assert_eq!(registry.snapshot_head(), first);

            registry.remove(first);
            assert!(registry.snapshot_head().is_null());
        }
    }

    #[test]
    fn totals_are_cumulative() {
        let registry = LiveRegistry::new();
        let mut a = Slot([0; 128]);
        let mut b = Slot([0; 128]);

        unsafe {
            let first = fabricate(&mut a, 17);
            let second = fabricate(&mut b, 3);
            registry.add(first);
            registry.add(second);
            assert_eq!(registry.totals(), (2, 20));

            // remove() does not roll the counters back.
            registry.remove(first);
            registry.remove(second);
            assert_eq!(registry.totals(), (2, 20));
        }
    }

    #[test]
    fn corruption_walk_spots_wiped_signatures() {
        let registry = LiveRegistry::new();
        let mut a = Slot([0; 128]);
        let mut b = Slot([0; 128]);

        unsafe {
            let first = fabricate(&mut a, 8);
            let second = fabricate(&mut b, 8);
            registry.add(first);
            registry.add(second);

            let head = registry.snapshot_head();
            assert!(!LiveRegistry::is_corrupted(head));

            (*first).wipe_signature();
            assert!(LiveRegistry::is_corrupted(head));
        }
    }
}
