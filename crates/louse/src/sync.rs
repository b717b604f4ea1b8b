use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// An allocation-free mutex built on futex (Linux). std::sync::Mutex may
/// allocate, which is off-limits inside an allocator interposer.
///
/// State values: 0 = unlocked, 1 = locked, 2 = locked with waiters.
pub struct Mutex<T> {
    state: AtomicU32,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Mutex {
            state: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        if self
            .state
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_slow();
        }
        MutexGuard { mutex: self }
    }

    #[cold]
    fn lock_slow(&self) {
        loop {
            let old = self.state.swap(2, Ordering::Acquire);
            if old == 0 {
                return;
            }
            self.futex_wait(2);
        }
    }

    #[inline]
    fn unlock(&self) {
        if self.state.fetch_sub(1, Ordering::Release) != 1 {
            self.state.store(0, Ordering::Release);
            self.futex_wake();
        }
    }

    #[cfg(target_os = "linux")]
    fn futex_wait(&self, expected: u32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.state as *const AtomicU32,
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                core::ptr::null::<libc::timespec>(),
            );
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn futex_wait(&self, _expected: u32) {
        core::hint::spin_loop();
    }

    #[cfg(target_os = "linux")]
    #[cold]
    fn futex_wake(&self) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.state as *const AtomicU32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1i32,
            );
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn futex_wake(&self) {}
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> core::ops::Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> core::ops::DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// One-shot latch. The first `try_acquire` wins; every later call returns
/// false. Guards finalization so the report runs exactly once.
pub struct Latch {
    fired: AtomicBool,
}

impl Latch {
    pub const fn new() -> Self {
        Latch {
            fired: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn try_acquire(&self) -> bool {
        !self.fired.swap(true, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutex_guards_data() {
        let mutex = Mutex::new(0u64);
        for _ in 0..100 {
            *mutex.lock() += 1;
        }
        assert_eq!(*mutex.lock(), 100);
    }

    #[test]
    fn latch_fires_once() {
        let latch = Latch::new();
        assert!(latch.try_acquire());
        assert!(!latch.try_acquire());
        assert!(!latch.try_acquire());
    }
}
