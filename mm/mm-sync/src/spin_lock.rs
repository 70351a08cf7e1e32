use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// Test-and-test-and-set spin lock with a RAII guard.
///
/// The fault handler takes this lock once per fault; hold times are short and
/// contention is bounded by the CPU count, so spinning is acceptable.
pub struct SpinLock<T> {
    /// Set while a guard is live.
    locked: AtomicBool,
    inner: UnsafeCell<T>,
}

// Safety: the flag grants exclusive access to `inner`, so sharing the lock
// is sound whenever the value itself may move between threads.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            inner: UnsafeCell::new(inner),
        }
    }

    /// One acquisition attempt; never spins.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Spin until acquired, then return a guard.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            // Wait on plain loads; the CAS is retried only once the holder
            // has cleared the flag.
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    /// Run `f` on the value under the lock.
    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }

    /// Direct access through `&mut self`; no guard or other reference can
    /// exist at the same time.
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

/// Exclusive view of the locked value; unlocks on drop.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: a live guard means the flag is set and nothing else can
        // reach the cell.
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: same exclusivity as `deref`, through a unique borrow of
        // the guard.
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release ordering publishes every write made under the guard.
        self.lock.locked.store(false, Ordering::Release);
    }
}
