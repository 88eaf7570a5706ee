use core::mem::ManuallyDrop;
use kernel_sync::RawSpin;

/// Scoped ownership of a physframe's lock.
///
/// Locks are only ever taken inward: a frame of a nested treemap is locked
/// while the frame owning that treemap is held, never the other way around.
pub struct FrameGuard<'a> {
    lock: &'a RawSpin,
}

impl<'a> FrameGuard<'a> {
    /// Spin until `lock` is acquired.
    #[inline]
    pub fn lock(lock: &'a RawSpin) -> Self {
        lock.lock();
        Self { lock }
    }

    /// Gives up the guard without unlocking; the lock must be released later
    /// through [`RawSpin::unlock`].
    #[inline]
    pub fn keep_locked(self) {
        let _ = ManuallyDrop::new(self);
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        // Safety: the guard exists only while the lock is held.
        unsafe { self.lock.unlock() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases_on_drop() {
        let l = RawSpin::new();
        {
            let _g = FrameGuard::lock(&l);
            assert!(l.is_locked());
            assert!(!l.try_lock());
        }
        assert!(!l.is_locked());
    }

    #[test]
    fn keep_locked_leaves_lock_held() {
        let l = RawSpin::new();
        FrameGuard::lock(&l).keep_locked();
        assert!(l.is_locked());
        unsafe { l.unlock() };
        assert!(!l.is_locked());
    }
}
