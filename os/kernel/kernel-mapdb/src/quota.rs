//! # RAM Quotas
//!
//! Every byte the mapping database allocates is charged to the quota of some
//! address space before the allocation happens and refunded when it is freed.

use crate::error::MapdbError;
use core::sync::atomic::{AtomicUsize, Ordering};
use log::warn;

/// A kernel-memory ledger.
pub trait RamQuota {
    /// Charge `bytes`; returns `false` (charging nothing) if the limit would be exceeded.
    fn alloc(&self, bytes: usize) -> bool;

    /// Refund `bytes` previously charged with [`alloc`](Self::alloc).
    fn free(&self, bytes: usize);
}

/// An atomic limit/used ledger.
#[derive(Debug)]
pub struct Quota {
    limit: usize,
    used: AtomicUsize,
}

impl Quota {
    #[must_use]
    pub const fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub const fn unlimited() -> Self {
        Self::new(usize::MAX)
    }

    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    #[must_use]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.limit - self.used()
    }
}

impl RamQuota for Quota {
    fn alloc(&self, bytes: usize) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= self.limit)
            })
            .is_ok()
    }

    fn free(&self, bytes: usize) {
        let prev = self.used.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "quota refund exceeds charge");
    }
}

/// A quota charge that is refunded on drop unless [`commit`](Self::commit)ted.
#[must_use]
pub struct QuotaReservation<'q, Q: RamQuota + ?Sized> {
    quota: &'q Q,
    bytes: usize,
}

impl<'q, Q: RamQuota + ?Sized> QuotaReservation<'q, Q> {
    /// Charge `bytes` to `quota`.
    ///
    /// # Errors
    /// [`MapdbError::OutOfQuota`] if the ledger refuses the charge.
    pub fn reserve(quota: &'q Q, bytes: usize) -> Result<Self, MapdbError> {
        if quota.alloc(bytes) {
            Ok(Self { quota, bytes })
        } else {
            warn!("quota exhausted while charging {bytes} bytes");
            Err(MapdbError::OutOfQuota)
        }
    }

    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.bytes
    }

    /// Keep the charge.
    pub fn commit(mut self) {
        self.bytes = 0;
    }
}

impl<Q: RamQuota + ?Sized> Drop for QuotaReservation<'_, Q> {
    fn drop(&mut self) {
        if self.bytes != 0 {
            self.quota.free(self.bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_respects_limit() {
        let q = Quota::new(100);
        assert!(q.alloc(60));
        assert!(!q.alloc(41));
        assert_eq!(q.used(), 60);
        assert!(q.alloc(40));
        assert_eq!(q.available(), 0);
        q.free(100);
        assert_eq!(q.used(), 0);
    }

    #[test]
    fn reservation_refunds_unless_committed() {
        let q = Quota::new(64);
        {
            let r = QuotaReservation::reserve(&q, 32).unwrap();
            assert_eq!(r.bytes(), 32);
            assert_eq!(q.used(), 32);
        }
        assert_eq!(q.used(), 0);

        QuotaReservation::reserve(&q, 48).unwrap().commit();
        assert_eq!(q.used(), 48);
        assert_eq!(
            QuotaReservation::reserve(&q, 17).err(),
            Some(MapdbError::OutOfQuota)
        );
        assert_eq!(q.used(), 48);
    }
}
