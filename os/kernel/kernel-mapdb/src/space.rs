use crate::quota::RamQuota;
use core::fmt::Debug;

/// Identity of an address space as seen by the mapping database.
///
/// The database only compares identities and charges their quota; it never
/// looks inside. Implementations are cheap handles (a reference or an id).
pub trait Space: Copy + Eq + Debug {
    type Quota: RamQuota + ?Sized;

    /// Ledger charged for memory this space causes the database to allocate.
    fn ram_quota(&self) -> &Self::Quota;
}
