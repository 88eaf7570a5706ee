use crate::addr::Order;

/// Errors reported by mapping-database operations.
///
/// Every operation that returns one of these has left the database exactly as
/// it found it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapdbError {
    #[error("address space quota exhausted")]
    OutOfQuota,
    #[error("out of memory")]
    OutOfMemory,
    #[error("mapping tree has reached its largest size class")]
    TreeFull,
    #[error("mapping tree depth limit reached")]
    TreeTooDeep,
    #[error("mapping not found")]
    NotFound,
    #[error("physical address outside the managed range")]
    InvalidAddress,
    #[error("unsupported mapping size {0}")]
    InvalidSize(Order),
    #[error("address not aligned to {0}")]
    Misaligned(Order),
    #[error("range does not intersect the mapping")]
    InvalidRange,
    #[error("grant does not cover the entire mapping")]
    PartialGrant,
    #[error("mapping cannot be granted")]
    NotGrantable,
    #[error("lock token does not select a mapping")]
    NoMapping,
    #[error("invalid page-size configuration")]
    InvalidConfig,
}

/// Structural defects found by `MappingTree::check_integrity`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("tree has no root entry")]
    Empty,
    #[error("root entry at slot 0 has depth {0}")]
    BadRoot(u8),
    #[error("slot {0} is not a live mapping")]
    UnusedSlot(usize),
    #[error("slot {index} at depth {depth} has no live parent")]
    Orphan { index: usize, depth: u8 },
    #[error("submap at slot {0} is not the first child of a mapping")]
    MisplacedSubmap(usize),
    #[error("submap at slot {0} has children")]
    SubmapWithChildren(usize),
    #[error("{len} slots exceed size class {size_id}")]
    Overfull { len: usize, size_id: u8 },
}
