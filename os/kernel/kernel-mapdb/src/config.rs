//! # Mapping Database Configuration
//!
//! Kernel-wide constants: mapping-tree size classes, depth limits, the byte
//! costs charged against address-space quotas and the supported page-size
//! hierarchies.

use crate::addr::Order;

/// Slots in the smallest mapping-tree size class.
pub const MIN_ENTRIES: usize = 4;

/// Largest size-class index; a tree holds at most `MIN_ENTRIES << MAX_SIZE_ID` slots.
pub const MAX_SIZE_ID: u8 = 15;

/// Deepest depth a live mapping may have.
pub const DEPTH_MAX: u8 = 254;

/// Depth value marking a slot as unused.
pub const DEPTH_UNUSED: u8 = 255;

/// Quota charged for one mapping slot.
pub const MAPPING_SIZE: usize = 16;

/// Quota charged for a mapping-tree header.
pub const TREE_HEADER_SIZE: usize = 16;

/// Quota charged when a frame's mapping tree is created: header plus root slot.
pub const TREE_SIZE: usize = TREE_HEADER_SIZE + MAPPING_SIZE;

/// Quota charged for a treemap header.
pub const TREEMAP_HEADER_SIZE: usize = 64;

/// Quota charged per physframe slot (lock word plus tree handle).
pub const PHYSFRAME_SIZE: usize = 16;

/// Physframe arrays are carved from the kernel allocator in 1 KiB units.
pub const PHYSFRAME_ALLOC_GRANULE: usize = 1024;

/// Slot capacity of size class `size_id`.
#[must_use]
pub const fn tree_capacity(size_id: u8) -> usize {
    MIN_ENTRIES << size_id
}

/// Memory needed for `frames` physframes, rounded to the allocation granule.
#[must_use]
pub const fn physframe_mem_size(frames: usize) -> usize {
    (frames * PHYSFRAME_SIZE).next_multiple_of(PHYSFRAME_ALLOC_GRANULE)
}

/// Quota charged for a treemap covering `frames` frames.
///
/// Only for frame counts [`checked_treemap_quota_size`] accepts.
#[must_use]
pub const fn treemap_quota_size(frames: usize) -> usize {
    physframe_mem_size(frames) + TREEMAP_HEADER_SIZE
}

/// [`treemap_quota_size`], or `None` if the treemap is too large to account for.
#[must_use]
pub const fn checked_treemap_quota_size(frames: usize) -> Option<usize> {
    let Some(bytes) = frames.checked_mul(PHYSFRAME_SIZE) else {
        return None;
    };
    let Some(bytes) = bytes.checked_next_multiple_of(PHYSFRAME_ALLOC_GRANULE) else {
        return None;
    };
    bytes.checked_add(TREEMAP_HEADER_SIZE)
}

/// x86-64 page sizes: 1 GiB, 2 MiB, 4 KiB.
pub static X86_64_PAGE_SHIFTS: [Order; 3] = [Order::GIB_1, Order::MIB_2, Order::KIB_4];

/// IA-32 page sizes without PAE: 4 MiB, 4 KiB.
pub static IA32_PAGE_SHIFTS: [Order; 2] = [Order::MIB_4, Order::KIB_4];
