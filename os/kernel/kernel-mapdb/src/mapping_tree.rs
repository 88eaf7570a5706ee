//! # Mapping Trees
//!
//! One frame's provenance tree, stored without pointers as a pre-order array:
//!
//! ```text
//! slot  depth
//! 0     0      root mapping of the frame
//! 1     1      child of #0
//! 2     2      child of #1
//! 3     2      child of #1
//! 4     3      child of #3
//! 5     1      child of #0
//!
//!            0
//!          /   \
//!         1     5
//!        / \
//!       2   3
//!           |
//!           4
//! ```
//!
//! A node's children are the entries following it whose depth is greater than
//! its own, up to the next entry that is not. A submap slot is always the first
//! child of the mapping whose page it splits and never has children of its own.
//!
//! The backing array steps through size classes of `4 << size_id` slots. It
//! grows by one class when full and shrinks once less than a quarter of the
//! current class is in use.

use crate::config::{
    DEPTH_MAX, MAPPING_SIZE, MAX_SIZE_ID, MIN_ENTRIES, TREE_SIZE, tree_capacity,
};
use crate::error::{IntegrityError, MapdbError};
use crate::mapping::{Mapping, Owner};
use crate::quota::{QuotaReservation, RamQuota};
use crate::space::Space;
use crate::treemap::Treemap;
use alloc::vec::Vec;
use log::{trace, warn};

pub(crate) struct MappingTree<S: Space> {
    entries: Vec<Mapping<S>>,
    size_id: u8,
}

impl<S: Space> MappingTree<S> {
    /// Creates a tree holding only the root mapping `(owner, page)`.
    ///
    /// `owner` pays for the tree header and the root slot.
    pub fn with_root(owner: S, page: u64) -> Result<Self, MapdbError> {
        let charge = QuotaReservation::reserve(owner.ram_quota(), TREE_SIZE)?;
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(MIN_ENTRIES)
            .map_err(|_| MapdbError::OutOfMemory)?;
        entries.push(Mapping::new(Owner::Space(owner), 0, page));
        charge.commit();
        Ok(Self {
            entries,
            size_id: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Slot capacity of the current size class.
    pub const fn capacity(&self) -> usize {
        tree_capacity(self.size_id)
    }

    pub fn get(&self, index: usize) -> Option<&Mapping<S>> {
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Mapping<S>> {
        self.entries.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mapping<S>> {
        self.entries.iter()
    }

    /// All entries below `parent`, in pre-order, with their slot index.
    pub fn descendants(&self, parent: usize) -> impl Iterator<Item = (usize, &Mapping<S>)> {
        let depth = self.entries.get(parent).map_or(u8::MAX, Mapping::depth);
        self.entries
            .iter()
            .enumerate()
            .skip(parent + 1)
            .take_while(move |(_, m)| m.depth() > depth)
    }

    /// Slot of the nearest preceding shallower entry.
    pub fn parent_of(&self, index: usize) -> Option<usize> {
        let depth = self.entries.get(index)?.depth();
        self.entries[..index].iter().rposition(|m| m.depth() < depth)
    }

    /// Slot of the submap already splitting `parent`'s page.
    pub fn find_submap(&self, parent: usize) -> Option<usize> {
        let depth = self.entries.get(parent)?.depth();
        let next = parent + 1;
        self.entries
            .get(next)
            .filter(|m| m.depth() == depth + 1 && m.submap().is_some())
            .map(|_| next)
    }

    pub fn submap_of(&self, parent: usize) -> Option<&Treemap<S>> {
        self.find_submap(parent)
            .and_then(|index| self.entries[index].submap())
    }

    /// Adds `owner` as a new child of `parent` and returns its slot.
    ///
    /// `payer` is charged for the slot. A submap becomes the first child; a
    /// plain mapping is placed right behind the parent's submap, if any. On
    /// failure nothing is charged and `owner` is dropped.
    pub fn allocate(
        &mut self,
        payer: S,
        parent: usize,
        owner: Owner<S>,
        page: u64,
    ) -> Result<usize, MapdbError> {
        let parent_depth = self
            .entries
            .get(parent)
            .map(Mapping::depth)
            .ok_or(MapdbError::NotFound)?;
        if parent_depth >= DEPTH_MAX {
            warn!("mapping tree depth limit reached below slot {parent}");
            return Err(MapdbError::TreeTooDeep);
        }

        let is_submap = matches!(owner, Owner::Submap(_));
        debug_assert!(
            !(is_submap && self.find_submap(parent).is_some()),
            "second submap under one mapping"
        );

        let charge = QuotaReservation::reserve(payer.ram_quota(), MAPPING_SIZE)?;
        self.reserve_one()?;

        let at = if !is_submap && self.find_submap(parent).is_some() {
            parent + 2
        } else {
            parent + 1
        };
        self.entries
            .insert(at, Mapping::new(owner, parent_depth + 1, page));
        charge.commit();
        Ok(at)
    }

    /// Makes room for one more slot, stepping up a size class if needed.
    fn reserve_one(&mut self) -> Result<(), MapdbError> {
        if self.entries.len() < self.capacity() {
            return Ok(());
        }
        if self.size_id == MAX_SIZE_ID {
            warn!("mapping tree full at {} slots", self.capacity());
            return Err(MapdbError::TreeFull);
        }

        let next = tree_capacity(self.size_id + 1);
        self.entries
            .try_reserve_exact(next - self.entries.len())
            .map_err(|_| MapdbError::OutOfMemory)?;
        self.size_id += 1;
        trace!("mapping tree grown to {next} slots");
        Ok(())
    }

    /// Drops back to the smallest size class still at least a quarter full.
    fn shrink(&mut self) {
        let len = self.entries.len();
        let mut size_id = self.size_id;
        while size_id > 0 && len * 4 < tree_capacity(size_id) {
            size_id -= 1;
        }
        if size_id != self.size_id {
            self.size_id = size_id;
            self.entries.shrink_to(tree_capacity(size_id));
            trace!("mapping tree shrunk to {} slots", tree_capacity(size_id));
        }
    }

    /// Removes a childless non-root entry, refunding its slot.
    pub fn free_mapping(&mut self, index: usize) {
        debug_assert!(index > 0, "freeing the root mapping");
        debug_assert!(
            self.descendants(index).next().is_none(),
            "freeing a mapping with children"
        );
        let mapping = self.entries.remove(index);
        mapping.payer().ram_quota().free(MAPPING_SIZE);
        drop(mapping);
        self.shrink();
    }

    /// Refunds slot `index` and marks it unused; [`compact`](Self::compact) removes it.
    fn release(&mut self, index: usize) {
        let mapping = &mut self.entries[index];
        mapping.payer().ram_quota().free(MAPPING_SIZE);
        mapping.mark_unused();
    }

    /// Removes unused slots in one pass, dropping any submaps they held.
    fn compact(&mut self) {
        self.entries.retain(|m| !m.is_unused());
        self.shrink();
    }

    /// Deletes the descendants of `parent` (and `parent` itself if `me_too`)
    /// that touch bytes `[offs_begin, offs_end)` of `parent`'s page.
    ///
    /// Plain mappings cover the whole page and are always deleted. A submap
    /// directly below `parent` is only flushed over the range unless the range
    /// spans it entirely. The root mapping is never deleted.
    pub fn flush(&mut self, parent: usize, me_too: bool, offs_begin: u64, offs_end: u64) {
        let Some(p_depth) = self.entries.get(parent).map(Mapping::depth) else {
            return;
        };
        let me_too = me_too && parent != 0;
        if me_too {
            self.release(parent);
        }

        let mut index = parent + 1;
        while let Some(mapping) = self.entries.get(index) {
            let depth = mapping.depth();
            if depth <= p_depth {
                break;
            }

            let kept = match mapping.submap() {
                Some(submap)
                    if !me_too
                        && depth == p_depth + 1
                        && submap.is_partial(offs_begin, offs_end) =>
                {
                    submap.flush_range(offs_begin, offs_end);
                    true
                }
                _ => false,
            };
            if !kept {
                self.release(index);
            }
            index += 1;
        }

        self.compact();
    }

    /// Verifies the pre-order depth encoding.
    pub fn check_integrity(&self) -> Result<(), IntegrityError> {
        let root = self.entries.first().ok_or(IntegrityError::Empty)?;
        if root.depth() != 0 || root.space().is_none() {
            return Err(IntegrityError::BadRoot(root.depth()));
        }
        if self.entries.len() > self.capacity() {
            return Err(IntegrityError::Overfull {
                len: self.entries.len(),
                size_id: self.size_id,
            });
        }

        for (i, pair) in self.entries.windows(2).enumerate() {
            let (prev, mapping) = (&pair[0], &pair[1]);
            let index = i + 1;
            let depth = mapping.depth();

            if mapping.is_unused() {
                return Err(IntegrityError::UnusedSlot(index));
            }
            if depth == 0 || depth > prev.depth().saturating_add(1) {
                return Err(IntegrityError::Orphan { index, depth });
            }
            if prev.submap().is_some() && depth > prev.depth() {
                return Err(IntegrityError::SubmapWithChildren(i));
            }
            if mapping.submap().is_some() && depth != prev.depth() + 1 {
                return Err(IntegrityError::MisplacedSubmap(index));
            }
        }
        Ok(())
    }

    /// Panics on a corrupted tree in debug builds or with `integrity-checks`.
    #[inline]
    pub fn assert_integrity(&self) {
        #[cfg(any(debug_assertions, feature = "integrity-checks"))]
        if let Err(err) = self.check_integrity() {
            panic!("mapping tree corrupted: {err}");
        }
    }
}

impl<S: Space> Drop for MappingTree<S> {
    fn drop(&mut self) {
        let mut entries = self.entries.iter();
        if let Some(root) = entries.next() {
            root.payer().ram_quota().free(TREE_SIZE);
        }
        for mapping in entries.filter(|m| !m.is_unused()) {
            mapping.payer().ram_quota().free(MAPPING_SIZE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Order;
    use crate::testing::{Task, task};

    fn depths(tree: &MappingTree<Task>) -> Vec<u8> {
        tree.iter().map(Mapping::depth).collect()
    }

    fn leaf(space: Task) -> Owner<Task> {
        Owner::Space(space)
    }

    #[test]
    fn root_charges_header_and_slot() {
        let owner = task(1024);
        let tree = MappingTree::with_root(owner, 7).unwrap();
        assert_eq!(owner.quota().used(), TREE_SIZE);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get(0).unwrap().page(), 7);
        drop(tree);
        assert_eq!(owner.quota().used(), 0);
    }

    #[test]
    fn root_fails_without_quota() {
        let owner = task(TREE_SIZE - 1);
        assert_eq!(
            MappingTree::with_root(owner, 0).err(),
            Some(MapdbError::OutOfQuota)
        );
        assert_eq!(owner.quota().used(), 0);
    }

    #[test]
    fn children_are_inserted_in_pre_order() {
        let (s0, a, b, c) = (task(4096), task(4096), task(4096), task(4096));
        let mut tree = MappingTree::with_root(s0, 0).unwrap();

        assert_eq!(tree.allocate(a, 0, leaf(a), 1).unwrap(), 1);
        assert_eq!(tree.allocate(b, 1, leaf(b), 2).unwrap(), 2);
        // a new child becomes the first child of its parent
        assert_eq!(tree.allocate(c, 0, leaf(c), 3).unwrap(), 1);

        assert_eq!(depths(&tree), [0, 1, 1, 2]);
        assert_eq!(tree.get(2).unwrap().space(), Some(a));
        assert_eq!(tree.parent_of(3), Some(2));
        assert_eq!(tree.parent_of(1), Some(0));
        assert_eq!(tree.parent_of(0), None);
        assert_eq!(tree.descendants(2).count(), 1);
        assert_eq!(tree.descendants(0).count(), 3);
        assert_eq!(b.quota().used(), MAPPING_SIZE);
        assert!(tree.check_integrity().is_ok());
    }

    #[test]
    fn grows_and_shrinks_across_size_classes() {
        let s0 = task(1 << 20);
        let mut tree = MappingTree::with_root(s0, 0).unwrap();
        for page in 0..10 {
            tree.allocate(s0, 0, leaf(s0), page).unwrap();
        }
        assert_eq!(tree.len(), 11);
        assert_eq!(tree.capacity(), 16);
        assert_eq!(s0.quota().used(), TREE_SIZE + 10 * MAPPING_SIZE);

        tree.flush(0, false, 0, Order::KIB_4.size());
        assert_eq!(depths(&tree), [0]);
        assert_eq!(tree.capacity(), MIN_ENTRIES);
        assert_eq!(s0.quota().used(), TREE_SIZE);
    }

    #[test]
    fn flush_removes_subtree_only() {
        let (s0, a, b, c) = (task(4096), task(4096), task(4096), task(4096));
        let mut tree = MappingTree::with_root(s0, 0).unwrap();
        tree.allocate(c, 0, leaf(c), 3).unwrap();
        tree.allocate(a, 0, leaf(a), 1).unwrap();
        tree.allocate(b, 1, leaf(b), 2).unwrap();
        assert_eq!(depths(&tree), [0, 1, 2, 1]);

        // a's children only
        tree.flush(1, false, 0, 4096);
        assert_eq!(depths(&tree), [0, 1, 1]);
        assert_eq!(b.quota().used(), 0);
        assert_eq!(tree.get(1).unwrap().space(), Some(a));

        // a itself
        tree.flush(1, true, 0, 4096);
        assert_eq!(depths(&tree), [0, 1]);
        assert_eq!(tree.get(1).unwrap().space(), Some(c));
        assert_eq!(a.quota().used(), 0);
        assert_eq!(c.quota().used(), MAPPING_SIZE);
    }

    #[test]
    fn flush_never_deletes_the_root() {
        let (s0, a) = (task(4096), task(4096));
        let mut tree = MappingTree::with_root(s0, 0).unwrap();
        tree.allocate(a, 0, leaf(a), 1).unwrap();
        tree.flush(0, true, 0, 4096);
        assert_eq!(depths(&tree), [0]);
        assert_eq!(tree.get(0).unwrap().space(), Some(s0));
    }

    #[test]
    fn failed_allocation_leaves_tree_unchanged() {
        let s0 = task(4096);
        let poor = task(MAPPING_SIZE);
        let mut tree = MappingTree::with_root(s0, 0).unwrap();
        tree.allocate(poor, 0, leaf(poor), 1).unwrap();
        assert_eq!(
            tree.allocate(poor, 1, leaf(poor), 2).err(),
            Some(MapdbError::OutOfQuota)
        );
        assert_eq!(depths(&tree), [0, 1]);
        assert_eq!(poor.quota().used(), MAPPING_SIZE);
    }

    #[test]
    fn depth_is_bounded() {
        let s0 = task(1 << 20);
        let mut tree = MappingTree::with_root(s0, 0).unwrap();
        let mut parent = 0;
        for _ in 0..DEPTH_MAX {
            parent = tree.allocate(s0, parent, leaf(s0), 0).unwrap();
        }
        assert_eq!(tree.get(parent).unwrap().depth(), DEPTH_MAX);
        assert_eq!(
            tree.allocate(s0, parent, leaf(s0), 0).err(),
            Some(MapdbError::TreeTooDeep)
        );
        assert!(tree.check_integrity().is_ok());
    }

    #[test]
    fn free_mapping_refunds_the_payer() {
        let (s0, a) = (task(4096), task(4096));
        let mut tree = MappingTree::with_root(s0, 0).unwrap();
        let index = tree.allocate(a, 0, leaf(a), 1).unwrap();
        tree.free_mapping(index);
        assert_eq!(depths(&tree), [0]);
        assert_eq!(a.quota().used(), 0);
    }

    #[test]
    fn integrity_check_finds_orphans() {
        let s0 = task(4096);
        let mut tree = MappingTree::with_root(s0, 0).unwrap();
        tree.allocate(s0, 0, leaf(s0), 1).unwrap();
        tree.entries.push(Mapping::new(leaf(s0), 3, 2));
        assert_eq!(
            tree.check_integrity(),
            Err(IntegrityError::Orphan { index: 2, depth: 3 })
        );
        tree.entries.pop();

        tree.entries[1].mark_unused();
        assert_eq!(tree.check_integrity(), Err(IntegrityError::UnusedSlot(1)));
        tree.entries.truncate(1);
        s0.quota().free(MAPPING_SIZE);
    }
}
