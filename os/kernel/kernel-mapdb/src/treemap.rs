//! # Treemaps
//!
//! A treemap covers a contiguous range at one page granularity: frame index
//! `key` selects the physframe holding the mapping tree for page `key` of the
//! range. The root treemap spans all of physical memory. Nested treemaps
//! (submaps) split a single page of a coarser tree into smaller pages. They
//! are owned by a submap slot in that tree and are only ever reached while
//! the coarser frame is locked.
//!
//! Each frame tree of a submap is rooted in the submap owner's slice of the
//! split page; mappings of the smaller size hang below that root.

use crate::addr::Order;
use crate::config::{MAPPING_SIZE, TREE_SIZE, checked_treemap_quota_size, treemap_quota_size};
use crate::error::MapdbError;
use crate::mapping::{Mapping, MappingInfo, Owner};
use crate::mapping_tree::MappingTree;
use crate::physframe::Physframe;
use crate::quota::{QuotaReservation, RamQuota};
use crate::space::Space;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ops::Deref;
use core::ptr::NonNull;
use log::{debug, trace};

#[derive(Copy, Clone)]
struct Header<S> {
    /// Space owning the split page.
    owner: S,
    /// Virtual address of frame 0 in `owner`'s address space.
    page_offset: u64,
}

pub(crate) struct Treemap<S: Space> {
    key_end: usize,
    page_shift: Order,
    /// Smaller page sizes usable below this treemap, largest first.
    sub_shifts: &'static [Order],
    frames: Box<[Physframe<S>]>,
    /// Written only by [`Treemap::reassign`] with the owning frame locked.
    header: UnsafeCell<Header<S>>,
}

// Safety: trees are only touched under their frame lock, the header only
// under the lock of the frame owning this treemap.
unsafe impl<S: Space + Send + Sync> Send for Treemap<S> {}
unsafe impl<S: Space + Send + Sync> Sync for Treemap<S> {}

/// A located mapping; `frame` is locked.
pub(crate) struct Found<S: Space> {
    pub treemap: NonNull<Treemap<S>>,
    pub frame: NonNull<Physframe<S>>,
    pub index: usize,
}

impl<S: Space> Treemap<S> {
    /// Creates a treemap splitting one page of order `parent_shift` into pages
    /// of order `shifts[0]`. `owner` pays for it.
    pub fn create(
        parent_shift: Order,
        owner: S,
        page_offset: u64,
        shifts: &'static [Order],
    ) -> Result<OwnedTreemap<S>, MapdbError> {
        let (&page_shift, sub_shifts) = shifts.split_first().ok_or(MapdbError::InvalidConfig)?;
        let span = parent_shift
            .shift()
            .checked_sub(page_shift.shift())
            .filter(|&span| span > 0)
            .ok_or(MapdbError::InvalidConfig)?;
        let key_end = 1usize
            .checked_shl(u32::from(span))
            .ok_or(MapdbError::InvalidConfig)?;

        let bytes = checked_treemap_quota_size(key_end).ok_or(MapdbError::InvalidConfig)?;
        let charge = QuotaReservation::reserve(owner.ram_quota(), bytes)?;
        let mut frames = Vec::new();
        frames
            .try_reserve_exact(key_end)
            .map_err(|_| MapdbError::OutOfMemory)?;
        frames.resize_with(key_end, Physframe::new);

        let treemap = Box::new(Self {
            key_end,
            page_shift,
            sub_shifts,
            frames: frames.into_boxed_slice(),
            header: UnsafeCell::new(Header { owner, page_offset }),
        });
        charge.commit();
        trace!("treemap of {key_end} x {page_shift} at {page_offset:#x} created for {owner:?}");
        Ok(OwnedTreemap::new(treemap))
    }

    fn header(&self) -> Header<S> {
        // Safety: readers reach this treemap through the frame owning it,
        // whose lock excludes `reassign`.
        unsafe { *self.header.get() }
    }

    pub fn owner(&self) -> S {
        self.header().owner
    }

    pub fn page_offset(&self) -> u64 {
        self.header().page_offset
    }

    pub const fn page_shift(&self) -> Order {
        self.page_shift
    }

    pub const fn key_end(&self) -> usize {
        self.key_end
    }

    /// Bytes covered.
    pub const fn size(&self) -> u64 {
        self.page_shift.addr_of(self.key_end as u64)
    }

    pub fn frame(&self, key: usize) -> &Physframe<S> {
        &self.frames[key]
    }

    /// Frame index of byte `offset`, clamped to the end of the range.
    #[allow(clippy::cast_possible_truncation)]
    fn key_of(&self, offset: u64) -> usize {
        self.page_shift.page_of(offset).min(self.key_end as u64) as usize
    }

    /// Frame index past the last frame touching bytes below `offset`.
    #[allow(clippy::cast_possible_truncation)]
    fn key_covering(&self, offset: u64) -> usize {
        self.page_shift
            .pages_covering(offset)
            .min(self.key_end as u64) as usize
    }

    /// Virtual page of frame `key` in the owner's address space.
    fn frame_page(&self, key: usize) -> u64 {
        self.page_shift
            .page_of(self.page_offset() + self.page_shift.addr_of(key as u64))
    }

    pub const fn is_partial(&self, offs_begin: u64, offs_end: u64) -> bool {
        offs_begin > 0 || offs_end < self.size()
    }

    /// Looks up the leaf mapping of `space` at `va` in the frame containing
    /// byte `offset`, descending into submaps. On success the frame holding
    /// the mapping is left locked and every other frame is unlocked.
    ///
    /// With `create_root`, a missing tree is created on the way when `space`
    /// asks for this treemap's own page at `va`.
    pub fn lookup(
        &self,
        offset: u64,
        space: S,
        va: u64,
        create_root: bool,
    ) -> Result<Option<Found<S>>, MapdbError> {
        let key = self.key_of(offset);
        debug_assert!(key < self.key_end, "lookup past the end of a treemap");
        let frame = self.frame(key);
        let guard = frame.lock();
        let page = self.page_shift.page_of(va);

        // Safety: the frame is locked.
        let slot = unsafe { frame.tree_mut() };
        if slot.is_none() {
            if !(create_root && space == self.owner() && page == self.frame_page(key)) {
                return Ok(None);
            }
            *slot = Some(MappingTree::with_root(space, page)?);
        }
        let Some(tree) = slot.as_ref() else {
            return Ok(None);
        };

        let sub_offset = offset & self.page_shift.offset_mask();
        for (index, mapping) in tree.iter().enumerate() {
            if let Some(submap) = mapping.submap() {
                if let Some(found) = submap.lookup(sub_offset, space, va, false)? {
                    return Ok(Some(found));
                }
            } else if mapping.space() == Some(space) && mapping.page() == page {
                guard.keep_locked();
                return Ok(Some(Found {
                    treemap: NonNull::from(self),
                    frame: NonNull::from(frame),
                    index,
                }));
            }
        }
        Ok(None)
    }

    /// Inserts a mapping of `space` at `va` below slot `parent` of `frame`.
    ///
    /// A mapping smaller than this treemap's pages goes into the submap below
    /// `parent`, which is created first if needed; `phys` selects the frame in
    /// there. Anything created on the way is destroyed again on failure.
    pub fn insert(
        &self,
        frame: &Physframe<S>,
        parent: usize,
        space: S,
        va: u64,
        phys: u64,
        order: Order,
    ) -> Result<MappingInfo<S>, MapdbError> {
        // Safety: the caller holds the frame lock.
        let tree = unsafe { frame.tree_mut() }
            .as_mut()
            .ok_or(MapdbError::NoMapping)?;
        let parent_mapping = tree.get(parent).ok_or(MapdbError::NoMapping)?;
        let parent_space = parent_mapping.space().ok_or(MapdbError::NoMapping)?;
        let parent_va = self.page_shift.addr_of(parent_mapping.page());

        if order == self.page_shift {
            let index = tree.allocate(space, parent, Owner::Space(space), order.page_of(va))?;
            tree.assert_integrity();
            return tree
                .get(index)
                .and_then(|m| m.info(order))
                .ok_or(MapdbError::NotFound);
        }
        if !self.sub_shifts.contains(&order) {
            debug!("no {order} pages below {} pages", self.page_shift);
            return Err(MapdbError::InvalidSize(order));
        }

        let (index, created) = match tree.find_submap(parent) {
            Some(index) => (index, false),
            None => {
                let submap = Self::create(self.page_shift, parent_space, parent_va, self.sub_shifts)?;
                let index = tree.allocate(parent_space, parent, Owner::Submap(submap), 0)?;
                (index, true)
            }
        };

        let result = tree
            .get(index)
            .and_then(Mapping::submap)
            .ok_or(MapdbError::NotFound)
            .and_then(|submap| {
                submap.insert_below(space, va, phys & self.page_shift.offset_mask(), order)
            });
        if result.is_err() && created {
            trace!("dropping submap created for a failed insert");
            tree.free_mapping(index);
        }
        tree.assert_integrity();
        result
    }

    /// Inserts below the root of the frame covering byte `offset`, creating
    /// that frame's tree if needed.
    fn insert_below(
        &self,
        space: S,
        va: u64,
        offset: u64,
        order: Order,
    ) -> Result<MappingInfo<S>, MapdbError> {
        let key = self.key_of(offset);
        let frame = self.frame(key);
        let _guard = frame.lock();

        // Safety: the frame is locked.
        let created = unsafe { frame.ensure_tree(self.owner(), self.frame_page(key)) }?;
        let result = self.insert(frame, 0, space, va, offset, order);
        if result.is_err() && created {
            // Safety: the frame is locked.
            unsafe { frame.erase_tree() };
        }
        result
    }

    /// Flushes below slot `parent` of `frame`; see [`MappingTree::flush`].
    pub fn flush(&self, frame: &Physframe<S>, parent: usize, me_too: bool, offs_begin: u64, offs_end: u64) {
        // Safety: the caller holds the frame lock.
        if let Some(tree) = unsafe { frame.tree_mut() }.as_mut() {
            tree.flush(parent, me_too, offs_begin, offs_end);
            tree.assert_integrity();
        }
    }

    /// Flushes bytes `[offs_begin, offs_end)` of the split page: frames fully
    /// inside the range lose their whole tree, frames cut by it are flushed
    /// below their root.
    pub fn flush_range(&self, offs_begin: u64, offs_end: u64) {
        let page_size = self.page_shift.size();
        for key in self.key_of(offs_begin)..self.key_covering(offs_end) {
            let page_begin = self.page_shift.addr_of(key as u64);
            let page_end = page_begin + page_size;
            let frame = self.frame(key);
            let _guard = frame.lock();

            if offs_begin <= page_begin && offs_end >= page_end {
                // Safety: the frame is locked.
                if unsafe { frame.erase_tree() } {
                    trace!("frame {key} of {} submap erased", self.page_shift);
                }
            } else {
                self.flush(
                    frame,
                    0,
                    false,
                    offs_begin.max(page_begin) - page_begin,
                    offs_end.min(page_end) - page_begin,
                );
            }
        }
    }

    /// Moves slot `index` of `frame` and everything its submap holds for the
    /// same owner to `new_space` at `va`.
    pub fn grant(&self, frame: &Physframe<S>, index: usize, new_space: S, va: u64) -> Result<(), MapdbError> {
        // Safety: the caller holds the frame lock.
        let tree = unsafe { frame.tree_mut() }
            .as_mut()
            .ok_or(MapdbError::NoMapping)?;
        let mapping = tree.get(index).ok_or(MapdbError::NoMapping)?;
        let old_space = mapping.space().ok_or(MapdbError::NotGrantable)?;
        if mapping.depth() == 0 {
            return Err(MapdbError::NotGrantable);
        }
        if !self.page_shift.is_aligned(va) {
            return Err(MapdbError::PartialGrant);
        }

        let submap = tree.submap_of(index);
        if old_space != new_space {
            let amount = MAPPING_SIZE + submap.map_or(0, |s| MAPPING_SIZE + s.footprint());
            QuotaReservation::reserve(new_space.ram_quota(), amount)?.commit();
            old_space.ram_quota().free(amount);
        }
        if let Some(submap) = submap {
            submap.reassign(new_space, va);
        }

        let mapping = tree.get_mut(index).ok_or(MapdbError::NoMapping)?;
        mapping.set_space(new_space);
        mapping.set_page(self.page_shift.page_of(va));
        debug!("{} mapping granted from {old_space:?} to {new_space:?} at {va:#x}", self.page_shift);
        Ok(())
    }

    /// Quota held by this treemap's owner for the treemap, its frame trees
    /// and the owner's nested submaps.
    pub fn footprint(&self) -> usize {
        let mut bytes = treemap_quota_size(self.key_end);
        for frame in &self.frames {
            let _guard = frame.lock();
            // Safety: the frame is locked.
            if let Some(tree) = unsafe { frame.tree() } {
                bytes += TREE_SIZE;
                if let Some(nested) = tree.submap_of(0) {
                    bytes += MAPPING_SIZE + nested.footprint();
                }
            }
        }
        bytes
    }

    /// Rewrites owner and base address, recursively for the owner's slices.
    ///
    /// The frame owning this treemap must be locked.
    fn reassign(&self, owner: S, page_offset: u64) {
        // Safety: the caller holds the lock of the frame owning this treemap.
        unsafe { *self.header.get() = Header { owner, page_offset } };

        for (key, frame) in self.frames.iter().enumerate() {
            let _guard = frame.lock();
            // Safety: the frame is locked.
            let Some(tree) = (unsafe { frame.tree_mut() }).as_mut() else {
                continue;
            };
            let frame_va = page_offset + self.page_shift.addr_of(key as u64);
            if let Some(root) = tree.get_mut(0) {
                root.set_space(owner);
                root.set_page(self.page_shift.page_of(frame_va));
            }
            if let Some(nested) = tree.submap_of(0) {
                nested.reassign(owner, frame_va);
            }
        }
    }

    /// Calls `f` for every leaf below slot `parent` of `tree`, in pre-order.
    ///
    /// The submap directly below `parent` is only visited over frames touching
    /// `[va_begin, va_end)` of its owner's address space; deeper submaps are
    /// visited entirely.
    pub fn for_each_below<F: FnMut(MappingInfo<S>)>(
        &self,
        tree: &MappingTree<S>,
        parent: usize,
        va_begin: u64,
        va_end: u64,
        f: &mut F,
    ) {
        for (index, mapping) in tree.descendants(parent) {
            if let Some(submap) = mapping.submap() {
                if index == parent + 1 {
                    submap.for_each_in(va_begin, va_end, f);
                } else {
                    submap.for_each_in(0, u64::MAX, f);
                }
            } else if let Some(info) = mapping.info(self.page_shift) {
                f(info);
            }
        }
    }

    fn for_each_in<F: FnMut(MappingInfo<S>)>(&self, va_begin: u64, va_end: u64, f: &mut F) {
        let base = self.page_offset();
        if va_end <= base || va_begin >= base.saturating_add(self.size()) {
            return;
        }

        let first = self.key_of(va_begin.saturating_sub(base));
        let last = self.key_covering(va_end - base);
        if first >= last {
            return;
        }
        for frame in &self.frames[first..last] {
            let _guard = frame.lock();
            // Safety: the frame is locked.
            if let Some(tree) = unsafe { frame.tree() } {
                self.for_each_below(tree, 0, va_begin, va_end, f);
            }
        }
    }
}

impl<S: Space> Drop for Treemap<S> {
    fn drop(&mut self) {
        for frame in &self.frames {
            // Wait out holders of a lock token on this frame.
            let _guard = frame.lock();
            // Safety: the frame is locked.
            unsafe { frame.erase_tree() };
        }

        let header = *self.header.get_mut();
        header
            .owner
            .ram_quota()
            .free(treemap_quota_size(self.key_end));
        trace!("treemap of {} x {} freed", self.key_end, self.page_shift);
    }
}

/// Owning handle to a heap-allocated [`Treemap`].
///
/// Lock tokens keep raw pointers into treemaps, so the treemap must stay put
/// while the slot holding its handle moves around in a growing tree.
pub(crate) struct OwnedTreemap<S: Space>(NonNull<Treemap<S>>);

// Safety: behaves like `Box<Treemap<S>>`.
unsafe impl<S: Space + Send + Sync> Send for OwnedTreemap<S> {}
unsafe impl<S: Space + Send + Sync> Sync for OwnedTreemap<S> {}

impl<S: Space> OwnedTreemap<S> {
    fn new(treemap: Box<Treemap<S>>) -> Self {
        Self(NonNull::from(Box::leak(treemap)))
    }
}

impl<S: Space> Deref for OwnedTreemap<S> {
    type Target = Treemap<S>;

    fn deref(&self) -> &Treemap<S> {
        // Safety: allocated in `new`, freed only on drop.
        unsafe { self.0.as_ref() }
    }
}

impl<S: Space> Drop for OwnedTreemap<S> {
    fn drop(&mut self) {
        // Safety: allocated by `Box` in `new`; this handle is the only owner.
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }
}
