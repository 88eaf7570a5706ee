use crate::addr::{Order, PhysAddr, VirtAddr};
use crate::error::MapdbError;
use crate::mapping::MappingInfo;
use crate::mapping_tree::MappingTree;
use crate::physframe::Physframe;
use crate::space::Space;
use crate::treemap::{Found, OwnedTreemap, Treemap};
use bitfield_struct::bitfield;
use core::marker::PhantomData;
use core::ptr::NonNull;
use log::{debug, trace};

/// Options of a flush.
#[bitfield(u8)]
pub struct MapMask {
    /// Remove the selected mapping too, not just what was derived from it.
    pub self_unmap: bool,
    #[bits(7)]
    __: u8,
}

impl MapMask {
    /// Flush the selected mapping and everything derived from it.
    #[must_use]
    pub const fn full() -> Self {
        Self::new().with_self_unmap(true)
    }

    /// Flush only what was derived from the selected mapping.
    #[must_use]
    pub const fn children() -> Self {
        Self::new()
    }
}

/// The mapping database.
///
/// Records, for every physical frame, which address space received which
/// page from whom, so that revoking a mapping can revoke everything derived
/// from it.
pub struct Mapdb<S: Space> {
    root: OwnedTreemap<S>,
    phys_order: Order,
}

impl<S: Space> Mapdb<S> {
    /// Creates a database for `2^phys_order` bytes of physical memory.
    ///
    /// `page_shifts` lists the supported page sizes, largest first. Every
    /// physical page of the largest size is identity-mapped in `root_space`,
    /// which also pays for the root treemap.
    ///
    /// # Errors
    /// [`MapdbError::InvalidConfig`] if `page_shifts` is empty, not strictly
    /// decreasing, or not below `phys_order`; quota or allocation errors for
    /// the root treemap.
    pub fn new(
        root_space: S,
        phys_order: Order,
        page_shifts: &'static [Order],
    ) -> Result<Self, MapdbError> {
        let decreasing = page_shifts.windows(2).all(|pair| pair[0] > pair[1]);
        match page_shifts.first() {
            Some(&top) if decreasing && top < phys_order => {}
            _ => return Err(MapdbError::InvalidConfig),
        }

        let root = Treemap::create(phys_order, root_space, 0, page_shifts)?;
        debug!(
            "mapdb: {} frames of {}, sizes {page_shifts:?}",
            root.key_end(),
            root.page_shift()
        );
        Ok(Self { root, phys_order })
    }

    /// Width of the managed physical address range.
    #[must_use]
    pub const fn phys_order(&self) -> Order {
        self.phys_order
    }

    /// Largest supported page size.
    #[must_use]
    pub fn root_order(&self) -> Order {
        self.root.page_shift()
    }

    /// Whether `phys` lies in the managed range.
    #[must_use]
    pub fn valid_address(&self, phys: PhysAddr) -> bool {
        phys.as_u64() < self.root.size()
    }

    /// Finds the mapping of `phys` at `va` in `space` and locks its frame.
    ///
    /// The root space's identity mapping of a frame is materialized on first
    /// lookup.
    ///
    /// # Errors
    /// [`MapdbError::InvalidAddress`] for `phys` outside the managed range,
    /// [`MapdbError::NotFound`] if `space` has no such mapping, quota or
    /// allocation errors when materializing a root mapping.
    pub fn lookup(&self, space: S, va: VirtAddr, phys: PhysAddr) -> Result<Frame<'_, S>, MapdbError> {
        if !self.valid_address(phys) {
            return Err(MapdbError::InvalidAddress);
        }
        match self.root.lookup(phys.as_u64(), space, va.as_u64(), true)? {
            Some(found) => Ok(Frame::new(found)),
            None => {
                trace!("no mapping of {phys:?} at {va:?} in {space:?}");
                Err(MapdbError::NotFound)
            }
        }
    }

    /// Records that `space` received `phys` at `va` from the mapping selected
    /// by `frame`.
    ///
    /// Pages smaller than the selected mapping are recorded in a submap of
    /// it. Only one insert is allowed per lookup.
    ///
    /// # Errors
    /// [`MapdbError::NoMapping`] if `frame` selects nothing,
    /// [`MapdbError::Misaligned`] / [`MapdbError::InvalidSize`] for bad call
    /// shapes, quota, allocation and tree-limit errors otherwise. A failed
    /// insert leaves no trace.
    pub fn insert(
        &self,
        frame: &mut Frame<'_, S>,
        space: S,
        va: VirtAddr,
        phys: PhysAddr,
        order: Order,
    ) -> Result<MappingInfo<S>, MapdbError> {
        debug_assert!(!frame.inserted, "second insert under one lock acquisition");
        let parent = frame.mapping.ok_or(MapdbError::NoMapping)?;
        if !va.is_aligned(order) || !phys.is_aligned(order) {
            return Err(MapdbError::Misaligned(order));
        }

        let info = frame.treemap().insert(
            frame.physframe(),
            parent,
            space,
            va.as_u64(),
            phys.as_u64(),
            order,
        )?;
        frame.inserted = true;
        trace!("{order} mapping of {phys:?} inserted at {va:?} in {space:?}");
        Ok(info)
    }

    /// Releases the lock held by `frame`.
    pub fn free(&self, frame: Frame<'_, S>) {
        drop(frame);
    }

    /// Deletes everything derived from the selected mapping that touches
    /// `[va_start, va_end)` of its page, and the mapping itself if `mask`
    /// says so. The range is clamped to the page.
    ///
    /// A root mapping is never deleted; `self_unmap` is ignored for it.
    ///
    /// # Errors
    /// [`MapdbError::NoMapping`] if `frame` selects nothing,
    /// [`MapdbError::InvalidRange`] if the range misses the page.
    pub fn flush(
        &self,
        frame: &mut Frame<'_, S>,
        mask: MapMask,
        va_start: VirtAddr,
        va_end: VirtAddr,
    ) -> Result<(), MapdbError> {
        let info = frame.mapping().ok_or(MapdbError::NoMapping)?;
        let (start, end) = (va_start.as_u64(), va_end.as_u64());
        if start >= end {
            return Err(MapdbError::InvalidRange);
        }
        // inclusive bounds; the page may end at the top of the address space
        let (page_first, page_last) = (info.va.as_u64(), info.last().as_u64());
        let last = end - 1;
        if last < page_first || start > page_last {
            return Err(MapdbError::InvalidRange);
        }

        let offs_begin = start.saturating_sub(page_first);
        let offs_end = last.min(page_last) - page_first + 1;
        Self::flush_offsets(frame, mask.self_unmap(), offs_begin, offs_end);
        Ok(())
    }

    /// Flushes bytes `[offs_begin, offs_end)` of the selected mapping's page.
    fn flush_offsets(frame: &mut Frame<'_, S>, self_unmap: bool, offs_begin: u64, offs_end: u64) {
        let (Some(index), Some(info)) = (frame.mapping, frame.mapping()) else {
            return;
        };
        let me_too = self_unmap && info.depth > 0;
        frame
            .treemap()
            .flush(frame.physframe(), index, me_too, offs_begin, offs_end);
        if me_too {
            frame.mapping = None;
        }
        trace!("flushed {offs_begin:#x}..{offs_end:#x} below {info:?}");
    }

    /// Hands the selected mapping, with everything that was derived from it,
    /// over to `new_space` at `va`.
    ///
    /// # Errors
    /// [`MapdbError::NotGrantable`] for a root mapping,
    /// [`MapdbError::PartialGrant`] if `va` is not aligned to the mapping's
    /// page size, [`MapdbError::OutOfQuota`] if `new_space` cannot take over
    /// the memory. Nothing changes on error.
    pub fn grant(&self, frame: &mut Frame<'_, S>, new_space: S, va: VirtAddr) -> Result<(), MapdbError> {
        let index = frame.mapping.ok_or(MapdbError::NoMapping)?;
        frame
            .treemap()
            .grant(frame.physframe(), index, new_space, va.as_u64())
    }

    /// Prepares mapping `phys` from `from` at `snd_addr` to `to` at `rcv_addr`.
    ///
    /// If `to` already holds the page as a direct child of the sender's
    /// mapping, returns the locked sender mapping so rights can be upgraded in
    /// place. Otherwise whatever `to` has at `rcv_addr` is flushed and `None`
    /// is returned.
    ///
    /// # Errors
    /// Lookup errors other than [`MapdbError::NotFound`].
    pub fn check_for_upgrade(
        &self,
        phys: PhysAddr,
        from: S,
        snd_addr: VirtAddr,
        to: S,
        rcv_addr: VirtAddr,
    ) -> Result<Option<Frame<'_, S>>, MapdbError> {
        let mut frame = match self.lookup(to, rcv_addr, phys) {
            Ok(frame) => frame,
            Err(MapdbError::NotFound) => return Ok(None),
            Err(err) => return Err(err),
        };
        let Some(receiver) = frame.mapping() else {
            return Ok(None);
        };

        if let Some(parent) = frame.parent_index() {
            let sender = frame.info_at(parent);
            if sender.is_some_and(|s| s.space == from && s.contains(snd_addr)) {
                frame.mapping = Some(parent);
                return Ok(Some(frame));
            }
        }

        if receiver.depth > 0 {
            debug!("unmapping {receiver:?} to make room");
            Self::flush_offsets(&mut frame, true, 0, receiver.order.size());
        }
        Ok(None)
    }

    /// Calls `f` for every mapping derived from the selected one, in
    /// pre-order, descending into submaps. Smaller pages directly below the
    /// selected mapping are only visited where they touch
    /// `[va_begin, va_end)` of its address space.
    pub fn foreach_mapping<F: FnMut(MappingInfo<S>)>(
        &self,
        frame: &Frame<'_, S>,
        va_begin: VirtAddr,
        va_end: VirtAddr,
        mut f: F,
    ) {
        let (Some(index), Some(tree)) = (frame.mapping, frame.tree()) else {
            return;
        };
        frame
            .treemap()
            .for_each_below(tree, index, va_begin.as_u64(), va_end.as_u64(), &mut f);
    }
}

/// Lock token for one frame's mapping tree, returned by [`Mapdb::lookup`].
///
/// Selects one mapping of the tree. The frame stays locked until the token is
/// dropped or passed to [`Mapdb::free`]. Hold at most one token at a time;
/// looking up another mapping while holding one can deadlock.
pub struct Frame<'db, S: Space> {
    treemap: NonNull<Treemap<S>>,
    physframe: NonNull<Physframe<S>>,
    mapping: Option<usize>,
    inserted: bool,
    _db: PhantomData<&'db Mapdb<S>>,
}

impl<S: Space> Frame<'_, S> {
    const fn new(found: Found<S>) -> Self {
        Self {
            treemap: found.treemap,
            physframe: found.frame,
            mapping: Some(found.index),
            inserted: false,
            _db: PhantomData,
        }
    }

    fn treemap(&self) -> &Treemap<S> {
        // Safety: a treemap is not freed while one of its frames is locked.
        unsafe { self.treemap.as_ref() }
    }

    fn physframe(&self) -> &Physframe<S> {
        // Safety: see `treemap`.
        unsafe { self.physframe.as_ref() }
    }

    fn tree(&self) -> Option<&MappingTree<S>> {
        // Safety: this token holds the frame lock.
        unsafe { self.physframe().tree() }
    }

    fn info_at(&self, index: usize) -> Option<MappingInfo<S>> {
        self.tree()?.get(index)?.info(self.page_order())
    }

    fn parent_index(&self) -> Option<usize> {
        self.tree()?.parent_of(self.mapping?)
    }

    /// The selected mapping; `None` once it was flushed.
    #[must_use]
    pub fn mapping(&self) -> Option<MappingInfo<S>> {
        self.info_at(self.mapping?)
    }

    /// The mapping the selected one was derived from, within the same frame.
    #[must_use]
    pub fn parent(&self) -> Option<MappingInfo<S>> {
        self.info_at(self.parent_index()?)
    }

    /// Page size of the locked frame.
    #[must_use]
    pub fn page_order(&self) -> Order {
        self.treemap().page_shift()
    }

    /// Whether this token was already used for an insert.
    #[must_use]
    pub const fn has_inserted(&self) -> bool {
        self.inserted
    }
}

impl<S: Space> Drop for Frame<'_, S> {
    fn drop(&mut self) {
        // Safety: the token was created with the frame locked.
        unsafe { self.physframe().unlock() }
    }
}
