use crate::addr::{Order, VirtAddr};
use crate::config::DEPTH_UNUSED;
use crate::space::Space;
use crate::treemap::{OwnedTreemap, Treemap};
use bitfield_struct::bitfield;

/// Tree depth and page number of a mapping, packed into one word.
#[bitfield(u64)]
pub(crate) struct DepthPage {
    /// 0 for a frame's root mapping, [`DEPTH_UNUSED`] for a free slot.
    #[bits(8)]
    pub depth: u8,
    /// Virtual page number in the owner's address space.
    #[bits(56)]
    pub page: u64,
}

/// What a mapping slot refers to.
pub(crate) enum Owner<S: Space> {
    /// A page mapped into an address space.
    Space(S),
    /// A nested treemap splitting the parent's page into smaller pages.
    Submap(OwnedTreemap<S>),
}

/// One node of a frame's provenance tree.
pub(crate) struct Mapping<S: Space> {
    owner: Owner<S>,
    depth_page: DepthPage,
}

impl<S: Space> Mapping<S> {
    pub fn new(owner: Owner<S>, depth: u8, page: u64) -> Self {
        Self {
            owner,
            depth_page: DepthPage::new().with_depth(depth).with_page(page),
        }
    }

    pub const fn depth(&self) -> u8 {
        self.depth_page.depth()
    }

    pub const fn is_unused(&self) -> bool {
        self.depth() == DEPTH_UNUSED
    }

    pub fn mark_unused(&mut self) {
        self.depth_page.set_depth(DEPTH_UNUSED);
    }

    pub const fn page(&self) -> u64 {
        self.depth_page.page()
    }

    pub fn set_page(&mut self, page: u64) {
        self.depth_page.set_page(page);
    }

    pub const fn space(&self) -> Option<S> {
        match &self.owner {
            Owner::Space(space) => Some(*space),
            Owner::Submap(_) => None,
        }
    }

    pub fn set_space(&mut self, space: S) {
        debug_assert!(self.submap().is_none(), "rewriting the owner of a submap slot");
        self.owner = Owner::Space(space);
    }

    pub fn submap(&self) -> Option<&Treemap<S>> {
        match &self.owner {
            Owner::Space(_) => None,
            Owner::Submap(submap) => Some(submap),
        }
    }

    /// Space whose quota paid for this slot.
    pub fn payer(&self) -> S {
        match &self.owner {
            Owner::Space(space) => *space,
            Owner::Submap(submap) => submap.owner(),
        }
    }

    /// Public view of a leaf mapping in a tree of page order `order`.
    pub fn info(&self, order: Order) -> Option<MappingInfo<S>> {
        self.space().map(|space| MappingInfo {
            space,
            va: VirtAddr::new(order.addr_of(self.page())),
            order,
            depth: self.depth(),
        })
    }
}

/// A snapshot of one mapping.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MappingInfo<S> {
    /// Address space the page is mapped into.
    pub space: S,
    /// Page-aligned virtual address in `space`.
    pub va: VirtAddr,
    /// Page size of the mapping.
    pub order: Order,
    /// Depth in its frame's mapping tree; 0 is the frame's root mapping.
    pub depth: u8,
}

impl<S> MappingInfo<S> {
    /// Last virtual address inside the mapping.
    ///
    /// Inclusive, so that a page ending at the top of the address space has
    /// a representable bound.
    #[must_use]
    pub const fn last(&self) -> VirtAddr {
        VirtAddr::new(self.va.as_u64() + (self.order.size() - 1))
    }

    /// Whether `va` falls inside the mapped page.
    #[must_use]
    pub const fn contains(&self, va: VirtAddr) -> bool {
        va.as_u64() >= self.va.as_u64() && va.as_u64() <= self.last().as_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_page_packs_both_fields() {
        let dp = DepthPage::new().with_depth(3).with_page(0x00ff_ffff_ffff_ffff);
        assert_eq!(dp.depth(), 3);
        assert_eq!(dp.page(), 0x00ff_ffff_ffff_ffff);
        assert_eq!(dp.into_bits(), 0xffff_ffff_ffff_ff03);
    }

    #[test]
    fn top_page_bounds_do_not_wrap() {
        let info = MappingInfo {
            space: (),
            va: VirtAddr::new(0xffff_ffff_ffe0_0000),
            order: Order::MIB_2,
            depth: 1,
        };
        assert_eq!(info.last(), VirtAddr::new(u64::MAX));
        assert!(info.contains(VirtAddr::new(u64::MAX)));
        assert!(!info.contains(VirtAddr::new(0xffff_ffff_ffdf_ffff)));
    }
}
