use crate::error::MapdbError;
use crate::lock::FrameGuard;
use crate::mapping_tree::MappingTree;
use crate::space::Space;
use core::cell::UnsafeCell;
use kernel_sync::RawSpin;

/// One physical frame at one granularity: a lock and the frame's mapping tree,
/// if any mapping of it was ever recorded.
pub(crate) struct Physframe<S: Space> {
    lock: RawSpin,
    tree: UnsafeCell<Option<MappingTree<S>>>,
}

impl<S: Space> Physframe<S> {
    pub const fn new() -> Self {
        Self {
            lock: RawSpin::new(),
            tree: UnsafeCell::new(None),
        }
    }

    pub fn lock(&self) -> FrameGuard<'_> {
        FrameGuard::lock(&self.lock)
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// # Safety
    /// The caller must hold this frame's lock.
    pub unsafe fn unlock(&self) {
        unsafe { self.lock.unlock() }
    }

    /// # Safety
    /// The caller must hold this frame's lock and must not keep another
    /// reference to the tree alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn tree_mut(&self) -> &mut Option<MappingTree<S>> {
        debug_assert!(self.is_locked(), "mapping tree accessed without its lock");
        unsafe { &mut *self.tree.get() }
    }

    /// # Safety
    /// The caller must hold this frame's lock.
    pub unsafe fn tree(&self) -> Option<&MappingTree<S>> {
        debug_assert!(self.is_locked(), "mapping tree accessed without its lock");
        unsafe { (*self.tree.get()).as_ref() }
    }

    /// Creates the tree with root mapping `(owner, page)` unless one exists.
    /// Returns whether a tree was created.
    ///
    /// # Safety
    /// The caller must hold this frame's lock.
    pub unsafe fn ensure_tree(&self, owner: S, page: u64) -> Result<bool, MapdbError> {
        let slot = unsafe { self.tree_mut() };
        if slot.is_some() {
            return Ok(false);
        }
        *slot = Some(MappingTree::with_root(owner, page)?);
        Ok(true)
    }

    /// Destroys the tree, refunding every slot and freeing nested submaps.
    ///
    /// # Safety
    /// The caller must hold this frame's lock.
    pub unsafe fn erase_tree(&self) -> bool {
        unsafe { self.tree_mut() }.take().is_some()
    }
}
