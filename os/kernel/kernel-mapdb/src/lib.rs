//! # Kernel Mapping Database
//!
//! Tracks how pages of physical memory were passed from address space to
//! address space, so that revoking (flushing) a mapping can revoke everything
//! that was derived from it, and nothing else.
//!
//! ## Structure
//!
//! ```text
//!  Mapdb
//!   │
//!   ▼
//!  root Treemap (largest page size, e.g. 1 GiB)
//!  ┌───┬───┬───┬───┬───┬───┐
//!  │ 0 │ 1 │ 2 │ 3 │ … │ n │  Physframe: lock + optional MappingTree
//!  └───┴─┬─┴───┴───┴───┴───┘
//!        │
//!        ▼ MappingTree (pre-order array, one slot per mapping)
//!        ┌──────────────────┐
//!        │ d0 root space    │  identity mapping of the frame
//!        │ d1 space A       │
//!        │ d2 submap ───────┼──► nested Treemap (e.g. 2 MiB pages of A's page)
//!        │ d2 space B       │      ┌───┬───┬───┬───┐
//!        │ d1 space C       │      │ 0 │ 1 │ … │511│
//!        └──────────────────┘      └───┴─┬─┴───┴───┘
//!                                        ▼
//!                                   MappingTree rooted in A's slice
//! ```
//!
//! * A mapping tree stores one frame's derivation tree without
//!   pointers: each slot carries its depth and the tree shape follows from the
//!   array order. It grows and shrinks in size classes.
//! * A submap slot owns a nested treemap splitting its parent mapping's page
//!   into the next smaller page size. Mappings of smaller pages live there.
//! * Every allocation is charged to an address space's [`RamQuota`] before it
//!   happens and refunded when freed.
//!
//! ## Locking
//!
//! Each physframe has its own spin lock. [`Mapdb::lookup`] returns a [`Frame`]
//! token holding the lock of the frame where the mapping was found;
//! [`Mapdb::insert`], [`Mapdb::flush`] and [`Mapdb::grant`] require that token.
//! Frames of nested treemaps are only locked while holding the frame owning
//! the treemap, so locks are always acquired inward.
//!
//! ## Example
//!
//! ```
//! use kernel_mapdb::{Mapdb, MapMask, Order, PhysAddr, Quota, Space, VirtAddr};
//! use kernel_mapdb::config::X86_64_PAGE_SHIFTS;
//!
//! #[derive(Debug, Clone, Copy)]
//! struct Task(&'static Quota);
//!
//! impl PartialEq for Task {
//!     fn eq(&self, other: &Self) -> bool {
//!         core::ptr::eq(self.0, other.0)
//!     }
//! }
//!
//! impl Eq for Task {}
//!
//! impl Space for Task {
//!     type Quota = Quota;
//!     fn ram_quota(&self) -> &Quota {
//!         self.0
//!     }
//! }
//!
//! let sigma0 = Task(Box::leak(Box::new(Quota::unlimited())));
//! let app = Task(Box::leak(Box::new(Quota::new(64 * 1024))));
//! let db = Mapdb::new(sigma0, Order::new(36), &X86_64_PAGE_SHIFTS).unwrap();
//!
//! let phys = PhysAddr::new(0x4000_1000);
//! let mut frame = db.lookup(sigma0, VirtAddr::new(0x4000_0000), phys).unwrap();
//! db.insert(&mut frame, app, VirtAddr::new(0x1000), phys, Order::KIB_4).unwrap();
//! db.free(frame);
//!
//! let mut frame = db.lookup(app, VirtAddr::new(0x1000), phys).unwrap();
//! db.flush(&mut frame, MapMask::full(), VirtAddr::new(0x1000), VirtAddr::new(0x2000)).unwrap();
//! db.free(frame);
//! assert!(db.lookup(app, VirtAddr::new(0x1000), phys).is_err());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod addr;
pub mod config;
mod error;
mod lock;
mod mapdb;
mod mapping;
mod mapping_tree;
mod physframe;
mod quota;
mod space;
mod treemap;

#[cfg(test)]
mod testing;

pub use addr::{Order, PhysAddr, VirtAddr};
pub use error::{IntegrityError, MapdbError};
pub use lock::FrameGuard;
pub use mapdb::{Frame, MapMask, Mapdb};
pub use mapping::MappingInfo;
pub use quota::{Quota, QuotaReservation, RamQuota};
pub use space::Space;
