//! # Addresses and Page Orders
//!
//! The mapping database keys everything by page-granular numbers derived from
//! a byte address and a page [`Order`] (the base-2 logarithm of the page size).

use core::fmt;

/// A page order, i.e. `log2(page size in bytes)`.
///
/// `Order::new(12)` is a 4 KiB page, `Order::new(21)` a 2 MiB page.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Order(u8);

impl Order {
    /// 4 KiB pages.
    pub const KIB_4: Self = Self(12);
    /// 2 MiB pages (x86-64 large page).
    pub const MIB_2: Self = Self(21);
    /// 4 MiB pages (IA-32 large page without PAE).
    pub const MIB_4: Self = Self(22);
    /// 1 GiB pages.
    pub const GIB_1: Self = Self(30);

    /// Creates an order from a shift.
    ///
    /// # Panics
    /// Panics if `shift` is 64 or larger.
    #[must_use]
    pub const fn new(shift: u8) -> Self {
        assert!(shift < 64, "page order out of range");
        Self(shift)
    }

    #[must_use]
    pub const fn shift(self) -> u8 {
        self.0
    }

    /// Page size in bytes.
    #[must_use]
    pub const fn size(self) -> u64 {
        1 << self.0
    }

    /// Mask selecting the offset bits within one page.
    #[must_use]
    pub const fn offset_mask(self) -> u64 {
        self.size() - 1
    }

    /// Page number containing the byte address `addr`.
    #[must_use]
    pub const fn page_of(self, addr: u64) -> u64 {
        addr >> self.0
    }

    /// Byte address of page number `page`.
    #[must_use]
    pub const fn addr_of(self, page: u64) -> u64 {
        page << self.0
    }

    /// Rounds `addr` down to a page boundary.
    #[must_use]
    pub const fn align_down(self, addr: u64) -> u64 {
        addr & !self.offset_mask()
    }

    /// Number of pages needed to cover `bytes` bytes.
    #[must_use]
    pub const fn pages_covering(self, bytes: u64) -> u64 {
        bytes.div_ceil(self.size())
    }

    #[must_use]
    pub const fn is_aligned(self, addr: u64) -> bool {
        addr & self.offset_mask() == 0
    }
}

impl fmt::Debug for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Order({})", self.0)
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            s @ 0..10 => write!(f, "{} B", 1u64 << s),
            s @ 10..20 => write!(f, "{} KiB", 1u64 << (s - 10)),
            s @ 20..30 => write!(f, "{} MiB", 1u64 << (s - 20)),
            s @ 30..40 => write!(f, "{} GiB", 1u64 << (s - 30)),
            s => write!(f, "2^{s} B"),
        }
    }
}

/// A **virtual** address inside some address space.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct VirtAddr(u64);

/// A **physical** address (machine bus address).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct PhysAddr(u64);

macro_rules! impl_address {
    ($ty:ident, $label:literal) => {
        impl $ty {
            #[must_use]
            pub const fn new(addr: u64) -> Self {
                Self(addr)
            }

            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Rounds down to a page boundary of the given order.
            #[must_use]
            pub const fn align_down(self, order: Order) -> Self {
                Self(order.align_down(self.0))
            }

            #[must_use]
            pub const fn is_aligned(self, order: Order) -> bool {
                order.is_aligned(self.0)
            }
        }

        impl From<u64> for $ty {
            fn from(addr: u64) -> Self {
                Self(addr)
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "({:#x})"), self.0)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#018x}", self.0)
            }
        }
    };
}

impl_address!(VirtAddr, "VirtAddr");
impl_address!(PhysAddr, "PhysAddr");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_arithmetic() {
        let o = Order::MIB_2;
        assert_eq!(o.size(), 0x20_0000);
        assert_eq!(o.offset_mask(), 0x1f_ffff);
        assert_eq!(o.page_of(0x0420_1000), 0x21);
        assert_eq!(o.addr_of(0x21), 0x0420_0000);
        assert_eq!(o.align_down(0x0420_1000), 0x0420_0000);
        assert_eq!(o.pages_covering(0x20_0001), 2);
        assert!(o.is_aligned(0x0440_0000));
        assert!(!o.is_aligned(0x0440_1000));
    }

    #[test]
    fn order_display() {
        assert_eq!(format!("{}", Order::KIB_4), "4 KiB");
        assert_eq!(format!("{}", Order::MIB_4), "4 MiB");
        assert_eq!(format!("{}", Order::GIB_1), "1 GiB");
    }

    #[test]
    fn address_alignment() {
        let va = VirtAddr::new(0x3202_1234);
        assert_eq!(va.align_down(Order::KIB_4), VirtAddr::new(0x3202_1000));
        assert!(!va.is_aligned(Order::KIB_4));
        assert_eq!(format!("{:?}", PhysAddr::new(0x1000)), "PhysAddr(0x1000)");
    }
}
