//! Addresses and spans of heap memory
//!
//! All pointer arithmetic over region memory goes through [`Span`] so
//! that offsets can be bounds checked in debug builds.

use std::fmt::{self, Debug, Display};

/// Size of a machine word
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Alignment of every object handed out by the heap
pub const OBJECT_ALIGNMENT: usize = WORD_SIZE;

/// Round `n` up to a multiple of `align` (a power of two)
#[inline]
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Round `n` down to a multiple of `align` (a power of two)
#[inline]
pub const fn align_down(n: usize, align: usize) -> usize {
    n & !(align - 1)
}

#[inline]
pub const fn is_aligned(n: usize, align: usize) -> bool {
    n & (align - 1) == 0
}

/// An address in heap memory
///
/// The zero address is the "no memory" sentinel used by the space
/// layer.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(usize);

impl Address {
    pub const NULL: Address = Address(0);

    pub const fn new(addr: usize) -> Self {
        Address(addr)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Address(ptr as usize)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` above this one
    #[inline]
    pub const fn offset(self, bytes: usize) -> Address {
        Address(self.0 + bytes)
    }

    /// Byte distance from `lower` up to this address
    #[inline]
    pub fn diff(self, lower: Address) -> usize {
        debug_assert!(lower.0 <= self.0, "{:?} below {:?}", self, lower);
        self.0 - lower.0
    }

    pub const fn is_aligned_to(self, align: usize) -> bool {
        is_aligned(self.0, align)
    }

    pub const fn align_up(self, align: usize) -> Address {
        Address(align_up(self.0, align))
    }

    pub const fn align_down(self, align: usize) -> Address {
        Address(align_down(self.0, align))
    }

    pub fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Read the word at this address
    ///
    /// # Safety
    ///
    /// The address must be word aligned and within mapped heap memory.
    #[inline]
    pub unsafe fn load_word(self) -> usize {
        std::ptr::read(self.as_ptr::<usize>())
    }

    /// Write the word at this address
    ///
    /// # Safety
    ///
    /// The address must be word aligned and within mapped heap memory
    /// that no other thread is reading.
    #[inline]
    pub unsafe fn store_word(self, value: usize) {
        std::ptr::write(self.as_mut_ptr::<usize>(), value)
    }

    /// Zero `len` bytes from this address
    ///
    /// # Safety
    ///
    /// The range must be within mapped heap memory owned by the caller.
    pub unsafe fn zero(self, len: usize) {
        std::ptr::write_bytes(self.as_mut_ptr::<u8>(), 0, len)
    }

    /// Copy `len` bytes from this address to `dest`
    ///
    /// # Safety
    ///
    /// Both ranges must be mapped and must not overlap.
    pub unsafe fn copy_to(self, dest: Address, len: usize) {
        std::ptr::copy_nonoverlapping(self.as_ptr::<u8>(), dest.as_mut_ptr::<u8>(), len)
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A contiguous byte range `[base, base + len)`
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Span {
    base: Address,
    len: usize,
}

impl Span {
    pub const EMPTY: Span = Span {
        base: Address::NULL,
        len: 0,
    };

    pub const fn new(base: Address, len: usize) -> Self {
        Span { base, len }
    }

    pub fn between(begin: Address, end: Address) -> Self {
        Span {
            base: begin,
            len: end.diff(begin),
        }
    }

    pub const fn begin(&self) -> Address {
        self.base
    }

    pub const fn end(&self) -> Address {
        self.base.offset(self.len)
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Whether `other` lies wholly within this span
    pub fn encloses(&self, other: &Span) -> bool {
        other.base >= self.base && other.end() <= self.end()
    }

    /// Offset of `addr` from the start of the span
    #[inline]
    pub fn offset_of(&self, addr: Address) -> usize {
        debug_assert!(
            addr >= self.base && addr <= self.end(),
            "{:?} outside {:?}",
            addr,
            self
        );
        addr.diff(self.base)
    }

    /// Address at `offset` within the span
    #[inline]
    pub fn at(&self, offset: usize) -> Address {
        debug_assert!(offset <= self.len, "offset {:#x} outside {:?}", offset, self);
        self.base.offset(offset)
    }

    /// Sub-span `[offset, offset + len)`
    pub fn slice(&self, offset: usize, len: usize) -> Span {
        debug_assert!(offset + len <= self.len, "slice outside {:?}", self);
        Span::new(self.base.offset(offset), len)
    }

    /// Whether `other` begins exactly where this span ends
    pub fn adjoins(&self, other: &Span) -> bool {
        self.end() == other.base
    }
}

impl Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?})", self.base, self.end())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    pub fn test_alignment_helpers() {
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_down(0x1_ffff, 0x1_0000), 0x1_0000);
        assert!(is_aligned(0x4000, 0x4000));
        assert!(!Address::new(0x4004).is_aligned_to(8));
    }

    #[test]
    pub fn test_span_arithmetic() {
        let span = Span::new(Address::new(0x10_000), 0x1000);
        assert_eq!(span.end(), Address::new(0x11_000));
        assert!(span.contains(Address::new(0x10_ff8)));
        assert!(!span.contains(span.end()));
        assert_eq!(span.offset_of(Address::new(0x10_100)), 0x100);
        assert_eq!(span.at(0x100), Address::new(0x10_100));

        let tail = Span::new(span.end(), 0x1000);
        assert!(span.adjoins(&tail));
        assert!(span.encloses(&span.slice(0x10, 0x20)));
        assert!(!span.encloses(&tail));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic]
    pub fn test_span_bounds_checked() {
        let span = Span::new(Address::new(0x10_000), 0x1000);
        span.at(0x1001);
    }
}
