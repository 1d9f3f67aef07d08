//! Object layout as far as the heap needs to know it
//!
//! The heap does not understand runtime objects. It relies on an
//! [`ObjectModel`] to size them and to stamp class descriptors into
//! fresh memory. The only layout rule is that the first word of every
//! object is its class descriptor.
//!
//! Descriptors with the low bit set are reserved for heap-internal
//! objects: free blocks, one-word fillers and raw (size-only) buffers,
//! which keep memory parseable between live objects, and forwarding
//! words left behind by evacuation.

use std::fmt::{self, Debug};

use super::address::{Address, OBJECT_ALIGNMENT, WORD_SIZE};

/// Smallest object the heap allocates
pub const MIN_OBJECT_SIZE: usize = 2 * WORD_SIZE;

const INTERNAL_TAG: usize = 0b1;
const FREE_TAG: usize = 0b001;
const FILLER_TAG: usize = 0b011;
const RAW_TAG: usize = 0b101;
const FORWARD_TAG: usize = 0b111;
const TAG_MASK: usize = 0b111;

/// A word holding an object reference (or any other value)
pub type Slot = Address;

/// The class descriptor word of an object
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ClassRef(usize);

impl ClassRef {
    /// Descriptor of a free block; its size is in the second word
    pub const FREE: ClassRef = ClassRef(FREE_TAG);
    /// Descriptor of a one-word filler
    pub const FILLER: ClassRef = ClassRef(FILLER_TAG);
    /// Descriptor of a raw buffer; its size is in the second word
    pub const RAW: ClassRef = ClassRef(RAW_TAG);

    /// A runtime class descriptor: a word-aligned address of class
    /// metadata owned by the object model
    pub fn new(descriptor: usize) -> Self {
        debug_assert!(descriptor & INTERNAL_TAG == 0, "class descriptors must be aligned");
        ClassRef(descriptor)
    }

    pub fn from_address(addr: Address) -> Self {
        ClassRef::new(addr.as_usize())
    }

    pub const fn word(self) -> usize {
        self.0
    }

    /// Heap-internal (free, filler or raw) descriptor
    pub const fn is_internal(self) -> bool {
        self.0 & INTERNAL_TAG != 0
    }

    pub const fn is_free(self) -> bool {
        self.0 == FREE_TAG || self.0 == FILLER_TAG
    }

    /// Class descriptor of the object at `addr`
    ///
    /// # Safety
    ///
    /// `addr` must be the start of an object in mapped heap memory.
    pub unsafe fn of(addr: Address) -> Self {
        ClassRef(addr.load_word())
    }
}

impl Debug for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            FREE_TAG => write!(f, "ClassRef(free)"),
            FILLER_TAG => write!(f, "ClassRef(filler)"),
            RAW_TAG => write!(f, "ClassRef(raw)"),
            word if word & TAG_MASK == FORWARD_TAG => {
                write!(f, "ClassRef(-> {:#x})", word & !TAG_MASK)
            }
            word => write!(f, "ClassRef({:#x})", word),
        }
    }
}

/// The object model capabilities the heap consumes
pub trait ObjectModel: Send + Sync {
    /// Byte size of the object at `object` whose class is `class`.
    ///
    /// `object` is null when asking for the instance size of a class
    /// ahead of allocation.
    fn size_of(&self, class: ClassRef, object: Address) -> usize;

    /// Instance size of a fixed-size class
    fn instance_size(&self, class: ClassRef) -> usize {
        self.size_of(class, Address::NULL)
    }

    /// Stamp `class` into freshly allocated, zeroed memory
    fn install_class(&self, object: Address, class: ClassRef) {
        unsafe { object.store_word(class.word()) }
    }

    /// Visit every slot of `object` that may hold a reference
    fn visit_references(&self, _class: ClassRef, _object: Address, _visitor: &mut dyn FnMut(Slot)) {}
}

/// Object model whose descriptors carry the instance size directly
///
/// Useful for embedders whose objects are fixed-size cells and for
/// exercising the heap without a full runtime. Objects of a class
/// made by [`EncodedSizeModel::class_with_references`] treat every
/// word after the descriptor as a reference slot.
#[derive(Debug, Default, Clone, Copy)]
pub struct EncodedSizeModel;

impl EncodedSizeModel {
    const SHIFT: u32 = 4;
    const REFERENCES: usize = 0b10;

    /// Descriptor of a class whose instances are `size` bytes of data
    pub fn class(size: usize) -> ClassRef {
        ClassRef::new(size << Self::SHIFT)
    }

    /// Descriptor of a class whose instances are `size` bytes of
    /// references
    pub fn class_with_references(size: usize) -> ClassRef {
        ClassRef::new(size << Self::SHIFT | Self::REFERENCES)
    }
}

impl ObjectModel for EncodedSizeModel {
    fn size_of(&self, class: ClassRef, _object: Address) -> usize {
        class.word() >> Self::SHIFT
    }

    fn visit_references(&self, class: ClassRef, object: Address, visitor: &mut dyn FnMut(Slot)) {
        if class.word() & Self::REFERENCES == 0 {
            return;
        }
        let size = self.size_of(class, object);
        let mut offset = WORD_SIZE;
        while offset + WORD_SIZE <= size {
            visitor(object.offset(offset));
            offset += WORD_SIZE;
        }
    }
}

/// Round a request up to a legal object size
#[inline]
pub fn alloc_size_of(size: usize) -> usize {
    super::address::align_up(size.max(MIN_OBJECT_SIZE), OBJECT_ALIGNMENT)
}

/// Size of the object at `addr`, whether runtime or heap-internal
///
/// # Safety
///
/// `addr` must be the start of an object in mapped heap memory.
pub unsafe fn object_size(model: &dyn ObjectModel, addr: Address) -> usize {
    let class = ClassRef::of(addr);
    match class.word() {
        FILLER_TAG => WORD_SIZE,
        FREE_TAG | RAW_TAG => addr.offset(WORD_SIZE).load_word(),
        _ => alloc_size_of(model.size_of(class, addr)),
    }
}

/// Format `len` bytes at `addr` as a free block (or a filler when too
/// small to hold a size)
///
/// # Safety
///
/// The range must be dead memory owned by the caller.
pub unsafe fn write_free(addr: Address, len: usize) {
    debug_assert!(len >= WORD_SIZE && len % WORD_SIZE == 0);
    if len < MIN_OBJECT_SIZE {
        addr.store_word(FILLER_TAG);
    } else {
        addr.store_word(FREE_TAG);
        addr.offset(WORD_SIZE).store_word(len);
    }
}

/// Leave a forwarding word at `from` pointing to its copy at `to`
///
/// # Safety
///
/// `from` must be an evacuated object whose memory is no longer read
/// as an object.
pub unsafe fn forward(from: Address, to: Address) {
    debug_assert!(to.is_aligned_to(OBJECT_ALIGNMENT));
    from.store_word(to.as_usize() | FORWARD_TAG);
}

/// Where the object at `addr` was evacuated to, if it was
///
/// # Safety
///
/// `addr` must be the start of an object in mapped heap memory.
pub unsafe fn forwarding_address(addr: Address) -> Option<Address> {
    let word = addr.load_word();
    if word & TAG_MASK == FORWARD_TAG {
        Some(Address::new(word & !TAG_MASK))
    } else {
        None
    }
}

/// Stamp a raw buffer header into zeroed memory
///
/// # Safety
///
/// The range must be freshly allocated memory of at least `len` bytes.
pub unsafe fn write_raw(addr: Address, len: usize) {
    debug_assert!(len >= MIN_OBJECT_SIZE);
    addr.store_word(RAW_TAG);
    addr.offset(WORD_SIZE).store_word(len);
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    pub fn test_alloc_size_rounds() {
        assert_eq!(alloc_size_of(1), MIN_OBJECT_SIZE);
        assert_eq!(alloc_size_of(17), 24);
        assert_eq!(alloc_size_of(64), 64);
    }

    #[test]
    pub fn test_internal_descriptors() {
        assert!(ClassRef::FREE.is_internal());
        assert!(ClassRef::FILLER.is_free());
        assert!(!ClassRef::RAW.is_free());
        assert!(!EncodedSizeModel::class(32).is_internal());
    }

    #[test]
    pub fn test_sizes_from_memory() {
        let mut buf = [0usize; 16];
        let base = Address::from_ptr(buf.as_mut_ptr());
        let model = EncodedSizeModel;
        unsafe {
            write_free(base, 48);
            assert_eq!(object_size(&model, base), 48);
            write_free(base, 8);
            assert_eq!(object_size(&model, base), 8);
            write_raw(base, 40);
            assert_eq!(object_size(&model, base), 40);
            model.install_class(base, EncodedSizeModel::class(24));
            assert_eq!(object_size(&model, base), 24);
        }
    }

    #[test]
    pub fn test_forwarding_word() {
        let mut buf = [0usize; 4];
        let base = Address::from_ptr(buf.as_mut_ptr());
        let target = Address::new(0x7f00_0040);
        unsafe {
            EncodedSizeModel.install_class(base, EncodedSizeModel::class(32));
            assert_eq!(forwarding_address(base), None);
            forward(base, target);
            assert_eq!(forwarding_address(base), Some(target));
            assert!(ClassRef::of(base).is_internal());
        }
    }

    #[test]
    pub fn test_reference_slots() {
        let mut slots = Vec::new();
        let base = Address::new(0x1000);
        EncodedSizeModel.visit_references(EncodedSizeModel::class(32), base, &mut |s| slots.push(s));
        assert!(slots.is_empty());
        EncodedSizeModel.visit_references(
            EncodedSizeModel::class_with_references(32),
            base,
            &mut |s| slots.push(s),
        );
        assert_eq!(slots, vec![base.offset(8), base.offset(16), base.offset(24)]);
    }
}
