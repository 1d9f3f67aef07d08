//! Size-bucketed free list allocation
//!
//! Free blocks are held in free object sets: one set per exact size
//! below [`SMALL_SET_LIMIT`], then one per power of two. Each set is
//! ordered by address so allocation is first fit. A block taken from
//! a set becomes the bump area and later requests are carved from it
//! until it runs out, when the remainder goes back to the list.
//!
//! Coalescing is implicit: sweeping reconstructs each gap between
//! live objects as a single block, so `free` never looks at
//! neighbours.

use std::collections::BTreeMap;

use super::address::{Address, Span, WORD_SIZE};
use super::bump::BumpAllocator;
use super::object::{write_free, MIN_OBJECT_SIZE};

/// Sizes below this get an exact set
pub const SMALL_SET_LIMIT: usize = 256;

const SMALL_SETS: usize = SMALL_SET_LIMIT / WORD_SIZE;
const SMALL_SET_LIMIT_BITS: usize = SMALL_SET_LIMIT.trailing_zeros() as usize;
const NUMBER_OF_SETS: usize = SMALL_SETS + usize::BITS as usize - SMALL_SET_LIMIT_BITS;

/// Index of the set holding blocks of `size` bytes
#[inline]
pub fn set_index(size: usize) -> usize {
    if size < SMALL_SET_LIMIT {
        size / WORD_SIZE
    } else {
        let log2 = (usize::BITS - 1 - size.leading_zeros()) as usize;
        SMALL_SETS + log2 - SMALL_SET_LIMIT_BITS
    }
}

/// Free blocks of one size class, ordered by address
#[derive(Debug, Default)]
pub struct FreeObjectSet {
    blocks: BTreeMap<Address, usize>,
    available: usize,
}

impl FreeObjectSet {
    fn insert(&mut self, addr: Address, len: usize) {
        self.blocks.insert(addr, len);
        self.available += len;
    }

    /// First block (by address) of at least `size` bytes
    fn take_first_fit(&mut self, size: usize) -> Option<Span> {
        let (&addr, &len) = self.blocks.iter().find(|(_, &len)| len >= size)?;
        self.blocks.remove(&addr);
        self.available -= len;
        Some(Span::new(addr, len))
    }

    fn first_fit(&self, size: usize) -> Option<Address> {
        self.blocks
            .iter()
            .find(|(_, &len)| len >= size)
            .map(|(&addr, _)| addr)
    }

    /// Remove and return all blocks within `span`
    fn detach(&mut self, span: Span) -> Vec<Span> {
        let inside: Vec<(Address, usize)> = self
            .blocks
            .range(span.begin()..span.end())
            .map(|(&a, &l)| (a, l))
            .collect();
        for (addr, len) in &inside {
            self.blocks.remove(addr);
            self.available -= len;
        }
        inside.into_iter().map(|(a, l)| Span::new(a, l)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn available(&self) -> usize {
        self.available
    }
}

/// Free list allocator over the regions of one sparse space
#[derive(Debug)]
pub struct FreeListAllocator {
    sets: Vec<FreeObjectSet>,
    bump: BumpAllocator,
    /// Bytes in free sets (excluding the bump area)
    available: usize,
    /// Bytes in fragments too small to reuse
    wasted: usize,
}

impl Default for FreeListAllocator {
    fn default() -> Self {
        FreeListAllocator {
            sets: (0..NUMBER_OF_SETS).map(|_| FreeObjectSet::default()).collect(),
            bump: BumpAllocator::default(),
            available: 0,
            wasted: 0,
        }
    }
}

impl FreeListAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an aligned `size`, from the bump area if possible,
    /// otherwise from the first fitting free block
    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        if let Some(addr) = self.bump.allocate(size) {
            return Some(addr);
        }

        let block = self.take_block(size)?;
        self.free_bump_remainder();
        self.bump.reset(block);
        self.bump.allocate(size)
    }

    fn take_block(&mut self, size: usize) -> Option<Span> {
        let start = set_index(size);
        for index in start..NUMBER_OF_SETS {
            if let Some(block) = self.sets[index].take_first_fit(size) {
                self.available -= block.len();
                return Some(block);
            }
        }
        None
    }

    /// Whether some free block could serve `size`, and where
    pub fn match_free_object_set(&self, size: usize) -> Option<Address> {
        (set_index(size)..NUMBER_OF_SETS).find_map(|i| self.sets[i].first_fit(size))
    }

    /// Return `len` bytes at `addr` to the free list. The block is
    /// formatted as a free object so memory stays parseable.
    pub fn free(&mut self, addr: Address, len: usize) {
        if len == 0 {
            return;
        }
        unsafe { write_free(addr, len) };
        if len < MIN_OBJECT_SIZE {
            self.wasted += len;
            return;
        }
        self.sets[set_index(len)].insert(addr, len);
        self.available += len;
    }

    /// Install a whole fresh span as the bump area
    pub fn add_span(&mut self, span: Span) {
        self.free_bump_remainder();
        self.bump.reset(span);
    }

    /// Put the unused part of the bump area back on the free list
    pub fn free_bump_remainder(&mut self) {
        let rest = self.bump.take_remainder();
        self.free(rest.begin(), rest.len());
        self.bump.clear();
    }

    /// Discard every free block: a sweep is about to recompute them
    pub fn rebuild_free_list(&mut self) {
        for set in self.sets.iter_mut() {
            *set = FreeObjectSet::default();
        }
        self.bump.clear();
        self.available = 0;
        self.wasted = 0;
    }

    /// Remove every free block inside `span`, returning them
    pub fn detach_span(&mut self, span: Span) -> Vec<Span> {
        if !self.bump.remainder().is_empty() && span.contains(self.bump.top()) {
            self.free_bump_remainder();
        }
        let mut detached = Vec::new();
        for set in self.sets.iter_mut() {
            detached.extend(set.detach(span));
        }
        let bytes: usize = detached.iter().map(|s| s.len()).sum();
        self.available -= bytes;
        detached
    }

    /// Free bytes (blocks and bump area) lying inside `span`
    pub fn free_bytes_in(&self, span: Span) -> usize {
        let bump = self.bump.remainder();
        let bump = if !bump.is_empty() && span.contains(bump.begin()) {
            bump.len()
        } else {
            0
        };
        let blocks: usize = self
            .sets
            .iter()
            .flat_map(|set| set.blocks.range(span.begin()..span.end()))
            .map(|(_, &len)| len)
            .sum();
        bump + blocks
    }

    /// Re-attach blocks previously detached
    pub fn attach(&mut self, blocks: &[Span]) {
        for block in blocks {
            self.sets[set_index(block.len())].insert(block.begin(), block.len());
            self.available += block.len();
        }
    }

    /// Take over every free block of `other`
    pub fn absorb(&mut self, other: &mut FreeListAllocator) {
        other.free_bump_remainder();
        for (index, set) in other.sets.iter_mut().enumerate() {
            let set = std::mem::take(set);
            for (addr, len) in set.blocks {
                self.sets[index].insert(addr, len);
            }
        }
        self.available += other.available;
        self.wasted += other.wasted;
        other.available = 0;
        other.wasted = 0;
    }

    /// Bytes immediately allocatable
    pub fn available(&self) -> usize {
        self.available + self.bump.available()
    }

    pub fn wasted(&self) -> usize {
        self.wasted
    }

    pub fn add_wasted(&mut self, bytes: usize) {
        self.wasted += bytes;
    }

    pub fn bump_area(&self) -> Span {
        self.bump.remainder()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    struct Arena(Vec<usize>);

    impl Arena {
        fn new(bytes: usize) -> Self {
            Arena(vec![0usize; bytes / WORD_SIZE])
        }

        fn span(&mut self) -> Span {
            Span::new(Address::from_ptr(self.0.as_mut_ptr()), self.0.len() * WORD_SIZE)
        }
    }

    #[test]
    pub fn test_set_index() {
        assert_eq!(set_index(16), 2);
        assert_eq!(set_index(248), 31);
        assert_eq!(set_index(256), SMALL_SETS);
        assert_eq!(set_index(511), SMALL_SETS);
        assert_eq!(set_index(512), SMALL_SETS + 1);
    }

    #[test]
    pub fn test_bump_then_free_list() {
        let mut arena = Arena::new(0x1000);
        let span = arena.span();
        let mut fl = FreeListAllocator::new();
        fl.add_span(span);

        let a = fl.allocate(0x800).unwrap();
        let b = fl.allocate(0x800).unwrap();
        assert_eq!(a, span.begin());
        assert_eq!(b, span.at(0x800));
        assert!(fl.allocate(16).is_none());

        fl.free(a, 0x800);
        assert_eq!(fl.available(), 0x800);
        let c = fl.allocate(0x100).unwrap();
        assert_eq!(c, a);
        assert_eq!(fl.available(), 0x700);
    }

    #[test]
    pub fn test_first_fit_reuses_freed_block() {
        let mut arena = Arena::new(0x1000);
        let span = arena.span();
        let mut fl = FreeListAllocator::new();
        fl.free(span.at(0x400), 0x40);
        fl.free(span.at(0x100), 0x40);
        fl.free(span.at(0x800), 0x200);

        assert_eq!(fl.allocate(0x40), Some(span.at(0x100)));
        fl.free_bump_remainder();
        assert_eq!(fl.allocate(0x40), Some(span.at(0x400)));
        fl.free_bump_remainder();
        assert_eq!(fl.allocate(0x40), Some(span.at(0x800)));
    }

    #[test]
    pub fn test_small_fragments_are_wasted() {
        let mut arena = Arena::new(0x100);
        let span = arena.span();
        let mut fl = FreeListAllocator::new();
        fl.free(span.begin(), 8);
        assert_eq!(fl.available(), 0);
        assert_eq!(fl.wasted(), 8);
    }

    #[test]
    pub fn test_rebuild_discards_blocks() {
        let mut arena = Arena::new(0x1000);
        let span = arena.span();
        let mut fl = FreeListAllocator::new();
        fl.free(span.begin(), 0x400);
        fl.rebuild_free_list();
        assert_eq!(fl.available(), 0);
        assert!(fl.allocate(16).is_none());
    }

    #[test]
    pub fn test_match_and_detach() {
        let mut arena = Arena::new(0x2000);
        let span = arena.span();
        let mut fl = FreeListAllocator::new();
        fl.free(span.at(0x100), 0x100);
        fl.free(span.at(0x1100), 0x400);

        assert_eq!(fl.match_free_object_set(0x200), Some(span.at(0x1100)));
        assert_eq!(fl.match_free_object_set(0x800), None);

        let detached = fl.detach_span(span.slice(0x1000, 0x1000));
        assert_eq!(detached, vec![Span::new(span.at(0x1100), 0x400)]);
        assert_eq!(fl.available(), 0x100);
        assert_eq!(fl.match_free_object_set(0x200), None);

        fl.attach(&detached);
        assert_eq!(fl.available(), 0x500);
    }

    #[test]
    pub fn test_free_bytes_within_span() {
        let mut arena = Arena::new(0x1000);
        let span = arena.span();
        let mut alloc = FreeListAllocator::new();
        alloc.add_span(span);
        assert_eq!(alloc.free_bytes_in(span), 0x1000);

        let a = alloc.allocate(0x100).unwrap();
        assert_eq!(alloc.free_bytes_in(span), 0xf00);
        alloc.free_bump_remainder();
        alloc.free(a, 0x100);
        assert_eq!(alloc.free_bytes_in(span), 0x1000);
        assert_eq!(alloc.free_bytes_in(span.slice(0, 0x100)), 0x100);
    }

    #[test]
    pub fn test_absorb_moves_everything() {
        let mut arena = Arena::new(0x2000);
        let span = arena.span();
        let mut a = FreeListAllocator::new();
        let mut b = FreeListAllocator::new();
        b.add_span(span.slice(0x1000, 0x1000));
        b.allocate(0x100).unwrap();
        b.free(span.at(0x100), 0x80);

        a.absorb(&mut b);
        assert_eq!(b.available(), 0);
        assert_eq!(a.available(), 0x80 + 0xf00);
    }
}
