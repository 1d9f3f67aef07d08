//! Regions: the unit of heap memory, space membership and collection
//!
//! A region owns a span of mapped memory plus out-of-line metadata:
//! a mark bitmap, lazily created remembered sets, the space it
//! belongs to and a byte of per-cycle GC flags. Everything that
//! sweepers and mutators read concurrently is atomic.

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::OnceLock;

use bitflags::bitflags;
use bitmaps::Bitmap;

use super::address::{Address, Span, WORD_SIZE};

/// Regions with more than this fraction live are not worth evacuating
pub const MOST_OBJECT_ALIVE_THRESHOLD: f64 = 0.8;

/// Regions below this fraction live are evacuated when compacting in
/// the background
pub const COMPRESS_THRESHOLD: f64 = 0.9;

/// Bytes covered by one mark bit
pub const MARK_GRANULE: usize = WORD_SIZE;

/// Bits per bitmap word
const BITS_PER_WORD: usize = usize::BITS as usize;

bitflags! {
    /// Which space a region currently belongs to
    pub struct SpaceFlags: u32 {
        const EDEN = 1 << 0;
        const SEMI = 1 << 1;
        const SNAPSHOT = 1 << 2;
        const READ_ONLY = 1 << 3;
        const OLD = 1 << 4;
        const NON_MOVABLE = 1 << 5;
        const MACHINE_CODE = 1 << 6;
        const LOCAL = 1 << 7;
        const APP_SPAWN = 1 << 8;
        const HUGE = 1 << 9;
        const HUGE_MACHINE_CODE = 1 << 10;
        const SHARED_OLD = 1 << 11;
        const SHARED_NON_MOVABLE = 1 << 12;
        const SHARED_READ_ONLY = 1 << 13;
        const SHARED_HUGE = 1 << 14;
        const SHARED_LOCAL = 1 << 15;
        const SHARED_APP_SPAWN = 1 << 16;

        const YOUNG = Self::EDEN.bits | Self::SEMI.bits;
        const OLD_GENERATION = Self::OLD.bits
            | Self::NON_MOVABLE.bits
            | Self::MACHINE_CODE.bits
            | Self::LOCAL.bits
            | Self::APP_SPAWN.bits
            | Self::HUGE.bits
            | Self::HUGE_MACHINE_CODE.bits
            | Self::SNAPSHOT.bits
            | Self::READ_ONLY.bits;
        const SHARED = Self::SHARED_OLD.bits
            | Self::SHARED_NON_MOVABLE.bits
            | Self::SHARED_READ_ONLY.bits
            | Self::SHARED_HUGE.bits
            | Self::SHARED_LOCAL.bits
            | Self::SHARED_APP_SPAWN.bits;
        /// Regions holding a single object
        const HUGE_OBJECTS = Self::HUGE.bits
            | Self::HUGE_MACHINE_CODE.bits
            | Self::SHARED_HUGE.bits;
        /// Regions that are never swept or evacuated
        const IMMORTAL = Self::SNAPSHOT.bits
            | Self::READ_ONLY.bits
            | Self::APP_SPAWN.bits
            | Self::SHARED_READ_ONLY.bits
            | Self::SHARED_APP_SPAWN.bits;
    }
}

const IN_COLLECT_SET: usize = 0;
const SWEPT: usize = 1;
const HAS_AGE_MARK: usize = 2;
const BELOW_AGE_MARK: usize = 3;
const IN_SWEEP_QUEUE: usize = 4;
const READ_ONLY_PROTECTED: usize = 5;

/// Transient per-cycle flags of a region, one byte wide
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct RegionFlags(Bitmap<8>);

impl RegionFlags {
    pub fn from_bits(bits: u8) -> Self {
        RegionFlags(Bitmap::from_value(bits))
    }

    pub fn bits(&self) -> u8 {
        self.0.into_value()
    }

    /// Region chosen for evacuation this cycle
    pub fn in_collect_set(&self) -> bool {
        self.0.get(IN_COLLECT_SET)
    }

    pub fn set_in_collect_set(&mut self, value: bool) {
        self.0.set(IN_COLLECT_SET, value);
    }

    /// Region's free blocks rebuilt this cycle
    pub fn swept(&self) -> bool {
        self.0.get(SWEPT)
    }

    pub fn set_swept(&mut self, value: bool) {
        self.0.set(SWEPT, value);
    }

    /// Region holds the age mark: objects below it have survived a
    /// young collection
    pub fn has_age_mark(&self) -> bool {
        self.0.get(HAS_AGE_MARK)
    }

    pub fn set_has_age_mark(&mut self, value: bool) {
        self.0.set(HAS_AGE_MARK, value);
    }

    /// Region lies wholly below the age mark
    pub fn below_age_mark(&self) -> bool {
        self.0.get(BELOW_AGE_MARK)
    }

    pub fn set_below_age_mark(&mut self, value: bool) {
        self.0.set(BELOW_AGE_MARK, value);
    }

    pub fn in_sweep_queue(&self) -> bool {
        self.0.get(IN_SWEEP_QUEUE)
    }

    pub fn set_in_sweep_queue(&mut self, value: bool) {
        self.0.set(IN_SWEEP_QUEUE, value);
    }

    pub fn read_only_protected(&self) -> bool {
        self.0.get(READ_ONLY_PROTECTED)
    }

    pub fn set_read_only_protected(&mut self, value: bool) {
        self.0.set(READ_ONLY_PROTECTED, value);
    }
}

impl Debug for RegionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegionFlags({:#010b})", self.bits())
    }
}

/// Bitmap with one bit per granule of a span, safe for concurrent
/// set / test / clear
pub struct AtomicBitmap {
    base: Address,
    words: Box<[AtomicUsize]>,
}

impl AtomicBitmap {
    /// Bitmap covering `len` bytes from `base`
    pub fn new(base: Address, len: usize) -> Self {
        let bits = (len + MARK_GRANULE - 1) / MARK_GRANULE;
        let words = (bits + BITS_PER_WORD - 1) / BITS_PER_WORD;
        AtomicBitmap {
            base,
            words: (0..words.max(1)).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    #[inline]
    fn index(&self, addr: Address) -> (usize, usize) {
        let bit = addr.diff(self.base) / MARK_GRANULE;
        debug_assert!(
            bit / BITS_PER_WORD < self.words.len(),
            "{:?} outside bitmap at {:?}",
            addr,
            self.base
        );
        (bit / BITS_PER_WORD, bit % BITS_PER_WORD)
    }

    /// Set the bit for `addr`, returning true if it was previously
    /// clear
    #[inline]
    pub fn set(&self, addr: Address) -> bool {
        let (word, bit) = self.index(addr);
        let mask = 1usize << bit;
        self.words[word].fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    #[inline]
    pub fn test(&self, addr: Address) -> bool {
        let (word, bit) = self.index(addr);
        self.words[word].load(Ordering::Acquire) & (1usize << bit) != 0
    }

    pub fn clear(&self, addr: Address) {
        let (word, bit) = self.index(addr);
        self.words[word].fetch_and(!(1usize << bit), Ordering::AcqRel);
    }

    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Release);
        }
    }

    /// Clear every bit for addresses in `span`
    pub fn clear_range(&self, span: Span) {
        let mut addr = span.begin();
        while addr < span.end() {
            self.clear(addr);
            addr = addr.offset(MARK_GRANULE);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Acquire) == 0)
    }

    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    /// Addresses whose bits are set, in ascending order
    pub fn iter(&self) -> impl Iterator<Item = Address> + '_ {
        let base = self.base;
        self.words.iter().enumerate().flat_map(move |(i, w)| {
            let mut bits = w.load(Ordering::Acquire);
            std::iter::from_fn(move || {
                if bits == 0 {
                    None
                } else {
                    let bit = bits.trailing_zeros() as usize;
                    bits &= bits - 1;
                    Some(base.offset((i * BITS_PER_WORD + bit) * MARK_GRANULE))
                }
            })
        })
    }
}

/// Kinds of remembered set a region carries
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RememberedSetKind {
    /// Slots in this (old) region referring to young objects
    OldToNew,
    /// Slots in this (local) region referring to shared objects
    LocalToShare,
}

/// A region of heap memory and its collection metadata
pub struct Region {
    span: Span,
    space: AtomicU32,
    gc_flags: AtomicU8,
    /// Bytes of marked objects this cycle
    alive: AtomicUsize,
    /// End of allocated bytes when bump allocated
    top: AtomicUsize,
    /// Boundary between survivors and new allocation
    age_mark: AtomicUsize,
    /// Free fragments too small to reuse
    wasted: AtomicUsize,
    mark_bitmap: AtomicBitmap,
    old_to_new: OnceLock<AtomicBitmap>,
    local_to_share: OnceLock<AtomicBitmap>,
}

impl Region {
    pub fn new(span: Span, space: SpaceFlags) -> Self {
        Region {
            span,
            space: AtomicU32::new(space.bits()),
            gc_flags: AtomicU8::new(0),
            alive: AtomicUsize::new(0),
            top: AtomicUsize::new(span.begin().as_usize()),
            age_mark: AtomicUsize::new(0),
            wasted: AtomicUsize::new(0),
            mark_bitmap: AtomicBitmap::new(span.begin(), span.len()),
            old_to_new: OnceLock::new(),
            local_to_share: OnceLock::new(),
        }
    }

    /// A region holding a single huge object at its start; only the
    /// first granule is markable
    pub fn new_huge(span: Span, space: SpaceFlags) -> Self {
        let mut region = Region::new(Span::new(span.begin(), 0), space);
        region.span = span;
        region
    }

    pub fn span(&self) -> Span {
        self.span
    }

    pub fn begin(&self) -> Address {
        self.span.begin()
    }

    pub fn end(&self) -> Address {
        self.span.end()
    }

    pub fn capacity(&self) -> usize {
        self.span.len()
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.span.contains(addr)
    }

    pub fn space(&self) -> SpaceFlags {
        SpaceFlags::from_bits_truncate(self.space.load(Ordering::Acquire))
    }

    pub fn set_space(&self, space: SpaceFlags) {
        self.space.store(space.bits(), Ordering::Release);
    }

    pub fn in_young(&self) -> bool {
        SpaceFlags::YOUNG.intersects(self.space())
    }

    pub fn in_shared(&self) -> bool {
        SpaceFlags::SHARED.intersects(self.space())
    }

    pub fn in_old_generation(&self) -> bool {
        SpaceFlags::OLD_GENERATION.intersects(self.space())
    }

    pub fn flags(&self) -> RegionFlags {
        RegionFlags::from_bits(self.gc_flags.load(Ordering::Acquire))
    }

    /// Atomically update the GC flags, returning the previous value
    pub fn update_flags<F: Fn(&mut RegionFlags)>(&self, f: F) -> RegionFlags {
        let previous = self
            .gc_flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let mut flags = RegionFlags::from_bits(bits);
                f(&mut flags);
                Some(flags.bits())
            });
        // the closure never declines an update
        RegionFlags::from_bits(previous.unwrap_or_else(|bits| bits))
    }

    pub fn reset_flags(&self) {
        self.gc_flags.store(0, Ordering::Release);
    }

    pub fn in_collect_set(&self) -> bool {
        self.flags().in_collect_set()
    }

    pub fn set_in_collect_set(&self, value: bool) {
        self.update_flags(|f| f.set_in_collect_set(value));
    }

    pub fn is_swept(&self) -> bool {
        self.flags().swept()
    }

    /// Flag the region swept; false if it already was
    pub fn mark_swept(&self) -> bool {
        !self.update_flags(|f| f.set_swept(true)).swept()
    }

    pub fn alive(&self) -> usize {
        self.alive.load(Ordering::Acquire)
    }

    pub fn increase_alive(&self, bytes: usize) {
        let before = self.alive.fetch_add(bytes, Ordering::AcqRel);
        debug_assert!(before + bytes <= self.capacity(), "alive exceeds capacity");
    }

    pub fn set_alive(&self, bytes: usize) {
        debug_assert!(bytes <= self.capacity());
        self.alive.store(bytes, Ordering::Release);
    }

    pub fn reset_alive(&self) {
        self.alive.store(0, Ordering::Release);
    }

    /// Most of the region is live: evacuating it would free little
    pub fn most_object_alive(&self) -> bool {
        self.alive() as f64 > self.capacity() as f64 * MOST_OBJECT_ALIVE_THRESHOLD
    }

    pub fn below_compress_threshold_alive(&self) -> bool {
        (self.alive() as f64) < self.capacity() as f64 * COMPRESS_THRESHOLD
    }

    pub fn top(&self) -> Address {
        Address::new(self.top.load(Ordering::Acquire))
    }

    pub fn set_top(&self, top: Address) {
        debug_assert!(top >= self.begin() && top <= self.end());
        self.top.store(top.as_usize(), Ordering::Release);
    }

    /// Bytes between region start and top
    pub fn allocated(&self) -> usize {
        self.top().diff(self.begin())
    }

    pub fn age_mark(&self) -> Address {
        Address::new(self.age_mark.load(Ordering::Acquire))
    }

    /// Place the age mark in this region
    pub fn set_age_mark(&self, mark: Address) {
        self.age_mark.store(mark.as_usize(), Ordering::Release);
        self.update_flags(|f| {
            f.set_has_age_mark(true);
            f.set_below_age_mark(false);
        });
    }

    /// Flag the whole region as below the age mark
    pub fn set_below_age_mark(&self) {
        self.age_mark.store(0, Ordering::Release);
        self.update_flags(|f| {
            f.set_has_age_mark(false);
            f.set_below_age_mark(true);
        });
    }

    pub fn clear_age_mark(&self) {
        self.age_mark.store(0, Ordering::Release);
        self.update_flags(|f| {
            f.set_has_age_mark(false);
            f.set_below_age_mark(false);
        });
    }

    /// Whether the object at `addr` has survived a young collection
    pub fn is_aged(&self, addr: Address) -> bool {
        let flags = self.flags();
        flags.below_age_mark() || (flags.has_age_mark() && addr < self.age_mark())
    }

    pub fn wasted(&self) -> usize {
        self.wasted.load(Ordering::Acquire)
    }

    pub fn add_wasted(&self, bytes: usize) {
        self.wasted.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn reset_wasted(&self) {
        self.wasted.store(0, Ordering::Release);
    }

    pub fn mark_bitmap(&self) -> &AtomicBitmap {
        &self.mark_bitmap
    }

    /// Mark the object at `addr`; true if newly marked
    #[inline]
    pub fn mark(&self, addr: Address) -> bool {
        self.mark_bitmap.set(addr)
    }

    #[inline]
    pub fn is_marked(&self, addr: Address) -> bool {
        self.mark_bitmap.test(addr)
    }

    /// Start a fresh marking cycle on this region
    pub fn clear_marks(&self) {
        self.mark_bitmap.clear_all();
        self.reset_alive();
    }

    pub fn has_marks(&self) -> bool {
        !self.mark_bitmap.is_empty()
    }

    /// Marked object addresses in ascending order
    pub fn marked_objects(&self) -> impl Iterator<Item = Address> + '_ {
        self.mark_bitmap.iter()
    }

    fn remembered_cell(&self, kind: RememberedSetKind) -> &OnceLock<AtomicBitmap> {
        match kind {
            RememberedSetKind::OldToNew => &self.old_to_new,
            RememberedSetKind::LocalToShare => &self.local_to_share,
        }
    }

    /// Record `slot` (an address inside this region) in a remembered
    /// set, creating the set on first use
    pub fn remember(&self, kind: RememberedSetKind, slot: Address) {
        debug_assert!(self.contains(slot));
        self.remembered_cell(kind)
            .get_or_init(|| AtomicBitmap::new(self.begin(), self.capacity()))
            .set(slot);
    }

    pub fn remembered_set(&self, kind: RememberedSetKind) -> Option<&AtomicBitmap> {
        self.remembered_cell(kind).get()
    }

    pub fn clear_remembered_set(&self, kind: RememberedSetKind) {
        if let Some(set) = self.remembered_cell(kind).get() {
            set.clear_all();
        }
    }

    /// Forget recorded slots that lie in `span` (freed memory)
    pub fn forget_slots_in(&self, span: Span) {
        for kind in [RememberedSetKind::OldToNew, RememberedSetKind::LocalToShare] {
            if let Some(set) = self.remembered_cell(kind).get() {
                set.clear_range(span);
            }
        }
    }
}

impl Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("span", &self.span)
            .field("space", &self.space())
            .field("flags", &self.flags())
            .field("alive", &self.alive())
            .finish()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    fn fake_span() -> Span {
        // metadata only: never dereferenced
        Span::new(Address::new(0x1000_0000), 0x1_0000)
    }

    #[test]
    pub fn test_flags_named_accessors() {
        let mut flags = RegionFlags::default();
        assert!(!flags.in_collect_set());
        flags.set_in_collect_set(true);
        flags.set_swept(true);
        assert!(flags.in_collect_set());
        assert!(flags.swept());
        assert!(!flags.has_age_mark());
        assert_eq!(flags.bits(), 0b11);
        flags.set_in_collect_set(false);
        assert_eq!(flags.bits(), 0b10);
    }

    #[test]
    pub fn test_mark_swept_once() {
        let region = Region::new(fake_span(), SpaceFlags::OLD);
        assert!(region.mark_swept());
        assert!(!region.mark_swept());
        assert!(region.is_swept());
    }

    #[test]
    pub fn test_bitmap_set_iter() {
        let region = Region::new(fake_span(), SpaceFlags::OLD);
        let a = region.begin().offset(0x40);
        let b = region.begin().offset(0x8000);
        let c = region.begin().offset(0xfff8);
        assert!(region.mark(b));
        assert!(region.mark(a));
        assert!(region.mark(c));
        assert!(!region.mark(a));
        assert!(region.is_marked(a));
        assert!(!region.is_marked(a.offset(8)));
        assert_eq!(region.marked_objects().collect::<Vec<_>>(), vec![a, b, c]);
        region.clear_marks();
        assert!(!region.has_marks());
    }

    #[test]
    pub fn test_age_mark() {
        let region = Region::new(fake_span(), SpaceFlags::SEMI);
        let mark = region.begin().offset(0x100);
        region.set_age_mark(mark);
        assert!(region.is_aged(region.begin()));
        assert!(!region.is_aged(mark));
        region.set_below_age_mark();
        assert!(region.is_aged(mark));
        region.clear_age_mark();
        assert!(!region.is_aged(region.begin()));
    }

    #[test]
    pub fn test_space_groups() {
        let region = Region::new(fake_span(), SpaceFlags::EDEN);
        assert!(region.in_young());
        region.set_space(SpaceFlags::SHARED_OLD);
        assert!(region.in_shared());
        assert!(!region.in_old_generation());
    }

    #[test]
    pub fn test_remembered_sets_are_lazy() {
        let region = Region::new(fake_span(), SpaceFlags::OLD);
        assert!(region.remembered_set(RememberedSetKind::OldToNew).is_none());
        let slot = region.begin().offset(0x88);
        region.remember(RememberedSetKind::OldToNew, slot);
        let set = region.remembered_set(RememberedSetKind::OldToNew).unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![slot]);
        region.forget_slots_in(Span::new(slot, 8));
        assert!(set.is_empty());
    }

    #[test]
    pub fn test_forget_slots_clears_every_kind() {
        let region = Region::new(fake_span(), SpaceFlags::OLD);
        let young_ref = region.begin().offset(0x40);
        let shared_ref = region.begin().offset(0x48);
        let kept = region.begin().offset(0x80);
        region.remember(RememberedSetKind::OldToNew, young_ref);
        region.remember(RememberedSetKind::LocalToShare, shared_ref);
        region.remember(RememberedSetKind::LocalToShare, kept);

        region.forget_slots_in(Span::new(young_ref, 0x10));
        let old_to_new = region.remembered_set(RememberedSetKind::OldToNew).unwrap();
        let local_to_share = region.remembered_set(RememberedSetKind::LocalToShare).unwrap();
        assert!(old_to_new.is_empty());
        assert_eq!(local_to_share.iter().collect::<Vec<_>>(), vec![kept]);
    }

    #[test]
    pub fn test_cset_predicates() {
        let region = Region::new(fake_span(), SpaceFlags::OLD);
        region.set_alive(0xf000);
        assert!(region.most_object_alive());
        region.set_alive(0x1000);
        assert!(!region.most_object_alive());
        assert!(region.below_compress_threshold_alive());
    }
}
