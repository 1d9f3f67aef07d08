//! Marking support
//!
//! The runtime hands the collector its roots through a [`Tracer`]; the
//! object model enumerates the reference slots inside each object. The
//! [`Marker`] walks the graph breadth first from those slots, setting
//! mark bits and accounting live bytes per region. Only objects in
//! regions within the marker's scope are marked and scanned; anything
//! else is treated as an opaque leaf.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use super::address::{Address, OBJECT_ALIGNMENT};
use super::object::{object_size, ClassRef, ObjectModel, Slot};
use super::pool::RegionAllocator;
use super::region::{Region, RememberedSetKind, SpaceFlags};

/// Source of root slots, supplied by the runtime
pub trait Tracer: Send + Sync {
    /// Visit every root slot: a word that may hold a reference
    fn visit_roots(&self, visitor: &mut dyn FnMut(Slot));

    /// Called for every object the collector moves
    fn relocated(&self, _from: Address, _to: Address) {}
}

/// A tracer over an explicit list of roots
#[derive(Debug, Default)]
pub struct RootList {
    roots: Mutex<Vec<usize>>,
}

impl RootList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a root, returning its index
    pub fn push(&self, object: Address) -> usize {
        let mut roots = self.roots.lock();
        roots.push(object.as_usize());
        roots.len() - 1
    }

    /// Current value of a root (updated when its object moves)
    pub fn get(&self, index: usize) -> Address {
        Address::new(self.roots.lock()[index])
    }

    pub fn set(&self, index: usize, object: Address) {
        self.roots.lock()[index] = object.as_usize();
    }

    pub fn clear(&self) {
        self.roots.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.roots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.lock().is_empty()
    }
}

impl Tracer for RootList {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Slot)) {
        let mut roots = self.roots.lock();
        for root in roots.iter_mut() {
            visitor(Address::from_ptr(root as *mut usize));
        }
    }
}

/// The roots of several contexts as one tracer
#[derive(Default, Clone)]
pub struct Tracers(pub Vec<Arc<dyn Tracer>>);

impl Tracer for Tracers {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Slot)) {
        for tracer in &self.0 {
            tracer.visit_roots(visitor);
        }
    }

    fn relocated(&self, from: Address, to: Address) {
        for tracer in &self.0 {
            tracer.relocated(from, to);
        }
    }
}

/// The regions owned by one heap
///
/// Every heap shares the process-wide region registry, so a heap
/// collecting on its own restricts marking to its members.
#[derive(Debug, Default)]
pub struct RegionSet {
    begins: HashSet<usize>,
}

impl RegionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, region: &Region) {
        self.begins.insert(region.begin().as_usize());
    }

    pub fn contains(&self, region: &Region) -> bool {
        self.begins.contains(&region.begin().as_usize())
    }

    pub fn len(&self) -> usize {
        self.begins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.begins.is_empty()
    }
}

impl<'r> FromIterator<&'r Arc<Region>> for RegionSet {
    fn from_iter<I: IntoIterator<Item = &'r Arc<Region>>>(iter: I) -> Self {
        let mut set = RegionSet::new();
        for region in iter {
            set.insert(region);
        }
        set
    }
}

/// Interpret a slot value as a potential object reference
#[inline]
pub fn reference(value: usize) -> Option<Address> {
    if value == 0 || value % OBJECT_ALIGNMENT != 0 {
        None
    } else {
        Some(Address::new(value))
    }
}

/// Read the reference held in `slot`, if any
///
/// # Safety
///
/// `slot` must be a readable, word-aligned address.
#[inline]
pub unsafe fn load_reference(slot: Slot) -> Option<Address> {
    reference(slot.load_word())
}

/// The region holding object `obj`, if `obj` can be an object start
pub fn object_region(regions: &RegionAllocator, obj: Address) -> Option<Arc<Region>> {
    let region = regions.region_of(obj)?;
    if region.space().intersects(SpaceFlags::HUGE_OBJECTS) && obj != region.begin() {
        return None;
    }
    Some(region)
}

/// Record `slot` in the remembered set its region needs for holding
/// `value`: old-to-new when a non-young slot refers to a young object,
/// local-to-share when a local slot refers to a shared object.
pub fn remember_slot(regions: &RegionAllocator, slot: Slot, value: Address) {
    let target = match reference(value.as_usize()).and_then(|v| regions.region_of(v)) {
        Some(target) => target,
        None => return,
    };
    let holder = match regions.region_of(slot) {
        Some(holder) => holder,
        None => return,
    };
    if target.in_young() && !holder.in_young() {
        holder.remember(RememberedSetKind::OldToNew, slot);
    } else if target.in_shared() && !holder.in_shared() {
        holder.remember(RememberedSetKind::LocalToShare, slot);
    }
}

pub struct Marker<'a> {
    regions: &'a RegionAllocator,
    model: &'a dyn ObjectModel,
    scope: SpaceFlags,
    members: Option<&'a RegionSet>,
    grey: VecDeque<Address>,
    marked: usize,
    marked_bytes: usize,
}

impl<'a> Marker<'a> {
    pub fn new(regions: &'a RegionAllocator, model: &'a dyn ObjectModel, scope: SpaceFlags) -> Self {
        Marker {
            regions,
            model,
            scope,
            members: None,
            grey: VecDeque::new(),
            marked: 0,
            marked_bytes: 0,
        }
    }

    /// Only mark objects in `members`
    pub fn within(mut self, members: &'a RegionSet) -> Self {
        self.members = Some(members);
        self
    }

    fn in_scope(&self, region: &Region) -> bool {
        region.space().intersects(self.scope) && self.members.map(|m| m.contains(region)).unwrap_or(true)
    }

    /// Mark object if in scope and not already marked and return
    /// whether marked
    pub fn mark(&mut self, obj: Address) -> bool {
        let region = match object_region(self.regions, obj) {
            Some(region) if self.in_scope(&region) => region,
            _ => return false,
        };
        if !region.mark(obj) {
            return false;
        }
        let size = unsafe { object_size(self.model, obj) };
        region.increase_alive(size);
        self.marked += 1;
        self.marked_bytes += size;
        self.grey.push_back(obj);
        true
    }

    pub fn is_marked(&self, obj: Address) -> bool {
        object_region(self.regions, obj)
            .map(|r| r.is_marked(obj))
            .unwrap_or(false)
    }

    /// Mark whatever `slot` refers to
    pub fn mark_slot(&mut self, slot: Slot) {
        if let Some(obj) = unsafe { load_reference(slot) } {
            self.mark(obj);
        }
    }

    pub fn mark_roots(&mut self, tracer: &dyn Tracer) {
        tracer.visit_roots(&mut |slot| self.mark_slot(slot));
    }

    /// Treat the references of `obj` as roots without marking it
    pub fn scan(&mut self, obj: Address) {
        let class = unsafe { ClassRef::of(obj) };
        let model = self.model;
        model.visit_references(class, obj, &mut |slot| self.mark_slot(slot));
    }

    /// Treat the slots in every `kind` remembered set of regions in
    /// `holders` as roots
    pub fn mark_remembered(&mut self, kind: RememberedSetKind, holders: SpaceFlags) {
        for slot in remembered_slots(self.regions, kind, holders) {
            self.mark_slot(slot);
        }
    }

    /// Scan grey objects until none remain
    pub fn drain(&mut self) {
        let model = self.model;
        while let Some(obj) = self.grey.pop_front() {
            let class = unsafe { ClassRef::of(obj) };
            model.visit_references(class, obj, &mut |slot| self.mark_slot(slot));
        }
        trace!(
            "marked {} objects, {:#x} bytes in {:?}",
            self.marked,
            self.marked_bytes,
            self.scope
        );
    }

    pub fn marked(&self) -> usize {
        self.marked
    }

    pub fn marked_bytes(&self) -> usize {
        self.marked_bytes
    }
}

/// Every slot recorded in a `kind` set of a region in `holders`
pub fn remembered_slots(regions: &RegionAllocator, kind: RememberedSetKind, holders: SpaceFlags) -> Vec<Slot> {
    let mut slots = Vec::new();
    regions.for_each_region(|region| {
        if region.space().intersects(holders) {
            if let Some(set) = region.remembered_set(kind) {
                slots.extend(set.iter());
            }
        }
    });
    slots
}

/// Every slot recorded in a `kind` set of the given regions
pub fn remembered_slots_in<'r, I>(regions: I, kind: RememberedSetKind) -> Vec<Slot>
where
    I: IntoIterator<Item = &'r Arc<Region>>,
{
    let mut slots = Vec::new();
    for region in regions {
        if let Some(set) = region.remembered_set(kind) {
            slots.extend(set.iter());
        }
    }
    slots
}

pub fn clear_remembered_in<'r, I>(regions: I, kind: RememberedSetKind)
where
    I: IntoIterator<Item = &'r Arc<Region>>,
{
    for region in regions {
        region.clear_remembered_set(kind);
    }
}

/// Clear the `kind` set of every region in `holders`
pub fn clear_remembered(regions: &RegionAllocator, kind: RememberedSetKind, holders: SpaceFlags) {
    regions.for_each_region(|region| {
        if region.space().intersects(holders) {
            region.clear_remembered_set(kind);
        }
    });
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::memory::object::EncodedSizeModel;
    use crate::memory::pool::MemMapPool;

    const REGION: usize = 0x1_0000;

    fn object(region: &Region, offset: usize, size: usize, refs: &[Address]) -> Address {
        let addr = region.begin().offset(offset);
        EncodedSizeModel.install_class(addr, EncodedSizeModel::class_with_references(size));
        for (i, r) in refs.iter().enumerate() {
            unsafe { addr.offset((i + 1) * 8).store_word(r.as_usize()) };
        }
        addr
    }

    #[test]
    pub fn test_transitive_marking_within_scope() {
        let regions = RegionAllocator::new(MemMapPool::new(REGION, 0, 4));
        let young = regions.allocate_region(SpaceFlags::SEMI).unwrap();
        let old = regions.allocate_region(SpaceFlags::OLD).unwrap();

        let c = object(&young, 0x100, 16, &[]);
        let via_old = object(&old, 0, 16, &[c]);
        let b = object(&young, 0x40, 24, &[via_old, Address::NULL]);
        let a = object(&young, 0, 32, &[b, b, Address::new(0x13)]);
        let garbage = object(&young, 0x200, 16, &[a]);

        let roots = RootList::new();
        roots.push(a);
        let mut marker = Marker::new(&regions, &EncodedSizeModel, SpaceFlags::YOUNG);
        marker.mark_roots(&roots);
        marker.drain();

        assert!(marker.is_marked(a) && marker.is_marked(b));
        // old objects are leaves, so c is only reachable through them
        assert!(!marker.is_marked(c));
        assert!(!marker.is_marked(garbage));
        assert!(!old.has_marks());
        assert_eq!(young.alive(), 32 + 24);
        assert_eq!(marker.marked(), 2);

        regions.free_region(&young);
        regions.free_region(&old);
    }

    #[test]
    pub fn test_remembered_slots_act_as_roots() {
        let regions = RegionAllocator::new(MemMapPool::new(REGION, 0, 4));
        let young = regions.allocate_region(SpaceFlags::SEMI).unwrap();
        let old = regions.allocate_region(SpaceFlags::OLD).unwrap();

        let c = object(&young, 0, 16, &[]);
        let holder = object(&old, 0, 16, &[c]);
        let slot = holder.offset(8);
        remember_slot(&regions, slot, c);
        assert_eq!(
            remembered_slots(&regions, RememberedSetKind::OldToNew, SpaceFlags::OLD_GENERATION),
            vec![slot]
        );

        let mut marker = Marker::new(&regions, &EncodedSizeModel, SpaceFlags::YOUNG);
        marker.mark_remembered(RememberedSetKind::OldToNew, SpaceFlags::OLD_GENERATION);
        marker.drain();
        assert!(marker.is_marked(c));

        clear_remembered(&regions, RememberedSetKind::OldToNew, SpaceFlags::OLD_GENERATION);
        assert!(remembered_slots(&regions, RememberedSetKind::OldToNew, SpaceFlags::OLD_GENERATION).is_empty());

        regions.free_region(&young);
        regions.free_region(&old);
    }

    #[test]
    pub fn test_young_to_young_not_remembered() {
        let regions = RegionAllocator::new(MemMapPool::new(REGION, 0, 4));
        let young = regions.allocate_region(SpaceFlags::SEMI).unwrap();
        let a = object(&young, 0, 16, &[]);
        let b = object(&young, 0x10, 16, &[a]);
        remember_slot(&regions, b.offset(8), a);
        assert!(young.remembered_set(RememberedSetKind::OldToNew).is_none());
        regions.free_region(&young);
    }

    #[test]
    pub fn test_members_restrict_marking() {
        let regions = RegionAllocator::new(MemMapPool::new(REGION, 0, 4));
        let mine = regions.allocate_region(SpaceFlags::SEMI).unwrap();
        let theirs = regions.allocate_region(SpaceFlags::SEMI).unwrap();
        let other = object(&theirs, 0, 16, &[]);
        let a = object(&mine, 0, 24, &[other, Address::NULL]);

        let members: RegionSet = [&mine].into_iter().collect();
        let mut marker = Marker::new(&regions, &EncodedSizeModel, SpaceFlags::YOUNG).within(&members);
        marker.mark(a);
        marker.drain();
        assert!(mine.is_marked(a));
        assert!(!theirs.has_marks());
        assert_eq!(members.len(), 1);

        regions.free_region(&mine);
        regions.free_region(&theirs);
    }

    #[test]
    pub fn test_scan_marks_referents_only() {
        let regions = RegionAllocator::new(MemMapPool::new(REGION, 0, 4));
        let old = regions.allocate_region(SpaceFlags::READ_ONLY).unwrap();
        let young = regions.allocate_region(SpaceFlags::SEMI).unwrap();
        let c = object(&young, 0, 16, &[]);
        let holder = object(&old, 0, 16, &[c]);

        let mut marker = Marker::new(&regions, &EncodedSizeModel, SpaceFlags::YOUNG);
        marker.scan(holder);
        marker.drain();
        assert!(marker.is_marked(c));
        assert!(!old.is_marked(holder));
        assert_eq!(remembered_slots_in([&old], RememberedSetKind::OldToNew), Vec::<Slot>::new());

        regions.free_region(&old);
        regions.free_region(&young);
    }

    #[test]
    pub fn test_tracers_visit_every_context() {
        let first = Arc::new(RootList::new());
        let second = Arc::new(RootList::new());
        first.push(Address::new(0x10));
        second.push(Address::new(0x20));
        second.push(Address::new(0x30));
        let all = Tracers(vec![first as Arc<dyn Tracer>, second as Arc<dyn Tracer>]);
        let mut seen = Vec::new();
        all.visit_roots(&mut |slot| seen.push(unsafe { slot.load_word() }));
        assert_eq!(seen, vec![0x10, 0x20, 0x30]);
    }

    #[test]
    pub fn test_root_list_slots_are_writable() {
        let roots = RootList::new();
        roots.push(Address::new(0x1000));
        roots.visit_roots(&mut |slot| unsafe { slot.store_word(0x2000) });
        assert_eq!(roots.get(0), Address::new(0x2000));
    }
}
