//! Huge object spaces
//!
//! Every object above the regular size limit gets a region of its own,
//! sized to the object and aligned to the region size. Unmarked huge
//! regions are detached by the sweep and their memory returned to the
//! pool once the collection has finished.

use std::sync::Arc;

use log::{debug, info};

use super::{Space, SpaceCounters, SpaceKind};
use crate::memory::address::{align_up, Address};
use crate::memory::pool::RegionAllocator;
use crate::memory::region::Region;

pub struct HugeObjectSpace {
    kind: SpaceKind,
    regions: Vec<Arc<Region>>,
    counters: SpaceCounters,
    /// Swept regions awaiting release
    deferred: Vec<Arc<Region>>,
    /// Fraction of capacity beyond which a full mark is requested
    full_mark_ratio: f64,
    full_mark_requested: bool,
    region_allocator: Arc<RegionAllocator>,
}

impl HugeObjectSpace {
    pub fn new(
        kind: SpaceKind,
        capacity: usize,
        full_mark_ratio: f64,
        region_allocator: Arc<RegionAllocator>,
    ) -> Self {
        HugeObjectSpace {
            kind,
            regions: Vec::new(),
            counters: SpaceCounters::new(capacity),
            deferred: Vec::new(),
            full_mark_ratio,
            full_mark_requested: false,
            region_allocator,
        }
    }

    /// Bytes committed for an object of `size`
    pub fn committed_for(&self, size: usize) -> usize {
        align_up(size, self.region_allocator.region_size())
    }

    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        let committed = self.committed_for(size);
        let threshold = (self.counters.capacity as f64 * self.full_mark_ratio) as usize;
        if self.counters.committed + committed > threshold && !self.full_mark_requested {
            info!(
                "{} past {:.0}% of capacity, requesting a full mark",
                self.kind,
                self.full_mark_ratio * 100.0
            );
            self.full_mark_requested = true;
        }
        if !self.counters.can_commit(committed) {
            debug!(
                "{}: {:#x} committed, no room for {:#x}",
                self.kind, self.counters.committed, committed
            );
            return None;
        }

        let region = self
            .region_allocator
            .allocate_huge_region(committed, self.kind.flag())?;
        let addr = region.begin();
        region.set_top(addr.offset(size));
        self.counters.commit(region.capacity());
        self.counters.increase_live(size);
        self.regions.push(region);
        Some(addr)
    }

    /// Detach every region whose object is unmarked. Returns the
    /// number of regions detached.
    pub fn sweep(&mut self) -> usize {
        let (live, dead): (Vec<_>, Vec<_>) = std::mem::take(&mut self.regions)
            .into_iter()
            .partition(|r| r.is_marked(r.begin()));
        self.regions = live;
        for region in &dead {
            self.counters.uncommit(region.capacity());
            self.counters.decrease_live(region.allocated());
        }
        let count = dead.len();
        self.deferred.extend(dead);
        if count > 0 {
            debug!("{}: {} dead objects", self.kind, count);
        }
        count
    }

    /// Return swept regions to the mapping pool
    pub fn reclaim_huge_regions(&mut self) -> usize {
        let count = self.deferred.len();
        for region in self.deferred.drain(..) {
            self.region_allocator.free_region(&region);
        }
        count
    }

    pub fn clear_marks(&self) {
        for region in &self.regions {
            region.clear_marks();
        }
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.regions.iter().any(|r| r.contains(addr))
    }

    pub fn full_mark_requested(&self) -> bool {
        self.full_mark_requested
    }

    pub fn clear_full_mark_request(&mut self) {
        self.full_mark_requested = false;
    }

    pub fn increase_overshoot(&mut self, bytes: usize) {
        self.counters.increase_overshoot(bytes);
    }

    pub fn adjust_overshoot(&mut self) {
        self.counters.adjust_overshoot();
    }

    /// Take every region into `other`, leaving this space empty
    pub fn merge_into(&mut self, other: &mut HugeObjectSpace) {
        for region in self.regions.drain(..) {
            region.set_space(other.kind.flag());
            other.counters.commit(region.capacity());
            other.counters.increase_live(region.allocated());
            other.regions.push(region);
        }
        self.counters.committed = 0;
        self.counters.live = 0;
    }

    /// Start address of every object
    pub fn objects(&self) -> impl Iterator<Item = Address> + '_ {
        self.regions.iter().map(|r| r.begin())
    }
}

impl Space for HugeObjectSpace {
    fn kind(&self) -> SpaceKind {
        self.kind
    }

    fn counters(&self) -> &SpaceCounters {
        &self.counters
    }

    fn regions(&self) -> &[Arc<Region>] {
        &self.regions
    }
}

impl Drop for HugeObjectSpace {
    fn drop(&mut self) {
        self.reclaim_huge_regions();
        for region in self.regions.drain(..) {
            self.region_allocator.free_region(&region);
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::memory::pool::MemMapPool;

    const REGION: usize = 0x1_0000;

    fn huge(capacity: usize) -> HugeObjectSpace {
        let regions = Arc::new(RegionAllocator::new(MemMapPool::new(REGION, 0, 4)));
        HugeObjectSpace::new(SpaceKind::Huge, capacity, 0.8, regions)
    }

    #[test]
    pub fn test_one_region_per_object() {
        let mut space = huge(8 * REGION);
        let a = space.allocate(REGION + 8).unwrap();
        let b = space.allocate(3 * REGION).unwrap();
        assert_eq!(space.region_count(), 2);
        assert_eq!(space.committed_size(), 5 * REGION);
        assert_eq!(space.live_size(), 4 * REGION + 8);
        assert!(a.is_aligned_to(REGION) && b.is_aligned_to(REGION));
        assert!(space.verify_accounting().is_empty());
    }

    #[test]
    pub fn test_capacity_exceeded_by_one_byte() {
        let mut space = huge(4 * REGION);
        space.allocate(3 * REGION).unwrap();
        assert!(space.allocate(REGION + 1).is_none());
        assert!(space.allocate(REGION).is_some());
        assert!(space.full_mark_requested());
    }

    #[test]
    pub fn test_sweep_defers_release() {
        let mut space = huge(8 * REGION);
        let a = space.allocate(REGION).unwrap();
        space.allocate(REGION).unwrap();
        space.regions()[0].mark(a);

        assert_eq!(space.sweep(), 1);
        assert_eq!(space.region_count(), 1);
        assert_eq!(space.committed_size(), REGION);
        assert_eq!(space.reclaim_huge_regions(), 1);
        assert_eq!(space.region_allocator.region_count(), 1);
    }
}
