//! Eden's private pool of pre-reserved regions
//!
//! Eden takes its regions from this pool instead of the mapping pool.
//! Once the pool runs dry eden is full and serves nothing until a
//! collection returns its regions.

use std::sync::Arc;

use log::debug;

use crate::memory::pool::RegionAllocator;
use crate::memory::region::{Region, SpaceFlags};

#[derive(Debug)]
pub struct EdenPool {
    free: Vec<Arc<Region>>,
    reserved: usize,
    full: bool,
}

impl EdenPool {
    /// Reserve `count` regions up front. Returns `None` if they cannot
    /// all be had.
    pub fn reserve(regions: &RegionAllocator, count: usize) -> Option<Self> {
        let mut free = Vec::with_capacity(count);
        for _ in 0..count {
            match regions.allocate_region(SpaceFlags::EDEN) {
                Some(region) => free.push(region),
                None => {
                    debug!("eden reservation failed after {} regions", free.len());
                    for region in &free {
                        regions.free_region(region);
                    }
                    return None;
                }
            }
        }
        Some(EdenPool {
            free,
            reserved: count,
            full: false,
        })
    }

    /// Next free region; marks the pool full when none remain
    pub fn take(&mut self) -> Option<Arc<Region>> {
        if self.full {
            return None;
        }
        let region = self.free.pop();
        if region.is_none() {
            self.full = true;
        }
        region
    }

    /// Stop serving regions until the next [`EdenPool::reset`]
    pub fn mark_full(&mut self) {
        if !self.full {
            debug!("eden full with {} of {} regions in use", self.reserved - self.free.len(), self.reserved);
        }
        self.full = true;
    }

    /// Return an emptied region
    pub fn give_back(&mut self, region: Arc<Region>) {
        debug_assert!(self.free.len() < self.reserved);
        region.clear_marks();
        region.forget_slots_in(region.span());
        region.reset_flags();
        region.set_top(region.begin());
        region.set_space(SpaceFlags::EDEN);
        self.free.push(region);
    }

    /// Serve allocations again after a collection
    pub fn reset(&mut self) {
        self.full = false;
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Release every pooled region to the region allocator
    pub fn release(&mut self, regions: &RegionAllocator) {
        for region in self.free.drain(..) {
            regions.free_region(&region);
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::memory::pool::MemMapPool;

    #[test]
    pub fn test_pool_runs_dry_then_full() {
        let regions = RegionAllocator::new(MemMapPool::new(0x1_0000, 0, 4));
        let mut pool = EdenPool::reserve(&regions, 2).unwrap();
        let a = pool.take().unwrap();
        let b = pool.take().unwrap();
        assert!(!pool.is_full());
        assert!(pool.take().is_none());
        assert!(pool.is_full());

        pool.give_back(a);
        assert!(pool.take().is_none());
        pool.reset();
        let c = pool.take().unwrap();

        pool.give_back(b);
        pool.release(&regions);
        assert_eq!(regions.region_count(), 1);
        regions.free_region(&c);
    }

    #[test]
    pub fn test_reservation_respects_pool_capacity() {
        let regions = RegionAllocator::new(MemMapPool::new(0x1_0000, 0x2_0000, 4));
        assert!(EdenPool::reserve(&regions, 3).is_none());
        assert_eq!(regions.region_count(), 0);
    }
}
