//! Bump allocated spaces: semi, eden, snapshot and read-only
//!
//! A [`BumpSpace`] allocates by bumping through its newest region and
//! expands region by region up to its capacity. While a collection is
//! in progress it may grant itself a bounded overshoot rather than
//! fail. Semi spaces additionally carry the age mark that separates
//! survivors of the last young collection from new allocation, and
//! adapt their capacity between cycles.

use std::sync::Arc;

use log::{debug, info, trace};

use super::eden::EdenPool;
use super::{Space, SpaceCounters, SpaceKind};
use crate::memory::address::{Address, Span};
use crate::memory::bump::BumpAllocator;
use crate::memory::object::{object_size, ObjectModel};
use crate::memory::pool::RegionAllocator;
use crate::memory::region::Region;
use crate::memory::sys;

/// Survival ratio above which a semi space grows
pub const GROW_OBJECT_SURVIVAL_RATE: f64 = 0.8;
/// Survival ratio below which a semi space may shrink
pub const SHRINK_OBJECT_SURVIVAL_RATE: f64 = 0.2;
pub const GROWING_FACTOR: usize = 2;
/// Allocation throughput (bytes/ms) below which shrinking is allowed
pub const LOW_ALLOCATION_SPEED_PER_MS: f64 = 1000.0;

/// Capabilities that distinguish the bump spaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearPolicy {
    /// Capacity adapts to survival between cycles
    pub adaptive: bool,
    /// Overshoot granted per step mid-collection (0: none)
    pub overshoot_step: usize,
    /// Space may be write protected once populated
    pub protectable: bool,
}

impl LinearPolicy {
    pub fn semi(overshoot_step: usize) -> Self {
        LinearPolicy {
            adaptive: true,
            overshoot_step,
            protectable: false,
        }
    }

    pub fn eden() -> Self {
        LinearPolicy {
            adaptive: false,
            overshoot_step: 0,
            protectable: false,
        }
    }

    pub fn snapshot() -> Self {
        LinearPolicy {
            adaptive: false,
            overshoot_step: 0,
            protectable: false,
        }
    }

    pub fn read_only() -> Self {
        LinearPolicy {
            adaptive: false,
            overshoot_step: 0,
            protectable: true,
        }
    }
}

pub struct BumpSpace {
    kind: SpaceKind,
    policy: LinearPolicy,
    regions: Vec<Arc<Region>>,
    allocator: BumpAllocator,
    counters: SpaceCounters,
    initial_capacity: usize,
    minimum_capacity: usize,
    maximum_capacity: usize,
    /// Overshoot granted so far during the current collection
    collection_overshoot: usize,
    eden: Option<EdenPool>,
    age_mark: Address,
    allocated_since_gc: usize,
    survival_size: usize,
    frozen: bool,
    region_allocator: Arc<RegionAllocator>,
}

impl BumpSpace {
    pub fn new(
        kind: SpaceKind,
        policy: LinearPolicy,
        minimum: usize,
        maximum: usize,
        region_allocator: Arc<RegionAllocator>,
    ) -> Self {
        BumpSpace {
            kind,
            policy,
            regions: Vec::new(),
            allocator: BumpAllocator::default(),
            counters: SpaceCounters::new(minimum),
            initial_capacity: minimum,
            minimum_capacity: minimum,
            maximum_capacity: maximum,
            collection_overshoot: 0,
            eden: None,
            age_mark: Address::NULL,
            allocated_since_gc: 0,
            survival_size: 0,
            frozen: false,
            region_allocator,
        }
    }

    /// An eden space drawing from a pool of `regions` pre-reserved
    /// regions
    pub fn eden(regions: usize, region_allocator: Arc<RegionAllocator>) -> Option<Self> {
        let pool = EdenPool::reserve(&region_allocator, regions)?;
        let capacity = regions * region_allocator.region_size();
        let mut space = BumpSpace::new(
            SpaceKind::Eden,
            LinearPolicy::eden(),
            capacity,
            capacity,
            region_allocator,
        );
        space.eden = Some(pool);
        Some(space)
    }

    /// Allocate `size` aligned bytes.
    ///
    /// `mid_collection` permits a bounded overshoot when the space
    /// cannot otherwise expand.
    pub fn allocate(&mut self, size: usize, mid_collection: bool) -> Option<Address> {
        if self.frozen || self.is_full() {
            return None;
        }
        let result = self.allocator.allocate(size).or_else(|| {
            if self.expand() {
                self.allocator.allocate(size)
            } else if mid_collection && self.increase_collection_overshoot() && self.expand() {
                self.allocator.allocate(size)
            } else {
                None
            }
        })?;

        self.counters.increase_live(size);
        if !mid_collection {
            self.allocated_since_gc += size;
        }
        Some(result)
    }

    /// Grant one overshoot step, bounded by half the initial capacity
    /// or one step, whichever is larger
    fn increase_collection_overshoot(&mut self) -> bool {
        let step = self.policy.overshoot_step;
        let max = (self.initial_capacity / 2).max(step);
        if step == 0 || self.collection_overshoot >= max {
            return false;
        }
        self.counters.increase_overshoot(step);
        self.collection_overshoot += step;
        debug!(
            "{} overshoot raised to {:#x} mid-collection",
            self.kind, self.counters.overshoot
        );
        true
    }

    /// Acquire one more region, within capacity plus overshoot
    pub fn expand(&mut self) -> bool {
        let region_size = self.region_allocator.region_size();
        let region = if self.counters.can_commit(region_size) {
            match &mut self.eden {
                Some(pool) => pool.take(),
                None => self.region_allocator.allocate_region(self.kind.flag()),
            }
        } else {
            None
        };
        let region = match region {
            Some(region) => region,
            None => {
                if let Some(pool) = &mut self.eden {
                    pool.mark_full();
                }
                return false;
            }
        };

        self.flush_top();
        region.set_space(self.kind.flag());
        self.allocator.reset(region.span());
        self.counters.commit(region.capacity());
        trace!("{} expanded to {} regions", self.kind, self.regions.len() + 1);
        self.regions.push(region);
        true
    }

    /// Record the allocation top in the current region
    pub fn flush_top(&self) {
        if let Some(current) = self.regions.last() {
            current.set_top(self.allocator.top());
        }
    }

    /// Mark everything allocated so far as having survived a young
    /// collection
    pub fn set_water_line(&mut self) {
        self.flush_top();
        self.age_mark = self.allocator.top();
        if let Some((current, older)) = self.regions.split_last() {
            for region in older {
                region.set_below_age_mark();
            }
            current.set_age_mark(self.age_mark);
        }
        self.allocated_since_gc = 0;
    }

    pub fn age_mark(&self) -> Address {
        self.age_mark
    }

    /// Record the bytes that survived into this space in the last
    /// collection
    pub fn set_survival_size(&mut self, bytes: usize) {
        self.survival_size = bytes;
    }

    pub fn survival_size(&self) -> usize {
        self.survival_size
    }

    pub fn allocated_since_gc(&self) -> usize {
        self.allocated_since_gc
    }

    /// Grow when most recently allocated objects survived; shrink when
    /// few survived and allocation is slow. Only between cycles.
    pub fn adjust_capacity(&mut self, allocated_since_gc: usize, allocation_speed_per_ms: f64) -> bool {
        if !self.policy.adaptive {
            return false;
        }
        let threshold =
            (self.initial_capacity as f64 * GROW_OBJECT_SURVIVAL_RATE / GROWING_FACTOR as f64) as usize;
        if allocated_since_gc <= threshold {
            return false;
        }

        let survival_rate = self.survival_size as f64 / allocated_since_gc as f64;
        let initial_rate = self.survival_size as f64 / self.initial_capacity as f64;
        if survival_rate > GROW_OBJECT_SURVIVAL_RATE || initial_rate > GROW_OBJECT_SURVIVAL_RATE {
            let grown = (self.initial_capacity * GROWING_FACTOR).min(self.maximum_capacity);
            if grown == self.initial_capacity {
                return false;
            }
            info!("{} capacity grows to {:#x}", self.kind, grown);
            self.set_initial_capacity(grown);
            true
        } else if survival_rate < SHRINK_OBJECT_SURVIVAL_RATE {
            if self.initial_capacity <= self.minimum_capacity
                || allocation_speed_per_ms > LOW_ALLOCATION_SPEED_PER_MS
            {
                return false;
            }
            let shrunk = (self.initial_capacity / GROWING_FACTOR).max(self.minimum_capacity);
            info!("{} capacity shrinks to {:#x}", self.kind, shrunk);
            self.set_initial_capacity(shrunk);
            true
        } else {
            false
        }
    }

    pub fn set_initial_capacity(&mut self, capacity: usize) {
        self.initial_capacity = capacity;
        self.counters.capacity = capacity;
    }

    pub fn initial_capacity(&self) -> usize {
        self.initial_capacity
    }

    pub fn maximum_capacity(&self) -> usize {
        self.maximum_capacity
    }

    pub fn set_overshoot(&mut self, bytes: usize) {
        self.counters.overshoot = bytes;
    }

    pub fn increase_overshoot(&mut self, bytes: usize) {
        self.counters.increase_overshoot(bytes);
    }

    /// Decay overshoot once a collection has finished
    pub fn adjust_overshoot(&mut self) {
        self.collection_overshoot = 0;
        self.counters.adjust_overshoot();
    }

    /// Detach every region, leaving the space empty. Eden regions go
    /// back to the private pool; the others are returned to the caller.
    pub fn take_regions(&mut self) -> Vec<Arc<Region>> {
        self.flush_top();
        self.allocator.clear();
        self.counters.committed = 0;
        self.counters.live = 0;
        self.age_mark = Address::NULL;
        let regions = std::mem::take(&mut self.regions);
        match &mut self.eden {
            Some(pool) => {
                for region in regions {
                    pool.give_back(region);
                }
                pool.reset();
                Vec::new()
            }
            None => regions,
        }
    }

    /// Empty the space, returning its regions to the mapping pool
    pub fn reclaim_regions(&mut self) {
        for region in self.take_regions() {
            self.region_allocator.free_region(&region);
        }
    }

    /// Eden has used every pooled region
    pub fn is_full(&self) -> bool {
        self.eden.as_ref().map(|p| p.is_full()).unwrap_or(false)
    }

    pub fn is_eden(&self) -> bool {
        self.eden.is_some()
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.regions.iter().any(|r| r.contains(addr))
    }

    /// Bytes allocated in the space so far
    pub fn allocated(&self) -> usize {
        self.flush_top();
        self.regions.iter().map(|r| r.allocated()).sum()
    }

    /// Visit every object, in allocation order
    pub fn for_each_object<F: FnMut(Address, usize)>(&self, model: &dyn ObjectModel, mut f: F) {
        self.flush_top();
        for region in &self.regions {
            let mut addr = region.begin();
            while addr < region.top() {
                let size = unsafe { object_size(model, addr) };
                if size == 0 {
                    break;
                }
                f(addr, size);
                addr = addr.offset(size);
            }
        }
    }

    /// Write protect (or unprotect) every region
    pub fn protect(&mut self, read_only: bool) -> bool {
        if !self.policy.protectable {
            return false;
        }
        self.flush_top();
        let mut ok = true;
        for region in &self.regions {
            ok &= sys::protect(region.span(), read_only);
            region.update_flags(|f| f.set_read_only_protected(read_only));
        }
        self.frozen = read_only;
        ok
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Current bump area
    pub fn bump_area(&self) -> Span {
        self.allocator.remainder()
    }
}

impl Space for BumpSpace {
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

impl Drop for BumpSpace {
    fn drop(&mut self) {
        if self.frozen {
            self.protect(false);
        }
        let regions = std::mem::take(&mut self.regions);
        for region in &regions {
            self.region_allocator.free_region(region);
        }
        if let Some(pool) = &mut self.eden {
            pool.release(&self.region_allocator);
        }
    }
}
