//! Mapping pool and region registry
//!
//! [`MemMapPool`] caches OS mappings: a deque of regular
//! (region-sized) mappings, split into committed and discarded halves,
//! and a size-ordered free list of huge mappings which is merged
//! lazily when a lookup misses. [`RegionAllocator`] builds regions on
//! top of the pool and maintains the process-wide address-to-region
//! registry.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use rand::Rng;

use super::address::{align_up, Address, Span};
use super::region::{Region, SpaceFlags};
use super::sys;

/// Range from which randomized hints for huge mappings are drawn
#[cfg(target_pointer_width = "64")]
const HINT_RANGE: (usize, usize) = (0x1000_0000_0000, 0x3000_0000_0000);

#[derive(Default)]
struct PoolState {
    /// Regular mappings ready for reuse
    committed: VecDeque<Span>,
    /// Regular mappings whose pages have been returned to the OS
    uncommitted: VecDeque<Span>,
    /// Huge mappings keyed by size
    huge_free: BTreeMap<usize, Vec<Span>>,
    /// Bytes handed out and not yet released
    in_use: usize,
    /// Bytes currently mapped from the OS
    mapped: usize,
}

/// Snapshot of pool usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub in_use: usize,
    pub mapped: usize,
    pub cached_regular: usize,
    pub cached_huge: usize,
}

/// Cache of OS mappings
pub struct MemMapPool {
    region_size: usize,
    /// Ceiling on bytes in use (0 for no ceiling)
    capacity: usize,
    cache_limit: usize,
    state: Mutex<PoolState>,
}

impl MemMapPool {
    pub fn new(region_size: usize, capacity: usize, cache_limit: usize) -> Self {
        debug_assert!(region_size.is_power_of_two());
        MemMapPool {
            region_size,
            capacity,
            cache_limit,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }

    /// Obtain a mapping of at least `size` bytes aligned to
    /// `alignment`, a power-of-two multiple of the region size.
    ///
    /// Returns `None` when the pool's ceiling is reached or the OS
    /// refuses; callers decide the OOM policy.
    pub fn allocate(&self, size: usize, alignment: usize) -> Option<Span> {
        debug_assert!(alignment.is_power_of_two() && alignment >= self.region_size);
        let size = align_up(size.max(1), self.region_size);

        let mut state = self.state.lock();
        if self.capacity != 0 && state.in_use + size > self.capacity {
            debug!(
                "mapping pool at capacity: {:#x} in use, {:#x} requested",
                state.in_use, size
            );
            return None;
        }

        let span = if size == self.region_size && alignment == self.region_size {
            self.allocate_regular(&mut state)
        } else {
            self.allocate_huge(&mut state, size, alignment)
        }?;

        state.in_use += span.len();
        trace!("pool allocated {:?}", span);
        Some(span)
    }

    fn allocate_regular(&self, state: &mut PoolState) -> Option<Span> {
        if let Some(span) = state.committed.pop_front() {
            return Some(span);
        }
        if let Some(span) = state.uncommitted.pop_front() {
            return Some(span);
        }
        let span = sys::map_aligned(self.region_size, self.region_size, Address::NULL);
        match span {
            Some(span) => {
                state.mapped += span.len();
                Some(span)
            }
            None => {
                warn!("failed to map a {:#x} byte region", self.region_size);
                None
            }
        }
    }

    fn allocate_huge(&self, state: &mut PoolState, size: usize, alignment: usize) -> Option<Span> {
        if let Some(span) = Self::take_huge(state, size, alignment) {
            return Some(span);
        }
        if Self::merge_huge(state) {
            if let Some(span) = Self::take_huge(state, size, alignment) {
                return Some(span);
            }
        }
        match sys::map_aligned(size, alignment, random_hint(alignment)) {
            Some(span) => {
                state.mapped += span.len();
                Some(span)
            }
            None => {
                warn!("failed to map {:#x} bytes", size);
                None
            }
        }
    }

    /// Best fit from the huge free list, splitting off any remainder
    fn take_huge(state: &mut PoolState, size: usize, alignment: usize) -> Option<Span> {
        let (key, index) = state.huge_free.range(size..).find_map(|(key, spans)| {
            spans
                .iter()
                .position(|s| s.begin().is_aligned_to(alignment))
                .map(|i| (*key, i))
        })?;

        let spans = state.huge_free.get_mut(&key)?;
        let block = spans.swap_remove(index);
        if spans.is_empty() {
            state.huge_free.remove(&key);
        }

        if block.len() > size {
            let rest = Span::new(block.at(size), block.len() - size);
            state.huge_free.entry(rest.len()).or_default().push(rest);
        }
        Some(Span::new(block.begin(), size))
    }

    /// Coalesce adjacent huge free blocks; true if any merged
    fn merge_huge(state: &mut PoolState) -> bool {
        if !sys::SUPPORTS_PARTIAL_UNMAP || state.huge_free.is_empty() {
            return false;
        }

        let mut spans: Vec<Span> = std::mem::take(&mut state.huge_free)
            .into_values()
            .flatten()
            .collect();
        spans.sort_by_key(|s| s.begin());

        let before = spans.len();
        let mut merged: Vec<Span> = Vec::with_capacity(before);
        for span in spans {
            match merged.last_mut() {
                Some(last) if last.adjoins(&span) => {
                    *last = Span::new(last.begin(), last.len() + span.len())
                }
                _ => merged.push(span),
            }
        }

        let changed = merged.len() != before;
        for span in merged {
            state.huge_free.entry(span.len()).or_default().push(span);
        }
        changed
    }

    /// Return a mapping to the pool
    pub fn release(&self, span: Span) {
        let mut state = self.state.lock();
        debug_assert!(state.in_use >= span.len());
        state.in_use -= span.len();

        if span.len() == self.region_size {
            if state.committed.len() < self.cache_limit {
                state.committed.push_back(span);
            } else {
                unsafe { sys::discard(span) };
                state.uncommitted.push_back(span);
            }
        } else {
            unsafe { sys::discard(span) };
            state.huge_free.entry(span.len()).or_default().push(span);
        }
        trace!("pool released {:?}", span);
    }

    /// Unmap every cached mapping that is not committed
    pub fn trim(&self) {
        let mut state = self.state.lock();
        let mut freed = 0;
        let uncommitted: Vec<Span> = state.uncommitted.drain(..).collect();
        let huge: Vec<Span> = std::mem::take(&mut state.huge_free)
            .into_values()
            .flatten()
            .collect();
        for span in uncommitted.into_iter().chain(huge) {
            freed += span.len();
            unsafe { sys::unmap(span) };
        }
        state.mapped -= freed;
        debug!("pool trimmed {:#x} bytes", freed);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            in_use: state.in_use,
            mapped: state.mapped,
            cached_regular: state.committed.len() + state.uncommitted.len(),
            cached_huge: state.huge_free.values().map(|v| v.len()).sum(),
        }
    }
}

impl Drop for MemMapPool {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let regular = state.committed.drain(..).chain(state.uncommitted.drain(..));
        let spans: Vec<Span> = regular
            .chain(std::mem::take(&mut state.huge_free).into_values().flatten())
            .collect();
        for span in spans {
            unsafe { sys::unmap(span) };
        }
    }
}

#[cfg(target_pointer_width = "64")]
fn random_hint(alignment: usize) -> Address {
    let raw = rand::thread_rng().gen_range(HINT_RANGE.0..HINT_RANGE.1);
    Address::new(raw).align_down(alignment)
}

#[cfg(not(target_pointer_width = "64"))]
fn random_hint(_alignment: usize) -> Address {
    Address::NULL
}

/// Creates regions from pooled mappings and answers which region an
/// address belongs to
pub struct RegionAllocator {
    pool: MemMapPool,
    regions: RwLock<BTreeMap<usize, Arc<Region>>>,
}

impl RegionAllocator {
    pub fn new(pool: MemMapPool) -> Self {
        RegionAllocator {
            pool,
            regions: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn region_size(&self) -> usize {
        self.pool.region_size()
    }

    pub fn pool(&self) -> &MemMapPool {
        &self.pool
    }

    /// A regular region for the given space
    pub fn allocate_region(&self, space: SpaceFlags) -> Option<Arc<Region>> {
        let span = self.pool.allocate(self.region_size(), self.region_size())?;
        Some(self.register(Arc::new(Region::new(span, space))))
    }

    /// A region sized to hold one object of `size` bytes
    pub fn allocate_huge_region(&self, size: usize, space: SpaceFlags) -> Option<Arc<Region>> {
        let span = self.pool.allocate(size, self.region_size())?;
        Some(self.register(Arc::new(Region::new_huge(span, space))))
    }

    fn register(&self, region: Arc<Region>) -> Arc<Region> {
        self.regions
            .write()
            .insert(region.begin().as_usize(), region.clone());
        region
    }

    /// Unregister a region and return its memory to the pool
    pub fn free_region(&self, region: &Arc<Region>) {
        let removed = self.regions.write().remove(&region.begin().as_usize());
        debug_assert!(removed.is_some(), "freeing unregistered {:?}", region);
        self.pool.release(region.span());
    }

    /// The region containing `addr`
    pub fn region_of(&self, addr: Address) -> Option<Arc<Region>> {
        let regions = self.regions.read();
        let aligned = addr.align_down(self.region_size()).as_usize();
        if let Some(region) = regions.get(&aligned) {
            if region.contains(addr) {
                return Some(region.clone());
            }
        }
        regions
            .range(..=addr.as_usize())
            .next_back()
            .filter(|(_, r)| r.contains(addr))
            .map(|(_, r)| r.clone())
    }

    /// Visit every live region in address order
    pub fn for_each_region<F: FnMut(&Arc<Region>)>(&self, mut f: F) {
        for region in self.regions.read().values() {
            f(region)
        }
    }

    pub fn region_count(&self) -> usize {
        self.regions.read().len()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    const REGION: usize = 0x1_0000;

    #[test]
    pub fn test_regular_mapping_reused() {
        let pool = MemMapPool::new(REGION, 0, 4);
        let a = pool.allocate(REGION, REGION).unwrap();
        assert!(a.begin().is_aligned_to(REGION));
        pool.release(a);
        let b = pool.allocate(REGION, REGION).unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.stats().in_use, REGION);
        pool.release(b);
    }

    #[test]
    pub fn test_capacity_refuses() {
        let pool = MemMapPool::new(REGION, 2 * REGION, 4);
        let a = pool.allocate(REGION, REGION).unwrap();
        let b = pool.allocate(REGION, REGION).unwrap();
        assert!(pool.allocate(REGION, REGION).is_none());
        pool.release(a);
        assert!(pool.allocate(REGION, REGION).is_some());
        pool.release(b);
    }

    #[test]
    pub fn test_huge_split_and_reuse() {
        let pool = MemMapPool::new(REGION, 0, 4);
        let big = pool.allocate(4 * REGION, REGION).unwrap();
        assert_eq!(big.len(), 4 * REGION);
        pool.release(big);

        let part = pool.allocate(3 * REGION, REGION).unwrap();
        assert_eq!(part.begin(), big.begin());
        assert_eq!(pool.stats().cached_huge, 1);
        pool.release(part);
    }

    #[test]
    #[cfg(unix)]
    pub fn test_huge_merge_on_miss() {
        let pool = MemMapPool::new(REGION, 0, 4);
        let big = pool.allocate(4 * REGION, REGION).unwrap();
        pool.release(big);

        let a = pool.allocate(2 * REGION, REGION).unwrap();
        let b = pool.allocate(2 * REGION, REGION).unwrap();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.stats().cached_huge, 2);

        let whole = pool.allocate(4 * REGION, REGION).unwrap();
        assert_eq!(whole.begin(), big.begin());
        assert_eq!(pool.stats().mapped, 4 * REGION);
        pool.release(whole);
    }

    #[test]
    pub fn test_region_lookup() {
        let regions = RegionAllocator::new(MemMapPool::new(REGION, 0, 4));
        let r = regions.allocate_region(SpaceFlags::OLD).unwrap();
        let h = regions
            .allocate_huge_region(3 * REGION, SpaceFlags::HUGE)
            .unwrap();

        let found = regions.region_of(r.begin().offset(0x100)).unwrap();
        assert!(Arc::ptr_eq(&found, &r));
        let found = regions.region_of(h.begin().offset(2 * REGION + 8)).unwrap();
        assert!(Arc::ptr_eq(&found, &h));
        assert!(regions.region_of(Address::new(0x10)).is_none());

        regions.free_region(&r);
        regions.free_region(&h);
        assert_eq!(regions.region_count(), 0);
        assert_eq!(regions.pool().stats().in_use, 0);
    }
}
