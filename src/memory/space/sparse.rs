//! Free list spaces: old, non-movable, machine code, local, app spawn
//!
//! A [`FreeListSpace`] allocates from a free list that each major
//! collection rebuilds by sweeping. Sweeping moves through the states
//! `NoSweep -> Sweeping -> Swept -> NoSweep`. Regions to sweep sit in
//! a queue shared with background sweepers; each worker claims a
//! region under a short lock, sweeps it unlocked and posts the
//! resulting free blocks to the swept queue. The owner merges those
//! into its allocator the next time it needs memory.
//!
//! Allocation here never collects. Collecting and retrying after a miss
//! is done by `Heap::allocate_with_retry`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use super::code::CodeSpaceAddOn;
use super::cset::CollectSet;
use super::{Space, SpaceCounters, SpaceKind};
use crate::memory::address::{Address, Span};
use crate::memory::freelist::FreeListAllocator;
use crate::memory::object::{object_size, ObjectModel};
use crate::memory::pool::RegionAllocator;
use crate::memory::region::Region;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SweepState {
    NoSweep,
    Sweeping,
    Swept,
}

impl SweepState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SweepState::Sweeping,
            2 => SweepState::Swept,
            _ => SweepState::NoSweep,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SweepState::NoSweep => 0,
            SweepState::Sweeping => 1,
            SweepState::Swept => 2,
        }
    }
}

/// Result of sweeping one region: the gaps between its live objects
#[derive(Debug)]
pub struct SweptRegion {
    pub region: Arc<Region>,
    pub free: Vec<Span>,
}

/// Reconstruct the gaps between marked objects of `region`
pub fn sweep_region(region: &Arc<Region>, model: &dyn ObjectModel) -> SweptRegion {
    let mut free = Vec::new();
    let mut cursor = region.begin();
    for live in region.marked_objects() {
        if live > cursor {
            free.push(Span::between(cursor, live));
        }
        cursor = live.offset(unsafe { object_size(model, live) });
    }
    if cursor < region.end() {
        free.push(Span::between(cursor, region.end()));
    }
    for gap in &free {
        region.forget_slots_in(*gap);
    }

    let first = region.mark_swept();
    debug_assert!(first, "{:?} swept twice", region);
    region.update_flags(|f| f.set_in_sweep_queue(false));
    SweptRegion {
        region: region.clone(),
        free,
    }
}

struct SweepLists {
    /// Regions awaiting sweep, most live first (claimed from the back)
    sweeping: Vec<Arc<Region>>,
    /// Swept regions awaiting merge into the allocator
    swept: Vec<SweptRegion>,
    /// Regions claimed and not yet posted back
    in_flight: usize,
}

/// Sweep work shared between a space and the background sweepers
pub struct SweepQueues {
    kind: SpaceKind,
    model: Arc<dyn ObjectModel>,
    lists: Mutex<SweepLists>,
    idle: Condvar,
    state: AtomicU8,
}

impl SweepQueues {
    pub fn new(kind: SpaceKind, model: Arc<dyn ObjectModel>) -> Self {
        SweepQueues {
            kind,
            model,
            lists: Mutex::new(SweepLists {
                sweeping: Vec::new(),
                swept: Vec::new(),
                in_flight: 0,
            }),
            idle: Condvar::new(),
            state: AtomicU8::new(SweepState::NoSweep.as_u8()),
        }
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    pub fn state(&self) -> SweepState {
        SweepState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SweepState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn enqueue(&self, mut regions: Vec<Arc<Region>>) {
        regions.sort_by_key(|r| std::cmp::Reverse(r.alive()));
        for region in &regions {
            region.update_flags(|f| {
                f.set_swept(false);
                f.set_in_sweep_queue(true);
            });
        }
        let mut lists = self.lists.lock();
        debug_assert!(lists.sweeping.is_empty() && lists.in_flight == 0);
        lists.sweeping = regions;
    }

    /// Claim the next region to sweep (least live first)
    pub fn claim(&self) -> Option<Arc<Region>> {
        let mut lists = self.lists.lock();
        let region = lists.sweeping.pop()?;
        lists.in_flight += 1;
        Some(region)
    }

    fn complete(&self, swept: Option<SweptRegion>) {
        let mut lists = self.lists.lock();
        if let Some(swept) = swept {
            lists.swept.push(swept);
        }
        lists.in_flight -= 1;
        if lists.in_flight == 0 {
            self.idle.notify_all();
        }
    }

    /// Sweep one region and post it to the swept queue. False when
    /// nothing was left to claim.
    pub fn sweep_next(&self) -> bool {
        match self.claim() {
            Some(region) => {
                let swept = sweep_region(&region, self.model.as_ref());
                trace!("{} swept {:?} off the owner", self.kind, region.span());
                self.complete(Some(swept));
                true
            }
            None => false,
        }
    }

    /// Sweep until the queue is empty
    pub fn sweep_all(&self) -> usize {
        let mut count = 0;
        while self.sweep_next() {
            count += 1;
        }
        count
    }

    fn take_swept(&self) -> Vec<SweptRegion> {
        std::mem::take(&mut self.lists.lock().swept)
    }

    /// Block until no region is being swept elsewhere
    pub fn wait_idle(&self) {
        let mut lists = self.lists.lock();
        while lists.in_flight > 0 {
            self.idle.wait(&mut lists);
        }
    }

    /// Regions still waiting to be claimed
    pub fn pending(&self) -> usize {
        self.lists.lock().sweeping.len()
    }

    fn remove(&self, region: &Arc<Region>) {
        self.lists.lock().sweeping.retain(|r| !Arc::ptr_eq(r, region));
    }
}

/// Capabilities that distinguish the free list spaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparsePolicy {
    /// Rebuilt by sweeping each major cycle
    pub sweeps: bool,
    /// Regions may be selected for evacuation
    pub evacuates: bool,
    /// Holds machine code
    pub code: bool,
}

impl SparsePolicy {
    pub fn old() -> Self {
        SparsePolicy {
            sweeps: true,
            evacuates: true,
            code: false,
        }
    }

    pub fn non_movable() -> Self {
        SparsePolicy {
            sweeps: true,
            evacuates: false,
            code: false,
        }
    }

    pub fn machine_code() -> Self {
        SparsePolicy {
            sweeps: true,
            evacuates: false,
            code: true,
        }
    }

    /// Evacuation destination, merged into its target afterwards
    pub fn local() -> Self {
        SparsePolicy {
            sweeps: false,
            evacuates: false,
            code: false,
        }
    }

    /// Frozen pre-fork heap: never swept or moved again
    pub fn app_spawn() -> Self {
        SparsePolicy {
            sweeps: false,
            evacuates: false,
            code: false,
        }
    }
}

pub struct FreeListSpace {
    pub(super) kind: SpaceKind,
    pub(super) policy: SparsePolicy,
    pub(super) regions: Vec<Arc<Region>>,
    pub(super) allocator: FreeListAllocator,
    pub(super) counters: SpaceCounters,
    /// Live size beyond which an old collection is due
    pub(super) alloc_limit: usize,
    pub(super) sweep: Arc<SweepQueues>,
    pub(super) cset: CollectSet,
    pub(super) code: Option<CodeSpaceAddOn>,
    pub(super) region_allocator: Arc<RegionAllocator>,
}

impl FreeListSpace {
    pub fn new(
        kind: SpaceKind,
        policy: SparsePolicy,
        capacity: usize,
        region_allocator: Arc<RegionAllocator>,
        model: Arc<dyn ObjectModel>,
    ) -> Self {
        FreeListSpace {
            kind,
            policy,
            regions: Vec::new(),
            allocator: FreeListAllocator::new(),
            counters: SpaceCounters::new(capacity),
            alloc_limit: capacity,
            sweep: Arc::new(SweepQueues::new(kind, model)),
            cset: CollectSet::default(),
            code: None,
            region_allocator,
        }
    }

    /// Attach the machine code add-on
    pub fn with_code(mut self, code: CodeSpaceAddOn) -> Self {
        self.code = Some(code);
        self
    }

    pub fn policy(&self) -> SparsePolicy {
        self.policy
    }

    /// Allocate without collecting: free list, then completion of an
    /// in-progress sweep, then expansion.
    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        if let Some(addr) = self.try_allocate(size) {
            return Some(addr);
        }
        if self.sweep_state() == SweepState::Sweeping {
            if let Some(addr) = self.allocate_after_sweeping(size) {
                return Some(addr);
            }
        }
        if self.expand() {
            return self.try_allocate(size);
        }
        None
    }

    /// Free list (and bump area) only
    pub fn try_allocate(&mut self, size: usize) -> Option<Address> {
        let addr = self.allocator.allocate(size)?;
        self.counters.increase_live(size);
        Some(addr)
    }

    /// While sweeping: merge what has been swept and retry; failing
    /// that, finish the sweep here and retry once more.
    pub fn allocate_after_sweeping(&mut self, size: usize) -> Option<Address> {
        if self.sweep_state() != SweepState::Sweeping {
            return self.try_allocate(size);
        }
        if self.fill_swept_region() {
            if let Some(addr) = self.try_allocate(size) {
                return Some(addr);
            }
        }
        self.finish_sweeping();
        self.try_allocate(size)
    }

    /// Acquire a fresh region if capacity (with overshoot) allows
    pub fn expand(&mut self) -> bool {
        let region_size = self.region_allocator.region_size();
        if !self.counters.can_commit(region_size) {
            trace!("{} cannot expand past {:#x}", self.kind, self.counters.committed);
            return false;
        }
        match self.region_allocator.allocate_region(self.kind.flag()) {
            Some(region) => {
                self.allocator.add_span(region.span());
                self.counters.commit(region.capacity());
                if self.sweep_state() == SweepState::Sweeping {
                    region.mark_swept();
                }
                self.regions.push(region);
                true
            }
            None => false,
        }
    }

    /// Return an unused tail (e.g. a retired buffer) to the free list
    pub fn return_remainder(&mut self, span: Span) {
        if span.is_empty() {
            return;
        }
        self.allocator.free(span.begin(), span.len());
        self.counters.decrease_live(span.len());
    }

    pub fn sweep_state(&self) -> SweepState {
        self.sweep.state()
    }

    pub fn sweep_queues(&self) -> &Arc<SweepQueues> {
        &self.sweep
    }

    /// Begin a sweep cycle: live size becomes the marked bytes, the
    /// free list is dropped and every region outside the collect set
    /// is queued, least live first.
    pub fn prepare_sweeping(&mut self) {
        if !self.policy.sweeps {
            return;
        }
        debug_assert_ne!(self.sweep_state(), SweepState::Sweeping);
        let queued: Vec<Arc<Region>> = self
            .regions
            .iter()
            .filter(|r| !r.in_collect_set())
            .cloned()
            .collect();
        self.counters.live = queued.iter().map(|r| r.alive()).sum();
        for region in &queued {
            region.reset_wasted();
        }
        self.allocator.rebuild_free_list();
        debug!(
            "{} sweeping {} regions, {:#x} live",
            self.kind,
            queued.len(),
            self.counters.live
        );
        self.sweep.enqueue(queued);
        self.sweep.set_state(SweepState::Sweeping);
    }

    /// Drain the sweep queue on this thread. The main thread merges
    /// each region straight into the allocator; otherwise results go
    /// to the swept queue to be merged later.
    pub fn async_sweep(&mut self, is_main: bool) {
        if is_main {
            while let Some(region) = self.sweep.claim() {
                let swept = sweep_region(&region, self.sweep.model.as_ref());
                self.merge_swept(swept);
                self.sweep.complete(None);
            }
        } else {
            self.sweep.sweep_all();
        }
    }

    fn merge_swept(&mut self, swept: SweptRegion) {
        for gap in swept.free {
            self.allocator.free(gap.begin(), gap.len());
            if gap.len() < crate::memory::object::MIN_OBJECT_SIZE {
                swept.region.add_wasted(gap.len());
            }
        }
    }

    /// Merge everything in the swept queue; true if anything was
    pub fn fill_swept_region(&mut self) -> bool {
        let swept = self.sweep.take_swept();
        let any = !swept.is_empty();
        for region in swept {
            self.merge_swept(region);
        }
        any
    }

    /// Sweep whatever is left here, wait for background sweepers and
    /// merge all results
    pub fn finish_sweeping(&mut self) {
        if self.sweep_state() != SweepState::Sweeping {
            return;
        }
        self.async_sweep(true);
        self.sweep.wait_idle();
        self.fill_swept_region();
        self.sweep.set_state(SweepState::Swept);
        let released = self.release_empty_regions();
        debug!(
            "{} swept, {:#x} available, {} empty regions released",
            self.kind,
            self.allocator.available(),
            released
        );
    }

    /// Return to `NoSweep` ahead of the next marking cycle
    pub fn reset_sweep_state(&mut self) {
        self.finish_sweeping();
        for region in &self.regions {
            region.update_flags(|f| f.set_swept(false));
        }
        self.sweep.set_state(SweepState::NoSweep);
    }

    /// Add a region (with its free blocks) taken from elsewhere
    pub fn add_region(&mut self, region: Arc<Region>, free: &[Span]) {
        region.set_space(self.kind.flag());
        self.counters.commit(region.capacity());
        self.counters.increase_live(region.alive());
        self.allocator.attach(free);
        self.regions.push(region);
    }

    /// Take a region out of circulation, with its free blocks
    pub fn detach_region(&mut self, region: &Arc<Region>) -> Vec<Span> {
        self.regions.retain(|r| !Arc::ptr_eq(r, region));
        self.sweep.remove(region);
        self.counters.uncommit(region.capacity());
        self.counters.decrease_live(region.alive());
        self.allocator.detach_span(region.span())
    }

    /// Steal a whole region with a free block of at least `size`
    pub fn try_to_get_exclusive_region(&mut self, size: usize) -> Option<(Arc<Region>, Vec<Span>)> {
        if self.sweep_state() == SweepState::Sweeping {
            return None;
        }
        let addr = self.allocator.match_free_object_set(size)?;
        let region = self.regions.iter().find(|r| r.contains(addr))?.clone();
        let free = self.detach_region(&region);
        trace!("{} gave up {:?}", self.kind, region.span());
        Some((region, free))
    }

    /// Absorb every region and the live total of `local`, leaving it
    /// empty. Returns true if the result exceeds capacity.
    pub fn merge(&mut self, local: &mut FreeListSpace) -> bool {
        for region in local.regions.drain(..) {
            region.set_space(self.kind.flag());
            self.counters.commit(region.capacity());
            self.regions.push(region);
        }
        self.allocator.absorb(&mut local.allocator);
        self.counters.increase_live(local.counters.live);
        local.counters.committed = 0;
        local.counters.live = 0;

        let over = self.counters.committed > self.counters.capacity + self.counters.overshoot;
        if over {
            warn!(
                "{} merge: committed {:#x} exceeds capacity {:#x}",
                self.kind, self.counters.committed, self.counters.capacity
            );
        }
        over
    }

    /// Return every region that is entirely free to the mapping pool.
    /// Objects allocated while a sweep was in flight are neither
    /// marked nor counted alive, so emptiness is read off the free list.
    pub fn release_empty_regions(&mut self) -> usize {
        debug_assert_ne!(self.sweep_state(), SweepState::Sweeping);
        let allocator = &self.allocator;
        let empty: Vec<Arc<Region>> = self
            .regions
            .iter()
            .filter(|r| !r.in_collect_set() && allocator.free_bytes_in(r.span()) == r.capacity())
            .cloned()
            .collect();
        for region in &empty {
            self.detach_region(region);
            self.region_allocator.free_region(region);
        }
        empty.len()
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.regions.iter().any(|r| r.contains(addr))
    }

    /// Clear marks on every region ahead of a marking cycle
    pub fn clear_marks(&self) {
        for region in &self.regions {
            region.clear_marks();
        }
    }

    pub fn alloc_limit(&self) -> usize {
        self.alloc_limit
    }

    pub fn set_alloc_limit(&mut self, limit: usize) {
        self.alloc_limit = limit;
    }

    pub fn set_overshoot(&mut self, bytes: usize) {
        self.counters.overshoot = bytes;
    }

    pub fn increase_overshoot(&mut self, bytes: usize) {
        self.counters.increase_overshoot(bytes);
    }

    pub fn adjust_overshoot(&mut self) {
        self.counters.adjust_overshoot();
    }

    pub fn available(&self) -> usize {
        self.allocator.available()
    }

    pub fn code(&self) -> Option<&CodeSpaceAddOn> {
        self.code.as_ref()
    }

    pub fn code_mut(&mut self) -> Option<&mut CodeSpaceAddOn> {
        self.code.as_mut()
    }

    /// Free the bump area so the space is fully described by its free
    /// list
    pub fn flush(&mut self) {
        self.allocator.free_bump_remainder();
    }
}

impl Space for FreeListSpace {
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

impl Drop for FreeListSpace {
    fn drop(&mut self) {
        self.sweep.lists.lock().sweeping.clear();
        self.sweep.wait_idle();
        for region in self.regions.drain(..).chain(self.cset.regions.drain(..)) {
            self.region_allocator.free_region(&region);
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::memory::object::EncodedSizeModel;
    use crate::memory::pool::MemMapPool;

    pub const REGION: usize = 0x1_0000;

    pub fn space(kind: SpaceKind, capacity: usize) -> FreeListSpace {
        let regions = Arc::new(RegionAllocator::new(MemMapPool::new(REGION, 0, 8)));
        FreeListSpace::new(
            kind,
            SparsePolicy::old(),
            capacity,
            regions,
            Arc::new(EncodedSizeModel),
        )
    }

    /// Allocate an object of `size` and stamp its class
    pub fn object(space: &mut FreeListSpace, size: usize) -> Address {
        let addr = space.allocate(size).unwrap();
        EncodedSizeModel.install_class(addr, EncodedSizeModel::class(size));
        addr
    }

    /// Mark `addr` as a live object of `size` bytes
    pub fn keep(space: &FreeListSpace, addr: Address, size: usize) {
        let region = space.regions().iter().find(|r| r.contains(addr)).unwrap();
        if region.mark(addr) {
            region.increase_alive(size);
        }
    }

    #[test]
    pub fn test_expand_on_demand() {
        let mut s = space(SpaceKind::Old, 2 * REGION);
        assert_eq!(s.region_count(), 0);
        s.allocate(64).unwrap();
        assert_eq!(s.region_count(), 1);
        assert_eq!(s.live_size(), 64);
        assert!(s.verify_accounting().is_empty());
    }

    #[test]
    pub fn test_capacity_refuses_expansion() {
        let mut s = space(SpaceKind::Old, REGION);
        while s.allocate(0x1000).is_some() {}
        assert_eq!(s.region_count(), 1);
        // a miss leaves collecting to the heap
        assert!(s.allocate(0x1000).is_none());
        assert_eq!(s.sweep_state(), SweepState::NoSweep);
        assert!(!s.expand());
        s.increase_overshoot(REGION);
        assert!(s.expand());
    }

    #[test]
    pub fn test_sweep_reclaims_unmarked() {
        let mut s = space(SpaceKind::Old, 4 * REGION);
        let a = object(&mut s, 64);
        let b = object(&mut s, 64);
        let c = object(&mut s, 64);
        keep(&s, a, 64);
        keep(&s, c, 64);

        s.prepare_sweeping();
        assert_eq!(s.sweep_state(), SweepState::Sweeping);
        assert_eq!(s.live_size(), 128);
        s.async_sweep(true);
        s.finish_sweeping();
        assert_eq!(s.sweep_state(), SweepState::Swept);
        assert_eq!(s.available(), REGION - 128);

        // first fit lands on b's old slot
        let d = s.allocate(64).unwrap();
        assert_eq!(d, b);
        assert!(s.verify_accounting().is_empty());
    }

    #[test]
    pub fn test_background_sweep_merges_lazily() {
        let mut s = space(SpaceKind::Old, 4 * REGION);
        let a = object(&mut s, 128);
        keep(&s, a, 128);
        s.prepare_sweeping();

        let queues = s.sweep_queues().clone();
        std::thread::spawn(move || queues.sweep_all()).join().unwrap();
        assert_eq!(s.available(), 0);

        let b = s.allocate(64).unwrap();
        assert_eq!(b, a.offset(128));
        assert_eq!(s.region_count(), 1);
    }

    #[test]
    pub fn test_sweep_order_least_live_first() {
        let mut s = space(SpaceKind::Old, 4 * REGION);
        for _ in 0..3 {
            s.expand();
        }
        let regions: Vec<_> = s.regions().to_vec();
        regions[0].set_alive(0x800);
        regions[1].set_alive(0x100);
        regions[2].set_alive(0x400);
        s.prepare_sweeping();

        let queues = s.sweep_queues().clone();
        let mut order = Vec::new();
        while let Some(region) = queues.claim() {
            order.push(region.alive());
            queues.complete(Some(sweep_region(&region, &EncodedSizeModel)));
        }
        assert_eq!(order, vec![0x100, 0x400, 0x800]);
        s.finish_sweeping();
        assert_eq!(s.available(), 3 * REGION);
    }

    #[test]
    pub fn test_merge_local_space() {
        let mut old = space(SpaceKind::Old, 8 * REGION);
        let mut local = FreeListSpace::new(
            SpaceKind::Local,
            SparsePolicy::local(),
            8 * REGION,
            old.region_allocator.clone(),
            Arc::new(EncodedSizeModel),
        );
        object(&mut old, 64);
        object(&mut local, 256);
        object(&mut local, 256);
        assert_eq!(local.region_count(), 1);

        let over = old.merge(&mut local);
        assert!(!over);
        assert_eq!(local.region_count(), 0);
        assert_eq!(local.live_size(), 0);
        assert_eq!(local.committed_size(), 0);
        assert_eq!(old.region_count(), 2);
        assert_eq!(old.live_size(), 64 + 512);
        assert!(old.regions().iter().all(|r| r.space() == SpaceKind::Old.flag()));
        assert!(old.verify_accounting().is_empty());
    }

    #[test]
    pub fn test_exclusive_region() {
        let mut old = space(SpaceKind::Old, 8 * REGION);
        let a = object(&mut old, 0x1000);
        object(&mut old, 0x1000);
        old.flush();
        old.regions()[0].set_alive(0x1000);
        old.return_remainder(Span::new(a, 0x1000));

        let (region, free) = old.try_to_get_exclusive_region(0x800).unwrap();
        assert!(region.contains(a));
        assert!(free.iter().any(|s| s.begin() == a));
        assert_eq!(old.region_count(), 0);
        assert_eq!(old.committed_size(), 0);
        old.region_allocator.free_region(&region);
    }

    #[test]
    pub fn test_release_empty_regions() {
        let mut s = space(SpaceKind::Old, 4 * REGION);
        s.expand();
        s.expand();
        let keep_me = object(&mut s, 64);
        keep(&s, keep_me, 64);
        s.prepare_sweeping();
        s.finish_sweeping();
        assert_eq!(s.region_count(), 1);
        assert_eq!(s.release_empty_regions(), 0);
        assert!(s.verify_accounting().is_empty());
    }

    #[test]
    pub fn test_regions_filled_mid_sweep_are_kept() {
        let mut s = space(SpaceKind::Old, 4 * REGION);
        s.prepare_sweeping();
        assert!(s.expand());
        let a = s.try_allocate(64).unwrap();
        s.finish_sweeping();
        assert_eq!(s.region_count(), 1);
        assert!(s.contains(a));
        assert_eq!(s.live_size(), 64);
    }

    #[test]
    pub fn test_background_sweep_releases_empty_regions() {
        let mut s = space(SpaceKind::Old, 4 * REGION);
        s.expand();
        s.expand();
        let keep_me = object(&mut s, 64);
        keep(&s, keep_me, 64);
        s.prepare_sweeping();

        let queues = s.sweep_queues().clone();
        std::thread::spawn(move || queues.sweep_all()).join().unwrap();
        assert_eq!(s.region_count(), 2);
        s.reset_sweep_state();
        assert_eq!(s.region_count(), 1);
        assert!(s.contains(keep_me));
        assert!(s.verify_accounting().is_empty());
    }
}
