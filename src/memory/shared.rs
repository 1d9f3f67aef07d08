//! The shared heap
//!
//! Objects reachable from several execution contexts live in the
//! shared spaces. Each context is a [`Heap`] attached with
//! [`SharedHeap::attach`]; it allocates shared old objects through a
//! thread-local allocation buffer carved from the shared old space.
//!
//! Shared collections run on the daemon thread with every context
//! suspended at a safepoint. Roots are the contexts' tracers, the
//! local-to-shared remembered slots of every local region and the
//! objects of the shared immortal spaces.

use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::Mutex;

use super::address::{Address, Span};
use super::daemon::{Collector, Daemon};
use super::evacuate::Evacuation;
use super::heap::{fatal_out_of_memory, Heap, SharedLink};
use super::mark::{clear_remembered, remembered_slots, Marker, Tracer, Tracers};
use super::object::{alloc_size_of, ClassRef, ObjectModel};
use super::pool::{MemMapPool, RegionAllocator};
use super::region::{Region, RememberedSetKind, SpaceFlags};
use super::safepoint::{ContextId, ContextRegistry, RunningScope};
use super::space::cset::CollectSetParams;
use super::space::huge::HugeObjectSpace;
use super::space::linear::{BumpSpace, LinearPolicy};
use super::space::sparse::{FreeListSpace, SparsePolicy};
use super::space::{Space, SpaceKind};
use super::stats::{GcStats, HeapStats, MemController, SpaceStats, MIN_OLD_SPACE_LIMIT};
use super::sweeper::SweeperPool;
use super::tlab::ThreadLocalAllocationBuffer;
use super::trigger::{GcReason, TriggerGCType};
use crate::config::HeapConfig;
use crate::error::{ConfigError, HeapError};

/// The shared space an allocation is served from
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SharedTarget {
    Old,
    NonMovable,
    Huge,
    ReadOnly,
}

impl SharedTarget {
    pub fn kind(self) -> SpaceKind {
        match self {
            SharedTarget::Old => SpaceKind::SharedOld,
            SharedTarget::NonMovable => SpaceKind::SharedNonMovable,
            SharedTarget::Huge => SpaceKind::SharedHuge,
            SharedTarget::ReadOnly => SpaceKind::SharedReadOnly,
        }
    }
}

struct SharedSpaces {
    old: FreeListSpace,
    non_movable: FreeListSpace,
    huge: HugeObjectSpace,
    read_only: BumpSpace,
    app_spawn: FreeListSpace,
    controller: MemController,
    gc_stats: GcStats,
    live_after_gc: usize,
}

impl SharedSpaces {
    fn new(config: &HeapConfig, model: &Arc<dyn ObjectModel>, regions: &Arc<RegionAllocator>) -> Self {
        let capacity = config.shared_old_capacity();
        SharedSpaces {
            old: FreeListSpace::new(
                SpaceKind::SharedOld,
                SparsePolicy::old(),
                capacity,
                regions.clone(),
                model.clone(),
            ),
            non_movable: FreeListSpace::new(
                SpaceKind::SharedNonMovable,
                SparsePolicy::non_movable(),
                config.shared_non_movable_capacity,
                regions.clone(),
                model.clone(),
            ),
            huge: HugeObjectSpace::new(
                SpaceKind::SharedHuge,
                capacity,
                config.huge_full_mark_ratio,
                regions.clone(),
            ),
            read_only: BumpSpace::new(
                SpaceKind::SharedReadOnly,
                LinearPolicy::read_only(),
                config.read_only_capacity,
                config.read_only_capacity,
                regions.clone(),
            ),
            app_spawn: FreeListSpace::new(
                SpaceKind::SharedAppSpawn,
                SparsePolicy::app_spawn(),
                capacity,
                regions.clone(),
                model.clone(),
            ),
            controller: MemController::new(),
            gc_stats: GcStats::default(),
            live_after_gc: 0,
        }
    }

    fn all(&self) -> Vec<&dyn Space> {
        vec![
            &self.old as &dyn Space,
            &self.non_movable,
            &self.huge,
            &self.read_only,
            &self.app_spawn,
        ]
    }

    fn live(&self) -> usize {
        self.all().iter().map(|s| s.live_size()).sum()
    }

    fn old_live(&self) -> usize {
        self.old.live_size() + self.huge.live_size()
    }

    /// Regions a shared collection may mark and reclaim
    fn collected_regions(&self) -> Vec<Arc<Region>> {
        let mut regions = Vec::new();
        for space in [&self.old as &dyn Space, &self.non_movable, &self.huge] {
            regions.extend(space.regions().iter().cloned());
        }
        regions
    }

    fn immortal_objects(&self, model: &dyn ObjectModel) -> Vec<Address> {
        let mut objects = Vec::new();
        self.read_only.for_each_object(model, |obj, _| {
            if !unsafe { ClassRef::of(obj) }.is_internal() {
                objects.push(obj);
            }
        });
        for region in self.app_spawn.regions() {
            objects.extend(region.marked_objects());
        }
        objects
    }

    fn try_allocate(&mut self, target: SharedTarget, size: usize) -> Option<Address> {
        match target {
            SharedTarget::Old => self.old.allocate(size),
            SharedTarget::NonMovable => self.non_movable.allocate(size),
            SharedTarget::Huge => self.huge.allocate(size),
            SharedTarget::ReadOnly => self.read_only.allocate(size, false),
        }
    }

    fn overshoot(&self, target: SharedTarget) -> usize {
        match target {
            SharedTarget::Old => self.old.overshoot(),
            SharedTarget::NonMovable => self.non_movable.overshoot(),
            SharedTarget::Huge => self.huge.overshoot(),
            SharedTarget::ReadOnly => self.read_only.overshoot(),
        }
    }

    fn increase_overshoot(&mut self, target: SharedTarget, bytes: usize) {
        match target {
            SharedTarget::Old => self.old.increase_overshoot(bytes),
            SharedTarget::NonMovable => self.non_movable.increase_overshoot(bytes),
            SharedTarget::Huge => self.huge.increase_overshoot(bytes),
            SharedTarget::ReadOnly => self.read_only.increase_overshoot(bytes),
        }
    }

    fn adjust_overshoot(&mut self) {
        self.old.adjust_overshoot();
        self.non_movable.adjust_overshoot();
        self.huge.adjust_overshoot();
        self.read_only.adjust_overshoot();
    }
}

/// State shared between the [`SharedHeap`] handle, the attached heaps
/// and the daemon thread
pub struct SharedCore {
    config: HeapConfig,
    model: Arc<dyn ObjectModel>,
    regions: Arc<RegionAllocator>,
    spaces: Mutex<SharedSpaces>,
    contexts: Arc<ContextRegistry>,
    sweepers: Arc<SweeperPool>,
    daemon: Option<Daemon>,
}

impl SharedCore {
    pub(crate) fn contexts(&self) -> &Arc<ContextRegistry> {
        &self.contexts
    }

    pub(crate) fn model(&self) -> &Arc<dyn ObjectModel> {
        &self.model
    }

    /// Zeroed shared memory for `size` bytes on behalf of context `id`
    pub(crate) fn allocate_block(
        &self,
        id: ContextId,
        tlab: &Mutex<ThreadLocalAllocationBuffer>,
        target: SharedTarget,
        size: usize,
    ) -> Result<Address, HeapError> {
        let max_regular = self.config.max_regular_object_size();
        let max = match target {
            SharedTarget::ReadOnly => max_regular,
            _ => self.config.shared_old_capacity(),
        };
        if size == 0 || size > max {
            return Err(HeapError::InvalidSize { size, max });
        }
        let size = alloc_size_of(size);
        let target = match target {
            SharedTarget::Old | SharedTarget::NonMovable if size > max_regular => SharedTarget::Huge,
            target => target,
        };

        let scope = RunningScope::enter(self.contexts.clone(), id);
        scope.safepoint();
        if matches!(target, SharedTarget::Old | SharedTarget::Huge) {
            self.check_and_trigger(size);
        }
        let addr = self.allocate_with_retry(id, tlab, target, size)?;
        unsafe { addr.zero(size) };
        Ok(addr)
    }

    fn allocate_with_retry(
        &self,
        id: ContextId,
        tlab: &Mutex<ThreadLocalAllocationBuffer>,
        target: SharedTarget,
        size: usize,
    ) -> Result<Address, HeapError> {
        if let Some(addr) = self.try_allocate(tlab, target, size) {
            return Ok(addr);
        }
        if target != SharedTarget::ReadOnly {
            for kind in [TriggerGCType::SharedGc, TriggerGCType::SharedFullGc] {
                self.collect_from(Some(id), kind, GcReason::AllocationFailed);
                if let Some(addr) = self.try_allocate(tlab, target, size) {
                    return Ok(addr);
                }
            }
        }

        let granted = {
            let mut spaces = self.spaces.lock();
            let current = spaces.overshoot(target);
            let grant = self.config.oom_overshoot_size;
            if current < grant {
                spaces.increase_overshoot(target, grant - current);
                true
            } else {
                false
            }
        };
        if granted {
            if let Some(addr) = self.try_allocate(tlab, target, size) {
                warn!(
                    "{} allocated {:#x} bytes into its out-of-memory overshoot",
                    target.kind(),
                    size
                );
                return Ok(addr);
            }
        }
        warn!("out of memory allocating {:#x} bytes in {}", size, target.kind());
        Err(HeapError::out_of_memory(size, target.kind()))
    }

    /// Serve small shared old requests from the context's buffer,
    /// refilling it from the shared old space
    fn try_allocate(
        &self,
        tlab: &Mutex<ThreadLocalAllocationBuffer>,
        target: SharedTarget,
        size: usize,
    ) -> Option<Address> {
        if target != SharedTarget::Old {
            return self.spaces.lock().try_allocate(target, size);
        }
        let mut tlab = tlab.lock();
        if !tlab.serves(size) {
            return self.spaces.lock().old.allocate(size);
        }
        if let Some(addr) = tlab.allocate(size) {
            return Some(addr);
        }

        let mut spaces = self.spaces.lock();
        spaces.old.return_remainder(tlab.retire());
        let chunk_size = tlab.chunk_size();
        if let Some(chunk) = spaces.old.allocate(chunk_size) {
            match tlab.refill(Span::new(chunk, chunk_size)) {
                Ok(()) => {
                    if let Some(addr) = tlab.allocate(size) {
                        return Some(addr);
                    }
                }
                Err(chunk) => spaces.old.return_remainder(chunk),
            }
        }
        spaces.old.allocate(size)
    }

    /// Post a background shared collection once the old allocation
    /// limit is crossed
    fn check_and_trigger(&self, size: usize) {
        let over = {
            let spaces = self.spaces.lock();
            spaces.old_live() + size > spaces.old.alloc_limit()
        };
        if !over {
            return;
        }
        if let Some(daemon) = &self.daemon {
            if !daemon.is_busy() {
                debug!("shared old limit crossed, posting a shared collection");
                daemon.post_collect(TriggerGCType::SharedGc, GcReason::AllocationLimit);
            }
        }
    }

    /// Run a shared collection on the daemon and wait for it. A
    /// requesting context is parked while it waits.
    pub(crate) fn collect_from(&self, id: Option<ContextId>, kind: TriggerGCType, reason: GcReason) {
        if !kind.is_shared() {
            warn!("{} collection requested of the shared heap", kind);
            return;
        }
        match &self.daemon {
            Some(daemon) if daemon.is_daemon_thread() => self.collect(kind, reason),
            Some(daemon) => {
                let ticket = daemon.post_collect(kind, reason);
                match id {
                    Some(id) => self
                        .contexts
                        .parked(id, || daemon.wait_gc_finished(ticket)),
                    None => daemon.wait_gc_finished(ticket),
                }
            }
            None => self.collect(kind, reason),
        }
    }

    /// Give back the unused part of a context's buffer
    pub(crate) fn retire_tlab(&self, tlab: &Mutex<ThreadLocalAllocationBuffer>) {
        let rest = tlab.lock().retire();
        self.spaces.lock().old.return_remainder(rest);
    }

    fn retire_all_tlabs(&self) {
        for tlab in self.contexts.tlabs() {
            self.retire_tlab(&tlab);
        }
    }

    /// The collection proper; every context is suspended throughout
    fn shared_gc(&self, kind: TriggerGCType, reason: GcReason) {
        self.contexts.suspend_all(None);
        self.retire_all_tlabs();

        let mut guard = self.spaces.lock();
        let spaces = &mut *guard;
        let live_before = spaces.live();
        let allocated = live_before.saturating_sub(spaces.live_after_gc);
        spaces.controller.start_collection(allocated);
        debug!("{} collection starting ({}), {:#x} live", kind, reason, live_before);
        spaces.old.reset_sweep_state();
        spaces.non_movable.reset_sweep_state();

        let regions = self.regions.clone();
        let model = self.model.clone();
        let tracers = Tracers(self.contexts.tracers());
        let holders = SpaceFlags::all() - SpaceFlags::SHARED;

        for region in spaces.collected_regions() {
            region.clear_marks();
        }
        let immortal = spaces.immortal_objects(model.as_ref());
        let marked_bytes = {
            let mut marker = Marker::new(&regions, model.as_ref(), SpaceFlags::SHARED - SpaceFlags::IMMORTAL);
            marker.mark_roots(&tracers);
            marker.mark_remembered(RememberedSetKind::LocalToShare, holders);
            for obj in &immortal {
                marker.scan(*obj);
            }
            marker.drain();
            marker.marked_bytes()
        };

        if kind != TriggerGCType::SharedGc {
            self.evacuate(spaces, kind, &tracers, &immortal);
        }
        spaces.huge.sweep();
        for space in [&mut spaces.old, &mut spaces.non_movable] {
            space.prepare_sweeping();
            if !(self.config.concurrent_sweep && self.sweepers.post(space.sweep_queues())) {
                space.finish_sweeping();
            }
        }
        if kind == TriggerGCType::SharedFullGc && reason == GcReason::AppSpawn {
            Self::move_old_to_app_spawn(spaces);
        }
        spaces.huge.reclaim_huge_regions();
        spaces.huge.clear_full_mark_request();
        spaces.adjust_overshoot();
        self.recompute_limits(spaces);

        let live_after = spaces.live();
        let freed = live_before.saturating_sub(live_after);
        let pause = spaces.controller.stop_collection(live_after);
        spaces.gc_stats.record(kind, pause, freed);
        spaces.live_after_gc = live_after;
        drop(guard);
        self.contexts.resume_all();
        info!(
            "{} collection ({}) took {:?}: marked {:#x}, {:#x} live, {:#x} freed",
            kind, reason, pause, marked_bytes, live_after, freed
        );
    }

    /// Move the marked objects of sparse shared old regions (all of
    /// them when compacting) and fix every slot that may refer to them
    fn evacuate(&self, spaces: &mut SharedSpaces, kind: TriggerGCType, tracers: &Tracers, immortal: &[Address]) {
        let selected = if kind.is_full() {
            spaces.old.select_all_for_compaction()
        } else {
            let alive: usize = spaces.old.regions().iter().map(|r| r.alive()).sum();
            let params = CollectSetParams {
                in_background: false,
                foreground_budget: self.config.evacuation_budget_foreground,
                background_budget: self.config.evacuation_budget_background,
                min_regions: self.config.cset_min_regions,
                expected_free: spaces.old.committed_size().saturating_sub(alive),
            };
            spaces.old.select_cset(&params)
        };
        if selected == 0 {
            return;
        }

        let cset = spaces.old.collect_set().regions().to_vec();
        let mut local = FreeListSpace::new(
            SpaceKind::SharedLocal,
            SparsePolicy::local(),
            usize::MAX / 4,
            self.regions.clone(),
            self.model.clone(),
        );
        let tracer: &dyn Tracer = tracers;
        let mut evacuation = Evacuation::new(&self.regions, self.model.as_ref(), Some(tracer));
        for region in &cset {
            if let Err(size) = evacuation.evacuate_region(region, |_, _, size| local.allocate(size)) {
                fatal_out_of_memory(size, SpaceKind::SharedLocal);
            }
        }

        let holders = SpaceFlags::all() - SpaceFlags::SHARED;
        let slots = remembered_slots(&self.regions, RememberedSetKind::LocalToShare, holders);
        clear_remembered(&self.regions, RememberedSetKind::LocalToShare, holders);
        for slot in slots {
            evacuation.fixup_slot(slot);
        }
        evacuation.fixup_roots(tracer);
        for region in spaces.collected_regions() {
            evacuation.fixup_region(&region);
        }
        for obj in immortal {
            evacuation.fixup_object(*obj);
        }
        evacuation.fixup_copies();
        let copied = evacuation.copied_bytes();
        drop(evacuation);

        spaces.old.reclaim_cset();
        if spaces.old.merge(&mut local) {
            warn!("{} over capacity after evacuation", SpaceKind::SharedOld);
        }
        spaces.gc_stats.record_evacuation(copied, 0, selected);
        debug!("{} bytes evacuated from {} shared regions", copied, selected);
    }

    fn move_old_to_app_spawn(spaces: &mut SharedSpaces) {
        spaces.old.finish_sweeping();
        let moved = spaces.old.regions().to_vec();
        for region in &moved {
            let free = spaces.old.detach_region(region);
            spaces.app_spawn.add_region(region.clone(), &free);
        }
        info!("{} shared regions moved to {}", moved.len(), SpaceKind::SharedAppSpawn);
    }

    fn recompute_limits(&self, spaces: &mut SharedSpaces) {
        let factor = MemController::calculate_growing_factor(
            spaces.controller.gc_speed_per_ms(),
            spaces.controller.allocation_speed_per_ms(),
        );
        let limit = MemController::calculate_alloc_limit(
            spaces.old_live(),
            MIN_OLD_SPACE_LIMIT,
            self.config.shared_old_capacity(),
            0,
            factor,
        );
        spaces.old.set_alloc_limit(limit);
        debug!("shared old limit {:#x}", limit);
    }
}

impl Collector for SharedCore {
    fn collect(&self, kind: TriggerGCType, reason: GcReason) {
        self.shared_gc(kind, reason);
    }
}

/// The heap of objects shared between execution contexts
///
/// Cheap to clone; every clone and every attached [`Heap`] refers to
/// the same spaces.
#[derive(Clone)]
pub struct SharedHeap {
    core: Arc<SharedCore>,
}

impl SharedHeap {
    /// Create the shared heap and start its collector thread
    pub fn new(config: HeapConfig, model: Arc<dyn ObjectModel>) -> Result<SharedHeap, ConfigError> {
        config.validate()?;
        let regions = Arc::new(RegionAllocator::new(MemMapPool::new(
            config.region_size,
            config.map_pool_capacity,
            config.regular_cache_limit,
        )));
        let threads = if config.concurrent_sweep {
            config.sweeper_threads
        } else {
            0
        };
        let sweepers = Arc::new(SweeperPool::new(threads));
        let spaces = SharedSpaces::new(&config, &model, &regions);

        let mut spawn_error = None;
        let core = Arc::new_cyclic(|weak: &Weak<SharedCore>| {
            let daemon = match Daemon::start(weak.clone()) {
                Ok(daemon) => Some(daemon),
                Err(e) => {
                    spawn_error = Some(e);
                    None
                }
            };
            SharedCore {
                config,
                model,
                regions,
                spaces: Mutex::new(spaces),
                contexts: Arc::new(ContextRegistry::new()),
                sweepers,
                daemon,
            }
        });
        if let Some(e) = spawn_error {
            return Err(ConfigError::Io(e));
        }
        info!(
            "shared heap created: {:#x} old capacity",
            core.config.shared_old_capacity()
        );
        Ok(SharedHeap { core })
    }

    /// Create a heap for a new execution context. It shares this
    /// heap's regions and sweepers and can allocate shared objects.
    pub fn attach(&self, config: HeapConfig) -> Result<Heap, ConfigError> {
        config.validate()?;
        if config.region_size != self.core.config.region_size {
            return Err(ConfigError::RegionSizeMismatch {
                heap: config.region_size,
                shared: self.core.config.region_size,
            });
        }
        let (id, tlab) = self.core.contexts.register(self.core.config.tlab_size);
        let link = SharedLink {
            core: self.core.clone(),
            id,
            tlab,
        };
        Ok(Heap::with_parts(
            config,
            self.core.model().clone(),
            self.core.regions.clone(),
            self.core.sweepers.clone(),
            Some(link),
        ))
    }

    pub fn config(&self) -> &HeapConfig {
        &self.core.config
    }

    /// Number of attached contexts
    pub fn context_count(&self) -> usize {
        self.core.contexts.len()
    }

    /// Collect the shared heap from outside any context, waiting for
    /// the collection to finish
    pub fn collect_garbage(&self, kind: TriggerGCType, reason: GcReason) {
        self.core.collect_from(None, kind, reason);
    }

    /// Compact the shared old space and move it to the shared app
    /// spawn space ahead of a fork
    pub fn compact_before_fork(&self) {
        self.collect_garbage(TriggerGCType::SharedFullGc, GcReason::AppSpawn);
    }

    /// Write protect the shared read-only space
    pub fn freeze_read_only(&self) -> bool {
        let mut spaces = self.core.spaces.lock();
        let protected = spaces.read_only.protect(true);
        info!("{} frozen", SpaceKind::SharedReadOnly);
        protected
    }

    /// The space whose region holds `addr`, shared or not
    pub fn space_of(&self, addr: Address) -> Option<SpaceKind> {
        self.core
            .regions
            .region_of(addr)
            .and_then(|r| SpaceKind::from_flags(r.space()))
    }

    pub fn stats(&self) -> HeapStats {
        let spaces = self.core.spaces.lock();
        HeapStats {
            spaces: spaces.all().into_iter().map(SpaceStats::of).collect(),
            gc: spaces.gc_stats.clone(),
            old_alloc_limit: spaces.old.alloc_limit(),
            global_alloc_limit: self.core.config.shared_old_capacity(),
        }
    }

    /// Accounting problems in the shared spaces
    pub fn verify(&self) -> Vec<String> {
        let spaces = self.core.spaces.lock();
        spaces
            .all()
            .into_iter()
            .flat_map(|s| s.verify_accounting())
            .collect()
    }
}
