//! The per-context heap
//!
//! A [`Heap`] owns one instance of every local space and drives their
//! collection. Allocation picks the space from the request (young,
//! old, non-movable, machine code, read-only, snapshot) and diverts
//! anything above the regular object limit to a huge object space. A
//! miss runs the retry ladder:
//!
//! 1. try the space;
//! 2. collect (young or eden for young requests, old otherwise), retry;
//! 3. collect fully, retry;
//! 4. grant the space an out-of-memory overshoot, retry;
//! 5. fail with [`HeapError::OutOfMemory`], or abort the process if the
//!    runtime is still bootstrapping.
//!
//! Young collections evacuate the reachable young objects into the
//! other semi space, promoting those that already survived once into
//! the old space. Old collections mark every local space, evacuate the
//! young generation plus a collect set of sparse old regions, then
//! sweep the free list spaces (in the background when sweeper threads
//! are configured). Objects in the never-collected spaces (read-only,
//! snapshot and app spawn) act as roots.
//!
//! A heap attached to a [`SharedHeap`](super::shared::SharedHeap) is an
//! execution context: it may allocate shared objects and is suspended
//! at safepoints while the shared heap is collected.

use std::mem;
use std::process;
use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

use super::address::{Address, Span};
use super::evacuate::Evacuation;
use super::mark::{
    clear_remembered_in, object_region, remember_slot, remembered_slots_in, Marker, RegionSet,
    Tracer,
};
use super::object::{alloc_size_of, write_raw, ClassRef, ObjectModel, Slot, MIN_OBJECT_SIZE};
use super::pool::{MemMapPool, RegionAllocator};
use super::region::{Region, RememberedSetKind, SpaceFlags};
use super::safepoint::{ContextId, RunningScope};
use super::shared::{SharedCore, SharedTarget};
use super::space::code::{CodeFort, CodeSpaceAddOn};
use super::space::cset::CollectSetParams;
use super::space::huge::HugeObjectSpace;
use super::space::linear::{BumpSpace, LinearPolicy};
use super::space::sparse::{FreeListSpace, SparsePolicy};
use super::space::{Space, SpaceKind};
use super::stats::{
    GcStats, HeapStats, MemController, SpaceStats, MIN_HEAP_LIMIT, MIN_OLD_SPACE_LIMIT,
};
use super::sweeper::SweeperPool;
use super::tlab::ThreadLocalAllocationBuffer;
use super::trigger::{GcReason, TriggerGCType};
use crate::config::HeapConfig;
use crate::error::{ConfigError, HeapError};

/// Old live size below this fraction of committed asks for a full mark
const FRAGMENTED_LIVE_RATIO: f64 = 0.2;

/// Log and abort: an allocation that may not fail has failed
pub fn fatal_out_of_memory(size: usize, space: SpaceKind) -> ! {
    error!(
        "fatal: cannot allocate {} bytes in {} and no recovery is possible",
        size, space
    );
    process::abort()
}

/// A code object and the range holding its instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineCode {
    pub object: Address,
    pub instructions: Span,
}

/// Where an allocation request is served
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Target {
    Young,
    Old,
    NonMovable,
    MachineCode,
    Huge,
    HugeMachineCode,
    ReadOnly,
    Snapshot,
}

impl Target {
    fn kind(self) -> SpaceKind {
        match self {
            Target::Young => SpaceKind::Semi,
            Target::Old => SpaceKind::Old,
            Target::NonMovable => SpaceKind::NonMovable,
            Target::MachineCode => SpaceKind::MachineCode,
            Target::Huge => SpaceKind::Huge,
            Target::HugeMachineCode => SpaceKind::HugeMachineCode,
            Target::ReadOnly => SpaceKind::ReadOnly,
            Target::Snapshot => SpaceKind::Snapshot,
        }
    }

    /// Where requests too large for a regular region go instead
    fn huge(self) -> Option<Target> {
        match self {
            Target::Young | Target::Old | Target::NonMovable | Target::Huge => Some(Target::Huge),
            Target::MachineCode | Target::HugeMachineCode => Some(Target::HugeMachineCode),
            Target::ReadOnly | Target::Snapshot => None,
        }
    }

    /// Collection cannot free anything in the space
    fn is_immortal(self) -> bool {
        matches!(self, Target::ReadOnly | Target::Snapshot)
    }
}

/// An attached heap's link to the shared heap
pub(crate) struct SharedLink {
    pub(crate) core: Arc<SharedCore>,
    pub(crate) id: ContextId,
    pub(crate) tlab: Arc<Mutex<ThreadLocalAllocationBuffer>>,
}

/// Every local space of a heap
struct LocalSpaces {
    eden: Option<BumpSpace>,
    active_semi: BumpSpace,
    inactive_semi: BumpSpace,
    old: FreeListSpace,
    non_movable: FreeListSpace,
    machine_code: FreeListSpace,
    read_only: BumpSpace,
    snapshot: BumpSpace,
    app_spawn: FreeListSpace,
    huge: HugeObjectSpace,
    huge_machine_code: HugeObjectSpace,
}

impl LocalSpaces {
    fn new(config: &HeapConfig, model: &Arc<dyn ObjectModel>, regions: &Arc<RegionAllocator>) -> Self {
        let eden = if config.eden_enabled {
            let eden = BumpSpace::eden(config.eden_regions, regions.clone());
            if eden.is_none() {
                warn!("could not reserve {} eden regions, running without eden", config.eden_regions);
            }
            eden
        } else {
            None
        };
        let fort = if config.code_fort_enabled {
            let fort = CodeFort::reserve(config.code_fort_size, regions.clone());
            if fort.is_none() {
                warn!("could not reserve the code fort, instructions stay inline");
            }
            fort
        } else {
            None
        };
        let semi = |kind| {
            BumpSpace::new(
                kind,
                LinearPolicy::semi(config.semi_space_step_overshoot),
                config.semi_space_min,
                config.semi_space_max,
                regions.clone(),
            )
        };
        let old_capacity = config.old_space_capacity();
        let sparse = |kind, policy, capacity| {
            FreeListSpace::new(kind, policy, capacity, regions.clone(), model.clone())
        };

        LocalSpaces {
            eden,
            active_semi: semi(SpaceKind::Semi),
            inactive_semi: semi(SpaceKind::Semi),
            old: sparse(SpaceKind::Old, SparsePolicy::old(), old_capacity),
            non_movable: sparse(
                SpaceKind::NonMovable,
                SparsePolicy::non_movable(),
                config.non_movable_capacity,
            ),
            machine_code: sparse(
                SpaceKind::MachineCode,
                SparsePolicy::machine_code(),
                config.machine_code_capacity,
            )
            .with_code(CodeSpaceAddOn::new(fort)),
            read_only: BumpSpace::new(
                SpaceKind::ReadOnly,
                LinearPolicy::read_only(),
                config.read_only_capacity,
                config.read_only_capacity,
                regions.clone(),
            ),
            snapshot: BumpSpace::new(
                SpaceKind::Snapshot,
                LinearPolicy::snapshot(),
                config.snapshot_capacity,
                config.snapshot_capacity,
                regions.clone(),
            ),
            app_spawn: sparse(SpaceKind::AppSpawn, SparsePolicy::app_spawn(), old_capacity),
            huge: HugeObjectSpace::new(
                SpaceKind::Huge,
                old_capacity,
                config.huge_full_mark_ratio,
                regions.clone(),
            ),
            huge_machine_code: HugeObjectSpace::new(
                SpaceKind::HugeMachineCode,
                config.machine_code_capacity,
                config.huge_full_mark_ratio,
                regions.clone(),
            ),
        }
    }

    /// Spaces with no capacity and no reservations, standing in for
    /// released ones
    fn empty(model: &Arc<dyn ObjectModel>, regions: &Arc<RegionAllocator>) -> Self {
        let bump = |kind, policy| BumpSpace::new(kind, policy, 0, 0, regions.clone());
        let sparse = |kind, policy| FreeListSpace::new(kind, policy, 0, regions.clone(), model.clone());
        LocalSpaces {
            eden: None,
            active_semi: bump(SpaceKind::Semi, LinearPolicy::semi(0)),
            inactive_semi: bump(SpaceKind::Semi, LinearPolicy::semi(0)),
            old: sparse(SpaceKind::Old, SparsePolicy::old()),
            non_movable: sparse(SpaceKind::NonMovable, SparsePolicy::non_movable()),
            machine_code: sparse(SpaceKind::MachineCode, SparsePolicy::machine_code()),
            read_only: bump(SpaceKind::ReadOnly, LinearPolicy::read_only()),
            snapshot: bump(SpaceKind::Snapshot, LinearPolicy::snapshot()),
            app_spawn: sparse(SpaceKind::AppSpawn, SparsePolicy::app_spawn()),
            huge: HugeObjectSpace::new(SpaceKind::Huge, 0, 1.0, regions.clone()),
            huge_machine_code: HugeObjectSpace::new(SpaceKind::HugeMachineCode, 0, 1.0, regions.clone()),
        }
    }

    fn all(&self) -> Vec<&dyn Space> {
        let mut spaces: Vec<&dyn Space> = Vec::with_capacity(11);
        if let Some(eden) = &self.eden {
            spaces.push(eden);
        }
        spaces.push(&self.active_semi);
        spaces.push(&self.inactive_semi);
        spaces.push(&self.old);
        spaces.push(&self.non_movable);
        spaces.push(&self.machine_code);
        spaces.push(&self.read_only);
        spaces.push(&self.snapshot);
        spaces.push(&self.app_spawn);
        spaces.push(&self.huge);
        spaces.push(&self.huge_machine_code);
        spaces
    }

    fn eden_regions(&self) -> Vec<Arc<Region>> {
        self.eden
            .as_ref()
            .map(|e| e.regions().to_vec())
            .unwrap_or_default()
    }

    /// Eden and the semi space being allocated from
    fn young_regions(&self) -> Vec<Arc<Region>> {
        let mut regions = self.eden_regions();
        regions.extend(self.active_semi.regions().iter().cloned());
        regions
    }

    /// Regions a local collection may mark, move or reclaim
    fn collected_regions(&self) -> Vec<Arc<Region>> {
        let mut regions = self.young_regions();
        for space in [
            &self.inactive_semi as &dyn Space,
            &self.old,
            &self.non_movable,
            &self.machine_code,
            &self.huge,
            &self.huge_machine_code,
        ] {
            regions.extend(space.regions().iter().cloned());
        }
        regions
    }

    /// Non-collected regions whose surviving objects need their slots
    /// fixed after evacuation
    fn survivor_regions(&self) -> Vec<Arc<Region>> {
        let mut regions = Vec::new();
        for space in [
            &self.old as &dyn Space,
            &self.non_movable,
            &self.machine_code,
            &self.huge,
            &self.huge_machine_code,
        ] {
            regions.extend(space.regions().iter().cloned());
        }
        regions
    }

    /// Every region that may hold old-to-new slots
    fn old_generation_regions(&self) -> Vec<Arc<Region>> {
        let mut regions = self.survivor_regions();
        for space in [&self.read_only as &dyn Space, &self.snapshot, &self.app_spawn] {
            regions.extend(space.regions().iter().cloned());
        }
        regions
    }

    /// Objects of the never-collected spaces
    fn immortal_objects(&self, model: &dyn ObjectModel) -> Vec<Address> {
        let mut objects = Vec::new();
        for space in [&self.read_only, &self.snapshot] {
            space.for_each_object(model, |obj, _| {
                if !unsafe { ClassRef::of(obj) }.is_internal() {
                    objects.push(obj);
                }
            });
        }
        for region in self.app_spawn.regions() {
            objects.extend(region.marked_objects());
        }
        objects
    }

    fn swept_spaces_mut(&mut self) -> [&mut FreeListSpace; 3] {
        [&mut self.old, &mut self.non_movable, &mut self.machine_code]
    }

    fn young_allocated_since_gc(&self) -> usize {
        self.active_semi.allocated_since_gc() + self.eden.as_ref().map(|e| e.live_size()).unwrap_or(0)
    }

    fn young_live(&self) -> usize {
        self.active_semi.live_size() + self.eden.as_ref().map(|e| e.live_size()).unwrap_or(0)
    }

    fn young_capacity(&self) -> usize {
        match &self.eden {
            Some(eden) => eden.capacity(),
            None => self.active_semi.capacity(),
        }
    }

    fn live(&self) -> usize {
        self.all().iter().map(|s| s.live_size()).sum()
    }
}

/// Evacuate the marked objects of young regions: those that already
/// survived a collection go to `local`, the rest to `to_space` with
/// `local` taking any overflow. Returns the bytes promoted.
fn evacuate_young(
    evacuation: &mut Evacuation,
    from: &[Arc<Region>],
    to_space: &mut BumpSpace,
    local: &mut FreeListSpace,
) -> usize {
    let mut promoted = 0;
    for region in from {
        let result = evacuation.evacuate_region(region, |r, obj, size| {
            if !r.is_aged(obj) {
                if let Some(to) = to_space.allocate(size, true) {
                    return Some(to);
                }
            }
            promoted += size;
            local.allocate(size)
        });
        if let Err(size) = result {
            fatal_out_of_memory(size, SpaceKind::Local);
        }
    }
    promoted
}

fn new_local_space(regions: &Arc<RegionAllocator>, model: &Arc<dyn ObjectModel>) -> FreeListSpace {
    FreeListSpace::new(
        SpaceKind::Local,
        SparsePolicy::local(),
        usize::MAX / 4,
        regions.clone(),
        model.clone(),
    )
}

pub struct Heap {
    config: HeapConfig,
    model: Arc<dyn ObjectModel>,
    regions: Arc<RegionAllocator>,
    spaces: LocalSpaces,
    sweepers: Arc<SweeperPool>,
    tracer: Option<Arc<dyn Tracer>>,
    controller: MemController,
    gc_stats: GcStats,
    /// Heap size beyond which the next collection is an old one
    global_alloc_limit: usize,
    full_mark_requested: bool,
    /// The last promotion overflowed the old space
    should_throw_oom: bool,
    pending_oom: Option<HeapError>,
    in_gc: bool,
    in_background: bool,
    bootstrapping: bool,
    shared: Option<SharedLink>,
}

impl Heap {
    /// A standalone heap with its own mapping pool and sweepers
    pub fn new(config: HeapConfig, model: Arc<dyn ObjectModel>) -> Result<Heap, ConfigError> {
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
        Ok(Heap::with_parts(config, model, regions, sweepers, None))
    }

    pub(crate) fn with_parts(
        config: HeapConfig,
        model: Arc<dyn ObjectModel>,
        regions: Arc<RegionAllocator>,
        sweepers: Arc<SweeperPool>,
        shared: Option<SharedLink>,
    ) -> Heap {
        let spaces = LocalSpaces::new(&config, &model, &regions);
        debug!(
            "heap created: {:#x} max, {:#x} old capacity, eden {}",
            config.max_heap_size,
            config.old_space_capacity(),
            spaces.eden.is_some()
        );
        Heap {
            global_alloc_limit: config.max_heap_size,
            config,
            model,
            regions,
            spaces,
            sweepers,
            tracer: None,
            controller: MemController::new(),
            gc_stats: GcStats::default(),
            full_mark_requested: false,
            should_throw_oom: false,
            pending_oom: None,
            in_gc: false,
            in_background: false,
            bootstrapping: false,
            shared,
        }
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn model(&self) -> &Arc<dyn ObjectModel> {
        &self.model
    }

    /// Install the runtime's root source
    pub fn set_tracer<T: Tracer + 'static>(&mut self, tracer: Arc<T>) {
        let tracer: Arc<dyn Tracer> = tracer;
        if let Some(link) = &self.shared {
            link.core.contexts().set_tracer(link.id, Some(tracer.clone()));
        }
        self.tracer = Some(tracer);
    }

    pub fn clear_tracer(&mut self) {
        if let Some(link) = &self.shared {
            link.core.contexts().set_tracer(link.id, None);
        }
        self.tracer = None;
    }

    /// While set, allocation failures that survive every collection
    /// abort the process
    pub fn set_bootstrapping(&mut self, bootstrapping: bool) {
        self.bootstrapping = bootstrapping;
    }

    /// Background contexts evacuate more per partial collection
    pub fn set_in_background(&mut self, in_background: bool) {
        if self.in_background != in_background {
            info!(
                "heap switched to {}",
                if in_background { "background" } else { "foreground" }
            );
        }
        self.in_background = in_background;
    }

    pub fn is_attached(&self) -> bool {
        self.shared.is_some()
    }

    pub fn context_id(&self) -> Option<ContextId> {
        self.shared.as_ref().map(|link| link.id)
    }

    /// Mark this context running until the scope is dropped. Blocks
    /// while a shared collection has the contexts suspended.
    pub fn running_scope(&self) -> RunningScope {
        match &self.shared {
            Some(link) => RunningScope::enter(link.core.contexts().clone(), link.id),
            None => RunningScope::detached(),
        }
    }

    /// Poll for suspension; parks until resumed if one was requested
    pub fn safepoint(&self) {
        if let Some(link) = &self.shared {
            link.core.contexts().safepoint(link.id);
        }
    }

    pub fn allocate_young(&mut self, class: ClassRef) -> Result<Address, HeapError> {
        let size = self.model.instance_size(class);
        self.allocate_young_sized(class, size)
    }

    /// Allocate a young object of `size` bytes, e.g. of a variable
    /// sized class
    pub fn allocate_young_sized(&mut self, class: ClassRef, size: usize) -> Result<Address, HeapError> {
        let addr = self.allocate_block(Target::Young, size)?;
        self.model.install_class(addr, class);
        Ok(addr)
    }

    /// Allocate a young raw buffer
    pub fn allocate_young_raw(&mut self, size: usize) -> Result<Address, HeapError> {
        self.allocate_raw(Target::Young, size)
    }

    pub fn allocate_old(&mut self, class: ClassRef) -> Result<Address, HeapError> {
        let size = self.model.instance_size(class);
        self.allocate_old_sized(class, size)
    }

    pub fn allocate_old_sized(&mut self, class: ClassRef, size: usize) -> Result<Address, HeapError> {
        let addr = self.allocate_block(Target::Old, size)?;
        self.model.install_class(addr, class);
        Ok(addr)
    }

    pub fn allocate_old_raw(&mut self, size: usize) -> Result<Address, HeapError> {
        self.allocate_raw(Target::Old, size)
    }

    pub fn allocate_non_movable(&mut self, class: ClassRef) -> Result<Address, HeapError> {
        let size = self.model.instance_size(class);
        let addr = self.allocate_block(Target::NonMovable, size)?;
        self.model.install_class(addr, class);
        Ok(addr)
    }

    pub fn allocate_non_movable_raw(&mut self, size: usize) -> Result<Address, HeapError> {
        self.allocate_raw(Target::NonMovable, size)
    }

    /// Allocate straight into the huge object space, whatever the size
    pub fn allocate_huge(&mut self, class: ClassRef, size: usize) -> Result<Address, HeapError> {
        let addr = self.allocate_block(Target::Huge, size)?;
        self.model.install_class(addr, class);
        Ok(addr)
    }

    pub fn allocate_huge_raw(&mut self, size: usize) -> Result<Address, HeapError> {
        self.allocate_raw(Target::Huge, size)
    }

    pub fn allocate_read_only(&mut self, class: ClassRef) -> Result<Address, HeapError> {
        let size = self.model.instance_size(class);
        let addr = self.allocate_block(Target::ReadOnly, size)?;
        self.model.install_class(addr, class);
        Ok(addr)
    }

    pub fn allocate_snapshot(&mut self, class: ClassRef) -> Result<Address, HeapError> {
        let size = self.model.instance_size(class);
        let addr = self.allocate_block(Target::Snapshot, size)?;
        self.model.install_class(addr, class);
        Ok(addr)
    }

    /// Allocate a code object of `size` bytes with room for
    /// `instructions` bytes of machine code. The instructions occupy
    /// the tail of the object, or the code fort when one is reserved.
    pub fn allocate_machine_code(
        &mut self,
        class: ClassRef,
        size: usize,
        instructions: usize,
    ) -> Result<MachineCode, HeapError> {
        let in_fort = self
            .spaces
            .machine_code
            .code()
            .map(|c| c.fort().is_some())
            .unwrap_or(false);
        let object_size = alloc_size_of(size);
        if !in_fort && instructions > object_size - MIN_OBJECT_SIZE {
            return Err(HeapError::InvalidSize {
                size: instructions,
                max: object_size - MIN_OBJECT_SIZE,
            });
        }

        let object = self.allocate_block(Target::MachineCode, size)?;
        self.model.install_class(object, class);
        let instructions = if in_fort {
            let placed = self
                .spaces
                .machine_code
                .code_mut()
                .and_then(|c| c.fort_mut())
                .and_then(|fort| fort.allocate(instructions));
            match placed {
                Some(addr) => Span::new(addr, instructions),
                None => return Err(HeapError::out_of_memory(instructions, SpaceKind::MachineCode)),
            }
        } else {
            Span::new(object.offset(object_size - instructions), instructions)
        };

        if !instructions.is_empty() {
            if let Some(code) = self.spaces.machine_code.code_mut() {
                code.map_mut().insert(instructions, object);
            }
        }
        Ok(MachineCode {
            object,
            instructions,
        })
    }

    /// The code object whose instructions contain `pc`
    pub fn machine_code_owner(&self, pc: Address) -> Option<Address> {
        self.spaces
            .machine_code
            .code()
            .and_then(|c| c.map().owner_of(pc))
    }

    fn link(&self) -> Result<&SharedLink, HeapError> {
        self.shared.as_ref().ok_or(HeapError::NotAttached)
    }

    /// Allocate an object in a shared space
    pub fn allocate_shared(
        &self,
        target: SharedTarget,
        class: ClassRef,
        size: usize,
    ) -> Result<Address, HeapError> {
        let link = self.link()?;
        let addr = link.core.allocate_block(link.id, &link.tlab, target, size)?;
        self.model.install_class(addr, class);
        Ok(addr)
    }

    pub fn allocate_shared_old(&self, class: ClassRef) -> Result<Address, HeapError> {
        self.allocate_shared(SharedTarget::Old, class, self.model.instance_size(class))
    }

    pub fn allocate_shared_old_raw(&self, size: usize) -> Result<Address, HeapError> {
        let link = self.link()?;
        let addr = link.core.allocate_block(link.id, &link.tlab, SharedTarget::Old, size)?;
        unsafe { write_raw(addr, alloc_size_of(size)) };
        Ok(addr)
    }

    pub fn allocate_shared_non_movable(&self, class: ClassRef) -> Result<Address, HeapError> {
        self.allocate_shared(SharedTarget::NonMovable, class, self.model.instance_size(class))
    }

    pub fn allocate_shared_huge(&self, class: ClassRef, size: usize) -> Result<Address, HeapError> {
        self.allocate_shared(SharedTarget::Huge, class, size)
    }

    pub fn allocate_shared_read_only(&self, class: ClassRef) -> Result<Address, HeapError> {
        self.allocate_shared(SharedTarget::ReadOnly, class, self.model.instance_size(class))
    }

    /// Write barrier bookkeeping: `slot` now holds `value`
    pub fn record_slot(&self, slot: Slot, value: Address) {
        remember_slot(&self.regions, slot, value);
    }

    /// The space whose region holds `addr`
    pub fn space_of(&self, addr: Address) -> Option<SpaceKind> {
        self.regions
            .region_of(addr)
            .and_then(|r| SpaceKind::from_flags(r.space()))
    }

    pub fn in_young(&self, addr: Address) -> bool {
        self.regions
            .region_of(addr)
            .map(|r| r.in_young())
            .unwrap_or(false)
    }

    /// Live bytes across every local space
    pub fn heap_object_size(&self) -> usize {
        self.spaces.live()
    }

    pub fn old_alloc_limit(&self) -> usize {
        self.spaces.old.alloc_limit()
    }

    pub fn global_alloc_limit(&self) -> usize {
        self.global_alloc_limit
    }

    /// An out-of-memory condition raised by the last collection for
    /// the runtime to throw
    pub fn take_pending_oom(&mut self) -> Option<HeapError> {
        self.pending_oom.take()
    }

    fn allocate_raw(&mut self, target: Target, size: usize) -> Result<Address, HeapError> {
        let addr = self.allocate_block(target, size)?;
        unsafe { write_raw(addr, alloc_size_of(size)) };
        Ok(addr)
    }

    fn max_size(&self, target: Target) -> usize {
        if target.is_immortal() {
            self.config.max_regular_object_size()
        } else {
            self.config.old_space_capacity()
        }
    }

    /// Zeroed memory for an object of `size` bytes
    fn allocate_block(&mut self, target: Target, size: usize) -> Result<Address, HeapError> {
        let max = self.max_size(target);
        if size == 0 || size > max {
            return Err(HeapError::InvalidSize { size, max });
        }
        let size = alloc_size_of(size);
        let target = if size > self.config.max_regular_object_size() {
            target.huge().ok_or(HeapError::InvalidSize {
                size,
                max: self.config.max_regular_object_size(),
            })?
        } else {
            target
        };
        if matches!(target, Target::Old | Target::Huge | Target::HugeMachineCode) {
            self.check_and_trigger_old_gc(size);
        }
        let addr = self.allocate_with_retry(target, size)?;
        unsafe { addr.zero(size) };
        Ok(addr)
    }

    fn try_allocate(&mut self, target: Target, size: usize) -> Option<Address> {
        let spaces = &mut self.spaces;
        match target {
            Target::Young => match &mut spaces.eden {
                Some(eden) if eden.is_full() => None,
                Some(eden) => eden.allocate(size, false),
                None => spaces.active_semi.allocate(size, false),
            },
            Target::Old => spaces.old.allocate(size),
            Target::NonMovable => spaces.non_movable.allocate(size),
            Target::MachineCode => spaces.machine_code.allocate(size),
            Target::Huge => spaces.huge.allocate(size),
            Target::HugeMachineCode => spaces.huge_machine_code.allocate(size),
            Target::ReadOnly => spaces.read_only.allocate(size, false),
            Target::Snapshot => spaces.snapshot.allocate(size, false),
        }
    }

    /// Extend the target's ceiling by the out-of-memory overshoot,
    /// once. False if it has already been granted.
    fn grant_oom_overshoot(&mut self, target: Target) -> bool {
        let grant = self.config.oom_overshoot_size;
        let spaces = &mut self.spaces;
        let current = match target {
            Target::Young => spaces.active_semi.overshoot(),
            Target::Old => spaces.old.overshoot(),
            Target::NonMovable => spaces.non_movable.overshoot(),
            Target::MachineCode => spaces.machine_code.overshoot(),
            Target::Huge => spaces.huge.overshoot(),
            Target::HugeMachineCode => spaces.huge_machine_code.overshoot(),
            Target::ReadOnly => spaces.read_only.overshoot(),
            Target::Snapshot => spaces.snapshot.overshoot(),
        };
        if current >= grant {
            return false;
        }
        let bytes = grant - current;
        match target {
            Target::Young => spaces.active_semi.increase_overshoot(bytes),
            Target::Old => spaces.old.increase_overshoot(bytes),
            Target::NonMovable => spaces.non_movable.increase_overshoot(bytes),
            Target::MachineCode => spaces.machine_code.increase_overshoot(bytes),
            Target::Huge => spaces.huge.increase_overshoot(bytes),
            Target::HugeMachineCode => spaces.huge_machine_code.increase_overshoot(bytes),
            Target::ReadOnly => spaces.read_only.increase_overshoot(bytes),
            Target::Snapshot => spaces.snapshot.increase_overshoot(bytes),
        }
        debug!("{} granted {:#x} overshoot", target.kind(), bytes);
        true
    }

    fn allocate_with_retry(&mut self, target: Target, size: usize) -> Result<Address, HeapError> {
        if let Some(addr) = self.try_allocate(target, size) {
            return Ok(addr);
        }

        if !target.is_immortal() {
            let first = match target {
                Target::Young => self.select_young_gc_type(),
                _ => TriggerGCType::OldGc,
            };
            trace!("{} miss for {:#x} bytes, collecting", target.kind(), size);
            self.collect_garbage(first, GcReason::AllocationFailed);
            if let Some(addr) = self.try_allocate(target, size) {
                return Ok(addr);
            }

            self.collect_garbage(TriggerGCType::FullGc, GcReason::AllocationFailed);
            if let Some(addr) = self.try_allocate(target, size) {
                return Ok(addr);
            }
        }

        if self.grant_oom_overshoot(target) {
            if let Some(addr) = self.try_allocate(target, size) {
                warn!(
                    "{} allocated {:#x} bytes into its out-of-memory overshoot",
                    target.kind(),
                    size
                );
                return Ok(addr);
            }
        }

        if self.bootstrapping {
            fatal_out_of_memory(size, target.kind());
        }
        warn!("out of memory allocating {:#x} bytes in {}", size, target.kind());
        Err(HeapError::out_of_memory(size, target.kind()))
    }

    /// Collect the old generation first if `size` more old bytes would
    /// cross its allocation limit
    fn check_and_trigger_old_gc(&mut self, size: usize) {
        if self.in_gc {
            return;
        }
        let old_live = self.spaces.old.live_size() + self.spaces.huge.live_size();
        if old_live + size > self.spaces.old.alloc_limit() {
            debug!(
                "old live {:#x} + {:#x} crosses limit {:#x}",
                old_live,
                size,
                self.spaces.old.alloc_limit()
            );
            self.collect_garbage(TriggerGCType::OldGc, GcReason::AllocationLimit);
        }
    }

    /// Young collection unless the old generation needs collecting
    pub fn select_gc_type(&self) -> TriggerGCType {
        let spaces = &self.spaces;
        let old_live = spaces.old.live_size() + spaces.huge.live_size();
        let needs_old = self.full_mark_requested
            || spaces.huge.full_mark_requested()
            || spaces.huge_machine_code.full_mark_requested()
            || old_live > spaces.old.alloc_limit()
            || !spaces.old.counters().can_commit(spaces.active_semi.committed_size())
            || self.heap_object_size() > self.global_alloc_limit + spaces.old.overshoot();
        if needs_old {
            TriggerGCType::OldGc
        } else {
            TriggerGCType::YoungGc
        }
    }

    /// Like [`Heap::select_gc_type`], preferring an eden collection
    /// while the semi space has room to take eden's survivors
    pub fn select_young_gc_type(&self) -> TriggerGCType {
        match self.select_gc_type() {
            TriggerGCType::YoungGc
                if self.spaces.eden.is_some()
                    && self.spaces.active_semi.live_size() < self.spaces.active_semi.capacity() / 2 =>
            {
                TriggerGCType::EdenGc
            }
            kind => kind,
        }
    }

    /// Run a collection of the given kind. Shared kinds are handed to
    /// the shared heap's collector thread.
    pub fn collect_garbage(&mut self, kind: TriggerGCType, reason: GcReason) {
        if kind.is_shared() {
            match &self.shared {
                Some(link) => link.core.collect_from(Some(link.id), kind, reason),
                None => warn!("{} collection requested of an unattached heap", kind),
            }
            return;
        }
        if self.in_gc {
            return;
        }
        self.in_gc = true;
        let _running = self.running_scope();

        let live_before = self.heap_object_size();
        self.controller
            .start_collection(self.spaces.young_allocated_since_gc());
        debug!("{} collection starting ({}), {:#x} live", kind, reason, live_before);
        for space in self.spaces.swept_spaces_mut() {
            space.reset_sweep_state();
        }

        match kind {
            TriggerGCType::EdenGc => {
                let eden_only = self.spaces.eden.is_some();
                self.young_gc(eden_only);
            }
            kind if kind.is_major() => self.old_gc(kind),
            _ => self.young_gc(false),
        }

        let live_after = self.heap_object_size();
        let freed = live_before.saturating_sub(live_after);
        let pause = self.controller.stop_collection(live_after);
        self.gc_stats.record(kind, pause, freed);
        self.adjust_overshoot();
        self.spaces.huge.reclaim_huge_regions();
        self.spaces.huge_machine_code.reclaim_huge_regions();

        if mem::take(&mut self.should_throw_oom) {
            self.raise_pending_oom();
        }
        info!(
            "{} collection ({}) took {:?}: {:#x} live, {:#x} freed",
            kind, reason, pause, live_after, freed
        );
        self.in_gc = false;
    }

    fn raise_pending_oom(&mut self) {
        let old = &mut self.spaces.old;
        let over = old.committed_size().saturating_sub(old.capacity());
        let grant = self
            .config
            .old_space_step_overshoot
            .min(self.config.old_space_max_overshoot.saturating_sub(old.overshoot()));
        old.increase_overshoot(grant);
        warn!(
            "promotion overflowed {} by {:#x}, overshoot now {:#x}",
            SpaceKind::Old,
            over,
            old.overshoot()
        );
        self.pending_oom = Some(HeapError::out_of_memory(over, SpaceKind::Old));
    }

    fn young_gc(&mut self, eden_only: bool) {
        let regions = self.regions.clone();
        let model = self.model.clone();
        let tracer = self.tracer.clone();
        let allocated = self.spaces.young_allocated_since_gc();

        let young = self.spaces.young_regions();
        let from = if eden_only {
            self.spaces.eden_regions()
        } else {
            young.clone()
        };
        for region in &young {
            region.clear_marks();
        }
        let members: RegionSet = young.iter().collect();
        let old_generation = self.spaces.old_generation_regions();
        {
            let mut marker = Marker::new(&regions, model.as_ref(), SpaceFlags::YOUNG).within(&members);
            if let Some(tracer) = &tracer {
                marker.mark_roots(tracer.as_ref());
            }
            for slot in remembered_slots_in(&old_generation, RememberedSetKind::OldToNew) {
                marker.mark_slot(slot);
            }
            marker.drain();
        }

        let mut local = new_local_space(&regions, &model);
        let mut evacuation = Evacuation::new(&regions, model.as_ref(), tracer.as_deref());
        let to_space = if eden_only {
            &mut self.spaces.active_semi
        } else {
            &mut self.spaces.inactive_semi
        };
        let promoted = evacuate_young(&mut evacuation, &from, to_space, &mut local);

        let slots = remembered_slots_in(&old_generation, RememberedSetKind::OldToNew);
        clear_remembered_in(&old_generation, RememberedSetKind::OldToNew);
        for slot in slots {
            evacuation.fixup_slot(slot);
        }
        if let Some(tracer) = &tracer {
            evacuation.fixup_roots(tracer.as_ref());
        }
        evacuation.fixup_copies();
        if eden_only {
            for region in self.spaces.active_semi.regions() {
                evacuation.fixup_region(region);
            }
        }
        let copied = evacuation.copied_bytes();
        drop(evacuation);
        let survived = copied - promoted;
        self.gc_stats.record_evacuation(copied, promoted, 0);

        if let Some(eden) = &mut self.spaces.eden {
            eden.take_regions();
        }
        if !eden_only {
            self.flip_semi_spaces(survived);
            let speed = self.controller.allocation_speed_per_ms();
            if self.spaces.active_semi.adjust_capacity(allocated, speed) {
                let capacity = self.spaces.active_semi.initial_capacity();
                self.spaces.inactive_semi.set_initial_capacity(capacity);
            }
            if allocated > 0 {
                self.controller
                    .record_survival_rate(survived as f64 / allocated as f64);
            }
        }
        self.merge_local(&mut local);
        debug!(
            "{} young collection: {:#x} survived, {:#x} promoted",
            if eden_only { "eden" } else { "semi" },
            survived,
            promoted
        );
    }

    /// The to-space becomes the allocation space and the from-space is
    /// released
    fn flip_semi_spaces(&mut self, survived: usize) {
        mem::swap(&mut self.spaces.active_semi, &mut self.spaces.inactive_semi);
        self.spaces.inactive_semi.reclaim_regions();
        self.spaces.active_semi.set_water_line();
        self.spaces.active_semi.set_survival_size(survived);
    }

    fn merge_local(&mut self, local: &mut FreeListSpace) {
        if self.spaces.old.merge(local) {
            self.should_throw_oom = true;
        }
    }

    fn old_gc(&mut self, kind: TriggerGCType) {
        let regions = self.regions.clone();
        let model = self.model.clone();
        let tracer = self.tracer.clone();

        let collected = self.spaces.collected_regions();
        for region in &collected {
            region.clear_marks();
        }
        let members: RegionSet = collected.iter().collect();
        let immortal = self.spaces.immortal_objects(model.as_ref());
        let scope = (SpaceFlags::YOUNG | SpaceFlags::OLD_GENERATION) - SpaceFlags::IMMORTAL;
        let marked_bytes = {
            let mut marker = Marker::new(&regions, model.as_ref(), scope).within(&members);
            if let Some(tracer) = &tracer {
                marker.mark_roots(tracer.as_ref());
            }
            for obj in &immortal {
                marker.scan(*obj);
            }
            marker.drain();
            marker.marked_bytes()
        };

        let cset_regions = if kind.is_full() {
            self.spaces.old.select_all_for_compaction()
        } else {
            let alive: usize = self.spaces.old.regions().iter().map(|r| r.alive()).sum();
            let params = CollectSetParams {
                in_background: self.in_background,
                foreground_budget: self.config.evacuation_budget_foreground,
                background_budget: self.config.evacuation_budget_background,
                min_regions: self.config.cset_min_regions,
                expected_free: self.spaces.old.committed_size().saturating_sub(alive),
            };
            self.spaces.old.select_cset(&params)
        };
        let cset = self.spaces.old.collect_set().regions().to_vec();

        let young = self.spaces.young_regions();
        let mut local = new_local_space(&regions, &model);
        let mut evacuation = Evacuation::new(&regions, model.as_ref(), tracer.as_deref());
        let promoted = evacuate_young(
            &mut evacuation,
            &young,
            &mut self.spaces.inactive_semi,
            &mut local,
        );
        let young_copied = evacuation.copied_bytes();
        for region in &cset {
            if let Err(size) = evacuation.evacuate_region(region, |_, _, size| local.allocate(size)) {
                fatal_out_of_memory(size, SpaceKind::Local);
            }
        }

        let old_generation = self.spaces.old_generation_regions();
        clear_remembered_in(&old_generation, RememberedSetKind::OldToNew);
        if let Some(tracer) = &tracer {
            evacuation.fixup_roots(tracer.as_ref());
        }
        for region in self.spaces.survivor_regions() {
            evacuation.fixup_region(&region);
        }
        for obj in &immortal {
            evacuation.fixup_object(*obj);
        }
        evacuation.fixup_copies();
        let copied = evacuation.copied_bytes();
        drop(evacuation);
        self.gc_stats.record_evacuation(copied, promoted, cset_regions);

        if let Some(code) = self.spaces.machine_code.code_mut() {
            let purged = code.purge(|owner| {
                object_region(&regions, owner)
                    .map(|r| r.is_marked(owner))
                    .unwrap_or(false)
            });
            if purged > 0 {
                debug!("{} dead code objects purged", purged);
            }
        }
        self.spaces.huge.sweep();
        self.spaces.huge_machine_code.sweep();

        if let Some(eden) = &mut self.spaces.eden {
            eden.take_regions();
        }
        self.flip_semi_spaces(young_copied - promoted);
        self.spaces.old.reclaim_cset();
        self.merge_local(&mut local);
        self.start_sweeping();

        if kind == TriggerGCType::AppSpawnFullGc {
            self.move_old_to_app_spawn();
        }
        self.full_mark_requested = false;
        self.spaces.huge.clear_full_mark_request();
        self.spaces.huge_machine_code.clear_full_mark_request();
        self.recompute_limits();
        debug!(
            "{} collection marked {:#x}, evacuated {:#x} from {} collect set regions",
            kind, marked_bytes, copied, cset_regions
        );
    }

    /// Queue the free list spaces for sweeping, on the sweeper threads
    /// when there are any
    fn start_sweeping(&mut self) {
        let concurrent = self.config.concurrent_sweep;
        let sweepers = self.sweepers.clone();
        for space in self.spaces.swept_spaces_mut() {
            space.prepare_sweeping();
            if !(concurrent && sweepers.post(space.sweep_queues())) {
                space.finish_sweeping();
            }
        }
    }

    fn move_old_to_app_spawn(&mut self) {
        let spaces = &mut self.spaces;
        spaces.old.finish_sweeping();
        let moved = spaces.old.regions().to_vec();
        for region in &moved {
            let free = spaces.old.detach_region(region);
            spaces.app_spawn.add_region(region.clone(), &free);
        }
        info!(
            "{} regions moved to {}, {:#x} live",
            moved.len(),
            SpaceKind::AppSpawn,
            spaces.app_spawn.live_size()
        );
    }

    /// Derive the old space and global allocation limits from what
    /// survived and how fast the collector keeps up with the mutator
    fn recompute_limits(&mut self) {
        let factor = MemController::calculate_growing_factor(
            self.controller.gc_speed_per_ms(),
            self.controller.allocation_speed_per_ms(),
        );
        let semi = self.spaces.active_semi.initial_capacity();
        let old_live = self.spaces.old.live_size() + self.spaces.huge.live_size();
        let old_limit = MemController::calculate_alloc_limit(
            old_live,
            MIN_OLD_SPACE_LIMIT,
            self.config.old_space_capacity().saturating_sub(semi),
            semi,
            factor,
        );
        self.spaces.old.set_alloc_limit(old_limit);
        self.global_alloc_limit = MemController::calculate_alloc_limit(
            self.heap_object_size(),
            MIN_HEAP_LIMIT,
            self.config.max_heap_size.saturating_sub(semi),
            semi,
            factor,
        );

        let committed = self.spaces.old.committed_size();
        self.full_mark_requested =
            (old_live as f64 / FRAGMENTED_LIVE_RATIO) < committed as f64 && committed / 2 > old_limit;
        debug!(
            "limits: old {:#x}, global {:#x}, growing factor {:.2}",
            old_limit, self.global_alloc_limit, factor
        );
    }

    /// Decay every space's overshoot
    pub fn adjust_overshoot(&mut self) {
        let spaces = &mut self.spaces;
        spaces.active_semi.adjust_overshoot();
        spaces.inactive_semi.adjust_overshoot();
        spaces.old.adjust_overshoot();
        spaces.non_movable.adjust_overshoot();
        spaces.machine_code.adjust_overshoot();
        spaces.read_only.adjust_overshoot();
        spaces.snapshot.adjust_overshoot();
        spaces.huge.adjust_overshoot();
        spaces.huge_machine_code.adjust_overshoot();
    }

    /// Use an idle period: collect the old generation if a full mark
    /// is pending, else the young generation if at least half full
    pub fn trigger_idle_collection(&mut self) -> Option<TriggerGCType> {
        let kind = if self.full_mark_requested
            || self.spaces.huge.full_mark_requested()
            || self.spaces.huge_machine_code.full_mark_requested()
        {
            TriggerGCType::OldGc
        } else if self.spaces.young_live() * 2 >= self.spaces.young_capacity()
            && self.spaces.young_live() > 0
        {
            TriggerGCType::YoungGc
        } else {
            return None;
        };
        self.collect_garbage(kind, GcReason::Idle);
        Some(kind)
    }

    /// Compact and freeze the old space ahead of a fork
    pub fn compact_before_fork(&mut self) {
        self.collect_garbage(TriggerGCType::AppSpawnFullGc, GcReason::AppSpawn);
    }

    /// Write protect the read-only space. No more read-only allocation
    /// succeeds afterwards.
    pub fn freeze_read_only(&mut self) -> bool {
        let protected = self.spaces.read_only.protect(true);
        info!(
            "{} frozen ({} regions)",
            SpaceKind::ReadOnly,
            self.spaces.read_only.region_count()
        );
        protected
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            spaces: self.spaces.all().into_iter().map(SpaceStats::of).collect(),
            gc: self.gc_stats.clone(),
            old_alloc_limit: self.spaces.old.alloc_limit(),
            global_alloc_limit: self.global_alloc_limit,
        }
    }

    /// Check space accounting and that no bump space has marks above
    /// its allocation top
    pub fn verify(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for space in self.spaces.all() {
            problems.extend(space.verify_accounting());
        }
        let mut bump: Vec<&BumpSpace> = vec![
            &self.spaces.active_semi,
            &self.spaces.inactive_semi,
            &self.spaces.read_only,
            &self.spaces.snapshot,
        ];
        if let Some(eden) = &self.spaces.eden {
            bump.push(eden);
        }
        for space in bump {
            space.flush_top();
            for region in space.regions() {
                if let Some(obj) = region.marked_objects().find(|obj| *obj >= region.top()) {
                    problems.push(format!(
                        "{}: marked object {} above top {}",
                        space.kind(),
                        obj,
                        region.top()
                    ));
                }
            }
        }
        problems
    }

    /// Return every local space's memory while still counted as
    /// running, so a shared collection never sees it half released
    fn release_spaces(&mut self) {
        let empty = LocalSpaces::empty(&self.model, &self.regions);
        drop(mem::replace(&mut self.spaces, empty));
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let link = match self.shared.take() {
            Some(link) => link,
            None => return,
        };
        {
            let _running = RunningScope::enter(link.core.contexts().clone(), link.id);
            self.release_spaces();
            link.core.retire_tlab(&link.tlab);
        }
        link.core.contexts().unregister(link.id);
        debug!("context {} detached", link.id);
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::config::KB;
    use crate::memory::mark::RootList;
    use crate::memory::object::EncodedSizeModel;

    pub fn config() -> HeapConfig {
        HeapConfig::compact(64 * KB).with_sweeper_threads(0)
    }

    pub fn heap_with(config: HeapConfig) -> (Heap, Arc<RootList>) {
        let mut heap = Heap::new(config, Arc::new(EncodedSizeModel)).unwrap();
        let roots = Arc::new(RootList::new());
        heap.set_tracer(roots.clone());
        (heap, roots)
    }

    fn class(size: usize) -> ClassRef {
        EncodedSizeModel::class_with_references(size)
    }

    fn field(obj: Address, index: usize) -> Address {
        Address::new(unsafe { obj.offset((index + 1) * 8).load_word() })
    }

    fn set_field(heap: &Heap, obj: Address, index: usize, value: Address) {
        let slot = obj.offset((index + 1) * 8);
        unsafe { slot.store_word(value.as_usize()) };
        heap.record_slot(slot, value);
    }

    #[test]
    pub fn test_young_allocation_is_zeroed_and_stamped() {
        let (mut heap, _) = heap_with(config());
        let a = heap.allocate_young(class(48)).unwrap();
        assert!(a.is_aligned_to(8));
        assert_eq!(unsafe { ClassRef::of(a) }, class(48));
        for i in 0..5 {
            assert_eq!(field(a, i), Address::NULL);
        }
        assert_eq!(heap.space_of(a), Some(SpaceKind::Semi));
        assert!(heap.in_young(a));
        assert!(heap.verify().is_empty());
    }

    #[test]
    pub fn test_young_gc_moves_reachable_objects() {
        let (mut heap, roots) = heap_with(config());
        let a = heap.allocate_young(class(32)).unwrap();
        let b = heap.allocate_young(class(16)).unwrap();
        heap.allocate_young(class(16)).unwrap();
        set_field(&heap, a, 0, b);
        roots.push(a);

        heap.collect_garbage(TriggerGCType::YoungGc, GcReason::External);

        let moved = roots.get(0);
        assert_ne!(moved, a);
        assert_eq!(heap.space_of(moved), Some(SpaceKind::Semi));
        let moved_b = field(moved, 0);
        assert_ne!(moved_b, b);
        assert_eq!(unsafe { ClassRef::of(moved_b) }, class(16));
        let stats = heap.stats();
        assert_eq!(stats.space(SpaceKind::Semi).unwrap().live, 48);
        assert_eq!(stats.gc.count(TriggerGCType::YoungGc), 1);
        assert!(heap.verify().is_empty());
    }

    #[test]
    pub fn test_second_survival_promotes() {
        let (mut heap, roots) = heap_with(config());
        roots.push(heap.allocate_young(class(24)).unwrap());
        heap.collect_garbage(TriggerGCType::YoungGc, GcReason::External);
        assert_eq!(heap.space_of(roots.get(0)), Some(SpaceKind::Semi));

        heap.collect_garbage(TriggerGCType::YoungGc, GcReason::External);
        assert_eq!(heap.space_of(roots.get(0)), Some(SpaceKind::Old));
        assert_eq!(heap.stats().space(SpaceKind::Old).unwrap().live, 24);
        assert!(heap.verify().is_empty());
    }

    #[test]
    pub fn test_old_to_new_slots_keep_young_alive() {
        let (mut heap, roots) = heap_with(config());
        let holder = heap.allocate_old(class(16)).unwrap();
        roots.push(holder);
        let young = heap.allocate_young(class(16)).unwrap();
        set_field(&heap, holder, 0, young);

        heap.collect_garbage(TriggerGCType::YoungGc, GcReason::External);
        assert_eq!(roots.get(0), holder);
        let moved = field(holder, 0);
        assert_ne!(moved, young);
        assert_eq!(heap.space_of(moved), Some(SpaceKind::Semi));

        // still remembered: the next young collection updates it again
        heap.collect_garbage(TriggerGCType::YoungGc, GcReason::External);
        assert_eq!(heap.space_of(field(holder, 0)), Some(SpaceKind::Old));
    }

    #[test]
    pub fn test_old_gc_sweeps_garbage() {
        let (mut heap, roots) = heap_with(config());
        let keep = heap.allocate_old(class(64)).unwrap();
        roots.push(keep);
        for _ in 0..10 {
            heap.allocate_old(class(64)).unwrap();
        }
        assert_eq!(heap.stats().space(SpaceKind::Old).unwrap().live, 11 * 64);

        heap.collect_garbage(TriggerGCType::OldGc, GcReason::External);
        assert_eq!(roots.get(0), keep);
        assert_eq!(heap.stats().space(SpaceKind::Old).unwrap().live, 64);
        assert!(heap.verify().is_empty());

        // swept memory is reused
        let again = heap.allocate_old(class(64)).unwrap();
        assert_eq!(heap.space_of(again), Some(SpaceKind::Old));
        assert_eq!(heap.stats().space(SpaceKind::Old).unwrap().regions, 1);
    }

    fn old_regions_after_churn(sweepers: usize) -> usize {
        let (mut heap, _) = heap_with(HeapConfig::compact(64 * KB).with_sweeper_threads(sweepers));
        for _ in 0..20000 {
            heap.allocate_old(class(64)).unwrap();
        }
        heap.collect_garbage(TriggerGCType::OldGc, GcReason::External);
        heap.collect_garbage(TriggerGCType::YoungGc, GcReason::External);
        assert!(heap.verify().is_empty());
        heap.stats().space(SpaceKind::Old).unwrap().regions
    }

    #[test]
    pub fn test_background_sweep_releases_empty_regions() {
        let synchronous = old_regions_after_churn(0);
        let concurrent = old_regions_after_churn(2);
        assert!(synchronous <= 1, "{} old regions kept", synchronous);
        assert!(concurrent <= 1, "{} old regions kept", concurrent);
    }

    #[test]
    pub fn test_full_gc_compacts_old_space() {
        let (mut heap, roots) = heap_with(config());
        let keep = heap.allocate_old(class(32)).unwrap();
        let child = heap.allocate_old(class(16)).unwrap();
        set_field(&heap, keep, 0, child);
        roots.push(keep);
        for _ in 0..20 {
            heap.allocate_old(class(256)).unwrap();
        }

        heap.collect_garbage(TriggerGCType::FullGc, GcReason::External);
        let moved = roots.get(0);
        assert_ne!(moved, keep);
        assert_eq!(heap.space_of(moved), Some(SpaceKind::Old));
        let moved_child = field(moved, 0);
        assert_eq!(unsafe { ClassRef::of(moved_child) }, class(16));
        let old = heap.stats();
        let old = old.space(SpaceKind::Old).unwrap();
        assert_eq!(old.live, 48);
        assert_eq!(old.regions, 1);
        assert!(heap.verify().is_empty());
    }

    #[test]
    pub fn test_large_requests_take_the_huge_path() {
        let (mut heap, roots) = heap_with(config());
        let limit = heap.config().max_regular_object_size();
        let kept = heap.allocate_young_raw(limit + 8).unwrap();
        let dropped = heap.allocate_old_raw(2 * limit).unwrap();
        assert_eq!(heap.space_of(kept), Some(SpaceKind::Huge));
        assert_eq!(heap.space_of(dropped), Some(SpaceKind::Huge));
        roots.push(kept);

        heap.collect_garbage(TriggerGCType::OldGc, GcReason::External);
        let huge = heap.stats();
        let huge = huge.space(SpaceKind::Huge).unwrap();
        assert_eq!(huge.regions, 1);
        assert_eq!(huge.live, alloc_size_of(limit + 8));
        assert_eq!(roots.get(0), kept);
    }

    #[test]
    pub fn test_invalid_sizes() {
        let (mut heap, _) = heap_with(config());
        assert!(matches!(
            heap.allocate_young_raw(0),
            Err(HeapError::InvalidSize { size: 0, .. })
        ));
        let max = heap.config().old_space_capacity();
        assert!(matches!(
            heap.allocate_old_raw(max + 1),
            Err(HeapError::InvalidSize { .. })
        ));
        let too_big = EncodedSizeModel::class(heap.config().max_regular_object_size() + 8);
        assert!(matches!(
            heap.allocate_read_only(too_big),
            Err(HeapError::InvalidSize { .. })
        ));
    }

    #[test]
    pub fn test_out_of_memory_after_ladder() {
        let (mut heap, roots) = heap_with(config());
        let class = EncodedSizeModel::class(40 * KB);
        let mut count = 0;
        let err = loop {
            match heap.allocate_old(class) {
                Ok(obj) => {
                    roots.push(obj);
                    count += 1;
                    assert!(count < 200, "old space never filled");
                }
                Err(e) => break e,
            }
        };
        assert!(matches!(
            err,
            HeapError::OutOfMemory {
                space: SpaceKind::Old,
                ..
            }
        ));
        assert!(err.is_recoverable());
        assert!(heap.stats().gc.count(TriggerGCType::FullGc) > 0);
        assert!(heap.verify().is_empty());
    }

    #[test]
    pub fn test_young_exhaustion_collects() {
        let (mut heap, roots) = heap_with(config());
        let first = heap.allocate_young(class(64)).unwrap();
        roots.push(first);
        let capacity = heap.config().semi_space_min;
        for _ in 0..(2 * capacity / 64) {
            heap.allocate_young(class(64)).unwrap();
        }
        assert!(heap.stats().gc.count(TriggerGCType::YoungGc) > 0);
        assert_ne!(roots.get(0), first);
    }

    #[test]
    pub fn test_inline_machine_code() {
        let (mut heap, roots) = heap_with(config());
        let code = heap.allocate_machine_code(class(64), 64, 32).unwrap();
        assert_eq!(heap.space_of(code.object), Some(SpaceKind::MachineCode));
        assert_eq!(code.instructions.len(), 32);
        assert_eq!(code.instructions.end(), code.object.offset(64));
        assert_eq!(
            heap.machine_code_owner(code.instructions.begin().offset(8)),
            Some(code.object)
        );
        assert!(matches!(
            heap.allocate_machine_code(class(64), 64, 64),
            Err(HeapError::InvalidSize { .. })
        ));

        let kept = heap.allocate_machine_code(class(32), 32, 8).unwrap();
        roots.push(kept.object);
        heap.collect_garbage(TriggerGCType::OldGc, GcReason::External);
        assert_eq!(heap.machine_code_owner(code.instructions.begin()), None);
        assert_eq!(heap.machine_code_owner(kept.instructions.begin()), Some(kept.object));
    }

    #[test]
    pub fn test_fort_machine_code() {
        let (mut heap, roots) = heap_with(config().with_code_fort(true));
        let code = heap.allocate_machine_code(class(32), 32, 256).unwrap();
        assert_eq!(code.instructions.len(), 256);
        assert_ne!(heap.space_of(code.instructions.begin()), Some(SpaceKind::MachineCode));
        assert_eq!(
            heap.machine_code_owner(code.instructions.begin().offset(100)),
            Some(code.object)
        );

        // dead code gives its instructions back to the fort
        let kept = heap.allocate_machine_code(class(32), 32, 128).unwrap();
        roots.push(kept.object);
        heap.collect_garbage(TriggerGCType::OldGc, GcReason::External);
        assert_eq!(heap.machine_code_owner(code.instructions.begin()), None);
        assert_eq!(
            heap.machine_code_owner(kept.instructions.begin()),
            Some(kept.object)
        );
    }

    #[test]
    pub fn test_eden_collection_moves_to_semi() {
        let (mut heap, roots) = heap_with(config().with_eden(2));
        let a = heap.allocate_young(class(32)).unwrap();
        assert_eq!(heap.space_of(a), Some(SpaceKind::Eden));
        roots.push(a);
        assert_eq!(heap.select_young_gc_type(), TriggerGCType::EdenGc);

        heap.collect_garbage(TriggerGCType::EdenGc, GcReason::External);
        assert_eq!(heap.space_of(roots.get(0)), Some(SpaceKind::Semi));
        let b = heap.allocate_young(class(16)).unwrap();
        assert_eq!(heap.space_of(b), Some(SpaceKind::Eden));
        assert!(heap.verify().is_empty());
    }

    #[test]
    pub fn test_full_eden_collects_then_serves_again() {
        let (mut heap, roots) = heap_with(config().with_eden(2));
        let first = heap.allocate_young(class(64)).unwrap();
        roots.push(first);
        let pooled = 2 * heap.config().region_size;
        for _ in 0..(pooled / 64 + 16) {
            heap.allocate_young(class(64)).unwrap();
        }
        assert!(heap.stats().gc.count(TriggerGCType::EdenGc) > 0);
        assert_eq!(heap.space_of(roots.get(0)), Some(SpaceKind::Semi));
        let last = heap.allocate_young(class(64)).unwrap();
        assert_eq!(heap.space_of(last), Some(SpaceKind::Eden));
        assert!(heap.verify().is_empty());
    }

    #[test]
    pub fn test_app_spawn_freezes_old_space() {
        let (mut heap, roots) = heap_with(config());
        let holder = heap.allocate_old(class(16)).unwrap();
        roots.push(holder);
        heap.compact_before_fork();

        let frozen = roots.get(0);
        assert_eq!(heap.space_of(frozen), Some(SpaceKind::AppSpawn));
        assert_eq!(heap.stats().space(SpaceKind::Old).unwrap().regions, 0);

        // app spawn objects keep what they refer to alive
        roots.clear();
        let young = heap.allocate_young(class(16)).unwrap();
        set_field(&heap, frozen, 0, young);
        heap.collect_garbage(TriggerGCType::YoungGc, GcReason::External);
        heap.collect_garbage(TriggerGCType::OldGc, GcReason::External);
        let moved = field(frozen, 0);
        assert!(heap.space_of(moved).is_some());
        assert_eq!(unsafe { ClassRef::of(moved) }, class(16));
        assert!(heap.verify().is_empty());
    }

    #[test]
    pub fn test_frozen_read_only_refuses_allocation() {
        let (mut heap, _) = heap_with(config());
        let a = heap.allocate_read_only(class(16)).unwrap();
        assert_eq!(heap.space_of(a), Some(SpaceKind::ReadOnly));
        assert!(heap.freeze_read_only());
        assert!(matches!(
            heap.allocate_read_only(class(16)),
            Err(HeapError::OutOfMemory {
                space: SpaceKind::ReadOnly,
                ..
            })
        ));
    }

    #[test]
    pub fn test_idle_collection() {
        let (mut heap, _) = heap_with(config());
        assert_eq!(heap.trigger_idle_collection(), None);
        let half = heap.config().semi_space_min / 2;
        for _ in 0..(half / 64) {
            heap.allocate_young(class(64)).unwrap();
        }
        assert_eq!(heap.trigger_idle_collection(), Some(TriggerGCType::YoungGc));
        assert_eq!(heap.stats().space(SpaceKind::Semi).unwrap().live, 0);
    }

    #[test]
    pub fn test_shared_requests_need_attachment() {
        let (mut heap, _) = heap_with(config());
        assert!(!heap.is_attached());
        assert_eq!(heap.allocate_shared_old(class(16)), Err(HeapError::NotAttached));
        heap.collect_garbage(TriggerGCType::SharedGc, GcReason::External);
        assert_eq!(heap.stats().gc.collections, 0);
    }
}
