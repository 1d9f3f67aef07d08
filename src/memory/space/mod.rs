//! Spaces: policy-bearing collections of regions
//!
//! There are two allocation strategies. [`linear::BumpSpace`] serves
//! the young generation and the never-swept spaces by bump
//! allocation; [`sparse::FreeListSpace`] serves long-lived objects
//! from a free list rebuilt by sweeping. Behaviour that only some
//! spaces need (eden's private pool, the old space's collect set,
//! machine code's address map) is attached as optional add-ons rather
//! than by specialisation. Huge objects get a region each in
//! [`huge::HugeObjectSpace`].

use std::fmt::{self, Display};
use std::sync::Arc;

use super::region::{Region, SpaceFlags};

pub mod code;
pub mod cset;
pub mod eden;
pub mod huge;
pub mod linear;
pub mod sparse;

/// Identity of a space
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SpaceKind {
    Eden,
    Semi,
    Snapshot,
    ReadOnly,
    Old,
    NonMovable,
    MachineCode,
    Local,
    AppSpawn,
    Huge,
    HugeMachineCode,
    SharedOld,
    SharedNonMovable,
    SharedReadOnly,
    SharedHuge,
    SharedLocal,
    SharedAppSpawn,
}

impl SpaceKind {
    pub const ALL: [SpaceKind; 17] = [
        SpaceKind::Eden,
        SpaceKind::Semi,
        SpaceKind::Snapshot,
        SpaceKind::ReadOnly,
        SpaceKind::Old,
        SpaceKind::NonMovable,
        SpaceKind::MachineCode,
        SpaceKind::Local,
        SpaceKind::AppSpawn,
        SpaceKind::Huge,
        SpaceKind::HugeMachineCode,
        SpaceKind::SharedOld,
        SpaceKind::SharedNonMovable,
        SpaceKind::SharedReadOnly,
        SpaceKind::SharedHuge,
        SpaceKind::SharedLocal,
        SpaceKind::SharedAppSpawn,
    ];

    /// The space whose membership flag is `flags`
    pub fn from_flags(flags: SpaceFlags) -> Option<SpaceKind> {
        SpaceKind::ALL.iter().copied().find(|k| k.flag() == flags)
    }

    /// Region membership flag for the space
    pub fn flag(self) -> SpaceFlags {
        match self {
            SpaceKind::Eden => SpaceFlags::EDEN,
            SpaceKind::Semi => SpaceFlags::SEMI,
            SpaceKind::Snapshot => SpaceFlags::SNAPSHOT,
            SpaceKind::ReadOnly => SpaceFlags::READ_ONLY,
            SpaceKind::Old => SpaceFlags::OLD,
            SpaceKind::NonMovable => SpaceFlags::NON_MOVABLE,
            SpaceKind::MachineCode => SpaceFlags::MACHINE_CODE,
            SpaceKind::Local => SpaceFlags::LOCAL,
            SpaceKind::AppSpawn => SpaceFlags::APP_SPAWN,
            SpaceKind::Huge => SpaceFlags::HUGE,
            SpaceKind::HugeMachineCode => SpaceFlags::HUGE_MACHINE_CODE,
            SpaceKind::SharedOld => SpaceFlags::SHARED_OLD,
            SpaceKind::SharedNonMovable => SpaceFlags::SHARED_NON_MOVABLE,
            SpaceKind::SharedReadOnly => SpaceFlags::SHARED_READ_ONLY,
            SpaceKind::SharedHuge => SpaceFlags::SHARED_HUGE,
            SpaceKind::SharedLocal => SpaceFlags::SHARED_LOCAL,
            SpaceKind::SharedAppSpawn => SpaceFlags::SHARED_APP_SPAWN,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SpaceKind::Eden => "eden space",
            SpaceKind::Semi => "semi space",
            SpaceKind::Snapshot => "snapshot space",
            SpaceKind::ReadOnly => "read-only space",
            SpaceKind::Old => "old space",
            SpaceKind::NonMovable => "non-movable space",
            SpaceKind::MachineCode => "machine code space",
            SpaceKind::Local => "local space",
            SpaceKind::AppSpawn => "app spawn space",
            SpaceKind::Huge => "huge object space",
            SpaceKind::HugeMachineCode => "huge machine code space",
            SpaceKind::SharedOld => "shared old space",
            SpaceKind::SharedNonMovable => "shared non-movable space",
            SpaceKind::SharedReadOnly => "shared read-only space",
            SpaceKind::SharedHuge => "shared huge object space",
            SpaceKind::SharedLocal => "shared local space",
            SpaceKind::SharedAppSpawn => "shared app spawn space",
        }
    }

    pub fn is_shared(self) -> bool {
        self.flag().intersects(SpaceFlags::SHARED)
    }
}

impl Display for SpaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Space-wide size accounting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpaceCounters {
    /// Sum of member region capacities
    pub committed: usize,
    /// Bytes of allocated (or surviving) objects
    pub live: usize,
    /// Expansion ceiling excluding overshoot
    pub capacity: usize,
    /// Temporary extension of the ceiling
    pub overshoot: usize,
}

impl SpaceCounters {
    pub fn new(capacity: usize) -> Self {
        SpaceCounters {
            capacity,
            ..SpaceCounters::default()
        }
    }

    /// Whether `bytes` more can be committed
    pub fn can_commit(&self, bytes: usize) -> bool {
        self.committed + bytes <= self.capacity + self.overshoot
    }

    pub fn commit(&mut self, bytes: usize) {
        self.committed += bytes;
    }

    pub fn uncommit(&mut self, bytes: usize) {
        debug_assert!(self.committed >= bytes);
        self.committed -= bytes;
    }

    pub fn increase_live(&mut self, bytes: usize) {
        self.live += bytes;
    }

    pub fn decrease_live(&mut self, bytes: usize) {
        self.live = self.live.saturating_sub(bytes);
    }

    pub fn increase_overshoot(&mut self, bytes: usize) {
        self.overshoot += bytes;
    }

    /// Decay the overshoot by the headroom left under the ceiling.
    ///
    /// Never negative; strictly decreasing while committed is below
    /// capacity and overshoot is positive.
    pub fn adjust_overshoot(&mut self) {
        let headroom = self.capacity.saturating_sub(self.committed);
        self.overshoot = self.overshoot.saturating_sub(headroom);
    }
}

/// Common view of every space for accounting and verification
pub trait Space {
    fn kind(&self) -> SpaceKind;

    fn counters(&self) -> &SpaceCounters;

    fn regions(&self) -> &[Arc<Region>];

    fn committed_size(&self) -> usize {
        self.counters().committed
    }

    fn live_size(&self) -> usize {
        self.counters().live
    }

    fn capacity(&self) -> usize {
        self.counters().capacity
    }

    fn overshoot(&self) -> usize {
        self.counters().overshoot
    }

    fn region_count(&self) -> usize {
        self.regions().len()
    }

    /// Accounting invariant violations, if any
    fn verify_accounting(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let sum: usize = self.regions().iter().map(|r| r.capacity()).sum();
        if sum != self.committed_size() {
            problems.push(format!(
                "{}: committed {:#x} but regions total {:#x}",
                self.kind(),
                self.committed_size(),
                sum
            ));
        }
        if self.live_size() > self.committed_size() {
            problems.push(format!(
                "{}: live {:#x} exceeds committed {:#x}",
                self.kind(),
                self.live_size(),
                self.committed_size()
            ));
        }
        for region in self.regions() {
            if !region.space().contains(self.kind().flag()) {
                problems.push(format!(
                    "{}: member {:?} flagged {:?}",
                    self.kind(),
                    region.span(),
                    region.space()
                ));
            }
            if region.alive() > region.capacity() {
                problems.push(format!("{}: {:?} alive exceeds capacity", self.kind(), region.span()));
            }
        }
        problems
    }
}
