//! Collection kinds and the reasons they were requested

use std::fmt::{self, Display};

/// The kind of collection to run
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TriggerGCType {
    /// Evacuate eden into the semi space
    EdenGc,
    /// Evacuate the young generation
    YoungGc,
    /// Young generation plus a partial old collection
    OldGc,
    /// Everything, compacting the old space
    FullGc,
    /// Full collection, then freeze the old space ahead of a fork
    AppSpawnFullGc,
    /// Mark-sweep of the shared heap
    SharedGc,
    /// Shared collection that also evacuates fragmented regions
    SharedPartialGc,
    /// Compacting shared collection
    SharedFullGc,
}

impl TriggerGCType {
    pub fn is_shared(self) -> bool {
        matches!(
            self,
            TriggerGCType::SharedGc | TriggerGCType::SharedPartialGc | TriggerGCType::SharedFullGc
        )
    }

    /// Collects the old generation as well as the young
    pub fn is_major(self) -> bool {
        matches!(
            self,
            TriggerGCType::OldGc | TriggerGCType::FullGc | TriggerGCType::AppSpawnFullGc
        )
    }

    /// Compacts rather than selecting a collect set
    pub fn is_full(self) -> bool {
        matches!(
            self,
            TriggerGCType::FullGc | TriggerGCType::AppSpawnFullGc | TriggerGCType::SharedFullGc
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            TriggerGCType::EdenGc => "eden",
            TriggerGCType::YoungGc => "young",
            TriggerGCType::OldGc => "old",
            TriggerGCType::FullGc => "full",
            TriggerGCType::AppSpawnFullGc => "app spawn full",
            TriggerGCType::SharedGc => "shared",
            TriggerGCType::SharedPartialGc => "shared partial",
            TriggerGCType::SharedFullGc => "shared full",
        }
    }
}

impl Display for TriggerGCType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How much of the heap the next marking covers
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MarkType {
    /// Young generation only, old objects reached through remembered
    /// slots
    MarkYoung,
    /// Every local space
    MarkFull,
}

/// Why a collection was requested
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum GcReason {
    /// A space crossed its allocation limit
    AllocationLimit,
    /// An allocation could not be satisfied
    AllocationFailed,
    /// The runtime reported an idle period
    Idle,
    /// The process moved to the background
    SwitchBackground,
    /// Requested by the embedder
    External,
    /// Preparing to fork
    AppSpawn,
    Other,
}

impl Display for GcReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            GcReason::AllocationLimit => "allocation limit",
            GcReason::AllocationFailed => "allocation failed",
            GcReason::Idle => "idle",
            GcReason::SwitchBackground => "switch to background",
            GcReason::External => "external",
            GcReason::AppSpawn => "app spawn",
            GcReason::Other => "other",
        };
        f.write_str(text)
    }
}
