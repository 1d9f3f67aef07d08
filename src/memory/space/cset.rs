//! Collect set selection for partial old collections
//!
//! The collect set is the group of sparsely populated old regions
//! whose survivors are evacuated so the regions can be freed whole.
//! Selected regions leave the space's region list and free list; the
//! free blocks are kept so the selection can be reverted if the cycle
//! is abandoned.

use std::sync::Arc;

use itertools::Itertools;
use log::{debug, info};

use super::sparse::FreeListSpace;
use super::Space;
use crate::memory::address::Span;
use crate::memory::region::Region;

/// Lower bound on the per-cycle region ceiling
pub const INITIAL_COLLECT_REGIONS: usize = 16;

#[derive(Debug, Default)]
pub struct CollectSet {
    pub(super) regions: Vec<Arc<Region>>,
    /// Free blocks detached with each selected region
    detached: Vec<Vec<Span>>,
}

impl CollectSet {
    pub fn regions(&self) -> &[Arc<Region>] {
        &self.regions
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Bytes expected to survive evacuation
    pub fn alive(&self) -> usize {
        self.regions.iter().map(|r| r.alive()).sum()
    }
}

/// Inputs to a selection
#[derive(Debug, Clone, Copy)]
pub struct CollectSetParams {
    pub in_background: bool,
    pub foreground_budget: usize,
    pub background_budget: usize,
    /// Fewer candidates than this and no partial collection happens
    pub min_regions: usize,
    /// Committed minus live heap bytes after the last collection
    pub expected_free: usize,
}

impl CollectSetParams {
    fn budget(&self) -> usize {
        let budget = if self.in_background {
            self.background_budget
        } else {
            self.foreground_budget
        };
        budget.min(self.expected_free)
    }
}

impl FreeListSpace {
    /// Choose the collect set by ascending liveness within the
    /// evacuation budget. Returns the number of regions selected; zero
    /// when too few regions qualify.
    pub fn select_cset(&mut self, params: &CollectSetParams) -> usize {
        debug_assert!(self.cset.is_empty(), "collect set already selected");
        if !self.policy.evacuates {
            return 0;
        }
        let candidates: Vec<Arc<Region>> = self
            .regions
            .iter()
            .filter(|r| {
                if params.in_background {
                    r.below_compress_threshold_alive() || !r.most_object_alive()
                } else {
                    !r.most_object_alive()
                }
            })
            .sorted_by_key(|r| r.alive())
            .cloned()
            .collect();

        if candidates.len() < params.min_regions {
            debug!(
                "{}: {} candidates below the minimum of {}, no collect set",
                self.kind,
                candidates.len(),
                params.min_regions
            );
            return 0;
        }

        let mut budget = params.budget() as isize;
        let mut selected = 0;
        for region in &candidates {
            if budget <= 0 {
                break;
            }
            budget -= region.alive() as isize;
            selected += 1;
        }
        let ceiling = (self.regions.len() / 2).max(INITIAL_COLLECT_REGIONS);
        selected = selected.min(ceiling);

        for region in candidates.into_iter().take(selected) {
            let free = self.detach_region(&region);
            region.set_in_collect_set(true);
            self.cset.regions.push(region);
            self.cset.detached.push(free);
        }
        info!(
            "{}: collect set of {} regions, {:#x} alive",
            self.kind,
            self.cset.len(),
            self.cset.alive()
        );
        selected
    }

    /// Place every region in the collect set, for a compacting cycle
    pub fn select_all_for_compaction(&mut self) -> usize {
        debug_assert!(self.cset.is_empty(), "collect set already selected");
        if !self.policy.evacuates {
            return 0;
        }
        let all = self.regions.clone();
        for region in &all {
            let free = self.detach_region(region);
            region.set_in_collect_set(true);
            self.cset.regions.push(region.clone());
            self.cset.detached.push(free);
        }
        all.len()
    }

    pub fn collect_set(&self) -> &CollectSet {
        &self.cset
    }

    /// Abandon the selection, restoring regions and free blocks
    pub fn revert_cset(&mut self) {
        let regions = std::mem::take(&mut self.cset.regions);
        let detached = std::mem::take(&mut self.cset.detached);
        debug!("{}: reverting collect set of {} regions", self.kind, regions.len());
        for (region, free) in regions.into_iter().zip(detached) {
            region.set_in_collect_set(false);
            self.add_region(region, &free);
        }
    }

    /// Free the evacuated collect set regions
    pub fn reclaim_cset(&mut self) -> usize {
        let regions = std::mem::take(&mut self.cset.regions);
        self.cset.detached.clear();
        let bytes = regions.iter().map(|r| r.capacity()).sum();
        for region in &regions {
            region.set_in_collect_set(false);
            self.region_allocator.free_region(region);
        }
        debug!("{}: reclaimed {:#x} from the collect set", self.kind, bytes);
        bytes
    }
}
