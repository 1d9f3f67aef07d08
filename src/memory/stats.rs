//! Heap statistics and the adaptive sizing controller
//!
//! [`HeapStats`] is a point-in-time snapshot of every space plus the
//! running [`GcStats`]. [`MemController`] samples mutator allocation
//! throughput and collector speed, from which the old space and
//! global allocation limits are recomputed after each major cycle.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::config::MB;
use crate::memory::space::{Space, SpaceKind};
use crate::memory::trigger::TriggerGCType;

/// Smallest allocation limit for the old space
pub const MIN_OLD_SPACE_LIMIT: usize = 2 * MB;
/// Smallest global allocation limit
pub const MIN_HEAP_LIMIT: usize = 4 * MB;
/// Least the limit grows by after a collection
pub const MIN_GROWING_STEP: usize = 2 * MB;
pub const MIN_GROWING_FACTOR: f64 = 1.3;
pub const MAX_GROWING_FACTOR: f64 = 4.0;
/// Fraction of time the mutator should get
pub const TARGET_MUTATOR_UTILIZATION: f64 = 0.97;
/// Throughput samples retained
const SAMPLE_WINDOW: usize = 10;

/// Sizes of one space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceStats {
    pub kind: SpaceKind,
    pub committed: usize,
    pub live: usize,
    pub capacity: usize,
    pub overshoot: usize,
    pub regions: usize,
}

impl SpaceStats {
    pub fn of(space: &dyn Space) -> Self {
        SpaceStats {
            kind: space.kind(),
            committed: space.committed_size(),
            live: space.live_size(),
            capacity: space.capacity(),
            overshoot: space.overshoot(),
            regions: space.region_count(),
        }
    }
}

/// Collection counters and timings
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Total number of collections performed
    pub collections: u64,
    /// Collections by kind
    pub by_type: BTreeMap<&'static str, u64>,
    /// Total time spent in collection
    pub total_gc_time: Duration,
    pub average_collection_time: Duration,
    pub last_collection_time: Option<Duration>,
    pub last_collection_at: Option<Instant>,
    pub last_collection_type: Option<TriggerGCType>,
    /// Heap object bytes released across all collections
    pub bytes_freed: u64,
    /// Bytes copied by evacuation
    pub bytes_evacuated: u64,
    /// Bytes moved out of the young generation into old
    pub bytes_promoted: u64,
    /// Old regions evacuated as part of a collect set
    pub cset_regions: u64,
}

impl GcStats {
    /// Account one finished collection
    pub fn record(&mut self, kind: TriggerGCType, pause: Duration, freed: usize) {
        self.collections += 1;
        *self.by_type.entry(kind.name()).or_insert(0) += 1;
        self.total_gc_time += pause;
        self.average_collection_time = self.total_gc_time / self.collections as u32;
        self.last_collection_time = Some(pause);
        self.last_collection_at = Some(Instant::now());
        self.last_collection_type = Some(kind);
        self.bytes_freed += freed as u64;
    }

    /// Verbose evacuation counters, kept only in debug builds or with
    /// `gc-telemetry`
    pub fn record_evacuation(&mut self, evacuated: usize, promoted: usize, cset_regions: usize) {
        #[cfg(any(debug_assertions, feature = "gc-telemetry"))]
        {
            self.bytes_evacuated += evacuated as u64;
            self.bytes_promoted += promoted as u64;
            self.cset_regions += cset_regions as u64;
        }

        #[cfg(not(any(debug_assertions, feature = "gc-telemetry")))]
        {
            let _ = (evacuated, promoted, cset_regions);
        }
    }

    pub fn count(&self, kind: TriggerGCType) -> u64 {
        self.by_type.get(kind.name()).copied().unwrap_or(0)
    }

    /// Time since the last collection finished
    pub fn time_since_last_collection(&self) -> Option<Duration> {
        self.last_collection_at.map(|at| at.elapsed())
    }
}

/// Snapshot of a heap
#[derive(Debug, Clone)]
pub struct HeapStats {
    pub spaces: Vec<SpaceStats>,
    pub gc: GcStats,
    /// Live size beyond which the old space is collected
    pub old_alloc_limit: usize,
    /// Live size beyond which the whole heap is collected
    pub global_alloc_limit: usize,
}

impl HeapStats {
    pub fn space(&self, kind: SpaceKind) -> Option<&SpaceStats> {
        self.spaces.iter().find(|s| s.kind == kind)
    }

    pub fn committed(&self) -> usize {
        self.spaces.iter().map(|s| s.committed).sum()
    }

    pub fn live(&self) -> usize {
        self.spaces.iter().map(|s| s.live).sum()
    }

    pub fn regions(&self) -> usize {
        self.spaces.iter().map(|s| s.regions).sum()
    }
}

/// A quantity of bytes over a duration
#[derive(Debug, Clone, Copy)]
struct Sample {
    bytes: usize,
    duration: Duration,
}

fn throughput_per_ms(samples: &VecDeque<Sample>) -> f64 {
    let bytes: usize = samples.iter().map(|s| s.bytes).sum();
    let millis: f64 = samples.iter().map(|s| s.duration.as_secs_f64() * 1000.0).sum();
    if millis <= 0.0 {
        0.0
    } else {
        bytes as f64 / millis
    }
}

fn push_sample(samples: &mut VecDeque<Sample>, sample: Sample) {
    if samples.len() == SAMPLE_WINDOW {
        samples.pop_front();
    }
    samples.push_back(sample);
}

/// Tracks mutator and collector throughput
#[derive(Debug)]
pub struct MemController {
    /// End of the last collection (or creation)
    mutator_since: Instant,
    /// Start of the collection in progress
    collection_start: Option<Instant>,
    allocations: VecDeque<Sample>,
    collections: VecDeque<Sample>,
    survival_rates: VecDeque<f64>,
}

impl Default for MemController {
    fn default() -> Self {
        MemController {
            mutator_since: Instant::now(),
            collection_start: None,
            allocations: VecDeque::with_capacity(SAMPLE_WINDOW),
            collections: VecDeque::with_capacity(SAMPLE_WINDOW),
            survival_rates: VecDeque::with_capacity(SAMPLE_WINDOW),
        }
    }
}

impl MemController {
    pub fn new() -> Self {
        Self::default()
    }

    /// A collection begins; `allocated` bytes were allocated since the
    /// previous one ended
    pub fn start_collection(&mut self, allocated: usize) {
        let now = Instant::now();
        push_sample(
            &mut self.allocations,
            Sample {
                bytes: allocated,
                duration: now.duration_since(self.mutator_since),
            },
        );
        self.collection_start = Some(now);
    }

    /// The collection ended having processed `processed` live bytes
    pub fn stop_collection(&mut self, processed: usize) -> Duration {
        let now = Instant::now();
        let pause = self
            .collection_start
            .take()
            .map(|start| now.duration_since(start))
            .unwrap_or_default();
        push_sample(
            &mut self.collections,
            Sample {
                bytes: processed,
                duration: pause,
            },
        );
        self.mutator_since = now;
        pause
    }

    /// Recent mutator allocation throughput in bytes per millisecond
    pub fn allocation_speed_per_ms(&self) -> f64 {
        throughput_per_ms(&self.allocations)
    }

    /// Recent collector throughput in bytes per millisecond
    pub fn gc_speed_per_ms(&self) -> f64 {
        throughput_per_ms(&self.collections)
    }

    pub fn record_survival_rate(&mut self, rate: f64) {
        if self.survival_rates.len() == SAMPLE_WINDOW {
            self.survival_rates.pop_front();
        }
        self.survival_rates.push_back(rate.clamp(0.0, 1.0));
    }

    pub fn average_survival_rate(&self) -> f64 {
        if self.survival_rates.is_empty() {
            0.0
        } else {
            self.survival_rates.iter().sum::<f64>() / self.survival_rates.len() as f64
        }
    }

    /// Limit growth factor keeping the mutator near its target share
    /// of time, given collector and mutator speeds
    pub fn calculate_growing_factor(gc_speed: f64, mutator_speed: f64) -> f64 {
        if gc_speed <= 0.0 || mutator_speed <= 0.0 {
            return MAX_GROWING_FACTOR;
        }
        let speed_ratio = gc_speed / mutator_speed;
        let a = speed_ratio * (1.0 - TARGET_MUTATOR_UTILIZATION);
        let b = speed_ratio * (1.0 - TARGET_MUTATOR_UTILIZATION) - TARGET_MUTATOR_UTILIZATION;
        let factor = if a < b * MAX_GROWING_FACTOR {
            a / b
        } else {
            MAX_GROWING_FACTOR
        };
        factor.clamp(MIN_GROWING_FACTOR, MAX_GROWING_FACTOR)
    }

    /// Next allocation limit for a space currently holding `current`
    /// bytes
    pub fn calculate_alloc_limit(
        current: usize,
        min: usize,
        max: usize,
        new_space_capacity: usize,
        factor: f64,
    ) -> usize {
        let grown = (current as f64 * factor) as usize;
        let mut limit = grown.max(current + MIN_GROWING_STEP) + new_space_capacity;
        limit = limit.max(min);
        limit = limit.min((current + max) / 2);
        limit.min(max)
    }
}
