//! Heap configuration
//!
//! All sizes are in bytes. A configuration may be built in code with
//! the `with_*` methods or read from TOML, where any option left out
//! takes its default.

use std::{fs, path::Path};

use serde::Deserialize;

use crate::error::ConfigError;
use crate::memory::address::{align_down, is_aligned, WORD_SIZE};

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Smallest legal region size
pub const MIN_REGION_SIZE: usize = 16 * KB;

/// Minimum number of regions left over for the old space
pub const MIN_OLD_SPACE_REGIONS: usize = 8;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeapConfig {
    /// Canonical region size (power of two)
    pub region_size: usize,
    /// Ceiling on the whole per-context heap
    pub max_heap_size: usize,
    /// Initial (and minimum) semi space capacity
    pub semi_space_min: usize,
    /// Largest capacity adaptive sizing may grow a semi space to
    pub semi_space_max: usize,
    /// Overshoot granted per step to a linear space mid-collection
    pub semi_space_step_overshoot: usize,
    /// Allocate young objects in a private eden pool first
    pub eden_enabled: bool,
    /// Regions reserved up front for the eden pool
    pub eden_regions: usize,
    pub non_movable_capacity: usize,
    pub machine_code_capacity: usize,
    pub read_only_capacity: usize,
    pub snapshot_capacity: usize,
    /// Overshoot granted to a space when allocation fails after a full
    /// collection
    pub oom_overshoot_size: usize,
    pub old_space_step_overshoot: usize,
    pub old_space_max_overshoot: usize,
    /// Live bytes a partial collection may evacuate in the foreground
    pub evacuation_budget_foreground: usize,
    /// Live bytes a partial collection may evacuate in the background
    pub evacuation_budget_background: usize,
    /// Fewest candidate regions worth a partial collection
    pub cset_min_regions: usize,
    /// Place machine code instructions in a fixed address range
    pub code_fort_enabled: bool,
    pub code_fort_size: usize,
    /// Size of each thread local allocation buffer refill
    pub tlab_size: usize,
    /// Regular mappings kept committed in the pool before further
    /// releases are discarded
    pub regular_cache_limit: usize,
    /// Ceiling on memory handed out by the mapping pool (0: unlimited)
    pub map_pool_capacity: usize,
    pub shared_heap_size: usize,
    pub shared_non_movable_capacity: usize,
    /// Background sweeper threads (0 sweeps on the mutator)
    pub sweeper_threads: usize,
    pub concurrent_sweep: bool,
    /// Fraction of huge space capacity beyond which huge allocation
    /// requests a full mark
    pub huge_full_mark_ratio: f64,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            region_size: 256 * KB,
            max_heap_size: 128 * MB,
            semi_space_min: 2 * MB,
            semi_space_max: 8 * MB,
            semi_space_step_overshoot: 2 * MB,
            eden_enabled: false,
            eden_regions: 4,
            non_movable_capacity: 4 * MB,
            machine_code_capacity: 8 * MB,
            read_only_capacity: 256 * KB,
            snapshot_capacity: 4 * MB,
            oom_overshoot_size: 2 * MB,
            old_space_step_overshoot: 4 * MB,
            old_space_max_overshoot: 8 * MB,
            evacuation_budget_foreground: 2 * MB,
            evacuation_budget_background: 6 * MB,
            cset_min_regions: 5,
            code_fort_enabled: false,
            code_fort_size: MB,
            tlab_size: 32 * KB,
            regular_cache_limit: 64,
            map_pool_capacity: 0,
            shared_heap_size: 64 * MB,
            shared_non_movable_capacity: 4 * MB,
            sweeper_threads: 2,
            concurrent_sweep: true,
            huge_full_mark_ratio: 0.8,
        }
    }
}

impl HeapConfig {
    /// Parse a configuration from TOML and validate it
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: HeapConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// A compact configuration with small regions, useful for
    /// embedding in constrained processes
    pub fn compact(region_size: usize) -> Self {
        HeapConfig {
            region_size,
            max_heap_size: 64 * region_size,
            semi_space_min: 2 * region_size,
            semi_space_max: 8 * region_size,
            semi_space_step_overshoot: region_size,
            eden_regions: 2,
            non_movable_capacity: 4 * region_size,
            machine_code_capacity: 4 * region_size,
            read_only_capacity: region_size,
            snapshot_capacity: 2 * region_size,
            oom_overshoot_size: region_size,
            old_space_step_overshoot: 2 * region_size,
            old_space_max_overshoot: 4 * region_size,
            evacuation_budget_foreground: 4 * region_size,
            evacuation_budget_background: 8 * region_size,
            code_fort_size: 2 * region_size,
            tlab_size: region_size / 8,
            shared_heap_size: 32 * region_size,
            shared_non_movable_capacity: 4 * region_size,
            ..HeapConfig::default()
        }
    }

    pub fn with_region_size(mut self, size: usize) -> Self {
        self.region_size = size;
        self
    }

    pub fn with_max_heap_size(mut self, size: usize) -> Self {
        self.max_heap_size = size;
        self
    }

    pub fn with_semi_space(mut self, min: usize, max: usize) -> Self {
        self.semi_space_min = min;
        self.semi_space_max = max;
        self
    }

    pub fn with_eden(mut self, regions: usize) -> Self {
        self.eden_enabled = regions > 0;
        self.eden_regions = regions;
        self
    }

    pub fn with_code_fort(mut self, enabled: bool) -> Self {
        self.code_fort_enabled = enabled;
        self
    }

    pub fn with_sweeper_threads(mut self, threads: usize) -> Self {
        self.sweeper_threads = threads;
        self.concurrent_sweep = threads > 0;
        self
    }

    pub fn with_oom_overshoot(mut self, size: usize) -> Self {
        self.oom_overshoot_size = size;
        self
    }

    pub fn with_shared_heap_size(mut self, size: usize) -> Self {
        self.shared_heap_size = size;
        self
    }

    /// Capacity left to the old space after the fixed spaces
    pub fn old_space_capacity(&self) -> usize {
        self.max_heap_size.saturating_sub(self.fixed_capacities())
    }

    /// Capacity of the shared old space
    pub fn shared_old_capacity(&self) -> usize {
        self.shared_heap_size
            .saturating_sub(self.shared_non_movable_capacity + self.read_only_capacity)
    }

    /// Largest object served from a regular region
    pub fn max_regular_object_size(&self) -> usize {
        align_down(self.region_size * 2 / 3, WORD_SIZE)
    }

    fn fixed_capacities(&self) -> usize {
        self.semi_space_min * 2
            + self.non_movable_capacity
            + self.machine_code_capacity
            + self.read_only_capacity
            + self.snapshot_capacity
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.region_size.is_power_of_two() || self.region_size < MIN_REGION_SIZE {
            return Err(ConfigError::BadRegionSize(self.region_size));
        }

        let multiples = [
            ("semi_space_min", self.semi_space_min),
            ("semi_space_max", self.semi_space_max),
            ("non_movable_capacity", self.non_movable_capacity),
            ("machine_code_capacity", self.machine_code_capacity),
            ("read_only_capacity", self.read_only_capacity),
            ("snapshot_capacity", self.snapshot_capacity),
            ("code_fort_size", self.code_fort_size),
            ("shared_heap_size", self.shared_heap_size),
            ("shared_non_movable_capacity", self.shared_non_movable_capacity),
        ];
        for (name, value) in multiples {
            if !is_aligned(value, self.region_size) {
                return Err(ConfigError::NotRegionMultiple { name, value });
            }
        }

        if self.semi_space_min > self.semi_space_max || self.semi_space_min == 0 {
            return Err(ConfigError::BadRange {
                min_name: "semi_space_min",
                min: self.semi_space_min,
                max_name: "semi_space_max",
                max: self.semi_space_max,
            });
        }

        if self.old_space_step_overshoot > self.old_space_max_overshoot {
            return Err(ConfigError::BadRange {
                min_name: "old_space_step_overshoot",
                min: self.old_space_step_overshoot,
                max_name: "old_space_max_overshoot",
                max: self.old_space_max_overshoot,
            });
        }

        if self.tlab_size == 0 || self.tlab_size > self.region_size || !is_aligned(self.tlab_size, WORD_SIZE) {
            return Err(ConfigError::BadRange {
                min_name: "tlab_size",
                min: self.tlab_size,
                max_name: "region_size",
                max: self.region_size,
            });
        }

        let required = MIN_OLD_SPACE_REGIONS * self.region_size;
        if self.max_heap_size < self.fixed_capacities() + required {
            return Err(ConfigError::HeapTooSmall {
                heap: self.max_heap_size,
                required: self.fixed_capacities() + required,
            });
        }
        if self.shared_old_capacity() < required {
            return Err(ConfigError::HeapTooSmall {
                heap: self.shared_heap_size,
                required: self.shared_non_movable_capacity + self.read_only_capacity + required,
            });
        }

        if !(self.huge_full_mark_ratio > 0.0 && self.huge_full_mark_ratio <= 1.0) {
            return Err(ConfigError::BadRatio("huge_full_mark_ratio"));
        }

        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    pub fn test_defaults_are_valid() {
        HeapConfig::default().validate().unwrap();
        HeapConfig::compact(64 * KB).validate().unwrap();
    }

    #[test]
    pub fn test_old_space_gets_the_remainder() {
        let config = HeapConfig::default();
        assert_eq!(
            config.old_space_capacity(),
            128 * MB - (4 * MB + 4 * MB + 8 * MB + 256 * KB + 4 * MB)
        );
    }

    #[test]
    pub fn test_rejects_bad_region_size() {
        let config = HeapConfig::default().with_region_size(100_000);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadRegionSize(100_000))
        ));
    }

    #[test]
    pub fn test_rejects_inverted_semi_range() {
        let config = HeapConfig::default().with_semi_space(8 * MB, 2 * MB);
        assert!(matches!(config.validate(), Err(ConfigError::BadRange { .. })));
    }

    #[test]
    pub fn test_rejects_tiny_heap() {
        let config = HeapConfig::default().with_max_heap_size(16 * MB);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::HeapTooSmall { .. })
        ));
    }

    #[test]
    pub fn test_partial_toml() {
        let config = HeapConfig::from_toml_str(
            r#"
            region_size = 65536
            semi_space_min = 131072
            semi_space_max = 524288
            eden_enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(config.region_size, 64 * KB);
        assert!(config.eden_enabled);
        assert_eq!(config.tlab_size, 32 * KB);
    }

    #[test]
    pub fn test_unknown_option_rejected() {
        assert!(matches!(
            HeapConfig::from_toml_str("regoin_size = 65536"),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    pub fn test_max_regular_object() {
        let config = HeapConfig::compact(64 * KB);
        assert_eq!(config.max_regular_object_size(), align_down(64 * KB * 2 / 3, 8));
    }
}
