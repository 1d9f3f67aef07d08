//! Heap and configuration errors
use std::io;
use thiserror::Error;

use crate::memory::space::SpaceKind;

/// Errors surfaced to the calling context by the heap
///
/// Transient allocation misses never appear here: spaces report them
/// as `None` and the heap's retry ladder absorbs them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeapError {
    /// Capacity including overshoot exhausted after collection
    #[error("out of memory allocating {size} bytes in {space}")]
    OutOfMemory { size: usize, space: SpaceKind },
    /// Request size outside what the allocation path supports
    #[error("invalid allocation size {size} (maximum {max})")]
    InvalidSize { size: usize, max: usize },
    /// Shared allocation from a heap with no shared heap
    #[error("heap is not attached to a shared heap")]
    NotAttached,
}

impl HeapError {
    pub fn out_of_memory(size: usize, space: SpaceKind) -> Self {
        HeapError::OutOfMemory { size, space }
    }

    /// Whether the runtime may surface this to user code as a
    /// catchable exception
    pub fn is_recoverable(&self) -> bool {
        matches!(self, HeapError::OutOfMemory { .. })
    }
}

/// Errors in heap configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("region size {0:#x} must be a power of two of at least 16KiB")]
    BadRegionSize(usize),
    #[error("{name} ({value:#x}) must be a multiple of the region size")]
    NotRegionMultiple { name: &'static str, value: usize },
    #[error("{min_name} ({min:#x}) exceeds {max_name} ({max:#x})")]
    BadRange {
        min_name: &'static str,
        min: usize,
        max_name: &'static str,
        max: usize,
    },
    #[error("heap size {heap:#x} leaves less than {required:#x} for the old space")]
    HeapTooSmall { heap: usize, required: usize },
    #[error("{0} must be within (0, 1]")]
    BadRatio(&'static str),
    #[error("heap region size {heap:#x} differs from the shared heap's {shared:#x}")]
    RegionSizeMismatch { heap: usize, shared: usize },
    #[error("invalid heap configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    pub fn test_oom_message_names_space() {
        let e = HeapError::out_of_memory(4096, SpaceKind::Old);
        assert_eq!(format!("{}", e), "out of memory allocating 4096 bytes in old space");
        assert!(e.is_recoverable());
        assert!(!HeapError::NotAttached.is_recoverable());
    }
}
