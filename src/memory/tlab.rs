//! Thread local allocation buffers
//!
//! A TLAB is a private bump area carved from a shared space so the
//! hot allocation path takes no lock. It is refilled in whole chunks
//! of the configured size. A refill failure or a chunk of the wrong
//! size disables the buffer until it is explicitly re-enabled.

use log::debug;

use super::address::{Address, Span};
use super::bump::BumpAllocator;

#[derive(Debug)]
pub struct ThreadLocalAllocationBuffer {
    bump: BumpAllocator,
    chunk_size: usize,
    enabled: bool,
    refills: usize,
}

impl ThreadLocalAllocationBuffer {
    pub fn new(chunk_size: usize) -> Self {
        ThreadLocalAllocationBuffer {
            bump: BumpAllocator::default(),
            chunk_size,
            enabled: true,
            refills: 0,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Whether requests of `size` bytes go through the buffer at all
    pub fn serves(&self, size: usize) -> bool {
        self.enabled && size <= self.chunk_size / 2
    }

    #[inline]
    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        if !self.enabled {
            return None;
        }
        self.bump.allocate(size)
    }

    /// Install a fresh chunk. A chunk of the wrong size disables the
    /// buffer and is handed back.
    pub fn refill(&mut self, chunk: Span) -> Result<(), Span> {
        debug_assert!(self.bump.remainder().is_empty(), "refill before retire");
        if !self.enabled || chunk.len() != self.chunk_size {
            debug!(
                "tlab chunk of {:#x} bytes (expected {:#x}), disabling",
                chunk.len(),
                self.chunk_size
            );
            self.disable();
            return Err(chunk);
        }
        self.bump.reset(chunk);
        self.refills += 1;
        Ok(())
    }

    /// Give up the current chunk, returning its unused remainder
    pub fn retire(&mut self) -> Span {
        let rest = self.bump.take_remainder();
        self.bump.clear();
        rest
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn refills(&self) -> usize {
        self.refills
    }

    pub fn remaining(&self) -> usize {
        self.bump.available()
    }
}
