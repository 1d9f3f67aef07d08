//! Heap memory management
//!
//! Memory is mapped in regions from a shared pool. Spaces group
//! regions under an allocation policy; a [`heap::Heap`] owns the local
//! spaces of one execution context and a [`shared::SharedHeap`] the
//! spaces every context can reach.
pub mod address;
pub mod bump;
pub mod daemon;
pub mod evacuate;
pub mod freelist;
pub mod heap;
pub mod mark;
pub mod object;
pub mod pool;
pub mod region;
pub mod safepoint;
pub mod shared;
pub mod space;
pub mod stats;
pub mod sweeper;
pub mod sys;
pub mod tlab;
pub mod trigger;
