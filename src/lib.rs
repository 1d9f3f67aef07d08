//! Region-based generational heap for a managed language runtime
//!
//! The heap hands out zeroed, class-stamped memory to an external
//! object model and reclaims it through young, partial, full and
//! shared collection cycles. Reachability is supplied by the runtime
//! through the [`memory::mark::Tracer`] trait.
extern crate bitflags;
extern crate bitmaps;
extern crate crossbeam;
extern crate itertools;
extern crate libc;
extern crate log;
extern crate parking_lot;
extern crate rand;
extern crate serde;
extern crate thiserror;
extern crate toml;

pub mod config;
pub mod error;
pub mod memory;

pub use config::HeapConfig;
pub use error::{ConfigError, HeapError};
pub use memory::address::Address;
pub use memory::heap::Heap;
pub use memory::object::{ClassRef, ObjectModel};
pub use memory::shared::SharedHeap;
pub use memory::trigger::{GcReason, TriggerGCType};
