//! Machine code add-on
//!
//! Code objects are ordinary heap objects whose instructions either
//! follow the header inline or live in the fort, a separately mapped
//! executable range managed by its own free list. Either way the
//! instruction range is entered in an interval map so a program
//! counter can be resolved to the owning code object.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, trace};

use crate::memory::address::{align_up, Address, Span, OBJECT_ALIGNMENT};
use crate::memory::freelist::FreeListAllocator;
use crate::memory::pool::RegionAllocator;

/// Instruction ranges by start address
#[derive(Debug, Default)]
pub struct MachineCodeMap {
    ranges: BTreeMap<Address, (Address, Address)>,
}

impl MachineCodeMap {
    /// Record that `instructions` belong to the code object `owner`
    pub fn insert(&mut self, instructions: Span, owner: Address) {
        debug_assert!(
            self.owner_of(instructions.begin()).is_none(),
            "overlapping code range at {}",
            instructions.begin()
        );
        self.ranges
            .insert(instructions.begin(), (instructions.end(), owner));
    }

    /// The code object whose instructions contain `pc`
    pub fn owner_of(&self, pc: Address) -> Option<Address> {
        self.ranges
            .range(..=pc)
            .next_back()
            .filter(|(_, (end, _))| pc < *end)
            .map(|(_, (_, owner))| *owner)
    }

    /// Drop entries whose owner fails `live`, returning their
    /// instruction ranges
    pub fn purge<F: Fn(Address) -> bool>(&mut self, live: F) -> Vec<Span> {
        let dead: Vec<Span> = self
            .ranges
            .iter()
            .filter(|(_, (_, owner))| !live(*owner))
            .map(|(begin, (end, _))| Span::between(*begin, *end))
            .collect();
        for span in &dead {
            self.ranges.remove(&span.begin());
        }
        dead
    }

    /// Follow a code object to its new address
    pub fn relocate(&mut self, from: Address, to: Address) {
        for (_, owner) in self.ranges.values_mut() {
            if *owner == from {
                *owner = to;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// A reserved range for out-of-line instructions
pub struct CodeFort {
    span: Span,
    allocator: FreeListAllocator,
    used: usize,
    region_allocator: Arc<RegionAllocator>,
}

impl CodeFort {
    pub fn reserve(size: usize, region_allocator: Arc<RegionAllocator>) -> Option<Self> {
        let size = align_up(size, region_allocator.region_size());
        let span = region_allocator
            .pool()
            .allocate(size, region_allocator.region_size())?;
        let mut allocator = FreeListAllocator::new();
        allocator.add_span(span);
        debug!("code fort reserved at {:?}", span);
        Some(CodeFort {
            span,
            allocator,
            used: 0,
            region_allocator,
        })
    }

    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        let size = align_up(size, OBJECT_ALIGNMENT);
        let addr = self.allocator.allocate(size)?;
        self.used += size;
        trace!("fort: {:#x} bytes at {}", size, addr);
        Some(addr)
    }

    pub fn free(&mut self, instructions: Span) {
        debug_assert!(self.span.encloses(&instructions));
        let len = align_up(instructions.len(), OBJECT_ALIGNMENT);
        self.allocator.free(instructions.begin(), len);
        self.used -= len;
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.span.contains(addr)
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn span(&self) -> Span {
        self.span
    }
}

impl Drop for CodeFort {
    fn drop(&mut self) {
        self.region_allocator.pool().release(self.span);
    }
}

/// State carried by machine code spaces
#[derive(Default)]
pub struct CodeSpaceAddOn {
    map: MachineCodeMap,
    fort: Option<CodeFort>,
}

impl CodeSpaceAddOn {
    pub fn new(fort: Option<CodeFort>) -> Self {
        CodeSpaceAddOn {
            map: MachineCodeMap::default(),
            fort,
        }
    }

    pub fn map(&self) -> &MachineCodeMap {
        &self.map
    }

    pub fn map_mut(&mut self) -> &mut MachineCodeMap {
        &mut self.map
    }

    pub fn fort(&self) -> Option<&CodeFort> {
        self.fort.as_ref()
    }

    pub fn fort_mut(&mut self) -> Option<&mut CodeFort> {
        self.fort.as_mut()
    }

    /// Forget code objects that did not survive marking and give
    /// their out-of-line instructions back to the fort
    pub fn purge<F: Fn(Address) -> bool>(&mut self, live: F) -> usize {
        let dead = self.map.purge(live);
        if let Some(fort) = &mut self.fort {
            for span in &dead {
                if fort.contains(span.begin()) {
                    fort.free(*span);
                }
            }
        }
        dead.len()
    }
}
