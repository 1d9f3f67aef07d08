//! Evacuation: copying marked objects out of regions being vacated
//!
//! Each marked object of a source region is copied to wherever the
//! caller's destination function places it, and a forwarding word is
//! left behind. Once every source is evacuated, slots are fixed up:
//! any slot still referring to a forwarded object is rewritten to the
//! copy, and the remembered sets the new value requires are recorded.

use log::trace;

use super::address::Address;
use super::mark::{load_reference, object_region, remember_slot, Tracer};
use super::object::{forward, forwarding_address, object_size, ClassRef, ObjectModel, Slot};
use super::pool::RegionAllocator;
use super::region::Region;

pub struct Evacuation<'a> {
    regions: &'a RegionAllocator,
    model: &'a dyn ObjectModel,
    tracer: Option<&'a dyn Tracer>,
    copies: Vec<Address>,
    copied_bytes: usize,
}

impl<'a> Evacuation<'a> {
    pub fn new(regions: &'a RegionAllocator, model: &'a dyn ObjectModel, tracer: Option<&'a dyn Tracer>) -> Self {
        Evacuation {
            regions,
            model,
            tracer,
            copies: Vec::new(),
            copied_bytes: 0,
        }
    }

    /// Copy every marked object of `region` to the address `dest`
    /// chooses for it. Copies are marked and counted alive in their
    /// new region. Fails with the size of the first object that could
    /// not be placed.
    pub fn evacuate_region<F>(&mut self, region: &Region, mut dest: F) -> Result<usize, usize>
    where
        F: FnMut(&Region, Address, usize) -> Option<Address>,
    {
        let objects: Vec<Address> = region.marked_objects().collect();
        let mut bytes = 0;
        for obj in objects {
            let size = unsafe { object_size(self.model, obj) };
            let to = dest(region, obj, size).ok_or(size)?;
            unsafe {
                obj.copy_to(to, size);
                forward(obj, to);
            }
            if let Some(target) = self.regions.region_of(to) {
                if target.mark(to) {
                    target.increase_alive(size);
                }
            }
            if let Some(tracer) = self.tracer {
                tracer.relocated(obj, to);
            }
            self.copies.push(to);
            bytes += size;
        }
        self.copied_bytes += bytes;
        trace!("evacuated {:#x} bytes from {:?}", bytes, region.span());
        Ok(bytes)
    }

    /// Where a reference now points
    pub fn resolve(&self, value: Address) -> Address {
        match object_region(self.regions, value) {
            Some(_) => unsafe { forwarding_address(value) }.unwrap_or(value),
            None => value,
        }
    }

    /// Rewrite `slot` if it refers to a forwarded object and record
    /// the remembered set entry its value needs
    pub fn fixup_slot(&self, slot: Slot) {
        let value = match unsafe { load_reference(slot) } {
            Some(value) => value,
            None => return,
        };
        let resolved = self.resolve(value);
        if resolved != value {
            unsafe { slot.store_word(resolved.as_usize()) };
        }
        remember_slot(self.regions, slot, resolved);
    }

    pub fn fixup_roots(&self, tracer: &dyn Tracer) {
        tracer.visit_roots(&mut |slot| self.fixup_slot(slot));
    }

    /// Fix up every reference slot of the object at `obj`
    pub fn fixup_object(&self, obj: Address) {
        let class = unsafe { ClassRef::of(obj) };
        self.model
            .visit_references(class, obj, &mut |slot| self.fixup_slot(slot));
    }

    /// Fix up the slots of every marked object in `region`
    pub fn fixup_region(&self, region: &Region) {
        for obj in region.marked_objects() {
            self.fixup_object(obj);
        }
    }

    /// Fix up the slots of every copy made so far
    pub fn fixup_copies(&self) {
        for obj in &self.copies {
            self.fixup_object(*obj);
        }
    }

    pub fn copies(&self) -> &[Address] {
        &self.copies
    }

    pub fn copied_bytes(&self) -> usize {
        self.copied_bytes
    }
}
