//! Write barriers
//!
//! Every store of a reference into managed memory goes through one of the
//! barriers on [`Mutator`]. A store needs recording only when the slot is
//! outside the nursery and the value is inside it; everything else is
//! filtered by the inline fast path.
//!
//! What gets recorded depends on the configured [`BarrierKind`]:
//!
//! - **remset**: the slot (or range, object, value array) goes into the
//!   thread's store buffer, which spills into the global list when full
//! - **cardtable**: the card covering the slot is dirtied, or the dirty flag
//!   of the large object holding it
//!
//! Only slots inside major sections or large objects are recorded. Host
//! memory is reached through roots, which every collection scans.

use crate::address::Address;
use crate::config::BarrierKind;
use crate::error::GcResult;
use crate::heap::HeapInner;
use crate::mutator::Mutator;
use crate::object::ObjectRef;
use crate::remset::{RemsetEntry, StoreBuffer};
use crate::trace::for_each_slot;
use crate::types::TypeId;

impl HeapInner {
    /// Dirty the card or large object holding `slot`
    pub(crate) fn mark_card(&self, slot: Address) {
        match self.sections.find(slot) {
            Some(section) => section.mark_card(slot),
            None => {
                self.los.mark_dirty(slot);
            }
        }
    }

    /// Record a remset entry whose first slot is `at`
    fn remember(&self, ssb: &mut StoreBuffer, at: Address, entry: RemsetEntry) {
        if self.is_heap_slot(at) && ssb.push(entry) {
            ssb.flush_into(&self.remset);
        }
    }
}

impl Mutator {
    #[inline]
    fn is_young(&self, value: Address) -> bool {
        self.heap.inner.nursery_range.contains(value)
    }

    #[inline]
    fn needs_record(&self, slot: Address, value: Address) -> bool {
        let nursery = self.heap.inner.nursery_range;
        !value.is_null() && nursery.contains(value) && !nursery.contains(slot)
    }

    #[cold]
    fn record_slot(&mut self, slot: Address) {
        let heap = &*self.heap.inner;
        match heap.config.barrier {
            BarrierKind::Remset => {
                heap.remember(&mut self.local.ssb, slot, RemsetEntry::Location(slot));
            }
            BarrierKind::CardTable => heap.mark_card(slot),
        }
    }

    /// Store `value` into the reference field `slot` of `obj`
    ///
    /// # Safety
    /// `slot` must be a reference slot of the live object `obj`; `value`
    /// must be null or a live object.
    #[inline]
    pub unsafe fn store_field(&mut self, obj: Address, slot: Address, value: Address) {
        debug_assert!(slot > obj, "slot {slot} is not a field of {obj}");
        if self.needs_record(slot, value) {
            self.record_slot(slot);
        }
        // SAFETY: forwarded to the caller
        unsafe { slot.store_address(value) };
    }

    /// Store `value` into the element slot `slot` of `array`
    ///
    /// # Safety
    /// Same as [`Mutator::store_field`].
    #[inline]
    pub unsafe fn store_array_element(&mut self, array: Address, slot: Address, value: Address) {
        // SAFETY: forwarded to the caller
        unsafe { self.store_field(array, slot, value) };
    }

    /// Store `value` into `slot` when the containing object is unknown.
    /// Slots outside the heap are stored without recording.
    ///
    /// # Safety
    /// `slot` must be a writable word; `value` must be null or a live
    /// object.
    #[inline]
    pub unsafe fn generic_store(&mut self, slot: Address, value: Address) {
        if self.needs_record(slot, value) {
            self.record_slot(slot);
        }
        // SAFETY: forwarded to the caller
        unsafe { slot.store_address(value) };
    }

    /// Copy `count` reference words from `src` to `dest` (overlap allowed)
    ///
    /// # Safety
    /// Both ranges must be `count` reference slots of live memory.
    pub unsafe fn copy_references(&mut self, dest: Address, src: Address, count: usize) {
        // SAFETY: forwarded to the caller
        unsafe { std::ptr::copy(src.as_mut_ptr::<usize>(), dest.as_mut_ptr::<usize>(), count) };
        if count == 0 || self.is_young(dest) {
            return;
        }
        let heap = &*self.heap.inner;
        let nursery = heap.nursery_range;
        match heap.config.barrier {
            BarrierKind::Remset => {
                // SAFETY: the range was just written
                let young = (0..count)
                    .any(|i| nursery.contains(unsafe { dest.word(i).load_address() }));
                if young {
                    let entry = RemsetEntry::Range { start: dest, count };
                    heap.remember(&mut self.local.ssb, dest, entry);
                }
            }
            BarrierKind::CardTable => {
                for i in 0..count {
                    let slot = dest.word(i);
                    // SAFETY: as above
                    if nursery.contains(unsafe { slot.load_address() }) {
                        heap.mark_card(slot);
                    }
                }
            }
        }
    }

    /// Copy `count` inline values of value type `ty` from `src` to `dest`
    ///
    /// # Safety
    /// Both ranges must hold `count` values laid out as `ty`.
    pub unsafe fn copy_value_type(
        &mut self,
        dest: Address,
        src: Address,
        count: usize,
        ty: TypeId,
    ) -> GcResult<()> {
        let (size, refs) = self.value_type_layout(ty)?;
        // SAFETY: forwarded to the caller
        unsafe { std::ptr::copy(src.as_mut_ptr::<u8>(), dest.as_mut_ptr::<u8>(), count * size) };
        if count == 0 || self.is_young(dest) || refs.is_pointer_free() {
            return Ok(());
        }
        let heap = &*self.heap.inner;
        let nursery = heap.nursery_range;
        let mut young_slots = Vec::new();
        for i in 0..count {
            refs.for_each_reference(dest.offset(i * size), self.types().complex(), &mut |slot| {
                // SAFETY: the value was just written
                if nursery.contains(unsafe { slot.load_address() }) {
                    young_slots.push(slot);
                }
            });
        }
        if young_slots.is_empty() {
            return Ok(());
        }
        match heap.config.barrier {
            BarrierKind::Remset => heap.remember(
                &mut self.local.ssb,
                dest,
                RemsetEntry::ValueType { dest, count, ty },
            ),
            BarrierKind::CardTable => young_slots.into_iter().for_each(|slot| heap.mark_card(slot)),
        }
        Ok(())
    }

    /// Record the references of an object whose contents were just copied
    /// from another object
    ///
    /// # Safety
    /// `obj` must be a complete, live object.
    pub unsafe fn object_cloned(&mut self, obj: Address) -> GcResult<()> {
        if self.is_young(obj) {
            return Ok(());
        }
        // SAFETY: forwarded to the caller
        let ty = unsafe { ObjectRef::new(obj).type_id() };
        self.ensure_type(ty)?;
        let heap = &*self.heap.inner;
        let nursery = heap.nursery_range;
        let mut young_slots = Vec::new();
        // SAFETY: forwarded to the caller
        unsafe {
            for_each_slot(self.types(), obj, &mut |slot| {
                if nursery.contains(slot.load_address()) {
                    young_slots.push(slot);
                }
            });
        }
        if young_slots.is_empty() {
            return Ok(());
        }
        match heap.config.barrier {
            BarrierKind::Remset => {
                heap.remember(&mut self.local.ssb, obj, RemsetEntry::Object(obj))
            }
            BarrierKind::CardTable => young_slots.into_iter().for_each(|slot| heap.mark_card(slot)),
        }
        Ok(())
    }

    /// Entries waiting in this thread's store buffer
    pub fn buffered_remset_entries(&self) -> usize {
        self.local.ssb.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::descriptor::Descriptor;
    use crate::heap::{GcHeap, StackBounds};
    use crate::types::TypeInfo;

    fn setup(barrier: BarrierKind) -> (GcHeap, TypeId, TypeId) {
        let heap = GcHeap::new(GcConfig {
            barrier,
            nursery_size: 256 * 1024,
            ..GcConfig::default()
        })
        .unwrap();
        let cell = heap
            .register_type(TypeInfo::fixed("Cell", 1, Descriptor::all_refs(1)))
            .unwrap();
        let big = heap
            .register_type(TypeInfo::vector("Refs", 8, crate::types::ElementRefs::AllRefs))
            .unwrap();
        (heap, cell, big)
    }

    #[test]
    fn test_fast_path_elides_young_and_null_stores() {
        let (heap, cell, _) = setup(BarrierKind::Remset);
        let mut mutator = heap.attach(StackBounds::EMPTY);
        let a = mutator.alloc(cell).unwrap();
        let b = mutator.alloc(cell).unwrap();
        let mut host = 0usize;
        unsafe {
            mutator.store_field(a, a.word(1), b);
            mutator.store_field(a, a.word(1), Address::NULL);
            mutator.generic_store(Address::from_ptr(&mut host), b);
        }
        assert_eq!(mutator.buffered_remset_entries(), 0);
        assert_eq!(host, b.as_usize());
    }

    #[test]
    fn test_old_slot_is_recorded() {
        let (heap, cell, big) = setup(BarrierKind::Remset);
        let mut mutator = heap.attach(StackBounds::EMPTY);
        // large vectors live outside the nursery
        let old = mutator.alloc_vector(big, 10_000).unwrap();
        assert!(heap.in_large_object_space(old));
        let young = mutator.alloc(cell).unwrap();
        unsafe {
            mutator.store_array_element(old, old.word(2), young);
            mutator.store_array_element(old, old.word(2), young);
            mutator.copy_references(old.word(10), old.word(2), 4);
        }
        // repeated store collapses into one entry
        assert_eq!(mutator.buffered_remset_entries(), 2);
    }

    #[test]
    fn test_card_mode_dirties_large_object() {
        let (heap, cell, big) = setup(BarrierKind::CardTable);
        let mut mutator = heap.attach(StackBounds::EMPTY);
        let old = mutator.alloc_vector(big, 10_000).unwrap();
        let young = mutator.alloc(cell).unwrap();
        unsafe { mutator.store_array_element(old, old.word(5), young) };
        assert_eq!(mutator.buffered_remset_entries(), 0);
        assert_eq!(heap.inner.los.take_dirty(), vec![old]);
    }

    #[test]
    fn test_value_type_copy_requires_value_type() {
        let (heap, cell, _) = setup(BarrierKind::Remset);
        let mut mutator = heap.attach(StackBounds::EMPTY);
        let mut src = [0usize; 2];
        let mut dest = [0usize; 2];
        let result = unsafe {
            mutator.copy_value_type(
                Address::from_ptr(dest.as_mut_ptr()),
                Address::from_ptr(src.as_mut_ptr()),
                1,
                cell,
            )
        };
        assert!(result.is_err());
    }
}
